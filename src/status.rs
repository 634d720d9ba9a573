//! Per-node table of outstanding commands and their statuses.
//!
//! Turns the asynchronous log into a submit-and-wait API: a submitter
//! registers `(CommandId, offset)` once its append is durable and waits for
//! the local runner to publish a terminal status for that exact offset.

use crate::core::{CommandError, CommandId, CommandStatus, CommandStatusKind, Result};
use lru::LruCache;
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::timeout;

type StatusKey = (CommandId, u64);

struct Waiter {
    waiter_id: u64,
    sender: oneshot::Sender<CommandStatus>,
}

struct TrackerInner {
    waiters: HashMap<StatusKey, Vec<Waiter>>,
    /// Terminal statuses of recently applied offsets, for late registrations.
    completed: LruCache<StatusKey, CommandStatus>,
    /// Last known status per id, whichever offset it came from.
    latest: HashMap<CommandId, (u64, CommandStatus)>,
    next_waiter_id: u64,
}

/// A registered wait on one `(CommandId, offset)`.
pub struct StatusHandle {
    id: CommandId,
    sequence_number: u64,
    waiter_id: u64,
    receiver: oneshot::Receiver<CommandStatus>,
}

impl StatusHandle {
    pub fn id(&self) -> &CommandId {
        &self.id
    }

    pub fn sequence_number(&self) -> u64 {
        self.sequence_number
    }
}

pub struct CommandStatusTracker {
    inner: Mutex<TrackerInner>,
}

impl CommandStatusTracker {
    pub fn new(completed_capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(completed_capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(TrackerInner {
                waiters: HashMap::new(),
                completed: LruCache::new(capacity),
                latest: HashMap::new(),
                next_waiter_id: 1,
            }),
        }
    }

    /// Registers interest in the terminal status of `id` at `sequence_number`.
    ///
    /// If the runner already finished that offset the handle resolves at once.
    pub fn register(&self, id: &CommandId, sequence_number: u64) -> Result<StatusHandle> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = self.inner.lock()?;
        let waiter_id = inner.next_waiter_id;
        inner.next_waiter_id = inner.next_waiter_id.wrapping_add(1);

        let key = (id.clone(), sequence_number);
        if let Some(done) = inner.completed.get(&key).cloned() {
            let _ = sender.send(done);
        } else {
            inner
                .waiters
                .entry(key)
                .or_default()
                .push(Waiter { waiter_id, sender });
        }

        Ok(StatusHandle {
            id: id.clone(),
            sequence_number,
            waiter_id,
            receiver,
        })
    }

    /// Records a status; a terminal one resolves every waiter on that offset.
    ///
    /// Publishing with nobody waiting is fine, e.g. when another node took
    /// the request.
    pub fn publish(&self, id: &CommandId, sequence_number: u64, status: CommandStatus) -> Result<()> {
        let mut inner = self.inner.lock()?;

        let newer = inner
            .latest
            .get(id)
            .map(|(seq, existing)| {
                // The submitter's QUEUED can land after the runner already moved on.
                sequence_number > *seq
                    || (sequence_number == *seq
                        && !existing.is_terminal()
                        && progress(status.status) >= progress(existing.status))
            })
            .unwrap_or(true);
        if newer {
            inner
                .latest
                .insert(id.clone(), (sequence_number, status.clone()));
        }

        if !status.is_terminal() {
            return Ok(());
        }

        let key = (id.clone(), sequence_number);
        inner.completed.put(key.clone(), status.clone());
        if let Some(waiters) = inner.waiters.remove(&key) {
            for waiter in waiters {
                let _ = waiter.sender.send(status.clone());
            }
        }
        Ok(())
    }

    pub fn mark_queued(&self, id: &CommandId, sequence_number: u64) -> Result<()> {
        self.publish(id, sequence_number, CommandStatus::queued())
    }

    /// Waits for the handle's terminal status.
    ///
    /// On timeout the waiter is evicted and `StatusTimeout` is returned; the
    /// command may still be applied later.
    pub async fn await_result(&self, handle: StatusHandle, wait: Duration) -> Result<CommandStatus> {
        let StatusHandle {
            id,
            sequence_number,
            waiter_id,
            receiver,
        } = handle;

        match timeout(wait, receiver).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(CommandError::RunnerStopped(format!(
                "stopped before reporting a status for '{}' at offset {}",
                id, sequence_number
            ))),
            Err(_) => {
                self.evict(&id, sequence_number, waiter_id)?;
                Err(CommandError::StatusTimeout {
                    id: id.to_string(),
                    sequence_number,
                })
            }
        }
    }

    fn evict(&self, id: &CommandId, sequence_number: u64, waiter_id: u64) -> Result<()> {
        let mut inner = self.inner.lock()?;
        let key = (id.clone(), sequence_number);
        let now_empty = match inner.waiters.get_mut(&key) {
            Some(waiters) => {
                waiters.retain(|w| w.waiter_id != waiter_id);
                waiters.is_empty()
            }
            None => false,
        };
        if now_empty {
            inner.waiters.remove(&key);
        }
        Ok(())
    }

    /// Last known status for `id`, from whichever offset reported last.
    pub fn status(&self, id: &CommandId) -> Result<Option<CommandStatus>> {
        let inner = self.inner.lock()?;
        Ok(inner.latest.get(id).map(|(_, status)| status.clone()))
    }

    pub fn statuses(&self) -> Result<BTreeMap<CommandId, CommandStatus>> {
        let inner = self.inner.lock()?;
        Ok(inner
            .latest
            .iter()
            .map(|(id, (_, status))| (id.clone(), status.clone()))
            .collect())
    }

    pub fn pending_waiters(&self) -> usize {
        self.inner
            .lock()
            .map(|inner| inner.waiters.values().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Drops every outstanding waiter; their waits end with `RunnerStopped`.
    pub fn close(&self) -> Result<()> {
        let mut inner = self.inner.lock()?;
        inner.waiters.clear();
        Ok(())
    }
}

fn progress(kind: CommandStatusKind) -> u8 {
    match kind {
        CommandStatusKind::Queued => 0,
        CommandStatusKind::Executing => 1,
        CommandStatusKind::Success | CommandStatusKind::Error => 2,
    }
}

impl Default for CommandStatusTracker {
    fn default() -> Self {
        Self::new(1_024)
    }
}
