use super::{CommandLog, decode_record, encode_record};
use crate::core::{Command, CommandError, CommandId, CommandPayload, LogPosition, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, timeout_at};

struct TapeInner {
    records: Mutex<Vec<String>>,
    appended: Notify,
    available: AtomicBool,
}

/// A single shared, in-process partition.
///
/// Stands in for the external broker: every node gets its own client via
/// [`InMemoryCommandTape::client`] and all of them observe one append order.
#[derive(Clone)]
pub struct InMemoryCommandTape {
    inner: Arc<TapeInner>,
}

impl Default for InMemoryCommandTape {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryCommandTape {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TapeInner {
                records: Mutex::new(Vec::new()),
                appended: Notify::new(),
                available: AtomicBool::new(true),
            }),
        }
    }

    pub fn client(&self) -> InMemoryCommandLog {
        InMemoryCommandLog {
            tape: self.inner.clone(),
            cursor: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            poll_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Simulates the broker becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
        if available {
            self.inner.appended.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct InMemoryCommandLog {
    tape: Arc<TapeInner>,
    cursor: AtomicU64,
    closed: AtomicBool,
    poll_lock: tokio::sync::Mutex<()>,
}

impl InMemoryCommandLog {
    fn ensure_reachable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(CommandError::LogUnavailable(
                "command log client is closed".to_string(),
            ));
        }
        if !self.tape.available.load(Ordering::SeqCst) {
            return Err(CommandError::LogUnavailable(
                "command log partition is not reachable".to_string(),
            ));
        }
        Ok(())
    }

    fn read_from_cursor(&self) -> Result<Vec<Command>> {
        let start = self.cursor.load(Ordering::SeqCst);
        let records = self.tape.records.lock()?;
        let mut batch = Vec::new();
        for (index, line) in records.iter().enumerate().skip(start as usize) {
            batch.push(decode_record(line, index as u64)?);
        }
        drop(records);

        if let Some(last) = batch.last() {
            self.cursor.store(last.sequence_number + 1, Ordering::SeqCst);
        }
        Ok(batch)
    }
}

#[async_trait]
impl CommandLog for InMemoryCommandLog {
    async fn append(&self, id: &CommandId, payload: &CommandPayload) -> Result<LogPosition> {
        self.ensure_reachable()?;
        let line = encode_record(id, payload)?;

        let offset = {
            let mut records = self.tape.records.lock()?;
            records.push(line);
            (records.len() - 1) as u64
        };
        self.tape.appended.notify_waiters();
        Ok(LogPosition(offset))
    }

    async fn poll(&self, timeout: Duration) -> Result<Vec<Command>> {
        let _exclusive = self.poll_lock.lock().await;
        let deadline = Instant::now() + timeout;

        loop {
            // Register interest before reading so an append in between still wakes us.
            let notified = self.tape.appended.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            self.ensure_reachable()?;
            let batch = self.read_from_cursor()?;
            if !batch.is_empty() {
                return Ok(batch);
            }

            if timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn current_end_position(&self) -> Result<LogPosition> {
        self.ensure_reachable()?;
        let records = self.tape.records.lock()?;
        Ok(LogPosition(records.len() as u64))
    }

    async fn seek_to_beginning(&self) -> Result<()> {
        self.ensure_reachable()?;
        let _exclusive = self.poll_lock.lock().await;
        self.cursor.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn position(&self) -> LogPosition {
        LogPosition(self.cursor.load(Ordering::SeqCst))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.tape.appended.notify_waiters();
    }
}
