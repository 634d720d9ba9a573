//! Submission side: turns statements into durable log records.

use crate::command_log::CommandLog;
use crate::core::{
    CommandError, CommandId, CommandPayload, CommandStatus, QueuedCommand, Result,
};
use crate::executor::CommandIdAssigner;
use crate::runner::RunnerState;
use crate::status::CommandStatusTracker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{Level, event};

pub struct CommandQueue {
    log: Arc<dyn CommandLog>,
    tracker: Arc<CommandStatusTracker>,
    original_properties: BTreeMap<String, String>,
    ready: AtomicBool,
    /// State of the local runner; once it stops nothing appended here would be applied.
    runner_state: Option<watch::Receiver<RunnerState>>,
}

impl CommandQueue {
    pub fn new(
        log: Arc<dyn CommandLog>,
        tracker: Arc<CommandStatusTracker>,
        original_properties: BTreeMap<String, String>,
    ) -> Self {
        Self {
            log,
            tracker,
            original_properties,
            ready: AtomicBool::new(false),
            runner_state: None,
        }
    }

    pub fn with_runner_state(mut self, runner_state: watch::Receiver<RunnerState>) -> Self {
        self.runner_state = Some(runner_state);
        self
    }

    /// Opens the queue to submitters. Called once startup replay is done.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    /// Closes the queue to submitters again.
    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst) && !self.runner_stopped()
    }

    fn runner_stopped(&self) -> bool {
        self.runner_state
            .as_ref()
            .map(|state| *state.borrow() == RunnerState::Stopped)
            .unwrap_or(false)
    }

    /// Appends a statement and returns once it is durable.
    ///
    /// The returned offset is what the caller waits on; the statement is not
    /// applied yet.
    pub async fn submit(
        &self,
        statement_text: &str,
        config_overrides: BTreeMap<String, String>,
    ) -> Result<QueuedCommand> {
        if !self.ready.load(Ordering::SeqCst) {
            return Err(CommandError::NotReady(
                "command runner has not finished replaying the command log".to_string(),
            ));
        }
        if self.runner_stopped() {
            self.mark_not_ready();
            return Err(CommandError::RunnerStopped(
                "command runner has stopped; not accepting commands".to_string(),
            ));
        }
        self.enqueue(statement_text, config_overrides).await
    }

    /// Appends without the ready check; used by the node itself during startup.
    pub(crate) async fn enqueue(
        &self,
        statement_text: &str,
        config_overrides: BTreeMap<String, String>,
    ) -> Result<QueuedCommand> {
        let id = CommandIdAssigner::command_id_for_text(statement_text)?;
        let payload = CommandPayload::new(statement_text)
            .with_overrides(config_overrides)
            .with_original_properties(self.original_properties.clone());

        let position = self.log.append(&id, &payload).await?;
        self.tracker.mark_queued(&id, position.offset())?;
        event!(
            Level::INFO,
            command_id = %id,
            seq = position.offset(),
            "command enqueued"
        );
        Ok(QueuedCommand {
            id,
            sequence_number: position.offset(),
        })
    }

    /// Waits for the local runner to finish the command at exactly this offset.
    ///
    /// A timeout means "not known yet", never failure.
    pub async fn wait_for(&self, queued: &QueuedCommand, timeout: Duration) -> Result<CommandStatus> {
        let handle = self.tracker.register(&queued.id, queued.sequence_number)?;
        if !self.runner_stopped() {
            return self.tracker.await_result(handle, timeout).await;
        }
        // Only a status published before the runner stopped can still arrive.
        match self.tracker.await_result(handle, Duration::ZERO).await {
            Err(CommandError::StatusTimeout { id, sequence_number }) => {
                Err(CommandError::RunnerStopped(format!(
                    "stopped before reporting a status for '{}' at offset {}",
                    id, sequence_number
                )))
            }
            other => other,
        }
    }

    pub async fn submit_and_wait(
        &self,
        statement_text: &str,
        config_overrides: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandStatus> {
        let queued = self.submit(statement_text, config_overrides).await?;
        self.wait_for(&queued, timeout).await
    }

    /// True if nothing was ever written to the command log.
    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.log.current_end_position().await?.offset() == 0)
    }

    pub fn status(&self, id: &CommandId) -> Result<Option<CommandStatus>> {
        self.tracker.status(id)
    }

    pub fn statuses(&self) -> Result<BTreeMap<CommandId, CommandStatus>> {
        self.tracker.statuses()
    }
}
