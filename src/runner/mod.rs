//! The single consumer of the command log on a node.
//!
//! A runner replays the whole log at startup, then applies new records in
//! offset order, one at a time. It owns the executor outright; everyone
//! else learns about progress through the status tracker, the state
//! channel and the executor's snapshots.

use crate::command_log::CommandLog;
use crate::core::{
    ApplyMode, ClassifiedError, Command, CommandError, CommandStatus, EffectSummary, FailureKind,
    LogPosition, Result,
};
use crate::executor::StatementExecutor;
use crate::status::CommandStatusTracker;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, Level, event, info_span};

pub mod retry;
pub mod terminator;

pub use retry::{RetryDecision, RetryPolicy};
pub use terminator::{
    CleanupReport, ResourceCleaner, find_cluster_terminate, terminate_cluster_statement,
};

pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Starting,
    Running,
    /// Infrastructure is down; the current command is retried until it is back.
    Degraded,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunnerState::Starting => "STARTING",
            RunnerState::Running => "RUNNING",
            RunnerState::Degraded => "DEGRADED",
            RunnerState::Stopped => "STOPPED",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayOutcome {
    Completed { replayed: usize },
    /// The log holds a cluster-terminate record; only that was applied.
    /// `error` is set when applying it failed, e.g. cleanup was refused.
    Terminated { error: Option<String> },
    /// Shutdown arrived mid-replay.
    Interrupted,
}

enum ApplyOutcome {
    Applied(EffectSummary),
    Failed(ClassifiedError),
    /// Shutdown during a backoff; the command was not advanced past.
    Interrupted,
}

pub struct CommandRunner {
    log: Arc<dyn CommandLog>,
    executor: Box<dyn StatementExecutor>,
    tracker: Arc<CommandStatusTracker>,
    policy: RetryPolicy,
    poll_timeout: Duration,
    /// Records read past the replay end while fetching the backlog.
    pending: VecDeque<Command>,
    /// Next offset to apply.
    applied: Arc<AtomicU64>,
    state: watch::Sender<RunnerState>,
    shutdown: Arc<watch::Sender<bool>>,
    terminated: bool,
}

impl CommandRunner {
    pub fn new(
        log: Arc<dyn CommandLog>,
        executor: Box<dyn StatementExecutor>,
        tracker: Arc<CommandStatusTracker>,
        policy: RetryPolicy,
    ) -> Self {
        let (state, _) = watch::channel(RunnerState::Starting);
        let (shutdown, _) = watch::channel(false);
        Self {
            log,
            executor,
            tracker,
            policy,
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            pending: VecDeque::new(),
            applied: Arc::new(AtomicU64::new(0)),
            state,
            shutdown: Arc::new(shutdown),
            terminated: false,
        }
    }

    pub fn with_poll_timeout(mut self, poll_timeout: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn applied_position(&self) -> LogPosition {
        LogPosition(self.applied.load(Ordering::SeqCst))
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Replays every record up to the log end captured at the start.
    ///
    /// Nothing else should be served until this returns.
    pub async fn process_prior_commands(&mut self) -> Result<ReplayOutcome> {
        self.set_state(RunnerState::Starting);
        self.log.seek_to_beginning().await?;
        let end = self.log.current_end_position().await?;
        let shutdown = self.shutdown.subscribe();

        let mut backlog = Vec::new();
        while self.log.position() < end {
            let stop = *shutdown.borrow();
            if stop {
                return Ok(ReplayOutcome::Interrupted);
            }
            for command in self.log.poll(self.poll_timeout).await? {
                if command.position() < end {
                    backlog.push(command);
                } else {
                    self.pending.push_back(command);
                }
            }
        }
        event!(
            Level::INFO,
            commands = backlog.len(),
            end = %end,
            "replaying command log"
        );

        if let Some(terminate) = find_cluster_terminate(&backlog).cloned() {
            event!(
                Level::INFO,
                seq = terminate.sequence_number,
                skipped = backlog.len() - 1,
                "command log holds a cluster termination; skipping replay"
            );
            self.pending.clear();
            let error = match self.try_apply(&terminate, ApplyMode::Replay).await {
                ApplyOutcome::Interrupted => return Ok(ReplayOutcome::Interrupted),
                ApplyOutcome::Applied(_) => None,
                ApplyOutcome::Failed(err) => {
                    event!(
                        Level::ERROR,
                        seq = terminate.sequence_number,
                        error = %err.message,
                        "replayed cluster termination failed; staying stopped"
                    );
                    Some(err.message)
                }
            };
            self.applied.store(end.offset(), Ordering::SeqCst);
            self.terminated = true;
            self.set_state(RunnerState::Stopped);
            return Ok(ReplayOutcome::Terminated { error });
        }

        let mut replayed = 0usize;
        for command in backlog {
            if let ApplyOutcome::Interrupted = self.try_apply(&command, ApplyMode::Replay).await {
                return Ok(ReplayOutcome::Interrupted);
            }
            replayed += 1;
        }

        self.executor
            .finish_replay()
            .await
            .map_err(CommandError::from)?;
        event!(Level::INFO, replayed, "command log replay complete");
        Ok(ReplayOutcome::Completed { replayed })
    }

    /// Applies new records until closed, terminated or the log fails.
    pub async fn run(mut self) -> Result<()> {
        if self.terminated {
            self.set_state(RunnerState::Stopped);
            return Ok(());
        }

        self.set_state(RunnerState::Running);
        event!(
            Level::INFO,
            position = %self.applied_position(),
            "command runner started"
        );

        let result = self.steady_state().await;
        if let Err(err) = &result {
            event!(Level::ERROR, error = %err, "command runner failed");
        }
        self.set_state(RunnerState::Stopped);
        event!(
            Level::INFO,
            position = %self.applied_position(),
            "command runner stopped"
        );
        result
    }

    pub fn spawn(self) -> RunnerHandle {
        let state = self.state.subscribe();
        let applied = self.applied.clone();
        let shutdown = self.shutdown.clone();
        let join_handle = tokio::spawn(self.run());
        RunnerHandle {
            state,
            applied,
            shutdown,
            join_handle: Some(join_handle),
        }
    }

    async fn steady_state(&mut self) -> Result<()> {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let stop = *shutdown.borrow();
            if stop {
                return Ok(());
            }

            let batch: Vec<Command> = if self.pending.is_empty() {
                tokio::select! {
                    polled = self.log.poll(self.poll_timeout) => polled?,
                    _ = shutdown.wait_for(|stop| *stop) => return Ok(()),
                }
            } else {
                self.pending.drain(..).collect()
            };

            for command in batch {
                if command.position() < self.applied_position() {
                    continue;
                }
                match self.try_apply(&command, ApplyMode::Live).await {
                    ApplyOutcome::Interrupted => return Ok(()),
                    ApplyOutcome::Applied(summary) if summary.shutdown_requested => {
                        event!(
                            Level::INFO,
                            seq = command.sequence_number,
                            "cluster terminated; stopping command runner"
                        );
                        self.terminated = true;
                        return Ok(());
                    }
                    ApplyOutcome::Applied(_) | ApplyOutcome::Failed(_) => {}
                }
            }
        }
    }

    async fn try_apply(&mut self, command: &Command, mode: ApplyMode) -> ApplyOutcome {
        let span = info_span!(
            "command.apply",
            command_id = %command.id,
            seq = command.sequence_number,
            mode = ?mode
        );
        self.apply_with_retries(command, mode).instrument(span).await
    }

    async fn apply_with_retries(&mut self, command: &Command, mode: ApplyMode) -> ApplyOutcome {
        let resume_state = match mode {
            ApplyMode::Replay => RunnerState::Starting,
            ApplyMode::Live => RunnerState::Running,
        };
        self.publish(command, CommandStatus::executing());

        let mut transient_failures = 0u32;
        let mut infrastructure_failures = 0u32;
        loop {
            let err = match self.executor.apply(command, mode).await {
                Ok(summary) => {
                    self.set_state(resume_state);
                    event!(
                        Level::DEBUG,
                        replayed = summary.replayed,
                        query_id = summary.query_id.as_deref().unwrap_or(""),
                        "command applied"
                    );
                    self.publish(command, CommandStatus::success(summary.message.clone()));
                    self.advance(command);
                    return ApplyOutcome::Applied(summary);
                }
                Err(err) => err,
            };

            let attempt = match err.kind {
                FailureKind::Transient => {
                    transient_failures += 1;
                    transient_failures
                }
                FailureKind::Infrastructure => {
                    infrastructure_failures += 1;
                    infrastructure_failures
                }
                FailureKind::Fatal => 1,
            };

            match self.policy.decide(err.kind, attempt) {
                RetryDecision::RetryAfter(delay) => {
                    event!(
                        Level::WARN,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err.message,
                        "transient failure applying command; retrying"
                    );
                    if interruptible_sleep(self.shutdown.subscribe(), delay).await {
                        return ApplyOutcome::Interrupted;
                    }
                }
                RetryDecision::PauseAfter(delay) => {
                    if self.state() != RunnerState::Degraded {
                        event!(Level::WARN, error = %err.message, "command runner degraded");
                    }
                    self.set_state(RunnerState::Degraded);
                    if interruptible_sleep(self.shutdown.subscribe(), delay).await {
                        return ApplyOutcome::Interrupted;
                    }
                }
                RetryDecision::Terminal => {
                    self.set_state(resume_state);
                    let message = if transient_failures > 0 {
                        format!(
                            "{} (gave up after {} attempts)",
                            err.message, transient_failures
                        )
                    } else {
                        err.message.clone()
                    };
                    event!(Level::ERROR, error = %message, "command failed");
                    self.publish(command, CommandStatus::error(message));
                    self.advance(command);
                    return ApplyOutcome::Failed(err);
                }
            }
        }
    }

    fn advance(&self, command: &Command) {
        self.applied
            .fetch_max(command.position().next().offset(), Ordering::SeqCst);
    }

    fn publish(&self, command: &Command, status: CommandStatus) {
        if let Err(err) = self
            .tracker
            .publish(&command.id, command.sequence_number, status)
        {
            event!(Level::WARN, error = %err, "failed to publish command status");
        }
    }

    fn set_state(&self, next: RunnerState) {
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            event!(Level::DEBUG, from = %current, to = %next, "command runner state");
            *current = next;
            true
        });
    }
}

/// Returns true when shutdown cut the sleep short.
async fn interruptible_sleep(mut shutdown: watch::Receiver<bool>, delay: Duration) -> bool {
    let stop = *shutdown.borrow();
    if stop {
        return true;
    }
    tokio::select! {
        _ = sleep(delay) => false,
        _ = shutdown.wait_for(|stop| *stop) => true,
    }
}

/// Handle on a spawned runner task.
pub struct RunnerHandle {
    state: watch::Receiver<RunnerState>,
    applied: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
    join_handle: Option<JoinHandle<Result<()>>>,
}

impl RunnerHandle {
    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    pub fn applied_position(&self) -> LogPosition {
        LogPosition(self.applied.load(Ordering::SeqCst))
    }

    pub fn control(&self) -> RunnerControl {
        RunnerControl {
            applied: self.applied.clone(),
            shutdown: self.shutdown.clone(),
        }
    }

    /// Waits for the runner to stop on its own, e.g. after a cluster termination.
    pub async fn wait_until_stopped(&mut self) -> Result<()> {
        let mut state = self.state.clone();
        // An error means the task is gone, which also counts as stopped.
        let _ = state
            .wait_for(|state| *state == RunnerState::Stopped)
            .await;
        self.join().await
    }

    /// Stops the loop without terminating anything. The command in flight,
    /// if any, is replayed on next start.
    pub async fn close(mut self) -> Result<()> {
        self.shutdown.send_replace(true);
        self.join().await
    }

    async fn join(&mut self) -> Result<()> {
        match self.join_handle.take() {
            Some(join_handle) => join_handle.await.map_err(|err| {
                CommandError::RunnerStopped(format!("command runner join: {}", err))
            })?,
            None => Ok(()),
        }
    }
}

/// Reads progress and requests a stop without owning the runner task.
#[derive(Clone)]
pub struct RunnerControl {
    applied: Arc<AtomicU64>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl RunnerControl {
    pub fn applied_position(&self) -> LogPosition {
        LogPosition(self.applied.load(Ordering::SeqCst))
    }

    /// Signals shutdown and returns at once; whoever holds the handle sees
    /// the runner stop.
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }
}

impl Drop for RunnerHandle {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
        if let Some(join_handle) = self.join_handle.take() {
            join_handle.abort();
        }
    }
}
