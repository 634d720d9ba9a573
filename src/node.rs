//! One server process: wires log, tracker, queue and runner together.
//!
//! Startup order matters. The log is replayed completely before the queue
//! accepts submissions, so a node never serves a request against metadata
//! that is behind the log it already holds.

use crate::command_log::CommandLog;
use crate::config::CommandConfig;
use crate::core::{CommandError, CommandId, CommandStatus, LogPosition, QueuedCommand, Result};
use crate::executor::{CommandIdAssigner, StatementExecutor, TopicClient};
use crate::queue::CommandQueue;
use crate::runner::{
    CommandRunner, ReplayOutcome, RunnerControl, RunnerHandle, RunnerState,
    terminate_cluster_statement,
};
use crate::status::CommandStatusTracker;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, watch};
use tracing::{Instrument, Level, event, info_span};
use uuid::Uuid;

pub struct CommandNodeBuilder {
    config: CommandConfig,
    log: Option<Arc<dyn CommandLog>>,
    executor: Option<Box<dyn StatementExecutor>>,
    topics: Option<Arc<dyn TopicClient>>,
}

impl CommandNodeBuilder {
    pub fn log(mut self, log: Arc<dyn CommandLog>) -> Self {
        self.log = Some(log);
        self
    }

    pub fn executor(mut self, executor: Box<dyn StatementExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Needed to provision the processing-log topic.
    pub fn topic_client(mut self, topics: Arc<dyn TopicClient>) -> Self {
        self.topics = Some(topics);
        self
    }

    pub async fn start(self) -> Result<CommandNode> {
        let node_id = Uuid::new_v4();
        let span = info_span!(
            "node.start",
            service_id = %self.config.service_id,
            node_id = %node_id
        );
        self.start_inner(node_id).instrument(span).await
    }

    async fn start_inner(self, node_id: Uuid) -> Result<CommandNode> {
        let CommandNodeBuilder {
            config,
            log,
            executor,
            topics,
        } = self;
        config.validate()?;
        let log = log.ok_or_else(|| CommandError::ConfigError("no command log".to_string()))?;
        let executor = executor
            .ok_or_else(|| CommandError::ConfigError("no statement executor".to_string()))?;

        let tracker = Arc::new(CommandStatusTracker::new(config.status_cache_capacity));
        let mut runner = CommandRunner::new(
            log.clone(),
            executor,
            tracker.clone(),
            config.retry_policy(),
        )
        .with_poll_timeout(config.poll_timeout_duration());
        let state = runner.subscribe_state();
        let queue = Arc::new(
            CommandQueue::new(log.clone(), tracker.clone(), config.properties.clone())
                .with_runner_state(state.clone()),
        );

        if config.processing_log_auto_create {
            maybe_create_processing_log_stream(&config, &queue, topics.as_deref()).await?;
        }

        let replay = runner.process_prior_commands().await?;
        let runner = match &replay {
            ReplayOutcome::Completed { replayed } => {
                queue.mark_ready();
                event!(Level::INFO, replayed = *replayed, "node ready");
                let handle = runner.spawn();
                close_when_stopped(state.clone(), queue.clone(), tracker.clone());
                Some(handle)
            }
            ReplayOutcome::Terminated { error } => {
                match error {
                    Some(error) => event!(
                        Level::ERROR,
                        error = %error,
                        "cluster was terminated but cleanup failed; node will not serve commands"
                    ),
                    None => event!(
                        Level::WARN,
                        "cluster was terminated; node will not serve commands"
                    ),
                }
                tracker.close()?;
                None
            }
            ReplayOutcome::Interrupted => None,
        };
        let control = runner.as_ref().map(RunnerHandle::control);

        Ok(CommandNode {
            node_id,
            config,
            log,
            tracker,
            queue,
            runner: Mutex::new(runner),
            control,
            state,
            replay,
        })
    }
}

/// Stops taking submissions once the runner exits, for whatever reason, and
/// ends outstanding waits with `RunnerStopped`.
fn close_when_stopped(
    mut state: watch::Receiver<RunnerState>,
    queue: Arc<CommandQueue>,
    tracker: Arc<CommandStatusTracker>,
) {
    tokio::spawn(async move {
        // A dropped sender means the runner is gone as well.
        let _ = state.wait_for(|state| *state == RunnerState::Stopped).await;
        queue.mark_not_ready();
        if let Err(err) = tracker.close() {
            event!(Level::WARN, error = %err, "failed to release status waiters");
        }
    });
}

/// Enqueues the processing-log stream on a brand new cluster.
///
/// Failure to provision the topic only skips the stream.
async fn maybe_create_processing_log_stream(
    config: &CommandConfig,
    queue: &CommandQueue,
    topics: Option<&dyn TopicClient>,
) -> Result<()> {
    if !queue.is_empty().await? {
        return Ok(());
    }
    let Some(topics) = topics else {
        event!(
            Level::WARN,
            "no topic client; skipping processing log stream creation"
        );
        return Ok(());
    };

    let topic = config.processing_log_topic();
    let provisioned = match topics.topic_exists(&topic).await {
        Ok(true) => Ok(()),
        Ok(false) => topics.create_topic(&topic).await,
        Err(err) => Err(err),
    };
    if let Err(err) = provisioned {
        event!(
            Level::WARN,
            topic = %topic,
            error = %err,
            "failed to create processing log topic"
        );
        return Ok(());
    }

    queue
        .enqueue(&config.processing_log_stream_statement(), BTreeMap::new())
        .await?;
    Ok(())
}

pub struct CommandNode {
    node_id: Uuid,
    config: CommandConfig,
    log: Arc<dyn CommandLog>,
    tracker: Arc<CommandStatusTracker>,
    queue: Arc<CommandQueue>,
    runner: Mutex<Option<RunnerHandle>>,
    control: Option<RunnerControl>,
    state: watch::Receiver<RunnerState>,
    replay: ReplayOutcome,
}

impl CommandNode {
    pub fn builder(config: CommandConfig) -> CommandNodeBuilder {
        CommandNodeBuilder {
            config,
            log: None,
            executor: None,
            topics: None,
        }
    }

    pub async fn start(
        config: CommandConfig,
        log: Arc<dyn CommandLog>,
        executor: Box<dyn StatementExecutor>,
    ) -> Result<Self> {
        Self::builder(config).log(log).executor(executor).start().await
    }

    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    pub fn config(&self) -> &CommandConfig {
        &self.config
    }

    pub fn queue(&self) -> Arc<CommandQueue> {
        self.queue.clone()
    }

    pub fn replay_outcome(&self) -> ReplayOutcome {
        self.replay.clone()
    }

    pub fn is_ready(&self) -> bool {
        self.queue.is_ready()
    }

    pub fn state(&self) -> RunnerState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    /// `None` if this node never started a runner.
    pub fn applied_position(&self) -> Option<LogPosition> {
        self.control.as_ref().map(RunnerControl::applied_position)
    }

    pub async fn submit(
        &self,
        statement_text: &str,
        config_overrides: BTreeMap<String, String>,
    ) -> Result<QueuedCommand> {
        self.queue.submit(statement_text, config_overrides).await
    }

    pub async fn submit_and_wait(
        &self,
        statement_text: &str,
        config_overrides: BTreeMap<String, String>,
        timeout: Duration,
    ) -> Result<CommandStatus> {
        self.queue
            .submit_and_wait(statement_text, config_overrides, timeout)
            .await
    }

    /// `submit_and_wait` with the configured response timeout.
    pub async fn execute(&self, statement_text: &str) -> Result<CommandStatus> {
        self.submit_and_wait(
            statement_text,
            BTreeMap::new(),
            self.config.command_response_timeout_duration(),
        )
        .await
    }

    pub fn status(&self, id: &CommandId) -> Result<Option<CommandStatus>> {
        self.tracker.status(id)
    }

    pub fn statuses(&self) -> Result<BTreeMap<CommandId, CommandStatus>> {
        self.tracker.statuses()
    }

    /// Terminates the whole cluster, releasing the topics this node manages,
    /// and waits for the local runner to stop.
    pub async fn shutdown(&self) -> Result<Option<CommandStatus>> {
        let mut managed = vec![self.config.command_topic()];
        if self.config.processing_log_auto_create {
            managed.push(self.config.processing_log_topic());
        }
        self.terminate(&terminate_cluster_statement(&managed)).await
    }

    /// Submits a cluster-terminate statement and waits for the runner to stop.
    ///
    /// Returns the terminate command's status, or `None` if the runner was
    /// already stopped or was closed before it reached the command.
    pub async fn terminate(&self, statement_text: &str) -> Result<Option<CommandStatus>> {
        if !CommandIdAssigner::command_id_for_text(statement_text)?.is_cluster_terminate() {
            return Err(CommandError::ParseError(format!(
                "not a cluster termination: '{}'",
                statement_text
            )));
        }

        // Waiting happens outside the lock so `close` can still interrupt it.
        let Some(mut handle) = self.runner.lock().await.take() else {
            return Ok(None);
        };

        let submitted = match self.queue.submit(statement_text, BTreeMap::new()).await {
            Ok(queued) => self
                .tracker
                .register(&queued.id, queued.sequence_number),
            Err(err) => Err(err),
        };
        let pending = match submitted {
            Ok(pending) => pending,
            Err(err) => {
                *self.runner.lock().await = Some(handle);
                return Err(err);
            }
        };
        handle.wait_until_stopped().await?;
        // The runner published before stopping, so this resolves at once.
        let status = self
            .tracker
            .await_result(pending, Duration::ZERO)
            .await
            .ok();

        self.stop_serving().await?;
        event!(Level::INFO, node_id = %self.node_id, "node shut down after cluster termination");
        Ok(status)
    }

    /// Stops this node without terminating the cluster.
    ///
    /// Returns the runner's own error if it had already failed.
    pub async fn close(&self) -> Result<()> {
        self.queue.mark_not_ready();
        let handle = self.runner.lock().await.take();
        let stopped = match handle {
            Some(handle) => handle.close().await,
            None => {
                // A pending `terminate` may hold the handle; it sees the stop.
                if let Some(control) = &self.control {
                    control.stop();
                }
                Ok(())
            }
        };
        self.stop_serving().await?;
        event!(Level::INFO, node_id = %self.node_id, "node closed");
        stopped
    }

    async fn stop_serving(&self) -> Result<()> {
        self.queue.mark_not_ready();
        self.tracker.close()?;
        self.log.close().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_log::InMemoryCommandTape;
    use crate::core::CommandStatusKind;
    use crate::executor::{InMemoryTopicClient, MetaStoreExecutor};

    fn config() -> CommandConfig {
        CommandConfig::new("test_")
            .poll_timeout(Duration::from_millis(20))
            .command_response_timeout(Duration::from_secs(5))
    }

    fn executor(topics: &InMemoryTopicClient) -> Box<dyn StatementExecutor> {
        Box::new(
            MetaStoreExecutor::new(Arc::new(topics.clone()))
                .with_command_topic(config().command_topic()),
        )
    }

    #[tokio::test]
    async fn processing_log_stream_is_created_on_empty_log_only() {
        let tape = InMemoryCommandTape::new();
        let topics = InMemoryTopicClient::new();
        let node = CommandNode::builder(config().processing_log_auto_create(true))
            .log(Arc::new(tape.client()))
            .executor(executor(&topics))
            .topic_client(Arc::new(topics.clone()))
            .start()
            .await
            .unwrap();

        assert!(topics.topics().contains("test_ksql_processing_log"));
        let id: CommandId = "stream/KSQL_PROCESSING_LOG/create".parse().unwrap();
        assert_eq!(
            node.status(&id).unwrap().unwrap().status,
            CommandStatusKind::Success
        );
        node.close().await.unwrap();

        let again = CommandNode::builder(config().processing_log_auto_create(true))
            .log(Arc::new(tape.client()))
            .executor(executor(&topics))
            .topic_client(Arc::new(topics.clone()))
            .start()
            .await
            .unwrap();
        assert_eq!(tape.len(), 1);
        again.close().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_stops_the_runner_and_releases_topics() {
        let tape = InMemoryCommandTape::new();
        let topics = InMemoryTopicClient::with_topics([config().command_topic(), "src".to_string()]);
        let node = CommandNode::start(config(), Arc::new(tape.client()), executor(&topics))
            .await
            .unwrap();
        assert!(node.is_ready());

        let status = node
            .execute("CREATE STREAM SRC (X INT) WITH (KAFKA_TOPIC='src');")
            .await
            .unwrap();
        assert_eq!(status.status, CommandStatusKind::Success);

        let status = node.shutdown().await.unwrap().unwrap();
        assert_eq!(status.status, CommandStatusKind::Success);
        assert_eq!(node.state(), RunnerState::Stopped);
        assert!(!node.is_ready());
        assert!(!topics.topics().contains(&config().command_topic()));
        assert!(node.shutdown().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn terminate_rejects_other_statements() {
        let tape = InMemoryCommandTape::new();
        let topics = InMemoryTopicClient::new();
        let node = CommandNode::start(config(), Arc::new(tape.client()), executor(&topics))
            .await
            .unwrap();
        assert!(node.terminate("DROP STREAM A;").await.is_err());
        node.close().await.unwrap();
        assert_eq!(node.state(), RunnerState::Stopped);
    }
}
