use super::StatementExecutor;
use super::metastore::{
    DataSource, MetaStore, MetaStoreView, PersistentQuery, QueryState, SourceKind,
};
use super::statement::{Statement, parse_statement};
use super::topics::TopicClient;
use crate::command_log::COMMANDS_STREAM_NAME;
use crate::runner::terminator::ResourceCleaner;
use crate::core::{ApplyMode, ClassifiedError, Command, EffectSummary};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{Level, event};

type ApplyResult = std::result::Result<EffectSummary, ClassifiedError>;

/// Reference executor: keeps the metastore of sources and persistent
/// queries, and talks to the broker through a [`TopicClient`].
pub struct MetaStoreExecutor {
    store: MetaStore,
    topics: Arc<dyn TopicClient>,
    cleaner: ResourceCleaner,
    snapshots: watch::Sender<Arc<MetaStore>>,
}

impl MetaStoreExecutor {
    pub fn new(topics: Arc<dyn TopicClient>) -> Self {
        let store = MetaStore::default();
        let (snapshots, _) = watch::channel(Arc::new(store.clone()));
        Self {
            store,
            cleaner: ResourceCleaner::new(topics.clone()),
            topics,
            snapshots,
        }
    }

    /// Registers the command topic's own stream, which never goes through the log.
    pub fn with_command_topic(mut self, topic: impl Into<String>) -> Self {
        let topic = topic.into();
        self.store.sources.insert(
            COMMANDS_STREAM_NAME.to_string(),
            DataSource {
                name: COMMANDS_STREAM_NAME.to_string(),
                kind: SourceKind::Stream,
                topic: topic.clone(),
                statement_text: format!(
                    "CREATE STREAM {} (STATEMENT STRING) WITH(VALUE_FORMAT='JSON', KAFKA_TOPIC='{}');",
                    COMMANDS_STREAM_NAME, topic
                ),
                created_at_offset: None,
            },
        );
        self.store.managed_topics.insert(topic);
        self.publish_snapshot();
        self
    }

    pub fn view(&self) -> MetaStoreView {
        MetaStoreView::new(self.snapshots.subscribe())
    }

    pub fn metastore(&self) -> &MetaStore {
        &self.store
    }

    fn publish_snapshot(&self) {
        self.snapshots.send_replace(Arc::new(self.store.clone()));
    }

    async fn require_topic(&self, topic: &str) -> std::result::Result<(), ClassifiedError> {
        if self.topics.topic_exists(topic).await? {
            Ok(())
        } else {
            // Usually the topic was just created elsewhere and has not propagated yet.
            Err(ClassifiedError::transient(format!(
                "Kafka topic does not exist: {}",
                topic
            )))
        }
    }

    fn require_sources(&self, sources: &[String]) -> std::result::Result<(), ClassifiedError> {
        for source in sources {
            if self.store.source(source).is_none() {
                return Err(ClassifiedError::fatal(format!(
                    "{} does not exist.",
                    source
                )));
            }
        }
        Ok(())
    }

    async fn create_source(
        &mut self,
        command: &Command,
        kind: SourceKind,
        name: String,
        topic: Option<String>,
        if_not_exists: bool,
    ) -> ApplyResult {
        if let Some(existing) = self.store.source(&name) {
            if if_not_exists {
                return Ok(EffectSummary::new(format!(
                    "Cannot add {} '{}': it already exists, skipping",
                    kind.label(),
                    name
                )));
            }
            return Err(ClassifiedError::fatal(format!(
                "Cannot add {} '{}': A {} with the same name already exists",
                kind.label(),
                name,
                existing.kind.label()
            )));
        }

        let topic = topic.unwrap_or_else(|| name.clone());
        self.require_topic(&topic).await?;

        self.store.sources.insert(
            name.clone(),
            DataSource {
                name: name.clone(),
                kind,
                topic,
                statement_text: command.statement_text.clone(),
                created_at_offset: Some(command.sequence_number),
            },
        );

        let label = match kind {
            SourceKind::Stream => "Stream created",
            SourceKind::Table => "Table created",
        };
        Ok(EffectSummary::new(label))
    }

    async fn create_as_select(
        &mut self,
        command: &Command,
        mode: ApplyMode,
        kind: SourceKind,
        name: String,
        sources: Vec<String>,
        if_not_exists: bool,
    ) -> ApplyResult {
        if self.store.source(&name).is_some() {
            if if_not_exists {
                return Ok(EffectSummary::new(format!(
                    "Cannot add {} '{}': it already exists, skipping",
                    kind.label(),
                    name
                )));
            }
            return Err(ClassifiedError::fatal(format!(
                "Cannot add {} '{}': A source with the same name already exists",
                kind.label(),
                name
            )));
        }
        self.require_sources(&sources)?;

        // Sink topics are created by us, so we own them.
        let topic = name.clone();
        self.topics.create_topic(&topic).await?;

        let prefix = match kind {
            SourceKind::Stream => "CSAS",
            SourceKind::Table => "CTAS",
        };
        // Query ids are upper-case, matching how an unquoted TERMINATE names them.
        let query_id = format!(
            "{}_{}_{}",
            prefix,
            name.to_ascii_uppercase(),
            command.sequence_number
        );

        self.store.sources.insert(
            name.clone(),
            DataSource {
                name: name.clone(),
                kind,
                topic: topic.clone(),
                statement_text: command.statement_text.clone(),
                created_at_offset: Some(command.sequence_number),
            },
        );
        self.store.managed_topics.insert(topic);
        self.install_query(command, mode, &query_id, name, sources);

        let label = match kind {
            SourceKind::Stream => "Stream created and running",
            SourceKind::Table => "Table created and running",
        };
        Ok(EffectSummary::new(label).with_query(query_id))
    }

    async fn insert_into(
        &mut self,
        command: &Command,
        mode: ApplyMode,
        target: String,
        sources: Vec<String>,
    ) -> ApplyResult {
        let Some(sink) = self.store.source(&target) else {
            return Err(ClassifiedError::fatal(format!(
                "Sink does not exist for the INSERT INTO statement: {}",
                target
            )));
        };
        if sink.kind != SourceKind::Stream {
            return Err(ClassifiedError::fatal(format!(
                "INSERT INTO can only be used to insert into a stream. {} is a table.",
                target
            )));
        }
        self.require_sources(&sources)?;

        let query_id = format!("INSERTQUERY_{}", command.sequence_number);
        self.install_query(command, mode, &query_id, target, sources);
        Ok(EffectSummary::new("Insert Into query is running.").with_query(query_id))
    }

    fn install_query(
        &mut self,
        command: &Command,
        mode: ApplyMode,
        query_id: &str,
        sink: String,
        sources: Vec<String>,
    ) {
        let state = match mode {
            ApplyMode::Replay => QueryState::Restored,
            ApplyMode::Live => QueryState::Running,
        };
        self.store.queries.insert(
            query_id.to_string(),
            PersistentQuery {
                query_id: query_id.to_string(),
                sink,
                sources,
                statement_text: command.statement_text.clone(),
                config_overrides: command.config_overrides.clone(),
                state,
            },
        );
        event!(Level::DEBUG, query_id, ?state, "persistent query installed");
    }

    async fn drop_source(
        &mut self,
        kind: SourceKind,
        name: String,
        if_exists: bool,
        delete_topic: bool,
    ) -> ApplyResult {
        let Some(existing) = self.store.source(&name).cloned() else {
            if if_exists {
                return Ok(EffectSummary::new(format!(
                    "Source {} does not exist, nothing to drop",
                    name
                )));
            }
            return Err(ClassifiedError::fatal(format!("{} does not exist.", name)));
        };

        if existing.kind != kind {
            return Err(ClassifiedError::fatal(format!(
                "Incompatible data source type is {}, but statement was DROP {}",
                existing.kind.label().to_ascii_uppercase(),
                kind.label().to_ascii_uppercase()
            )));
        }
        if existing.created_at_offset.is_none() {
            return Err(ClassifiedError::fatal(format!(
                "Cannot drop built-in source {}",
                name
            )));
        }

        let blocking = self.store.queries_touching(&name);
        if !blocking.is_empty() {
            return Err(ClassifiedError::fatal(format!(
                "Cannot drop {}. The following queries read from this source: [{}] and the following queries write into this source: []. You need to terminate them before dropping {}.",
                name,
                blocking.join(", "),
                name
            )));
        }

        if delete_topic {
            self.topics.delete_topic(&existing.topic).await?;
            self.store.managed_topics.remove(&existing.topic);
        }
        self.store.sources.remove(&name);

        Ok(EffectSummary::new(format!(
            "Source `{}` (topic: {}) was dropped.",
            name, existing.topic
        )))
    }

    fn terminate_query(&mut self, query_id: String) -> ApplyResult {
        match self.store.queries.remove(&query_id) {
            Some(_) => Ok(EffectSummary::new("Query terminated.").with_query(query_id)),
            None => Err(ClassifiedError::fatal(format!(
                "Unknown queryId: {}",
                query_id
            ))),
        }
    }

    /// Stops every query and releases owned topics. Failed deletions only
    /// show up in the message.
    async fn terminate_cluster(&mut self, delete_topics: Vec<String>) -> ApplyResult {
        let stopped: Vec<String> = std::mem::take(&mut self.store.queries)
            .into_keys()
            .collect();
        for query_id in &stopped {
            event!(Level::INFO, query_id = %query_id, "persistent query deactivated");
        }

        let mut targets: BTreeSet<String> = self.store.managed_topics.clone();
        targets.extend(delete_topics);
        let report = self.cleaner.release(targets).await;
        for topic in &report.deleted {
            self.store.managed_topics.remove(topic);
        }

        self.store.sources.clear();
        self.store.terminated = true;

        let mut message = format!(
            "Cluster terminated: {} queries stopped, {} topics deleted",
            stopped.len(),
            report.deleted.len()
        );
        if !report.is_clean() {
            let failed: Vec<String> = report
                .failed
                .iter()
                .map(|(topic, reason)| format!("{} ({})", topic, reason))
                .collect();
            message.push_str(&format!("; failed to delete: {}", failed.join(", ")));
        }
        Ok(EffectSummary::new(message).requesting_shutdown())
    }
}

#[async_trait]
impl StatementExecutor for MetaStoreExecutor {
    async fn apply(&mut self, command: &Command, mode: ApplyMode) -> ApplyResult {
        if self.store.already_applied(&command.id, command.sequence_number) {
            event!(
                Level::DEBUG,
                command_id = %command.id,
                seq = command.sequence_number,
                "command effect already present"
            );
            let mut summary = EffectSummary::new(format!(
                "Command '{}' at offset {} was already applied",
                command.id, command.sequence_number
            ))
            .replayed();
            summary.shutdown_requested = command.id.is_cluster_terminate();
            return Ok(summary);
        }

        let statement = parse_statement(&command.statement_text)
            .map_err(|err| ClassifiedError::fatal(err.to_string()))?;

        if self.store.terminated && !statement.is_terminate_cluster() {
            return Err(ClassifiedError::fatal(
                "The cluster has been terminated; no further statements are accepted",
            ));
        }

        let summary = match statement {
            Statement::CreateSource {
                kind,
                name,
                topic,
                if_not_exists,
            } => {
                self.create_source(command, kind, name, topic, if_not_exists)
                    .await?
            }
            Statement::CreateAsSelect {
                kind,
                name,
                sources,
                if_not_exists,
            } => {
                self.create_as_select(command, mode, kind, name, sources, if_not_exists)
                    .await?
            }
            Statement::InsertInto { target, sources } => {
                self.insert_into(command, mode, target, sources).await?
            }
            Statement::DropSource {
                kind,
                name,
                if_exists,
                delete_topic,
            } => self.drop_source(kind, name, if_exists, delete_topic).await?,
            Statement::TerminateQuery { query_id } => self.terminate_query(query_id)?,
            Statement::TerminateCluster { delete_topics } => {
                self.terminate_cluster(delete_topics).await?
            }
        };

        self.store
            .applied
            .insert(command.id.clone(), command.sequence_number);
        self.publish_snapshot();
        Ok(summary)
    }

    async fn finish_replay(&mut self) -> std::result::Result<(), ClassifiedError> {
        let mut started = 0usize;
        for query in self.store.queries.values_mut() {
            if query.state == QueryState::Restored {
                query.state = QueryState::Running;
                started += 1;
            }
        }
        event!(Level::INFO, started, "restored persistent queries started");
        self.publish_snapshot();
        Ok(())
    }
}
