use crate::core::{CommandId, EntityType};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    Stream,
    Table,
}

impl SourceKind {
    pub fn entity_type(&self) -> EntityType {
        match self {
            SourceKind::Stream => EntityType::Stream,
            SourceKind::Table => EntityType::Table,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::Stream => "stream",
            SourceKind::Table => "table",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSource {
    pub name: String,
    pub kind: SourceKind,
    pub topic: String,
    pub statement_text: String,
    /// Offset of the command that created it; `None` for built-in sources.
    pub created_at_offset: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryState {
    /// Registered during startup replay, not started yet.
    Restored,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PersistentQuery {
    pub query_id: String,
    pub sink: String,
    pub sources: Vec<String>,
    pub statement_text: String,
    pub config_overrides: BTreeMap<String, String>,
    pub state: QueryState,
}

impl PersistentQuery {
    pub fn touches(&self, source: &str) -> bool {
        self.sink == source || self.sources.iter().any(|s| s == source)
    }
}

/// Metadata describing every declared source and installed query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaStore {
    pub sources: BTreeMap<String, DataSource>,
    pub queries: BTreeMap<String, PersistentQuery>,
    /// Topics this cluster created and must clean up on termination.
    pub managed_topics: BTreeSet<String>,
    /// Last successfully applied offset per command id.
    pub applied: HashMap<CommandId, u64>,
    pub terminated: bool,
}

impl MetaStore {
    pub fn source(&self, name: &str) -> Option<&DataSource> {
        self.sources.get(name)
    }

    pub fn queries_touching(&self, source: &str) -> Vec<String> {
        self.queries
            .values()
            .filter(|query| query.touches(source))
            .map(|query| query.query_id.clone())
            .collect()
    }

    pub fn running_queries(&self) -> usize {
        self.queries
            .values()
            .filter(|query| query.state == QueryState::Running)
            .count()
    }

    /// True if `offset` for `id` already took effect.
    pub fn already_applied(&self, id: &CommandId, offset: u64) -> bool {
        self.applied.get(id).is_some_and(|applied| *applied >= offset)
    }
}

/// Read-only window onto the executor's metastore.
///
/// The runner task owns the metastore; everyone else sees immutable
/// snapshots published after each applied command.
#[derive(Clone)]
pub struct MetaStoreView {
    receiver: watch::Receiver<Arc<MetaStore>>,
}

impl MetaStoreView {
    pub(crate) fn new(receiver: watch::Receiver<Arc<MetaStore>>) -> Self {
        Self { receiver }
    }

    pub fn current(&self) -> Arc<MetaStore> {
        self.receiver.borrow().clone()
    }

    /// Waits for the next published snapshot.
    pub async fn changed(&mut self) -> Option<Arc<MetaStore>> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }
}
