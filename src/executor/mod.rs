//! The capability that actually mutates metadata and runtime state.
//!
//! The runner hands each command to a [`StatementExecutor`] and switches on
//! the [`FailureKind`](crate::core::FailureKind) it gets back. It never
//! touches that state itself.

use crate::core::{ApplyMode, ClassifiedError, Command, EffectSummary};
use async_trait::async_trait;

pub mod engine;
pub mod metastore;
pub mod statement;
pub mod topics;

pub use engine::MetaStoreExecutor;
pub use metastore::{DataSource, MetaStore, MetaStoreView, PersistentQuery, QueryState, SourceKind};
pub use statement::{CommandIdAssigner, Statement, parse_statement};
pub use topics::{InMemoryTopicClient, TopicClient};

#[async_trait]
pub trait StatementExecutor: Send {
    /// Applies one command.
    ///
    /// Re-applying a command whose effect already exists must succeed as a
    /// no-op instead of failing as a duplicate.
    async fn apply(
        &mut self,
        command: &Command,
        mode: ApplyMode,
    ) -> std::result::Result<EffectSummary, ClassifiedError>;

    /// Called once startup replay has gone through the whole backlog.
    async fn finish_replay(&mut self) -> std::result::Result<(), ClassifiedError> {
        Ok(())
    }
}
