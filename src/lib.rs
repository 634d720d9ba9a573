// ============================================================================
// streamcmd Library
// ============================================================================
//
// Durable command log and command runner for a streaming SQL control plane.
// Administrative statements are appended to one ordered log and every node
// applies them in log order, exactly once in effect.

pub mod command_log;
pub mod config;
pub mod core;
pub mod executor;
pub mod node;
pub mod queue;
pub mod runner;
pub mod status;

// Re-export main types for convenience
pub use crate::core::{
    ApplyMode, ClassifiedError, Command, CommandAction, CommandError, CommandId, CommandPayload,
    CommandStatus, CommandStatusKind, EffectSummary, EntityType, FailureKind, LogPosition,
    QueuedCommand, Result,
};

pub use command_log::{CommandLog, FileCommandLog, InMemoryCommandLog, InMemoryCommandTape};
pub use config::CommandConfig;
pub use executor::{
    InMemoryTopicClient, MetaStore, MetaStoreExecutor, MetaStoreView, StatementExecutor,
    TopicClient,
};
pub use node::{CommandNode, CommandNodeBuilder};
pub use queue::CommandQueue;
pub use runner::{
    CommandRunner, ReplayOutcome, RetryPolicy, RunnerControl, RunnerHandle, RunnerState,
};
pub use status::{CommandStatusTracker, StatusHandle};
