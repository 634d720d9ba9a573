pub mod error;
pub mod types;

pub use error::{ClassifiedError, CommandError, FailureKind, Result};
pub use types::{
    ApplyMode, Command, CommandAction, CommandId, CommandPayload, CommandStatus,
    CommandStatusKind, EffectSummary, EntityType, LogPosition, QueuedCommand,
};
