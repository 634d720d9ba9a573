use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Command log unavailable: {0}")]
    LogUnavailable(String),

    #[error("Transient apply failure: {0}")]
    TransientApplyFailure(String),

    #[error("Fatal apply failure: {0}")]
    FatalApplyFailure(String),

    #[error("Infrastructure failure: {0}")]
    InfrastructureFailure(String),

    #[error("Timed out waiting for command '{id}' at offset {sequence_number}; it may still be applied")]
    StatusTimeout { id: String, sequence_number: u64 },

    #[error("Not ready: {0}")]
    NotReady(String),

    #[error("Command runner stopped: {0}")]
    RunnerStopped(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;

impl<T> From<std::sync::PoisonError<T>> for CommandError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        Self::LockError(err.to_string())
    }
}

impl From<serde_json::Error> for CommandError {
    fn from(err: serde_json::Error) -> Self {
        Self::SerializationError(err.to_string())
    }
}

impl From<std::io::Error> for CommandError {
    fn from(err: std::io::Error) -> Self {
        Self::IoError(err.to_string())
    }
}

/// How the runner must react when a statement fails to apply.
///
/// The classification is decided by the executor; the runner never looks at
/// the message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Likely to succeed on a later attempt, e.g. a dependency not yet visible.
    Transient,
    /// The statement itself is invalid; retrying cannot help.
    Fatal,
    /// The executor or its dependencies are down; nothing can make progress.
    Infrastructure,
}

/// A failure returned across the executor boundary, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    pub kind: FailureKind,
    pub message: String,
}

impl ClassifiedError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Transient, message)
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Fatal, message)
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Infrastructure, message)
    }
}

impl std::fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ClassifiedError {}

impl From<ClassifiedError> for CommandError {
    fn from(err: ClassifiedError) -> Self {
        match err.kind {
            FailureKind::Transient => Self::TransientApplyFailure(err.message),
            FailureKind::Fatal => Self::FatalApplyFailure(err.message),
            FailureKind::Infrastructure => Self::InfrastructureFailure(err.message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classified_error_maps_onto_taxonomy() {
        let err: CommandError = ClassifiedError::transient("source not visible").into();
        assert!(matches!(err, CommandError::TransientApplyFailure(_)));

        let err: CommandError = ClassifiedError::fatal("bad statement").into();
        assert!(matches!(err, CommandError::FatalApplyFailure(_)));

        let err: CommandError = ClassifiedError::infrastructure("broker down").into();
        assert_eq!(err.to_string(), "Infrastructure failure: broker down");
    }

    #[test]
    fn timeout_message_does_not_claim_failure() {
        let err = CommandError::StatusTimeout {
            id: "stream/A/create".to_string(),
            sequence_number: 4,
        };
        assert!(err.to_string().contains("may still be applied"));
    }
}
