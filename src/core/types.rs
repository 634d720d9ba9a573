use super::error::{CommandError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Kind of entity a command is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Stream,
    Table,
    Topic,
    /// Termination of a single persistent query.
    Terminate,
    Cluster,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Stream => "stream",
            EntityType::Table => "table",
            EntityType::Topic => "topic",
            EntityType::Terminate => "terminate",
            EntityType::Cluster => "cluster",
        }
    }
}

impl FromStr for EntityType {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "stream" => Ok(EntityType::Stream),
            "table" => Ok(EntityType::Table),
            "topic" => Ok(EntityType::Topic),
            "terminate" => Ok(EntityType::Terminate),
            "cluster" => Ok(EntityType::Cluster),
            other => Err(CommandError::ParseError(format!(
                "Unknown command entity type '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandAction {
    Create,
    Drop,
    Execute,
    Terminate,
}

impl CommandAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandAction::Create => "create",
            CommandAction::Drop => "drop",
            CommandAction::Execute => "execute",
            CommandAction::Terminate => "terminate",
        }
    }
}

impl FromStr for CommandAction {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(CommandAction::Create),
            "drop" => Ok(CommandAction::Drop),
            "execute" => Ok(CommandAction::Execute),
            "terminate" => Ok(CommandAction::Terminate),
            other => Err(CommandError::ParseError(format!(
                "Unknown command action '{}'",
                other
            ))),
        }
    }
}

/// Names what a command is about, not which attempt it is.
///
/// Rendered as `type/entity/action`, e.g. `stream/PAGEVIEWS/create`. Two
/// commands may share an id; the log offset tells them apart.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CommandId {
    pub entity_type: EntityType,
    pub entity: String,
    pub action: CommandAction,
}

impl CommandId {
    pub fn new(entity_type: EntityType, entity: impl Into<String>, action: CommandAction) -> Self {
        Self {
            entity_type,
            entity: entity.into(),
            action,
        }
    }

    pub fn is_cluster_terminate(&self) -> bool {
        self.entity_type == EntityType::Cluster && self.action == CommandAction::Terminate
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.entity_type.as_str(),
            self.entity,
            self.action.as_str()
        )
    }
}

impl FromStr for CommandId {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self> {
        // The entity may itself contain '/', so split from both ends.
        let (entity_type, rest) = s
            .split_once('/')
            .ok_or_else(|| CommandError::ParseError(format!("Malformed command id '{}'", s)))?;
        let (entity, action) = rest
            .rsplit_once('/')
            .ok_or_else(|| CommandError::ParseError(format!("Malformed command id '{}'", s)))?;
        if entity.is_empty() {
            return Err(CommandError::ParseError(format!(
                "Command id '{}' has an empty entity",
                s
            )));
        }

        Ok(Self {
            entity_type: entity_type.parse()?,
            entity: entity.to_string(),
            action: action.parse()?,
        })
    }
}

impl Serialize for CommandId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CommandId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Offset in the command log. The first record lives at position 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct LogPosition(pub u64);

impl LogPosition {
    pub const START: LogPosition = LogPosition(0);

    pub fn offset(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> LogPosition {
        LogPosition(self.0.saturating_add(1))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What producers put on the wire. The sequence number is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandPayload {
    pub statement_text: String,
    #[serde(default)]
    pub config_overrides: BTreeMap<String, String>,
    #[serde(default)]
    pub original_properties: BTreeMap<String, String>,
}

impl CommandPayload {
    pub fn new(statement_text: impl Into<String>) -> Self {
        Self {
            statement_text: statement_text.into(),
            config_overrides: BTreeMap::new(),
            original_properties: BTreeMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: BTreeMap<String, String>) -> Self {
        self.config_overrides = overrides;
        self
    }

    pub fn with_original_properties(mut self, properties: BTreeMap<String, String>) -> Self {
        self.original_properties = properties;
        self
    }
}

/// One administrative statement as read back from the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub id: CommandId,
    pub statement_text: String,
    pub config_overrides: BTreeMap<String, String>,
    pub original_properties: BTreeMap<String, String>,
    pub sequence_number: u64,
}

impl Command {
    pub fn from_payload(id: CommandId, payload: CommandPayload, sequence_number: u64) -> Self {
        Self {
            id,
            statement_text: payload.statement_text,
            config_overrides: payload.config_overrides,
            original_properties: payload.original_properties,
            sequence_number,
        }
    }

    pub fn position(&self) -> LogPosition {
        LogPosition(self.sequence_number)
    }

    pub fn payload(&self) -> CommandPayload {
        CommandPayload {
            statement_text: self.statement_text.clone(),
            config_overrides: self.config_overrides.clone(),
            original_properties: self.original_properties.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandStatusKind {
    Queued,
    Executing,
    Success,
    Error,
}

impl CommandStatusKind {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandStatusKind::Success | CommandStatusKind::Error)
    }
}

impl fmt::Display for CommandStatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CommandStatusKind::Queued => "QUEUED",
            CommandStatusKind::Executing => "EXECUTING",
            CommandStatusKind::Success => "SUCCESS",
            CommandStatusKind::Error => "ERROR",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandStatus {
    pub status: CommandStatusKind,
    pub message: String,
    pub updated_at: DateTime<Utc>,
}

impl CommandStatus {
    pub fn new(status: CommandStatusKind, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            updated_at: Utc::now(),
        }
    }

    pub fn queued() -> Self {
        Self::new(CommandStatusKind::Queued, "Statement written to command log")
    }

    pub fn executing() -> Self {
        Self::new(CommandStatusKind::Executing, "Executing statement")
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(CommandStatusKind::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(CommandStatusKind::Error, message)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Whether a command is applied during startup replay or live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyMode {
    /// Startup replay: register effects, but leave queries for `finish_replay`.
    Replay,
    Live,
}

/// What a successful apply did.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EffectSummary {
    pub message: String,
    pub query_id: Option<String>,
    /// The effect was already present and the apply was a no-op.
    pub replayed: bool,
    /// The runner must stop once this command's status is published.
    pub shutdown_requested: bool,
}

impl EffectSummary {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn replayed(mut self) -> Self {
        self.replayed = true;
        self
    }

    pub fn requesting_shutdown(mut self) -> Self {
        self.shutdown_requested = true;
        self
    }
}

/// Returned to a submitter once its statement is durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedCommand {
    pub id: CommandId,
    pub sequence_number: u64,
}
