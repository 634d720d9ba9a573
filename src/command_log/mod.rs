//! Client side of the durable, totally ordered command log.
//!
//! Every node holds its own client with its own read cursor. All
//! administrative commands live on one logical partition, so the offset a
//! record lands at is the single global order every node replays.

use crate::core::{Command, CommandError, CommandId, CommandPayload, LogPosition, Result};
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub mod file;
pub mod memory;

pub use file::FileCommandLog;
pub use memory::{InMemoryCommandLog, InMemoryCommandTape};

/// Name of the stream the command topic is registered under.
pub const COMMANDS_STREAM_NAME: &str = "KSQL_COMMANDS";

/// Suffix appended to the service id to name the command topic.
pub const COMMAND_TOPIC_SUFFIX: &str = "command_topic";

pub fn command_topic_name(service_id: &str, suffix: &str) -> String {
    format!("_confluent-ksql-{}_{}", service_id, suffix)
}

#[async_trait]
pub trait CommandLog: Send + Sync {
    /// Durably appends a command and returns the offset it was written at.
    ///
    /// Resolves only once the log has confirmed durability.
    async fn append(&self, id: &CommandId, payload: &CommandPayload) -> Result<LogPosition>;

    /// Returns records appended after the last returned one, in append order.
    ///
    /// Waits up to `timeout` for at least one record and returns an empty
    /// batch if none shows up.
    async fn poll(&self, timeout: Duration) -> Result<Vec<Command>>;

    /// Position one past the last durable record.
    async fn current_end_position(&self) -> Result<LogPosition>;

    /// Moves the read cursor back to the earliest retained record.
    async fn seek_to_beginning(&self) -> Result<()>;

    /// Position of the next record `poll` will return.
    fn position(&self) -> LogPosition;

    /// Closes this client. Later calls fail with `LogUnavailable`.
    async fn close(&self);
}

/// One record as stored in the log: keyed by command id, payload as value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub key: CommandId,
    pub value: CommandPayload,
    pub ts_unix_ms: i64,
}

pub(crate) fn encode_record(id: &CommandId, payload: &CommandPayload) -> Result<String> {
    let record = LogRecord {
        key: id.clone(),
        value: payload.clone(),
        ts_unix_ms: Utc::now().timestamp_millis(),
    };
    serde_json::to_string(&record).map_err(|err| {
        CommandError::SerializationError(format!("serialize command record: {}", err))
    })
}

pub(crate) fn decode_record(line: &str, offset: u64) -> Result<Command> {
    let record = serde_json::from_str::<LogRecord>(line).map_err(|err| {
        CommandError::SerializationError(format!(
            "parse command record at offset {}: {}",
            offset, err
        ))
    })?;
    Ok(Command::from_payload(record.key, record.value, offset))
}
