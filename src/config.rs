use crate::command_log::{COMMAND_TOPIC_SUFFIX, command_topic_name};
use crate::core::{CommandError, Result};
use crate::runner::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Capped exponential backoff bounds, in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    pub initial_ms: u64,
    pub max_ms: u64,
}

/// Node configuration
///
/// Loaded from JSON; every field has a default so a config file only needs
/// the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandConfig {
    /// Cluster identity; nodes sharing it share one command log
    pub service_id: String,

    pub command_topic_suffix: String,

    /// Retries of a transiently failing statement before it is recorded as ERROR
    pub max_statement_retries: u32,

    /// Backoff between transient retries
    pub retry: BackoffConfig,

    /// Backoff while DEGRADED
    pub infrastructure_backoff: BackoffConfig,

    pub poll_timeout_ms: u64,

    /// How long `submit_and_wait` waits for the local runner
    pub distributed_command_response_timeout_ms: u64,

    /// Terminal statuses remembered for late waiters
    pub status_cache_capacity: usize,

    /// Create the processing-log stream when the command log is empty
    pub processing_log_auto_create: bool,

    pub processing_log_stream_name: String,

    /// Recorded with every submitted command
    pub properties: BTreeMap<String, String>,
}

impl Default for CommandConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            service_id: "default_".to_string(),
            command_topic_suffix: COMMAND_TOPIC_SUFFIX.to_string(),
            max_statement_retries: retry.max_retries,
            retry: BackoffConfig {
                initial_ms: retry.initial_backoff_ms,
                max_ms: retry.max_backoff_ms,
            },
            infrastructure_backoff: BackoffConfig {
                initial_ms: retry.infrastructure_initial_backoff_ms,
                max_ms: retry.infrastructure_max_backoff_ms,
            },
            poll_timeout_ms: 100,
            distributed_command_response_timeout_ms: 5_000,
            status_cache_capacity: 1_024,
            processing_log_auto_create: false,
            processing_log_stream_name: "KSQL_PROCESSING_LOG".to_string(),
            properties: BTreeMap::new(),
        }
    }
}

impl CommandConfig {
    pub fn new(service_id: &str) -> Self {
        Self {
            service_id: service_id.to_string(),
            ..Self::default()
        }
    }

    /// Load and validate a JSON config file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|err| {
            CommandError::ConfigError(format!("read {}: {}", path.display(), err))
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|err| {
            CommandError::ConfigError(format!("parse {}: {}", path.display(), err))
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.service_id.trim().is_empty() {
            return Err(CommandError::ConfigError(
                "service_id must not be empty".to_string(),
            ));
        }
        if self.command_topic_suffix.trim().is_empty() {
            return Err(CommandError::ConfigError(
                "command_topic_suffix must not be empty".to_string(),
            ));
        }
        for (name, backoff) in [
            ("retry", self.retry),
            ("infrastructure_backoff", self.infrastructure_backoff),
        ] {
            if backoff.initial_ms == 0 || backoff.max_ms < backoff.initial_ms {
                return Err(CommandError::ConfigError(format!(
                    "{} backoff needs 0 < initial_ms <= max_ms (got {} / {})",
                    name, backoff.initial_ms, backoff.max_ms
                )));
            }
        }
        if self.poll_timeout_ms == 0 {
            return Err(CommandError::ConfigError(
                "poll_timeout_ms must be positive".to_string(),
            ));
        }
        if self.distributed_command_response_timeout_ms == 0 {
            return Err(CommandError::ConfigError(
                "distributed_command_response_timeout_ms must be positive".to_string(),
            ));
        }
        if self.processing_log_auto_create && self.processing_log_stream_name.trim().is_empty() {
            return Err(CommandError::ConfigError(
                "processing_log_stream_name must be set when auto-create is on".to_string(),
            ));
        }
        Ok(())
    }

    /// Set the maximum transient retries per statement
    pub fn max_statement_retries(mut self, retries: u32) -> Self {
        self.max_statement_retries = retries;
        self
    }

    /// Set the transient retry backoff
    pub fn retry_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.retry = BackoffConfig {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        };
        self
    }

    /// Set the DEGRADED backoff
    pub fn infrastructure_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.infrastructure_backoff = BackoffConfig {
            initial_ms: initial.as_millis() as u64,
            max_ms: max.as_millis() as u64,
        };
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn command_response_timeout(mut self, timeout: Duration) -> Self {
        self.distributed_command_response_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn status_cache_capacity(mut self, capacity: usize) -> Self {
        self.status_cache_capacity = capacity;
        self
    }

    /// Enable processing-log stream auto-creation
    pub fn processing_log_auto_create(mut self, enabled: bool) -> Self {
        self.processing_log_auto_create = enabled;
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }

    pub fn command_topic(&self) -> String {
        command_topic_name(&self.service_id, &self.command_topic_suffix)
    }

    pub fn processing_log_topic(&self) -> String {
        format!("{}ksql_processing_log", self.service_id)
    }

    pub fn processing_log_stream_statement(&self) -> String {
        format!(
            "CREATE STREAM {} (LOGGER VARCHAR, LEVEL VARCHAR, TIME BIGINT, MESSAGE VARCHAR) WITH (KAFKA_TOPIC='{}', VALUE_FORMAT='JSON');",
            self.processing_log_stream_name,
            self.processing_log_topic()
        )
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_statement_retries,
            initial_backoff_ms: self.retry.initial_ms,
            max_backoff_ms: self.retry.max_ms,
            infrastructure_initial_backoff_ms: self.infrastructure_backoff.initial_ms,
            infrastructure_max_backoff_ms: self.infrastructure_backoff.max_ms,
        }
    }

    pub fn poll_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn command_response_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.distributed_command_response_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn partial_json_keeps_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"service_id": "prod_", "max_statement_retries": 3, "properties": {{"ksql.streams.num.stream.threads": "4"}}}}"#
        )
        .unwrap();

        let config = CommandConfig::from_json_file(file.path()).unwrap();
        assert_eq!(config.service_id, "prod_");
        assert_eq!(config.retry_policy().max_retries, 3);
        assert_eq!(config.poll_timeout_ms, 100);
        assert_eq!(config.command_topic(), "_confluent-ksql-prod__command_topic");
        assert_eq!(config.properties.len(), 1);
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let config = CommandConfig::default()
            .retry_backoff(Duration::from_millis(500), Duration::from_millis(100));
        assert!(matches!(config.validate(), Err(CommandError::ConfigError(_))));

        let mut file = NamedTempFile::new().unwrap();
        write!(file, r#"{{"service_id": "  "}}"#).unwrap();
        assert!(CommandConfig::from_json_file(file.path()).is_err());
    }

    #[test]
    fn processing_log_statement_targets_its_topic() {
        let config = CommandConfig::new("svc_");
        let statement = crate::executor::parse_statement(&config.processing_log_stream_statement())
            .unwrap();
        assert_eq!(
            statement,
            crate::executor::Statement::CreateSource {
                kind: crate::executor::SourceKind::Stream,
                name: "KSQL_PROCESSING_LOG".to_string(),
                topic: Some("svc_ksql_processing_log".to_string()),
                if_not_exists: false,
            }
        );
    }
}
