/// Configuration management
///
/// Every setting comes from the environment (a `.env` file is honored) and
/// has a default, so an empty environment yields a runnable local setup.
use resilience::RetryConfig;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::services::broker::KafkaSettings;
use crate::services::dead_letter::DeadLetterTarget;
use crate::services::pipeline::PipelineConfig;
use crate::services::sink::PostgresSinkConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkKind {
    Postgres,
    Memory,
}

#[derive(Clone, Deserialize)]
pub struct Config {
    #[serde(default = "default_kafka_brokers")]
    pub kafka_brokers: String,
    #[serde(default = "default_kafka_group_id")]
    pub kafka_group_id: String,
    #[serde(default = "default_kafka_topics")]
    pub kafka_topics: String,
    #[serde(default = "default_session_timeout_ms")]
    pub kafka_session_timeout_ms: u64,

    #[serde(default = "default_sink_kind")]
    pub sink_kind: String,
    #[serde(default = "default_sink_database_url")]
    pub sink_database_url: String,
    #[serde(default = "default_sink_max_connections")]
    pub sink_max_connections: u32,
    #[serde(default = "default_sink_connect_timeout_secs")]
    pub sink_connect_timeout_secs: u64,
    #[serde(default = "default_sink_acquire_timeout_secs")]
    pub sink_acquire_timeout_secs: u64,
    #[serde(default = "default_sink_write_timeout_secs")]
    pub sink_write_timeout_secs: u64,

    /// `table:col1,col2;other:col`
    #[serde(default)]
    pub table_primary_keys: String,
    #[serde(default = "default_primary_key")]
    pub default_primary_key: String,

    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_initial_backoff_ms")]
    pub retry_initial_backoff_ms: u64,
    #[serde(default = "default_retry_max_backoff_ms")]
    pub retry_max_backoff_ms: u64,

    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    #[serde(default = "default_poll_max_messages")]
    pub poll_max_messages: usize,
    #[serde(default = "default_max_in_flight_applies")]
    pub max_in_flight_applies: usize,

    /// `kafka:<topic>` or `file:<path>`
    #[serde(default = "default_dead_letter")]
    pub dead_letter: String,

    /// `json` for structured logs, anything else for human-readable output
    #[serde(default = "default_log_format")]
    pub log_format: String,

    /// Listen address of the Prometheus scrape endpoint
    #[serde(default = "default_metrics_addr")]
    pub metrics_addr: String,
}

fn default_kafka_brokers() -> String {
    "kafka-service:9092".to_string()
}
fn default_kafka_group_id() -> String {
    "cdc-sink-consumer-group".to_string()
}
fn default_kafka_topics() -> String {
    "dbserver1.public.customers".to_string()
}
fn default_session_timeout_ms() -> u64 {
    30_000
}
fn default_sink_kind() -> String {
    "postgres".to_string()
}
fn default_sink_database_url() -> String {
    "postgres://localhost/cdc_sink".to_string()
}
fn default_sink_max_connections() -> u32 {
    10
}
fn default_sink_connect_timeout_secs() -> u64 {
    5
}
fn default_sink_acquire_timeout_secs() -> u64 {
    10
}
fn default_sink_write_timeout_secs() -> u64 {
    30
}
fn default_primary_key() -> String {
    "id".to_string()
}
fn default_retry_max_attempts() -> u32 {
    5
}
fn default_retry_initial_backoff_ms() -> u64 {
    100
}
fn default_retry_max_backoff_ms() -> u64 {
    10_000
}
fn default_poll_timeout_ms() -> u64 {
    100
}
fn default_poll_max_messages() -> usize {
    500
}
fn default_max_in_flight_applies() -> usize {
    10
}
fn default_dead_letter() -> String {
    "file:cdc-dead-letter.jsonl".to_string()
}
fn default_log_format() -> String {
    "json".to_string()
}
fn default_metrics_addr() -> String {
    "0.0.0.0:9102".to_string()
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("kafka_brokers", &self.kafka_brokers)
            .field("kafka_group_id", &self.kafka_group_id)
            .field("kafka_topics", &self.kafka_topics)
            .field("sink_kind", &self.sink_kind)
            .field("sink_database_url", &"[REDACTED]")
            .field("table_primary_keys", &self.table_primary_keys)
            .field("retry_max_attempts", &self.retry_max_attempts)
            .field("max_in_flight_applies", &self.max_in_flight_applies)
            .field("dead_letter", &self.dead_letter)
            .field("metrics_addr", &self.metrics_addr)
            .finish_non_exhaustive()
    }
}

impl Config {
    /// Load from the process environment, after `.env`
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_iter(std::env::vars())
    }

    /// Load from explicit variables and validate
    pub fn from_iter<I>(vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let config: Config = envy::from_iter(vars)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.retry_max_attempts == 0 {
            return Err(ConfigError::invalid(
                "RETRY_MAX_ATTEMPTS",
                "must be at least 1",
            ));
        }
        if self.poll_max_messages == 0 {
            return Err(ConfigError::invalid("POLL_MAX_MESSAGES", "must be at least 1"));
        }
        if self.max_in_flight_applies == 0 {
            return Err(ConfigError::invalid(
                "MAX_IN_FLIGHT_APPLIES",
                "must be at least 1",
            ));
        }
        if self.topics().is_empty() {
            return Err(ConfigError::invalid("KAFKA_TOPICS", "no topics given"));
        }

        self.sink_kind()?;
        self.table_keys()?;
        self.dead_letter_target()?;
        self.metrics_addr()?;
        Ok(())
    }

    pub fn topics(&self) -> Vec<String> {
        split_list(&self.kafka_topics, ',')
    }

    pub fn sink_kind(&self) -> Result<SinkKind, ConfigError> {
        match self.sink_kind.trim().to_ascii_lowercase().as_str() {
            "postgres" => Ok(SinkKind::Postgres),
            "memory" => Ok(SinkKind::Memory),
            other => Err(ConfigError::invalid(
                "SINK_KIND",
                format!("unknown sink kind '{}', expected postgres or memory", other),
            )),
        }
    }

    /// Per-table primary-key columns
    pub fn table_keys(&self) -> Result<HashMap<String, Vec<String>>, ConfigError> {
        let mut keys = HashMap::new();

        for entry in split_list(&self.table_primary_keys, ';') {
            let (table, columns) = entry.split_once(':').ok_or_else(|| {
                ConfigError::invalid(
                    "TABLE_PRIMARY_KEYS",
                    format!("entry '{}' is not table:columns", entry),
                )
            })?;

            let table = table.trim();
            let columns = split_list(columns, ',');
            if table.is_empty() || columns.is_empty() {
                return Err(ConfigError::invalid(
                    "TABLE_PRIMARY_KEYS",
                    format!("entry '{}' needs a table and at least one column", entry),
                ));
            }

            keys.insert(table.to_string(), columns);
        }

        Ok(keys)
    }

    pub fn default_key(&self) -> Vec<String> {
        split_list(&self.default_primary_key, ',')
    }

    pub fn dead_letter_target(&self) -> Result<DeadLetterTarget, ConfigError> {
        let invalid = || {
            ConfigError::invalid(
                "DEAD_LETTER",
                format!(
                    "'{}' is not kafka:<topic> or file:<path>",
                    self.dead_letter
                ),
            )
        };

        let (kind, target) = self.dead_letter.split_once(':').ok_or_else(invalid)?;
        let target = target.trim();
        if target.is_empty() {
            return Err(invalid());
        }

        match kind.trim() {
            "kafka" => Ok(DeadLetterTarget::Kafka {
                topic: target.to_string(),
            }),
            "file" => Ok(DeadLetterTarget::File {
                path: PathBuf::from(target),
            }),
            _ => Err(invalid()),
        }
    }

    pub fn kafka_settings(&self) -> KafkaSettings {
        KafkaSettings {
            brokers: self.kafka_brokers.clone(),
            group_id: self.kafka_group_id.clone(),
            session_timeout_ms: self.kafka_session_timeout_ms,
        }
    }

    pub fn postgres_sink_config(&self) -> PostgresSinkConfig {
        PostgresSinkConfig {
            database_url: self.sink_database_url.clone(),
            max_connections: self.sink_max_connections,
            connect_timeout_secs: self.sink_connect_timeout_secs,
            acquire_timeout_secs: self.sink_acquire_timeout_secs,
            ..Default::default()
        }
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.retry_max_attempts,
            initial_backoff: Duration::from_millis(self.retry_initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry_max_backoff_ms),
            ..Default::default()
        }
    }

    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            topics: self.topics(),
            poll_timeout: Duration::from_millis(self.poll_timeout_ms),
            poll_max_messages: self.poll_max_messages,
            max_in_flight: self.max_in_flight_applies,
            write_timeout: Duration::from_secs(self.sink_write_timeout_secs),
            retry: self.retry_config(),
            ..Default::default()
        }
    }

    pub fn metrics_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.metrics_addr.trim().parse().map_err(|_| {
            ConfigError::invalid(
                "METRICS_ADDR",
                format!("'{}' is not a host:port socket address", self.metrics_addr),
            )
        })
    }

    pub fn json_logs(&self) -> bool {
        self.log_format.eq_ignore_ascii_case("json")
    }
}

/// Trimmed, non-empty items of a separated list
fn split_list(raw: &str, separator: char) -> Vec<String> {
    raw.split(separator)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_string)
        .collect()
}
