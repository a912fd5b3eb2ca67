use thiserror::Error;

/// Raw message body could not be turned into a change event
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("Malformed CDC envelope: {0}")]
    Malformed(String),
}

/// Change event could not be turned into a sink mutation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClassifyError {
    #[error("Missing key column '{column}' for table '{table}'")]
    MissingKey { table: String, column: String },
}

/// Sink write failure
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    /// Connectivity, timeout or contention; the same mutation may succeed later
    #[error("Transient sink error: {0}")]
    Transient(String),

    /// Schema mismatch, constraint violation or malformed mutation
    #[error("Permanent sink error: {0}")]
    Permanent(String),
}

impl ApplyError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ApplyError::Transient(_))
    }
}

/// Any per-message failure that ends in the dead-letter output
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecordError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error(transparent)]
    Classify(#[from] ClassifyError),

    #[error(transparent)]
    Apply(#[from] ApplyError),
}

impl RecordError {
    /// Stable label for dead-letter records and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            RecordError::Decode(DecodeError::Malformed(_)) => "malformed",
            RecordError::Classify(ClassifyError::MissingKey { .. }) => "missing_key",
            RecordError::Apply(ApplyError::Permanent(_)) => "permanent_apply",
            RecordError::Apply(ApplyError::Transient(_)) => "transient_apply",
        }
    }
}

#[derive(Debug, Error)]
pub enum DeadLetterError {
    #[error("Kafka error: {0}")]
    Kafka(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Commit task failed: {0}")]
    CommitTask(#[from] tokio::task::JoinError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, message: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field,
            message: message.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Broker error: {0}")]
    Broker(#[from] BrokerError),
}
