//! Dead-letter output for messages that cannot be applied
//!
//! Each failed message is written as one JSON record carrying its source
//! coordinates, the raw key and payload, and the failure reason. Records go
//! either to a Kafka topic or to an append-only JSON-lines file.

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::error::{DeadLetterError, RecordError};
use crate::services::cdc::RawMessage;

/// Raw bytes in a JSON-safe form: verbatim when UTF-8, base64 otherwise
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum EncodedBytes {
    Utf8(String),
    Base64(String),
}

impl EncodedBytes {
    pub fn from_bytes(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => EncodedBytes::Utf8(text.to_string()),
            Err(_) => EncodedBytes::Base64(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }
}

/// Dead-letter record format
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<EncodedBytes>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<EncodedBytes>,
    /// Human-readable failure description
    pub reason: String,
    /// Stable failure label: malformed, missing_key, permanent_apply
    pub error_kind: String,
    pub failed_at: DateTime<Utc>,
}

impl DeadLetterRecord {
    pub fn new(message: &RawMessage, error: &RecordError) -> Self {
        Self {
            topic: message.topic.clone(),
            partition: message.partition,
            offset: message.offset,
            key: message.key.as_deref().map(EncodedBytes::from_bytes),
            payload: message.value.as_deref().map(EncodedBytes::from_bytes),
            reason: error.to_string(),
            error_kind: error.kind().to_string(),
            failed_at: Utc::now(),
        }
    }
}

/// Where dead-letter records are written
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeadLetterTarget {
    Kafka { topic: String },
    File { path: PathBuf },
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    /// Durably record one failed message
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError>;

    /// Wait for buffered records to be written
    async fn flush(&self) -> Result<(), DeadLetterError> {
        Ok(())
    }
}

/// Dead-letter topic producer
pub struct KafkaDeadLetter {
    topic: String,
    producer: FutureProducer,
    send_timeout: Duration,
}

impl KafkaDeadLetter {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self, DeadLetterError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()
            .map_err(|e| DeadLetterError::Kafka(e.to_string()))?;

        Ok(Self {
            topic: topic.into(),
            producer,
            send_timeout: Duration::from_secs(5),
        })
    }
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetter {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let payload = serde_json::to_string(record)?;
        let key = format!("{}-{}-{}", record.topic, record.partition, record.offset);

        let message = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        match self.producer.send(message, self.send_timeout).await {
            Ok((partition, offset)) => {
                debug!(
                    dead_letter_topic = %self.topic,
                    partition,
                    offset,
                    source = %key,
                    "Dead-letter record produced"
                );
                Ok(())
            }
            Err((e, _)) => {
                error!(
                    error = %e,
                    source = %key,
                    "Failed to produce dead-letter record"
                );
                Err(DeadLetterError::Kafka(e.to_string()))
            }
        }
    }

    async fn flush(&self) -> Result<(), DeadLetterError> {
        let producer = self.producer.clone();
        let timeout = self.send_timeout;

        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| DeadLetterError::Kafka(format!("flush task failed: {}", e)))?
            .map_err(|e| DeadLetterError::Kafka(e.to_string()))
    }
}

/// Append-only JSON-lines file, synced after every record
pub struct FileDeadLetter {
    path: PathBuf,
    file: Mutex<File>,
}

impl FileDeadLetter {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, DeadLetterError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        info!(path = %path.display(), "Dead-letter file opened");

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl DeadLetterSink for FileDeadLetter {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        file.sync_data().await?;

        debug!(
            path = %self.path.display(),
            topic = %record.topic,
            partition = record.partition,
            offset = record.offset,
            "Dead-letter record appended"
        );
        Ok(())
    }
}

/// Build the dead-letter sink for a target
pub async fn connect(
    target: &DeadLetterTarget,
    brokers: &str,
) -> Result<Arc<dyn DeadLetterSink>, DeadLetterError> {
    let sink: Arc<dyn DeadLetterSink> = match target {
        DeadLetterTarget::Kafka { topic } => Arc::new(KafkaDeadLetter::new(brokers, topic.clone())?),
        DeadLetterTarget::File { path } => Arc::new(FileDeadLetter::open(path).await?),
    };
    Ok(sink)
}
