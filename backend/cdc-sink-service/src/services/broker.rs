//! Broker consumption seam
//!
//! The orchestrator owns one `Broker` and is the only caller; offsets are
//! committed explicitly and only for messages whose outcome is final.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::Message;
use rdkafka::topic_partition_list::{Offset, TopicPartitionList};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::BrokerError;
use crate::services::cdc::{PartitionId, RawMessage};

#[async_trait]
pub trait Broker: Send {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError>;

    /// Up to `max_messages` messages, waiting at most `timeout`
    async fn poll(
        &mut self,
        timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<RawMessage>, BrokerError>;

    /// Commit the last fully handled offset of each partition
    async fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError>;

    /// Stop fetching a partition
    async fn pause(&mut self, partition: &PartitionId) -> Result<(), BrokerError>;

    async fn resume(&mut self, partition: &PartitionId) -> Result<(), BrokerError>;

    async fn close(&mut self) -> Result<(), BrokerError>;
}

#[derive(Debug, Clone)]
pub struct KafkaSettings {
    pub brokers: String,
    pub group_id: String,
    pub session_timeout_ms: u64,
}

/// Kafka consumer group member with manual commits
pub struct KafkaBroker {
    consumer: Arc<StreamConsumer>,
}

impl KafkaBroker {
    pub fn new(settings: &KafkaSettings) -> Result<Self, BrokerError> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", &settings.group_id)
            .set("bootstrap.servers", &settings.brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", settings.session_timeout_ms.to_string())
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()?;

        info!(
            brokers = %settings.brokers,
            group_id = %settings.group_id,
            "Kafka consumer created"
        );

        Ok(Self {
            consumer: Arc::new(consumer),
        })
    }

    fn single_partition(partition: &PartitionId) -> TopicPartitionList {
        let mut tpl = TopicPartitionList::new();
        tpl.add_partition(&partition.topic, partition.partition);
        tpl
    }
}

/// Kafka offsets name the next message to read
fn commit_list(offsets: &BTreeMap<PartitionId, i64>) -> Result<TopicPartitionList, KafkaError> {
    let mut tpl = TopicPartitionList::new();
    for (partition, offset) in offsets {
        tpl.add_partition_offset(
            &partition.topic,
            partition.partition,
            Offset::Offset(offset + 1),
        )?;
    }
    Ok(tpl)
}

#[async_trait]
impl Broker for KafkaBroker {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        let topics: Vec<&str> = topics.iter().map(String::as_str).collect();
        self.consumer.subscribe(&topics).map_err(|e| {
            error!(error = %e, "Failed to subscribe to topics");
            e
        })?;

        info!(?topics, "Subscribed to CDC topics");
        Ok(())
    }

    async fn poll(
        &mut self,
        timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut batch = Vec::new();

        while batch.len() < max_messages {
            let received = match tokio::time::timeout_at(deadline, self.consumer.recv()).await {
                Ok(received) => received,
                Err(_) => break,
            };

            match received {
                Ok(message) => batch.push(RawMessage {
                    key: message.key().map(<[u8]>::to_vec),
                    value: message.payload().map(<[u8]>::to_vec),
                    topic: message.topic().to_string(),
                    partition: message.partition(),
                    offset: message.offset(),
                }),
                Err(e) if batch.is_empty() => return Err(e.into()),
                Err(e) => {
                    warn!(error = %e, received = batch.len(), "Kafka error mid-batch");
                    break;
                }
            }
        }

        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let tpl = commit_list(offsets)?;

        // Synchronous commits block on the group coordinator round-trip
        let consumer = Arc::clone(&self.consumer);
        tokio::task::spawn_blocking(move || consumer.commit(&tpl, CommitMode::Sync)).await??;

        debug!(partitions = offsets.len(), "Committed offsets");
        Ok(())
    }

    async fn pause(&mut self, partition: &PartitionId) -> Result<(), BrokerError> {
        self.consumer.pause(&Self::single_partition(partition))?;
        debug!(%partition, "Partition paused");
        Ok(())
    }

    async fn resume(&mut self, partition: &PartitionId) -> Result<(), BrokerError> {
        self.consumer.resume(&Self::single_partition(partition))?;
        debug!(%partition, "Partition resumed");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.consumer.unsubscribe();
        info!("Kafka consumer unsubscribed");
        Ok(())
    }
}
