//! Test doubles for driving the orchestrator without Kafka or Postgres
#![allow(dead_code)]

use async_trait::async_trait;
use cdc_sink_service::error::{ApplyError, BrokerError, DeadLetterError};
use cdc_sink_service::services::cdc::{PartitionId, RawMessage, RowImage};
use cdc_sink_service::services::{
    Broker, DeadLetterRecord, DeadLetterSink, MemorySink, PipelineConfig, SinkStore,
};
use rdkafka::error::KafkaError;
use rdkafka::types::RDKafkaErrorCode;
use resilience::RetryConfig;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const CUSTOMERS: &str = "dbserver1.public.customers";

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        topics: vec![CUSTOMERS.to_string()],
        poll_timeout: Duration::from_millis(10),
        poll_max_messages: 500,
        max_in_flight: 4,
        worker_queue_depth: 2,
        write_timeout: Duration::from_secs(2),
        retry: RetryConfig {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_multiplier: 2.0,
            jitter: false,
        },
    }
}

pub fn row(value: Value) -> RowImage {
    value.as_object().cloned().expect("row literal must be an object")
}

/// Poll `check` until it holds or five seconds pass
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while tokio::time::Instant::now() < deadline {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// ==================== Broker ====================

#[derive(Default)]
pub struct BrokerState {
    pending: VecDeque<RawMessage>,
    next_offset: HashMap<PartitionId, i64>,
    pub committed: BTreeMap<PartitionId, i64>,
    pub commit_calls: usize,
    /// Every commit request, failed ones included
    pub commit_requests: Vec<BTreeMap<PartitionId, i64>>,
    failing_commits: usize,
    failing_polls: usize,
    pub poll_errors: usize,
    pub paused: BTreeSet<PartitionId>,
    pub pause_calls: usize,
    pub subscribed: Vec<String>,
    pub closed: bool,
}

/// Shared view of a `MemoryBroker`, usable after the broker moved into a pipeline
#[derive(Clone, Default)]
pub struct BrokerHandle(Arc<Mutex<BrokerState>>);

impl BrokerHandle {
    /// Append a message with the next offset of its partition
    pub fn push(&self, topic: &str, partition: i32, value: Option<Value>) -> i64 {
        let mut state = self.0.lock().unwrap();
        let id = PartitionId::new(topic, partition);
        let offset = *state.next_offset.get(&id).unwrap_or(&0);
        state.next_offset.insert(id, offset + 1);

        state.pending.push_back(RawMessage {
            key: Some(format!("{}-{}", partition, offset).into_bytes()),
            value: value.map(|v| serde_json::to_vec(&v).unwrap()),
            topic: topic.to_string(),
            partition,
            offset,
        });
        offset
    }

    pub fn push_raw(&self, topic: &str, partition: i32, value: &[u8]) -> i64 {
        let offset = self.push(topic, partition, None);
        let mut state = self.0.lock().unwrap();
        if let Some(message) = state.pending.back_mut() {
            message.value = Some(value.to_vec());
        }
        offset
    }

    pub fn committed(&self, topic: &str, partition: i32) -> Option<i64> {
        self.0
            .lock()
            .unwrap()
            .committed
            .get(&PartitionId::new(topic, partition))
            .copied()
    }

    pub fn is_paused(&self, topic: &str, partition: i32) -> bool {
        self.0
            .lock()
            .unwrap()
            .paused
            .contains(&PartitionId::new(topic, partition))
    }

    /// Reject the next `count` commits
    pub fn fail_commits(&self, count: usize) {
        self.0.lock().unwrap().failing_commits = count;
    }

    /// Fail the next `count` polls
    pub fn fail_polls(&self, count: usize) {
        self.0.lock().unwrap().failing_polls = count;
    }

    pub fn commit_requests(&self) -> Vec<BTreeMap<PartitionId, i64>> {
        self.0.lock().unwrap().commit_requests.clone()
    }

    pub fn poll_errors(&self) -> usize {
        self.0.lock().unwrap().poll_errors
    }

    pub fn pause_calls(&self) -> usize {
        self.0.lock().unwrap().pause_calls
    }

    pub fn is_closed(&self) -> bool {
        self.0.lock().unwrap().closed
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.0.lock().unwrap().subscribed.clone()
    }
}

pub struct MemoryBroker {
    handle: BrokerHandle,
}

impl MemoryBroker {
    pub fn new() -> (Self, BrokerHandle) {
        let handle = BrokerHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn subscribe(&mut self, topics: &[String]) -> Result<(), BrokerError> {
        self.handle.0.lock().unwrap().subscribed = topics.to_vec();
        Ok(())
    }

    async fn poll(
        &mut self,
        timeout: Duration,
        max_messages: usize,
    ) -> Result<Vec<RawMessage>, BrokerError> {
        let batch: Vec<RawMessage> = {
            let mut state = self.handle.0.lock().unwrap();
            if state.failing_polls > 0 {
                state.failing_polls -= 1;
                state.poll_errors += 1;
                return Err(KafkaError::MessageConsumption(
                    RDKafkaErrorCode::BrokerTransportFailure,
                )
                .into());
            }

            let mut batch = Vec::new();
            let mut kept = VecDeque::new();

            while let Some(message) = state.pending.pop_front() {
                if batch.len() < max_messages && !state.paused.contains(&message.partition_id()) {
                    batch.push(message);
                } else {
                    kept.push_back(message);
                }
            }
            state.pending = kept;
            batch
        };

        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        }
        Ok(batch)
    }

    async fn commit(&mut self, offsets: &BTreeMap<PartitionId, i64>) -> Result<(), BrokerError> {
        let mut state = self.handle.0.lock().unwrap();
        state.commit_requests.push(offsets.clone());
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::RequestTimedOut).into());
        }

        state.commit_calls += 1;
        for (partition, offset) in offsets {
            let entry = state.committed.entry(partition.clone()).or_insert(*offset);
            assert!(*offset >= *entry, "commit moved backwards for {}", partition);
            *entry = *offset;
        }
        Ok(())
    }

    async fn pause(&mut self, partition: &PartitionId) -> Result<(), BrokerError> {
        let mut state = self.handle.0.lock().unwrap();
        state.pause_calls += 1;
        state.paused.insert(partition.clone());
        Ok(())
    }

    async fn resume(&mut self, partition: &PartitionId) -> Result<(), BrokerError> {
        self.handle.0.lock().unwrap().paused.remove(partition);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BrokerError> {
        self.handle.0.lock().unwrap().closed = true;
        Ok(())
    }
}

// ==================== Sink ====================

#[derive(Debug, Clone, PartialEq)]
pub enum SinkCall {
    Upsert { table: String, key: RowImage },
    Delete { table: String, key: RowImage },
}

enum Fault {
    Times(usize, ApplyError),
    Always(ApplyError),
}

/// `MemorySink` with scripted failures per key and a log of successful writes
pub struct FaultySink {
    pub inner: MemorySink,
    faults: Mutex<HashMap<String, Fault>>,
    calls: Mutex<Vec<SinkCall>>,
    attempts: Mutex<HashMap<String, usize>>,
    delay: Duration,
}

impl FaultySink {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            inner: MemorySink::new(),
            faults: Mutex::new(HashMap::new()),
            calls: Mutex::new(Vec::new()),
            attempts: Mutex::new(HashMap::new()),
            delay,
        }
    }

    fn fingerprint(key: &RowImage) -> String {
        Value::Object(key.clone()).to_string()
    }

    pub fn fail_times(&self, key: Value, times: usize, error: ApplyError) {
        self.faults
            .lock()
            .unwrap()
            .insert(Self::fingerprint(&row(key)), Fault::Times(times, error));
    }

    pub fn fail_always(&self, key: Value, error: ApplyError) {
        self.faults
            .lock()
            .unwrap()
            .insert(Self::fingerprint(&row(key)), Fault::Always(error));
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn attempts(&self, key: Value) -> usize {
        *self
            .attempts
            .lock()
            .unwrap()
            .get(&Self::fingerprint(&row(key)))
            .unwrap_or(&0)
    }

    fn check(&self, key: &RowImage) -> Result<(), ApplyError> {
        let fingerprint = Self::fingerprint(key);
        *self
            .attempts
            .lock()
            .unwrap()
            .entry(fingerprint.clone())
            .or_default() += 1;

        let mut faults = self.faults.lock().unwrap();
        match faults.get_mut(&fingerprint) {
            Some(Fault::Always(error)) => Err(error.clone()),
            Some(Fault::Times(remaining, error)) if *remaining > 0 => {
                *remaining -= 1;
                Err(error.clone())
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl SinkStore for FaultySink {
    async fn upsert(&self, table: &str, key: &RowImage, row: &RowImage) -> Result<(), ApplyError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.check(key)?;
        self.inner.upsert(table, key, row).await?;
        self.calls.lock().unwrap().push(SinkCall::Upsert {
            table: table.to_string(),
            key: key.clone(),
        });
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowImage) -> Result<(), ApplyError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.check(key)?;
        self.inner.delete(table, key).await?;
        self.calls.lock().unwrap().push(SinkCall::Delete {
            table: table.to_string(),
            key: key.clone(),
        });
        Ok(())
    }
}

// ==================== Dead letter ====================

#[derive(Default)]
pub struct MemoryDeadLetter {
    records: Mutex<Vec<DeadLetterRecord>>,
    failing: bool,
}

impl MemoryDeadLetter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A dead-letter output that rejects every write
    pub fn failing() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            failing: true,
        }
    }

    pub fn records(&self) -> Vec<DeadLetterRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetter {
    async fn record(&self, record: &DeadLetterRecord) -> Result<(), DeadLetterError> {
        if self.failing {
            return Err(DeadLetterError::Kafka("dead-letter topic unavailable".into()));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}
