use serde_json::{Map, Value};
use std::fmt;

/// Column name to typed value mapping for one row
pub type RowImage = Map<String, Value>;

/// Identity of a topic-partition
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId {
    pub topic: String,
    pub partition: i32,
}

impl PartitionId {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]", self.topic, self.partition)
    }
}

/// Message as delivered by the broker, before any interpretation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    pub key: Option<Vec<u8>>,
    /// `None` for Kafka tombstones
    pub value: Option<Vec<u8>>,
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

impl RawMessage {
    pub fn partition_id(&self) -> PartitionId {
        PartitionId::new(self.topic.clone(), self.partition)
    }
}

/// CDC operation types from Debezium
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    /// c = create
    Create,
    /// u = update
    Update,
    /// d = delete
    Delete,
    /// r = read (initial snapshot)
    Read,
    /// Any other op code, e.g. `t` (truncate) or codes added by newer connectors
    Unknown(String),
}

impl Operation {
    pub fn from_code(code: &str) -> Self {
        match code {
            "c" => Operation::Create,
            "u" => Operation::Update,
            "d" => Operation::Delete,
            "r" => Operation::Read,
            other => Operation::Unknown(other.to_string()),
        }
    }
}

/// Normalized CDC record decoded from one raw message
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub operation: Operation,
    /// State before the change (populated for Update/Delete)
    pub before: Option<RowImage>,
    /// State after the change (populated for Create/Update/Read)
    pub after: Option<RowImage>,
    pub source_topic: String,
    pub source_offset: i64,
    /// Transaction timestamp in milliseconds since epoch, when the envelope has one
    pub ts_ms: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationKind {
    Upsert,
    Delete,
}

/// Actionable sink instruction derived from a change event
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    pub table: String,
    pub kind: MutationKind,
    /// Primary-key columns only
    pub key: RowImage,
    /// Full row for upserts
    pub row: Option<RowImage>,
}

impl Mutation {
    /// Canonical rendering of the primary key, equal for equal keys
    pub fn key_fingerprint(&self) -> String {
        Value::Object(self.key.clone()).to_string()
    }
}

/// Sink table a topic routes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableTarget {
    pub table: String,
    pub key_columns: Vec<String>,
}
