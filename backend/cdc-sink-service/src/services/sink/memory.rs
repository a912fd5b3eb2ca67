use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

use super::SinkStore;
use crate::error::ApplyError;
use crate::services::cdc::RowImage;

type Table = BTreeMap<String, RowImage>;

/// In-process sink with the same keyed semantics as the Postgres sink.
///
/// Rows are indexed by the canonical JSON rendering of their key.
#[derive(Default)]
pub struct MemorySink {
    tables: RwLock<HashMap<String, Table>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, table: &str, key: &RowImage) -> Option<RowImage> {
        let tables = self.tables.read().await;
        tables.get(table)?.get(&fingerprint(key)).cloned()
    }

    pub async fn row_count(&self, table: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(table).map(BTreeMap::len).unwrap_or(0)
    }

    /// Rows of a table in key order
    pub async fn rows(&self, table: &str) -> Vec<RowImage> {
        let tables = self.tables.read().await;
        tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }
}

fn fingerprint(key: &RowImage) -> String {
    Value::Object(key.clone()).to_string()
}

#[async_trait]
impl SinkStore for MemorySink {
    async fn upsert(&self, table: &str, key: &RowImage, row: &RowImage) -> Result<(), ApplyError> {
        let mut tables = self.tables.write().await;
        let existing = tables
            .entry(table.to_string())
            .or_default()
            .entry(fingerprint(key))
            .or_default();

        for (column, value) in row {
            existing.insert(column.clone(), value.clone());
        }
        Ok(())
    }

    async fn delete(&self, table: &str, key: &RowImage) -> Result<(), ApplyError> {
        let mut tables = self.tables.write().await;
        if let Some(rows) = tables.get_mut(table) {
            rows.remove(&fingerprint(key));
        }
        Ok(())
    }
}
