//! Sink application of mutations
//!
//! `SinkStore` is the storage seam; `SinkApplier` turns a `Mutation` into a
//! single store call under a write deadline.

mod memory;
mod postgres;

pub use memory::MemorySink;
pub use postgres::{create_pool, PostgresSink, PostgresSinkConfig};

use async_trait::async_trait;
use resilience::with_timeout;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::ApplyError;
use crate::services::cdc::{Mutation, MutationKind, RowImage};

/// Idempotent keyed storage
#[async_trait]
pub trait SinkStore: Send + Sync {
    /// Insert the row, or replace the written columns of the row with the same key
    async fn upsert(&self, table: &str, key: &RowImage, row: &RowImage) -> Result<(), ApplyError>;

    /// Remove the row with this key; a missing row is not an error
    async fn delete(&self, table: &str, key: &RowImage) -> Result<(), ApplyError>;

    /// Release connections
    async fn close(&self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Upserted,
    Deleted,
}

/// Applies mutations to a `SinkStore`, one write per call
#[derive(Clone)]
pub struct SinkApplier {
    store: Arc<dyn SinkStore>,
    write_timeout: Duration,
}

impl SinkApplier {
    pub fn new(store: Arc<dyn SinkStore>, write_timeout: Duration) -> Self {
        Self {
            store,
            write_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn SinkStore> {
        &self.store
    }

    pub async fn apply(&self, mutation: &Mutation) -> Result<Applied, ApplyError> {
        let write = async {
            match mutation.kind {
                MutationKind::Upsert => {
                    let row = mutation.row.as_ref().ok_or_else(|| {
                        ApplyError::Permanent(format!(
                            "upsert into '{}' carries no row",
                            mutation.table
                        ))
                    })?;
                    self.store.upsert(&mutation.table, &mutation.key, row).await?;
                    Ok(Applied::Upserted)
                }
                MutationKind::Delete => {
                    self.store.delete(&mutation.table, &mutation.key).await?;
                    Ok(Applied::Deleted)
                }
            }
        };

        let applied = with_timeout(self.write_timeout, write)
            .await
            .map_err(|e| ApplyError::Transient(e.to_string()))??;

        debug!(table = %mutation.table, ?applied, "Mutation applied");
        Ok(applied)
    }
}
