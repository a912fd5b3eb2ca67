use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::models::{ChangeEvent, Mutation, MutationKind, Operation, RowImage, TableTarget};
use crate::error::ClassifyError;

/// Key column used when a table has no explicit configuration
pub const DEFAULT_KEY_COLUMN: &str = "id";

/// Turn a change event into the mutation to apply, if any.
///
/// `Ok(None)` covers expected traffic that needs no write: unknown operations
/// and events without the image their operation requires.
pub fn classify(
    event: &ChangeEvent,
    target: &TableTarget,
) -> Result<Option<Mutation>, ClassifyError> {
    match &event.operation {
        Operation::Create | Operation::Update | Operation::Read => match &event.after {
            Some(after) => Ok(Some(Mutation {
                table: target.table.clone(),
                kind: MutationKind::Upsert,
                key: project_key(after, target)?,
                row: Some(after.clone()),
            })),
            None => Ok(None),
        },
        Operation::Delete => match &event.before {
            Some(before) => Ok(Some(Mutation {
                table: target.table.clone(),
                kind: MutationKind::Delete,
                key: project_key(before, target)?,
                row: None,
            })),
            None => Ok(None),
        },
        Operation::Unknown(_) => Ok(None),
    }
}

/// Primary-key projection of a row image
pub fn project_key(image: &RowImage, target: &TableTarget) -> Result<RowImage, ClassifyError> {
    let mut key = RowImage::new();

    for column in &target.key_columns {
        match image.get(column) {
            Some(value) if !value.is_null() => {
                key.insert(column.clone(), value.clone());
            }
            _ => {
                return Err(ClassifyError::MissingKey {
                    table: target.table.clone(),
                    column: column.clone(),
                })
            }
        }
    }

    Ok(key)
}

/// Table name for a topic: its last dot-separated segment.
///
/// `dbserver1.public.customers` routes to `customers`.
pub fn table_name_for_topic(topic: &str) -> &str {
    match topic.trim_end_matches('.').rsplit('.').next() {
        Some(name) if !name.is_empty() => name,
        _ => "unknown",
    }
}

/// Resolves and caches the table target of each topic
pub struct TableResolver {
    key_columns: HashMap<String, Vec<String>>,
    default_key: Vec<String>,
    cache: DashMap<String, Arc<TableTarget>>,
}

impl TableResolver {
    pub fn new(key_columns: HashMap<String, Vec<String>>, default_key: Vec<String>) -> Self {
        let default_key = if default_key.is_empty() {
            vec![DEFAULT_KEY_COLUMN.to_string()]
        } else {
            default_key
        };

        Self {
            key_columns,
            default_key,
            cache: DashMap::new(),
        }
    }

    pub fn resolve(&self, topic: &str) -> Arc<TableTarget> {
        if let Some(target) = self.cache.get(topic) {
            return Arc::clone(target.value());
        }

        let table = table_name_for_topic(topic);
        let key_columns = self
            .key_columns
            .get(table)
            .cloned()
            .unwrap_or_else(|| self.default_key.clone());

        debug!(topic, table, ?key_columns, "Resolved table target");

        let target = Arc::new(TableTarget {
            table: table.to_string(),
            key_columns,
        });

        Arc::clone(
            self.cache
                .entry(topic.to_string())
                .or_insert(target)
                .value(),
        )
    }
}

impl Default for TableResolver {
    fn default() -> Self {
        Self::new(HashMap::new(), Vec::new())
    }
}
