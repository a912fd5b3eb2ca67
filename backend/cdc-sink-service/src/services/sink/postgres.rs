//! PostgreSQL sink
//!
//! Rows are written with `INSERT ... ON CONFLICT (key) DO UPDATE` and removed
//! with keyed `DELETE`s. Values travel as text parameters cast to the
//! column's own type, so any column type with a text input form works without
//! per-type encoding.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::SinkStore;
use crate::error::ApplyError;
use crate::services::cdc::RowImage;

/// PostgreSQL's identifier length limit (NAMEDATALEN - 1)
const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Clone)]
pub struct PostgresSinkConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    /// Deadline for the startup `SELECT 1`
    pub connect_timeout_secs: u64,
    /// Deadline for getting a connection out of the pool
    pub acquire_timeout_secs: u64,
    pub idle_timeout_secs: u64,
    pub max_lifetime_secs: u64,
}

impl fmt::Debug for PostgresSinkConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresSinkConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("acquire_timeout_secs", &self.acquire_timeout_secs)
            .field("idle_timeout_secs", &self.idle_timeout_secs)
            .field("max_lifetime_secs", &self.max_lifetime_secs)
            .finish()
    }
}

impl Default for PostgresSinkConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/cdc_sink".to_string(),
            max_connections: 10,
            min_connections: 1,
            connect_timeout_secs: 5,
            acquire_timeout_secs: 10,
            idle_timeout_secs: 600,
            max_lifetime_secs: 1800,
        }
    }
}

/// Create the sink pool and verify it answers within the connect timeout
pub async fn create_pool(config: &PostgresSinkConfig) -> Result<PgPool, sqlx::Error> {
    debug!(
        max = config.max_connections,
        min = config.min_connections,
        acquire_timeout_secs = config.acquire_timeout_secs,
        verify_timeout_secs = config.connect_timeout_secs,
        "Creating sink database pool"
    );

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .idle_timeout(Duration::from_secs(config.idle_timeout_secs))
        .max_lifetime(Duration::from_secs(config.max_lifetime_secs))
        .test_before_acquire(true)
        .connect(&config.database_url)
        .await?;

    match tokio::time::timeout(
        Duration::from_secs(config.connect_timeout_secs),
        sqlx::query("SELECT 1").execute(&pool),
    )
    .await
    {
        Ok(Ok(_)) => {
            info!("Sink database pool created and verified");
            Ok(pool)
        }
        Ok(Err(e)) => {
            error!(error = %e, "Sink database verification failed");
            Err(e)
        }
        Err(_) => {
            error!(
                timeout_secs = config.connect_timeout_secs,
                "Sink database verification timeout"
            );
            Err(sqlx::Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "Sink database verification timeout",
            )))
        }
    }
}

/// Column name to Postgres type name (`information_schema.columns.udt_name`)
type ColumnTypes = HashMap<String, String>;

/// Parameterized statement; `params[i]` binds to `$i+1`
#[derive(Debug, Clone, PartialEq, Eq)]
struct Statement {
    sql: String,
    params: Vec<String>,
}

/// Accumulates typed placeholders while a statement is built
struct Placeholders<'a> {
    types: &'a ColumnTypes,
    table: &'a str,
    params: Vec<String>,
}

impl<'a> Placeholders<'a> {
    fn new(table: &'a str, types: &'a ColumnTypes) -> Self {
        Self {
            types,
            table,
            params: Vec::new(),
        }
    }

    /// SQL expression for `value` stored in `column`
    fn push(&mut self, column: &str, value: &Value) -> Result<String, ApplyError> {
        let udt = self.types.get(column).ok_or_else(|| {
            ApplyError::Permanent(format!(
                "Unknown column '{}' in table '{}'",
                column, self.table
            ))
        })?;

        match text_value(value) {
            None => Ok("NULL".to_string()),
            Some(text) => {
                self.params.push(text);
                Ok(format!("${}::{}", self.params.len(), quote_ident(udt)?))
            }
        }
    }
}

/// Text form of a JSON value, `None` for SQL NULL
fn text_value(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::Array(_) | Value::Object(_) => Some(value.to_string()),
    }
}

/// Validate and double-quote an identifier
fn quote_ident(name: &str) -> Result<String, ApplyError> {
    let mut chars = name.chars();
    let valid_start = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_');
    let valid_rest = chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$');

    if !valid_start || !valid_rest || name.len() > MAX_IDENTIFIER_LEN {
        return Err(ApplyError::Permanent(format!(
            "Invalid SQL identifier '{}'",
            name
        )));
    }

    Ok(format!("\"{}\"", name))
}

fn build_upsert(
    table: &str,
    key: &RowImage,
    row: &RowImage,
    types: &ColumnTypes,
) -> Result<Statement, ApplyError> {
    let mut placeholders = Placeholders::new(table, types);
    let mut columns = Vec::with_capacity(row.len());
    let mut values = Vec::with_capacity(row.len());

    // Key columns first so the conflict target is always written
    let key_entries = key.iter().filter(|(column, _)| !row.contains_key(*column));
    for (column, value) in key_entries.chain(row.iter()) {
        columns.push(quote_ident(column)?);
        values.push(placeholders.push(column, value)?);
    }

    let conflict = key
        .keys()
        .map(|column| quote_ident(column))
        .collect::<Result<Vec<_>, _>>()?;

    let updates = row
        .keys()
        .filter(|column| !key.contains_key(*column))
        .map(|column| quote_ident(column).map(|q| format!("{q} = EXCLUDED.{q}")))
        .collect::<Result<Vec<_>, _>>()?;

    let action = if updates.is_empty() {
        "DO NOTHING".to_string()
    } else {
        format!("DO UPDATE SET {}", updates.join(", "))
    };

    Ok(Statement {
        sql: format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT ({}) {}",
            quote_ident(table)?,
            columns.join(", "),
            values.join(", "),
            conflict.join(", "),
            action
        ),
        params: placeholders.params,
    })
}

fn build_delete(table: &str, key: &RowImage, types: &ColumnTypes) -> Result<Statement, ApplyError> {
    if key.is_empty() {
        return Err(ApplyError::Permanent(format!(
            "Delete from '{}' without key columns",
            table
        )));
    }

    let mut placeholders = Placeholders::new(table, types);
    let mut predicates = Vec::with_capacity(key.len());

    for (column, value) in key {
        let expr = placeholders.push(column, value)?;
        predicates.push(format!("{} = {}", quote_ident(column)?, expr));
    }

    Ok(Statement {
        sql: format!(
            "DELETE FROM {} WHERE {}",
            quote_ident(table)?,
            predicates.join(" AND ")
        ),
        params: placeholders.params,
    })
}

/// SQLSTATEs worth retrying: connection exceptions (08), insufficient
/// resources (53), operator intervention (57), serialization failure and
/// deadlock.
fn is_transient_sqlstate(code: &str) -> bool {
    code.starts_with("08")
        || code.starts_with("53")
        || code.starts_with("57")
        || code == "40001"
        || code == "40P01"
}

fn classify_sqlx_error(err: sqlx::Error) -> ApplyError {
    match &err {
        sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::Protocol(_)
        | sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::WorkerCrashed => ApplyError::Transient(err.to_string()),
        sqlx::Error::Database(db) => match db.code() {
            Some(code) if is_transient_sqlstate(&code) => ApplyError::Transient(err.to_string()),
            _ => ApplyError::Permanent(err.to_string()),
        },
        _ => ApplyError::Permanent(err.to_string()),
    }
}

/// Whether an error means the cached column types are stale
/// (undefined table or column)
fn is_schema_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => {
            matches!(db.code().as_deref(), Some("42P01") | Some("42703"))
        }
        _ => false,
    }
}

pub struct PostgresSink {
    pool: PgPool,
    columns: DashMap<String, Arc<ColumnTypes>>,
}

impl PostgresSink {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            columns: DashMap::new(),
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn column_types(&self, table: &str) -> Result<Arc<ColumnTypes>, ApplyError> {
        if let Some(types) = self.columns.get(table) {
            return Ok(Arc::clone(types.value()));
        }

        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT column_name::text, udt_name::text \
             FROM information_schema.columns \
             WHERE table_schema = current_schema() AND table_name = $1",
        )
        .bind(table)
        .fetch_all(&self.pool)
        .await
        .map_err(classify_sqlx_error)?;

        if rows.is_empty() {
            return Err(ApplyError::Permanent(format!(
                "Table '{}' does not exist in the sink schema",
                table
            )));
        }

        let types: Arc<ColumnTypes> = Arc::new(rows.into_iter().collect());
        debug!(table, columns = types.len(), "Loaded sink column types");
        self.columns.insert(table.to_string(), Arc::clone(&types));
        Ok(types)
    }

    async fn execute(&self, table: &str, statement: Statement) -> Result<(), ApplyError> {
        let mut query = sqlx::query(&statement.sql);
        for param in &statement.params {
            query = query.bind(param.as_str());
        }

        match query.execute(&self.pool).await {
            Ok(_) => Ok(()),
            Err(e) => {
                if is_schema_error(&e) {
                    warn!(table, error = %e, "Sink schema changed, dropping cached column types");
                    self.columns.remove(table);
                }
                Err(classify_sqlx_error(e))
            }
        }
    }
}

#[async_trait]
impl SinkStore for PostgresSink {
    async fn upsert(&self, table: &str, key: &RowImage, row: &RowImage) -> Result<(), ApplyError> {
        let types = self.column_types(table).await?;
        let statement = build_upsert(table, key, row, &types)?;
        self.execute(table, statement).await
    }

    async fn delete(&self, table: &str, key: &RowImage) -> Result<(), ApplyError> {
        let types = self.column_types(table).await?;
        let statement = build_delete(table, key, &types)?;
        self.execute(table, statement).await
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("Sink database pool closed");
    }
}
