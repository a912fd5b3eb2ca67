/// PostgreSQL sink tests
///
/// Run with: cargo test --test postgres_sink_test -- --ignored
use cdc_sink_service::error::ApplyError;
use cdc_sink_service::services::cdc::RowImage;
use cdc_sink_service::services::sink::{create_pool, PostgresSinkConfig};
use cdc_sink_service::services::{PostgresSink, SinkStore};
use serde_json::{json, Value};
use serial_test::serial;
use sqlx::PgPool;

fn row(value: Value) -> RowImage {
    value.as_object().cloned().unwrap()
}

async fn setup_sink() -> PostgresSink {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgresql://localhost/cdc_sink_test".to_string());

    let pool = create_pool(&PostgresSinkConfig {
        database_url,
        ..Default::default()
    })
    .await
    .expect("Failed to connect to test database");

    sqlx::query("DROP TABLE IF EXISTS cdc_test_customers")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query(
        "CREATE TABLE cdc_test_customers (
            id INTEGER PRIMARY KEY,
            name TEXT,
            active BOOLEAN,
            meta JSONB
        )",
    )
    .execute(&pool)
    .await
    .unwrap();

    PostgresSink::new(pool)
}

async fn fetch(pool: &PgPool, id: i32) -> Option<(String, Option<bool>)> {
    sqlx::query_as("SELECT name, active FROM cdc_test_customers WHERE id = $1")
        .bind(id)
        .fetch_optional(pool)
        .await
        .unwrap()
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_upsert_is_idempotent_and_overwrites() {
    let sink = setup_sink().await;
    let key = row(json!({"id": 1}));

    let first = row(json!({"id": 1, "name": "Ann", "active": true, "meta": {"tier": "gold"}}));
    sink.upsert("cdc_test_customers", &key, &first).await.unwrap();
    sink.upsert("cdc_test_customers", &key, &first).await.unwrap();

    let second = row(json!({"id": 1, "name": "Anne", "active": null}));
    sink.upsert("cdc_test_customers", &key, &second).await.unwrap();

    assert_eq!(fetch(sink.pool(), 1).await, Some(("Anne".to_string(), None)));

    let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cdc_test_customers")
        .fetch_one(sink.pool())
        .await
        .unwrap();
    assert_eq!(count.0, 1);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_delete_missing_row_succeeds() {
    let sink = setup_sink().await;
    let key = row(json!({"id": 2}));

    sink.delete("cdc_test_customers", &key).await.unwrap();
    sink.upsert("cdc_test_customers", &key, &row(json!({"id": 2, "name": "Bob"})))
        .await
        .unwrap();
    sink.delete("cdc_test_customers", &key).await.unwrap();

    assert_eq!(fetch(sink.pool(), 2).await, None);
}

#[tokio::test]
#[ignore] // Requires database
#[serial]
async fn test_schema_mismatches_are_permanent() {
    let sink = setup_sink().await;
    let key = row(json!({"id": 3}));

    let unknown_column = sink
        .upsert("cdc_test_customers", &key, &row(json!({"id": 3, "nickname": "x"})))
        .await
        .unwrap_err();
    assert!(matches!(unknown_column, ApplyError::Permanent(_)));

    let bad_type = sink
        .upsert("cdc_test_customers", &key, &row(json!({"id": 3, "active": "maybe"})))
        .await
        .unwrap_err();
    assert!(matches!(bad_type, ApplyError::Permanent(_)));

    let missing_table = sink
        .delete("cdc_test_no_such_table", &key)
        .await
        .unwrap_err();
    assert!(matches!(missing_table, ApplyError::Permanent(_)));
}
