// ABOUTME: Integration tests against live master and local PostgreSQL databases
// ABOUTME: Ignored by default; set TEST_MASTER_URL and TEST_LOCAL_URL to run

use std::env;
use std::sync::Arc;
use std::time::Duration;

use replica_sync::postgres::{ConnectionPool, PgStore};
use replica_sync::sync::{ConnectionManager, Deadlines};
use replica_sync::{
    DatabaseConfig, PendingQueue, Row, Store, SyncConfig, SyncEngine, WritePath,
};
use serde_json::{json, Value};

/// Helper to get test database URLs from environment
fn get_test_urls() -> Option<(String, String)> {
    let master = env::var("TEST_MASTER_URL").ok()?;
    let local = env::var("TEST_LOCAL_URL").ok()?;
    Some((master, local))
}

fn row(value: Value) -> Row {
    serde_json::from_value(value).unwrap()
}

fn pg_store(label: &str, url: &str) -> PgStore {
    let config = DatabaseConfig::from_url(url).expect("invalid test database URL");
    let pool = ConnectionPool::new(label, config, Duration::from_secs(5)).unwrap();
    PgStore::new(pool, "public")
}

/// Create the test table in one database, dropping any leftover copy
async fn setup_test_table(store: &PgStore, table: &str) {
    let ddl = format!(
        r#"
        DROP TABLE IF EXISTS "public"."{table}";
        CREATE TABLE "public"."{table}" (
            id TEXT PRIMARY KEY DEFAULT gen_random_uuid()::text,
            name TEXT,
            score INTEGER DEFAULT 0,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT now()
        )
        "#
    );
    let client = store.pool().get().await.expect("Failed to connect");
    client.batch_execute(&ddl).await.expect("Failed to create table");
}

async fn cleanup(master: &PgStore, local: &PgStore, table: &str) {
    let ddl = format!(r#"DROP TABLE IF EXISTS "public"."{}" CASCADE"#, table);
    for store in [master, local] {
        if let Ok(client) = store.pool().get().await {
            let _ = client.batch_execute(&ddl).await;
        }
    }
    let _ = local
        .execute(
            "DELETE FROM pending_sync WHERE table_name = $1",
            &[json!(table)],
        )
        .await;
}

async fn setup(table: &str) -> (Arc<PgStore>, Arc<PgStore>, SyncEngine) {
    let (master_url, local_url) =
        get_test_urls().expect("TEST_MASTER_URL and TEST_LOCAL_URL must be set");
    let master = Arc::new(pg_store("master", &master_url));
    let local = Arc::new(pg_store("local", &local_url));

    setup_test_table(&master, table).await;
    setup_test_table(&local, table).await;
    local.ensure_schema().await.expect("Failed to create pending_sync");

    let connections = Arc::new(ConnectionManager::new(
        master.clone(),
        local.clone(),
        Deadlines::default(),
    ));
    let sync = SyncConfig {
        tables: vec![table.to_string()],
        page_size: 2,
        ..SyncConfig::default()
    };
    let engine = SyncEngine::new(connections, &sync).unwrap();
    assert!(engine.probe().await, "master must be reachable");
    (master, local, engine)
}

#[tokio::test]
#[ignore]
async fn test_online_write_uses_master_defaults_and_mirrors() {
    let table = "replica_sync_test_write";
    let (master, local, engine) = setup(table).await;

    let receipt = engine
        .write(table, row(json!({"name": "Ann"})))
        .await
        .unwrap();
    assert!(matches!(receipt.path, WritePath::Master { .. }));
    assert!(receipt.row["id"].is_string());
    assert_eq!(receipt.row["score"], json!(0));

    let filter = row(json!({"id": receipt.row["id"].clone()}));
    let mirrored = local.select(table, &filter).await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0]["name"], json!("Ann"));

    cleanup(&master, &local, table).await;
}

#[tokio::test]
#[ignore]
async fn test_online_update_returns_stored_row() {
    let table = "replica_sync_test_update";
    let (master, local, engine) = setup(table).await;

    let written = engine
        .write(table, row(json!({"id": "u1", "name": "Ann", "score": 3})))
        .await
        .unwrap();
    let receipt = engine
        .update(table, row(json!({"id": "u1", "name": "Anne"})))
        .await
        .unwrap();

    assert!(receipt.reached_master());
    assert_eq!(receipt.row["name"], json!("Anne"));
    assert_eq!(receipt.row["score"], json!(3));
    assert_eq!(receipt.row["updated_at"], written.row["updated_at"]);

    let mirrored = local.select(table, &row(json!({"id": "u1"}))).await.unwrap();
    assert_eq!(mirrored.len(), 1);
    assert_eq!(mirrored[0]["name"], json!("Anne"));
    assert_eq!(mirrored[0]["score"], json!(3));

    cleanup(&master, &local, table).await;
}

#[tokio::test]
#[ignore]
async fn test_queued_rows_hold_back_local_watermark() {
    let table = "replica_sync_test_watermark";
    let (master, local, engine) = setup(table).await;

    local
        .insert(table, &row(json!({"id": "queued", "updated_at": "2030-01-01T00:00:00Z"})))
        .await
        .unwrap();
    local
        .enqueue(&replica_sync::store::NewPendingOperation {
            table_name: table.to_string(),
            operation: replica_sync::Operation::Insert,
            data: row(json!({"id": "queued"})),
        })
        .await
        .unwrap();
    assert_eq!(local.sync_watermark(table).await.unwrap(), None);
    assert!(local.unsynced_ids(table).await.unwrap().contains("queued"));

    master
        .insert(table, &row(json!({"id": "m1", "name": "Mo"})))
        .await
        .unwrap();
    assert_eq!(engine.sync_table(table).await.unwrap(), 1);

    cleanup(&master, &local, table).await;
}

#[tokio::test]
#[ignore]
async fn test_pull_pages_through_master_changes() {
    let table = "replica_sync_test_pull";
    let (master, local, engine) = setup(table).await;

    for i in 0..5 {
        master
            .insert(table, &row(json!({"id": format!("r{}", i), "name": "x"})))
            .await
            .unwrap();
    }

    assert_eq!(engine.sync_table(table).await.unwrap(), 5);
    assert_eq!(engine.sync_table(table).await.unwrap(), 0);
    assert_eq!(local.select(table, &Row::new()).await.unwrap().len(), 5);
    assert_eq!(
        local.watermark(table).await.unwrap(),
        master.watermark(table).await.unwrap()
    );

    cleanup(&master, &local, table).await;
}

#[tokio::test]
#[ignore]
async fn test_queued_writes_replay_in_order() {
    let table = "replica_sync_test_replay";
    let (master, local, engine) = setup(table).await;

    let pending = [
        (replica_sync::Operation::Insert, json!({"id": "a", "name": "first"})),
        (replica_sync::Operation::Update, json!({"id": "a", "name": "second"})),
        (replica_sync::Operation::Update, json!({"id": "missing", "name": "x"})),
    ];
    for (operation, data) in pending {
        local
            .enqueue(&replica_sync::store::NewPendingOperation {
                table_name: table.to_string(),
                operation,
                data: row(data),
            })
            .await
            .unwrap();
    }

    let stats = engine.replay_pending().await.unwrap();
    assert_eq!(stats.applied, 2);
    assert_eq!(stats.failed, 1);

    let rows = master.select(table, &row(json!({"id": "a"}))).await.unwrap();
    assert_eq!(rows[0]["name"], json!("second"));

    cleanup(&master, &local, table).await;
}

#[tokio::test]
#[ignore]
async fn test_raw_query_routes_by_flag() {
    let table = "replica_sync_test_query";
    let (master, local, engine) = setup(table).await;
    master
        .insert(table, &row(json!({"id": "m", "score": 7})))
        .await
        .unwrap();

    let sql = format!(r#"SELECT id, score FROM "public"."{}" WHERE score = $1"#, table);
    let from_master = engine.query(&sql, &[json!(7)], true).await.unwrap();
    assert_eq!(from_master.rows.len(), 1);
    assert_eq!(from_master.rows[0]["score"], json!(7));

    let from_local = engine.query(&sql, &[json!(7)], false).await.unwrap();
    assert!(from_local.rows.is_empty());

    cleanup(&master, &local, table).await;
}
