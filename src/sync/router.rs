// ABOUTME: WriteRouter - master-first writes with a local fallback plus pending queue
// ABOUTME: Reads are always served from the local store

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use super::{ConnectionManager, TableRegistry};
use crate::error::{SyncError, SyncResult};
use crate::row::{self, Row, ID_COLUMN, UPDATED_AT_COLUMN};
use crate::store::{NewPendingOperation, Operation, PendingQueue, QueryResult, Store};

/// Outcome of mirroring a master write into the local store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorStatus {
    Mirrored,
    /// The local copy will catch up on the next pull.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WritePath {
    /// Applied on the master, then mirrored locally.
    Master { mirror: MirrorStatus },
    /// Applied locally and queued for replay.
    LocalOnly { pending_id: i64, reason: String },
}

/// Result of a routed write: the stored row and where it went.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteReceipt {
    pub row: Row,
    pub path: WritePath,
}

impl WriteReceipt {
    pub fn reached_master(&self) -> bool {
        matches!(self.path, WritePath::Master { .. })
    }

    pub fn pending_id(&self) -> Option<i64> {
        match self.path {
            WritePath::LocalOnly { pending_id, .. } => Some(pending_id),
            WritePath::Master { .. } => None,
        }
    }
}

/// Routes application writes and reads between the two tiers.
///
/// A write never fails because the master is unavailable: it degrades to
/// a local write plus a `pending_sync` record. Errors from the local store
/// itself are returned to the caller.
pub struct WriteRouter {
    connections: Arc<ConnectionManager>,
    tables: Arc<TableRegistry>,
}

impl WriteRouter {
    pub fn new(connections: Arc<ConnectionManager>, tables: Arc<TableRegistry>) -> Self {
        Self {
            connections,
            tables,
        }
    }

    /// Insert a row. Returns the stored row including generated columns.
    pub async fn write(&self, table: &str, data: Row) -> SyncResult<WriteReceipt> {
        self.route(table, Operation::Insert, data).await
    }

    pub async fn upsert(&self, table: &str, data: Row) -> SyncResult<WriteReceipt> {
        self.route(table, Operation::Upsert, data).await
    }

    /// Update the row identified by `data.id`, setting the other given columns.
    pub async fn update(&self, table: &str, data: Row) -> SyncResult<WriteReceipt> {
        require_id(table, &data)?;
        self.route(table, Operation::Update, data).await
    }

    pub async fn delete(&self, table: &str, id: Value) -> SyncResult<WriteReceipt> {
        let mut key = Row::new();
        key.insert(ID_COLUMN.to_string(), id);
        require_id(table, &key)?;
        self.route(table, Operation::Delete, key).await
    }

    /// Equality-filtered read from the local store.
    pub async fn read(&self, table: &str, filter: &Row) -> SyncResult<Vec<Row>> {
        let table = self.tables.require(table)?;
        self.connections
            .on_local("local read", self.connections.local().select(table, filter))
            .await
    }

    /// Raw statement. Runs on the master only when asked to and online;
    /// a connectivity failure there falls back to the local store.
    pub async fn query(&self, sql: &str, params: &[Value], use_master: bool) -> SyncResult<QueryResult> {
        if use_master && self.connections.is_online() {
            let result = self
                .connections
                .on_master(
                    "master query",
                    self.connections.deadlines().statement,
                    self.connections.master().execute(sql, params),
                )
                .await;
            match result {
                Err(e) if e.is_connectivity() => {
                    tracing::warn!("Master query failed, running against local store: {}", e);
                }
                other => return other,
            }
        }
        self.connections
            .on_local("local query", self.connections.local().execute(sql, params))
            .await
    }

    async fn route(&self, table: &str, operation: Operation, data: Row) -> SyncResult<WriteReceipt> {
        let table = self.tables.require(table)?;

        let reason = if self.connections.is_online() {
            match self.apply_to_master(table, operation, &data).await {
                Ok(stored) => {
                    let mirror = self.mirror(table, operation, &stored).await;
                    return Ok(WriteReceipt {
                        row: stored,
                        path: WritePath::Master { mirror },
                    });
                }
                Err(e) => {
                    tracing::warn!(
                        "Master {} on {} failed, writing locally: {}",
                        operation,
                        table,
                        e
                    );
                    e.to_string()
                }
            }
        } else {
            "master offline".to_string()
        };

        self.write_local(table, operation, data, reason).await
    }

    async fn apply_to_master(&self, table: &str, operation: Operation, data: &Row) -> SyncResult<Row> {
        let master = self.connections.master();
        let timeout = self.connections.deadlines().statement;
        let label = format!("master {} on {}", operation, table);

        match operation {
            Operation::Insert => {
                self.connections
                    .on_master(&label, timeout, master.insert(table, data))
                    .await
            }
            Operation::Upsert => {
                self.connections
                    .on_master(&label, timeout, master.upsert(table, data))
                    .await
            }
            Operation::Update => self
                .connections
                .on_master(&label, timeout, master.update(table, data))
                .await?
                // The row may still be waiting in the queue; keep ordering behind it.
                .ok_or_else(|| not_on_master(table, data)),
            Operation::Delete => {
                let id = require_id(table, data)?;
                let removed = self
                    .connections
                    .on_master(&label, timeout, master.delete(table, id))
                    .await?;
                if removed == 0 {
                    return Err(not_on_master(table, data));
                }
                Ok(data.clone())
            }
        }
    }

    async fn mirror(&self, table: &str, operation: Operation, stored: &Row) -> MirrorStatus {
        let local = self.connections.local();
        let result = match operation {
            Operation::Insert | Operation::Upsert | Operation::Update => self
                .connections
                .on_local("mirror write", local.upsert(table, stored))
                .await
                .map(|_| ()),
            Operation::Delete => match row::row_id(stored) {
                Some(id) => self
                    .connections
                    .on_local("mirror write", local.delete(table, id))
                    .await
                    .map(|_| ()),
                None => Ok(()),
            },
        };

        match result {
            Ok(()) => MirrorStatus::Mirrored,
            Err(e) => {
                tracing::warn!(
                    "Failed to mirror {} on {} into local store: {}",
                    operation,
                    table,
                    e
                );
                MirrorStatus::Failed(e.to_string())
            }
        }
    }

    async fn write_local(
        &self,
        table: &str,
        operation: Operation,
        mut data: Row,
        reason: String,
    ) -> SyncResult<WriteReceipt> {
        let local = self.connections.local();
        let now = Utc::now();

        let stored = match operation {
            Operation::Insert => {
                row::stamp_local_row(&mut data, now);
                self.connections
                    .on_local("local insert", local.insert(table, &data))
                    .await?
            }
            Operation::Upsert => {
                row::stamp_local_row(&mut data, now);
                self.connections
                    .on_local("local upsert", local.upsert(table, &data))
                    .await?
            }
            Operation::Update => {
                if data.get(UPDATED_AT_COLUMN).map_or(true, Value::is_null) {
                    data.insert(
                        UPDATED_AT_COLUMN.to_string(),
                        Value::String(now.to_rfc3339()),
                    );
                }
                match self
                    .connections
                    .on_local("local update", local.update(table, &data))
                    .await?
                {
                    Some(stored) => stored,
                    None => {
                        tracing::debug!(
                            "Row {} not present locally, queueing update for master only",
                            describe_id(&data)
                        );
                        data.clone()
                    }
                }
            }
            Operation::Delete => {
                let id = require_id(table, &data)?;
                self.connections
                    .on_local("local delete", local.delete(table, id))
                    .await?;
                data.clone()
            }
        };

        let pending = NewPendingOperation {
            table_name: table.to_string(),
            operation,
            data,
        };
        let pending_id = self
            .connections
            .on_local("enqueue pending operation", local.enqueue(&pending))
            .await?;

        tracing::info!(
            "Queued {} on {} (row {}) as pending operation {}",
            operation,
            table,
            describe_id(&pending.data),
            pending_id
        );

        Ok(WriteReceipt {
            row: stored,
            path: WritePath::LocalOnly { pending_id, reason },
        })
    }
}

fn require_id<'a>(table: &str, data: &'a Row) -> SyncResult<&'a Value> {
    row::row_id(data).ok_or_else(|| {
        SyncError::InvalidRow(format!("write to {} requires an id", table))
    })
}

fn not_on_master(table: &str, data: &Row) -> SyncError {
    SyncError::NotFound(format!(
        "row {} not found in {} on master",
        describe_id(data),
        table
    ))
}

fn describe_id(data: &Row) -> String {
    row::row_id(data)
        .map(row::id_key)
        .unwrap_or_else(|| "<no id>".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::Deadlines;
    use serde_json::json;

    fn row(value: Value) -> Row {
        row::row_from_value(value).unwrap()
    }

    struct Fixture {
        master: Arc<MemoryStore>,
        local: Arc<MemoryStore>,
        connections: Arc<ConnectionManager>,
        router: WriteRouter,
    }

    async fn fixture(online: bool) -> Fixture {
        let master = Arc::new(MemoryStore::with_tables("master", &["users"]));
        let local = Arc::new(MemoryStore::with_tables("local", &["users"]));
        let connections = Arc::new(ConnectionManager::new(
            master.clone(),
            local.clone(),
            Deadlines::default(),
        ));
        if online {
            assert!(connections.probe().await);
        }
        let tables = Arc::new(TableRegistry::new(["users"]).unwrap());
        let router = WriteRouter::new(connections.clone(), tables);
        Fixture {
            master,
            local,
            connections,
            router,
        }
    }

    #[tokio::test]
    async fn test_online_write_goes_to_master_and_mirrors() {
        let f = fixture(true).await;
        let receipt = f
            .router
            .write("users", row(json!({"name": "Ann", "updated_at": "2024-01-01T00:00:00Z"})))
            .await
            .unwrap();

        assert_eq!(
            receipt.path,
            WritePath::Master {
                mirror: MirrorStatus::Mirrored
            }
        );
        assert!(receipt.row["id"].is_string());
        assert_eq!(f.master.rows("users").len(), 1);
        assert_eq!(f.local.rows("users"), f.master.rows("users"));
        assert!(f.local.pending_records().is_empty());
    }

    #[tokio::test]
    async fn test_offline_write_is_local_and_queued() {
        let f = fixture(false).await;
        let receipt = f
            .router
            .write("users", row(json!({"name": "Ann"})))
            .await
            .unwrap();

        let pending_id = receipt.pending_id().unwrap();
        assert!(receipt.row["id"].is_string());
        assert!(receipt.row["updated_at"].is_string());
        assert!(f.master.rows("users").is_empty());

        let record = f.local.get(pending_id).await.unwrap().unwrap();
        assert_eq!(record.operation, Operation::Insert);
        assert_eq!(record.data["id"], receipt.row["id"]);
        assert!(record.synced_at.is_none());
    }

    #[tokio::test]
    async fn test_master_failure_falls_back_and_flips_offline() {
        let f = fixture(true).await;
        f.master.set_reachable(false);

        let receipt = f
            .router
            .write("users", row(json!({"id": "u1", "name": "Ann"})))
            .await
            .unwrap();

        assert!(!receipt.reached_master());
        assert!(!f.connections.is_online());
        assert_eq!(f.local.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_mirror_failure_is_reported_not_raised() {
        let f = fixture(true).await;
        f.local.set_reachable(false);

        let receipt = f
            .router
            .write("users", row(json!({"id": "u1"})))
            .await
            .unwrap();
        assert!(matches!(
            receipt.path,
            WritePath::Master {
                mirror: MirrorStatus::Failed(_)
            }
        ));
        assert_eq!(f.master.rows("users").len(), 1);
    }

    #[tokio::test]
    async fn test_update_of_row_missing_on_master_is_queued() {
        let f = fixture(true).await;
        let receipt = f
            .router
            .update("users", row(json!({"id": "ghost", "name": "x"})))
            .await
            .unwrap();

        assert!(!receipt.reached_master());
        assert!(f.connections.is_online());
        let record = f.local.get(receipt.pending_id().unwrap()).await.unwrap().unwrap();
        assert_eq!(record.operation, Operation::Update);
        assert!(record.data["updated_at"].is_string());
    }

    #[tokio::test]
    async fn test_online_update_returns_and_mirrors_full_row() {
        let f = fixture(true).await;
        f.router
            .write("users", row(json!({"id": "u1", "name": "Ann", "team": "red"})))
            .await
            .unwrap();

        let receipt = f
            .router
            .update("users", row(json!({"id": "u1", "name": "Anne"})))
            .await
            .unwrap();

        assert!(receipt.reached_master());
        assert_eq!(receipt.row, row(json!({"id": "u1", "name": "Anne", "team": "red"})));
        assert_eq!(f.local.rows("users"), vec![receipt.row.clone()]);
        assert_eq!(f.master.rows("users"), vec![receipt.row]);
    }

    #[tokio::test]
    async fn test_offline_update_returns_full_local_row() {
        let f = fixture(true).await;
        f.router
            .write("users", row(json!({"id": "u1", "name": "Ann", "team": "red"})))
            .await
            .unwrap();
        f.master.set_reachable(false);

        let receipt = f
            .router
            .update("users", row(json!({"id": "u1", "name": "Anne"})))
            .await
            .unwrap();

        assert!(!receipt.reached_master());
        assert_eq!(receipt.row["team"], json!("red"));
        assert_eq!(receipt.row["name"], json!("Anne"));
    }

    #[tokio::test]
    async fn test_update_and_delete_require_id() {
        let f = fixture(true).await;
        assert!(matches!(
            f.router.update("users", row(json!({"name": "x"}))).await,
            Err(SyncError::InvalidRow(_))
        ));
        assert!(matches!(
            f.router.delete("users", Value::Null).await,
            Err(SyncError::InvalidRow(_))
        ));
    }

    #[tokio::test]
    async fn test_delete_online_removes_from_both_tiers() {
        let f = fixture(true).await;
        f.router
            .write("users", row(json!({"id": "u1"})))
            .await
            .unwrap();
        let receipt = f.router.delete("users", json!("u1")).await.unwrap();

        assert!(receipt.reached_master());
        assert!(f.master.rows("users").is_empty());
        assert!(f.local.rows("users").is_empty());
    }

    #[tokio::test]
    async fn test_read_is_always_local() {
        let f = fixture(true).await;
        f.master
            .insert("users", &row(json!({"id": "m1"})))
            .await
            .unwrap();
        let rows = f.router.read("users", &row(json!({"id": "m1"}))).await.unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn test_unknown_table_is_config_error() {
        let f = fixture(true).await;
        assert!(matches!(
            f.router.write("orders", Row::new()).await,
            Err(SyncError::Config(_))
        ));
        assert!(matches!(
            f.router.read("orders", &Row::new()).await,
            Err(SyncError::Config(_))
        ));
    }
}
