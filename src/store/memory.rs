// ABOUTME: In-process Store and PendingQueue backend
// ABOUTME: Used for tests and embedding; can simulate an unreachable server

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{
    ChangePage, NewPendingOperation, PendingOperation, PendingQueue, PullCursor, QueryResult,
    QueuePosition, QueueStatus, Store,
};
use crate::error::{SyncError, SyncResult};
use crate::row::{self, Row, ID_COLUMN};

/// A store held entirely in memory.
///
/// Tables must be created up front, like a real database. Rows are keyed by
/// the string form of their `id`. Flip [`MemoryStore::set_reachable`] to
/// make every call fail with a connectivity error, and use
/// [`MemoryStore::set_latency`] to delay every call.
pub struct MemoryStore {
    label: String,
    reachable: AtomicBool,
    latency_ms: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<String, BTreeMap<String, Row>>,
    pending: Vec<PendingOperation>,
    next_pending_id: i64,
}

impl MemoryStore {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            reachable: AtomicBool::new(true),
            latency_ms: AtomicU64::new(0),
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Create a store with the given (empty) tables.
    pub fn with_tables(label: impl Into<String>, tables: &[&str]) -> Self {
        let store = Self::new(label);
        for table in tables {
            store.create_table(table);
        }
        store
    }

    pub fn create_table(&self, table: &str) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }

    pub fn set_latency(&self, latency: Duration) {
        self.latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Snapshot of every row in a table, ordered by id.
    pub fn rows(&self, table: &str) -> Vec<Row> {
        self.lock()
            .tables
            .get(table)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// All pending records, synced or not, in creation order.
    pub fn pending_records(&self) -> Vec<PendingOperation> {
        self.lock().pending.clone()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn check(&self) -> SyncResult<()> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if !self.is_reachable() {
            return Err(SyncError::Connectivity(format!(
                "{} is unreachable",
                self.label
            )));
        }
        Ok(())
    }
}

impl Inner {
    fn table_mut(&mut self, table: &str) -> SyncResult<&mut BTreeMap<String, Row>> {
        self.tables
            .get_mut(table)
            .ok_or_else(|| SyncError::Config(format!("relation \"{}\" does not exist", table)))
    }

    fn table(&self, table: &str) -> SyncResult<&BTreeMap<String, Row>> {
        self.tables
            .get(table)
            .ok_or_else(|| SyncError::Config(format!("relation \"{}\" does not exist", table)))
    }

    fn unsynced_ids(&self, table: &str) -> HashSet<String> {
        self.pending
            .iter()
            .filter(|op| op.table_name == table && !op.is_synced())
            .filter_map(|op| row::row_id(&op.data).map(row::id_key))
            .collect()
    }
}

fn required_id(row: &Row) -> SyncResult<String> {
    row::row_id(row)
        .map(row::id_key)
        .ok_or_else(|| SyncError::InvalidRow("row has no id".to_string()))
}

/// Overwrite the columns present in `incoming`, keep the rest.
fn merge_into(existing: &mut Row, incoming: &Row) {
    for (column, value) in incoming {
        if column != ID_COLUMN {
            existing.insert(column.clone(), value.clone());
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    fn label(&self) -> &str {
        &self.label
    }

    async fn ping(&self) -> SyncResult<()> {
        self.check().await
    }

    async fn insert(&self, table: &str, row: &Row) -> SyncResult<Row> {
        self.check().await?;
        let mut stored = row.clone();
        if row::row_id(&stored).is_none() {
            stored.insert(
                ID_COLUMN.to_string(),
                Value::String(uuid::Uuid::new_v4().to_string()),
            );
        }
        let key = required_id(&stored)?;

        let mut inner = self.lock();
        let rows = inner.table_mut(table)?;
        if rows.contains_key(&key) {
            return Err(SyncError::Constraint(format!(
                "duplicate key value violates unique constraint \"{}_pkey\": id={}",
                table, key
            )));
        }
        rows.insert(key, stored.clone());
        Ok(stored)
    }

    async fn upsert(&self, table: &str, row: &Row) -> SyncResult<Row> {
        self.check().await?;
        let key = required_id(row)?;

        let mut inner = self.lock();
        let rows = inner.table_mut(table)?;
        let stored = match rows.get_mut(&key) {
            Some(existing) => {
                merge_into(existing, row);
                existing.clone()
            }
            None => {
                rows.insert(key, row.clone());
                row.clone()
            }
        };
        Ok(stored)
    }

    async fn update(&self, table: &str, row: &Row) -> SyncResult<Option<Row>> {
        self.check().await?;
        let key = required_id(row)?;

        let mut inner = self.lock();
        Ok(inner.table_mut(table)?.get_mut(&key).map(|existing| {
            merge_into(existing, row);
            existing.clone()
        }))
    }

    async fn delete(&self, table: &str, id: &Value) -> SyncResult<u64> {
        self.check().await?;
        let mut inner = self.lock();
        let removed = inner.table_mut(table)?.remove(&row::id_key(id));
        Ok(u64::from(removed.is_some()))
    }

    async fn select(&self, table: &str, filter: &Row) -> SyncResult<Vec<Row>> {
        self.check().await?;
        let inner = self.lock();
        Ok(inner
            .table(table)?
            .values()
            .filter(|r| row::matches_filter(r, filter))
            .cloned()
            .collect())
    }

    async fn watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.check().await?;
        let inner = self.lock();
        Ok(inner.table(table)?.values().filter_map(row::row_updated_at).max())
    }

    async fn changed_since(
        &self,
        table: &str,
        cursor: &PullCursor,
        limit: usize,
    ) -> SyncResult<ChangePage> {
        self.check().await?;
        let inner = self.lock();

        let mut changed: Vec<(DateTime<Utc>, String, &Row)> = inner
            .table(table)?
            .iter()
            .filter_map(|(key, r)| row::row_updated_at(r).map(|ts| (ts, key.clone(), r)))
            .filter(|(ts, key, _)| match &cursor.last_id {
                None => *ts > cursor.updated_at,
                Some(last) => (*ts, key.as_str()) > (cursor.updated_at, last.as_str()),
            })
            .collect();
        changed.sort_by(|a, b| (a.0, &a.1).cmp(&(b.0, &b.1)));
        changed.truncate(limit);

        let next = changed.last().map(|(ts, key, _)| PullCursor {
            updated_at: *ts,
            last_id: Some(key.clone()),
        });
        Ok(ChangePage {
            rows: changed.into_iter().map(|(_, _, r)| r.clone()).collect(),
            next,
        })
    }

    async fn execute(&self, _sql: &str, _params: &[Value]) -> SyncResult<QueryResult> {
        self.check().await?;
        Err(SyncError::Config(
            "raw SQL is not supported by the in-memory store".to_string(),
        ))
    }
}

#[async_trait]
impl PendingQueue for MemoryStore {
    async fn ensure_schema(&self) -> SyncResult<()> {
        self.check().await
    }

    async fn enqueue(&self, op: &NewPendingOperation) -> SyncResult<i64> {
        self.check().await?;
        let mut inner = self.lock();
        inner.next_pending_id += 1;
        let id = inner.next_pending_id;
        inner.pending.push(PendingOperation {
            id,
            table_name: op.table_name.clone(),
            operation: op.operation,
            data: op.data.clone(),
            created_at: Utc::now(),
            synced_at: None,
            error: None,
            attempts: 0,
        });
        Ok(id)
    }

    async fn fetch_unsynced(
        &self,
        after: Option<QueuePosition>,
        limit: usize,
    ) -> SyncResult<Vec<PendingOperation>> {
        self.check().await?;
        let inner = self.lock();
        let mut unsynced: Vec<PendingOperation> = inner
            .pending
            .iter()
            .filter(|op| !op.is_synced())
            .filter(|op| after.map_or(true, |pos| op.position() > pos))
            .cloned()
            .collect();
        unsynced.sort_by_key(|op| (op.created_at, op.id));
        unsynced.truncate(limit);
        Ok(unsynced)
    }

    async fn sync_watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>> {
        self.check().await?;
        let inner = self.lock();
        let queued = inner.unsynced_ids(table);
        Ok(inner
            .table(table)?
            .iter()
            .filter(|(key, _)| !queued.contains(*key))
            .filter_map(|(_, r)| row::row_updated_at(r))
            .max())
    }

    async fn unsynced_ids(&self, table: &str) -> SyncResult<HashSet<String>> {
        self.check().await?;
        Ok(self.lock().unsynced_ids(table))
    }

    async fn mark_synced(&self, id: i64, synced_at: DateTime<Utc>) -> SyncResult<()> {
        self.check().await?;
        let mut inner = self.lock();
        let op = inner
            .pending
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", id)))?;
        op.synced_at = Some(synced_at);
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error: &str) -> SyncResult<()> {
        self.check().await?;
        let mut inner = self.lock();
        let op = inner
            .pending
            .iter_mut()
            .find(|op| op.id == id)
            .ok_or_else(|| SyncError::NotFound(format!("pending operation {}", id)))?;
        op.error = Some(error.to_string());
        op.attempts += 1;
        Ok(())
    }

    async fn get(&self, id: i64) -> SyncResult<Option<PendingOperation>> {
        self.check().await?;
        Ok(self.lock().pending.iter().find(|op| op.id == id).cloned())
    }

    async fn queue_status(&self) -> SyncResult<QueueStatus> {
        self.check().await?;
        let inner = self.lock();
        let mut status = QueueStatus::default();
        for op in &inner.pending {
            if op.is_synced() {
                status.synced += 1;
            } else {
                status.pending += 1;
                if op.error.is_some() {
                    status.failed += 1;
                }
            }
        }
        Ok(status)
    }
}
