// ABOUTME: Storage abstraction shared by the master and local tiers
// ABOUTME: Defines the Store and PendingQueue traits plus paging types

pub mod memory;
pub mod pending;

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::SyncResult;
use crate::row::Row;

pub use memory::MemoryStore;
pub use pending::{
    NewPendingOperation, Operation, PendingOperation, QueuePosition, QueueStatus, PENDING_TABLE,
};

/// Position inside a table's change stream.
///
/// Rows are ordered by `(updated_at, id)`; a page continues strictly after
/// the cursor. `last_id = None` means "everything newer than `updated_at`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullCursor {
    pub updated_at: DateTime<Utc>,
    pub last_id: Option<String>,
}

impl PullCursor {
    /// Start of a pull from a watermark (epoch when the table is empty).
    pub fn from_watermark(watermark: Option<DateTime<Utc>>) -> Self {
        Self {
            updated_at: watermark.unwrap_or_default(),
            last_id: None,
        }
    }
}

/// One page of changed rows, oldest first.
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub rows: Vec<Row>,
    /// Cursor positioned on the last row of this page.
    pub next: Option<PullCursor>,
}

/// Output of a raw statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub rows: Vec<Row>,
    pub rows_affected: u64,
}

/// Row-level operations on one database tier.
///
/// Implementations are safe for concurrent use; every method may hit the
/// network and callers wrap them in deadlines.
#[async_trait]
pub trait Store: Send + Sync {
    /// Short label for logs ("master", "local").
    fn label(&self) -> &str;

    /// Trivial round trip used for liveness.
    async fn ping(&self) -> SyncResult<()>;

    /// Plain insert; returns the stored row including generated columns.
    async fn insert(&self, table: &str, row: &Row) -> SyncResult<Row>;

    /// Insert, or overwrite every non-id column when `id` already exists.
    async fn upsert(&self, table: &str, row: &Row) -> SyncResult<Row>;

    /// Set the row's non-id columns on the row with the same `id`.
    /// Returns the full stored row, or `None` when no row has that `id`.
    async fn update(&self, table: &str, row: &Row) -> SyncResult<Option<Row>>;

    /// Delete by `id`. Returns the number of rows removed.
    async fn delete(&self, table: &str, id: &Value) -> SyncResult<u64>;

    /// Rows whose columns equal every value in `filter` (`null` matches `null`).
    async fn select(&self, table: &str, filter: &Row) -> SyncResult<Vec<Row>>;

    /// `max(updated_at)` over the table, `None` when empty.
    async fn watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>>;

    /// Up to `limit` rows positioned after `cursor`, ordered by `(updated_at, id)`.
    async fn changed_since(
        &self,
        table: &str,
        cursor: &PullCursor,
        limit: usize,
    ) -> SyncResult<ChangePage>;

    /// Arbitrary statement with positional JSON parameters.
    async fn execute(&self, sql: &str, params: &[Value]) -> SyncResult<QueryResult>;

    /// Release held connections. Later calls may reconnect.
    async fn close(&self) {}
}

/// Durable queue of local writes not yet confirmed on the master.
#[async_trait]
pub trait PendingQueue: Send + Sync {
    /// Create the control table if it does not exist.
    async fn ensure_schema(&self) -> SyncResult<()>;

    async fn enqueue(&self, op: &NewPendingOperation) -> SyncResult<i64>;

    /// Oldest unsynced records first (`created_at`, then `id`), starting
    /// strictly after `after` when given.
    async fn fetch_unsynced(
        &self,
        after: Option<QueuePosition>,
        limit: usize,
    ) -> SyncResult<Vec<PendingOperation>>;

    /// `max(updated_at)` of `table`, ignoring rows that still have an
    /// unsynced queued write. Those rows carry a local timestamp the master
    /// has not seen, so counting them would skip master changes.
    async fn sync_watermark(&self, table: &str) -> SyncResult<Option<DateTime<Utc>>>;

    /// Ids (in [`crate::row::id_key`] form) of `table` rows with an
    /// unsynced queued write.
    async fn unsynced_ids(&self, table: &str) -> SyncResult<HashSet<String>>;

    async fn mark_synced(&self, id: i64, synced_at: DateTime<Utc>) -> SyncResult<()>;

    /// Record the failure and bump `attempts`; the record stays unsynced.
    async fn mark_failed(&self, id: i64, error: &str) -> SyncResult<()>;

    async fn get(&self, id: i64) -> SyncResult<Option<PendingOperation>>;

    async fn queue_status(&self) -> SyncResult<QueueStatus>;
}

/// The local tier: row storage plus the pending queue.
pub trait LocalStore: Store + PendingQueue {}

impl<T: Store + PendingQueue + ?Sized> LocalStore for T {}
