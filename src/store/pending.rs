// ABOUTME: Pending operation records stored in the local `pending_sync` table
// ABOUTME: Describes queued local writes awaiting replay to the master

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::row::Row;

/// Name of the control table holding queued writes.
pub const PENDING_TABLE: &str = "pending_sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Insert,
    Upsert,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Insert => "INSERT",
            Operation::Upsert => "UPSERT",
            Operation::Update => "UPDATE",
            Operation::Delete => "DELETE",
        }
    }

    pub fn parse(value: &str) -> SyncResult<Self> {
        match value.to_ascii_uppercase().as_str() {
            "INSERT" => Ok(Operation::Insert),
            "UPSERT" => Ok(Operation::Upsert),
            "UPDATE" => Ok(Operation::Update),
            "DELETE" => Ok(Operation::Delete),
            other => Err(SyncError::Database(format!(
                "unknown pending operation '{}'",
                other
            ))),
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A write to queue. `data` is the full row for inserts, upserts and
/// updates, and at least `{ "id": ... }` for deletes.
#[derive(Debug, Clone, PartialEq)]
pub struct NewPendingOperation {
    pub table_name: String,
    pub operation: Operation,
    pub data: Row,
}

/// A record from `pending_sync`. Never deleted: a successful replay sets
/// `synced_at`, a failed one sets `error` and bumps `attempts`.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOperation {
    pub id: i64,
    pub table_name: String,
    pub operation: Operation,
    pub data: Row,
    pub created_at: DateTime<Utc>,
    pub synced_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    pub attempts: i32,
}

impl PendingOperation {
    pub fn is_synced(&self) -> bool {
        self.synced_at.is_some()
    }

    /// True once an earlier replay attempt recorded an error.
    pub fn has_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn position(&self) -> QueuePosition {
        QueuePosition {
            created_at: self.created_at,
            id: self.id,
        }
    }
}

/// Place in the queue's `(created_at, id)` order. Fetches continue
/// strictly after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct QueuePosition {
    pub created_at: DateTime<Utc>,
    pub id: i64,
}

/// Counts over `pending_sync`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    /// Not yet replayed, including ones that failed before.
    pub pending: u64,
    /// Subset of `pending` whose last attempt failed.
    pub failed: u64,
    pub synced: u64,
}
