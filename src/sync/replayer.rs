// ABOUTME: PendingReplayer - drains queued local writes to the master in FIFO order
// ABOUTME: Marks each record synced or failed individually; records are never deleted

use std::sync::Arc;

use chrono::Utc;

use super::{ConnectionManager, TableRegistry};
use crate::error::{SyncError, SyncResult};
use crate::row;
use crate::store::{Operation, PendingOperation, PendingQueue, QueuePosition, Store};

/// Outcome of one replay batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayStats {
    pub applied: u64,
    pub failed: u64,
    /// The batch stopped early because the master became unreachable.
    pub interrupted: bool,
}

impl ReplayStats {
    pub fn attempted(&self) -> u64 {
        self.applied + self.failed
    }
}

pub struct PendingReplayer {
    connections: Arc<ConnectionManager>,
    tables: Arc<TableRegistry>,
    batch_size: usize,
}

impl PendingReplayer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tables: Arc<TableRegistry>,
        batch_size: usize,
    ) -> Self {
        Self {
            connections,
            tables,
            batch_size: batch_size.max(1),
        }
    }

    /// Replay unsynced operations to the master, oldest first.
    ///
    /// Walks the queue in `(created_at, id)` order until `batch_size`
    /// records that never failed before have been attempted. Records that
    /// already failed are retried in their place but do not use up the
    /// budget, so a run of permanently failing records at the head of the
    /// queue cannot starve the ones behind it. A failing record is marked
    /// with its error and skipped. A connectivity failure ends the pass,
    /// since every remaining record would fail the same way. Errors from
    /// the local queue itself are returned.
    pub async fn push(&self) -> SyncResult<ReplayStats> {
        let local = self.connections.local();
        let mut stats = ReplayStats::default();
        let mut after: Option<QueuePosition> = None;
        let mut fresh = 0usize;

        'pages: loop {
            let page = self
                .connections
                .on_local(
                    "fetch pending operations",
                    local.fetch_unsynced(after, self.batch_size),
                )
                .await?;
            let last_page = page.len() < self.batch_size;

            for op in &page {
                after = Some(op.position());
                if !op.has_failed() {
                    fresh += 1;
                }

                match self.replay_one(op).await {
                    Ok(()) => {
                        self.connections
                            .on_local("mark pending synced", local.mark_synced(op.id, Utc::now()))
                            .await?;
                        stats.applied += 1;
                    }
                    Err(e) => {
                        tracing::warn!(
                            "Pending operation {} ({} on {}) failed: {}",
                            op.id,
                            op.operation,
                            op.table_name,
                            e
                        );
                        self.connections
                            .on_local("mark pending failed", local.mark_failed(op.id, &e.to_string()))
                            .await?;
                        stats.failed += 1;

                        if e.is_connectivity() {
                            stats.interrupted = true;
                            tracing::warn!("Master unreachable, stopping replay until next cycle");
                            break 'pages;
                        }
                    }
                }

                if fresh >= self.batch_size {
                    break 'pages;
                }
            }

            if last_page {
                break;
            }
        }

        if stats.attempted() == 0 {
            tracing::debug!("No pending operations to replay");
            return Ok(stats);
        }
        tracing::info!(
            "Replay finished: {} applied, {} failed{}",
            stats.applied,
            stats.failed,
            if stats.interrupted { " (interrupted)" } else { "" }
        );
        Ok(stats)
    }

    /// Apply one queued operation to the master.
    ///
    /// Inserts replay as upserts so a record whose earlier attempt reached
    /// the master before the failure was recorded does not conflict with
    /// itself.
    async fn replay_one(&self, op: &PendingOperation) -> SyncResult<()> {
        let table = self.tables.require(&op.table_name)?;
        let master = self.connections.master();
        let timeout = self.connections.deadlines().statement;
        let label = format!("replay {} on {}", op.operation, table);

        match op.operation {
            Operation::Insert | Operation::Upsert => {
                self.connections
                    .on_master(&label, timeout, master.upsert(table, &op.data))
                    .await?;
            }
            Operation::Update => {
                let stored = self
                    .connections
                    .on_master(&label, timeout, master.update(table, &op.data))
                    .await?;
                if stored.is_none() {
                    return Err(SyncError::NotFound(format!(
                        "row {} no longer exists in {} on master",
                        describe(op),
                        table
                    )));
                }
            }
            Operation::Delete => {
                let id = row::row_id(&op.data).ok_or_else(|| {
                    SyncError::InvalidRow(format!("queued delete on {} has no id", table))
                })?;
                let removed = self
                    .connections
                    .on_master(&label, timeout, master.delete(table, id))
                    .await?;
                if removed == 0 {
                    tracing::debug!("Row {} already absent from {} on master", describe(op), table);
                }
            }
        }
        Ok(())
    }
}

fn describe(op: &PendingOperation) -> String {
    row::row_id(&op.data)
        .map(row::id_key)
        .unwrap_or_else(|| "<no id>".to_string())
}
