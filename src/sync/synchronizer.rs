// ABOUTME: TableSynchronizer - pulls master rows newer than the local watermark
// ABOUTME: Applies each page to the local store by upsert on id

use std::collections::HashSet;
use std::sync::Arc;

use super::{ConnectionManager, TableRegistry};
use crate::error::SyncResult;
use crate::row;
use crate::store::{ChangePage, PendingQueue, PullCursor, Store};

/// Incremental master → local pull for the configured tables.
///
/// Delivery is at-least-once: a row may be fetched again on the next pass,
/// which is harmless because every row is applied with an upsert.
pub struct TableSynchronizer {
    connections: Arc<ConnectionManager>,
    tables: Arc<TableRegistry>,
    page_size: usize,
}

impl TableSynchronizer {
    pub fn new(
        connections: Arc<ConnectionManager>,
        tables: Arc<TableRegistry>,
        page_size: usize,
    ) -> Self {
        Self {
            connections,
            tables,
            page_size: page_size.max(1),
        }
    }

    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Bring one table up to date with the master.
    ///
    /// Starts from the local watermark and pages until the master returns a
    /// short page. Rows with an unsynced queued write count for neither the
    /// watermark nor the pull: their local version stands until replay
    /// reaches the master, and a later pull brings the master's copy back.
    /// Returns the number of rows applied locally.
    pub async fn sync_table(&self, table: &str) -> SyncResult<u64> {
        let table = self.tables.require(table)?;
        let local = self.connections.local();

        let watermark = self
            .connections
            .on_local("read local watermark", local.sync_watermark(table))
            .await?;
        let queued = self
            .connections
            .on_local("read queued row ids", local.unsynced_ids(table))
            .await?;
        tracing::debug!(
            "Pulling {} from master, local watermark {:?}, {} row(s) held by the queue",
            table,
            watermark,
            queued.len()
        );

        let mut cursor = PullCursor::from_watermark(watermark);
        let mut applied = 0u64;
        let mut pages = 0u32;

        loop {
            let (count, page) = self.pull_page(table, &cursor, &queued).await?;
            applied += count;
            pages += 1;

            let fetched = page.rows.len();
            match page.next {
                Some(next) if fetched >= self.page_size => cursor = next,
                _ => break,
            }
        }

        if applied > 0 {
            tracing::info!(
                "Pulled {} row(s) into {} ({} page(s))",
                applied,
                table,
                pages
            );
        } else {
            tracing::debug!("No changes for {}", table);
        }
        Ok(applied)
    }

    /// Fetch and apply a single page positioned after `cursor`, leaving the
    /// rows whose ids are in `skip` untouched.
    ///
    /// Rows are applied in `(updated_at, id)` order, so a failure part-way
    /// through leaves the local watermark at the last applied row.
    pub async fn pull_page(
        &self,
        table: &str,
        cursor: &PullCursor,
        skip: &HashSet<String>,
    ) -> SyncResult<(u64, ChangePage)> {
        let table = self.tables.require(table)?;
        let master = self.connections.master();
        let local = self.connections.local();

        let page = self
            .connections
            .on_master(
                &format!("pull {}", table),
                self.connections.deadlines().pull,
                master.changed_since(table, cursor, self.page_size),
            )
            .await?;

        let mut applied = 0u64;
        for pulled in &page.rows {
            if row::row_id(pulled).is_some_and(|id| skip.contains(&row::id_key(id))) {
                tracing::debug!("Keeping queued local version of a row in {}", table);
                continue;
            }
            self.connections
                .on_local("apply pulled row", local.upsert(table, pulled))
                .await?;
            applied += 1;
        }
        Ok((applied, page))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{self, Row};
    use crate::store::{MemoryStore, NewPendingOperation, Operation};
    use crate::sync::Deadlines;
    use serde_json::{json, Value};

    fn row(value: Value) -> Row {
        row::row_from_value(value).unwrap()
    }

    fn setup(page_size: usize) -> (Arc<MemoryStore>, Arc<MemoryStore>, TableSynchronizer) {
        let master = Arc::new(MemoryStore::with_tables("master", &["items"]));
        let local = Arc::new(MemoryStore::with_tables("local", &["items"]));
        let connections = Arc::new(ConnectionManager::new(
            master.clone(),
            local.clone(),
            Deadlines::default(),
        ));
        let tables = Arc::new(TableRegistry::new(["items"]).unwrap());
        (master, local, TableSynchronizer::new(connections, tables, page_size))
    }

    #[tokio::test]
    async fn test_sync_table_pages_until_short_page() {
        let (master, local, sync) = setup(2);
        for i in 0..5 {
            master
                .insert(
                    "items",
                    &row(json!({"id": format!("i{}", i), "updated_at": format!("2024-01-0{}T00:00:00Z", i + 1)})),
                )
                .await
                .unwrap();
        }

        assert_eq!(sync.sync_table("items").await.unwrap(), 5);
        assert_eq!(local.rows("items").len(), 5);
        assert_eq!(sync.sync_table("items").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_sync_table_keeps_tied_timestamps_across_pages() {
        let (master, local, sync) = setup(2);
        for id in ["a", "b", "c", "d"] {
            master
                .insert("items", &row(json!({"id": id, "updated_at": "2024-03-01T12:00:00Z"})))
                .await
                .unwrap();
        }

        assert_eq!(sync.sync_table("items").await.unwrap(), 4);
        assert_eq!(local.rows("items").len(), 4);
    }

    #[tokio::test]
    async fn test_sync_table_skips_rows_without_timestamp() {
        let (master, local, sync) = setup(10);
        master
            .insert("items", &row(json!({"id": "no-ts"})))
            .await
            .unwrap();
        assert_eq!(sync.sync_table("items").await.unwrap(), 0);
        assert!(local.rows("items").is_empty());
    }

    #[tokio::test]
    async fn test_queued_local_rows_hold_back_watermark_and_pull() {
        let (master, local, sync) = setup(10);
        master
            .insert("items", &row(json!({"id": "shared", "v": "master", "updated_at": "2024-02-01T00:00:00Z"})))
            .await
            .unwrap();
        master
            .insert("items", &row(json!({"id": "m1", "updated_at": "2024-02-02T00:00:00Z"})))
            .await
            .unwrap();

        // Offline edit stamped later than every master change.
        let edited = row(json!({"id": "shared", "v": "local", "updated_at": "2024-06-01T00:00:00Z"}));
        local.insert("items", &edited).await.unwrap();
        local
            .enqueue(&NewPendingOperation {
                table_name: "items".into(),
                operation: Operation::Upsert,
                data: edited.clone(),
            })
            .await
            .unwrap();

        assert_eq!(sync.sync_table("items").await.unwrap(), 1);
        let rows = local.rows("items");
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["id"], json!("m1"));
        assert_eq!(rows[1], edited);
    }

    #[tokio::test]
    async fn test_unknown_table_is_rejected() {
        let (_master, _local, sync) = setup(10);
        assert!(matches!(
            sync.sync_table("orders").await,
            Err(crate::error::SyncError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_master_propagates_connectivity_error() {
        let (master, _local, sync) = setup(10);
        master.set_reachable(false);
        let err = sync.sync_table("items").await.unwrap_err();
        assert!(err.is_connectivity());
    }
}
