// ABOUTME: SyncEngine - the application-facing surface of the synchronizer
// ABOUTME: Wires the connection manager, router, synchronizer, replayer and scheduler

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use crate::config::{EngineConfig, SyncConfig};
use crate::error::SyncResult;
use crate::row::Row;
use crate::store::{PendingOperation, PendingQueue, QueryResult, QueueStatus};
use crate::sync::{
    ConnectionManager, CycleReport, OnlineFlag, PendingReplayer, ReplayStats, SyncCycle,
    SyncScheduler, TableRegistry, TableSynchronizer, WriteReceipt, WriteRouter,
};

/// Two-tier data engine: writes go master-first with a local fallback,
/// reads come from the local store, and a background cycle keeps the two
/// converging.
///
/// # Examples
///
/// ```no_run
/// # async fn demo() -> anyhow::Result<()> {
/// use replica_sync::{EngineConfig, SyncEngine};
/// use serde_json::json;
///
/// let config = EngineConfig::load(None)?;
/// let engine = SyncEngine::connect(config).await?;
/// engine.start_sync(engine.default_interval()).await?;
///
/// let row = serde_json::from_value(json!({"name": "Ann"}))?;
/// let receipt = engine.write("users", row).await?;
/// println!("stored {:?}", receipt.row);
///
/// engine.shutdown().await;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    connections: Arc<ConnectionManager>,
    router: WriteRouter,
    synchronizer: Arc<TableSynchronizer>,
    replayer: Arc<PendingReplayer>,
    cycle: Arc<SyncCycle>,
    scheduler: SyncScheduler,
    interval: Duration,
}

impl SyncEngine {
    /// Validate `config`, connect both tiers and probe the master once.
    ///
    /// Fails only on configuration errors or an unusable local store; an
    /// unreachable master just means starting offline.
    pub async fn connect(config: EngineConfig) -> Result<Self> {
        config.validate().context("Invalid engine configuration")?;

        tracing::info!(
            "Connecting to master {} and local {}",
            config.master.display_target(),
            config.local.display_target()
        );
        let connections = ConnectionManager::connect(&config).await?;
        let engine = Self::new(Arc::new(connections), &config.sync)?;

        if !engine.connections.probe().await {
            tracing::warn!("Master not reachable at startup, writes will be queued locally");
        }
        Ok(engine)
    }

    /// Assemble an engine over existing stores. The online flag starts
    /// false until the first probe.
    pub fn new(connections: Arc<ConnectionManager>, sync: &SyncConfig) -> SyncResult<Self> {
        let tables = Arc::new(TableRegistry::new(sync.tables.iter().cloned())?);

        let router = WriteRouter::new(Arc::clone(&connections), Arc::clone(&tables));
        let synchronizer = Arc::new(TableSynchronizer::new(
            Arc::clone(&connections),
            Arc::clone(&tables),
            sync.page_size,
        ));
        let replayer = Arc::new(PendingReplayer::new(
            Arc::clone(&connections),
            Arc::clone(&tables),
            sync.replay_batch_size,
        ));
        let cycle = Arc::new(SyncCycle::new(
            Arc::clone(&connections),
            Arc::clone(&synchronizer),
            Arc::clone(&replayer),
            tables,
        ));
        let scheduler = SyncScheduler::new(Arc::clone(&cycle));

        Ok(Self {
            connections,
            router,
            synchronizer,
            replayer,
            cycle,
            scheduler,
            interval: sync.interval(),
        })
    }

    pub async fn write(&self, table: &str, row: Row) -> SyncResult<WriteReceipt> {
        self.router.write(table, row).await
    }

    pub async fn upsert(&self, table: &str, row: Row) -> SyncResult<WriteReceipt> {
        self.router.upsert(table, row).await
    }

    pub async fn update(&self, table: &str, row: Row) -> SyncResult<WriteReceipt> {
        self.router.update(table, row).await
    }

    pub async fn delete(&self, table: &str, id: Value) -> SyncResult<WriteReceipt> {
        self.router.delete(table, id).await
    }

    /// Equality-filtered read, always from the local store.
    pub async fn read(&self, table: &str, filter: &Row) -> SyncResult<Vec<Row>> {
        self.router.read(table, filter).await
    }

    pub async fn query(&self, sql: &str, params: &[Value], use_master: bool) -> SyncResult<QueryResult> {
        self.router.query(sql, params, use_master).await
    }

    /// Start background sync. Runs one full cycle before returning.
    pub async fn start_sync(&self, interval: Duration) -> SyncResult<CycleReport> {
        self.scheduler.start(interval).await
    }

    /// Stop background sync, waiting for an in-flight cycle.
    pub async fn stop(&self) {
        self.scheduler.stop().await;
    }

    /// Stop syncing and release both tiers' connections.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.connections.close().await;
    }

    pub fn is_connected_to_master(&self) -> bool {
        self.connections.is_online()
    }

    pub fn online_flag(&self) -> OnlineFlag {
        self.connections.online_flag()
    }

    /// Interval from configuration, for callers of [`start_sync`](Self::start_sync).
    pub fn default_interval(&self) -> Duration {
        self.interval
    }

    pub async fn is_syncing(&self) -> bool {
        self.scheduler.is_running().await
    }

    /// Run one probe → pull → replay cycle now.
    pub async fn sync_once(&self) -> CycleReport {
        self.cycle.run().await
    }

    /// Probe the master and return the resulting online state.
    pub async fn probe(&self) -> bool {
        self.connections.probe().await
    }

    pub async fn sync_table(&self, table: &str) -> SyncResult<u64> {
        self.synchronizer.sync_table(table).await
    }

    pub async fn replay_pending(&self) -> SyncResult<ReplayStats> {
        self.replayer.push().await
    }

    pub async fn queue_status(&self) -> SyncResult<QueueStatus> {
        let local = self.connections.local();
        self.connections
            .on_local("read queue status", local.queue_status())
            .await
    }

    pub async fn pending_operation(&self, id: i64) -> SyncResult<Option<PendingOperation>> {
        let local = self.connections.local();
        self.connections
            .on_local("read pending operation", local.get(id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::sync::Deadlines;

    fn engine_with(tables: &[&str]) -> SyncResult<SyncEngine> {
        let master = Arc::new(MemoryStore::with_tables("master", &["users"]));
        let local = Arc::new(MemoryStore::with_tables("local", &["users"]));
        let connections = Arc::new(ConnectionManager::new(master, local, Deadlines::default()));
        let sync = SyncConfig {
            tables: tables.iter().map(|t| t.to_string()).collect(),
            ..SyncConfig::default()
        };
        SyncEngine::new(connections, &sync)
    }

    #[test]
    fn test_new_rejects_bad_table_list() {
        assert!(engine_with(&[]).is_err());
        assert!(engine_with(&["pending_sync"]).is_err());
        assert!(engine_with(&["users"]).is_ok());
    }

    #[tokio::test]
    async fn test_engine_starts_offline_until_probed() {
        let engine = engine_with(&["users"]).unwrap();
        assert!(!engine.is_connected_to_master());
        assert!(engine.probe().await);
        assert!(engine.is_connected_to_master());
    }
}
