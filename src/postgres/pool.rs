// ABOUTME: deadpool-postgres pool for one database tier
// ABOUTME: Applies the tier's TLS policy and verifies clients before reuse

use std::time::Duration;

use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime};
use tokio_postgres::NoTls;

use super::connection::{pg_config, tls_connector};
use crate::config::{DatabaseConfig, TlsMode};
use crate::error::{SyncError, SyncResult};

/// Pooled clients for one tier ("master" or "local").
///
/// Clients are created on demand up to `pool_size`. A returned client is
/// verified with a round trip before it is handed out again, so a client
/// whose server went away is replaced instead of failing the next caller.
/// Creating, waiting for and verifying a client are all bounded by the
/// connect timeout.
pub struct ConnectionPool {
    label: String,
    target: String,
    pool: Pool,
}

impl ConnectionPool {
    pub fn new(
        label: impl Into<String>,
        config: DatabaseConfig,
        connect_timeout: Duration,
    ) -> SyncResult<Self> {
        let label = label.into();
        let pg = pg_config(&config, connect_timeout);

        let mut manager_config = ManagerConfig::default();
        manager_config.recycling_method = RecyclingMethod::Verified;
        let manager = match config.tls_mode {
            TlsMode::Disable => Manager::from_config(pg, NoTls, manager_config),
            TlsMode::Prefer | TlsMode::Require => {
                Manager::from_config(pg, tls_connector(&config)?, manager_config)
            }
        };

        let pool = Pool::builder(manager)
            .max_size(config.pool_size.max(1))
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(connect_timeout))
            .create_timeout(Some(connect_timeout))
            .recycle_timeout(Some(connect_timeout))
            .build()
            .map_err(|e| SyncError::Config(format!("{} pool setup failed: {}", label, e)))?;

        Ok(Self {
            label,
            target: config.display_target(),
            pool,
        })
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> usize {
        self.pool.status().max_size
    }

    /// Check out a client. Any failure to produce one is a connectivity error.
    pub async fn get(&self) -> SyncResult<Object> {
        self.pool.get().await.map_err(|e| {
            SyncError::Connectivity(format!("{} connection failed: {}", self.label, e))
        })
    }

    /// Open every connection up front. Fails if any of them fails.
    pub async fn warm_up(&self) -> SyncResult<()> {
        let size = self.size();
        let clients = futures::future::try_join_all((0..size).map(|_| self.get())).await?;
        drop(clients);
        tracing::info!(
            "{} pool ready with {} connection(s) to {}",
            self.label,
            size,
            self.target
        );
        Ok(())
    }

    /// Stop handing out clients and drop the idle ones.
    pub fn close(&self) {
        self.pool.close();
        tracing::debug!("{} pool closed", self.label);
    }
}
