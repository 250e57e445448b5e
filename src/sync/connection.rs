// ABOUTME: ConnectionManager - owns the master and local stores and the online flag
// ABOUTME: Probes master liveness and applies deadlines to every remote call

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::watch;

use crate::config::{EngineConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::postgres::{ConnectionPool, PgStore};
use crate::store::{LocalStore, Store};
use crate::utils::{retry_with_backoff, with_deadline};

/// Deadlines applied to store calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadlines {
    pub probe: Duration,
    pub statement: Duration,
    pub pull: Duration,
}

impl Default for Deadlines {
    fn default() -> Self {
        Self::from(&SyncConfig::default())
    }
}

impl From<&SyncConfig> for Deadlines {
    fn from(config: &SyncConfig) -> Self {
        Self {
            probe: config.probe_timeout(),
            statement: config.statement_timeout(),
            pull: config.pull_timeout(),
        }
    }
}

/// Read-only view of the online/offline flag.
///
/// Staleness by one probe is acceptable; callers that want to react to
/// transitions can [`subscribe`](OnlineFlag::subscribe).
#[derive(Debug, Clone)]
pub struct OnlineFlag {
    rx: watch::Receiver<bool>,
}

impl OnlineFlag {
    pub fn is_online(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.rx.clone()
    }
}

/// Holds both tiers and the only writable handle to the online flag.
///
/// The flag starts offline and changes only through [`probe`] and
/// [`mark_offline`]; every other component reads it.
///
/// [`probe`]: ConnectionManager::probe
/// [`mark_offline`]: ConnectionManager::mark_offline
pub struct ConnectionManager {
    master: Arc<dyn Store>,
    local: Arc<dyn LocalStore>,
    online: watch::Sender<bool>,
    deadlines: Deadlines,
}

impl ConnectionManager {
    pub fn new(master: Arc<dyn Store>, local: Arc<dyn LocalStore>, deadlines: Deadlines) -> Self {
        let (online, _) = watch::channel(false);
        Self {
            master,
            local,
            online,
            deadlines,
        }
    }

    /// Build Postgres-backed tiers from configuration.
    ///
    /// The local pool must come up (retried with backoff) and gets the
    /// pending queue schema. The master is not contacted here: starting
    /// while it is unreachable is normal and just means starting offline.
    pub async fn connect(config: &EngineConfig) -> Result<Self> {
        let connect_timeout = config.sync.connect_timeout();
        let master_pool = ConnectionPool::new("master", config.master.clone(), connect_timeout)?;
        let local_pool = ConnectionPool::new("local", config.local.clone(), connect_timeout)?;

        retry_with_backoff(|| local_pool.warm_up(), 3, Duration::from_secs(1))
            .await
            .with_context(|| {
                format!(
                    "Failed to connect to local database {}",
                    config.local.display_target()
                )
            })?;

        let local = PgStore::new(local_pool, config.sync.schema.clone());
        crate::store::PendingQueue::ensure_schema(&local)
            .await
            .context("Failed to create pending_sync table in local database")?;

        let master = PgStore::new(master_pool, config.sync.schema.clone());
        Ok(Self::new(
            Arc::new(master),
            Arc::new(local),
            Deadlines::from(&config.sync),
        ))
    }

    pub fn master(&self) -> &Arc<dyn Store> {
        &self.master
    }

    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    pub fn deadlines(&self) -> Deadlines {
        self.deadlines
    }

    pub fn is_online(&self) -> bool {
        *self.online.borrow()
    }

    pub fn online_flag(&self) -> OnlineFlag {
        OnlineFlag {
            rx: self.online.subscribe(),
        }
    }

    /// Round-trip to the master under the probe deadline.
    ///
    /// Never fails: an error or timeout only flips the flag offline.
    pub async fn probe(&self) -> bool {
        let result = with_deadline("master probe", self.deadlines.probe, self.master.ping()).await;
        match result {
            Ok(()) => {
                self.set_online(true, "probe succeeded");
                true
            }
            Err(e) => {
                self.mark_offline(&e);
                false
            }
        }
    }

    /// Flip to offline after a failure observed outside the probe. The next
    /// successful probe brings the flag back.
    pub fn mark_offline(&self, reason: &SyncError) {
        self.set_online(false, &reason.to_string());
    }

    fn set_online(&self, online: bool, reason: &str) {
        let changed = self.online.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if !changed {
            return;
        }
        if online {
            tracing::info!("Master reachable, switching to online mode ({})", reason);
        } else {
            tracing::warn!("Switching to offline mode: {}", reason);
        }
    }

    /// Run a master call under `timeout`; connectivity failures flip the
    /// flag offline before the error is returned.
    pub async fn on_master<T, F>(&self, operation: &str, timeout: Duration, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        let result = with_deadline(operation, timeout, fut).await;
        if let Err(e) = &result {
            if e.is_connectivity() {
                self.mark_offline(e);
            }
        }
        result
    }

    /// Run a local call under the statement deadline.
    pub async fn on_local<T, F>(&self, operation: &str, fut: F) -> SyncResult<T>
    where
        F: Future<Output = SyncResult<T>>,
    {
        with_deadline(operation, self.deadlines.statement, fut).await
    }

    /// Release both tiers' connections.
    pub async fn close(&self) {
        self.master.close().await;
        self.local.close().await;
    }
}
