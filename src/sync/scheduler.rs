// ABOUTME: SyncScheduler - runs probe, pull and replay cycles on a fixed interval
// ABOUTME: Cycles are serialized; stop() lets an in-flight cycle finish

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::FutureExt;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use super::{ConnectionManager, PendingReplayer, ReplayStats, TableRegistry, TableSynchronizer};
use crate::error::{SyncError, SyncResult};

/// Rows pulled for one table during a cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    pub rows_applied: u64,
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    pub cycle: u64,
    /// Online flag at the end of the cycle.
    pub online: bool,
    pub tables: Vec<TableReport>,
    /// `None` when replay did not run (offline, or the pull failed).
    pub replay: Option<ReplayStats>,
    pub errors: Vec<String>,
    pub duration_ms: u64,
}

impl CycleReport {
    /// Check if the cycle completed without errors.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn rows_pulled(&self) -> u64 {
        self.tables.iter().map(|t| t.rows_applied).sum()
    }
}

/// One probe → pull → replay pass over every configured table.
///
/// Shared by the scheduler's timer task and manual `sync_once` calls; the
/// internal gate keeps two passes from overlapping.
pub struct SyncCycle {
    connections: Arc<ConnectionManager>,
    synchronizer: Arc<TableSynchronizer>,
    replayer: Arc<PendingReplayer>,
    tables: Arc<TableRegistry>,
    gate: Mutex<()>,
    cycles: AtomicU64,
}

impl SyncCycle {
    pub fn new(
        connections: Arc<ConnectionManager>,
        synchronizer: Arc<TableSynchronizer>,
        replayer: Arc<PendingReplayer>,
        tables: Arc<TableRegistry>,
    ) -> Self {
        Self {
            connections,
            synchronizer,
            replayer,
            tables,
            gate: Mutex::new(()),
            cycles: AtomicU64::new(0),
        }
    }

    /// Run one cycle. Never fails: errors and panics end up in the report
    /// and flip the online flag until the next successful probe.
    pub async fn run(&self) -> CycleReport {
        let _gate = self.gate.lock().await;
        let cycle = self.cycles.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();

        let mut report = match AssertUnwindSafe(self.run_inner(cycle)).catch_unwind().await {
            Ok(report) => report,
            Err(_) => {
                let err = SyncError::Database(format!("sync cycle {} panicked", cycle));
                tracing::error!("{}", err);
                self.connections.mark_offline(&err);
                CycleReport {
                    cycle,
                    errors: vec![err.to_string()],
                    ..Default::default()
                }
            }
        };
        report.online = self.connections.is_online();
        report.duration_ms = start.elapsed().as_millis() as u64;

        if report.is_success() {
            tracing::info!(
                "Sync cycle {} completed: {} row(s) pulled, {} operation(s) replayed in {}ms",
                cycle,
                report.rows_pulled(),
                report.replay.map_or(0, |r| r.applied),
                report.duration_ms
            );
        } else {
            tracing::error!(
                "Sync cycle {} finished with {} error(s): {}",
                cycle,
                report.errors.len(),
                report.errors.join("; ")
            );
        }
        report
    }

    async fn run_inner(&self, cycle: u64) -> CycleReport {
        let mut report = CycleReport {
            cycle,
            ..Default::default()
        };

        if !self.connections.probe().await {
            tracing::debug!("Master offline, skipping pull and replay for cycle {}", cycle);
            return report;
        }

        for table in self.tables.iter() {
            match self.synchronizer.sync_table(table).await {
                Ok(rows_applied) => report.tables.push(TableReport {
                    table: table.to_string(),
                    rows_applied,
                }),
                Err(e) => {
                    tracing::error!("Failed to sync {}: {}", table, e);
                    report.errors.push(format!("{}: {}", table, e));
                    self.connections.mark_offline(&e);
                    return report;
                }
            }
        }

        match self.replayer.push().await {
            Ok(stats) => report.replay = Some(stats),
            Err(e) => {
                tracing::error!("Pending queue replay failed: {}", e);
                report.errors.push(format!("replay: {}", e));
                self.connections.mark_offline(&e);
            }
        }
        report
    }
}

struct RunningTask {
    shutdown: broadcast::Sender<()>,
    handle: JoinHandle<u64>,
    interval: Duration,
}

/// Drives [`SyncCycle`] on a timer.
///
/// `Stopped -> Running` on [`start`](SyncScheduler::start), which runs one
/// pass before returning; `Running -> Stopped` on
/// [`stop`](SyncScheduler::stop), which waits for the current pass.
pub struct SyncScheduler {
    cycle: Arc<SyncCycle>,
    running: Mutex<Option<RunningTask>>,
}

impl SyncScheduler {
    pub fn new(cycle: Arc<SyncCycle>) -> Self {
        Self {
            cycle,
            running: Mutex::new(None),
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Run one pass now, then every `interval` until stopped.
    pub async fn start(&self, interval: Duration) -> SyncResult<CycleReport> {
        if interval.is_zero() {
            return Err(SyncError::Config(
                "sync interval must be greater than zero".to_string(),
            ));
        }

        let mut running = self.running.lock().await;
        if let Some(task) = running.as_ref() {
            return Err(SyncError::Config(format!(
                "sync scheduler is already running (interval {:?})",
                task.interval
            )));
        }

        let report = self.cycle.run().await;

        let (shutdown, rx) = broadcast::channel(1);
        let cycle = Arc::clone(&self.cycle);
        let handle = tokio::spawn(run_loop(cycle, interval, rx));
        *running = Some(RunningTask {
            shutdown,
            handle,
            interval,
        });

        tracing::info!("Sync scheduler started with interval={:?}", interval);
        Ok(report)
    }

    /// Cancel the timer and wait for any in-flight cycle to finish.
    pub async fn stop(&self) {
        let task = self.running.lock().await.take();
        let Some(task) = task else {
            tracing::debug!("Sync scheduler is not running");
            return;
        };

        // Send fails only if the loop already exited.
        let _ = task.shutdown.send(());
        match task.handle.await {
            Ok(cycles) => {
                tracing::info!("Sync scheduler stopped after {} timed cycle(s)", cycles)
            }
            Err(e) => tracing::error!("Sync scheduler task failed: {}", e),
        }
    }
}

/// Timer loop. Shutdown is only observed between cycles, so a running
/// cycle always completes.
async fn run_loop(
    cycle: Arc<SyncCycle>,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> u64 {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased;

            _ = shutdown.recv() => {
                tracing::info!("Shutdown signal received, stopping sync scheduler");
                break;
            }

            _ = ticker.tick() => {
                cycles += 1;
                cycle.run().await;
            }
        }
    }
    cycles
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_report_totals() {
        let report = CycleReport {
            tables: vec![
                TableReport {
                    table: "users".into(),
                    rows_applied: 3,
                },
                TableReport {
                    table: "notes".into(),
                    rows_applied: 4,
                },
            ],
            ..Default::default()
        };
        assert!(report.is_success());
        assert_eq!(report.rows_pulled(), 7);

        let failed = CycleReport {
            errors: vec!["users: boom".into()],
            ..Default::default()
        };
        assert!(!failed.is_success());
    }
}
