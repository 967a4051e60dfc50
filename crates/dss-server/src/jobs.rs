//! Periodic background jobs attached to a store.
//!
//! Each store gets a [`JobScheduler`] running two kinds of job:
//! - a pool statistics report on a short fixed interval, awaited inline so
//!   two reports never overlap;
//! - a cleanup job on an operator schedule, where a trigger that fires
//!   while the previous run is still going is skipped, not queued.
//!
//! A failed cleanup run is logged and the schedule carries on.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use dss_datastore::{PoolStats, Store};

use crate::bootstrap::StoreKind;
use crate::schedule::Schedule;

/// Shortest interval between pool statistics reports.
pub const MIN_STATS_INTERVAL: Duration = Duration::from_millis(10);

/// Anything that can report connection pool usage.
pub trait PoolStatsSource: Send + Sync {
    /// Current pool usage.
    fn pool_stats(&self) -> PoolStats;
}

impl PoolStatsSource for Store {
    fn pool_stats(&self) -> PoolStats {
        Store::pool_stats(self)
    }
}

/// A pool that reports no connections at all is unusable even if dialing
/// nominally succeeded.
pub fn pool_is_unusable(stats: &PoolStats) -> bool {
    stats.total == 0
}

/// A job run on a schedule by [`JobScheduler::start_cleanup`].
#[async_trait]
pub trait CleanupJob: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Run once. Returns the number of records removed.
    async fn run(&self) -> Result<u64, dss_datastore::Error>;
}

/// Deletes records whose `ends_at` has passed.
pub struct ExpiredRecordCleanup {
    store: Store,
    tables: &'static [&'static str],
    writer: Option<String>,
}

impl ExpiredRecordCleanup {
    /// Cleanup for the expirable tables of `kind`, optionally limited to
    /// records written by `writer`.
    pub fn new(store: Store, kind: StoreKind, writer: Option<String>) -> Self {
        Self {
            store,
            tables: kind.expirable_tables(),
            writer,
        }
    }
}

#[async_trait]
impl CleanupJob for ExpiredRecordCleanup {
    fn name(&self) -> &str {
        "expired-records"
    }

    async fn run(&self) -> Result<u64, dss_datastore::Error> {
        let mut removed = 0;
        for table in self.tables {
            let context = format!("deleting expired records from {table}");
            let rows = match &self.writer {
                Some(writer) => {
                    let statement = format!("DELETE FROM {table} WHERE ends_at < now() AND writer = $1");
                    let (statement, writer) = (statement.as_str(), writer.as_str());
                    self.store
                        .execute_with_retry(&context, move || sqlx::query(statement).bind(writer))
                        .await?
                }
                None => {
                    let statement = format!("DELETE FROM {table} WHERE ends_at < now()");
                    let statement = statement.as_str();
                    self.store
                        .execute_with_retry(&context, move || sqlx::query(statement))
                        .await?
                }
            };
            debug!(table, rows, "expired records deleted");
            removed += rows;
        }
        Ok(removed)
    }
}

/// Counters kept for one scheduled cleanup job.
#[derive(Debug, Default)]
pub struct JobCounters {
    runs: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
}

impl JobCounters {
    /// Completed runs, successful or not.
    pub fn runs(&self) -> u64 {
        self.runs.load(Ordering::SeqCst)
    }

    /// Triggers skipped because a run was still in progress.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::SeqCst)
    }

    /// Runs that returned an error.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}

/// Clears the running flag when a job run ends, even by panic.
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Background jobs owned by one store.
pub struct JobScheduler {
    store: String,
    cancel: CancellationToken,
    tracker: TaskTracker,
}

impl JobScheduler {
    /// Create a scheduler for `store` that also stops when `parent` is cancelled.
    pub fn new(store: impl Into<String>, parent: &CancellationToken) -> Self {
        Self {
            store: store.into(),
            cancel: parent.child_token(),
            tracker: TaskTracker::new(),
        }
    }

    /// Log pool statistics every `interval`, warning when the pool is empty.
    /// Intervals shorter than [`MIN_STATS_INTERVAL`] are raised to it.
    pub fn start_stats_report(&self, source: Arc<dyn PoolStatsSource>, interval: Duration) {
        if interval < MIN_STATS_INTERVAL {
            warn!(
                store = %self.store,
                requested = ?interval,
                using = ?MIN_STATS_INTERVAL,
                "stats interval too short"
            );
        }
        let interval = interval.max(MIN_STATS_INTERVAL);
        let store = self.store.clone();
        let cancel = self.cancel.clone();

        self.tracker.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let stats = source.pool_stats();
                if pool_is_unusable(&stats) {
                    warn!(store = %store, "connection pool reports no connections");
                } else {
                    debug!(
                        store = %store,
                        total = stats.total,
                        active = stats.active,
                        idle = stats.idle,
                        "connection pool stats"
                    );
                }
            }
            debug!(store = %store, "stats report stopped");
        });
    }

    /// Run `job` on `schedule`, skipping triggers while a run is in progress.
    pub fn start_cleanup(&self, job: Arc<dyn CleanupJob>, schedule: Schedule) -> Arc<JobCounters> {
        let counters = Arc::new(JobCounters::default());
        let running = Arc::new(AtomicBool::new(false));
        let store = self.store.clone();
        let cancel = self.cancel.clone();
        let tracker = self.tracker.clone();
        let loop_counters = Arc::clone(&counters);

        info!(store = %store, job = job.name(), schedule = %schedule, "cleanup job scheduled");

        self.tracker.spawn(async move {
            loop {
                let Some(delay) = schedule.next_delay(Utc::now()) else {
                    warn!(store = %store, job = job.name(), "schedule has no upcoming trigger");
                    break;
                };
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                if running
                    .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    loop_counters.skipped.fetch_add(1, Ordering::SeqCst);
                    debug!(store = %store, job = job.name(), "previous run still in progress, skipping");
                    continue;
                }

                let guard = RunningGuard(Arc::clone(&running));
                let job = Arc::clone(&job);
                let store = store.clone();
                let counters = Arc::clone(&loop_counters);
                tracker.spawn(async move {
                    let _guard = guard;
                    match job.run().await {
                        Ok(removed) => {
                            info!(store = %store, job = job.name(), removed, "cleanup run finished");
                        }
                        Err(e) => {
                            counters.failures.fetch_add(1, Ordering::SeqCst);
                            warn!(store = %store, job = job.name(), error = %e, "cleanup run failed");
                        }
                    }
                    counters.runs.fetch_add(1, Ordering::SeqCst);
                });
            }
            debug!(store = %store, "cleanup trigger stopped");
        });

        counters
    }

    /// Stop triggering new work and wait up to `drain` for running jobs.
    /// Returns whether everything finished in time.
    pub async fn stop(&self, drain: Duration) -> bool {
        self.cancel.cancel();
        self.tracker.close();

        let drained = tokio::time::timeout(drain, self.tracker.wait()).await.is_ok();
        if drained {
            debug!(store = %self.store, "background jobs stopped");
        } else {
            warn!(
                store = %self.store,
                still_running = self.tracker.len(),
                "background jobs did not finish within the drain timeout"
            );
        }
        drained
    }
}
