//! Bringing up the datastore connections the service depends on.
//!
//! Every logical store is dialed, its backend identified and its schema
//! checked against the minimum this build understands. Once a store is up
//! its background jobs start. When a later store fails, or shutdown arrives
//! mid-startup, the stores already up are torn down in reverse order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use dss_datastore::{BackendFamily, ConnectParameters, Store};

use crate::config::ServerConfig;
use crate::error::Error;
use crate::jobs::{ExpiredRecordCleanup, JobCounters, JobScheduler};

/// A logical store the service keeps a pool for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreKind {
    /// Remote ID: identification service areas and their subscriptions.
    RemoteId,
    /// Strategic conflict detection: operational intents and subscriptions.
    ConflictDetection,
}

impl StoreKind {
    /// Database name used by current schemas.
    pub fn database(&self) -> &'static str {
        match self {
            StoreKind::RemoteId => "rid",
            StoreKind::ConflictDetection => "scd",
        }
    }

    /// Name the database had before it was renamed, if any.
    pub fn legacy_database(&self) -> Option<&'static str> {
        match self {
            StoreKind::RemoteId => Some("defaultdb"),
            StoreKind::ConflictDetection => None,
        }
    }

    /// Oldest schema version the service can run against.
    pub fn minimum_schema_version(&self, family: BackendFamily) -> Version {
        match (self, family) {
            (StoreKind::RemoteId, BackendFamily::Cockroach) => Version::new(3, 1, 0),
            (StoreKind::ConflictDetection, BackendFamily::Cockroach) => Version::new(3, 0, 0),
            (_, BackendFamily::Yugabyte) => Version::new(1, 0, 0),
        }
    }

    /// Tables holding records that expire through `ends_at`.
    pub fn expirable_tables(&self) -> &'static [&'static str] {
        match self {
            StoreKind::RemoteId => &["identification_service_areas", "subscriptions"],
            StoreKind::ConflictDetection => &["scd_operations", "scd_subscriptions"],
        }
    }

    /// Human-readable name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            StoreKind::RemoteId => "remote ID",
            StoreKind::ConflictDetection => "conflict detection",
        }
    }
}

/// Connect to `kind`'s database, falling back once to its legacy name when
/// the current one is absent or not bootstrapped.
///
/// `connect` receives the database name to try. When the fallback also
/// fails, the error for the current name is returned.
pub async fn connect_with_fallback<T, F, Fut>(
    kind: StoreKind,
    mut connect: F,
) -> Result<T, dss_datastore::Error>
where
    F: FnMut(&'static str) -> Fut,
    Fut: Future<Output = Result<T, dss_datastore::Error>>,
{
    let primary = match connect(kind.database()).await {
        Ok(connected) => return Ok(connected),
        Err(e) => e,
    };

    let legacy = match (kind.legacy_database(), &primary) {
        (
            Some(legacy),
            dss_datastore::Error::DatabaseMissing { .. } | dss_datastore::Error::NotBootstrapped { .. },
        ) => legacy,
        _ => return Err(primary),
    };

    info!(
        store = kind.label(),
        database = kind.database(),
        legacy,
        reason = %primary,
        "trying legacy database name"
    );
    match connect(legacy).await {
        Ok(connected) => Ok(connected),
        Err(e) => {
            warn!(store = kind.label(), database = legacy, error = %e, "legacy database unusable");
            Err(primary)
        }
    }
}

/// Dial `database` and check its schema is new enough for `kind`.
pub async fn open_store(
    params: &ConnectParameters,
    kind: StoreKind,
    database: &str,
) -> Result<Store, dss_datastore::Error> {
    let store = Store::dial(params, database).await?;
    let minimum = kind.minimum_schema_version(store.backend().family);

    match store.require_schema(&minimum).await {
        Ok(version) => {
            info!(
                store = kind.label(),
                database,
                schema_version = %version,
                minimum = %minimum,
                "store schema verified"
            );
            Ok(store)
        }
        Err(e) => {
            store.close().await;
            Err(e)
        }
    }
}

/// Bring up one handle per kind in order. If any fails, or `cancel` fires
/// before all are up, the handles already up are passed to `teardown`
/// newest first. Returns `Ok(None)` when cancelled.
pub async fn bring_up_all<T, E, Up, UpFut, Down, DownFut>(
    kinds: &[StoreKind],
    cancel: &CancellationToken,
    mut bring_up: Up,
    mut teardown: Down,
) -> Result<Option<Vec<T>>, E>
where
    Up: FnMut(StoreKind) -> UpFut,
    UpFut: Future<Output = Result<T, E>>,
    Down: FnMut(T) -> DownFut,
    DownFut: Future<Output = ()>,
{
    let mut up = Vec::with_capacity(kinds.len());
    for &kind in kinds {
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            result = bring_up(kind) => Some(result),
        };

        let failure = match outcome {
            Some(Ok(handle)) => {
                up.push(handle);
                continue;
            }
            Some(Err(e)) => Err(e),
            None => {
                info!(store = kind.label(), "startup cancelled");
                Ok(None)
            }
        };

        while let Some(handle) = up.pop() {
            teardown(handle).await;
        }
        return failure;
    }
    Ok(Some(up))
}

/// A live store together with the jobs that depend on it.
pub struct StoreHandle {
    kind: StoreKind,
    store: Store,
    jobs: JobScheduler,
    cleanup: Arc<JobCounters>,
}

impl StoreHandle {
    /// Connect the store for `kind` and start its background jobs.
    pub async fn establish(
        config: &ServerConfig,
        kind: StoreKind,
        cancel: &CancellationToken,
    ) -> Result<Self, Error> {
        let store = connect_with_fallback(kind, |database| {
            open_store(&config.connect, kind, database)
        })
        .await?;

        let jobs = JobScheduler::new(store.database(), cancel);
        jobs.start_stats_report(Arc::new(store.clone()), config.stats_interval);
        let cleanup = jobs.start_cleanup(
            Arc::new(ExpiredRecordCleanup::new(
                store.clone(),
                kind,
                config.locality.clone(),
            )),
            config.cleanup_schedule.clone(),
        );

        info!(
            store = kind.label(),
            database = store.database(),
            backend = %store.backend(),
            "store ready"
        );

        Ok(Self {
            kind,
            store,
            jobs,
            cleanup,
        })
    }

    /// Which store this is.
    pub fn kind(&self) -> StoreKind {
        self.kind
    }

    /// The pooled store.
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Counters for the cleanup job.
    pub fn cleanup_counters(&self) -> &JobCounters {
        &self.cleanup
    }

    /// Stop background jobs, then close the pool.
    pub async fn shutdown(self, drain: Duration) {
        self.jobs.stop(drain).await;
        self.store.close().await;
        info!(store = self.kind.label(), "store shut down");
    }
}

/// Every store the service runs against.
pub struct Service {
    stores: Vec<StoreHandle>,
    drain: Duration,
}

impl Service {
    /// Bring up every store `config` asks for. Stores already up are torn
    /// down if a later one fails or `cancel` fires, in which case `None`
    /// is returned.
    pub async fn establish(
        config: &ServerConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<Self>, Error> {
        let drain = config.shutdown_drain;
        let stores = bring_up_all(
            &config.store_kinds(),
            cancel,
            |kind| StoreHandle::establish(config, kind, cancel),
            |handle| handle.shutdown(drain),
        )
        .await?;

        Ok(stores.map(|stores| Self { stores, drain }))
    }

    /// Live stores in the order they were brought up.
    pub fn stores(&self) -> &[StoreHandle] {
        &self.stores
    }

    /// Tear down every store, newest first.
    pub async fn shutdown(mut self) {
        while let Some(handle) = self.stores.pop() {
            handle.shutdown(self.drain).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn missing(database: &str) -> dss_datastore::Error {
        dss_datastore::Error::DatabaseMissing {
            database: database.to_string(),
        }
    }

    #[test]
    fn test_store_kind_names() {
        assert_eq!(StoreKind::RemoteId.database(), "rid");
        assert_eq!(StoreKind::RemoteId.legacy_database(), Some("defaultdb"));
        assert_eq!(StoreKind::ConflictDetection.database(), "scd");
        assert_eq!(StoreKind::ConflictDetection.legacy_database(), None);
    }

    #[test]
    fn test_minimum_schema_versions() {
        assert_eq!(
            StoreKind::RemoteId.minimum_schema_version(BackendFamily::Cockroach),
            Version::new(3, 1, 0)
        );
        assert_eq!(
            StoreKind::ConflictDetection.minimum_schema_version(BackendFamily::Yugabyte),
            Version::new(1, 0, 0)
        );
    }

    #[tokio::test]
    async fn test_fallback_not_needed() {
        let tried = Mutex::new(Vec::new());
        let result = connect_with_fallback(StoreKind::RemoteId, |db| {
            tried.lock().unwrap().push(db);
            async move { Ok::<_, dss_datastore::Error>(db) }
        })
        .await;

        assert_eq!(result.unwrap(), "rid");
        assert_eq!(*tried.lock().unwrap(), ["rid"]);
    }

    #[tokio::test]
    async fn test_fallback_to_legacy_database() {
        let tried = Mutex::new(Vec::new());
        let result = connect_with_fallback(StoreKind::RemoteId, |db| {
            tried.lock().unwrap().push(db);
            async move {
                match db {
                    "rid" => Err(missing(db)),
                    _ => Ok(db),
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "defaultdb");
        assert_eq!(*tried.lock().unwrap(), ["rid", "defaultdb"]);
    }

    #[tokio::test]
    async fn test_fallback_on_unbootstrapped() {
        let result = connect_with_fallback(StoreKind::RemoteId, |db| async move {
            match db {
                "rid" => Err(dss_datastore::Error::NotBootstrapped {
                    database: db.to_string(),
                }),
                _ => Ok(db),
            }
        })
        .await;
        assert_eq!(result.unwrap(), "defaultdb");
    }

    #[tokio::test]
    async fn test_fallback_failure_reports_current_name() {
        let result: Result<(), _> =
            connect_with_fallback(StoreKind::RemoteId, |db| async move { Err(missing(db)) }).await;

        match result {
            Err(dss_datastore::Error::DatabaseMissing { database }) => assert_eq!(database, "rid"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_fallback_for_fatal_errors() {
        let tried = Mutex::new(Vec::new());
        let result: Result<(), _> = connect_with_fallback(StoreKind::RemoteId, |db| {
            tried.lock().unwrap().push(db);
            async move { Err(dss_datastore::Error::UnrecognizedBackend("MySQL 8".to_string())) }
        })
        .await;

        assert!(!result.unwrap_err().is_retryable());
        assert_eq!(*tried.lock().unwrap(), ["rid"]);
    }

    #[tokio::test]
    async fn test_no_fallback_without_legacy_name() {
        let tried = Mutex::new(Vec::new());
        let result: Result<(), _> = connect_with_fallback(StoreKind::ConflictDetection, |db| {
            tried.lock().unwrap().push(db);
            async move { Err(missing(db)) }
        })
        .await;

        assert!(result.unwrap_err().is_retryable());
        assert_eq!(*tried.lock().unwrap(), ["scd"]);
    }

    #[tokio::test]
    async fn test_bring_up_all_in_order() {
        let down = Mutex::new(Vec::new());
        let kinds = [StoreKind::RemoteId, StoreKind::ConflictDetection];

        let up = bring_up_all(
            &kinds,
            &CancellationToken::new(),
            |kind| async move { Ok::<_, String>(kind.database()) },
            |db| {
                down.lock().unwrap().push(db);
                async {}
            },
        )
        .await
        .unwrap()
        .unwrap();

        assert_eq!(up, ["rid", "scd"]);
        assert!(down.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_bring_up_is_torn_down() {
        let down = Mutex::new(Vec::new());
        let kinds = [StoreKind::RemoteId, StoreKind::ConflictDetection];

        let result = bring_up_all(
            &kinds,
            &CancellationToken::new(),
            |kind| async move {
                match kind {
                    StoreKind::RemoteId => Ok(kind.database()),
                    StoreKind::ConflictDetection => Err("scd unreachable".to_string()),
                }
            },
            |db| {
                down.lock().unwrap().push(db);
                async {}
            },
        )
        .await;

        assert_eq!(result.unwrap_err(), "scd unreachable");
        assert_eq!(*down.lock().unwrap(), ["rid"]);
    }

    #[tokio::test]
    async fn test_cancelled_bring_up_is_torn_down() {
        let down = Mutex::new(Vec::new());
        let kinds = [StoreKind::RemoteId, StoreKind::ConflictDetection];
        let cancel = CancellationToken::new();
        let token = &cancel;

        let result = bring_up_all(
            &kinds,
            &cancel,
            move |kind| async move {
                match kind {
                    StoreKind::RemoteId => Ok::<_, String>(kind.database()),
                    StoreKind::ConflictDetection => {
                        // Shutdown arrives while this store is still dialing.
                        token.cancel();
                        std::future::pending().await
                    }
                }
            },
            |db| {
                down.lock().unwrap().push(db);
                async {}
            },
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(*down.lock().unwrap(), ["rid"]);
    }

    #[tokio::test]
    async fn test_already_cancelled_brings_nothing_up() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = Mutex::new(0);

        let result = bring_up_all(
            &[StoreKind::RemoteId],
            &cancel,
            |kind| {
                *attempts.lock().unwrap() += 1;
                async move { Ok::<_, String>(kind.database()) }
            },
            |_| async {},
        )
        .await;

        assert_eq!(result, Ok(None));
        assert_eq!(*attempts.lock().unwrap(), 0);
    }
}
