//! Startup behaviour against datastores that are not there.

use std::time::{Duration, Instant};

use dss_datastore::{ConnectParameters, PoolSizing};
use dss_server::{BackoffSchedule, Error, ServerConfig};
use tokio_util::sync::CancellationToken;

fn unreachable_datastore() -> ConnectParameters {
    // Nothing listens on the discard port.
    ConnectParameters::new("127.0.0.1")
        .with_port(9)
        .with_pool(PoolSizing {
            acquire_timeout: Duration::from_millis(200),
            ..PoolSizing::default()
        })
}

#[tokio::test]
async fn test_unreachable_datastore_retries_until_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let ready = dir.path().join("ready");

    let config = ServerConfig::new(unreachable_datastore())
        .with_addr("127.0.0.1:0")
        .with_ready_file(&ready)
        .with_startup_backoff(BackoffSchedule::new(vec![Duration::from_millis(20)]).unwrap());

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(600)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = dss_server::run(config, cancel).await;

    assert!(result.is_ok(), "unexpected result: {result:?}");
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(!ready.exists());
}

#[tokio::test]
async fn test_invalid_parameters_are_fatal() {
    let params = ConnectParameters::new("127.0.0.1").with_pool(PoolSizing {
        max_open_conns: 0,
        ..PoolSizing::default()
    });
    let config = ServerConfig::new(params)
        .with_startup_backoff(BackoffSchedule::new(vec![Duration::from_secs(60)]).unwrap());

    let result = dss_server::run(config, CancellationToken::new()).await;

    match result {
        Err(Error::Datastore(dss_datastore::Error::InvalidParameters(_))) => {}
        other => panic!("expected a fatal parameter error, got {other:?}"),
    }
}
