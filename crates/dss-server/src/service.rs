//! The service run loop: start everything, serve until shutdown, and retry
//! startup with backoff while the datastore is not ready.

use std::future::Future;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::bootstrap::Service;
use crate::config::ServerConfig;
use crate::error::Error;
use crate::health;
use crate::schedule::BackoffSchedule;

/// Run `attempt` until it succeeds, fails fatally, or `cancel` fires.
///
/// Retryable failures sleep for the next delay of `backoff` first. An
/// attempt that fails because of cancellation ends the loop cleanly.
pub async fn run_with_backoff<F, Fut>(
    backoff: &BackoffSchedule,
    cancel: &CancellationToken,
    mut attempt: F,
) -> Result<(), Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), Error>>,
{
    let mut failures = 0;
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }

        let e = match attempt().await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        if cancel.is_cancelled() {
            info!(error = %e, "startup interrupted by shutdown");
            return Ok(());
        }
        if !e.is_retryable() {
            error!(error = %e, "fatal error, not retrying");
            return Err(e);
        }

        let delay = backoff.delay(failures);
        failures += 1;
        warn!(error = %e, attempt = failures, retry_in = ?delay, "startup failed, will retry");

        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// Bring up every store, listen for health probes and run until `cancel`.
pub async fn serve(config: &ServerConfig, cancel: &CancellationToken) -> Result<(), Error> {
    let Some(service) = Service::establish(config, cancel).await? else {
        return Ok(());
    };

    let listener = match TcpListener::bind(&config.addr).await {
        Ok(listener) => listener,
        Err(e) => {
            service.shutdown().await;
            return Err(Error::Listener(format!("binding {}: {e}", config.addr)));
        }
    };

    if let Some(path) = &config.ready_file {
        if let Err(e) = health::write_ready_file(path).await {
            service.shutdown().await;
            return Err(e);
        }
    }
    info!(addr = %config.addr, stores = service.stores().len(), "service ready");

    let token = cancel.clone();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, health::router())
            .with_graceful_shutdown(token.cancelled_owned())
            .await
    });

    let finished = tokio::select! {
        finished = &mut server => finished,
        _ = cancel.cancelled() => match tokio::time::timeout(config.shutdown_drain, &mut server).await {
            Ok(finished) => finished,
            Err(_) => {
                warn!(drain = ?config.shutdown_drain, "listener did not drain in time");
                server.abort();
                Ok(Ok(()))
            }
        },
    };

    if let Some(path) = &config.ready_file {
        health::remove_ready_file(path).await;
    }
    service.shutdown().await;

    match finished {
        Ok(Ok(())) if cancel.is_cancelled() => {
            info!("service stopped");
            Ok(())
        }
        Ok(Ok(())) => Err(Error::Listener("listener exited unexpectedly".to_string())),
        Ok(Err(e)) => Err(Error::Listener(e.to_string())),
        Err(e) => Err(Error::Listener(format!("listener task failed: {e}"))),
    }
}

/// Run the service with startup retries until shutdown or a fatal error.
pub async fn run(config: ServerConfig, cancel: CancellationToken) -> Result<(), Error> {
    run_with_backoff(&config.startup_backoff, &cancel, || serve(&config, &cancel)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn fast_backoff() -> BackoffSchedule {
        BackoffSchedule::new(vec![Duration::from_millis(5), Duration::from_millis(10)]).unwrap()
    }

    fn unreachable() -> Error {
        dss_datastore::Error::NotBootstrapped {
            database: "rid".to_string(),
        }
        .into()
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let cancel = CancellationToken::new();
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        let result = run_with_backoff(&fast_backoff(), &cancel, move || async move {
            match counter.fetch_add(1, Ordering::SeqCst) {
                0..=3 => Err(unreachable()),
                _ => Ok(()),
            }
        })
        .await;

        assert!(result.is_ok());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let cancel = CancellationToken::new();
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        let result = run_with_backoff(&fast_backoff(), &cancel, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Err(Error::from(dss_datastore::Error::UnrecognizedBackend(
                "SQLite 3".to_string(),
            )))
        })
        .await;

        assert!(matches!(
            result,
            Err(Error::Datastore(dss_datastore::Error::UnrecognizedBackend(_)))
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_backoff_is_clean() {
        let cancel = CancellationToken::new();
        let backoff = BackoffSchedule::new(vec![Duration::from_secs(60)]).unwrap();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });

        let started = std::time::Instant::now();
        let result = run_with_backoff(&backoff, &cancel, || async { Err::<(), _>(unreachable()) }).await;

        assert!(result.is_ok());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_error_after_cancellation_is_not_surfaced() {
        let cancel = CancellationToken::new();
        let token = &cancel;
        let result = run_with_backoff(&fast_backoff(), &cancel, move || async move {
            token.cancel();
            Err::<(), _>(Error::Listener("connection closed".to_string()))
        })
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_already_cancelled_never_attempts() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let attempts = AtomicUsize::new(0);
        let counter = &attempts;

        run_with_backoff(&fast_backoff(), &cancel, move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .await
        .unwrap();
        assert_eq!(attempts.load(Ordering::SeqCst), 0);
    }
}
