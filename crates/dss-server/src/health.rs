//! Health listener and ready file.

use std::io::ErrorKind;
use std::path::Path;

use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;
use tracing::{debug, warn};

use crate::error::Error;

/// Router answering liveness probes.
pub fn router() -> Router {
    Router::new()
        .route("/healthy", get(healthy))
        .layer(TraceLayer::new_for_http())
}

async fn healthy() -> &'static str {
    "ok"
}

/// Create the ready file, including missing parent directories.
pub async fn write_ready_file(path: &Path) -> Result<(), Error> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, b"ready\n").await?;
    debug!(path = %path.display(), "ready file written");
    Ok(())
}

/// Remove the ready file. A file that is already gone is not an error.
pub async fn remove_ready_file(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "ready file removed"),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove ready file"),
    }
}
