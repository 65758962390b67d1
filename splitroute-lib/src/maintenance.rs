//! Scheduled housekeeping.
use tokio::fs;
use tokio_util::sync::CancellationToken;

use std::io;
use std::path::{Path, PathBuf};

use crate::schedule::{self, Schedule};

/// Empties the file in place. Writers holding it open in append mode continue at the new end.
pub async fn truncate_log(path: &Path) -> Result<(), io::Error> {
    let file = fs::OpenOptions::new().write(true).open(path).await?;
    file.set_len(0).await
}

/// Truncates `path` at every occurrence of `schedule`.
pub async fn run_log_truncation(schedule: Schedule, path: PathBuf, cancel: CancellationToken) {
    schedule::run("log-truncation", schedule, cancel, || {
        let path = path.clone();
        async move {
            match truncate_log(&path).await {
                Ok(()) => tracing::info!(path = %path.display(), "log file truncated"),
                Err(e) => tracing::error!(path = %path.display(), error = %e, "failed to truncate log file"),
            }
        }
    })
    .await
}
