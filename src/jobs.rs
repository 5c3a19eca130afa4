//! Background jobs.
//!
//! Each job runs in its own task and contains its own failures: a failed
//! save or cleanup is logged and retried on the next tick.

use crate::memory::{MemoryStore, SharedMemory};
use glob::glob;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Save the memory every `interval`
pub fn spawn_periodic_save(
    store: Arc<MemoryStore>,
    memory: SharedMemory,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match store.save_shared(&memory).await {
                Ok(()) => debug!("Periodic save done"),
                Err(e) => error!("Periodic save failed: {}", e),
            }
        }
    })
}

/// Delete files older than `max_age` under `dir`, every hour
pub fn spawn_file_cleanup(dir: PathBuf, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        loop {
            ticker.tick().await;
            let dir = dir.clone();
            let result =
                tokio::task::spawn_blocking(move || delete_old_files(&dir, max_age, SystemTime::now()))
                    .await;
            match result {
                Ok(0) => debug!("File cleanup: nothing to delete"),
                Ok(removed) => info!("File cleanup: deleted {} old files", removed),
                Err(e) => error!("File cleanup task failed: {}", e),
            }
        }
    })
}

/// Remove regular files under `dir` last modified before `now - max_age`.
/// Returns how many were deleted.
pub fn delete_old_files(dir: &Path, max_age: Duration, now: SystemTime) -> usize {
    let pattern = dir.join("**").join("*");
    let Some(pattern) = pattern.to_str() else {
        warn!("File cleanup: non UTF-8 path {}", dir.display());
        return 0;
    };

    let entries = match glob(pattern) {
        Ok(entries) => entries,
        Err(e) => {
            warn!("File cleanup: bad pattern {}: {}", pattern, e);
            return 0;
        }
    };

    let mut removed = 0;
    for path in entries.flatten() {
        let modified = match std::fs::metadata(&path) {
            Ok(meta) if meta.is_file() => meta.modified(),
            Ok(_) => continue,
            Err(e) => {
                warn!("File cleanup: {}: {}", path.display(), e);
                continue;
            }
        };
        let is_old = modified
            .ok()
            .and_then(|modified| now.duration_since(modified).ok())
            .is_some_and(|age| age > max_age);
        if !is_old {
            continue;
        }
        match std::fs::remove_file(&path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("File cleanup: could not delete {}: {}", path.display(), e),
        }
    }
    removed
}
