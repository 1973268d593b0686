//! Snapshot polling fallback for filesystems without native change events

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::{Duration, UNIX_EPOCH};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

use super::registry::{ChangeEvent, ChangeHandler, WatchConfig};

/// Per-file identity compared between snapshots: (mtime nanos, size)
type Snapshot = HashMap<PathBuf, (u64, u64)>;

/// Spawn a polling task that diffs (mtime, size) snapshots of the watched
/// trees. Polling cannot attribute differences to specific paths, so every
/// detected change reports `needs_rebuild`.
pub(super) fn spawn_polling(
    key: &str,
    config: &WatchConfig,
    handler: ChangeHandler,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let key = key.to_string();
    let paths = config.paths.clone();
    let poll_interval = config.poll_interval;
    tokio::spawn(async move {
        let mut last = snapshot_trees(paths.clone()).await;
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let current = snapshot_trees(paths.clone()).await;
            if current != last {
                debug!(key = %key, files = current.len(), "polling detected changes");
                last = current;
                handler(ChangeEvent {
                    paths: Vec::new(),
                    needs_rebuild: true,
                });
            }
        }
        debug!(key = %key, "polling task exiting");
    })
}

async fn snapshot_trees(paths: Vec<PathBuf>) -> Snapshot {
    tokio::task::spawn_blocking(move || take_snapshot(&paths))
        .await
        .unwrap_or_default()
}

/// Stat every file under the watched trees, skipping hidden entries
fn take_snapshot(paths: &[PathBuf]) -> Snapshot {
    let mut snapshot = Snapshot::new();
    for root in paths {
        let walk = WalkDir::new(root)
            .into_iter()
            .filter_entry(|entry| !is_hidden(entry))
            .filter_map(|entry| entry.ok());
        for entry in walk {
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(metadata) = entry.metadata() else {
                continue;
            };
            let mtime = metadata
                .modified()
                .ok()
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map(|elapsed| {
                    elapsed
                        .as_secs()
                        .saturating_mul(1_000_000_000)
                        .saturating_add(u64::from(elapsed.subsec_nanos()))
                })
                .unwrap_or(0);
            snapshot.insert(entry.into_path(), (mtime, metadata.len()));
        }
    }
    snapshot
}

fn is_hidden(entry: &walkdir::DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_string_lossy().starts_with('.')
}

// ============================================================================
// Tests
// ============================================================================
