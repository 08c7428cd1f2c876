//! File system watcher re-syncing the manifest directory on change.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, DebouncedEvent, Debouncer};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::loader::is_manifest_file;
use super::sync::ManifestSync;
use super::{ManifestError, Result};

/// Watches the manifest directory and re-applies it after each burst of changes.
pub struct ManifestWatcher {
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl ManifestWatcher {
    /// Starts watching. Must be called within a tokio runtime.
    pub fn start(sync: Arc<ManifestSync>, debounce: Duration) -> Result<Self> {
        let dir = sync.loader().manifest_dir().to_path_buf();
        let (tx, mut rx) = mpsc::unbounded_channel::<DebounceEventResult>();

        let mut debouncer: Debouncer<RecommendedWatcher> =
            new_debouncer(debounce, move |result: DebounceEventResult| {
                let _ = tx.send(result);
            })
            .map_err(|e| ManifestError::WatchError(e.to_string()))?;

        debouncer
            .watcher()
            .watch(&dir, RecursiveMode::Recursive)
            .map_err(|e| ManifestError::WatchError(e.to_string()))?;

        log::info!("Started watching manifest directory: {}", dir.display());

        let (shutdown, mut shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            // Dropping the debouncer stops the underlying watcher.
            let _debouncer = debouncer;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    received = rx.recv() => match received {
                        Some(Ok(events)) => {
                            if !events.iter().any(|e| is_relevant(&dir, e)) {
                                continue;
                            }
                            match sync.sync().await {
                                Ok(summary) => log::info!("Manifests re-applied: {:?}", summary),
                                Err(e) => log::error!("Failed to apply manifests: {}", e),
                            }
                        }
                        Some(Err(e)) => log::error!("Watch error: {}", e),
                        None => break,
                    },
                }
            }

            log::info!("Stopped watching manifest directory");
        });

        Ok(Self {
            shutdown,
            handle: Some(handle),
        })
    }

    /// Stops the watcher and waits for its task to finish.
    pub async fn stop(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for ManifestWatcher {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Manifest files, directories, and removed paths (which may have been either).
fn is_relevant(dir: &Path, event: &DebouncedEvent) -> bool {
    let path = &event.path;
    let Ok(relative) = path.strip_prefix(dir) else {
        return false;
    };
    let hidden = relative
        .components()
        .any(|c| c.as_os_str().to_string_lossy().starts_with('.'));
    !hidden && (is_manifest_file(path) || path.is_dir() || !path.exists())
}
