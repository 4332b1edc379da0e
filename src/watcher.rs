//! Folder watcher for incremental re-sync.
//!
//! Change notifications are collected per path and handed to
//! [`Importer::sync_watched`] once a path has been quiet for the debounce
//! interval, so an editor's save burst results in one re-index. Paths the
//! folder import would not pick up (excluded, hidden, or outside the
//! watched root) are dropped before they reach the debouncer.

use anyhow::{Context, Result};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::discover::{self, PathFilter};
use crate::ingest::{Importer, SyncOutcome};

const DEFAULT_DEBOUNCE_MS: u64 = 300;
const TICK_MS: u64 = 50;

/// Watches one folder recursively until dropped.
pub struct FolderWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FolderWatcher {
    pub fn start(root: &Path, importer: Arc<Importer>) -> Result<Self> {
        let root = discover::canonical_path(root);
        let filter = PathFilter::new(&importer.config().import)?;
        let (tx, rx) = mpsc::channel::<PathBuf>(256);

        let event_root = root.clone();
        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                // Called from notify's own thread.
                Ok(event) => {
                    for path in wanted_paths(&filter, &event_root, event) {
                        let _ = tx.blocking_send(path);
                    }
                }
                Err(e) => tracing::warn!(error = %e, "watch error"),
            },
            Config::default(),
        )
        .context("Failed to create file watcher")?;
        watcher
            .watch(&root, RecursiveMode::Recursive)
            .with_context(|| format!("Failed to watch {}", root.display()))?;

        tracing::info!(folder = %root.display(), "watching for changes");

        let quiet = Duration::from_millis(DEFAULT_DEBOUNCE_MS);
        let task = tokio::spawn(debounce(rx, quiet, move |path| {
            let importer = Arc::clone(&importer);
            let root = root.clone();
            async move { resync(&importer, &root, &path).await }
        }));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Wait until the watcher task ends (it only ends on drop or panic).
    pub async fn run(&mut self) -> Result<()> {
        (&mut self.task).await.context("watcher task failed")
    }
}

impl Drop for FolderWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Collect paths from `rx` and pass each to `flush` once it has been quiet
/// for `quiet`. The flush clock keeps running while events arrive.
async fn debounce<F, Fut>(mut rx: mpsc::Receiver<PathBuf>, quiet: Duration, mut flush: F)
where
    F: FnMut(PathBuf) -> Fut,
    Fut: Future<Output = ()>,
{
    let mut pending = Debouncer::new(quiet);
    let mut tick = tokio::time::interval(Duration::from_millis(TICK_MS));
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            path = rx.recv() => {
                match path {
                    Some(path) => pending.push(path, Instant::now()),
                    None => break,
                }
            }
            _ = tick.tick() => {
                for path in pending.take_ready(Instant::now()) {
                    flush(path).await;
                }
            }
        }
    }
}

fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
    )
}

fn wanted_paths(filter: &PathFilter, root: &Path, event: Event) -> Vec<PathBuf> {
    if !is_relevant(&event.kind) {
        return Vec::new();
    }
    event
        .paths
        .into_iter()
        .filter(|path| filter.allows(root, path))
        .collect()
}

async fn resync(importer: &Importer, root: &Path, path: &Path) {
    match importer.sync_watched(root, path).await {
        Ok(SyncOutcome::Indexed {
            passages,
            embeddings,
        }) => {
            tracing::info!(path = %path.display(), passages, embeddings, "re-indexed");
        }
        Ok(SyncOutcome::Removed) => {
            tracing::info!(path = %path.display(), "removed from index");
        }
        Ok(SyncOutcome::Unchanged) => {
            tracing::debug!(path = %path.display(), "unchanged");
        }
        Ok(SyncOutcome::Skipped(e)) => {
            tracing::debug!(path = %path.display(), reason = e.kind(), "not indexed");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "re-sync failed");
        }
    }
}

/// Latest-event-wins path collector.
struct Debouncer {
    quiet: Duration,
    pending: HashMap<PathBuf, Instant>,
}

impl Debouncer {
    fn new(quiet: Duration) -> Self {
        Self {
            quiet,
            pending: HashMap::new(),
        }
    }

    fn push(&mut self, path: PathBuf, at: Instant) {
        self.pending.insert(path, at);
    }

    /// Paths quiet for at least the debounce interval, sorted.
    fn take_ready(&mut self, now: Instant) -> Vec<PathBuf> {
        let quiet = self.quiet;
        let mut ready = Vec::new();
        self.pending.retain(|path, last| {
            if now.duration_since(*last) >= quiet {
                ready.push(path.clone());
                false
            } else {
                true
            }
        });
        ready.sort();
        ready
    }
}
