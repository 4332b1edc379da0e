//! Import pipeline orchestration.
//!
//! Drives each file through `read → extract → chunk → embed? → store`.
//! A folder import walks the folder, indexes new and changed files, prunes
//! records of files that vanished, and reports progress per file and per
//! embedded batch. Single-path re-sync handles one file-system change.
//!
//! Every pass over one file (read, embed, write, or delete) holds that
//! file's path lock, so an import and a watcher re-sync of the same file
//! run one after the other and the newest content is written last.
//!
//! Per-file problems (unsupported format, unreadable content, a failed
//! store write) skip that file and the import continues. Only cancellation
//! or a fatal store error ends an import early.

use anyhow::Result;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::chunk::chunk_text;
use crate::config::Config;
use crate::discover;
use crate::embedding::EmbeddingEngine;
use crate::error::{FileError, StoreError};
use crate::extract::Extractors;
use crate::models::FileState;
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::store::IndexStore;

/// Shared cancellation flag, checked between files.
#[derive(Clone, Debug, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ImportSummary {
    pub files_imported: usize,
    pub chunks_created: usize,
    pub skipped: usize,
    pub embeddings_generated: usize,
    /// Records deleted because their file vanished or lost all text.
    pub removed: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ImportOutcome {
    Completed(ImportSummary),
    /// Files finished before the cancel stay indexed.
    Cancelled {
        files_processed: usize,
        summary: ImportSummary,
    },
}

impl ImportOutcome {
    pub fn summary(&self) -> &ImportSummary {
        match self {
            ImportOutcome::Completed(summary) => summary,
            ImportOutcome::Cancelled { summary, .. } => summary,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, ImportOutcome::Cancelled { .. })
    }
}

/// What happened to a single path.
#[derive(Debug)]
pub enum SyncOutcome {
    Indexed { passages: usize, embeddings: usize },
    /// Timestamp or content unchanged since the last import.
    Unchanged,
    Removed,
    Skipped(FileError),
}

/// Per-file failure split into "skip and continue" and "stop the import".
enum FileFailure {
    Skip(FileError),
    Fatal(anyhow::Error),
}

impl From<FileError> for FileFailure {
    fn from(e: FileError) -> Self {
        FileFailure::Skip(e)
    }
}

impl From<StoreError> for FileFailure {
    fn from(e: StoreError) -> Self {
        if e.is_fatal() {
            FileFailure::Fatal(e.into())
        } else {
            FileFailure::Skip(FileError::StoreWrite(e.to_string()))
        }
    }
}

/// Where a file sits in the current import, for progress events.
struct Position<'a> {
    current: usize,
    total: usize,
    sink: &'a dyn ProgressSink,
}

/// One async mutex per file path. Entries nobody holds or waits on are
/// dropped on the next acquisition.
#[derive(Default)]
struct PathLocks {
    held: std::sync::Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl PathLocks {
    async fn lock(&self, path: &Path) -> OwnedMutexGuard<()> {
        let lock = {
            let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
            held.retain(|_, m| Arc::strong_count(m) > 1);
            Arc::clone(held.entry(path.to_path_buf()).or_default())
        };
        lock.lock_owned().await
    }
}

pub struct Importer {
    config: Config,
    store: Arc<IndexStore>,
    engine: Arc<EmbeddingEngine>,
    extractors: Arc<Extractors>,
    path_locks: PathLocks,
    // Serialises index writes so a file's record and passages change together.
    write_lock: Mutex<()>,
}

impl Importer {
    pub fn new(
        config: Config,
        store: Arc<IndexStore>,
        engine: Arc<EmbeddingEngine>,
        extractors: Arc<Extractors>,
    ) -> Self {
        Self {
            config,
            store,
            engine,
            extractors,
            path_locks: PathLocks::default(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Import every supported file under `root`.
    ///
    /// Unless `full` is set, files whose modification time matches the
    /// index are skipped without being read.
    pub async fn import_folder(
        &self,
        root: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        full: bool,
    ) -> Result<ImportOutcome> {
        let root = discover::canonical_path(root);
        let scan = discover::scan_folder(&root, &self.config.import, &self.extractors)?;
        let total = scan.files.len();

        tracing::info!(folder = %root.display(), files = total, "import started");

        let mut summary = ImportSummary {
            skipped: scan.unsupported.len(),
            ..Default::default()
        };
        for path in &scan.unsupported {
            tracing::debug!(path = %path.display(), "skipped: unsupported format");
        }

        for (i, path) in scan.files.iter().enumerate() {
            if cancel.is_cancelled() {
                tracing::info!(files_processed = i, "import cancelled");
                return Ok(ImportOutcome::Cancelled {
                    files_processed: i,
                    summary,
                });
            }

            let name = display_name(path);
            let pos = Position {
                current: i + 1,
                total,
                sink,
            };
            sink.report(&ProgressEvent::reading(pos.current, total, &name));

            match self.index_file(path, &pos, full).await {
                Ok(SyncOutcome::Indexed {
                    passages,
                    embeddings,
                }) => {
                    summary.files_imported += 1;
                    summary.chunks_created += passages;
                    summary.embeddings_generated += embeddings;
                }
                Ok(SyncOutcome::Unchanged) => summary.skipped += 1,
                Ok(SyncOutcome::Removed) => {
                    summary.removed += 1;
                    summary.skipped += 1;
                }
                Ok(SyncOutcome::Skipped(e)) | Err(FileFailure::Skip(e)) => {
                    tracing::warn!(path = %path.display(), reason = e.kind(), "skipped: {}", e);
                    summary.skipped += 1;
                }
                Err(FileFailure::Fatal(e)) => return Err(e),
            }

            sink.report(&ProgressEvent::done(pos.current, total, &name));
        }

        summary.removed += self.prune(&root, &root, &scan.files).await?;

        sink.report(&ProgressEvent::done(total, total, ""));
        tracing::info!(
            files_imported = summary.files_imported,
            chunks_created = summary.chunks_created,
            skipped = summary.skipped,
            embeddings_generated = summary.embeddings_generated,
            removed = summary.removed,
            "import finished"
        );
        Ok(ImportOutcome::Completed(summary))
    }

    /// Re-sync a single path after a create, modify or delete notification.
    ///
    /// A path that vanished drops every record at or below it, so deleting
    /// or moving a directory away removes its files too. A directory that
    /// appeared is walked and each supported file in it indexed.
    pub async fn sync_path(&self, path: &Path) -> Result<SyncOutcome> {
        let path = discover::canonical_path(path);
        self.sync(&path, None).await
    }

    /// [`Importer::sync_path`] for a change reported under a watched `root`.
    /// Paths a folder import of `root` would skip are left alone.
    pub async fn sync_watched(&self, root: &Path, path: &Path) -> Result<SyncOutcome> {
        let path = discover::canonical_path(path);
        let filter = discover::PathFilter::new(&self.config.import)?;
        if !filter.allows(root, &path) {
            return Ok(SyncOutcome::Unchanged);
        }
        self.sync(&path, Some(root)).await
    }

    async fn sync(&self, path: &Path, root: Option<&Path>) -> Result<SyncOutcome> {
        if !path.exists() {
            return self.remove_under(path).await;
        }
        if path.is_dir() {
            return self.sync_folder(root.unwrap_or(path), path).await;
        }
        if !path.is_file() {
            return Ok(SyncOutcome::Unchanged);
        }

        let pos = Position {
            current: 1,
            total: 1,
            sink: &NoProgress,
        };
        match self.index_file(path, &pos, false).await {
            Ok(outcome) => Ok(outcome),
            Err(FileFailure::Skip(e)) => {
                tracing::warn!(path = %path.display(), reason = e.kind(), "skipped: {}", e);
                Ok(SyncOutcome::Skipped(e))
            }
            Err(FileFailure::Fatal(e)) => Err(e),
        }
    }

    async fn remove_under(&self, path: &Path) -> Result<SyncOutcome> {
        let records = self.store.list_files_under(path).await?;
        let mut removed = 0;
        for record in &records {
            if self.remove_record(Path::new(&record.path)).await? {
                removed += 1;
            }
        }
        if removed == 0 {
            return Ok(SyncOutcome::Unchanged);
        }
        tracing::info!(path = %path.display(), files = removed, "removed from index");
        Ok(SyncOutcome::Removed)
    }

    /// Index a directory that appeared below `root`. Per-file skips are
    /// logged; the outcome sums what was indexed.
    async fn sync_folder(&self, root: &Path, dir: &Path) -> Result<SyncOutcome> {
        let scan = discover::scan_under(root, dir, &self.config.import, &self.extractors)?;
        let total = scan.files.len();
        let (mut files, mut passages, mut embeddings) = (0, 0, 0);

        for (i, path) in scan.files.iter().enumerate() {
            let pos = Position {
                current: i + 1,
                total,
                sink: &NoProgress,
            };
            match self.index_file(path, &pos, false).await {
                Ok(SyncOutcome::Indexed {
                    passages: p,
                    embeddings: e,
                }) => {
                    files += 1;
                    passages += p;
                    embeddings += e;
                }
                Ok(_) => {}
                Err(FileFailure::Skip(e)) => {
                    tracing::warn!(path = %path.display(), reason = e.kind(), "skipped: {}", e);
                }
                Err(FileFailure::Fatal(e)) => return Err(e),
            }
        }
        self.prune(root, dir, &scan.files).await?;

        if files == 0 {
            return Ok(SyncOutcome::Unchanged);
        }
        tracing::info!(folder = %dir.display(), files, passages, "indexed directory");
        Ok(SyncOutcome::Indexed {
            passages,
            embeddings,
        })
    }

    async fn index_file(
        &self,
        path: &Path,
        pos: &Position<'_>,
        full: bool,
    ) -> std::result::Result<SyncOutcome, FileFailure> {
        let _file_guard = self.path_locks.lock(path).await;

        if !self.extractors.supports(path) {
            let ext = path
                .extension()
                .map(|e| e.to_string_lossy().to_string())
                .unwrap_or_default();
            return Err(FileError::UnsupportedFormat(ext).into());
        }

        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| FileError::Unreadable(e.to_string()))?;
        if metadata.len() > self.config.import.max_file_bytes {
            return Err(FileError::Unreadable(format!(
                "file is larger than {} bytes",
                self.config.import.max_file_bytes
            ))
            .into());
        }

        let existing = self.store.file_state(path).await?;
        let modified_at = discover::modified_millis(&metadata);
        if !full && existing.as_ref().is_some_and(|s| s.is_current(modified_at)) {
            return Ok(SyncOutcome::Unchanged);
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| FileError::Unreadable(e.to_string()))?;
        let (text, format) = self
            .extractors
            .extract(path, &bytes)
            .map_err(FileError::from)?;
        let meta = discover::file_meta(path, format, &metadata, &bytes);

        if let Some(state) = existing.as_ref() {
            if !full && state.indexed_at.is_some() && state.content_hash == meta.content_hash {
                let _guard = self.write_lock.lock().await;
                self.store.touch_file(state.id, &meta).await?;
                tracing::debug!(path = %path.display(), "content unchanged, metadata refreshed");
                return Ok(SyncOutcome::Unchanged);
            }
        }

        let passages = chunk_text(&text, &self.config.chunking);
        if passages.is_empty() {
            if existing.is_some() {
                let _guard = self.write_lock.lock().await;
                self.store.delete_file(path).await?;
                tracing::info!(path = %path.display(), "no text left, removed from index");
                return Ok(SyncOutcome::Removed);
            }
            return Err(FileError::NoText.into());
        }

        let vectors = self.embed_passages(&passages, &meta.name, pos).await;
        let embeddings = vectors.as_ref().map(|v| v.len()).unwrap_or(0);

        let _guard = self.write_lock.lock().await;
        let file_id = self.store.upsert_file(&meta).await?;
        if let Err(e) = self
            .store
            .replace_passages(file_id, &passages, vectors.as_deref())
            .await
        {
            self.discard_new_record(existing.as_ref(), file_id).await;
            return Err(e.into());
        }

        tracing::debug!(
            path = %path.display(),
            passages = passages.len(),
            embeddings,
            "indexed"
        );
        Ok(SyncOutcome::Indexed {
            passages: passages.len(),
            embeddings,
        })
    }

    /// A record created for a file whose first write failed must not linger
    /// without passages.
    async fn discard_new_record(&self, existing: Option<&FileState>, file_id: i64) {
        if existing.is_none() {
            if let Err(e) = self.store.delete_file_id(file_id).await {
                tracing::warn!(file_id, error = %e, "failed to discard incomplete file record");
            }
        }
    }

    /// Encode passages batch by batch, reporting after each batch. Returns
    /// `None` when the model is not ready or inference fails, in which case
    /// the passages are stored without vectors for a later back-fill.
    async fn embed_passages(
        &self,
        passages: &[crate::models::Passage],
        name: &str,
        pos: &Position<'_>,
    ) -> Option<Vec<Vec<f32>>> {
        if !self.engine.status().is_ready() {
            return None;
        }

        let batch_size = self.config.model.batch_size.max(1);
        let chunks = passages.len();
        let mut vectors = Vec::with_capacity(chunks);

        for batch in passages.chunks(batch_size) {
            let texts: Vec<String> = batch.iter().map(|p| p.content.clone()).collect();
            match self.engine.encode_batch(texts).await {
                Ok(Some(batch_vectors)) => vectors.extend(batch_vectors),
                Ok(None) => return None,
                Err(e) => {
                    tracing::warn!(file = name, error = %e, "embedding failed, storing passages without vectors");
                    return None;
                }
            }
            pos.sink.report(&ProgressEvent::embedding(
                pos.current,
                pos.total,
                name,
                vectors.len(),
                chunks,
            ));
        }

        Some(vectors)
    }

    /// Delete records under `dir` the walk did not list whose file is gone
    /// or excluded from `root`. Files created after the walk started are
    /// kept.
    async fn prune(&self, root: &Path, dir: &Path, scanned: &[PathBuf]) -> Result<usize> {
        let filter = discover::PathFilter::new(&self.config.import)?;
        let scanned: HashSet<&Path> = scanned.iter().map(PathBuf::as_path).collect();
        let records = self.store.list_files_under(dir).await?;

        let mut removed = 0;
        for record in &records {
            let path = Path::new(&record.path);
            if scanned.contains(path) || (path.is_file() && filter.allows(root, path)) {
                continue;
            }
            if self.remove_record(path).await? {
                tracing::info!(path = %path.display(), "removed from index, file no longer listed");
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn remove_record(&self, path: &Path) -> Result<bool> {
        let _file_guard = self.path_locks.lock(path).await;
        let _guard = self.write_lock.lock().await;
        Ok(self.store.delete_file(path).await?)
    }

    /// Encode passages stored without vectors, one transaction per batch.
    ///
    /// Does nothing unless the model is ready.
    pub async fn backfill_embeddings(&self, limit: Option<usize>) -> Result<BackfillSummary> {
        let mut summary = BackfillSummary::default();
        if !self.engine.status().is_ready() {
            summary.remaining = self.pending_count().await?;
            return Ok(summary);
        }

        let batch_size = self.config.model.batch_size.max(1);
        loop {
            let want = match limit {
                Some(limit) if summary.embedded >= limit => break,
                Some(limit) => batch_size.min(limit - summary.embedded),
                None => batch_size,
            };

            let pending = self.store.passages_missing_vectors(want as i64).await?;
            if pending.is_empty() {
                break;
            }
            let texts: Vec<String> = pending.iter().map(|p| p.content.clone()).collect();
            let Some(vectors) = self.engine.encode_batch(texts).await? else {
                break;
            };

            let _guard = self.write_lock.lock().await;
            let written = self.store.insert_vectors(&pending, &vectors).await?;
            summary.embedded += written as usize;
            if written == 0 {
                break;
            }
        }

        summary.remaining = self.pending_count().await?;
        tracing::info!(
            embedded = summary.embedded,
            remaining = summary.remaining,
            "embedding back-fill finished"
        );
        Ok(summary)
    }

    async fn pending_count(&self) -> Result<usize> {
        let stats = self.store.stats().await?;
        Ok((stats.passage_count - stats.vector_count).max(0) as usize)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct BackfillSummary {
    pub embedded: usize,
    pub remaining: usize,
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string())
}
