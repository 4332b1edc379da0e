//! The `LocalLens` handle a host application (or the CLI) holds.
//!
//! Owns the index store, the embedding engine, the import pipeline and the
//! query pipeline, and exposes the operations a presentation layer calls.

use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::config::Config;
use crate::embedding::{EmbeddingEngine, ModelState};
use crate::extract::Extractors;
use crate::ingest::{BackfillSummary, CancelToken, ImportOutcome, Importer, SyncOutcome};
use crate::models::IndexStats;
use crate::progress::{ChannelProgress, ProgressEvent, ProgressSink};
use crate::search::{QueryPipeline, SearchResponse};
use crate::stats::StatsReport;
use crate::store::IndexStore;
use crate::watcher::FolderWatcher;

pub struct LocalLens {
    config: Config,
    store: Arc<IndexStore>,
    engine: Arc<EmbeddingEngine>,
    importer: Arc<Importer>,
    query: QueryPipeline,
    progress: Arc<ChannelProgress>,
}

impl LocalLens {
    /// Open the index and start loading the model in the background.
    ///
    /// Must be called inside a tokio runtime.
    pub async fn open(config: Config) -> Result<Self> {
        let engine = Arc::new(EmbeddingEngine::new(&config.model));
        let lens = Self::with_engine(config, engine, Extractors::default()).await?;
        lens.engine.spawn_load();
        Ok(lens)
    }

    /// Open the index around a caller-supplied engine and extractor set.
    /// Nothing is loaded in the background.
    pub async fn with_engine(
        config: Config,
        engine: Arc<EmbeddingEngine>,
        extractors: Extractors,
    ) -> Result<Self> {
        let store = Arc::new(IndexStore::open(&config).await?);
        let importer = Arc::new(Importer::new(
            config.clone(),
            Arc::clone(&store),
            Arc::clone(&engine),
            Arc::new(extractors),
        ));
        let query = QueryPipeline::new(
            Arc::clone(&store),
            Arc::clone(&engine),
            config.search.clone(),
        );
        let progress = Arc::new(ChannelProgress::new(config.import.progress_buffer));

        Ok(Self {
            config,
            store,
            engine,
            importer,
            query,
            progress,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn get_model_status(&self) -> ModelState {
        self.engine.status()
    }

    pub fn subscribe_model_status(&self) -> watch::Receiver<ModelState> {
        self.engine.subscribe()
    }

    /// Wait for the model load to finish, starting it if needed.
    pub async fn ensure_model_loaded(&self) -> ModelState {
        self.engine.ensure_loaded().await
    }

    pub async fn get_stats(&self) -> Result<IndexStats> {
        Ok(self.store.stats().await?)
    }

    pub async fn stats_report(&self) -> Result<StatsReport> {
        StatsReport::collect(&self.store, &self.config.db.path, self.engine.status()).await
    }

    /// Subscribe to progress events of imports started with
    /// [`import_folder`](Self::import_folder).
    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Import a folder, publishing progress to subscribers of
    /// [`subscribe_progress`](Self::subscribe_progress).
    pub async fn import_folder(&self, path: &Path, cancel: &CancelToken) -> Result<ImportOutcome> {
        self.importer
            .import_folder(path, self.progress.as_ref(), cancel, false)
            .await
    }

    /// Import a folder, reporting progress to `sink` instead.
    pub async fn import_folder_with(
        &self,
        path: &Path,
        sink: &dyn ProgressSink,
        cancel: &CancelToken,
        full: bool,
    ) -> Result<ImportOutcome> {
        self.importer.import_folder(path, sink, cancel, full).await
    }

    pub async fn sync_path(&self, path: &Path) -> Result<SyncOutcome> {
        self.importer.sync_path(path).await
    }

    pub async fn search_text(&self, query: &str) -> Result<SearchResponse> {
        self.query.search(query).await
    }

    pub async fn backfill_embeddings(&self, limit: Option<usize>) -> Result<BackfillSummary> {
        self.importer.backfill_embeddings(limit).await
    }

    /// Start re-syncing `folder` on file-system changes.
    pub fn watch(&self, folder: &Path) -> Result<FolderWatcher> {
        FolderWatcher::start(folder, Arc::clone(&self.importer))
    }

    pub async fn close(&self) {
        self.store.close().await;
    }
}
