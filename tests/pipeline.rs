use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, SystemTime};

use locallens::config::Config;
use locallens::embedding::{EmbeddingEngine, ModelState, TextEncoder};
use locallens::extract::Extractors;
use locallens::ingest::{CancelToken, ImportOutcome, SyncOutcome};
use locallens::progress::{NoProgress, Phase, ProgressEvent, ProgressSink};
use locallens::search::{EmptyState, MatchKind, SearchHit, SearchMode};
use locallens::LocalLens;
use tempfile::TempDir;

const DIMS: usize = 64;

/// Bag-of-words encoder: each lowercase word is hashed into one of `DIMS`
/// buckets. Texts sharing words end up close together.
struct HashedWords;

impl TextEncoder for HashedWords {
    fn dims(&self) -> usize {
        DIMS
    }

    fn encode_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; DIMS];
                for word in text
                    .split(|c: char| !c.is_alphanumeric())
                    .filter(|w| !w.is_empty())
                {
                    // FNV-1a
                    let mut h: u64 = 0xcbf29ce484222325;
                    for b in word.to_lowercase().bytes() {
                        h ^= b as u64;
                        h = h.wrapping_mul(0x100000001b3);
                    }
                    v[(h % DIMS as u64) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Returns 8-dim vectors for texts containing "poison", so writing them
/// into a 64-dim index fails.
struct MixedDims;

impl TextEncoder for MixedDims {
    fn dims(&self) -> usize {
        DIMS
    }

    fn encode_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut vectors = HashedWords.encode_batch(texts)?;
        for (text, v) in texts.iter().zip(vectors.iter_mut()) {
            if text.contains("poison") {
                v.truncate(8);
                v[0] += 1.0;
            }
        }
        Ok(vectors)
    }
}

/// Holds the first batch mentioning `trigger` until the test lets it go,
/// leaving that file read but not yet written.
struct Gated {
    trigger: &'static str,
    armed: AtomicBool,
    entered: mpsc::SyncSender<()>,
    release: Mutex<mpsc::Receiver<()>>,
}

impl TextEncoder for Gated {
    fn dims(&self) -> usize {
        DIMS
    }

    fn encode_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let hit = texts.iter().any(|t| t.contains(self.trigger));
        if hit && self.armed.swap(false, Ordering::SeqCst) {
            let _ = self.entered.send(());
            let _ = self
                .release
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(10));
        }
        HashedWords.encode_batch(texts)
    }
}

struct Gate {
    entered: mpsc::Receiver<()>,
    release: mpsc::SyncSender<()>,
}

impl Gate {
    /// Wait until the gated batch is being encoded.
    async fn reached(self) -> mpsc::SyncSender<()> {
        let Gate { entered, release } = self;
        tokio::task::spawn_blocking(move || entered.recv_timeout(Duration::from_secs(10)))
            .await
            .unwrap()
            .expect("gated batch never started");
        release
    }
}

fn gated(trigger: &'static str) -> (Arc<Gated>, Gate) {
    let (entered_tx, entered_rx) = mpsc::sync_channel(1);
    let (release_tx, release_rx) = mpsc::sync_channel(1);
    let encoder = Arc::new(Gated {
        trigger,
        armed: AtomicBool::new(true),
        entered: entered_tx,
        release: Mutex::new(release_rx),
    });
    (
        encoder,
        Gate {
            entered: entered_rx,
            release: release_tx,
        },
    )
}

fn config_in(tmp: &TempDir) -> Config {
    let mut config = Config::default();
    config.db.path = tmp.path().join("data").join("index.sqlite");
    config.model.dir = tmp.path().join("no-model");
    config
}

async fn lens_with(tmp: &TempDir, engine: EmbeddingEngine) -> LocalLens {
    LocalLens::with_engine(config_in(tmp), Arc::new(engine), Extractors::default())
        .await
        .unwrap()
}

async fn semantic_lens(tmp: &TempDir) -> LocalLens {
    lens_with(tmp, EmbeddingEngine::with_encoder(Arc::new(HashedWords))).await
}

async fn lexical_lens(tmp: &TempDir) -> LocalLens {
    lens_with(tmp, EmbeddingEngine::unavailable()).await
}

fn docs_dir(tmp: &TempDir) -> PathBuf {
    let dir = tmp.path().join("docs");
    fs::create_dir_all(&dir).unwrap();
    dir
}

fn long_paragraph(sentences: usize) -> String {
    (0..sentences)
        .map(|i| format!("This is sentence number {:02} of the long paragraph here.", i))
        .collect::<Vec<_>>()
        .join(" ")
}

fn write_corpus(dir: &Path) {
    fs::write(
        dir.join("garden.txt"),
        "Tomatoes need full sun and regular watering.\n\nPrune the basil before it flowers.",
    )
    .unwrap();
    fs::write(
        dir.join("taxes.md"),
        "# Taxes\n\nThe filing deadline for the annual return is in April.\n\nKeep receipts for deductions.",
    )
    .unwrap();
    fs::write(
        dir.join("cluster.txt"),
        "Kubernetes schedules containers onto nodes.\n\nDocker images are built from a Dockerfile.",
    )
    .unwrap();
}

/// Push a file's mtime forward so a rewrite is never mistaken for unchanged.
fn bump_mtime(path: &Path) {
    let file = fs::File::options().write(true).open(path).unwrap();
    file.set_modified(SystemTime::now() + Duration::from_secs(60))
        .unwrap();
}

async fn import(lens: &LocalLens, dir: &Path) -> ImportOutcome {
    lens.import_folder_with(dir, &NoProgress, &CancelToken::new(), false)
        .await
        .unwrap()
}

#[tokio::test]
async fn long_single_paragraph_makes_three_passages() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    let text = long_paragraph(22);
    assert!(text.chars().count() >= 1_200);
    fs::write(dir.join("long.txt"), &text).unwrap();

    let lens = semantic_lens(&tmp).await;
    let outcome = import(&lens, &dir).await;

    let summary = outcome.summary();
    assert!(!outcome.is_cancelled());
    assert_eq!(summary.files_imported, 1);
    assert_eq!(summary.chunks_created, 3);
    assert_eq!(summary.embeddings_generated, 3);

    let stats = lens.get_stats().await.unwrap();
    assert_eq!(stats.file_count, 1);
    assert_eq!(stats.passage_count, 3);
    assert_eq!(stats.vector_count, 3);
}

#[tokio::test]
async fn corrupt_text_file_is_skipped() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    fs::write(
        dir.join("note.txt"),
        "A short note of about fifty bytes for the index.\n",
    )
    .unwrap();
    fs::write(dir.join("broken.txt"), b"\x00\x01\xff\xfe\x89PNG\x00garbage\xc3").unwrap();

    let lens = semantic_lens(&tmp).await;
    let summary = import(&lens, &dir).await.summary().clone();

    assert_eq!(summary.files_imported, 1);
    assert_eq!(summary.skipped, 1);
    assert_eq!(lens.get_stats().await.unwrap().file_count, 1);
}

#[tokio::test]
async fn lexical_fallback_without_model() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    assert_eq!(lens.get_model_status(), ModelState::Unavailable);
    let summary = import(&lens, &dir).await.summary().clone();
    assert_eq!(summary.files_imported, 3);
    assert_eq!(summary.embeddings_generated, 0);

    let response = lens.search_text("FILING DEADLINE").await.unwrap();
    assert_eq!(response.mode, SearchMode::Lexical);
    assert_eq!(response.hits.len(), 1);
    let hit = &response.hits[0];
    assert!(!hit.is_semantic());
    assert_eq!(hit.score(), 0.0);
    assert_eq!(hit.file_name, "taxes.md");
    match hit.kind {
        MatchKind::Lexical { offset, len } => {
            let matched: String = hit.content.chars().skip(offset).take(len).collect();
            assert_eq!(matched, "filing deadline");
        }
        other => panic!("expected a lexical hit, got {:?}", other),
    }
}

/// Cancels the import once the given file number has finished.
struct CancelAfter {
    files: usize,
    token: CancelToken,
}

impl ProgressSink for CancelAfter {
    fn report(&self, event: &ProgressEvent) {
        if event.phase == Phase::Done && !event.file.is_empty() && event.current == self.files {
            self.token.cancel();
        }
    }
}

#[tokio::test]
async fn cancel_after_two_files_keeps_them_indexed() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    for name in ["a", "b", "c", "d", "e"] {
        fs::write(
            dir.join(format!("{}.txt", name)),
            format!("Document {} talks about topic {}.", name, name),
        )
        .unwrap();
    }

    let lens = semantic_lens(&tmp).await;
    let token = CancelToken::new();
    let sink = CancelAfter {
        files: 2,
        token: token.clone(),
    };
    let outcome = lens
        .import_folder_with(&dir, &sink, &token, false)
        .await
        .unwrap();

    match outcome {
        ImportOutcome::Cancelled {
            files_processed,
            ref summary,
        } => {
            assert_eq!(files_processed, 2);
            assert_eq!(summary.files_imported, 2);
        }
        other => panic!("expected cancellation, got {:?}", other),
    }
    assert_eq!(lens.get_stats().await.unwrap().file_count, 2);
}

#[tokio::test]
async fn resync_replaces_only_the_changed_file() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    assert_eq!(lens.search_text("basil").await.unwrap().hits.len(), 1);

    let garden = dir.join("garden.txt");
    fs::write(&garden, "Cucumbers climb a trellis in July.").unwrap();
    bump_mtime(&garden);

    match lens.sync_path(&garden).await.unwrap() {
        SyncOutcome::Indexed { passages, .. } => assert_eq!(passages, 1),
        other => panic!("expected re-index, got {:?}", other),
    }

    let old = lens.search_text("basil").await.unwrap();
    assert!(old.hits.is_empty());
    assert_eq!(old.empty_state, Some(EmptyState::NoMatches));
    assert_eq!(lens.search_text("trellis").await.unwrap().hits.len(), 1);
    assert_eq!(lens.search_text("dockerfile").await.unwrap().hits.len(), 1);
    assert_eq!(lens.search_text("receipts").await.unwrap().hits.len(), 1);
    assert_eq!(lens.get_stats().await.unwrap().file_count, 3);
}

#[tokio::test]
async fn sync_of_deleted_file_removes_it() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;

    let taxes = dir.join("taxes.md");
    fs::remove_file(&taxes).unwrap();
    assert!(matches!(
        lens.sync_path(&taxes).await.unwrap(),
        SyncOutcome::Removed
    ));
    assert!(matches!(
        lens.sync_path(&taxes).await.unwrap(),
        SyncOutcome::Unchanged
    ));
    assert!(lens.search_text("receipts").await.unwrap().hits.is_empty());
    assert_eq!(lens.get_stats().await.unwrap().file_count, 2);
}

#[tokio::test]
async fn reimport_is_idempotent() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = semantic_lens(&tmp).await;
    import(&lens, &dir).await;
    let before = lens.get_stats().await.unwrap();

    let second = import(&lens, &dir).await.summary().clone();
    assert_eq!(second.files_imported, 0);
    assert_eq!(second.skipped, 3);
    assert_eq!(lens.get_stats().await.unwrap(), before);

    // A forced re-read writes everything again without duplicating it.
    let full = lens
        .import_folder_with(&dir, &NoProgress, &CancelToken::new(), true)
        .await
        .unwrap();
    assert_eq!(full.summary().files_imported, 3);
    assert_eq!(lens.get_stats().await.unwrap(), before);
}

#[tokio::test]
async fn import_prunes_vanished_files() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    fs::remove_file(dir.join("cluster.txt")).unwrap();

    let summary = import(&lens, &dir).await.summary().clone();
    assert_eq!(summary.removed, 1);
    assert_eq!(lens.get_stats().await.unwrap().file_count, 2);
}

#[tokio::test]
async fn semantic_search_ranks_related_passage_first() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = semantic_lens(&tmp).await;
    import(&lens, &dir).await;

    let first = lens
        .search_text("docker images kubernetes containers")
        .await
        .unwrap();
    assert_eq!(first.mode, SearchMode::Semantic);
    assert!(!first.hits.is_empty());
    assert_eq!(first.hits[0].file_name, "cluster.txt");
    for hit in &first.hits {
        assert!(hit.is_semantic());
        assert!((0.0..=1.0).contains(&hit.score()));
    }
    for pair in first.hits.windows(2) {
        assert!(pair[0].score() >= pair[1].score());
    }

    let again = lens
        .search_text("docker images kubernetes containers")
        .await
        .unwrap();
    assert_eq!(first, again);
}

#[tokio::test]
async fn empty_index_and_blank_query() {
    let tmp = TempDir::new().unwrap();
    let lens = lexical_lens(&tmp).await;

    let empty = lens.search_text("anything").await.unwrap();
    assert!(empty.hits.is_empty());
    assert_eq!(empty.empty_state, Some(EmptyState::IndexEmpty));

    let blank = lens.search_text("   ").await.unwrap();
    assert!(blank.hits.is_empty());
    assert_eq!(blank.empty_state, None);
}

#[tokio::test]
async fn backfill_embeds_passages_stored_without_vectors() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    let stats = lens.get_stats().await.unwrap();
    assert!(stats.passage_count > 0);
    assert_eq!(stats.vector_count, 0);
    lens.close().await;

    let lens = semantic_lens(&tmp).await;
    let partial = lens.backfill_embeddings(Some(1)).await.unwrap();
    assert_eq!(partial.embedded, 1);
    assert_eq!(partial.remaining as i64, stats.passage_count - 1);

    let rest = lens.backfill_embeddings(None).await.unwrap();
    assert_eq!(rest.remaining, 0);
    let after = lens.get_stats().await.unwrap();
    assert_eq!(after.vector_count, after.passage_count);
    assert_eq!(
        lens.search_text("tomatoes").await.unwrap().mode,
        SearchMode::Semantic
    );
}

#[tokio::test]
async fn progress_is_broadcast_to_subscribers() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = semantic_lens(&tmp).await;
    let mut rx = lens.subscribe_progress();
    lens.import_folder(&dir, &CancelToken::new()).await.unwrap();

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    assert!(events.iter().any(|e| e.phase == Phase::Reading));
    assert!(events.iter().any(|e| e.phase == Phase::Embedding));
    let last = events.last().unwrap();
    assert_eq!(last.phase, Phase::Done);
    assert_eq!(last.current, 3);
    assert_eq!(last.total, 3);
}

#[tokio::test]
async fn missing_model_directory_is_unavailable() {
    let tmp = TempDir::new().unwrap();
    let config = config_in(&tmp);
    let engine = EmbeddingEngine::new(&config.model);
    let lens = LocalLens::with_engine(config, Arc::new(engine), Extractors::default())
        .await
        .unwrap();

    assert_eq!(lens.get_model_status(), ModelState::Loading);
    let mut status = lens.subscribe_model_status();
    assert_eq!(lens.ensure_model_loaded().await, ModelState::Unavailable);
    status.changed().await.unwrap();
    assert_eq!(*status.borrow(), ModelState::Unavailable);
    assert_eq!(lens.ensure_model_loaded().await, ModelState::Unavailable);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resync_during_import_leaves_newest_content() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    let note = dir.join("note.txt");
    fs::write(&note, "first draft of the note").unwrap();

    let (encoder, gate) = gated("first draft");
    let lens = Arc::new(lens_with(&tmp, EmbeddingEngine::with_encoder(encoder)).await);

    let importing = {
        let lens = Arc::clone(&lens);
        let dir = dir.clone();
        tokio::spawn(async move { import(&lens, &dir).await })
    };
    let release = gate.reached().await;

    // The import has read the first draft; the file changes underneath it.
    fs::write(&note, "second draft of the note").unwrap();
    bump_mtime(&note);
    let syncing = {
        let lens = Arc::clone(&lens);
        let note = note.clone();
        tokio::spawn(async move { lens.sync_path(&note).await.unwrap() })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    release.send(()).unwrap();

    importing.await.unwrap();
    match syncing.await.unwrap() {
        SyncOutcome::Indexed { passages, .. } => assert_eq!(passages, 1),
        other => panic!("expected re-index, got {:?}", other),
    }

    let hits = lens.search_text("draft note").await.unwrap().hits;
    assert_eq!(hits.len(), 1);
    assert!(hits[0].content.contains("second draft"), "{}", hits[0].content);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn search_during_reimport_sees_old_or_new_passages() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    let long = dir.join("long.txt");
    fs::write(&long, long_paragraph(22)).unwrap();

    let (encoder, gate) = gated("Replacement");
    let lens = Arc::new(lens_with(&tmp, EmbeddingEngine::with_encoder(encoder)).await);
    assert_eq!(import(&lens, &dir).await.summary().chunks_created, 3);

    fs::write(&long, "Replacement text for the long paragraph sentence.").unwrap();
    bump_mtime(&long);
    let syncing = {
        let lens = Arc::clone(&lens);
        let long = long.clone();
        tokio::spawn(async move { lens.sync_path(&long).await.unwrap() })
    };
    let release = gate.reached().await;

    fn is_old(hits: &[SearchHit]) -> bool {
        hits.len() == 3 && hits.iter().all(|h| h.content.contains("sentence number"))
    }
    fn is_new(hits: &[SearchHit]) -> bool {
        hits.len() == 1 && hits[0].content.starts_with("Replacement")
    }

    let during = lens.search_text("long paragraph sentence").await.unwrap().hits;
    assert!(is_old(&during), "{:?}", during);

    release.send(()).unwrap();
    while !syncing.is_finished() {
        let hits = lens.search_text("long paragraph sentence").await.unwrap().hits;
        assert!(is_old(&hits) || is_new(&hits), "{:?}", hits);
        tokio::task::yield_now().await;
    }
    syncing.await.unwrap();

    let after = lens.search_text("long paragraph sentence").await.unwrap().hits;
    assert!(is_new(&after), "{:?}", after);
}

#[tokio::test]
async fn failed_store_write_skips_file_and_keeps_old_passages() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lens_with(&tmp, EmbeddingEngine::with_encoder(Arc::new(MixedDims))).await;
    import(&lens, &dir).await;
    let before = lens.get_stats().await.unwrap();

    let garden = dir.join("garden.txt");
    fs::write(&garden, "Ivy can be poison to pets.").unwrap();
    bump_mtime(&garden);
    let cluster = dir.join("cluster.txt");
    fs::write(&cluster, "Helm charts deploy services onto a cluster.").unwrap();
    bump_mtime(&cluster);

    let outcome = import(&lens, &dir).await;
    assert!(!outcome.is_cancelled());
    let summary = outcome.summary();
    assert_eq!(summary.files_imported, 1);
    // garden.txt failed, taxes.md unchanged
    assert_eq!(summary.skipped, 2);

    let hits = lens.search_text("prune the basil").await.unwrap().hits;
    assert!(hits
        .iter()
        .any(|h| h.file_name == "garden.txt" && h.content.contains("basil")));
    assert!(hits.iter().all(|h| !h.content.contains("poison")));

    let helm = lens.search_text("helm charts deploy").await.unwrap().hits;
    assert_eq!(helm[0].file_name, "cluster.txt");
    assert!(helm[0].content.contains("Helm"));
    assert_eq!(lens.get_stats().await.unwrap().file_count, before.file_count);
}

#[tokio::test]
async fn sync_of_removed_directory_drops_its_files() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);
    let sub = dir.join("archive");
    fs::create_dir_all(sub.join("old")).unwrap();
    fs::write(sub.join("letters.txt"), "Letters from the archive.").unwrap();
    fs::write(sub.join("old/minutes.txt"), "Minutes of the archive meeting.").unwrap();

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    assert_eq!(lens.get_stats().await.unwrap().file_count, 5);

    fs::remove_dir_all(&sub).unwrap();
    assert!(matches!(
        lens.sync_path(&sub).await.unwrap(),
        SyncOutcome::Removed
    ));
    assert!(lens.search_text("archive").await.unwrap().hits.is_empty());
    assert_eq!(lens.get_stats().await.unwrap().file_count, 3);
}

#[tokio::test]
async fn sync_of_new_directory_indexes_its_files() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;

    let moved = dir.join("recipes");
    fs::create_dir_all(moved.join("soups")).unwrap();
    fs::write(moved.join("bread.txt"), "Knead the dough for ten minutes.").unwrap();
    fs::write(moved.join("soups/leek.md"), "Leek soup needs slow cooking.").unwrap();
    fs::write(moved.join("photo.png"), b"\x89PNG").unwrap();

    match lens.sync_path(&moved).await.unwrap() {
        SyncOutcome::Indexed { passages, .. } => assert_eq!(passages, 2),
        other => panic!("expected directory to be indexed, got {:?}", other),
    }
    assert_eq!(lens.search_text("dough").await.unwrap().hits.len(), 1);
    assert_eq!(lens.search_text("leek").await.unwrap().hits.len(), 1);
    assert_eq!(lens.get_stats().await.unwrap().file_count, 5);
}

#[tokio::test]
async fn import_prunes_files_that_became_excluded() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);
    let vendored = dir.join("node_modules/dep/readme.txt");
    fs::create_dir_all(vendored.parent().unwrap()).unwrap();
    fs::write(&vendored, "Vendored package readme.").unwrap();

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    // An explicit sync indexes whatever path it is given.
    lens.sync_path(&vendored).await.unwrap();
    assert_eq!(lens.search_text("vendored").await.unwrap().hits.len(), 1);

    let summary = import(&lens, &dir).await.summary().clone();
    assert_eq!(summary.removed, 1);
    assert!(lens.search_text("vendored").await.unwrap().hits.is_empty());
    assert_eq!(lens.get_stats().await.unwrap().file_count, 3);
}

/// Poll `query` until `done` accepts the hit count or five seconds pass.
async fn wait_for_hits(lens: &LocalLens, query: &str, done: impl Fn(usize) -> bool) -> bool {
    for _ in 0..50 {
        if done(lens.search_text(query).await.unwrap().hits.len()) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn watcher_follows_changes_and_ignores_excluded_paths() {
    let tmp = TempDir::new().unwrap();
    let dir = docs_dir(&tmp);
    write_corpus(&dir);

    let lens = lexical_lens(&tmp).await;
    import(&lens, &dir).await;
    let _watcher = lens.watch(&dir).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    fs::create_dir_all(dir.join("node_modules/dep")).unwrap();
    fs::write(dir.join("node_modules/dep/readme.txt"), "zebra crossing").unwrap();
    fs::create_dir_all(dir.join(".git")).unwrap();
    fs::write(dir.join(".git/notes.txt"), "zebra stripes").unwrap();
    let fresh = dir.join("fresh.txt");
    fs::write(&fresh, "Notes on zebra migration.").unwrap();

    assert!(wait_for_hits(&lens, "migration", |n| n == 1).await);
    // Give the excluded paths as long as the debounce needs.
    tokio::time::sleep(Duration::from_millis(800)).await;
    let zebra = lens.search_text("zebra").await.unwrap().hits;
    assert_eq!(zebra.len(), 1);
    assert_eq!(zebra[0].file_name, "fresh.txt");
    assert_eq!(lens.get_stats().await.unwrap().file_count, 4);

    fs::remove_file(&fresh).unwrap();
    assert!(wait_for_hits(&lens, "migration", |n| n == 0).await);
    assert_eq!(lens.get_stats().await.unwrap().file_count, 3);
}
