//! On-device embedding engine.
//!
//! The [`EmbeddingEngine`] owns the model lifecycle. It starts in
//! [`ModelState::Loading`] and moves exactly once to `Ready`, `Unavailable`
//! (model files missing) or `Failed(reason)`. There is no retry. Every
//! transition is published on a [`tokio::sync::watch`] channel.
//!
//! Inference goes through the [`TextEncoder`] trait. Two backends are
//! compiled in behind cargo features:
//! - **fastembed** (`local-embeddings-fastembed`, default): ONNX Runtime via
//!   a user-defined fastembed model read from the model directory.
//! - **tract** (`local-embeddings-tract`): pure-Rust ONNX inference with
//!   attention-masked mean pooling.
//!
//! Also provides the vector utilities the index relies on:
//! - [`cosine_similarity`] — similarity between two embedding vectors
//! - [`l2_normalize`] — scale a vector to unit length
//! - [`vec_to_blob`] / [`blob_to_vec`] — little-endian f32 BLOB encoding

#[cfg(feature = "local-embeddings-fastembed")]
mod local_fastembed;
#[cfg(feature = "local-embeddings-tract")]
mod local_tract;

use anyhow::{bail, Result};
use serde::{Serialize, Serializer};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::watch;

use crate::config::ModelConfig;
use crate::error::ModelLoadError;

/// File name of the ONNX graph inside the model directory.
pub const MODEL_FILE: &str = "model.onnx";
/// File name of the HuggingFace tokenizer inside the model directory.
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Blocking text encoder. Implementations are shared read-only across tasks.
pub trait TextEncoder: Send + Sync {
    /// Vector dimensionality produced by [`encode_batch`](Self::encode_batch).
    fn dims(&self) -> usize;

    /// Encode `texts` into one vector each, in input order.
    ///
    /// Called from the blocking pool; may be CPU-heavy.
    fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Process-wide model readiness.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelState {
    Loading,
    Ready,
    Unavailable,
    Failed(String),
}

impl ModelState {
    pub fn is_ready(&self) -> bool {
        matches!(self, ModelState::Ready)
    }

    pub fn is_loading(&self) -> bool {
        matches!(self, ModelState::Loading)
    }
}

impl std::fmt::Display for ModelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelState::Loading => write!(f, "loading"),
            ModelState::Ready => write!(f, "ready"),
            ModelState::Unavailable => write!(f, "unavailable"),
            ModelState::Failed(reason) => write!(f, "failed:{}", reason),
        }
    }
}

impl Serialize for ModelState {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl From<ModelLoadError> for ModelState {
    fn from(e: ModelLoadError) -> Self {
        match e {
            ModelLoadError::Missing(_) => ModelState::Unavailable,
            ModelLoadError::Failed(reason) => ModelState::Failed(reason),
        }
    }
}

/// Loads the model at most once and encodes text once it is ready.
pub struct EmbeddingEngine {
    model_dir: PathBuf,
    batch_size: usize,
    max_seq_len: usize,
    state: watch::Sender<ModelState>,
    encoder: OnceLock<Arc<dyn TextEncoder>>,
    started: AtomicBool,
}

impl EmbeddingEngine {
    /// A not-yet-loaded engine reading from `config`'s model directory.
    pub fn new(config: &ModelConfig) -> Self {
        let (state, _) = watch::channel(ModelState::Loading);
        Self {
            model_dir: config.resolved_dir(),
            batch_size: config.batch_size.max(1),
            max_seq_len: config.max_seq_len,
            state,
            encoder: OnceLock::new(),
            started: AtomicBool::new(false),
        }
    }

    /// An engine that is already `Ready` with the given encoder.
    pub fn with_encoder(encoder: Arc<dyn TextEncoder>) -> Self {
        let engine = Self::new(&ModelConfig::default());
        engine.started.store(true, Ordering::SeqCst);
        let _ = engine.encoder.set(encoder);
        engine.transition(ModelState::Ready);
        engine
    }

    /// An engine whose model is permanently `Unavailable`.
    pub fn unavailable() -> Self {
        let engine = Self::new(&ModelConfig::default());
        engine.started.store(true, Ordering::SeqCst);
        engine.transition(ModelState::Unavailable);
        engine
    }

    pub fn status(&self) -> ModelState {
        self.state.borrow().clone()
    }

    /// Receiver that observes every readiness transition.
    pub fn subscribe(&self) -> watch::Receiver<ModelState> {
        self.state.subscribe()
    }

    pub fn model_dir(&self) -> &Path {
        &self.model_dir
    }

    pub fn dims(&self) -> Option<usize> {
        self.encoder.get().map(|e| e.dims())
    }

    /// Load the model if nobody has started yet, then wait for the outcome.
    ///
    /// Idempotent: concurrent and repeated callers share the single load and
    /// all observe the same final state.
    pub async fn ensure_loaded(&self) -> ModelState {
        if !self.started.swap(true, Ordering::SeqCst) {
            tracing::info!(dir = %self.model_dir.display(), "loading embedding model");
            let dir = self.model_dir.clone();
            let max_seq_len = self.max_seq_len;
            let outcome = tokio::task::spawn_blocking(move || load_encoder(&dir, max_seq_len))
                .await
                .unwrap_or_else(|e| Err(ModelLoadError::Failed(format!("load task: {}", e))));

            match outcome {
                Ok(encoder) => {
                    tracing::info!(dims = encoder.dims(), "embedding model ready");
                    let _ = self.encoder.set(encoder);
                    self.transition(ModelState::Ready);
                }
                Err(ModelLoadError::Missing(path)) => {
                    tracing::warn!(
                        path = %path.display(),
                        "embedding model not found, search falls back to keywords"
                    );
                    self.transition(ModelState::Unavailable);
                }
                Err(e) => {
                    tracing::warn!(error = %e, "embedding model failed to load");
                    self.transition(e.into());
                }
            }
        }

        let mut rx = self.state.subscribe();
        let state = match rx.wait_for(|s| !s.is_loading()).await {
            Ok(state) => state.clone(),
            Err(_) => self.status(),
        };
        state
    }

    /// Start loading in the background. Returns immediately.
    pub fn spawn_load(self: &Arc<Self>) {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            engine.ensure_loaded().await;
        });
    }

    /// Apply a one-way transition out of `Loading`. Returns whether the
    /// state changed.
    fn transition(&self, next: ModelState) -> bool {
        self.state.send_if_modified(|current| {
            if current.is_loading() && !next.is_loading() {
                *current = next.clone();
                true
            } else {
                false
            }
        })
    }

    /// Encode a single text. `None` when the model is not ready.
    pub async fn encode(&self, text: &str) -> Result<Option<Vec<f32>>> {
        let vectors = self.encode_batch(vec![text.to_string()]).await?;
        Ok(vectors.and_then(|v| v.into_iter().next()))
    }

    /// Encode `texts` in configured batch sizes on the blocking pool.
    ///
    /// Returns `Ok(None)` without doing any work when the model is not
    /// ready. Output vectors are L2-normalised.
    pub async fn encode_batch(&self, texts: Vec<String>) -> Result<Option<Vec<Vec<f32>>>> {
        let encoder = match (self.status().is_ready(), self.encoder.get()) {
            (true, Some(encoder)) => Arc::clone(encoder),
            _ => return Ok(None),
        };
        if texts.is_empty() {
            return Ok(Some(Vec::new()));
        }

        let batch_size = self.batch_size;
        let vectors = tokio::task::spawn_blocking(move || -> Result<Vec<Vec<f32>>> {
            let mut out = Vec::with_capacity(texts.len());
            for batch in texts.chunks(batch_size) {
                let vectors = encoder.encode_batch(batch)?;
                if vectors.len() != batch.len() {
                    bail!(
                        "encoder returned {} vectors for {} texts",
                        vectors.len(),
                        batch.len()
                    );
                }
                out.extend(vectors.into_iter().map(l2_normalize));
            }
            Ok(out)
        })
        .await??;

        Ok(Some(vectors))
    }
}

/// Check for the model assets, then hand them to the compiled-in backend.
fn load_encoder(
    dir: &Path,
    max_seq_len: usize,
) -> std::result::Result<Arc<dyn TextEncoder>, ModelLoadError> {
    for name in [MODEL_FILE, TOKENIZER_FILE] {
        let path = dir.join(name);
        if !path.is_file() {
            return Err(ModelLoadError::Missing(path));
        }
    }
    load_backend(dir, max_seq_len)
}

#[cfg(feature = "local-embeddings-fastembed")]
fn load_backend(
    dir: &Path,
    max_seq_len: usize,
) -> std::result::Result<Arc<dyn TextEncoder>, ModelLoadError> {
    let encoder = local_fastembed::FastembedEncoder::load(dir, max_seq_len)
        .map_err(|e| ModelLoadError::Failed(e.to_string()))?;
    Ok(Arc::new(encoder))
}

#[cfg(all(
    feature = "local-embeddings-tract",
    not(feature = "local-embeddings-fastembed")
))]
fn load_backend(
    dir: &Path,
    max_seq_len: usize,
) -> std::result::Result<Arc<dyn TextEncoder>, ModelLoadError> {
    let encoder = local_tract::TractEncoder::load(dir, max_seq_len)
        .map_err(|e| ModelLoadError::Failed(e.to_string()))?;
    Ok(Arc::new(encoder))
}

#[cfg(not(any(
    feature = "local-embeddings-fastembed",
    feature = "local-embeddings-tract"
)))]
fn load_backend(
    _dir: &Path,
    _max_seq_len: usize,
) -> std::result::Result<Arc<dyn TextEncoder>, ModelLoadError> {
    Err(ModelLoadError::Failed(
        "no embedding backend compiled in".to_string(),
    ))
}

/// Scale `v` to unit length. Zero vectors are returned unchanged.
pub fn l2_normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// ```rust
/// use locallens::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12);
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
///
/// ```text
///            a · b
/// cos(θ) = ─────────
///          ‖a‖ × ‖b‖
/// ```
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Counts characters a-z into a 26-dim vector.
    struct LetterCounts {
        calls: AtomicUsize,
    }

    impl TextEncoder for LetterCounts {
        fn dims(&self) -> usize {
            26
        }

        fn encode_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0f32; 26];
                    for c in t.to_ascii_lowercase().bytes() {
                        if c.is_ascii_lowercase() {
                            v[(c - b'a') as usize] += 1.0;
                        }
                    }
                    v
                })
                .collect())
        }
    }

    fn letters() -> Arc<LetterCounts> {
        Arc::new(LetterCounts {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn test_vec_blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        assert!((cosine_similarity(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_degenerate_inputs() {
        assert_eq!(cosine_similarity(&[], &[]), 0.0);
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[test]
    fn test_l2_normalize() {
        let v = l2_normalize(vec![3.0, 4.0]);
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert_eq!(l2_normalize(vec![0.0, 0.0]), vec![0.0, 0.0]);
    }

    #[test]
    fn test_state_strings() {
        assert_eq!(ModelState::Loading.to_string(), "loading");
        assert_eq!(ModelState::Ready.to_string(), "ready");
        assert_eq!(ModelState::Unavailable.to_string(), "unavailable");
        assert_eq!(
            ModelState::Failed("bad graph".into()).to_string(),
            "failed:bad graph"
        );
        assert_eq!(
            serde_json::to_string(&ModelState::Ready).unwrap(),
            "\"ready\""
        );
    }

    #[tokio::test]
    async fn test_not_ready_returns_no_vector() {
        let engine = EmbeddingEngine::unavailable();
        assert_eq!(engine.status(), ModelState::Unavailable);
        assert!(engine.encode("hello").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_encode_is_normalised_and_stable() {
        let engine = EmbeddingEngine::with_encoder(letters());
        let a = engine.encode("the quick brown fox").await.unwrap().unwrap();
        let b = engine.encode("the quick brown fox").await.unwrap().unwrap();
        let norm: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 1.0).abs() < 1e-5);
        assert!(cosine_similarity(&a, &b) >= 0.999);
    }

    #[tokio::test]
    async fn test_batches_follow_batch_size() {
        let encoder = letters();
        let engine = EmbeddingEngine::with_encoder(encoder.clone());
        let texts: Vec<String> = (0..40).map(|i| format!("text {}", i)).collect();
        let vectors = engine.encode_batch(texts).await.unwrap().unwrap();
        assert_eq!(vectors.len(), 40);
        // Default batch size is 16.
        assert_eq!(encoder.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_missing_model_is_unavailable_and_load_is_idempotent() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = ModelConfig {
            dir: tmp.path().to_path_buf(),
            ..Default::default()
        };
        let mut engine = EmbeddingEngine::new(&config);
        engine.model_dir = tmp.path().to_path_buf();
        let engine = Arc::new(engine);

        let mut rx = engine.subscribe();
        assert_eq!(*rx.borrow_and_update(), ModelState::Loading);

        let (a, b) = tokio::join!(engine.ensure_loaded(), engine.ensure_loaded());
        assert_eq!(a, ModelState::Unavailable);
        assert_eq!(b, ModelState::Unavailable);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), ModelState::Unavailable);

        assert_eq!(engine.ensure_loaded().await, ModelState::Unavailable);
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn test_transitions_are_one_way() {
        let engine = EmbeddingEngine::with_encoder(letters());
        assert!(!engine.transition(ModelState::Failed("late".into())));
        assert_eq!(engine.status(), ModelState::Ready);
    }
}
