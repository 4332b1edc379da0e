//! TOML configuration.
//!
//! Every section has defaults, so an empty file (or no file at all, see
//! [`Config::default`]) yields a working setup that keeps its database under
//! `./data` and looks for the bundled model under `./models`.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable that overrides `[model].dir`.
pub const MODEL_DIR_ENV: &str = "LOCALLENS_MODEL_DIR";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub search: SearchConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./data/locallens.sqlite")
}

/// Passage sizing, in characters.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_min_chars")]
    pub min_chars: usize,
    #[serde(default = "default_overlap_chars")]
    pub overlap_chars: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_chars: default_max_chars(),
            min_chars: default_min_chars(),
            overlap_chars: default_overlap_chars(),
        }
    }
}

fn default_max_chars() -> usize {
    500
}
fn default_min_chars() -> usize {
    300
}
fn default_overlap_chars() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Directory holding `model.onnx` and `tokenizer.json`.
    #[serde(default = "default_model_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Token limit per input; longer passages are truncated by the encoder.
    #[serde(default = "default_max_seq_len")]
    pub max_seq_len: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            dir: default_model_dir(),
            batch_size: default_batch_size(),
            max_seq_len: default_max_seq_len(),
        }
    }
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("./models/all-minilm-l6-v2")
}
fn default_batch_size() -> usize {
    16
}
fn default_max_seq_len() -> usize {
    128
}

impl ModelConfig {
    /// The model directory, honouring [`MODEL_DIR_ENV`].
    pub fn resolved_dir(&self) -> PathBuf {
        match std::env::var_os(MODEL_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => self.dir.clone(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ImportConfig {
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default = "default_follow_symlinks")]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    /// Capacity of the progress broadcast channel handed to hosts.
    #[serde(default = "default_progress_buffer")]
    pub progress_buffer: usize,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            exclude_globs: Vec::new(),
            follow_symlinks: default_follow_symlinks(),
            max_file_bytes: default_max_file_bytes(),
            progress_buffer: default_progress_buffer(),
        }
    }
}

fn default_follow_symlinks() -> bool {
    true
}
fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}
fn default_progress_buffer() -> usize {
    256
}

#[derive(Debug, Deserialize, Clone)]
pub struct SearchConfig {
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_keyword_limit")]
    pub keyword_limit: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            top_k: default_top_k(),
            keyword_limit: default_keyword_limit(),
        }
    }
}

fn default_top_k() -> usize {
    50
}
fn default_keyword_limit() -> usize {
    30
}

impl Config {
    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            load_config(path)
        } else {
            tracing::debug!(path = %path.display(), "config file not found, using defaults");
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        let c = &self.chunking;
        if c.max_chars == 0 {
            bail!("chunking.max_chars must be > 0");
        }
        if c.min_chars > c.max_chars {
            bail!(
                "chunking.min_chars ({}) must not exceed chunking.max_chars ({})",
                c.min_chars,
                c.max_chars
            );
        }
        if c.overlap_chars >= c.max_chars {
            bail!("chunking.overlap_chars must be < chunking.max_chars");
        }
        if self.model.batch_size == 0 {
            bail!("model.batch_size must be > 0");
        }
        if self.model.max_seq_len == 0 {
            bail!("model.max_seq_len must be > 0");
        }
        if self.import.progress_buffer == 0 {
            bail!("import.progress_buffer must be > 0");
        }
        if self.search.top_k == 0 {
            bail!("search.top_k must be >= 1");
        }
        if self.search.keyword_limit == 0 {
            bail!("search.keyword_limit must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let cfg = parse_config("").unwrap();
        assert_eq!(cfg.chunking, ChunkingConfig::default());
        assert_eq!(cfg.chunking.max_chars, 500);
        assert_eq!(cfg.chunking.min_chars, 300);
        assert_eq!(cfg.chunking.overlap_chars, 50);
        assert_eq!(cfg.search.top_k, 50);
        assert_eq!(cfg.db.path, PathBuf::from("./data/locallens.sqlite"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let cfg = parse_config(
            r#"
            [chunking]
            max_chars = 800

            [search]
            top_k = 10
            "#,
        )
        .unwrap();
        assert_eq!(cfg.chunking.max_chars, 800);
        assert_eq!(cfg.chunking.min_chars, 300);
        assert_eq!(cfg.search.top_k, 10);
        assert_eq!(cfg.search.keyword_limit, 30);
    }

    #[test]
    fn rejects_min_above_max() {
        let err = parse_config("[chunking]\nmax_chars = 100\nmin_chars = 200\n").unwrap_err();
        assert!(err.to_string().contains("min_chars"));
    }

    #[test]
    fn rejects_overlap_not_below_max() {
        let err = parse_config(
            "[chunking]\nmax_chars = 100\nmin_chars = 50\noverlap_chars = 100\n",
        )
        .unwrap_err();
        assert!(err.to_string().contains("overlap_chars"));
    }

    #[test]
    fn rejects_zero_top_k() {
        assert!(parse_config("[search]\ntop_k = 0\n").is_err());
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = Config::load_or_default(Path::new("/nonexistent/locallens.toml")).unwrap();
        assert_eq!(cfg.model.batch_size, 16);
    }

    #[test]
    fn example_config_matches_defaults() {
        let cfg = parse_config(include_str!("../config/locallens.example.toml")).unwrap();
        let defaults = Config::default();
        assert_eq!(cfg.chunking, defaults.chunking);
        assert_eq!(cfg.db.path, defaults.db.path);
        assert_eq!(cfg.model.dir, defaults.model.dir);
        assert_eq!(cfg.import.max_file_bytes, defaults.import.max_file_bytes);
        assert_eq!(cfg.search.keyword_limit, defaults.search.keyword_limit);
    }
}
