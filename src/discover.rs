use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::WalkDir;

use crate::config::ImportConfig;
use crate::extract::Extractors;
use crate::models::FileMeta;

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Walk `root` and return every supported file, sorted by path.
///
/// Files are matched against the built-in excludes plus
/// `import.exclude_globs`, relative to `root`. Extensions no registered
/// extractor handles are reported separately so they can be counted as
/// skipped. Returned paths are canonical, so a symlinked file keys off its
/// target and two links to one file are only listed once.
pub fn scan_folder(root: &Path, config: &ImportConfig, extractors: &Extractors) -> Result<Scan> {
    scan_under(root, root, config, extractors)
}

/// Walk `dir`, a folder somewhere below `root`, applying the exclusions as
/// a walk of `root` would.
pub fn scan_under(
    root: &Path,
    dir: &Path,
    config: &ImportConfig,
    extractors: &Extractors,
) -> Result<Scan> {
    if !dir.is_dir() {
        bail!("Import folder does not exist: {}", dir.display());
    }

    let filter = PathFilter::new(config)?;
    let mut scan = Scan::default();

    for entry in WalkDir::new(dir).follow_links(config.follow_symlinks) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        if !filter.allows(root, path) {
            continue;
        }

        let path = canonical_path(path);
        if extractors.supports(&path) {
            scan.files.push(path);
        } else {
            scan.unsupported.push(path);
        }
    }

    scan.files.sort();
    scan.files.dedup();
    scan.unsupported.sort();
    scan.unsupported.dedup();
    Ok(scan)
}

/// Exclusion rules shared by the folder walk and the watcher.
#[derive(Debug, Clone)]
pub struct PathFilter {
    excludes: GlobSet,
}

impl PathFilter {
    pub fn new(config: &ImportConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            excludes: build_globset(&excludes)?,
        })
    }

    /// Whether `path` lies under `root` and is neither excluded nor hidden.
    pub fn allows(&self, root: &Path, path: &Path) -> bool {
        let Ok(relative) = path.strip_prefix(root) else {
            return false;
        };
        !self.excludes.is_match(relative) && !is_hidden(relative)
    }
}

/// Result of a folder walk.
#[derive(Debug, Default)]
pub struct Scan {
    pub files: Vec<PathBuf>,
    pub unsupported: Vec<PathBuf>,
}

fn is_hidden(relative: &Path) -> bool {
    relative
        .components()
        .any(|c| c.as_os_str().to_str().is_some_and(|s| s.starts_with('.')))
}

/// Build the record for a file from the `metadata` taken before `bytes`
/// were read. A write racing the read then leaves a stale mtime behind,
/// which only causes one extra re-index.
pub fn file_meta(
    path: &Path,
    format: &str,
    metadata: &std::fs::Metadata,
    bytes: &[u8],
) -> FileMeta {
    FileMeta {
        path: path.to_path_buf(),
        name: path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default(),
        format: format.to_string(),
        size_bytes: metadata.len(),
        modified_at: modified_millis(metadata),
        content_hash: content_hash(bytes),
    }
}

pub fn modified_millis(metadata: &std::fs::Metadata) -> i64 {
    metadata
        .modified()
        .unwrap_or(SystemTime::UNIX_EPOCH)
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Absolute, normalised form of `path` used as the file identity key.
///
/// A path that no longer exists keys off its canonical parent, so a deleted
/// file still maps to the record it was indexed under.
pub fn canonical_path(path: &Path) -> PathBuf {
    if let Ok(path) = std::fs::canonicalize(path) {
        return path;
    }
    if let (Some(parent), Some(name)) = (path.parent(), path.file_name()) {
        if let Ok(parent) = std::fs::canonicalize(parent) {
            return parent.join(name);
        }
    }
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map(|cwd| cwd.join(path))
            .unwrap_or_else(|_| path.to_path_buf())
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("Invalid exclude glob: {}", pattern))?,
        );
    }
    Ok(builder.build()?)
}
