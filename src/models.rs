//! Core data models used throughout LocalLens.
//!
//! These types represent the files, passages and index counts that flow
//! through the import and query pipelines.

use serde::Serialize;
use std::path::PathBuf;

/// A contiguous span of a document's extracted text, as produced by the
/// chunker.
///
/// `start..end` is the passage's own span, in characters, of the original
/// text. Own spans of consecutive passages tile the text without gaps.
/// `content` is the verbatim slice `text[start - overlap..end]`: the last
/// `overlap` characters of the previous passage followed by the own span,
/// so `content.chars().count() == overlap + (end - start)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Passage {
    pub index: usize,
    pub start: usize,
    pub end: usize,
    pub overlap: usize,
    pub content: String,
}

impl Passage {
    /// Character offset where `content` begins in the original text.
    pub fn content_start(&self) -> usize {
        self.start - self.overlap
    }

    /// The passage's own span, without the carried-over overlap.
    pub fn own_text(&self) -> String {
        self.content.chars().skip(self.overlap).collect()
    }
}

/// Metadata describing a source file at the moment it was read.
#[derive(Debug, Clone)]
pub struct FileMeta {
    pub path: PathBuf,
    pub name: String,
    pub format: String,
    pub size_bytes: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_at: i64,
    /// SHA-256 of the raw file bytes.
    pub content_hash: String,
}

/// What the index remembers about a file between imports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub id: i64,
    pub modified_at: i64,
    pub content_hash: String,
    /// `None` while an import of the file is in progress or failed midway.
    pub indexed_at: Option<i64>,
}

impl FileState {
    pub fn is_current(&self, modified_at: i64) -> bool {
        self.indexed_at.is_some() && self.modified_at == modified_at
    }
}

/// A persisted file record.
#[derive(Debug, Clone, Serialize)]
pub struct FileRecord {
    pub id: i64,
    pub path: String,
    pub name: String,
    pub format: String,
    pub size_bytes: i64,
    pub modified_at: i64,
    pub indexed_at: Option<i64>,
    pub passage_count: i64,
}

/// A persisted passage joined with its owning file.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredPassage {
    pub id: i64,
    pub file_id: i64,
    pub file_name: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub start: i64,
    pub end: i64,
    pub content: String,
}

/// Index-wide counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub file_count: i64,
    pub passage_count: i64,
    pub vector_count: i64,
}
