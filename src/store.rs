//! Persistent index of files, passages and vectors.
//!
//! Three tables back the index (see [`crate::migrate`]): `files` keyed by a
//! unique absolute path, `passages` referencing files with `ON DELETE
//! CASCADE`, and `passage_vectors` keyed 1:1 to passages.
//!
//! Writes that replace a file's passages run in one transaction, so readers
//! see either the old passages or the new ones. Nearest-neighbour queries
//! score against an in-memory copy of every vector, rebuilt lazily after
//! each write.

use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::config::Config;
use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::StoreError;
use crate::models::{FileMeta, FileRecord, FileState, IndexStats, Passage, StoredPassage};
use crate::{db, migrate};

type StoreResult<T> = std::result::Result<T, StoreError>;

const NEAREST_RETRIES: usize = 3;

/// Where a lexical match sits inside a passage, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LexicalMatch {
    pub offset: usize,
    pub len: usize,
}

/// A passage that has no vector yet.
#[derive(Debug, Clone)]
pub struct PendingPassage {
    pub passage_id: i64,
    pub file_id: i64,
    pub content: String,
}

#[derive(Debug)]
struct CachedVector {
    passage_id: i64,
    file_id: i64,
    chunk_index: i64,
    vector: Vec<f32>,
}

/// All vectors, loaded on first use and dropped on every write.
///
/// A load records the generation it started at and is only installed if no
/// write bumped the generation meanwhile.
#[derive(Default)]
struct VectorCache {
    generation: AtomicU64,
    entries: RwLock<Option<Arc<Vec<CachedVector>>>>,
}

impl VectorCache {
    async fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.entries.write().await = None;
    }
}

pub struct IndexStore {
    pool: SqlitePool,
    cache: VectorCache,
}

impl IndexStore {
    /// Connect to the configured database and bring the schema up to date.
    pub async fn open(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: VectorCache::default(),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn file_state(&self, path: &Path) -> StoreResult<Option<FileState>> {
        let row = sqlx::query(
            "SELECT id, modified_at, content_hash, indexed_at FROM files WHERE path = ?",
        )
        .bind(path_key(path))
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| FileState {
            id: row.get("id"),
            modified_at: row.get("modified_at"),
            content_hash: row.get("content_hash"),
            indexed_at: row.get("indexed_at"),
        }))
    }

    /// Insert or update a file record and return its id.
    ///
    /// The record is marked as not indexed until
    /// [`replace_passages`](Self::replace_passages) commits.
    pub async fn upsert_file(&self, meta: &FileMeta) -> StoreResult<i64> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO files (path, name, format, size_bytes, modified_at, indexed_at, content_hash)
            VALUES (?, ?, ?, ?, ?, NULL, ?)
            ON CONFLICT(path) DO UPDATE SET
                name = excluded.name,
                format = excluded.format,
                size_bytes = excluded.size_bytes,
                modified_at = excluded.modified_at,
                indexed_at = NULL,
                content_hash = excluded.content_hash
            RETURNING id
            "#,
        )
        .bind(path_key(&meta.path))
        .bind(&meta.name)
        .bind(&meta.format)
        .bind(meta.size_bytes as i64)
        .bind(meta.modified_at)
        .bind(&meta.content_hash)
        .fetch_one(&self.pool)
        .await?;

        Ok(id)
    }

    /// Refresh size and timestamp of an indexed file whose content did not
    /// change. Passages are left alone.
    pub async fn touch_file(&self, file_id: i64, meta: &FileMeta) -> StoreResult<()> {
        sqlx::query(
            "UPDATE files SET size_bytes = ?, modified_at = ?, indexed_at = ? WHERE id = ?",
        )
        .bind(meta.size_bytes as i64)
        .bind(meta.modified_at)
        .bind(now_millis())
        .bind(file_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Atomically swap a file's passages (and their vectors, if given) for a
    /// new set, then mark the file indexed.
    ///
    /// When `vectors` is `Some`, it must hold one vector per passage, all of
    /// the dimension already present in the index.
    pub async fn replace_passages(
        &self,
        file_id: i64,
        passages: &[Passage],
        vectors: Option<&[Vec<f32>]>,
    ) -> StoreResult<()> {
        if let Some(vectors) = vectors {
            if vectors.len() != passages.len() {
                return Err(StoreError::VectorCount {
                    passages: passages.len(),
                    vectors: vectors.len(),
                });
            }
        }

        let mut tx = self.pool.begin().await?;

        // Cascades to passage_vectors.
        sqlx::query("DELETE FROM passages WHERE file_id = ?")
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        if let Some(vectors) = vectors {
            check_dims(&mut tx, vectors).await?;
        }

        for (i, passage) in passages.iter().enumerate() {
            let passage_id = sqlx::query(
                r#"
                INSERT INTO passages (file_id, chunk_index, content, content_folded, start_offset, end_offset, overlap)
                VALUES (?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(file_id)
            .bind(passage.index as i64)
            .bind(&passage.content)
            .bind(fold(&passage.content))
            .bind(passage.start as i64)
            .bind(passage.end as i64)
            .bind(passage.overlap as i64)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

            if let Some(vectors) = vectors {
                sqlx::query(
                    "INSERT INTO passage_vectors (passage_id, file_id, embedding) VALUES (?, ?, ?)",
                )
                .bind(passage_id)
                .bind(file_id)
                .bind(vec_to_blob(&vectors[i]))
                .execute(&mut *tx)
                .await?;
            }
        }

        sqlx::query("UPDATE files SET indexed_at = ?, passage_count = ? WHERE id = ?")
            .bind(now_millis())
            .bind(passages.len() as i64)
            .bind(file_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        self.cache.invalidate().await;
        Ok(())
    }

    /// Delete a file with all its passages and vectors. Returns whether a
    /// record existed.
    pub async fn delete_file(&self, path: &Path) -> StoreResult<bool> {
        let result = sqlx::query("DELETE FROM files WHERE path = ?")
            .bind(path_key(path))
            .execute(&self.pool)
            .await?;
        self.cache.invalidate().await;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_file_id(&self, file_id: i64) -> StoreResult<()> {
        sqlx::query("DELETE FROM files WHERE id = ?")
            .bind(file_id)
            .execute(&self.pool)
            .await?;
        self.cache.invalidate().await;
        Ok(())
    }

    pub async fn list_files(&self) -> StoreResult<Vec<FileRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, path, name, format, size_bytes, modified_at, indexed_at, passage_count
            FROM files
            ORDER BY path
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| FileRecord {
                id: row.get("id"),
                path: row.get("path"),
                name: row.get("name"),
                format: row.get("format"),
                size_bytes: row.get("size_bytes"),
                modified_at: row.get("modified_at"),
                indexed_at: row.get("indexed_at"),
                passage_count: row.get("passage_count"),
            })
            .collect())
    }

    /// Files whose path lies under `root`.
    pub async fn list_files_under(&self, root: &Path) -> StoreResult<Vec<FileRecord>> {
        let mut files = self.list_files().await?;
        files.retain(|f| Path::new(&f.path).starts_with(root));
        Ok(files)
    }

    pub async fn stats(&self) -> StoreResult<IndexStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM files) AS file_count,
                (SELECT COUNT(*) FROM passages) AS passage_count,
                (SELECT COUNT(*) FROM passage_vectors) AS vector_count
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(IndexStats {
            file_count: row.get("file_count"),
            passage_count: row.get("passage_count"),
            vector_count: row.get("vector_count"),
        })
    }

    pub async fn last_indexed_at(&self) -> StoreResult<Option<i64>> {
        let ts: Option<i64> = sqlx::query_scalar("SELECT MAX(indexed_at) FROM files")
            .fetch_one(&self.pool)
            .await?;
        Ok(ts)
    }

    /// Vector dimension of the index, if it holds any vectors.
    pub async fn dims(&self) -> StoreResult<Option<usize>> {
        let dims: Option<i64> =
            sqlx::query_scalar("SELECT length(embedding) / 4 FROM passage_vectors LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;
        Ok(dims.map(|d| d as usize))
    }

    /// Up to `limit` passages without a vector, in file then sequence order.
    pub async fn passages_missing_vectors(&self, limit: i64) -> StoreResult<Vec<PendingPassage>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, p.file_id, p.content
            FROM passages p
            LEFT JOIN passage_vectors v ON v.passage_id = p.id
            WHERE v.passage_id IS NULL
            ORDER BY p.file_id, p.chunk_index
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PendingPassage {
                passage_id: row.get("id"),
                file_id: row.get("file_id"),
                content: row.get("content"),
            })
            .collect())
    }

    /// Store vectors for existing passages in one transaction. Passages that
    /// were deleted meanwhile are ignored.
    pub async fn insert_vectors(
        &self,
        pending: &[PendingPassage],
        vectors: &[Vec<f32>],
    ) -> StoreResult<u64> {
        if pending.len() != vectors.len() {
            return Err(StoreError::VectorCount {
                passages: pending.len(),
                vectors: vectors.len(),
            });
        }

        let mut tx = self.pool.begin().await?;
        check_dims(&mut tx, vectors).await?;

        let mut written = 0u64;
        for (p, v) in pending.iter().zip(vectors) {
            let result = sqlx::query(
                r#"
                INSERT OR REPLACE INTO passage_vectors (passage_id, file_id, embedding)
                SELECT id, file_id, ? FROM passages WHERE id = ?
                "#,
            )
            .bind(vec_to_blob(v))
            .bind(p.passage_id)
            .execute(&mut *tx)
            .await?;
            written += result.rows_affected();
        }

        tx.commit().await?;
        self.cache.invalidate().await;
        Ok(written)
    }

    /// The `k` passages most similar to `query`, best first.
    ///
    /// Ties on score go to the lower sequence index, then the lower file id.
    /// Scores are cosine similarities clamped to `[0, 1]`.
    pub async fn nearest(&self, query: &[f32], k: usize) -> StoreResult<Vec<(StoredPassage, f32)>> {
        if k == 0 || query.is_empty() {
            return Ok(Vec::new());
        }

        let mut entries = self.cached_vectors().await?;
        let mut attempt = 0;
        loop {
            let mut scored: Vec<(&CachedVector, f32)> = entries
                .iter()
                .filter(|e| e.vector.len() == query.len())
                .map(|e| (e, cosine_similarity(query, &e.vector).clamp(0.0, 1.0)))
                .collect();

            scored.sort_by(|a, b| {
                b.1.total_cmp(&a.1)
                    .then(a.0.chunk_index.cmp(&b.0.chunk_index))
                    .then(a.0.file_id.cmp(&b.0.file_id))
            });
            scored.truncate(k);

            let ids: Vec<i64> = scored.iter().map(|(e, _)| e.passage_id).collect();
            let mut passages = self.passages_by_id(&ids).await?;

            // A write committed between the two reads replaced some of these
            // passages; rank again against what is stored now.
            if passages.len() < ids.len() && attempt < NEAREST_RETRIES {
                attempt += 1;
                drop(scored);
                entries = Arc::new(self.load_vectors().await?);
                continue;
            }

            return Ok(scored
                .into_iter()
                .filter_map(|(e, score)| passages.remove(&e.passage_id).map(|p| (p, score)))
                .collect());
        }
    }

    /// Case-insensitive substring search over passage text.
    ///
    /// Shorter passages rank first; ties go to the lower file id, then the
    /// lower sequence index.
    pub async fn lexical_search(
        &self,
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<(StoredPassage, LexicalMatch)>> {
        let needle = fold(query);
        if needle.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            r#"
            SELECT p.id, p.file_id, f.name AS file_name, f.path AS file_path,
                   p.chunk_index, p.start_offset, p.end_offset, p.content, p.content_folded
            FROM passages p
            JOIN files f ON f.id = p.file_id
            WHERE instr(p.content_folded, ?) > 0
            ORDER BY length(p.content) ASC, p.file_id ASC, p.chunk_index ASC
            LIMIT ?
            "#,
        )
        .bind(&needle)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let content: String = row.get("content");
                let m = locate(&content, &needle).unwrap_or(LexicalMatch {
                    offset: 0,
                    len: needle.chars().count(),
                });
                (stored_passage(row), m)
            })
            .collect())
    }

    async fn cached_vectors(&self) -> StoreResult<Arc<Vec<CachedVector>>> {
        if let Some(entries) = self.cache.entries.read().await.as_ref() {
            return Ok(Arc::clone(entries));
        }

        let generation = self.cache.generation.load(Ordering::SeqCst);
        let entries = Arc::new(self.load_vectors().await?);

        let mut slot = self.cache.entries.write().await;
        if self.cache.generation.load(Ordering::SeqCst) == generation {
            *slot = Some(Arc::clone(&entries));
        }
        Ok(entries)
    }

    async fn load_vectors(&self) -> StoreResult<Vec<CachedVector>> {
        let rows = sqlx::query(
            r#"
            SELECT v.passage_id, v.file_id, p.chunk_index, v.embedding
            FROM passage_vectors v
            JOIN passages p ON p.id = v.passage_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| {
                let blob: Vec<u8> = row.get("embedding");
                CachedVector {
                    passage_id: row.get("passage_id"),
                    file_id: row.get("file_id"),
                    chunk_index: row.get("chunk_index"),
                    vector: blob_to_vec(&blob),
                }
            })
            .collect())
    }

    async fn passages_by_id(&self, ids: &[i64]) -> StoreResult<HashMap<i64, StoredPassage>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
            r#"
            SELECT p.id, p.file_id, f.name AS file_name, f.path AS file_path,
                   p.chunk_index, p.start_offset, p.end_offset, p.content
            FROM passages p
            JOIN files f ON f.id = p.file_id
            WHERE p.id IN (
            "#,
        );
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let rows = qb.build().fetch_all(&self.pool).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let p = stored_passage(row);
                (p.id, p)
            })
            .collect())
    }
}

async fn check_dims(
    tx: &mut sqlx::Transaction<'_, Sqlite>,
    vectors: &[Vec<f32>],
) -> StoreResult<()> {
    let Some(first) = vectors.first() else {
        return Ok(());
    };
    let actual = first.len();
    if let Some(bad) = vectors.iter().find(|v| v.len() != actual) {
        return Err(StoreError::DimensionMismatch {
            expected: actual,
            actual: bad.len(),
        });
    }

    let existing: Option<i64> =
        sqlx::query_scalar("SELECT length(embedding) / 4 FROM passage_vectors LIMIT 1")
            .fetch_optional(&mut **tx)
            .await?;
    match existing {
        Some(expected) if expected as usize != actual => Err(StoreError::DimensionMismatch {
            expected: expected as usize,
            actual,
        }),
        _ => Ok(()),
    }
}

fn stored_passage(row: &sqlx::sqlite::SqliteRow) -> StoredPassage {
    StoredPassage {
        id: row.get("id"),
        file_id: row.get("file_id"),
        file_name: row.get("file_name"),
        file_path: row.get("file_path"),
        chunk_index: row.get("chunk_index"),
        start: row.get("start_offset"),
        end: row.get("end_offset"),
        content: row.get("content"),
    }
}

/// Case folding shared by stored passages and queries. Folds one character
/// at a time so every folded character traces back to one source character.
pub fn fold(text: &str) -> String {
    text.chars().flat_map(char::to_lowercase).collect()
}

/// Find folded `needle` in `content` and report the match in `content`'s
/// own characters. Folding can expand a character ('İ' becomes two), so
/// offsets into the folded text do not line up with the original.
fn locate(content: &str, needle: &str) -> Option<LexicalMatch> {
    let mut folded = String::with_capacity(content.len());
    let mut source = Vec::with_capacity(content.len());
    for (i, c) in content.chars().enumerate() {
        for lower in c.to_lowercase() {
            folded.push(lower);
            source.push(i);
        }
    }

    let byte = folded.find(needle)?;
    let start = folded[..byte].chars().count();
    let end = start + needle.chars().count();
    let first = *source.get(start)?;
    let last = *source.get(end.checked_sub(1)?)?;
    Some(LexicalMatch {
        offset: first,
        len: last + 1 - first,
    })
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().to_string()
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
