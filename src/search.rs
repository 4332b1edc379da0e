//! Query pipeline.
//!
//! With the model ready, the query is embedded and the `top_k` nearest
//! passages are returned in store order. Otherwise the pipeline falls back
//! to case-insensitive substring matching. The two are never mixed: every
//! response carries the single [`SearchMode`] it was produced in.

use anyhow::Result;
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::sync::Arc;

use crate::config::SearchConfig;
use crate::embedding::EmbeddingEngine;
use crate::models::StoredPassage;
use crate::store::IndexStore;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Semantic,
    Lexical,
}

/// How a hit matched the query.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum MatchKind {
    Semantic { score: f32 },
    /// Character offset and length of the first match inside `content`.
    Lexical { offset: usize, len: usize },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SearchHit {
    pub content: String,
    pub file_name: String,
    pub file_path: String,
    pub chunk_index: i64,
    pub kind: MatchKind,
}

impl SearchHit {
    /// Cosine similarity in `[0, 1]` for semantic hits, `0` for lexical ones.
    pub fn score(&self) -> f32 {
        match self.kind {
            MatchKind::Semantic { score } => score,
            MatchKind::Lexical { .. } => 0.0,
        }
    }

    pub fn is_semantic(&self) -> bool {
        matches!(self.kind, MatchKind::Semantic { .. })
    }

    fn from_passage(p: StoredPassage, kind: MatchKind) -> Self {
        Self {
            content: p.content,
            file_name: p.file_name,
            file_path: p.file_path,
            chunk_index: p.chunk_index,
            kind,
        }
    }
}

// Hosts consume a flat record.
impl Serialize for SearchHit {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("SearchHit", 6)?;
        s.serialize_field("content", &self.content)?;
        s.serialize_field("file_name", &self.file_name)?;
        s.serialize_field("file_path", &self.file_path)?;
        s.serialize_field("chunk_index", &self.chunk_index)?;
        s.serialize_field("score", &self.score())?;
        s.serialize_field("is_semantic", &self.is_semantic())?;
        s.end()
    }
}

/// Why a response has no hits.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmptyState {
    /// Nothing has been imported yet.
    IndexEmpty,
    NoMatches,
}

impl EmptyState {
    pub fn message(&self) -> &'static str {
        match self {
            EmptyState::IndexEmpty => "The index is empty. Import a folder to start searching.",
            EmptyState::NoMatches => "No passages matched your query.",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SearchResponse {
    pub mode: SearchMode,
    pub hits: Vec<SearchHit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub empty_state: Option<EmptyState>,
}

pub struct QueryPipeline {
    store: Arc<IndexStore>,
    engine: Arc<EmbeddingEngine>,
    config: SearchConfig,
}

impl QueryPipeline {
    pub fn new(store: Arc<IndexStore>, engine: Arc<EmbeddingEngine>, config: SearchConfig) -> Self {
        Self {
            store,
            engine,
            config,
        }
    }

    /// Run `query` against the index. A blank query returns no hits and
    /// touches nothing.
    pub async fn search(&self, query: &str) -> Result<SearchResponse> {
        let query = query.trim();
        let ready = self.engine.status().is_ready();
        let mode = if ready {
            SearchMode::Semantic
        } else {
            SearchMode::Lexical
        };

        if query.is_empty() {
            return Ok(SearchResponse {
                mode,
                hits: Vec::new(),
                empty_state: None,
            });
        }

        let semantic = if ready {
            self.semantic(query).await?
        } else {
            None
        };

        let (mode, hits) = match semantic {
            Some(hits) => (SearchMode::Semantic, hits),
            None => (SearchMode::Lexical, self.lexical(query).await?),
        };

        let empty_state = if hits.is_empty() {
            let stats = self.store.stats().await?;
            Some(if stats.passage_count == 0 {
                EmptyState::IndexEmpty
            } else {
                EmptyState::NoMatches
            })
        } else {
            None
        };

        tracing::debug!(mode = ?mode, hits = hits.len(), "search finished");
        Ok(SearchResponse {
            mode,
            hits,
            empty_state,
        })
    }

    /// `None` if the engine stopped being able to encode.
    async fn semantic(&self, query: &str) -> Result<Option<Vec<SearchHit>>> {
        let Some(vector) = self.engine.encode(query).await? else {
            return Ok(None);
        };
        let hits = self
            .store
            .nearest(&vector, self.config.top_k)
            .await?
            .into_iter()
            .map(|(p, score)| SearchHit::from_passage(p, MatchKind::Semantic { score }))
            .collect();
        Ok(Some(hits))
    }

    async fn lexical(&self, query: &str) -> Result<Vec<SearchHit>> {
        Ok(self
            .store
            .lexical_search(query, self.config.keyword_limit)
            .await?
            .into_iter()
            .map(|(p, m)| {
                SearchHit::from_passage(
                    p,
                    MatchKind::Lexical {
                        offset: m.offset,
                        len: m.len,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(kind: MatchKind) -> SearchHit {
        SearchHit {
            content: "hello".into(),
            file_name: "a.txt".into(),
            file_path: "/docs/a.txt".into(),
            chunk_index: 2,
            kind,
        }
    }

    #[test]
    fn semantic_hit_serializes_flat() {
        let json = serde_json::to_value(hit(MatchKind::Semantic { score: 0.5 })).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "content": "hello",
                "file_name": "a.txt",
                "file_path": "/docs/a.txt",
                "chunk_index": 2,
                "score": 0.5,
                "is_semantic": true
            })
        );
    }

    #[test]
    fn lexical_hit_has_zero_score() {
        let h = hit(MatchKind::Lexical { offset: 0, len: 5 });
        assert_eq!(h.score(), 0.0);
        assert!(!h.is_semantic());
        let json = serde_json::to_value(&h).unwrap();
        assert_eq!(json["is_semantic"], false);
        assert_eq!(json["score"], 0.0);
    }

    #[test]
    fn response_includes_empty_state_only_when_set() {
        let response = SearchResponse {
            mode: SearchMode::Lexical,
            hits: Vec::new(),
            empty_state: Some(EmptyState::IndexEmpty),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["mode"], "lexical");
        assert_eq!(json["empty_state"], "index_empty");
    }
}
