//! # LocalLens
//!
//! A local-only semantic search engine for document folders.
//!
//! LocalLens splits imported files into overlapping passages, embeds them
//! with an on-disk ONNX sentence-embedding model and stores passages and
//! vectors in a single SQLite file. Queries are answered by nearest-neighbour
//! search once the model is ready, and by case-insensitive substring
//! matching while it is loading or missing. Nothing leaves the machine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌─────────────┐
//! │  Discover   │──▶│ Extract+Chunk│──▶│ IndexStore  │
//! │ walk folder │   │  + Embed     │   │   SQLite    │
//! └─────────────┘   └──────────────┘   └──────┬──────┘
//!                                             │
//!                         ┌───────────────────┤
//!                         ▼                   ▼
//!                  ┌─────────────┐     ┌─────────────┐
//!                  │ QueryPipeline│    │ FolderWatcher│
//!                  │ sem / lexical│    │  re-sync     │
//!                  └─────────────┘     └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! locallens init                    # create the index
//! locallens import ~/Documents      # chunk, embed and store
//! locallens search "tax deadline"   # semantic or lexical
//! locallens stats
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Per-file, store and model-load errors |
//! | [`chunk`] | Sentence-aware passage chunking |
//! | [`extract`] | Format extractors |
//! | [`discover`] | Folder walking and file metadata |
//! | [`embedding`] | Model lifecycle and local inference |
//! | [`store`] | Passages, vectors, nearest and lexical search |
//! | [`ingest`] | Import orchestration, single-path sync, back-fill |
//! | [`progress`] | Import progress reporting |
//! | [`search`] | Query pipeline |
//! | [`watcher`] | Folder watching |
//! | [`stats`] | Index statistics |
//! | [`engine`] | The [`LocalLens`] handle |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod chunk;
pub mod config;
pub mod db;
pub mod discover;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod search;
pub mod stats;
pub mod store;
pub mod watcher;

pub use engine::LocalLens;
