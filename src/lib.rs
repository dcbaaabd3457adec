//! # docqa
//!
//! A retrieval-augmented question-answering backend with one exact vector
//! index per category.
//!
//! Documents are extracted, split into word-boundary chunks, embedded, and
//! merged into the category's flat index. Questions are resolved against
//! the conversation thread (follow-ups are rewritten), embedded, matched
//! against the category index, and answered by a completion model from the
//! retrieved context only.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────────┐
//! │  Ingestor   │──▶│ IndexManager │──▶│ index_<cat>.idx   │
//! │ extract+emb │   │ backup/merge │   │ meta_<cat>.json   │
//! └─────────────┘   └──────────────┘   └────────┬─────────┘
//!                                               │ read
//! ┌──────────────┐   ┌──────────────┐   ┌───────▼──────┐
//! │ Conversation │──▶│ AnswerEngine │──▶│  Retriever   │
//! │  Resolver    │   │ embed+prompt │   └──────────────┘
//! └──────────────┘   └──────────────┘
//!         ▲                  ▲
//!         └──── CLI / HTTP ──┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docqa ingest ./notes.txt --category science
//! docqa ask "What color is the sky?" --category science
//! docqa serve
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Chunk metadata, retrieval hits, conversation entries |
//! | [`flat_index`] | Exact squared-L2 index and its file format |
//! | [`store`] | Per-category file pair, staging and backups |
//! | [`index_manager`] | Merge-rebuild, source deletion, source listing |
//! | [`retriever`] | Top-k search |
//! | [`conversation`] | Thread memory and follow-up resolution |
//! | [`answer`] | Answer orchestration |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`completion`] | Completion provider abstraction |
//! | [`usage`] | Best-effort usage reporting |
//! | [`chunk`] | Text chunking |
//! | [`extract`] | Plain text and PDF extraction |
//! | [`ingest`] | Ingestion pipeline |
//! | [`progress`] | Progress events and the shared progress log |
//! | [`app`] | Component wiring |
//! | [`server`] | HTTP server |

pub mod answer;
pub mod app;
pub mod chunk;
pub mod completion;
pub mod config;
pub mod conversation;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod flat_index;
pub mod index_manager;
pub mod ingest;
pub mod models;
pub mod progress;
pub mod retriever;
pub mod server;
pub mod store;
pub mod usage;
