//! Core data models used throughout docqa.
//!
//! These types represent the chunk metadata stored beside each category
//! index, the retrieval hits handed to the answer pipeline, and the
//! question/answer entries kept in conversation memory.

use serde::{Deserialize, Serialize};

/// Metadata for one embedded text chunk.
///
/// Identity is `(source, chunk_index)` within a category. Stored
/// positionally alongside the vectors of a category index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub source: String,
    #[serde(default)]
    pub chunk_index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default)]
    pub category: String,
    #[serde(default)]
    pub region: String,
}

impl Chunk {
    pub fn new(
        source: impl Into<String>,
        chunk_index: usize,
        text: impl Into<String>,
        category: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            source: source.into(),
            chunk_index,
            text: Some(text.into()),
            category: category.into(),
            region: region.into(),
        }
    }
}

/// A chunk returned by the retriever with its squared L2 distance to the query.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    #[serde(flatten)]
    pub chunk: Chunk,
    pub distance: f32,
}

/// One turn of a conversation thread.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub question: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rephrased_question: Option<String>,
    #[serde(default)]
    pub answer: Option<String>,
}
