//! Top-k retrieval against a category index.
//!
//! Each search re-reads the category's index and metadata from disk under
//! the category's read lock, so a search never observes a rebuild halfway.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::debug;

use crate::error::{RagError, Result};
use crate::index_manager::CategoryLocks;
use crate::models::RetrievedChunk;
use crate::store::{self, CategoryPaths};

#[derive(Clone)]
pub struct Retriever {
    vector_dir: PathBuf,
    locks: Arc<CategoryLocks>,
}

impl Retriever {
    pub fn new(vector_dir: impl Into<PathBuf>, locks: Arc<CategoryLocks>) -> Self {
        Self {
            vector_dir: vector_dir.into(),
            locks,
        }
    }

    /// Return the metadata of the `top_k` stored chunks nearest to
    /// `query_vector` by squared Euclidean distance, nearest first.
    ///
    /// # Errors
    ///
    /// - [`RagError::NotFound`] when the category has no index, or its index
    ///   holds no vectors.
    /// - [`RagError::DimensionMismatch`] when the query length differs from
    ///   the index dimensionality (checked before emptiness).
    pub fn search(
        &self,
        category: &str,
        query_vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<RetrievedChunk>> {
        let lock = self.locks.get(category);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());

        let paths = CategoryPaths::new(&self.vector_dir, category);
        let (index, metas) = store::read_pair(&paths, category)?;
        debug!(
            category = %category,
            query_dim = query_vector.len(),
            index_dim = index.dim(),
            stored = index.len(),
            "searching category index"
        );

        if query_vector.len() != index.dim() {
            return Err(RagError::DimensionMismatch {
                expected: index.dim(),
                actual: query_vector.len(),
            });
        }
        if index.is_empty() {
            return Err(RagError::NotFound(format!(
                "category '{}' has no indexed chunks",
                category
            )));
        }

        let hits = index.search(query_vector, top_k)?;
        Ok(hits
            .into_iter()
            .filter_map(|(position, distance)| {
                metas.get(position).map(|chunk| RetrievedChunk {
                    chunk: chunk.clone(),
                    distance,
                })
            })
            .collect())
    }
}
