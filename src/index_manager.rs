//! Lifecycle of category indexes: merge-rebuild, source deletion, listing.
//!
//! Every mutation runs inside a [`Backup`] transaction: the current pair is
//! moved to `.bak`, the new pair is staged and renamed into place, and the
//! backups are dropped only after both primaries are written. Any failure
//! on the way puts the backups back, so readers see either the old state or
//! the complete new one.
//!
//! Mutations on one category are serialised by a per-category
//! [`RwLock`] shared with the [`Retriever`](crate::retriever::Retriever):
//! searches take the read side, `rebuild`/`delete_source` the write side.
//!
//! All methods block on file I/O; async callers run them through
//! `tokio::task::spawn_blocking`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use serde::Serialize;
use tracing::{error, info, warn};

use crate::error::{RagError, Result};
use crate::flat_index::FlatIndex;
use crate::models::Chunk;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{self, Backup, CategoryPaths};

/// Registry of per-category reader/writer locks, keyed by category name.
#[derive(Default)]
pub struct CategoryLocks {
    locks: Mutex<HashMap<String, Arc<RwLock<()>>>>,
}

impl CategoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The lock for `category`, created on first use.
    pub fn get(&self, category: &str) -> Arc<RwLock<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(
            locks
                .entry(category.to_string())
                .or_insert_with(|| Arc::new(RwLock::new(()))),
        )
    }
}

/// Summary of a completed [`IndexManager::rebuild`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RebuildReport {
    pub category: String,
    pub previous: usize,
    pub added: usize,
    pub total: usize,
    pub dim: usize,
}

/// Summary of a completed [`IndexManager::delete_source`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DeleteReport {
    pub category: String,
    pub source: String,
    pub removed: usize,
    pub remaining: usize,
}

/// Owns every category index under one vector directory.
#[derive(Clone)]
pub struct IndexManager {
    vector_dir: PathBuf,
    locks: Arc<CategoryLocks>,
}

impl IndexManager {
    /// Open the vector directory, creating it if needed and rolling back
    /// any update a previous process left unfinished.
    pub fn open(vector_dir: impl Into<PathBuf>, locks: Arc<CategoryLocks>) -> Result<Self> {
        let vector_dir = vector_dir.into();
        std::fs::create_dir_all(&vector_dir)?;
        let recovered = store::recover_interrupted(&vector_dir)?;
        if recovered > 0 {
            warn!(recovered, dir = %vector_dir.display(), "rolled back interrupted index updates");
        }
        Ok(Self { vector_dir, locks })
    }

    pub fn vector_dir(&self) -> &Path {
        &self.vector_dir
    }

    pub fn locks(&self) -> Arc<CategoryLocks> {
        Arc::clone(&self.locks)
    }

    pub fn paths(&self, category: &str) -> CategoryPaths {
        CategoryPaths::new(&self.vector_dir, category)
    }

    /// Merge `new_vectors`/`new_metadatas` after everything already stored
    /// for `category` and replace the on-disk pair.
    ///
    /// Old entries keep their positions; new ones follow in input order.
    /// If the stored pair cannot be loaded it is treated as empty. If the
    /// merged set is empty a placeholder index of dimensionality 1 is
    /// written. Vectors whose length differs from the first merged vector
    /// fail the call with [`RagError::DimensionMismatch`] and leave the
    /// previous pair untouched.
    pub fn rebuild(
        &self,
        category: &str,
        new_vectors: Vec<Vec<f32>>,
        new_metadatas: Vec<Chunk>,
        progress: &dyn ProgressReporter,
    ) -> Result<RebuildReport> {
        if new_vectors.len() != new_metadatas.len() {
            return Err(RagError::InvalidInput(format!(
                "{} vectors but {} metadata entries",
                new_vectors.len(),
                new_metadatas.len()
            )));
        }

        let lock = self.locks.get(category);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
        let paths = self.paths(category);

        let backup = Backup::begin(&paths)?;
        match merge_and_write(&backup, &paths, category, new_vectors, new_metadatas, progress) {
            Ok(report) => {
                backup.commit()?;
                info!(
                    category = %category,
                    previous = report.previous,
                    added = report.added,
                    total = report.total,
                    "index rebuilt"
                );
                Ok(report)
            }
            Err(e) => {
                error!(category = %category, error = %e, "index update failed, restoring backup");
                if let Err(restore_err) = backup.restore() {
                    error!(category = %category, error = %restore_err, "failed to restore backup");
                }
                Err(e)
            }
        }
    }

    /// Remove every chunk whose `source` equals `source_name`, keeping the
    /// surviving vectors bit-for-bit without re-embedding.
    ///
    /// Fails with [`RagError::NotFound`] when the category has no index.
    pub fn delete_source(&self, category: &str, source_name: &str) -> Result<DeleteReport> {
        let lock = self.locks.get(category);
        let _guard = lock.write().unwrap_or_else(|e| e.into_inner());
        let paths = self.paths(category);

        if !paths.exists() {
            return Err(RagError::NotFound(format!(
                "no index for category '{}'",
                category
            )));
        }

        let backup = Backup::begin(&paths)?;
        let (index, metas) = match backup.load_previous() {
            Ok(pair) => pair,
            Err(e) => {
                error!(category = %category, error = %e, "cannot read index for deletion");
                backup.restore()?;
                return Err(e);
            }
        };

        let keep: Vec<usize> = metas
            .iter()
            .enumerate()
            .filter(|(_, m)| m.source != source_name)
            .map(|(i, _)| i)
            .collect();
        let removed = metas.len() - keep.len();

        if removed == 0 {
            backup.restore()?;
            info!(category = %category, source = %source_name, "no chunks matched, index unchanged");
            return Ok(DeleteReport {
                category: category.to_string(),
                source: source_name.to_string(),
                removed: 0,
                remaining: metas.len(),
            });
        }

        let result = (|| -> Result<()> {
            if keep.is_empty() {
                return store::write_pair(&paths, &FlatIndex::empty_placeholder(), &[]);
            }
            let mut survivors = FlatIndex::new(index.dim())?;
            for &i in &keep {
                survivors.add(&index.reconstruct(i)?)?;
            }
            let kept_metas: Vec<Chunk> = keep.iter().map(|&i| metas[i].clone()).collect();
            store::write_pair(&paths, &survivors, &kept_metas)
        })();

        match result {
            Ok(()) => {
                backup.commit()?;
                info!(
                    category = %category,
                    source = %source_name,
                    removed,
                    remaining = keep.len(),
                    "source deleted from index"
                );
                Ok(DeleteReport {
                    category: category.to_string(),
                    source: source_name.to_string(),
                    removed,
                    remaining: keep.len(),
                })
            }
            Err(e) => {
                error!(category = %category, error = %e, "delete failed, restoring backup");
                if let Err(restore_err) = backup.restore() {
                    error!(category = %category, error = %restore_err, "failed to restore backup");
                }
                Err(e)
            }
        }
    }

    /// Sorted, de-duplicated `source` names stored for `category`.
    /// Empty when the category has no metadata yet.
    pub fn list_sources(&self, category: &str) -> Result<Vec<String>> {
        let lock = self.locks.get(category);
        let _guard = lock.read().unwrap_or_else(|e| e.into_inner());
        let paths = self.paths(category);
        if !paths.meta.exists() {
            return Ok(Vec::new());
        }
        let sources: BTreeSet<String> = store::read_metadata(&paths.meta)?
            .into_iter()
            .map(|m| m.source)
            .collect();
        Ok(sources.into_iter().collect())
    }
}

/// Run blocking index work on tokio's blocking pool.
pub async fn run_blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| RagError::Io(std::io::Error::other(format!("index task failed: {}", e))))?
}

fn merge_and_write(
    backup: &Backup<'_>,
    paths: &CategoryPaths,
    category: &str,
    new_vectors: Vec<Vec<f32>>,
    new_metadatas: Vec<Chunk>,
    progress: &dyn ProgressReporter,
) -> Result<RebuildReport> {
    let (mut vectors, mut metas) = if backup.has_previous() {
        match backup
            .load_previous()
            .and_then(|(index, metas)| Ok((index.reconstruct_n(0, index.len())?, metas)))
        {
            Ok(pair) => pair,
            Err(e) => {
                warn!(category = %category, error = %e, "could not load previous index, treating it as empty");
                (Vec::new(), Vec::new())
            }
        }
    } else {
        (Vec::new(), Vec::new())
    };

    let previous = vectors.len();
    let added = new_vectors.len();
    vectors.extend(new_vectors);
    metas.extend(new_metadatas);

    if vectors.is_empty() {
        store::write_pair(paths, &FlatIndex::empty_placeholder(), &[])?;
        return Ok(RebuildReport {
            category: category.to_string(),
            previous,
            added,
            total: 0,
            dim: 1,
        });
    }

    let dim = vectors[0].len();
    let mut index = FlatIndex::new(dim)?;
    let total = vectors.len();
    let mut last_percent = None;
    for (i, vector) in vectors.iter().enumerate() {
        index.add(vector)?;
        let percent = ((i + 1) * 100 / total) as u8;
        if last_percent != Some(percent) {
            progress.report(ProgressEvent::Indexing {
                n: (i + 1) as u64,
                total: total as u64,
                percent,
            });
            last_percent = Some(percent);
        }
    }

    store::write_pair(paths, &index, &metas)?;
    Ok(RebuildReport {
        category: category.to_string(),
        previous,
        added,
        total,
        dim,
    })
}
