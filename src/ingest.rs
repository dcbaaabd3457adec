//! Ingestion pipeline orchestration.
//!
//! Coordinates the full flow for one document: retain the file →
//! extract text → chunk → embed each chunk → merge into the category index.
//! Every stage is reported through a [`ProgressReporter`]; a failure at any
//! stage is reported as `Failed: ...` and returned. Embedding runs to
//! completion before the index is touched, so a provider failure never
//! changes stored data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::chunk::chunk_text;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::extract;
use crate::index_manager::{run_blocking, DeleteReport, IndexManager, RebuildReport};
use crate::models::Chunk;
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::store::{decode_file_stem, encode_file_stem};
use crate::usage::{DocumentUpload, UsageReporter};

/// Region recorded on chunks when the uploader gives none.
pub const DEFAULT_REGION: &str = "regional-unknown";

#[derive(Debug, Clone)]
pub struct IngestRequest {
    /// Name recorded as the `source` of every chunk.
    pub source: String,
    pub category: String,
    pub region: Option<String>,
    pub uploaded_by: String,
}

impl IngestRequest {
    fn region(&self) -> String {
        self.region
            .as_deref()
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(DEFAULT_REGION)
            .to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestReport {
    pub source: String,
    pub category: String,
    pub region: String,
    pub chunks: usize,
    pub index: RebuildReport,
}

#[derive(Debug, Clone, Serialize)]
pub struct RemoveReport {
    pub category: String,
    pub source: String,
    pub file_removed: bool,
    /// `None` when the category has no index to update.
    pub index: Option<DeleteReport>,
    pub message: String,
}

pub struct Ingestor {
    index: IndexManager,
    embedder: Arc<dyn EmbeddingProvider>,
    usage: UsageReporter,
    docs_dir: PathBuf,
    max_chars: usize,
}

impl Ingestor {
    pub fn new(
        index: IndexManager,
        embedder: Arc<dyn EmbeddingProvider>,
        usage: UsageReporter,
        docs_dir: impl Into<PathBuf>,
        max_chars: usize,
    ) -> Self {
        Self {
            index,
            embedder,
            usage,
            docs_dir: docs_dir.into(),
            max_chars,
        }
    }

    pub fn index(&self) -> &IndexManager {
        &self.index
    }

    /// Directory holding retained documents for `category`.
    pub fn category_docs_dir(&self, category: &str) -> PathBuf {
        self.docs_dir.join(encode_file_stem(category))
    }

    /// Ingest already-extracted text.
    pub async fn ingest_text(
        &self,
        req: &IngestRequest,
        text: &str,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<IngestReport> {
        progress.report(ProgressEvent::stage("Upload started"));
        let result = self.index_text(req, text, Arc::clone(&progress)).await;
        self.finish(req, &result, text.len() as u64, progress.as_ref());
        result
    }

    /// Copy `path` into the category's document directory, extract its text
    /// and ingest it under the file's name.
    pub async fn ingest_file(
        &self,
        path: &Path,
        category: &str,
        region: Option<String>,
        uploaded_by: &str,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<IngestReport> {
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        if !extract::is_allowed_file(&file_name) {
            let err = RagError::InvalidInput(format!(
                "file type not allowed: {} (expected one of {:?})",
                file_name,
                extract::ALLOWED_EXTENSIONS
            ));
            progress.report(ProgressEvent::stage(format!("Failed: {}", err)));
            return Err(err);
        }

        let req = IngestRequest {
            source: file_name,
            category: category.to_string(),
            region,
            uploaded_by: uploaded_by.to_string(),
        };

        let retained = match self.retain_file(path, &req) {
            Ok(p) => p,
            Err(e) => {
                progress.report(ProgressEvent::stage(format!("Failed: {}", e)));
                return Err(e);
            }
        };
        progress.report(ProgressEvent::stage("Upload started"));

        let size = std::fs::metadata(&retained).map(|m| m.len()).unwrap_or(0);
        let result = async {
            let text = run_blocking(move || extract::extract_file(&retained)).await?;
            self.index_text(&req, &text, Arc::clone(&progress)).await
        }
        .await;
        self.finish(&req, &result, size, progress.as_ref());
        result
    }

    fn retain_file(&self, path: &Path, req: &IngestRequest) -> Result<PathBuf> {
        let dir = self.category_docs_dir(&req.category);
        std::fs::create_dir_all(&dir)?;
        let dest = dir.join(encode_file_stem(&req.source));
        if path != dest {
            std::fs::copy(path, &dest)?;
        }
        Ok(dest)
    }

    async fn index_text(
        &self,
        req: &IngestRequest,
        text: &str,
        progress: Arc<dyn ProgressReporter>,
    ) -> Result<IngestReport> {
        if req.category.trim().is_empty() {
            return Err(RagError::InvalidInput("category must not be empty".to_string()));
        }
        if req.source.trim().is_empty() {
            return Err(RagError::InvalidInput("source must not be empty".to_string()));
        }
        if text.trim().is_empty() {
            return Err(RagError::InvalidInput("document contains no text".to_string()));
        }
        progress.report(ProgressEvent::stage("Text extracted"));

        let chunks = chunk_text(text, self.max_chars);
        if chunks.is_empty() {
            return Err(RagError::InvalidInput("no chunks were produced".to_string()));
        }
        let total = chunks.len();
        progress.report(ProgressEvent::stage(format!("Text chunked: {} chunks", total)));

        let region = req.region();
        let mut vectors = Vec::with_capacity(total);
        let mut metadatas = Vec::with_capacity(total);
        for (i, chunk) in chunks.into_iter().enumerate() {
            let vector = self.embedder.embed(&chunk).await.map_err(|e| match e {
                RagError::Provider(msg) => {
                    RagError::Provider(format!("embedding chunk {}/{}: {}", i + 1, total, msg))
                }
                other => other,
            })?;
            vectors.push(vector);
            metadatas.push(Chunk::new(&req.source, i, chunk, &req.category, &region));
            progress.report(ProgressEvent::Embedding {
                n: (i + 1) as u64,
                total: total as u64,
            });
        }

        progress.report(ProgressEvent::stage("Indexing started"));
        let manager = self.index.clone();
        let category = req.category.clone();
        let reporter = Arc::clone(&progress);
        let index = run_blocking(move || {
            manager.rebuild(&category, vectors, metadatas, reporter.as_ref())
        })
        .await?;

        Ok(IngestReport {
            source: req.source.clone(),
            category: req.category.clone(),
            region,
            chunks: total,
            index,
        })
    }

    fn finish(
        &self,
        req: &IngestRequest,
        result: &Result<IngestReport>,
        size: u64,
        progress: &dyn ProgressReporter,
    ) {
        match result {
            Ok(report) => {
                progress.report(ProgressEvent::stage("Done"));
                info!(
                    source = %report.source,
                    category = %report.category,
                    chunks = report.chunks,
                    total = report.index.total,
                    "document ingested"
                );
                self.usage.report_document(DocumentUpload {
                    filename: report.source.clone(),
                    category: report.category.clone(),
                    region: report.region.clone(),
                    size,
                    uploaded_by: req.uploaded_by.clone(),
                });
            }
            Err(e) => {
                progress.report(ProgressEvent::stage(format!("Failed: {}", e)));
                warn!(source = %req.source, category = %req.category, error = %e, "ingestion failed");
            }
        }
    }

    /// Delete a retained document and drop its chunks from the index
    /// without re-embedding.
    ///
    /// Fails with [`RagError::NotFound`] only when neither the file nor any
    /// indexed chunk exists.
    pub async fn remove_document(&self, category: &str, source: &str) -> Result<RemoveReport> {
        let path = self.category_docs_dir(category).join(encode_file_stem(source));
        let file_removed = match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };

        let manager = self.index.clone();
        let (cat, src) = (category.to_string(), source.to_string());
        let index = match run_blocking(move || manager.delete_source(&cat, &src)).await {
            Ok(report) => Some(report),
            Err(RagError::NotFound(_)) => None,
            Err(e) => return Err(e),
        };

        let removed_chunks = index.as_ref().map(|r| r.removed).unwrap_or(0);
        if !file_removed && removed_chunks == 0 {
            return Err(RagError::NotFound(format!(
                "document '{}' not found in category '{}'",
                source, category
            )));
        }

        let message = match &index {
            None => "document removed; no index to update".to_string(),
            Some(r) if r.remaining == 0 => "document removed; index is now empty".to_string(),
            Some(r) => format!("document removed; {} chunks dropped from index", r.removed),
        };
        info!(category = %category, source = %source, file_removed, removed_chunks, "document removed");

        Ok(RemoveReport {
            category: category.to_string(),
            source: source.to_string(),
            file_removed,
            index,
            message,
        })
    }

    /// Names of retained `.pdf`/`.txt` documents for `category`, sorted.
    pub fn list_documents(&self, category: &str) -> Result<Vec<String>> {
        let dir = self.category_docs_dir(category);
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let stem = entry.file_name().to_string_lossy().to_string();
            let name = decode_file_stem(&stem).unwrap_or(stem);
            if extract::is_allowed_file(&name) {
                names.push(name);
            }
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index_manager::CategoryLocks;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Embeds text as `[len, word_count]`; fails on text containing "boom".
    struct LengthEmbedder;

    #[async_trait]
    impl EmbeddingProvider for LengthEmbedder {
        fn model_name(&self) -> &str {
            "length"
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            if text.contains("boom") {
                return Err(RagError::Provider("upstream returned 500".to_string()));
            }
            Ok(vec![
                text.len() as f32,
                text.split_whitespace().count() as f32,
            ])
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<String>>);

    impl ProgressReporter for Collect {
        fn report(&self, event: ProgressEvent) {
            self.0.lock().unwrap().push(event.message());
        }
    }

    fn ingestor(tmp: &TempDir, max_chars: usize) -> Ingestor {
        let manager =
            IndexManager::open(tmp.path().join("vector"), Arc::new(CategoryLocks::new())).unwrap();
        Ingestor::new(
            manager,
            Arc::new(LengthEmbedder),
            UsageReporter::disabled(),
            tmp.path().join("docs"),
            max_chars,
        )
    }

    fn request(source: &str) -> IngestRequest {
        IngestRequest {
            source: source.to_string(),
            category: "science".to_string(),
            region: None,
            uploaded_by: "test".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ingest_text_progress_sequence() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 20);
        let progress = Arc::new(Collect::default());

        let report = ingestor
            .ingest_text(
                &request("facts.txt"),
                "The sky is blue. Water boils at 100C.",
                progress.clone(),
            )
            .await
            .unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.region, DEFAULT_REGION);
        assert_eq!(report.index.total, 2);

        let messages = progress.0.lock().unwrap().clone();
        assert_eq!(messages[0], "Upload started");
        assert_eq!(messages[1], "Text extracted");
        assert_eq!(messages[2], "Text chunked: 2 chunks");
        assert_eq!(messages[3], "Embedding 1/2");
        assert_eq!(messages[4], "Embedding 2/2");
        assert_eq!(messages[5], "Indexing started");
        assert!(messages[6].starts_with("Indexing 1/2"));
        assert_eq!(messages.last().unwrap(), "Done");
    }

    #[tokio::test]
    async fn test_blank_text_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let progress = Arc::new(Collect::default());
        let err = ingestor
            .ingest_text(&request("empty.txt"), "   \n ", progress.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        let messages = progress.0.lock().unwrap().clone();
        assert!(messages.last().unwrap().starts_with("Failed: "));
    }

    #[tokio::test]
    async fn test_embedding_failure_leaves_index_untouched() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        ingestor
            .ingest_text(&request("a.txt"), "alpha beta", Arc::new(NoProgress))
            .await
            .unwrap();

        let err = ingestor
            .ingest_text(&request("b.txt"), "this goes boom", Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Provider(_)));
        assert_eq!(
            ingestor.index().list_sources("science").unwrap(),
            vec!["a.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_ingest_file_retains_document() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let upload = tmp.path().join("notes.txt");
        std::fs::write(&upload, "Grass is green.").unwrap();

        let report = ingestor
            .ingest_file(
                &upload,
                "science",
                Some("Regional-West".to_string()),
                "cli",
                Arc::new(NoProgress),
            )
            .await
            .unwrap();
        assert_eq!(report.source, "notes.txt");
        assert_eq!(report.region, "Regional-West");
        assert_eq!(
            ingestor.list_documents("science").unwrap(),
            vec!["notes.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_ingest_file_rejects_unknown_type() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let upload = tmp.path().join("image.png");
        std::fs::write(&upload, [0u8, 1, 2]).unwrap();
        let err = ingestor
            .ingest_file(&upload, "science", None, "cli", Arc::new(NoProgress))
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::InvalidInput(_)));
        assert!(ingestor.list_documents("science").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_document() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        for (name, text) in [("a.txt", "alpha"), ("b.txt", "beta gamma")] {
            let path = tmp.path().join(name);
            std::fs::write(&path, text).unwrap();
            ingestor
                .ingest_file(&path, "science", None, "cli", Arc::new(NoProgress))
                .await
                .unwrap();
        }

        let report = ingestor.remove_document("science", "a.txt").await.unwrap();
        assert!(report.file_removed);
        assert_eq!(report.index.as_ref().unwrap().removed, 1);
        assert_eq!(
            ingestor.index().list_sources("science").unwrap(),
            vec!["b.txt".to_string()]
        );
        assert_eq!(
            ingestor.list_documents("science").unwrap(),
            vec!["b.txt".to_string()]
        );

        assert!(matches!(
            ingestor.remove_document("science", "a.txt").await,
            Err(RagError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_document_leaves_similarly_named_document() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let upload = tmp.path().join("my_doc.txt");
        std::fs::write(&upload, "alpha beta").unwrap();
        ingestor
            .ingest_file(&upload, "science", None, "cli", Arc::new(NoProgress))
            .await
            .unwrap();
        ingestor
            .ingest_text(&request("my doc.txt"), "gamma delta", Arc::new(NoProgress))
            .await
            .unwrap();

        let report = ingestor.remove_document("science", "my doc.txt").await.unwrap();
        assert!(!report.file_removed);
        assert_eq!(report.index.as_ref().unwrap().removed, 1);
        assert_eq!(
            ingestor.list_documents("science").unwrap(),
            vec!["my_doc.txt".to_string()]
        );
        assert_eq!(
            ingestor.index().list_sources("science").unwrap(),
            vec!["my_doc.txt".to_string()]
        );
    }

    #[tokio::test]
    async fn test_ingest_file_keeps_original_name() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let upload = tmp.path().join("field notes.txt");
        std::fs::write(&upload, "Grass is green.").unwrap();

        let report = ingestor
            .ingest_file(&upload, "sci fi", None, "cli", Arc::new(NoProgress))
            .await
            .unwrap();
        assert_eq!(report.source, "field notes.txt");
        assert_eq!(
            ingestor.list_documents("sci fi").unwrap(),
            vec!["field notes.txt".to_string()]
        );
        assert!(ingestor.list_documents("sci_fi").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_document_without_index() {
        let tmp = TempDir::new().unwrap();
        let ingestor = ingestor(&tmp, 500);
        let dir = ingestor.category_docs_dir("history");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("old.pdf"), b"%PDF").unwrap();

        let report = ingestor.remove_document("history", "old.pdf").await.unwrap();
        assert!(report.file_removed);
        assert!(report.index.is_none());
    }
}
