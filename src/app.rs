//! Composition root: builds every component from a [`Config`].
//!
//! The HTTP server and the CLI both work through an [`App`]. Tests build
//! one with in-process providers via [`App::with_providers`].

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::answer::AnswerEngine;
use crate::completion::{self, CompletionProvider};
use crate::config::Config;
use crate::conversation::{ConversationResolver, FileThreadStore, ThreadStore};
use crate::embedding::{self, EmbeddingProvider};
use crate::index_manager::{CategoryLocks, IndexManager};
use crate::ingest::Ingestor;
use crate::progress::ProgressLog;
use crate::retriever::Retriever;
use crate::usage::UsageReporter;

pub struct App {
    pub config: Arc<Config>,
    pub index: IndexManager,
    pub retriever: Retriever,
    pub ingestor: Arc<Ingestor>,
    pub answers: Arc<AnswerEngine>,
    pub progress: Arc<ProgressLog>,
    pub usage: UsageReporter,
}

impl App {
    /// Build with the providers named in the configuration and file-backed
    /// conversation memory.
    pub fn from_config(config: &Config) -> Result<Self> {
        let embedder = embedding::create_provider(&config.embedding)
            .context("Failed to create embedding provider")?;
        let completion = completion::create_provider(&config.completion)
            .context("Failed to create completion provider")?;
        let threads = Arc::new(FileThreadStore::new(&config.storage.threads_dir));
        Self::with_providers(config, embedder, completion, threads)
    }

    pub fn with_providers(
        config: &Config,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        threads: Arc<dyn ThreadStore>,
    ) -> Result<Self> {
        let config = Arc::new(config.clone());
        let locks = Arc::new(CategoryLocks::new());
        let index = IndexManager::open(&config.storage.vector_dir, Arc::clone(&locks))
            .with_context(|| {
                format!(
                    "Failed to open vector directory: {}",
                    config.storage.vector_dir.display()
                )
            })?;
        let retriever = Retriever::new(&config.storage.vector_dir, locks);
        let usage = UsageReporter::new(&config.usage);

        let resolver = Arc::new(ConversationResolver::new(
            threads,
            Arc::clone(&completion),
            usage.clone(),
            config.completion.rewrite_max_tokens,
            config.completion.temperature,
        ));
        let answers = Arc::new(AnswerEngine::new(
            resolver,
            Arc::clone(&embedder),
            completion,
            retriever.clone(),
            usage.clone(),
            config.completion.max_tokens,
            config.completion.temperature,
        ));
        let ingestor = Arc::new(Ingestor::new(
            index.clone(),
            embedder,
            usage.clone(),
            &config.storage.docs_dir,
            config.chunking.max_chars,
        ));

        Ok(Self {
            config,
            index,
            retriever,
            ingestor,
            answers,
            progress: Arc::new(ProgressLog::new()),
            usage,
        })
    }
}
