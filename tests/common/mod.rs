//! In-process providers shared by the integration tests.
//!
//! `KeywordEmbedder` maps text onto keyword counts so nearest-neighbour
//! order is predictable; `ContextEcho` answers with the first retrieved
//! chunk and rewrites "temperature" follow-ups.

#![allow(dead_code)]

use async_trait::async_trait;
use docqa::answer::NO_ANSWER;
use docqa::completion::{Completion, CompletionProvider, Usage};
use docqa::config::Config;
use docqa::conversation::NEW_QUESTION;
use docqa::embedding::EmbeddingProvider;
use docqa::error::{RagError, Result};
use tempfile::TempDir;

pub const VOCABULARY: &[&str] = &[
    "sky",
    "blue",
    "color",
    "water",
    "boil",
    "temperature",
    "100c",
    "grass",
    "green",
];

pub struct KeywordEmbedder;

#[async_trait]
impl EmbeddingProvider for KeywordEmbedder {
    fn model_name(&self) -> &str {
        "keyword"
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let lower = text.to_lowercase();
        Ok(VOCABULARY
            .iter()
            .map(|k| lower.matches(k).count() as f32)
            .collect())
    }
}

pub struct ContextEcho;

#[async_trait]
impl CompletionProvider for ContextEcho {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn complete(&self, _system: &str, user: &str, _: u32, _: f32) -> Result<Completion> {
        let text = if user.contains("Previous answer:") {
            let question = user
                .split("New question:")
                .nth(1)
                .unwrap_or_default()
                .to_lowercase();
            if question.contains("temperature") {
                "At what temperature does water boil?".to_string()
            } else {
                NEW_QUESTION.to_string()
            }
        } else {
            let context = user
                .split("Context:\n")
                .nth(1)
                .and_then(|rest| rest.split("\n\nQuestion:").next())
                .unwrap_or_default();
            match context.split("\n\n---\n\n").next() {
                Some(first) if !first.trim().is_empty() => first.to_string(),
                _ => NO_ANSWER.to_string(),
            }
        };
        Ok(Completion {
            text,
            model: "echo".to_string(),
            usage: Usage {
                prompt_tokens: 10,
                completion_tokens: 5,
                total_tokens: 15,
            },
        })
    }
}

pub struct FailingChat;

#[async_trait]
impl CompletionProvider for FailingChat {
    fn model_name(&self) -> &str {
        "failing"
    }

    async fn complete(&self, _: &str, _: &str, _: u32, _: f32) -> Result<Completion> {
        Err(RagError::Provider("upstream returned 503".to_string()))
    }
}

pub fn config(tmp: &TempDir, max_chars: usize) -> Config {
    let mut config = Config::default();
    config.storage.vector_dir = tmp.path().join("vector");
    config.storage.threads_dir = tmp.path().join("threads");
    config.storage.docs_dir = tmp.path().join("docs");
    config.chunking.max_chars = max_chars;
    config
}
