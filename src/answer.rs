//! Answer orchestration: resolve → embed → retrieve → filter → complete → record.
//!
//! | Stage | Failure handling |
//! |-------|------------------|
//! | Follow-up resolution | Never fails; a failed rewrite uses the original question |
//! | Embedding | Fatal: `Configuration` or `Provider` error returned to the caller |
//! | Retrieval | Downgraded to [`AnswerOutcome::error`], answer built from empty context |
//! | Completion | Downgraded to an in-band `[provider error: ...]` answer |
//! | Recording the turn | Logged, the answer is still returned |
//!
//! The prompt instructs the model to answer only from the retrieved
//! context and is returned with every outcome.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};

use crate::completion::CompletionProvider;
use crate::conversation::ConversationResolver;
use crate::embedding::EmbeddingProvider;
use crate::error::{RagError, Result};
use crate::index_manager::run_blocking;
use crate::models::RetrievedChunk;
use crate::retriever::Retriever;
use crate::usage::{TokenUsage, UsageReporter};

/// Separator placed between retrieved chunks in the prompt context.
pub const CONTEXT_SEPARATOR: &str = "\n\n---\n\n";

/// Reply the model is told to give when the context has no answer.
pub const NO_ANSWER: &str = "Sorry, no relevant answer was found.";

const ANSWER_SYSTEM_PROMPT: &str =
    "You are an assistant that may only answer from the context you are given.";

#[derive(Debug, Clone)]
pub struct AnswerRequest {
    pub question: String,
    pub category: String,
    pub user_id: String,
    pub thread_id: String,
    pub top_k: usize,
    pub region_filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AnswerOutcome {
    pub answer: String,
    /// The question used for retrieval, rewritten when it was a follow-up.
    pub question: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rephrased_question: Option<String>,
    pub degraded_rewrite: bool,
    pub results: Vec<RetrievedChunk>,
    /// Non-fatal retrieval error, if any.
    pub error: Option<String>,
    pub prompt: String,
}

pub struct AnswerEngine {
    resolver: Arc<ConversationResolver>,
    embedder: Arc<dyn EmbeddingProvider>,
    completion: Arc<dyn CompletionProvider>,
    retriever: Retriever,
    usage: UsageReporter,
    max_tokens: u32,
    temperature: f32,
}

impl AnswerEngine {
    pub fn new(
        resolver: Arc<ConversationResolver>,
        embedder: Arc<dyn EmbeddingProvider>,
        completion: Arc<dyn CompletionProvider>,
        retriever: Retriever,
        usage: UsageReporter,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            resolver,
            embedder,
            completion,
            retriever,
            usage,
            max_tokens,
            temperature,
        }
    }

    pub fn resolver(&self) -> &ConversationResolver {
        &self.resolver
    }

    pub async fn answer(&self, req: &AnswerRequest) -> Result<AnswerOutcome> {
        if req.question.trim().is_empty() {
            return Err(RagError::InvalidInput("question must not be empty".to_string()));
        }
        if req.category.trim().is_empty() {
            return Err(RagError::InvalidInput("category must not be empty".to_string()));
        }

        let resolution = self
            .resolver
            .resolve(&req.user_id, &req.thread_id, &req.question)
            .await;

        let vector = self.embedder.embed(&resolution.question).await?;

        let retriever = self.retriever.clone();
        let category = req.category.clone();
        let top_k = req.top_k;
        let (mut results, retrieval_error) =
            match run_blocking(move || retriever.search(&category, &vector, top_k)).await {
                Ok(hits) => (hits, None),
                Err(e) => {
                    if e.is_retrieval_miss() {
                        warn!(category = %req.category, error = %e, "retrieval miss; answering from empty context");
                    } else {
                        error!(category = %req.category, error = %e, "retrieval failed; answering from empty context");
                    }
                    (Vec::new(), Some(e.to_string()))
                }
            };

        if let Some(filter) = req.region_filter.as_deref() {
            results = filter_by_region(results, filter);
        }

        let context = build_context(&results);
        let prompt = build_prompt(&context, &resolution.question);

        let answer = match self
            .completion
            .complete(ANSWER_SYSTEM_PROMPT, &prompt, self.max_tokens, self.temperature)
            .await
        {
            Ok(completion) => {
                self.usage.report_tokens(TokenUsage {
                    model: completion.model.clone(),
                    tokens: completion.usage.total_tokens,
                    user_id: req.user_id.clone(),
                    thread_id: req.thread_id.clone(),
                    meta: serde_json::json!({
                        "type": "answer",
                        "top_k": req.top_k,
                        "category": req.category,
                    }),
                });
                completion.text
            }
            Err(e) => {
                warn!(error = %e, "completion failed; returning in-band error");
                format!("[provider error: {}]", e)
            }
        };

        if let Err(e) = self.resolver.record(
            &req.user_id,
            &req.thread_id,
            &resolution.original,
            resolution.rephrased(),
            &answer,
        ) {
            warn!(
                user_id = %req.user_id,
                thread_id = %req.thread_id,
                error = %e,
                "failed to persist conversation memory"
            );
        }

        info!(
            category = %req.category,
            hits = results.len(),
            followup = resolution.is_followup,
            "answered question"
        );

        Ok(AnswerOutcome {
            answer,
            rephrased_question: resolution.rephrased().map(str::to_string),
            question: resolution.question,
            degraded_rewrite: resolution.degraded,
            results,
            error: retrieval_error,
            prompt,
        })
    }
}

/// Keep results whose region contains `filter`, ignoring case. A blank
/// filter keeps everything.
pub fn filter_by_region(results: Vec<RetrievedChunk>, filter: &str) -> Vec<RetrievedChunk> {
    let needle = filter.trim().to_lowercase();
    if needle.is_empty() {
        return results;
    }
    results
        .into_iter()
        .filter(|r| r.chunk.region.to_lowercase().contains(&needle))
        .collect()
}

/// Join the text of every hit that carries text, in retrieval order.
pub fn build_context(results: &[RetrievedChunk]) -> String {
    results
        .iter()
        .filter_map(|r| r.chunk.text.as_deref())
        .collect::<Vec<_>>()
        .join(CONTEXT_SEPARATOR)
}

pub fn build_prompt(context: &str, question: &str) -> String {
    format!(
        "Answer the following question using only the context below. \
If the context does not contain the answer, reply exactly: '{NO_ANSWER}'\n\n\
Context:\n{context}\n\n\
Question:\n{question}\n\n\
Answer:"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Chunk;

    fn hit(text: Option<&str>, region: &str) -> RetrievedChunk {
        RetrievedChunk {
            chunk: Chunk {
                source: "doc.txt".to_string(),
                chunk_index: 0,
                text: text.map(str::to_string),
                category: "science".to_string(),
                region: region.to_string(),
            },
            distance: 0.0,
        }
    }

    #[test]
    fn test_region_filter_is_case_insensitive_substring() {
        let results = vec![
            hit(Some("a"), "Regional-West"),
            hit(Some("b"), "regional-east"),
            hit(Some("c"), ""),
        ];
        let kept = filter_by_region(results.clone(), "WEST");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].chunk.text.as_deref(), Some("a"));
        assert_eq!(filter_by_region(results, "  ").len(), 3);
    }

    #[test]
    fn test_context_skips_missing_text() {
        let results = vec![hit(Some("one"), ""), hit(None, ""), hit(Some("two"), "")];
        assert_eq!(build_context(&results), "one\n\n---\n\ntwo");
        assert_eq!(build_context(&[]), "");
    }

    #[test]
    fn test_prompt_contains_context_and_question() {
        let prompt = build_prompt("The sky is blue.", "What color is the sky?");
        assert!(prompt.contains("Context:\nThe sky is blue."));
        assert!(prompt.contains("Question:\nWhat color is the sky?"));
        assert!(prompt.contains(NO_ANSWER));
    }
}
