//! Conversation memory and follow-up resolution.
//!
//! Memory is an ordered list of [`ConversationEntry`] per `(user, thread)`
//! pair, persisted through a [`ThreadStore`]. The [`ConversationResolver`]
//! reads the last stored answer and asks the completion provider whether
//! the new question continues it. The provider answers either with a
//! rewritten, self-contained question or with the [`NEW_QUESTION`] marker.
//!
//! Memory is never pruned.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use crate::completion::CompletionProvider;
use crate::error::Result;
use crate::models::ConversationEntry;
use crate::store::encode_file_stem;
use crate::usage::{TokenUsage, UsageReporter};

/// Reply marker meaning "not a follow-up".
pub const NEW_QUESTION: &str = "NEW QUESTION";

const REWRITE_SYSTEM_PROMPT: &str = "You rewrite follow-up questions so they can be understood \
without the conversation that preceded them.";

// ============ Thread stores ============

/// Durable storage for conversation memory, keyed by `(user_id, thread_id)`.
pub trait ThreadStore: Send + Sync {
    /// The stored entries, or an empty list when nothing readable exists.
    fn load(&self, user_id: &str, thread_id: &str) -> Vec<ConversationEntry>;

    /// Replace the stored list for the pair.
    fn save(&self, user_id: &str, thread_id: &str, entries: &[ConversationEntry]) -> Result<()>;
}

/// One JSON file per thread under a directory.
pub struct FileThreadStore {
    dir: PathBuf,
}

impl FileThreadStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<threads_dir>/<user>_<thread>.json`. Both parts go through
    /// [`encode_file_stem`], which never emits `_`, so each pair owns one file.
    pub fn path_for(&self, user_id: &str, thread_id: &str) -> PathBuf {
        self.dir.join(format!(
            "{}_{}.json",
            encode_file_stem(user_id),
            encode_file_stem(thread_id)
        ))
    }
}

impl ThreadStore for FileThreadStore {
    fn load(&self, user_id: &str, thread_id: &str) -> Vec<ConversationEntry> {
        let path = self.path_for(user_id, thread_id);
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(_) => return Vec::new(),
        };
        if content.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str(&content) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable thread memory; starting empty");
                Vec::new()
            }
        }
    }

    fn save(&self, user_id: &str, thread_id: &str, entries: &[ConversationEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(user_id, thread_id);
        let staging = path.with_extension("json.tmp");
        std::fs::write(&staging, serde_json::to_vec_pretty(entries)?)?;
        std::fs::rename(&staging, &path)?;
        Ok(())
    }
}

/// Process-local memory, for tests and one-shot CLI use.
#[derive(Default)]
pub struct InMemoryThreadStore {
    threads: Mutex<HashMap<(String, String), Vec<ConversationEntry>>>,
}

impl InMemoryThreadStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ThreadStore for InMemoryThreadStore {
    fn load(&self, user_id: &str, thread_id: &str) -> Vec<ConversationEntry> {
        let threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads
            .get(&(user_id.to_string(), thread_id.to_string()))
            .cloned()
            .unwrap_or_default()
    }

    fn save(&self, user_id: &str, thread_id: &str, entries: &[ConversationEntry]) -> Result<()> {
        let mut threads = self.threads.lock().unwrap_or_else(|e| e.into_inner());
        threads.insert(
            (user_id.to_string(), thread_id.to_string()),
            entries.to_vec(),
        );
        Ok(())
    }
}

// ============ Resolver ============

/// Outcome of [`ConversationResolver::resolve`].
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// The question as the user asked it.
    pub original: String,
    /// The question to retrieve and answer with.
    pub question: String,
    pub is_followup: bool,
    /// The rewrite call failed and `question` is the original text.
    pub degraded: bool,
}

impl Resolution {
    fn fresh(question: &str) -> Self {
        Self {
            original: question.to_string(),
            question: question.to_string(),
            is_followup: false,
            degraded: false,
        }
    }

    /// The rewritten question, when one replaced the original.
    pub fn rephrased(&self) -> Option<&str> {
        (self.is_followup && self.question != self.original).then_some(self.question.as_str())
    }
}

pub struct ConversationResolver {
    store: Arc<dyn ThreadStore>,
    completion: Arc<dyn CompletionProvider>,
    usage: UsageReporter,
    max_tokens: u32,
    temperature: f32,
    record_lock: Mutex<()>,
}

impl ConversationResolver {
    pub fn new(
        store: Arc<dyn ThreadStore>,
        completion: Arc<dyn CompletionProvider>,
        usage: UsageReporter,
        max_tokens: u32,
        temperature: f32,
    ) -> Self {
        Self {
            store,
            completion,
            usage,
            max_tokens,
            temperature,
            record_lock: Mutex::new(()),
        }
    }

    pub fn history(&self, user_id: &str, thread_id: &str) -> Vec<ConversationEntry> {
        self.store.load(user_id, thread_id)
    }

    /// Decide whether `question` follows up on the thread's last answer and
    /// rewrite it if so. Never fails: a failed rewrite call yields the
    /// original question with `degraded` set.
    pub async fn resolve(&self, user_id: &str, thread_id: &str, question: &str) -> Resolution {
        let memory = self.store.load(user_id, thread_id);
        let previous_answer = match memory.last().and_then(|e| e.answer.as_deref()) {
            Some(a) if !a.trim().is_empty() => a.to_string(),
            _ => return Resolution::fresh(question),
        };

        let prompt = rewrite_prompt(&previous_answer, question);
        match self
            .completion
            .complete(
                REWRITE_SYSTEM_PROMPT,
                &prompt,
                self.max_tokens,
                self.temperature,
            )
            .await
        {
            Ok(completion) => {
                self.usage.report_tokens(TokenUsage {
                    model: completion.model.clone(),
                    tokens: completion.usage.total_tokens,
                    user_id: user_id.to_string(),
                    thread_id: thread_id.to_string(),
                    meta: serde_json::json!({ "type": "rephrase-detection" }),
                });

                let reply = completion.text.trim();
                if is_new_question_marker(reply) || reply.is_empty() {
                    debug!(user_id, thread_id, "question is not a follow-up");
                    Resolution::fresh(question)
                } else {
                    debug!(user_id, thread_id, rewritten = %reply, "follow-up rewritten");
                    Resolution {
                        original: question.to_string(),
                        question: reply.to_string(),
                        is_followup: true,
                        degraded: false,
                    }
                }
            }
            Err(e) => {
                warn!(user_id, thread_id, error = %e, "follow-up rewrite failed; using original question");
                Resolution {
                    degraded: true,
                    ..Resolution::fresh(question)
                }
            }
        }
    }

    /// Append one turn and persist the whole list.
    pub fn record(
        &self,
        user_id: &str,
        thread_id: &str,
        question: &str,
        rephrased_question: Option<&str>,
        answer: &str,
    ) -> Result<()> {
        let _guard = self.record_lock.lock().unwrap_or_else(|e| e.into_inner());
        let mut memory = self.store.load(user_id, thread_id);
        memory.push(ConversationEntry {
            question: question.to_string(),
            rephrased_question: rephrased_question.map(str::to_string),
            answer: Some(answer.to_string()),
        });
        self.store.save(user_id, thread_id, &memory)
    }
}

fn rewrite_prompt(previous_answer: &str, question: &str) -> String {
    format!(
        "Decide whether the new question continues the topic of the previous answer \
or is a new, unrelated question.\n\
If it is a follow-up, rewrite it as one specific, self-contained question based on the \
previous answer and output only that question.\n\
If it is a new question, output exactly: {NEW_QUESTION}\n\n\
Previous answer: {previous_answer}\n\n\
New question: {question}\n\n\
Output:"
    )
}

/// True when a rewrite reply is the [`NEW_QUESTION`] marker, ignoring case,
/// surrounding quotes and a trailing period.
pub fn is_new_question_marker(reply: &str) -> bool {
    let trimmed = reply
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .trim_end_matches('.')
        .trim();
    trimmed.eq_ignore_ascii_case(NEW_QUESTION)
}
