//! Ingestion and indexing progress reporting.
//!
//! The ingestion pipeline and the index manager emit [`ProgressEvent`]s
//! through a [`ProgressReporter`]. The CLI reports on **stderr** so stdout
//! stays parseable; the HTTP server appends to a shared [`ProgressLog`]
//! that `GET /progress-stream` consumers poll by snapshot-and-diff.

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tracing::debug;

/// A single progress event.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// A pipeline stage finished or started ("Text extracted", "Done", ...).
    Stage(String),
    /// Embedding chunk `n` of `total`.
    Embedding { n: u64, total: u64 },
    /// Inserting vector `n` of `total` into the rebuilt index.
    Indexing { n: u64, total: u64, percent: u8 },
}

impl ProgressEvent {
    pub fn stage(message: impl Into<String>) -> Self {
        ProgressEvent::Stage(message.into())
    }

    /// Human-readable one-line rendering, as stored in the progress log.
    pub fn message(&self) -> String {
        match self {
            ProgressEvent::Stage(msg) => msg.clone(),
            ProgressEvent::Embedding { n, total } => format!("Embedding {}/{}", n, total),
            ProgressEvent::Indexing { n, total, percent } => format!(
                "Indexing {}/{} ({}%)",
                format_number(*n),
                format_number(*total),
                percent
            ),
        }
    }
}

/// Receives progress events. Implementations must never block the producer
/// for long and must never fail.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// Human-friendly progress on stderr.
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = format!("{}\n", event.message());
        let mut err = std::io::stderr().lock();
        let _ = err.write_all(line.as_bytes());
        let _ = err.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = match &event {
            ProgressEvent::Stage(msg) => serde_json::json!({
                "event": "progress",
                "phase": "stage",
                "message": msg
            }),
            ProgressEvent::Embedding { n, total } => serde_json::json!({
                "event": "progress",
                "phase": "embedding",
                "n": n,
                "total": total
            }),
            ProgressEvent::Indexing { n, total, percent } => serde_json::json!({
                "event": "progress",
                "phase": "indexing",
                "n": n,
                "total": total,
                "percent": percent
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut err = std::io::stderr().lock();
            let _ = writeln!(err, "{}", line);
            let _ = err.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq, clap::ValueEnum)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

// ============ Shared progress log ============

/// Process-wide map from progress id to its ordered status messages.
///
/// Every read, append and delete takes the single internal lock. Readers
/// copy out what they need, so a slow consumer never holds up a producer.
#[derive(Default)]
pub struct ProgressLog {
    entries: Mutex<HashMap<String, Vec<String>>>,
}

impl ProgressLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<String>>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn append(&self, id: &str, message: impl Into<String>) {
        self.lock()
            .entry(id.to_string())
            .or_default()
            .push(message.into());
    }

    /// Messages for `id` starting at position `from`.
    pub fn since(&self, id: &str, from: usize) -> Vec<String> {
        self.lock()
            .get(id)
            .map(|msgs| msgs.iter().skip(from).cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn remove(&self, id: &str) {
        self.lock().remove(id);
    }

    /// Forget `id` after `delay`, giving stream consumers time to drain it.
    pub fn schedule_cleanup(self: &Arc<Self>, id: String, delay: Duration) {
        let log = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            log.remove(&id);
            debug!(progress_id = %id, "progress log entry removed");
        });
    }

    /// A reporter that appends rendered events under `id`.
    pub fn reporter(self: &Arc<Self>, id: impl Into<String>) -> LogReporter {
        LogReporter {
            log: Arc::clone(self),
            id: id.into(),
        }
    }
}

/// [`ProgressReporter`] writing into a [`ProgressLog`] under one id.
pub struct LogReporter {
    log: Arc<ProgressLog>,
    id: String,
}

impl ProgressReporter for LogReporter {
    fn report(&self, event: ProgressEvent) {
        self.log.append(&self.id, event.message());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn event_messages() {
        assert_eq!(ProgressEvent::stage("Done").message(), "Done");
        assert_eq!(
            ProgressEvent::Embedding { n: 2, total: 5 }.message(),
            "Embedding 2/5"
        );
        assert_eq!(
            ProgressEvent::Indexing {
                n: 1000,
                total: 2000,
                percent: 50
            }
            .message(),
            "Indexing 1,000/2,000 (50%)"
        );
    }

    #[test]
    fn log_snapshot_and_diff() {
        let log = Arc::new(ProgressLog::new());
        let reporter = log.reporter("p1");
        reporter.report(ProgressEvent::stage("Upload started"));
        reporter.report(ProgressEvent::stage("Text extracted"));

        let first = log.since("p1", 0);
        assert_eq!(first.len(), 2);
        reporter.report(ProgressEvent::stage("Done"));
        assert_eq!(log.since("p1", first.len()), vec!["Done".to_string()]);
        assert!(log.since("missing", 0).is_empty());
    }

    #[tokio::test]
    async fn log_cleanup_after_delay() {
        let log = Arc::new(ProgressLog::new());
        log.append("p1", "Done");
        log.schedule_cleanup("p1".to_string(), Duration::from_millis(10));
        assert!(log.contains("p1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!log.contains("p1"));
    }
}
