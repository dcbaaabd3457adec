//! Best-effort usage reporting to an external portal.
//!
//! Each report is a detached tokio task bounded by the configured timeout.
//! Delivery is at-most-once and may be lost: failures are logged at debug
//! level and never reach the caller.

use std::time::Duration;

use serde::Serialize;
use tracing::debug;

use crate::config::UsageConfig;

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TokenUsage {
    pub model: String,
    pub tokens: u32,
    pub user_id: String,
    pub thread_id: String,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DocumentUpload {
    pub filename: String,
    pub category: String,
    pub region: String,
    pub size: u64,
    pub uploaded_by: String,
}

#[derive(Clone)]
pub struct UsageReporter {
    portal_url: Option<String>,
    client: reqwest::Client,
}

impl UsageReporter {
    pub fn new(config: &UsageConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_default();
        Self {
            portal_url: config
                .portal_url
                .as_ref()
                .map(|u| u.trim_end_matches('/').to_string())
                .filter(|u| !u.is_empty()),
            client,
        }
    }

    /// A reporter that sends nothing.
    pub fn disabled() -> Self {
        Self {
            portal_url: None,
            client: reqwest::Client::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.portal_url.is_some()
    }

    /// Queue a token report. Calls that consumed no tokens are skipped.
    /// Returns whether a report was queued.
    pub fn report_tokens(&self, usage: TokenUsage) -> bool {
        if usage.tokens == 0 {
            return false;
        }
        self.post("tokens/usage", &usage)
    }

    pub fn report_document(&self, upload: DocumentUpload) -> bool {
        self.post("documents", &upload)
    }

    fn post<T: Serialize>(&self, path: &str, body: &T) -> bool {
        let Some(base) = &self.portal_url else {
            return false;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(path, "no runtime; usage report dropped");
            return false;
        };
        let body = match serde_json::to_value(body) {
            Ok(v) => v,
            Err(e) => {
                debug!(error = %e, "usage report not serializable");
                return false;
            }
        };
        let url = format!("{}/{}", base, path);
        let client = self.client.clone();
        handle.spawn(async move {
            match client.post(&url).json(&body).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(url = %url, "usage reported");
                }
                Ok(resp) => debug!(url = %url, status = %resp.status(), "usage report rejected"),
                Err(e) => debug!(url = %url, error = %e, "usage report failed"),
            }
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blank_portal_is_disabled() {
        let reporter = UsageReporter::new(&UsageConfig {
            portal_url: Some(String::new()),
            timeout_secs: 1,
        });
        assert!(!reporter.is_enabled());
        assert!(!UsageReporter::disabled().is_enabled());
    }

    #[test]
    fn test_report_without_runtime_is_dropped() {
        let reporter = UsageReporter::new(&UsageConfig {
            portal_url: Some("http://127.0.0.1:9/api/".to_string()),
            timeout_secs: 1,
        });
        assert!(reporter.is_enabled());
        assert!(!reporter.report_document(DocumentUpload {
            filename: "a.txt".to_string(),
            category: "science".to_string(),
            region: "regional-unknown".to_string(),
            size: 3,
            uploaded_by: "cli".to_string(),
        }));
    }

    fn tokens(n: u32) -> TokenUsage {
        TokenUsage {
            model: "gpt-4".to_string(),
            tokens: n,
            user_id: "u".to_string(),
            thread_id: "t".to_string(),
            meta: serde_json::json!({"type": "answer"}),
        }
    }

    #[tokio::test]
    async fn test_zero_token_reports_are_skipped() {
        let reporter = UsageReporter::new(&UsageConfig {
            portal_url: Some("http://127.0.0.1:9/api".to_string()),
            timeout_secs: 1,
        });
        assert!(!reporter.report_tokens(tokens(0)));
        assert!(reporter.report_tokens(tokens(42)));
        assert!(!UsageReporter::disabled().report_tokens(tokens(42)));
    }

    #[test]
    fn test_token_usage_shape() {
        let usage = TokenUsage {
            model: "gpt-4".to_string(),
            tokens: 42,
            user_id: "u".to_string(),
            thread_id: "t".to_string(),
            meta: serde_json::json!({"kind": "answer"}),
        };
        let json = serde_json::to_value(&usage).unwrap();
        assert_eq!(json["tokens"], 42);
        assert_eq!(json["meta"]["kind"], "answer");
    }
}
