//! Error taxonomy shared by the library modules.
//!
//! The binary and the configuration loader use `anyhow`; everything that
//! touches the index, the providers, or conversation memory returns
//! [`RagError`] so callers can decide which failures are fatal to a request
//! and which degrade to a best-effort answer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RagError {
    /// A required credential or setting is missing.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The upstream embedding or completion provider failed.
    #[error("provider error: {0}")]
    Provider(String),

    /// No index or metadata exists for the requested category.
    #[error("not found: {0}")]
    NotFound(String),

    /// A vector's dimensionality disagrees with the stored index.
    #[error("dimension mismatch: index has {expected} dimensions, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An index or metadata file exists but cannot be decoded.
    #[error("corrupt store file: {0}")]
    Corrupt(String),

    #[error("text extraction failed: {0}")]
    Extraction(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl RagError {
    /// Machine-readable code used in HTTP error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Configuration(_) => "configuration",
            RagError::Provider(_) => "provider_error",
            RagError::NotFound(_) => "not_found",
            RagError::DimensionMismatch { .. } => "dimension_mismatch",
            RagError::Io(_) | RagError::Corrupt(_) => "io_error",
            RagError::Extraction(_) => "extraction_failed",
            RagError::InvalidInput(_) => "bad_request",
        }
    }

    /// True for the retrieval failures the orchestrator downgrades to a
    /// per-request error field.
    pub fn is_retrieval_miss(&self) -> bool {
        matches!(
            self,
            RagError::NotFound(_) | RagError::DimensionMismatch { .. }
        )
    }
}

impl From<serde_json::Error> for RagError {
    fn from(e: serde_json::Error) -> Self {
        RagError::Corrupt(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RagError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retrieval_misses_are_classified() {
        assert!(RagError::NotFound("science".into()).is_retrieval_miss());
        assert!(RagError::DimensionMismatch {
            expected: 1,
            actual: 3
        }
        .is_retrieval_miss());
        assert!(!RagError::Provider("boom".into()).is_retrieval_miss());
    }

    #[test]
    fn mismatch_message_names_both_dims() {
        let msg = RagError::DimensionMismatch {
            expected: 1536,
            actual: 2,
        }
        .to_string();
        assert!(msg.contains("1536"));
        assert!(msg.contains('2'));
    }
}
