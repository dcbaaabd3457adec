//! Text extraction for uploaded documents.
//!
//! Supports plain text and PDF. Extraction never panics: unsupported or
//! unreadable input returns [`RagError::Extraction`] and the ingestion
//! pipeline reports it to the caller.

use std::path::Path;

use crate::error::{RagError, Result};

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_TEXT: &str = "text/plain";

/// File extensions accepted for ingestion.
pub const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "txt"];

/// Map a file name onto the content type used by [`extract_text`].
pub fn content_type_for(file_name: &str) -> Option<&'static str> {
    let ext = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())?
        .to_ascii_lowercase();
    match ext.as_str() {
        "pdf" => Some(MIME_PDF),
        "txt" => Some(MIME_TEXT),
        _ => None,
    }
}

pub fn is_allowed_file(file_name: &str) -> bool {
    content_type_for(file_name).is_some()
}

/// Extract plain UTF-8 text from raw document bytes.
pub fn extract_text(bytes: &[u8], content_type: &str) -> Result<String> {
    match content_type {
        MIME_TEXT => Ok(String::from_utf8_lossy(bytes).into_owned()),
        MIME_PDF => pdf_extract::extract_text_from_mem(bytes)
            .map_err(|e| RagError::Extraction(format!("PDF extraction failed: {}", e))),
        other => Err(RagError::Extraction(format!(
            "unsupported content-type: {}",
            other
        ))),
    }
}

/// Read a file from disk and extract its text, choosing the extractor by
/// file extension.
pub fn extract_file(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let content_type = content_type_for(&name).ok_or_else(|| {
        RagError::Extraction(format!(
            "file type not allowed: {} (expected one of {:?})",
            name, ALLOWED_EXTENSIONS
        ))
    })?;
    let bytes = std::fs::read(path)?;
    extract_text(&bytes, content_type)
}
