//! Submission-time input validation
//!
//! Rejections surface as `ValidationError` and never create a job record.

use std::path::{Path, PathBuf};

use crate::config::InputConfig;
use crate::error::{OrchestratorError, Result};

/// Check that `input_ref` names an acceptable media file; returns its canonical path
pub async fn validate_input(input_ref: &str, config: &InputConfig) -> Result<PathBuf> {
    if input_ref.trim().is_empty() {
        return Err(OrchestratorError::validation("input reference is empty"));
    }
    let path = Path::new(input_ref);

    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .unwrap_or_default();
    if !config
        .allowed_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(&extension))
    {
        return Err(OrchestratorError::validation(format!(
            "unsupported file type '{}' (allowed: {})",
            extension,
            config.allowed_extensions.join(", ")
        )));
    }

    let metadata = tokio::fs::metadata(path)
        .await
        .map_err(|e| OrchestratorError::validation(format!("cannot access {}: {}", input_ref, e)))?;
    if !metadata.is_file() {
        return Err(OrchestratorError::validation(format!(
            "{} is not a regular file",
            input_ref
        )));
    }
    if metadata.len() > config.max_file_size_bytes {
        return Err(OrchestratorError::validation(format!(
            "{} is {} bytes, limit is {}",
            input_ref,
            metadata.len(),
            config.max_file_size_bytes
        )));
    }

    Ok(tokio::fs::canonicalize(path).await?)
}
