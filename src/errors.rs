use std::path::Path;

use thiserror::Error;

/// Top-level application error. All variants carry a human-readable message
/// for display/logging; the route layer maps classes to HTTP statuses.
#[derive(Debug, Error)]
pub enum AppError {
    // ── Storage errors ───────────────────────────────────────────────────────
    #[error("Storage operation failed: {message}")]
    Storage {
        message: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed conversation record: {0}")]
    MalformedRecord(#[source] serde_json::Error),

    // ── Import errors ────────────────────────────────────────────────────────
    #[error("Import source not found: {path}")]
    ImportSourceNotFound { path: String },

    // ── Conversation errors ──────────────────────────────────────────────────
    #[error("No active conversation")]
    NoActiveConversation,

    // ── Validation errors ────────────────────────────────────────────────────
    #[error("Field '{field_name}' cannot be empty")]
    EmptyField { field_name: String },

    #[error("Field '{field_name}' exceeds max length of {max_length} (actual: {actual_length})")]
    FieldTooLong {
        field_name: String,
        max_length: usize,
        actual_length: usize,
    },
}

impl AppError {
    pub fn storage(message: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Storage { message: message.into(), source }
    }

    pub fn import_source_not_found(path: &Path) -> Self {
        AppError::ImportSourceNotFound { path: path.display().to_string() }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, AppError::ImportSourceNotFound { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            AppError::EmptyField { .. }
                | AppError::FieldTooLong { .. }
                | AppError::NoActiveConversation
        )
    }
}
