use std::sync::{Mutex, MutexGuard};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image processing error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("Upload failed: {reason}")]
    UploadFailed { reason: String, status: Option<u16> },

    #[error("Send failed: {reason}")]
    SendFailed { reason: String, status: Option<u16> },

    #[error("Upload of '{file_name}' cancelled during {phase}")]
    UploadCancelled { phase: String, file_name: String },

    #[error("Validation error: {field} - {message}")]
    Validation { field: String, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Custom result type
pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation(field: &str, message: &str) -> Self {
        Self::Validation {
            field: field.to_string(),
            message: message.to_string(),
        }
    }

    pub fn decode(message: impl Into<String>) -> Self {
        Self::Decode(message.into())
    }

    pub fn upload_cancelled(phase: &str, file_name: &str) -> Self {
        Self::UploadCancelled {
            phase: phase.to_string(),
            file_name: file_name.to_string(),
        }
    }

    pub fn upload_failed(reason: impl Into<String>, status: Option<u16>) -> Self {
        Self::UploadFailed {
            reason: reason.into(),
            status,
        }
    }

    pub fn send_failed(reason: impl Into<String>, status: Option<u16>) -> Self {
        Self::SendFailed {
            reason: reason.into(),
            status,
        }
    }

    /// HTTP status attached to a transport failure, if the server answered at all.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            AppError::UploadFailed { status, .. } | AppError::SendFailed { status, .. } => *status,
            AppError::Network(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, AppError::UploadCancelled { .. })
    }

    /// The destination refused the payload for being over its size limit (HTTP 413).
    pub fn is_size_limit_exceeded(&self) -> bool {
        self.http_status() == Some(413)
    }

    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Io(_) => true,
            AppError::UploadFailed { status, .. } | AppError::SendFailed { status, .. } => {
                matches!(status, Some(429 | 500 | 502 | 503 | 504))
            }
            _ => false,
        }
    }

    /// Names the file in a cancellation raised by a collaborator that never saw it.
    pub fn with_file_name(self, name: &str) -> Self {
        match self {
            AppError::UploadCancelled { phase, .. } => AppError::upload_cancelled(&phase, name),
            other => other,
        }
    }
}

/// Text shown to the user when a file's pipeline fails.
pub fn failure_description(file_name: &str, error: &AppError) -> String {
    if error.is_size_limit_exceeded() {
        format!(
            "The file '{}' exceeds this homeserver's size limit for uploads",
            file_name
        )
    } else {
        format!("The file '{}' failed to upload.", file_name)
    }
}

/// Lock shared state, recovering the guard if a previous holder panicked.
pub fn lock_or_recover<'a, T>(mutex: &'a Mutex<T>, operation: &str) -> MutexGuard<'a, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            log::error!(
                "Lock poisoned during {} (non-critical, recovering state)",
                operation
            );
            poisoned.into_inner()
        }
    }
}
