//! Error types for Pouchmail

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias using Pouchmail's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Pouchmail
#[derive(Error, Debug)]
pub enum Error {
    // Authentication errors
    #[error("sign-in cancelled by user")]
    AuthCancelled,

    #[error("another sign-in attempt is already in progress")]
    AuthInProgress,

    #[error("identity services unavailable: {0}")]
    AuthUnavailable(String),

    #[error("sign-in required")]
    SignInRequired,

    #[error("native sign-in callback fault: {0}")]
    NativeFault(String),

    // Network errors
    #[error("request timed out: {0}")]
    NetworkTimeout(String),

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },

    #[error("malformed response body: {0}")]
    MalformedBody(String),

    // Storage errors
    #[error("storage write failed: {0}")]
    StorageWrite(String),

    #[error("no stored entry for key {0}")]
    StorageNotFound(String),

    #[error("corrupt cache entry {key}: {reason}")]
    CorruptEntry { key: String, reason: String },

    // File errors
    #[error("source file missing: {0}")]
    MissingSource(PathBuf),

    #[error("target path missing: {0}")]
    MissingTarget(PathBuf),

    #[error("file copy failed: {0}")]
    CopyFailed(String),

    #[error("disk full")]
    DiskFull,

    // Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("binary codec error: {0}")]
    Bincode(#[from] bincode::Error),

    // Generic errors
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Returns true if this error means the user must run a full
    /// interactive login before anything else will succeed
    pub fn requires_sign_in(&self) -> bool {
        matches!(self, Error::SignInRequired)
    }

    /// Returns true if a read-path storage error should be treated
    /// as a cache miss rather than a hard failure
    pub fn is_cache_miss(&self) -> bool {
        matches!(
            self,
            Error::StorageNotFound(_) | Error::CorruptEntry { .. }
        )
    }

    /// Returns a user-friendly action message for recoverable errors
    pub fn action_hint(&self) -> Option<&'static str> {
        match self {
            Error::SignInRequired | Error::NativeFault(_) => Some("Please sign in again"),
            Error::NetworkTimeout(_) | Error::HttpStatus { .. } => {
                Some("Check your network connection and retry")
            }
            Error::MissingSource(_) => Some("File no longer available"),
            _ => None,
        }
    }
}
