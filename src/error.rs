//! Custom error types for archivist

use thiserror::Error;

/// Main error type for archivist operations
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Write conflict on document {document_id}: expected version {expected_version}")]
    Conflict {
        document_id: String,
        expected_version: i64,
    },

    #[error("Document not found: {0}")]
    DocumentNotFound(String),

    #[error("Tag not found: {0}")]
    TagNotFound(String),

    #[error("Sync job not found: {0}")]
    JobNotFound(String),

    #[error("Indexing backend error: {0}")]
    Indexer(#[from] SyncError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    #[error("TOML serialize error: {0}")]
    TomlSerialize(#[from] toml::ser::Error),

    #[error("Not initialized: run 'archivist init' first")]
    NotInitialized,

    #[error("Already initialized at {0}")]
    AlreadyInitialized(String),

    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

/// Result type alias for archivist
pub type Result<T> = std::result::Result<T, Error>;

/// Whether an indexing-backend failure is worth retrying.
///
/// The worker pool branches on this kind alone; it never inspects the
/// message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncErrorKind {
    /// Network trouble, rate limiting, 5xx-class responses. Retried
    /// with backoff up to the configured attempt ceiling.
    Transient,
    /// The backend rejected the document itself. Retrying cannot help;
    /// the job is exhausted immediately.
    Permanent,
}

impl std::fmt::Display for SyncErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncErrorKind::Transient => write!(f, "transient"),
            SyncErrorKind::Permanent => write!(f, "permanent"),
        }
    }
}

/// Failure reported by the external indexing adapter
#[derive(Error, Debug, Clone)]
#[error("{kind} indexing failure: {message}")]
pub struct SyncError {
    pub kind: SyncErrorKind,
    pub message: String,
}

impl SyncError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            kind: SyncErrorKind::Transient,
            message: message.into(),
        }
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            kind: SyncErrorKind::Permanent,
            message: message.into(),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind == SyncErrorKind::Transient
    }
}

/// Result type for adapter calls
pub type SyncResult<T> = std::result::Result<T, SyncError>;
