//! Error types for migration operations.

use thiserror::Error;

/// Migration-specific errors.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Failed to authenticate with the issue tracker.
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// A credential file could not be read or parsed.
    #[error("Credentials unavailable: {0}")]
    Credentials(String),

    /// API request failed.
    #[error("API request failed: {0}")]
    ApiError(String),

    /// The tracker temporarily blocked content creation.
    #[error("Abuse detection triggered: {0}")]
    AbuseDetected(String),

    /// Rate limit exceeded.
    #[error("Rate limit exceeded, retry after {0} seconds")]
    RateLimitExceeded(u64),

    /// Network error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Source data that cannot be interpreted.
    #[error("Malformed data in bug #{bug_id}: {reason}")]
    DataDefect {
        /// Legacy bug the record belongs to.
        bug_id: i64,
        /// What was wrong with it.
        reason: String,
    },

    /// The source page does not have the expected structure.
    #[error("Unexpected markup: {0}")]
    MarkupMismatch(String),

    /// A remote issue could not be matched to any legacy bug.
    #[error("No legacy bug matches issue #{number}: {detail}")]
    UnmatchedIssue {
        /// Remote issue number.
        number: u64,
        /// What was searched for.
        detail: String,
    },

    /// Attachment download or upload failed.
    #[error("Attachment transfer failed for comment #{comment_id}: {reason}")]
    TransferFailed {
        /// Comment owning the attachment.
        comment_id: i64,
        /// Underlying failure.
        reason: String,
    },

    /// Generic I/O error.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    /// URL could not be parsed or joined.
    #[error("Invalid URL: {0}")]
    UrlError(#[from] url::ParseError),
}

/// How callers should react to a [`MigrationError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Wait and repeat the same call.
    Retryable,
    /// Abort the run.
    Fatal,
    /// The source data itself is broken; extraction cannot continue.
    DataDefect,
}

impl MigrationError {
    /// Classify the error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::AbuseDetected(_) | Self::RateLimitExceeded(_) => ErrorClass::Retryable,
            Self::DataDefect { .. } | Self::MarkupMismatch(_) => ErrorClass::DataDefect,
            _ => ErrorClass::Fatal,
        }
    }

    /// Returns true if the call may be repeated after a pause.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Retryable
    }
}

/// Result type for migration operations.
pub type Result<T> = std::result::Result<T, MigrationError>;
