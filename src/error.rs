use thiserror::Error;

/// Type alias for Result with SyncError
pub type Result<T> = std::result::Result<T, SyncError>;

/// Error types for the email sync engine
#[derive(Error, Debug)]
pub enum SyncError {
    /// Mailbox or classification service rejected our credentials
    #[error("Authentication failed: {0}")]
    AuthError(String),

    /// Connection issues, timeouts, dropped sockets
    #[error("Network error: {0}")]
    NetworkError(String),

    /// Rate limit exceeded - should retry after specified seconds
    #[error("Rate limit exceeded, retry after {retry_after} seconds")]
    RateLimitExceeded { retry_after: u64 },

    /// Classification service returned an error
    #[error("Classification service error: {0}")]
    ServiceError(String),

    /// Message vanished from the mailbox between listing and fetching
    #[error("Message not found: {0}")]
    MessageNotFound(String),

    /// The mailbox server answered something we could not understand
    #[error("Mailbox protocol error: {0}")]
    ProtocolError(String),

    /// Invalid message format or parsing error
    #[error("Invalid message format: {0}")]
    InvalidMessageFormat(String),

    /// IO error (document writes, checkpoint writes, etc.)
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Secret store lookup failed
    #[error("Secret store error: {0}")]
    SecretError(String),

    /// Checkpoint file exists but cannot be trusted
    #[error("Checkpoint at {path} is corrupted: {reason}")]
    CheckpointCorrupted { path: String, reason: String },

    /// Another sync run holds the lock
    #[error("Another sync is running (lock file {0}); remove it if the previous run crashed")]
    Locked(String),

    /// User cancelled operation
    #[error("Operation cancelled: {0}")]
    OperationCancelled(String),

    /// Generic catch-all error
    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl SyncError {
    /// Check if the error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SyncError::RateLimitExceeded { .. }
                | SyncError::NetworkError(_)
                | SyncError::ServiceError(_)
        )
    }

    /// Check if the error is permanent and should not be retried
    pub fn is_permanent(&self) -> bool {
        !self.is_transient()
    }

    /// Errors that touch shared state or credentials and must abort the run
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::AuthError(_)
                | SyncError::ConfigError(_)
                | SyncError::SecretError(_)
                | SyncError::CheckpointCorrupted { .. }
                | SyncError::Locked(_)
        )
    }
}

/// Parse a Retry-After header value
///
/// The header can be specified in two formats:
/// 1. Delay-seconds: An integer indicating seconds to wait (e.g., "120")
/// 2. HTTP-date: An HTTP date format (e.g., "Wed, 21 Oct 2015 07:28:00 GMT")
///
/// Returns the number of seconds to wait. If the value is missing or invalid,
/// returns a default of 5 seconds.
pub(crate) fn parse_retry_after(value: Option<&str>) -> u64 {
    const DEFAULT_RETRY_AFTER: u64 = 5;

    if let Some(retry_after_str) = value {
        let retry_after_str = retry_after_str.trim();
        if let Ok(seconds) = retry_after_str.parse::<u64>() {
            return seconds;
        }

        if let Ok(http_date) = httpdate::parse_http_date(retry_after_str) {
            let now = std::time::SystemTime::now();
            if let Ok(duration) = http_date.duration_since(now) {
                return duration.as_secs();
            }
        }
    }

    DEFAULT_RETRY_AFTER
}

impl From<reqwest::Error> for SyncError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            SyncError::NetworkError(error.to_string())
        } else if error.is_decode() {
            SyncError::ServiceError(format!("Malformed service response: {}", error))
        } else {
            SyncError::ServiceError(error.to_string())
        }
    }
}
