use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CadenceError {
    // Cancellation causes
    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    // Combinator errors
    #[error("open breaker")]
    BreakerOpen,

    #[error("invalid rate limit method")]
    InvalidRateLimit,

    // Step errors
    #[error("{0}")]
    Step(String),

    #[error("Background worker failed: {0}")]
    Worker(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),
}

impl CadenceError {
    /// Whether this error is one of the two context cancellation causes.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled | Self::DeadlineExceeded)
    }
}

impl From<std::io::Error> for CadenceError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<String> for CadenceError {
    fn from(msg: String) -> Self {
        Self::Step(msg)
    }
}

impl From<&str> for CadenceError {
    fn from(msg: &str) -> Self {
        Self::Step(msg.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CadenceError>;
