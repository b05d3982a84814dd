use std::path::PathBuf;

use thiserror::Error;

/// Core error type for DeepBrief.
#[derive(Debug, Error)]
pub enum DeepBriefError {
    #[error("configuration error: {0}")]
    InvalidConfiguration(String),
    #[error("missing environment variable: {0}")]
    MissingSecret(String),
    #[error("I/O error while reading {path}: {source}")]
    ConfigIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl DeepBriefError {
    pub fn config_io(path: PathBuf, source: std::io::Error) -> Self {
        Self::ConfigIo { path, source }
    }
}

/// Failure of a single call against a hosted backend (search, scrape, chat).
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("backend not configured: {0}")]
    NotConfigured(String),
    #[error("request failed: {0}")]
    Transport(String),
    #[error("backend returned HTTP {status}")]
    Status { status: u16 },
    #[error("unexpected response shape: {0}")]
    Decode(String),
}

impl BackendError {
    pub fn transport(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }

    pub fn status(status: reqwest::StatusCode) -> Self {
        Self::Status {
            status: status.as_u16(),
        }
    }

    /// Transient failures are worth another attempt; everything else is
    /// handled by the calling stage's degrade path.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            Self::NotConfigured(_) | Self::Decode(_) => false,
        }
    }

    /// Unprocessable-entity-class answers, used by the extract route to
    /// decide whether a plain scrape is worth trying instead.
    pub fn is_unprocessable(&self) -> bool {
        matches!(self, Self::Status { status } if *status == 422 || *status == 400)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_errors_and_throttles_are_retryable() {
        assert!(BackendError::Status { status: 500 }.is_retryable());
        assert!(BackendError::Status { status: 503 }.is_retryable());
        assert!(BackendError::Status { status: 429 }.is_retryable());
        assert!(BackendError::Transport("connection reset".into()).is_retryable());
    }

    #[test]
    fn client_errors_are_terminal() {
        assert!(!BackendError::Status { status: 404 }.is_retryable());
        assert!(!BackendError::Decode("not json".into()).is_retryable());
        assert!(!BackendError::NotConfigured("no key".into()).is_retryable());
    }

    #[test]
    fn unprocessable_detection_covers_422_and_400() {
        assert!(BackendError::Status { status: 422 }.is_unprocessable());
        assert!(BackendError::Status { status: 400 }.is_unprocessable());
        assert!(!BackendError::Status { status: 500 }.is_unprocessable());
    }
}
