//! Error types for wetcorpus

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for wetcorpus operations
pub type Result<T> = std::result::Result<T, CorpusError>;

/// Main error type for corpus acquisition
#[derive(Error, Debug)]
pub enum CorpusError {
    /// Unsupported mode, unsatisfiable plan or invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),

    /// Remote request failed. `status` is `None` for transport failures.
    #[error("Network error: request for {url} failed with {}: {reason}", status_label(.status))]
    Network {
        url: String,
        status: Option<u16>,
        reason: String,
    },

    #[error("Decode error at byte {offset} ({encoding}): {detail}")]
    Decode {
        offset: u64,
        encoding: String,
        detail: String,
    },

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Insufficient data: plan requires {required} segments but only {available} are available")]
    InsufficientData { required: usize, available: usize },

    /// Cancelled from outside; `partial` names a file left behind for the caller
    #[error("Operation interrupted during {stage}")]
    Interrupted {
        stage: String,
        partial: Option<PathBuf>,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn status_label(status: &Option<u16>) -> String {
    match status {
        Some(code) => format!("status {}", code),
        None => "no response".to_string(),
    }
}

impl CorpusError {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create a network error for a non-success HTTP response
    pub fn http_status(url: impl Into<String>, status: u16, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            status: Some(status),
            reason: reason.into(),
        }
    }

    /// Create a network error for a request that never produced a response
    pub fn transport(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Network {
            url: url.into(),
            status: None,
            reason: reason.into(),
        }
    }

    /// Create an interruption error
    pub fn interrupted(stage: impl Into<String>, partial: Option<PathBuf>) -> Self {
        Self::Interrupted {
            stage: stage.into(),
            partial,
        }
    }

    /// HTTP status carried by a network error
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Network { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the remote asked us to slow down (429 Too Many Requests or 503)
    pub fn is_rate_limited(&self) -> bool {
        matches!(self.status(), Some(429) | Some(503))
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }
}
