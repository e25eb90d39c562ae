//! Error taxonomy.
//!
//! Configuration errors stop the program before the Session starts.
//! Connection and protocol errors are handled inside the Session by
//! reconnecting; only `AppError` ever reaches `main`.

use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("rule {rule:?}: invalid pattern for {key:?}: {source}")]
    InvalidPattern {
        rule: String,
        key: String,
        #[source]
        source: regex::Error,
    },

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, reason: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Failures to reach the server. Always recovered by reconnecting.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("connection refused: {0}")]
    Refused(String),

    #[error("server lookup unavailable: {0}")]
    LookupUnavailable(String),

    #[error("timed out")]
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("protocol error: {0}")]
    Protocol(String),

    /// The client runtime is in a state that only a fresh connection fixes.
    #[error("client state corrupted: {0}")]
    Corrupted(String),

    #[error("no such object: {0}")]
    UnknownObject(String),

    #[error("object no longer exists (server reconnected)")]
    Stale,

    #[error("not connected")]
    NotConnected,

    #[error("level is fixed by a rule")]
    Forced,
}

impl SessionError {
    /// Whether the connection must be dropped and re-established.
    pub fn is_transport_failure(&self) -> bool {
        matches!(self, SessionError::Connection(_) | SessionError::Protocol(_))
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("terminal error: {0}")]
    Terminal(#[from] std::io::Error),

    #[error("audio server session failed: {0}")]
    Fatal(String),
}

impl AppError {
    pub fn exit_code(&self) -> i32 {
        match self {
            AppError::Fatal(_) | AppError::Terminal(_) => 1,
            AppError::Config(_) => 2,
        }
    }
}
