use std::borrow::Cow;

use thiserror::Error;

/// Errors that can occur in the tacore messaging and service layer.
#[derive(Debug, Error)]
pub enum TacoreError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("zeromq error: {0}")]
    Zmq(#[from] zeromq::ZmqError),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("connection timeout after {0:?}")]
    Timeout(std::time::Duration),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),

    #[error("store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error("store migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("invalid request envelope: {0}")]
    InvalidJson(String),

    #[error("validation failed on field '{field}': {message}")]
    Validation { field: String, message: String },

    #[error("unsupported method '{0}'")]
    UnsupportedMethod(String),

    #[error("no workers available")]
    NoWorkers,

    #[error("{message}")]
    Handler { kind: String, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

impl TacoreError {
    /// The `type` tag carried on the wire alongside error envelopes.
    /// Most kinds are fixed at compile time; `Handler` carries whatever kind
    /// a method handler reported (`execution`, `evaluation`, `market_closed`,
    /// `scanner_error`, `executor_error`, ...).
    pub fn kind(&self) -> Cow<'static, str> {
        match self {
            Self::InvalidJson(_) | Self::Serialization(_) => Cow::Borrowed("invalid_json"),
            Self::Validation { .. } => Cow::Borrowed("validation"),
            Self::UnsupportedMethod(_) => Cow::Borrowed("unsupported_method"),
            Self::NoWorkers => Cow::Borrowed("no_workers"),
            Self::Zmq(_) | Self::Transport(_) | Self::Timeout(_) => Cow::Borrowed("internal_error"),
            Self::Config(_) | Self::ConfigParse(_) | Self::ConfigIo(_) => Cow::Borrowed("internal_error"),
            Self::Store(_) | Self::Migration(_) => Cow::Borrowed("internal_error"),
            Self::Handler { kind, .. } => Cow::Owned(kind.clone()),
            Self::Internal(_) => Cow::Borrowed("internal_error"),
        }
    }

    /// Build an error reported by a method handler, tagged with its own
    /// wire `type` (e.g. `market_closed`, `execution`, `scanner_error`).
    pub fn handler(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Handler {
            kind: kind.into(),
            message: message.into(),
        }
    }
}
