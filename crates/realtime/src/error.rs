//! Error types for the realtime clients

use thiserror::Error;

/// Why a channel could not open a link.
#[derive(Debug, Error)]
pub enum OpenError {
    /// No usable credential. The channel stays closed and is not retried.
    #[error(transparent)]
    Credentials(#[from] CredentialError),

    /// The transport refused or timed out.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("no access token available")]
    Missing,

    #[error("access token expired and refresh produced no usable token")]
    Expired,

    #[error("token refresh failed: {0}")]
    RefreshFailed(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection timed out after {0} ms")]
    Timeout(u64),

    #[error("{0} does not support sending")]
    ReceiveOnly(&'static str),

    #[error("link closed")]
    Closed,

    #[error(transparent)]
    Protocol(#[from] wfgame_protocol::ProtocolError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid URL '{value}': {source}")]
    InvalidUrl {
        value: String,
        #[source]
        source: url::ParseError,
    },

    #[error("invalid port '{0}'")]
    InvalidPort(String),

    #[error("server URL has no host: {0}")]
    MissingHost(String),

    #[error("unsupported server URL scheme '{0}'")]
    UnsupportedScheme(String),
}

/// Top-level error for callers of this crate
#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("channel '{0}' has shut down")]
    ChannelGone(String),

    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
