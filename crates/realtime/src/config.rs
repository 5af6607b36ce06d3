//! Client configuration and endpoint resolution.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::connection::ReconnectPolicy;
use crate::error::ConfigError;

pub const SOCKET_HOST_ENV: &str = "WFGAME_SOCKET_HOST";
pub const SOCKET_PORT_ENV: &str = "WFGAME_SOCKET_PORT";
/// Older spellings, still honoured.
pub const LEGACY_SOCKET_HOST_ENV: &str = "WFGAME_WS_HOST";
pub const LEGACY_SOCKET_PORT_ENV: &str = "WFGAME_WS_PORT";

pub const DEFAULT_SERVER_URL: &str = "http://127.0.0.1:8000";
pub const DEFAULT_STREAM_PATH: &str = "/api/notifications/stream";
pub const DEFAULT_SOCKET_PATH: &str = "/socket.io/";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RealtimeConfig {
    /// Base URL of the console backend; stands in for the page origin.
    pub server_url: String,
    pub stream_path: String,
    pub notification_reconnect_ms: u64,
    pub socket: SocketConfig,
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            server_url: DEFAULT_SERVER_URL.to_string(),
            stream_path: DEFAULT_STREAM_PATH.to_string(),
            notification_reconnect_ms: 5000,
            socket: SocketConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub path: String,
    pub reconnect_delay_ms: u64,
    pub reconnect_attempts: u32,
    pub connect_timeout_ms: u64,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: None,
            path: DEFAULT_SOCKET_PATH.to_string(),
            reconnect_delay_ms: 1000,
            reconnect_attempts: 5,
            connect_timeout_ms: 20_000,
        }
    }
}

impl RealtimeConfig {
    pub fn server_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.server_url).map_err(|source| ConfigError::InvalidUrl {
            value: self.server_url.clone(),
            source,
        })?;
        if url.host_str().is_none() {
            return Err(ConfigError::MissingHost(self.server_url.clone()));
        }
        Ok(url)
    }

    pub fn stream_url(&self) -> Result<Url, ConfigError> {
        let base = self.server_url()?;
        base.join(&self.stream_path)
            .map_err(|source| ConfigError::InvalidUrl {
                value: self.stream_path.clone(),
                source,
            })
    }

    pub fn notification_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::unlimited(Duration::from_millis(self.notification_reconnect_ms))
    }

    pub fn room_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::bounded(
            Duration::from_millis(self.socket.reconnect_delay_ms),
            self.socket.reconnect_attempts,
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.socket.connect_timeout_ms)
    }

    /// Socket.IO endpoint, reading host/port overrides from the process environment.
    pub fn socket_endpoint(&self) -> Result<Url, ConfigError> {
        self.socket_endpoint_with(|key| std::env::var(key).ok())
    }

    /// Socket.IO endpoint with an explicit environment lookup.
    ///
    /// Host and port each resolve from the config field, then the
    /// environment (current spelling before legacy), then the server URL.
    pub fn socket_endpoint_with(
        &self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Url, ConfigError> {
        let server = self.server_url()?;
        let scheme = match server.scheme() {
            "http" | "ws" => "ws",
            "https" | "wss" => "wss",
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        };

        let env = |primary: &str, legacy: &str| {
            lookup(primary)
                .or_else(|| lookup(legacy))
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let host = match self.socket.host.clone() {
            Some(host) => host,
            None => match env(SOCKET_HOST_ENV, LEGACY_SOCKET_HOST_ENV) {
                Some(host) => host,
                None => server
                    .host_str()
                    .map(str::to_string)
                    .ok_or_else(|| ConfigError::MissingHost(self.server_url.clone()))?,
            },
        };

        let port = match self.socket.port {
            Some(port) => Some(port),
            None => match env(SOCKET_PORT_ENV, LEGACY_SOCKET_PORT_ENV) {
                Some(raw) => Some(
                    raw.parse::<u16>()
                        .map_err(|_| ConfigError::InvalidPort(raw.clone()))?,
                ),
                None => server.port(),
            },
        };

        let authority = match port {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let path = if self.socket.path.starts_with('/') {
            self.socket.path.clone()
        } else {
            format!("/{}", self.socket.path)
        };
        let raw = format!("{scheme}://{authority}{path}");
        Url::parse(&raw).map_err(|source| ConfigError::InvalidUrl { value: raw, source })
    }
}
