//! `<data-dir>/config.toml`, layered under environment and flags.

use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use wfgame_realtime::config::{
    LEGACY_SOCKET_HOST_ENV, LEGACY_SOCKET_PORT_ENV, SOCKET_HOST_ENV, SOCKET_PORT_ENV,
};
use wfgame_realtime::RealtimeConfig;

pub const SERVER_URL_ENV: &str = "WFGAME_SERVER_URL";
pub const TOKEN_ENV: &str = "WFGAME_TOKEN";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// Access token for the notification stream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(flatten)]
    pub realtime: RealtimeConfig,
}

/// Values given on the command line.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    pub server_url: Option<String>,
    pub token: Option<String>,
    pub socket_host: Option<String>,
    pub socket_port: Option<u16>,
}

impl CliConfig {
    /// Read `path`; a missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }

    /// Apply environment variables through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(url) = get(SERVER_URL_ENV) {
            self.realtime.server_url = url;
        }
        if let Some(token) = get(TOKEN_ENV) {
            self.token = Some(token);
        }
        if let Some(host) = get(SOCKET_HOST_ENV).or_else(|| get(LEGACY_SOCKET_HOST_ENV)) {
            self.realtime.socket.host = Some(host);
        }
        if let Some(port) = get(SOCKET_PORT_ENV).or_else(|| get(LEGACY_SOCKET_PORT_ENV)) {
            let port = port
                .trim()
                .parse::<u16>()
                .with_context(|| format!("Invalid socket port '{port}'"))?;
            self.realtime.socket.port = Some(port);
        }
        Ok(())
    }

    pub fn apply_overrides(&mut self, overrides: &Overrides) {
        if let Some(url) = &overrides.server_url {
            self.realtime.server_url = url.clone();
        }
        if let Some(token) = &overrides.token {
            self.token = Some(token.clone());
        }
        if let Some(host) = &overrides.socket_host {
            self.realtime.socket.host = Some(host.clone());
        }
        if let Some(port) = overrides.socket_port {
            self.realtime.socket.port = Some(port);
        }
    }

    /// File, then environment, then flags.
    pub fn resolve(path: &Path, overrides: &Overrides) -> anyhow::Result<Self> {
        let mut config = Self::load(path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        config.apply_overrides(overrides);
        Ok(config)
    }
}
