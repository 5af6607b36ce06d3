//! Path resolution for CLI data files.
//!
//! Resolved once at startup from: `--data-dir` > `WFGAME_DATA_DIR` env > `~/.wfgame`.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use anyhow::Context;

pub const DATA_DIR_ENV: &str = "WFGAME_DATA_DIR";

static DATA_DIR: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Resolve the data directory without touching global state.
pub fn resolve_data_dir(
    explicit: Option<&Path>,
    env_value: Option<String>,
) -> anyhow::Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(value) = env_value.filter(|v| !v.trim().is_empty()) {
        return Ok(PathBuf::from(value));
    }
    let home = dirs::home_dir().context("HOME directory not found; pass --data-dir")?;
    Ok(home.join(".wfgame"))
}

/// Initialize the global data directory. Returns the resolved path.
pub fn init_data_dir(explicit: Option<&Path>) -> anyhow::Result<PathBuf> {
    let dir = resolve_data_dir(explicit, std::env::var(DATA_DIR_ENV).ok())?;
    *DATA_DIR.write().unwrap_or_else(PoisonError::into_inner) = Some(dir.clone());
    Ok(dir)
}

/// The data directory set by `init_data_dir`, or the default location.
pub fn data_dir() -> PathBuf {
    let current = DATA_DIR
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone();
    current.unwrap_or_else(|| {
        dirs::home_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(".wfgame")
    })
}

pub fn config_path() -> PathBuf {
    data_dir().join("config.toml")
}

pub fn log_dir() -> PathBuf {
    data_dir().join("logs")
}

pub fn log_path() -> PathBuf {
    log_dir().join("cli.log")
}

pub fn ensure_dirs() -> io::Result<()> {
    let base = data_dir();
    std::fs::create_dir_all(&base)?;
    std::fs::create_dir_all(base.join("logs"))?;
    Ok(())
}
