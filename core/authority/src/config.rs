//! Authority runtime configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const STATE_DIR_NAME: &str = ".edittrack";
pub const AUTHORITY_SOCKET_NAME: &str = "authority.sock";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AuthorityConfig {
    pub socket: Option<PathBuf>,
    pub db_path: Option<PathBuf>,
    pub resume_window_minutes: i64,
    pub sync: SyncConfig,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            socket: None,
            db_path: None,
            resume_window_minutes: 60,
            sync: SyncConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    pub interval_secs: u64,
    pub grace_secs: i64,
    pub tracker_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            grace_secs: 600,
            tracker_timeout_ms: 1000,
        }
    }
}

impl AuthorityConfig {
    pub fn socket_path(&self) -> Result<PathBuf, String> {
        match &self.socket {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join(AUTHORITY_SOCKET_NAME)),
        }
    }

    pub fn db_path_resolved(&self) -> Result<PathBuf, String> {
        match &self.db_path {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join("authority").join("sessions.db")),
        }
    }
}

pub fn state_dir() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(STATE_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf, String> {
    Ok(state_dir()?.join("authority.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<AuthorityConfig, String> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(AuthorityConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| {
        format!(
            "Failed to read authority config {}: {}",
            config_path.display(),
            err
        )
    })?;
    toml::from_str::<AuthorityConfig>(&content).map_err(|err| {
        format!(
            "Failed to parse authority config {}: {}",
            config_path.display(),
            err
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let config = load_config(Some(&dir.path().join("absent.toml"))).expect("load");
        assert_eq!(config.resume_window_minutes, 60);
        assert_eq!(config.sync.grace_secs, 600);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("authority.toml");
        std::fs::write(&path, "[sync]\ngrace_secs = 120").expect("write");
        let config = load_config(Some(&path)).expect("load");
        assert_eq!(config.sync.grace_secs, 120);
        assert_eq!(config.sync.interval_secs, 60);
        assert_eq!(config.resume_window_minutes, 60);
    }
}
