//! Tracker runtime configuration.
//!
//! Loaded from TOML; a missing file means safe defaults. Every threshold the
//! reconciliation engine depends on is tunable here rather than hard-coded.

use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TrackerError};

pub const STATE_DIR_NAME: &str = ".edittrack";
pub const TRACKER_SOCKET_NAME: &str = "tracker.sock";
pub const AUTHORITY_SOCKET_NAME: &str = "authority.sock";
pub const QUEUE_FILE_NAME: &str = "event-queue.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrackerConfig {
    pub tracker_id: String,
    pub command_socket: Option<PathBuf>,
    pub sessions: SessionConfig,
    pub classify: ClassifyConfig,
    pub hashing: HashConfig,
    pub delivery: DeliveryConfig,
    pub sweep: SweepConfig,
    pub editors: EditorConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            tracker_id: "tracker-local".to_string(),
            command_socket: None,
            sessions: SessionConfig::default(),
            classify: ClassifyConfig::default(),
            hashing: HashConfig::default(),
            delivery: DeliveryConfig::default(),
            sweep: SweepConfig::default(),
            editors: EditorConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    pub timeout_minutes: i64,
    pub max_session_hours: i64,
    pub resume_window_minutes: i64,
    pub closed_history_limit: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_minutes: 30,
            max_session_hours: 3,
            resume_window_minutes: 60,
            closed_history_limit: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ClassifyConfig {
    pub ignore_patterns: Vec<String>,
    pub ignore_extensions: Vec<String>,
    pub ignore_dirs: Vec<String>,
    pub min_file_bytes: u64,
}

impl Default for ClassifyConfig {
    fn default() -> Self {
        Self {
            ignore_patterns: Vec::new(),
            ignore_extensions: Vec::new(),
            ignore_dirs: Vec::new(),
            min_file_bytes: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HashConfig {
    pub enabled: bool,
    pub max_file_size_mb: u64,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
}

impl Default for HashConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_file_size_mb: 50,
            retry_attempts: 3,
            retry_delay_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeliveryConfig {
    pub authority_socket: Option<PathBuf>,
    pub queue_path: Option<PathBuf>,
    pub send_timeout_ms: u64,
    pub max_backoff_secs: u64,
    pub shutdown_drain_secs: u64,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            authority_socket: None,
            queue_path: None,
            send_timeout_ms: 600,
            max_backoff_secs: 60,
            shutdown_drain_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SweepConfig {
    pub interval_secs: u64,
    pub idle_max_interval_secs: u64,
    pub close_debounce_secs: i64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            idle_max_interval_secs: 60,
            close_debounce_secs: 5,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EditorConfig {
    pub primary_grace_secs: i64,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            primary_grace_secs: 300,
        }
    }
}

impl TrackerConfig {
    pub fn command_socket_path(&self) -> Result<PathBuf> {
        match &self.command_socket {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join(TRACKER_SOCKET_NAME)),
        }
    }

    pub fn authority_socket_path(&self) -> Result<PathBuf> {
        match &self.delivery.authority_socket {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join(AUTHORITY_SOCKET_NAME)),
        }
    }

    pub fn queue_path(&self) -> Result<PathBuf> {
        match &self.delivery.queue_path {
            Some(path) => Ok(path.clone()),
            None => Ok(state_dir()?.join("tracker").join(QUEUE_FILE_NAME)),
        }
    }
}

pub fn state_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().ok_or(TrackerError::HomeDirNotFound)?;
    Ok(home.join(STATE_DIR_NAME))
}

pub fn default_config_path() -> Result<PathBuf> {
    Ok(state_dir()?.join("tracker.toml"))
}

pub fn load_config(path: Option<&Path>) -> Result<TrackerConfig> {
    let config_path = match path {
        Some(path) => path.to_path_buf(),
        None => default_config_path()?,
    };

    if !config_path.exists() {
        return Ok(TrackerConfig::default());
    }

    let content = fs_err::read_to_string(&config_path).map_err(|err| TrackerError::Io {
        context: format!("Failed to read tracker config {}", config_path.display()),
        source: err,
    })?;
    toml::from_str::<TrackerConfig>(&content).map_err(|err| TrackerError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
