use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

pub const DEFAULT_MAX_NAME_ATTEMPTS: u32 = 10;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;

// The child runs with tracing enabled in debug builds and is much slower to exit.
#[cfg(debug_assertions)]
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;
#[cfg(not(debug_assertions))]
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2_000;

#[cfg(windows)]
const DEFAULT_CONSOLE_SWITCH: &str = "/console";
#[cfg(windows)]
const DEFAULT_INSTANCE_SWITCH: &str = "/consoleinstance";
#[cfg(not(windows))]
const DEFAULT_CONSOLE_SWITCH: &str = "--console";
#[cfg(not(windows))]
const DEFAULT_INSTANCE_SWITCH: &str = "--console-instance";

/// Name prefixes of the named objects making up a channel.
/// The child derives the same names from the instance name it is given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelPrefixes {
    pub mapping: String,
    pub request: String,
    pub response: String,
    pub cancel: String,
    pub job: String,
}

impl Default for ChannelPrefixes {
    fn default() -> Self {
        Self {
            mapping: "ConsoleBridgeMapping".to_string(),
            request: "ConsoleBridgeEventRequest".to_string(),
            response: "ConsoleBridgeEventResponse".to_string(),
            cancel: "ConsoleBridgeEventCancel".to_string(),
            job: "ConsoleBridgeJob".to_string(),
        }
    }
}

/// Account the child process runs as.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAsUser {
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl fmt::Debug for RunAsUser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunAsUser")
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub prefixes: ChannelPrefixes,
    pub max_name_attempts: u32,
    /// Echoed to the child in the Init reply.
    pub wants_progress: bool,
    /// Place the child in a job object / process group torn down with the session.
    pub guard_with_job: bool,
    /// After disposal, re-create each named object to confirm it was released.
    pub verify_handles_closed: bool,
    pub run_as: Option<RunAsUser>,
    pub shutdown_timeout_ms: Option<u64>,
    pub poll_interval_ms: u64,
    pub console_switch: String,
    pub instance_switch: String,
    /// Defaults to the executable's directory.
    pub working_directory: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            prefixes: ChannelPrefixes::default(),
            max_name_attempts: DEFAULT_MAX_NAME_ATTEMPTS,
            wants_progress: false,
            guard_with_job: false,
            verify_handles_closed: false,
            run_as: None,
            shutdown_timeout_ms: None,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            console_switch: DEFAULT_CONSOLE_SWITCH.to_string(),
            instance_switch: DEFAULT_INSTANCE_SWITCH.to_string(),
            working_directory: None,
        }
    }
}

impl SessionConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        info!("[CONFIG] Loaded session configuration from {:?}", path);
        Ok(config)
    }

    /// Load `session.json` from the user config directory, or defaults when absent.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = get_config_directory()?.join("session.json");
        if path.exists() {
            Self::from_json_file(&path)
        } else {
            debug!("[CONFIG] {:?} not found, using defaults", path);
            Ok(Self::default())
        }
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(
            self.shutdown_timeout_ms
                .unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_MS),
        )
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_name_attempts(&self) -> u32 {
        self.max_name_attempts.max(1)
    }
}

fn get_config_directory() -> Result<PathBuf, ConfigError> {
    dirs::config_dir()
        .map(|dir| dir.join("ConsoleBridge"))
        .ok_or(ConfigError::ConfigDirError)
}
