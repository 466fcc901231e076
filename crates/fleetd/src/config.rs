//! Agent configuration.
//!
//! The configuration file is TOML and every field is optional; a missing file
//! yields the defaults. The file-level [`Config`] is converted once at startup
//! into the runtime structs ([`SupervisorConfig`], [`ExecutorConfig`],
//! [`DeviceProfile`]) that are handed to the agent by value. There is no
//! global configuration state.
//!
//! ```toml
//! client_version = "0.3.0"
//!
//! [server]
//! ws_url = "wss://fleet.example.com/ws/device"
//! heartbeat_interval_secs = 30
//!
//! [device]
//! name = "lab-pc-04"
//!
//! [executor]
//! job_timeout_secs = 7200
//!
//! [engine]
//! command = "/opt/engine/run-task"
//! controllers = ["Win32"]
//! resources = ["Official"]
//!
//! [[engine.tasks]]
//! name = "Daily"
//! label = "Daily routine"
//!
//! [logging]
//! level = "debug"
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use fleet_core::TaskInfo;
use serde::Deserialize;
use sysinfo::System;

use crate::error::ConfigError;

/// Default server endpoint.
pub const DEFAULT_WS_URL: &str = "ws://localhost:15618/ws/device";

/// Device name used when neither the config nor the OS provides one.
pub const FALLBACK_DEVICE_NAME: &str = "fleet-device";

// ============================================================================
// File Configuration
// ============================================================================

/// Contents of `fleet.toml`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Version string reported in `auth`/`register`.
    pub client_version: String,
    pub server: ServerSettings,
    pub device: DeviceSettings,
    pub executor: ExecutorSettings,
    pub engine: EngineSettings,
    pub logging: LoggingSettings,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            server: ServerSettings::default(),
            device: DeviceSettings::default(),
            executor: ExecutorSettings::default(),
            engine: EngineSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

/// `[server]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    pub ws_url: String,
    pub connect_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub reconnect_max_delay_secs: u64,
    pub outbound_queue_capacity: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            ws_url: DEFAULT_WS_URL.to_string(),
            connect_timeout_secs: 10,
            heartbeat_interval_secs: 30,
            reconnect_max_delay_secs: 30,
            outbound_queue_capacity: 256,
        }
    }
}

/// `[device]` section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Display name; empty means the host name.
    pub name: String,
    /// Credential file; `None` means `<data_dir>/fleet/device.json`.
    pub credentials_path: Option<PathBuf>,
}

/// `[executor]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ExecutorSettings {
    pub status_capacity: usize,
    pub log_capacity: usize,
    /// Watchdog for a single job; absent disables it.
    pub job_timeout_secs: Option<u64>,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            status_capacity: 100,
            log_capacity: 1000,
            job_timeout_secs: None,
        }
    }
}

/// `[engine]` section: the process-backed automation engine.
///
/// Without `command` the device runs with no engine: jobs are rejected and
/// no capabilities are reported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Program launched once per task.
    pub command: Option<String>,
    /// Arguments placed before the task name.
    pub args: Vec<String>,
    /// Working directory for launched programs.
    pub working_dir: Option<PathBuf>,
    /// Reported engine version; empty reports `unknown`.
    pub version: String,
    /// Reported install location.
    pub install_path: String,
    pub controllers: Vec<String>,
    pub resources: Vec<String>,
    pub tasks: Vec<TaskInfo>,
    /// Program that writes a PNG screenshot to stdout.
    pub screenshot_command: Option<String>,
    pub screenshot_args: Vec<String>,
    /// Program that lists windows as `class<TAB>title` lines.
    pub window_list_command: Option<String>,
    /// Window class pattern (regex, substring on invalid regex).
    pub window_class: String,
    /// Window title pattern (regex, substring on invalid regex).
    pub window_title: String,
}

impl EngineSettings {
    pub fn is_configured(&self) -> bool {
        self.command.as_deref().is_some_and(|c| !c.trim().is_empty())
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, e.g. `info` or `fleetd=debug`.
    pub level: String,
    /// Log file; `None` logs to stderr.
    pub file: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Default config file location: `<config_dir>/fleet/fleet.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("fleet")
            .join("fleet.toml")
    }

    /// Loads and validates the config at `path`. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let config: Config = toml::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Checks values that parse but cannot work.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = self.server.ws_url.as_str();
        if !(url.starts_with("ws://") || url.starts_with("wss://")) {
            return Err(invalid("server.ws_url", "must start with ws:// or wss://"));
        }
        if self.server.heartbeat_interval_secs == 0 {
            return Err(invalid("server.heartbeat_interval_secs", "must be greater than 0"));
        }
        if self.server.reconnect_max_delay_secs == 0 {
            return Err(invalid("server.reconnect_max_delay_secs", "must be greater than 0"));
        }
        if self.server.connect_timeout_secs == 0 {
            return Err(invalid("server.connect_timeout_secs", "must be greater than 0"));
        }
        if self.server.outbound_queue_capacity == 0 {
            return Err(invalid("server.outbound_queue_capacity", "must be greater than 0"));
        }
        if self.executor.status_capacity == 0 || self.executor.log_capacity == 0 {
            return Err(invalid("executor", "channel capacities must be greater than 0"));
        }
        if self.executor.job_timeout_secs == Some(0) {
            return Err(invalid("executor.job_timeout_secs", "must be greater than 0"));
        }
        Ok(())
    }

    /// Credential file location, defaulting to `<data_dir>/fleet/device.json`.
    pub fn credentials_path(&self) -> PathBuf {
        self.device.credentials_path.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("fleet")
                .join("device.json")
        })
    }

    /// Device name, falling back to the host name.
    pub fn device_name(&self) -> String {
        let name = self.device.name.trim();
        if !name.is_empty() {
            return name.to_string();
        }
        System::host_name()
            .filter(|h| !h.trim().is_empty())
            .unwrap_or_else(|| FALLBACK_DEVICE_NAME.to_string())
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.server.connect_timeout_secs)
    }

    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            heartbeat_interval: Duration::from_secs(self.server.heartbeat_interval_secs),
            reconnect_max_delay: Duration::from_secs(self.server.reconnect_max_delay_secs),
            outbound_queue_capacity: self.server.outbound_queue_capacity,
            ..SupervisorConfig::default()
        }
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            status_capacity: self.executor.status_capacity,
            log_capacity: self.executor.log_capacity,
            job_timeout: self.executor.job_timeout_secs.map(Duration::from_secs),
        }
    }

    pub fn device_profile(&self) -> DeviceProfile {
        DeviceProfile {
            name: self.device_name(),
            client_version: self.client_version.clone(),
            install_path: self.engine.install_path.clone(),
            os_info: os_info(),
        }
    }

    /// Builds the full runtime configuration.
    pub fn agent_config(&self) -> AgentConfig {
        AgentConfig {
            supervisor: self.supervisor_config(),
            executor: self.executor_config(),
            device: self.device_profile(),
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

/// `os arch (long version)`, e.g. `linux x86_64 (Linux 22.04 Ubuntu)`.
pub fn os_info() -> String {
    let base = format!("{} {}", std::env::consts::OS, std::env::consts::ARCH);
    match System::long_os_version() {
        Some(version) if !version.trim().is_empty() => format!("{base} ({version})"),
        _ => base,
    }
}

// ============================================================================
// Runtime Configuration
// ============================================================================

/// Timings for the reconnection supervisor and session loops.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Interval between `ping` frames while connected.
    pub heartbeat_interval: Duration,

    /// Delay after the first failure; doubled for each further attempt.
    pub retry_base_delay: Duration,

    /// Upper bound for the reconnect delay.
    pub reconnect_max_delay: Duration,

    /// Capacity of the outbound frame queue.
    pub outbound_queue_capacity: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            retry_base_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            outbound_queue_capacity: 256,
        }
    }
}

/// Limits for the job executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub status_capacity: usize,
    pub log_capacity: usize,
    pub job_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            status_capacity: 100,
            log_capacity: 1000,
            job_timeout: None,
        }
    }
}

/// Static facts about this device sent with `register` and `auth`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceProfile {
    pub name: String,
    pub client_version: String,
    pub install_path: String,
    pub os_info: String,
}

/// Everything the agent needs besides its collaborators.
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    pub supervisor: SupervisorConfig,
    pub executor: ExecutorConfig,
    pub device: DeviceProfile,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.server.ws_url, DEFAULT_WS_URL);
        assert_eq!(config.executor.log_capacity, 1000);
        assert!(config.executor.job_timeout_secs.is_none());
        assert!(!config.engine.is_configured());
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        let mut file = fs::File::create(&path).unwrap();
        writeln!(
            file,
            r#"
[server]
ws_url = "wss://fleet.example.com/ws/device"

[executor]
job_timeout_secs = 60

[engine]
command = "/opt/engine/run"
controllers = ["Win32"]

[[engine.tasks]]
name = "Daily"
label = "Daily routine"

[[engine.tasks.options]]
name = "stage"
type = "select"
label = "Stage"
"#
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.server.ws_url, "wss://fleet.example.com/ws/device");
        assert_eq!(config.server.heartbeat_interval_secs, 30);
        assert_eq!(
            config.executor_config().job_timeout,
            Some(Duration::from_secs(60))
        );
        assert!(config.engine.is_configured());
        assert_eq!(config.engine.tasks.len(), 1);
        assert_eq!(config.engine.tasks[0].options[0].option_type, "select");
    }

    #[test]
    fn test_invalid_url_rejected() {
        let config = Config {
            server: ServerSettings {
                ws_url: "http://example.com".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "server.ws_url"
        ));
    }

    #[test]
    fn test_zero_reconnect_delay_rejected() {
        let config = Config {
            server: ServerSettings {
                reconnect_max_delay_secs: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field, .. }) if field == "server.reconnect_max_delay_secs"
        ));
    }

    #[test]
    fn test_malformed_toml_is_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fleet.toml");
        fs::write(&path, "[server\nws_url = 3").unwrap();
        assert!(matches!(Config::load(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_runtime_conversion() {
        let config = Config::default();
        let supervisor = config.supervisor_config();
        assert_eq!(supervisor.heartbeat_interval, Duration::from_secs(30));
        assert_eq!(supervisor.reconnect_max_delay, Duration::from_secs(30));
        assert_eq!(supervisor.retry_base_delay, Duration::from_secs(1));
        assert_eq!(supervisor.outbound_queue_capacity, 256);
    }

    #[test]
    fn test_device_name_prefers_config() {
        let config = Config {
            device: DeviceSettings {
                name: "lab-pc-04".to_string(),
                credentials_path: None,
            },
            ..Default::default()
        };
        assert_eq!(config.device_name(), "lab-pc-04");
        assert!(!Config::default().device_name().is_empty());
    }
}
