use std::{env, fmt, fs, io, path};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to read config file {path}: {source}")]
    ReadFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to write config file {path}: {source}")]
    WriteFailed { path: path::PathBuf, source: io::Error },
    #[error("failed to parse config: {0}")]
    ParseFailed(#[from] toml::de::Error),
    #[error("failed to serialize config: {0}")]
    SerializeFailed(#[from] toml::ser::Error),
    #[error("no config directory available (set XDG_CONFIG_HOME or HOME)")]
    ConfigPathUnavailable,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub database: DatabaseSettings,
    pub monitoring: MonitorSettings,
    pub defaults: DeviceDefaults,
    pub retention: RetentionSettings,
    pub logging: LogSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseSettings {
    pub path: String,
    pub pool_size: usize,
}

/// Thresholds and timer periods of the monitoring engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorSettings {
    /// Trailing-window loss below which a degraded device is considered recovered.
    pub degraded_loss_pct: f64,
    pub degraded_window_seconds: u64,
    /// Continuous failure time after which a device is declared offline.
    pub offline_loss_seconds: u64,
    /// Consecutive successes required to leave `offline`.
    pub recovery_count: u32,
    pub batch_write_interval: f64,
    pub watchdog_interval_seconds: u64,
    pub probe_timeout_seconds: u64,
    /// How long a cancelled loop may take to wind down before it is aborted.
    pub stop_grace_seconds: u64,
}

/// Values applied to newly created devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceDefaults {
    pub interval_seconds: f64,
    pub packet_size: u16,
    pub retention_days: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionSettings {
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        Self { path: "badping.db".into(), pool_size: 16 }
    }
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            degraded_loss_pct: 5.0,
            degraded_window_seconds: 300,
            offline_loss_seconds: 30,
            recovery_count: 3,
            batch_write_interval: 1.0,
            watchdog_interval_seconds: 30,
            probe_timeout_seconds: 2,
            stop_grace_seconds: 5,
        }
    }
}

impl Default for DeviceDefaults {
    fn default() -> Self {
        Self { interval_seconds: 1.0, packet_size: 64, retention_days: 14 }
    }
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self { cleanup_interval_seconds: 3600 }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self { level: "info".into() }
    }
}

/// Used to ensure we are actually reading a toml file
fn normalize_toml_path(path: &path::Path) -> path::PathBuf {
    let mut path = path.to_path_buf();
    if path.extension().map(|ext| ext != "toml").unwrap_or(true) {
        path.set_extension("toml");
    }
    path
}

/// Get default config path ($XDG_CONFIG_HOME/badping/config.toml or
/// $HOME/.config/...)
fn default_config_path() -> Result<path::PathBuf, Error> {
    let path = if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
        path::PathBuf::from(config_home)
    } else if let Some(home_dir) = env::home_dir() {
        home_dir.join(".config")
    } else {
        return Err(Error::ConfigPathUnavailable);
    };

    Ok(path.join("badping/config.toml"))
}

/// Overwrite `target` with the parsed value of `name`, if set and valid.
fn override_from_env<T: std::str::FromStr>(name: &str, target: &mut T) {
    if let Some(value) = env::var(name).ok().and_then(|val| val.parse().ok()) {
        *target = value;
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let write_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str, value: &dyn fmt::Display| {
                writeln!(f, "  {:indent$}{}: {}", "", label, value, indent = level * 2)
            }
        };
        let write_title_indented = |level: usize| {
            move |f: &mut fmt::Formatter<'_>, label: &str| {
                writeln!(f, "{:indent$}{}", "", label, indent = level * 2)
            }
        };

        let write_title_1 = write_title_indented(1);
        let write_1 = write_indented(1);

        writeln!(f, "Current Internal Configuration State:")?;
        write_title_1(f, "Database")?;
        write_1(f, "Path", &self.database.path)?;
        write_1(f, "Pool Size", &self.database.pool_size)?;

        write_title_1(f, "Monitoring")?;
        write_1(f, "Degraded Loss %", &self.monitoring.degraded_loss_pct)?;
        write_1(f, "Degraded Window (s)", &self.monitoring.degraded_window_seconds)?;
        write_1(f, "Offline After (s)", &self.monitoring.offline_loss_seconds)?;
        write_1(f, "Recovery Count", &self.monitoring.recovery_count)?;
        write_1(f, "Batch Write Interval (s)", &self.monitoring.batch_write_interval)?;
        write_1(f, "Watchdog Interval (s)", &self.monitoring.watchdog_interval_seconds)?;
        write_1(f, "Probe Timeout (s)", &self.monitoring.probe_timeout_seconds)?;
        write_1(f, "Stop Grace (s)", &self.monitoring.stop_grace_seconds)?;

        write_title_1(f, "Device Defaults")?;
        write_1(f, "Interval (s)", &self.defaults.interval_seconds)?;
        write_1(f, "Packet Size", &self.defaults.packet_size)?;
        write_1(f, "Retention (days)", &self.defaults.retention_days)?;

        write_title_1(f, "Retention")?;
        write_1(f, "Cleanup Interval (s)", &self.retention.cleanup_interval_seconds)?;

        write_title_1(f, "Logging")?;
        write_1(f, "Level", &self.logging.level)?;

        Ok(())
    }
}

impl Config {
    /// Generate Config structure from file
    ///
    /// Creates a default config in ~/.config/badping/config.toml
    ///  or the specified path, with the name config.toml if one does not exist.
    /// `BADPING_*` environment variables are applied on top.
    pub fn from_config(optional_path: Option<impl AsRef<path::Path>>) -> Result<Self, Error> {
        let config_path: path::PathBuf = if let Some(path) = optional_path {
            normalize_toml_path(path.as_ref())
        } else {
            default_config_path()?
        };

        let mut config = if config_path.exists() {
            let raw_string = fs::read_to_string(&config_path)
                .map_err(|source| Error::ReadFailed { path: config_path.clone(), source })?;
            toml::from_str(raw_string.as_str())?
        } else {
            let config = Self::default();
            config.write_config(&config_path)?;
            config
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Serialize and write a config to a file
    pub fn write_config(&self, path: &path::Path) -> Result<(), Error> {
        let config_str: String = toml::to_string_pretty(self)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })?;
        }

        fs::write(path, config_str)
            .map_err(|source| Error::WriteFailed { path: path.to_path_buf(), source })
    }

    /// Apply `BADPING_*` overrides, e.g. `BADPING_OFFLINE_LOSS_SECONDS=60`.
    pub fn apply_env_overrides(&mut self) {
        override_from_env("BADPING_DB_PATH", &mut self.database.path);
        override_from_env("BADPING_DB_POOL_SIZE", &mut self.database.pool_size);

        let monitoring = &mut self.monitoring;
        override_from_env("BADPING_DEGRADED_LOSS_PCT", &mut monitoring.degraded_loss_pct);
        override_from_env("BADPING_DEGRADED_WINDOW_SECONDS", &mut monitoring.degraded_window_seconds);
        override_from_env("BADPING_OFFLINE_LOSS_SECONDS", &mut monitoring.offline_loss_seconds);
        override_from_env("BADPING_RECOVERY_COUNT", &mut monitoring.recovery_count);
        override_from_env("BADPING_BATCH_WRITE_INTERVAL", &mut monitoring.batch_write_interval);
        override_from_env("BADPING_WATCHDOG_INTERVAL", &mut monitoring.watchdog_interval_seconds);
        override_from_env("BADPING_PROBE_TIMEOUT", &mut monitoring.probe_timeout_seconds);
        override_from_env("BADPING_STOP_GRACE_SECONDS", &mut monitoring.stop_grace_seconds);

        override_from_env("BADPING_DEFAULT_INTERVAL", &mut self.defaults.interval_seconds);
        override_from_env("BADPING_DEFAULT_PACKET_SIZE", &mut self.defaults.packet_size);
        override_from_env("BADPING_DEFAULT_RETENTION_DAYS", &mut self.defaults.retention_days);

        override_from_env("BADPING_CLEANUP_INTERVAL", &mut self.retention.cleanup_interval_seconds);
        override_from_env("BADPING_LOG_LEVEL", &mut self.logging.level);
    }
}
