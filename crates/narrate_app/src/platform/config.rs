//! RON configuration for the sync monitor.
//!
//! Read from `.narrate.ron` in the working directory unless a path is given
//! on the command line. Every field has a default, so a partial file is fine.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use log::LevelFilter;
use narrate_core::PollPolicy;
use narrate_engine::{BackendSettings, BackoffPolicy, ConnectionSettings, TransportSettings};
use serde::Deserialize;

pub(crate) const CONFIG_FILENAME: &str = ".narrate.ron";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("could not read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("could not parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        source: ron::error::SpannedError,
    },
}

/// Where log records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
pub enum LogDestination {
    /// `./narrate.log` in the working directory.
    File,
    Terminal,
    #[default]
    Both,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub backend_url: String,
    pub channels: Vec<String>,
    pub reconnect: ReconnectConfig,
    /// `0` turns the uptime refresh off.
    pub uptime_refresh_ms: u64,
    pub idle_timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub poll_interval_ms: u64,
    /// Chapters whose segment lists are kept in the cache.
    pub watch_chapters: Vec<String>,
    pub log_destination: LogDestination,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            backend_url: "http://127.0.0.1:8765".to_string(),
            channels: vec!["jobs".to_string(), "health".to_string()],
            reconnect: ReconnectConfig::default(),
            uptime_refresh_ms: 1000,
            idle_timeout_ms: 45_000,
            connect_timeout_ms: 10_000,
            request_timeout_ms: 30_000,
            poll_interval_ms: 2000,
            watch_chapters: Vec::new(),
            log_destination: LogDestination::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Loads `path`. A missing file is not an error and yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        ron::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Falls back to `info` for unrecognised level names.
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.log_level).unwrap_or(LevelFilter::Info)
    }

    pub fn connection_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            base_url: self.backend_url.clone(),
            channels: self.channels.clone(),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.reconnect.base_delay_ms),
                max_delay: Duration::from_millis(self.reconnect.max_delay_ms),
                max_attempts: self.reconnect.max_attempts,
            },
            open_timeout: Duration::from_millis(self.connect_timeout_ms),
            uptime_refresh: (self.uptime_refresh_ms > 0)
                .then(|| Duration::from_millis(self.uptime_refresh_ms)),
        }
    }

    pub fn transport_settings(&self) -> TransportSettings {
        TransportSettings {
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
        }
    }

    pub fn backend_settings(&self) -> BackendSettings {
        BackendSettings {
            base_url: self.backend_url.clone(),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..BackendSettings::default()
        }
    }

    pub fn poll_policy(&self) -> PollPolicy {
        PollPolicy::new(Duration::from_millis(self.poll_interval_ms))
    }
}

/// `argv[1]` when given, otherwise [`CONFIG_FILENAME`] in the working directory.
pub fn config_path(mut args: impl Iterator<Item = String>) -> PathBuf {
    args.nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(CONFIG_FILENAME))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let config = AppConfig::load(&dir.path().join(CONFIG_FILENAME)).expect("defaults");
        assert_eq!(config, AppConfig::default());
    }

    #[test]
    fn partial_file_keeps_remaining_defaults() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(
            &path,
            r#"(
                backend_url: "http://10.0.0.5:9000",
                reconnect: (max_attempts: 3),
                watch_chapters: ["ch-1"],
                log_destination: Terminal,
                log_level: "debug",
            )"#,
        )
        .expect("write config");

        let config = AppConfig::load(&path).expect("parsed");
        assert_eq!(config.backend_url, "http://10.0.0.5:9000");
        assert_eq!(config.reconnect.max_attempts, 3);
        assert_eq!(config.reconnect.base_delay_ms, 1000);
        assert_eq!(config.watch_chapters, vec!["ch-1".to_string()]);
        assert_eq!(config.log_destination, LogDestination::Terminal);
        assert_eq!(config.level_filter(), LevelFilter::Debug);
        assert_eq!(config.poll_interval_ms, 2000);
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let dir = TempDir::new().expect("temp dir");
        let path = dir.path().join(CONFIG_FILENAME);
        fs::write(&path, "(backend_url: 42").expect("write config");
        assert!(matches!(
            AppConfig::load(&path),
            Err(ConfigError::Parse { .. })
        ));
    }

    #[test]
    fn settings_follow_config() {
        let config = AppConfig {
            uptime_refresh_ms: 0,
            poll_interval_ms: 500,
            ..AppConfig::default()
        };
        let connection = config.connection_settings();
        assert_eq!(connection.uptime_refresh, None);
        assert_eq!(connection.backoff, BackoffPolicy::default());
        assert_eq!(connection.open_timeout, Duration::from_secs(10));
        assert_eq!(
            connection.subscribe_url().expect("url").as_str(),
            "http://127.0.0.1:8765/api/events/subscribe?channels=jobs%2Chealth"
        );
        assert_eq!(config.transport_settings().idle_timeout, Duration::from_secs(45));
        assert_eq!(config.backend_settings().list_limit, 50);
        assert_eq!(config.poll_policy().interval, Duration::from_millis(500));
        assert_eq!(config.level_filter(), LevelFilter::Info);
    }

    #[test]
    fn first_argument_overrides_config_path() {
        let args = ["narrate_app".to_string(), "/etc/narrate.ron".to_string()];
        assert_eq!(config_path(args.into_iter()), PathBuf::from("/etc/narrate.ron"));
        assert_eq!(
            config_path(std::iter::once("narrate_app".to_string())),
            PathBuf::from(CONFIG_FILENAME)
        );
    }
}
