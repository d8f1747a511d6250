//! `busd.toml` loading. A bad or missing file never stops the broker: it
//! logs a warning and the defaults apply.

use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, warn};

use crate::coordinator::CoordinatorSettings;
use crate::health::HealthThresholds;
use crate::protocol::DEFAULT_MAX_RECORD_BYTES;
use crate::tracker::{CommandTracker, MemoryTracker, TaskTracker};

pub const CONFIG_ENV: &str = "BUSD_CONFIG";
pub const SOCKET_ENV: &str = "BUSD_SOCKET";
pub const TRACKER_ENV: &str = "BUSD_TRACKER";
pub const DEFAULT_CONFIG_FILE: &str = "busd.toml";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub broker: BrokerSection,
    pub poll: PollSection,
    pub health: HealthSection,
    pub tracker: TrackerSection,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerSection {
    pub socket: Option<PathBuf>,
    pub max_record_bytes: usize,
    pub drain_timeout_ms: u64,
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            socket: None,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            drain_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PollSection {
    pub default_timeout_ms: u64,
    pub max_timeout_ms: u64,
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            default_timeout_ms: 30_000,
            max_timeout_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HealthSection {
    pub interval_secs: u64,
    pub stale_after_secs: u64,
    pub stuck_after_secs: u64,
    pub pending_ack_secs: u64,
}

impl Default for HealthSection {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            stale_after_secs: 90,
            stuck_after_secs: 300,
            pending_ack_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackerMode {
    /// Shell out to the tracker CLI.
    Command,
    /// Permissive in-process tracker; every id is an open task.
    Memory,
}

impl FromStr for TrackerMode {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "command" => Ok(TrackerMode::Command),
            "memory" => Ok(TrackerMode::Memory),
            other => Err(format!("unknown tracker mode '{other}' (expected command or memory)")),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerSection {
    pub mode: TrackerMode,
    pub command: String,
    pub timeout_ms: u64,
}

impl Default for TrackerSection {
    fn default() -> Self {
        Self {
            mode: TrackerMode::Command,
            command: "bd".to_string(),
            timeout_ms: 10_000,
        }
    }
}

impl BrokerConfig {
    /// `--config`, then `BUSD_CONFIG`, then `./busd.toml` if present.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        explicit
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from))
            .or_else(|| {
                let candidate = std::env::current_dir().ok()?.join(DEFAULT_CONFIG_FILE);
                if candidate.is_file() {
                    Some(candidate)
                } else {
                    None
                }
            })
    }

    pub fn load(path: Option<&Path>) -> Self {
        let Some(path) = path else {
            return Self::default();
        };

        let contents = match fs::read_to_string(path) {
            Ok(value) => value,
            Err(err) => {
                warn!("Failed to read config file {}: {}", path.display(), err);
                return Self::default();
            }
        };

        match Self::from_toml(&contents) {
            Ok(config) => {
                debug!("Loaded configuration from {}", path.display());
                config
            }
            Err(err) => {
                warn!("Failed to parse {}: {}", path.display(), err);
                Self::default()
            }
        }
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        let mut config: BrokerConfig = toml::from_str(contents)?;
        config.sanitize();
        Ok(config)
    }

    /// Zero values would wedge the broker; fall back to defaults instead.
    fn sanitize(&mut self) {
        let defaults = BrokerConfig::default();
        if self.broker.max_record_bytes == 0 {
            warn!("broker.max_record_bytes must be positive; using default");
            self.broker.max_record_bytes = defaults.broker.max_record_bytes;
        } else if self.broker.max_record_bytes > DEFAULT_MAX_RECORD_BYTES {
            warn!(
                requested = self.broker.max_record_bytes,
                "broker.max_record_bytes capped at {} bytes", DEFAULT_MAX_RECORD_BYTES
            );
            self.broker.max_record_bytes = DEFAULT_MAX_RECORD_BYTES;
        }
        if self.health.interval_secs == 0 {
            warn!("health.interval_secs must be positive; using default");
            self.health.interval_secs = defaults.health.interval_secs;
        }
        if self.poll.max_timeout_ms == 0 {
            warn!("poll.max_timeout_ms must be positive; using default");
            self.poll.max_timeout_ms = defaults.poll.max_timeout_ms;
        }
        if self.tracker.command.trim().is_empty() {
            self.tracker.command = defaults.tracker.command;
        }
    }

    /// `BUSD_SOCKET` replaces the socket path. `BUSD_TRACKER=memory` selects
    /// the in-process tracker; any other value names the tracker command.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(socket) = lookup(SOCKET_ENV).filter(|s| !s.trim().is_empty()) {
            self.broker.socket = Some(PathBuf::from(socket.trim()));
        }
        if let Some(raw) = lookup(TRACKER_ENV).filter(|s| !s.trim().is_empty()) {
            match raw.parse::<TrackerMode>() {
                Ok(mode) => self.tracker.mode = mode,
                Err(_) => {
                    self.tracker.mode = TrackerMode::Command;
                    self.tracker.command = raw.trim().to_string();
                }
            }
        }
    }

    pub fn coordinator_settings(&self) -> CoordinatorSettings {
        CoordinatorSettings {
            default_poll_timeout: Duration::from_millis(self.poll.default_timeout_ms),
            max_poll_timeout: Duration::from_millis(self.poll.max_timeout_ms),
            health: HealthThresholds {
                stale_after: Duration::from_secs(self.health.stale_after_secs),
                stuck_after: Duration::from_secs(self.health.stuck_after_secs),
                pending_ack: Duration::from_secs(self.health.pending_ack_secs),
            },
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health.interval_secs)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.drain_timeout_ms)
    }

    pub fn build_tracker(&self) -> Arc<dyn TaskTracker> {
        match self.tracker.mode {
            TrackerMode::Command => Arc::new(CommandTracker::new(
                self.tracker.command.clone(),
                Duration::from_millis(self.tracker.timeout_ms),
            )),
            TrackerMode::Memory => Arc::new(MemoryTracker::permissive()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = BrokerConfig::from_toml(
            r#"
[poll]
default_timeout_ms = 1500

[tracker]
mode = "memory"
"#,
        )
        .unwrap();
        assert_eq!(config.poll.default_timeout_ms, 1500);
        assert_eq!(config.poll.max_timeout_ms, 600_000);
        assert_eq!(config.tracker.mode, TrackerMode::Memory);
        assert_eq!(config.tracker.command, "bd");
        assert_eq!(config.health.pending_ack_secs, 30);
        assert_eq!(config.broker.max_record_bytes, DEFAULT_MAX_RECORD_BYTES);
    }

    #[test]
    fn zero_values_are_replaced() {
        let config = BrokerConfig::from_toml("[health]\ninterval_secs = 0\n").unwrap();
        assert_eq!(config.health.interval_secs, 60);
    }

    #[test]
    fn record_limit_is_capped_at_one_mebibyte() {
        let config = BrokerConfig::from_toml("[broker]\nmax_record_bytes = 8388608\n").unwrap();
        assert_eq!(config.broker.max_record_bytes, DEFAULT_MAX_RECORD_BYTES);

        let config = BrokerConfig::from_toml("[broker]\nmax_record_bytes = 4096\n").unwrap();
        assert_eq!(config.broker.max_record_bytes, 4096);
    }

    #[test]
    fn unreadable_or_invalid_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("missing.toml");
        assert_eq!(BrokerConfig::load(Some(&missing)).poll.default_timeout_ms, 30_000);

        let broken = dir.path().join("busd.toml");
        fs::write(&broken, "[poll\nnot toml").unwrap();
        assert_eq!(BrokerConfig::load(Some(&broken)).tracker.mode, TrackerMode::Command);

        let unknown_mode = dir.path().join("mode.toml");
        fs::write(&unknown_mode, "[tracker]\nmode = \"carrier-pigeon\"\n").unwrap();
        assert_eq!(BrokerConfig::load(Some(&unknown_mode)).tracker.mode, TrackerMode::Command);
    }

    #[test]
    fn environment_overrides_file() {
        let env: HashMap<&str, &str> = [
            (SOCKET_ENV, "/run/user/1000/custom.sock"),
            (TRACKER_ENV, "/opt/bin/bd"),
        ]
        .into_iter()
        .collect();
        let mut config = BrokerConfig::default();
        config.tracker.mode = TrackerMode::Memory;
        config.apply_env(|key| env.get(key).map(|v| v.to_string()));

        assert_eq!(
            config.broker.socket.as_deref(),
            Some(Path::new("/run/user/1000/custom.sock"))
        );
        assert_eq!(config.tracker.mode, TrackerMode::Command);
        assert_eq!(config.tracker.command, "/opt/bin/bd");

        config.apply_env(|key| (key == TRACKER_ENV).then(|| "memory".to_string()));
        assert_eq!(config.tracker.mode, TrackerMode::Memory);
    }

    #[test]
    fn settings_follow_config() {
        let mut config = BrokerConfig::default();
        config.health.pending_ack_secs = 5;
        config.poll.max_timeout_ms = 1_000;
        let settings = config.coordinator_settings();
        assert_eq!(settings.health.pending_ack, Duration::from_secs(5));
        assert_eq!(settings.poll_timeout(Some(5_000)), Duration::from_secs(1));
    }
}
