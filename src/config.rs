//! Application-level configuration loading: timer cadence, gateway limits and hub sizing.

use std::{env, fs, io::ErrorKind, path::PathBuf, time::Duration};

use serde::Deserialize;
use tracing::{info, warn};

/// Default location on disk where the server looks for the JSON configuration.
const DEFAULT_CONFIG_PATH: &str = "config/app.json";
/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`].
const CONFIG_PATH_ENV: &str = "LIVE_BATTLE_CONFIG_PATH";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
/// Immutable runtime configuration shared across the application.
pub struct AppConfig {
    /// Period of one round timer tick, in milliseconds.
    pub tick_interval_ms: u64,
    /// Upper bound on the persistence work of a single transition, in milliseconds.
    /// Zero disables the bound.
    pub transition_timeout_ms: u64,
    /// How long a fresh socket may stay silent before sending `identify`.
    pub identification_timeout_secs: u64,
    /// Chat messages are truncated to this many characters.
    pub chat_max_chars: usize,
    /// Events buffered per slow subscriber on a battle topic.
    pub hub_capacity: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1_000,
            transition_timeout_ms: 5_000,
            identification_timeout_secs: 10,
            chat_max_chars: 200,
            hub_capacity: 64,
        }
    }
}

impl AppConfig {
    /// Load the application configuration from disk, falling back to built-in defaults.
    pub fn load() -> Self {
        let path = resolve_config_path();
        match fs::read_to_string(&path) {
            Ok(contents) => match Self::parse(&contents) {
                Ok(config) => {
                    info!(
                        path = %path.display(),
                        tick_interval_ms = config.tick_interval_ms,
                        chat_max_chars = config.chat_max_chars,
                        "loaded configuration"
                    );
                    config
                }
                Err(err) => {
                    warn!(
                        path = %path.display(),
                        error = %err,
                        "failed to parse config; falling back to defaults"
                    );
                    Self::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => {
                info!(
                    path = %path.display(),
                    "config file not found; using built-in defaults"
                );
                Self::default()
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "failed to read config; falling back to defaults"
                );
                Self::default()
            }
        }
    }

    /// Parse a JSON document; absent keys keep their default value.
    pub fn parse(contents: &str) -> Result<Self, serde_json::Error> {
        let mut config: Self = serde_json::from_str(contents)?;
        config.tick_interval_ms = config.tick_interval_ms.max(1);
        config.hub_capacity = config.hub_capacity.max(1);
        Ok(config)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// `None` when transitions may wait on storage indefinitely.
    pub fn transition_timeout(&self) -> Option<Duration> {
        (self.transition_timeout_ms > 0).then(|| Duration::from_millis(self.transition_timeout_ms))
    }

    pub fn identification_timeout(&self) -> Duration {
        Duration::from_secs(self.identification_timeout_secs)
    }
}

/// Resolve the configuration path taking the environment override into account.
fn resolve_config_path() -> PathBuf {
    env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .filter(|path| !path.as_os_str().is_empty())
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH))
}
