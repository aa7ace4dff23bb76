use config::{self, File};
use log::{debug, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, WardenError};
use crate::readiness::ReadinessProbe;

/// Source of configuration
#[derive(Debug, Clone)]
pub enum ConfigSource {
    /// File path (TOML format)
    File(String),
    /// Environment variables with a prefix
    Environment(String),
    /// TOML string
    Toml(String),
}

/// Logging level
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Supervisor configuration
#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Bound on graceful shutdown in seconds
    #[serde(default = "default_shutdown_timeout_secs")]
    pub shutdown_timeout_secs: u64,

    /// Readiness poll interval in milliseconds
    #[serde(default = "default_poll_interval_ms")]
    pub readiness_poll_interval_ms: u64,

    /// How many polls the readiness failure predicate gets
    #[serde(default = "default_failure_attempts")]
    pub readiness_failure_attempts: usize,

    /// Whether to install OS termination-signal handlers that stop all
    /// processes and exit. Off by default so embedding applications can
    /// manage their own shutdown ordering.
    #[serde(default)]
    pub install_shutdown_hook: bool,

    /// Logging level
    #[serde(default)]
    pub log_level: LogLevel,
}

fn default_shutdown_timeout_secs() -> u64 {
    6
}

fn default_poll_interval_ms() -> u64 {
    100
}

fn default_failure_attempts() -> usize {
    5
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout_secs: default_shutdown_timeout_secs(),
            readiness_poll_interval_ms: default_poll_interval_ms(),
            readiness_failure_attempts: default_failure_attempts(),
            install_shutdown_hook: false,
            log_level: LogLevel::default(),
        }
    }
}

impl SupervisorConfig {
    /// Load from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        load_config(vec![ConfigSource::File(
            path.as_ref().to_string_lossy().to_string(),
        )])
    }

    /// The graceful shutdown bound as a duration
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// The configured readiness polling parameters
    pub fn probe(&self) -> ReadinessProbe {
        ReadinessProbe {
            poll_interval: Duration::from_millis(self.readiness_poll_interval_ms),
            failure_attempts: self.readiness_failure_attempts,
        }
    }
}

/// Load configuration from a list of sources; later sources override
/// earlier ones
pub fn load_config<T>(sources: Vec<ConfigSource>) -> Result<T>
where
    T: for<'de> Deserialize<'de> + std::fmt::Debug,
{
    let mut builder = config::Config::builder();

    for source in sources {
        match source {
            ConfigSource::File(path) => {
                let path = PathBuf::from(path);
                if !path.exists() {
                    warn!("Configuration file not found: {}", path.display());
                    continue;
                }

                debug!("Loading TOML configuration from file: {}", path.display());
                builder = builder.add_source(
                    File::with_name(&path.to_string_lossy()).format(config::FileFormat::Toml),
                );
            }
            ConfigSource::Environment(prefix) => {
                debug!("Loading configuration from environment with prefix: {}", prefix);
                builder = builder.add_source(
                    config::Environment::with_prefix(&prefix)
                        .separator("__")
                        .try_parsing(true),
                );
            }
            ConfigSource::Toml(toml_str) => {
                debug!("Loading configuration from TOML string");
                builder = builder
                    .add_source(config::File::from_str(&toml_str, config::FileFormat::Toml));
            }
        }
    }

    let config = builder
        .build()
        .map_err(|e| WardenError::Config(format!("Failed to build configuration: {}", e)))?;

    let result = config
        .try_deserialize()
        .map_err(|e| WardenError::Config(format!("Failed to deserialize configuration: {}", e)))?;

    debug!("Configuration loaded successfully: {:?}", result);

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn defaults_match_the_reference_constants() {
        let config = SupervisorConfig::default();
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(6));
        assert_eq!(config.probe().poll_interval, Duration::from_millis(100));
        assert_eq!(config.probe().failure_attempts, 5);
        assert!(!config.install_shutdown_hook);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn load_from_toml_file() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
            shutdown_timeout_secs = 2
            log_level = "debug"
            "#
        )
        .unwrap();

        let config = SupervisorConfig::load(file.path()).unwrap();
        assert_eq!(config.shutdown_timeout_secs, 2);
        assert_eq!(config.log_level, LogLevel::Debug);
        // Unset keys fall back to defaults
        assert_eq!(config.readiness_failure_attempts, 5);
    }

    #[test]
    fn environment_overrides_defaults() {
        // Prefix unique to this test so parallel tests cannot interfere
        unsafe { std::env::set_var("WARDEN_CONFTEST_SHUTDOWN_TIMEOUT_SECS", "9") };

        let config: SupervisorConfig = load_config(vec![ConfigSource::Environment(
            "WARDEN_CONFTEST".to_string(),
        )])
        .unwrap();

        unsafe { std::env::remove_var("WARDEN_CONFTEST_SHUTDOWN_TIMEOUT_SECS") };

        assert_eq!(config.shutdown_timeout_secs, 9);
        // Untouched keys fall back to defaults
        assert_eq!(config.readiness_failure_attempts, 5);
        assert_eq!(config.log_level, LogLevel::Info);
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let config: SupervisorConfig = load_config(vec![
            ConfigSource::Toml("shutdown_timeout_secs = 10".to_string()),
            ConfigSource::Toml("shutdown_timeout_secs = 3".to_string()),
        ])
        .unwrap();

        assert_eq!(config.shutdown_timeout_secs, 3);
    }
}
