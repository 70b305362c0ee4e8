//! Runtime configuration (vessel.toml)
//!
//! Every field has a default, so an empty file is a valid configuration.
//! `VESSEL_*` environment variables override file values.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use vessel_engine::{ExecutionMode, VmOptions};

/// Errors that can occur while loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// An environment override has an invalid value
    #[error("Invalid value for {var}: {value:?}")]
    Env {
        /// Variable name
        var: &'static str,
        /// Rejected value
        value: String,
    },
}

/// Execution mode as written in configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionSetting {
    /// Follow the build (`jit` feature)
    #[default]
    Auto,
    /// Dynamically linked, patchable
    Jit,
    /// Statically compiled, not patchable
    Static,
}

impl ExecutionSetting {
    fn resolve(self) -> ExecutionMode {
        match self {
            ExecutionSetting::Auto => ExecutionMode::default(),
            ExecutionSetting::Jit => ExecutionMode::Jit,
            ExecutionSetting::Static => ExecutionMode::Static,
        }
    }
}

/// `[vm]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Execution mode
    pub execution: ExecutionSetting,
    /// Bytes allocated between collections
    pub gc_threshold: usize,
    /// Maximum bytecode call depth
    pub max_call_depth: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        let defaults = VmOptions::default();
        Self {
            execution: ExecutionSetting::Auto,
            gc_threshold: defaults.gc_threshold,
            max_call_depth: defaults.max_call_depth,
        }
    }
}

/// `[gc]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    /// How long a collection waits for other threads (milliseconds)
    pub pause_timeout_ms: u64,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            pause_timeout_ms: 1000,
        }
    }
}

/// `[threading]` section
///
/// A timeout of `0` waits forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThreadingConfig {
    /// Bound on joining the VM thread in `stop()` (milliseconds)
    pub stop_timeout_ms: u64,
    /// Bound on waiting for a `call_sync` result (milliseconds)
    pub call_timeout_ms: u64,
    /// How often the idle VM thread pumps event sources (milliseconds)
    pub tick_interval_ms: u64,
}

impl Default for ThreadingConfig {
    fn default() -> Self {
        Self {
            stop_timeout_ms: 5_000,
            call_timeout_ms: 30_000,
            tick_interval_ms: 16,
        }
    }
}

/// `[hot_reload]` section
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HotReloadConfig {
    /// Enable hot reload when the instance is created
    pub enabled: bool,
}

/// `[logging]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when neither `VESSEL_LOG` nor `RUST_LOG` is set
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Complete runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VesselConfig {
    /// VM settings
    pub vm: VmConfig,
    /// Collector settings
    pub gc: GcConfig,
    /// Threaded engine settings
    pub threading: ThreadingConfig,
    /// Hot reload settings
    pub hot_reload: HotReloadConfig,
    /// Logging settings
    pub logging: LoggingConfig,
}

fn bounded(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl VesselConfig {
    /// Parse TOML text
    pub fn parse(source: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(source)?)
    }

    /// Read a TOML file, then apply environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let mut config = Self::parse(&source)?;
        config.apply_env()?;
        Ok(config)
    }

    /// Defaults with environment overrides applied
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Apply `VESSEL_*` overrides from the process environment
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_overrides(|var| std::env::var(var).ok())
    }

    /// Apply overrides from an arbitrary lookup
    ///
    /// Recognised variables: `VESSEL_EXECUTION` (`auto`/`jit`/`static`),
    /// `VESSEL_GC_THRESHOLD`, `VESSEL_GC_PAUSE_TIMEOUT_MS`,
    /// `VESSEL_STOP_TIMEOUT_MS`, `VESSEL_CALL_TIMEOUT_MS`,
    /// `VESSEL_TICK_INTERVAL_MS`, `VESSEL_HOT_RELOAD` (`1`/`true`/`0`/`false`)
    /// and `VESSEL_LOG_LEVEL`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        fn number<T: std::str::FromStr>(var: &'static str, value: String) -> Result<T, ConfigError> {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Env { var, value })
        }

        if let Some(value) = lookup("VESSEL_EXECUTION") {
            self.vm.execution = match value.trim().to_ascii_lowercase().as_str() {
                "auto" => ExecutionSetting::Auto,
                "jit" => ExecutionSetting::Jit,
                "static" => ExecutionSetting::Static,
                _ => {
                    return Err(ConfigError::Env {
                        var: "VESSEL_EXECUTION",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("VESSEL_GC_THRESHOLD") {
            self.vm.gc_threshold = number("VESSEL_GC_THRESHOLD", value)?;
        }
        if let Some(value) = lookup("VESSEL_GC_PAUSE_TIMEOUT_MS") {
            self.gc.pause_timeout_ms = number("VESSEL_GC_PAUSE_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("VESSEL_STOP_TIMEOUT_MS") {
            self.threading.stop_timeout_ms = number("VESSEL_STOP_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("VESSEL_CALL_TIMEOUT_MS") {
            self.threading.call_timeout_ms = number("VESSEL_CALL_TIMEOUT_MS", value)?;
        }
        if let Some(value) = lookup("VESSEL_TICK_INTERVAL_MS") {
            self.threading.tick_interval_ms = number("VESSEL_TICK_INTERVAL_MS", value)?;
        }
        if let Some(value) = lookup("VESSEL_HOT_RELOAD") {
            self.hot_reload.enabled = match value.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Env {
                        var: "VESSEL_HOT_RELOAD",
                        value,
                    })
                }
            };
        }
        if let Some(value) = lookup("VESSEL_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    /// Engine options derived from this configuration
    pub fn vm_options(&self) -> VmOptions {
        VmOptions {
            execution_mode: self.vm.execution.resolve(),
            gc_threshold: self.vm.gc_threshold,
            gc_pause_timeout: Duration::from_millis(self.gc.pause_timeout_ms),
            max_call_depth: self.vm.max_call_depth,
        }
    }

    /// Bound on `stop()`, `None` for unbounded
    pub fn stop_timeout(&self) -> Option<Duration> {
        bounded(self.threading.stop_timeout_ms)
    }

    /// Bound on `call_sync`, `None` for unbounded
    pub fn call_timeout(&self) -> Option<Duration> {
        bounded(self.threading.call_timeout_ms)
    }

    /// Idle pump interval of the VM thread
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.threading.tick_interval_ms.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_empty_config_is_default() {
        let config = VesselConfig::parse("").unwrap();
        assert_eq!(config, VesselConfig::default());
        assert_eq!(config.stop_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(config.call_timeout(), Some(Duration::from_secs(30)));
        assert!(!config.hot_reload.enabled);
    }

    #[test]
    fn test_parse_sections() {
        let toml = r#"
            [vm]
            execution = "static"
            gc_threshold = 4096

            [threading]
            stop_timeout_ms = 0
            tick_interval_ms = 5

            [hot_reload]
            enabled = true

            [logging]
            level = "debug"
        "#;
        let config = VesselConfig::parse(toml).unwrap();
        assert_eq!(config.vm.execution, ExecutionSetting::Static);
        assert_eq!(config.vm_options().execution_mode, ExecutionMode::Static);
        assert_eq!(config.vm_options().gc_threshold, 4096);
        assert_eq!(config.stop_timeout(), None);
        assert_eq!(config.tick_interval(), Duration::from_millis(5));
        assert_eq!(config.threading.call_timeout_ms, 30_000);
        assert!(config.hot_reload.enabled);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_unknown_execution_mode_rejected() {
        let err = VesselConfig::parse("[vm]\nexecution = \"aot\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn test_env_overrides() {
        let vars: HashMap<&str, &str> = [
            ("VESSEL_EXECUTION", "jit"),
            ("VESSEL_STOP_TIMEOUT_MS", "250"),
            ("VESSEL_HOT_RELOAD", "on"),
        ]
        .into_iter()
        .collect();
        let mut config = VesselConfig::default();
        config
            .apply_overrides(|var| vars.get(var).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.vm.execution, ExecutionSetting::Jit);
        assert_eq!(config.stop_timeout(), Some(Duration::from_millis(250)));
        assert!(config.hot_reload.enabled);
    }

    #[test]
    fn test_bad_env_value() {
        let mut config = VesselConfig::default();
        let err = config
            .apply_overrides(|var| (var == "VESSEL_CALL_TIMEOUT_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Env {
                var: "VESSEL_CALL_TIMEOUT_MS",
                ..
            }
        ));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("vessel.toml");
        std::fs::write(&path, "[gc]\npause_timeout_ms = 20\n").unwrap();
        let config = VesselConfig::from_file(&path).unwrap();
        assert_eq!(
            config.vm_options().gc_pause_timeout,
            Duration::from_millis(20)
        );

        let missing = VesselConfig::from_file(dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
