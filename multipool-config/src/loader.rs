//! Configuration loading and environment variable handling

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::pool::PoolConfig;
use crate::domains::MultipoolConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "MULTIPOOL".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<MultipoolConfig> {
        let content = std::fs::read_to_string(path.as_ref())?;
        let mut config: MultipoolConfig = serde_yaml::from_str(&content)?;
        tracing::debug!("Loaded configuration from {}", path.as_ref().display());

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<MultipoolConfig> {
        let mut config = MultipoolConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<MultipoolConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut MultipoolConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply pool config overrides
    fn apply_pool_overrides(&self, config: &mut PoolConfig) -> ConfigResult<()> {
        if let Some(processes) = self.parse_env_var::<usize>("PROCESSES")? {
            config.processes = Some(processes);
        }

        if let Some(threads) = self.parse_env_var::<usize>("THREADS")? {
            config.threads = Some(threads);
        }

        if let Some(queue_count) = self.parse_env_var("QUEUE_COUNT")? {
            config.queue_count = queue_count;
        }

        if let Some(ttl) = self.parse_env_var("MAX_TASKS_PER_CHILD")? {
            config.max_tasks_per_child = ttl;
        }

        if let Some(concurrency) = self.parse_env_var("CHILD_CONCURRENCY")? {
            config.child_concurrency = concurrency;
        }

        if let Some(millis) = self.parse_env_var("POLL_INTERVAL_MS")? {
            config.poll_interval = Duration::from_millis(millis);
        }

        if let Some(seconds) = self.parse_env_var("SHUTDOWN_TIMEOUT_SECONDS")? {
            config.shutdown_timeout = Duration::from_secs(seconds);
        }

        if let Some(capacity) = self.parse_env_var("CHANNEL_CAPACITY")? {
            config.channel_capacity = capacity;
        }

        if let Some(restart) = self.parse_env_var("RESTART_ON_CRASH")? {
            config.restart_on_crash = restart;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Parse an optional environment variable
    fn parse_env_var<T>(&self, name: &str) -> ConfigResult<Option<T>>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.get_env_var(name) {
            Ok(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|e| ConfigError::EnvError(format!("Invalid {}: {}", name, e))),
            Err(_) => Ok(None),
        }
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
