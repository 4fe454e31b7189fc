//! Configuration management for multipool
//!
//! This crate provides the pool and logging configuration domains,
//! with validation, defaults, YAML files and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    pool::{PoolConfig, MAX_THREAD_WIDTH},
    MultipoolConfig,
};

// Re-export utilities
pub use domains::utils::{serde_duration, serde_duration_ms};
