//! Logging setup for multipool
//!
//! The pool manager configures tracing from a [`LoggingConfig`]. Worker
//! processes use [`init_worker_tracing`], which never touches stdout because
//! a worker's stdout carries the IPC stream.

pub mod init;

pub use init::{
    build_env_filter, init_logging_from_config, init_simple_tracing, init_worker_tracing,
};
pub use multipool_config::{LogFormat, LogLevel, LoggingConfig};
