//! Error types for task execution

use multipool_config::ConfigError;
use multipool_ipc::{IpcError, TaskId};
use thiserror::Error;

/// Errors surfaced by the pool manager
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Failed to spawn worker process: {0}")]
    Spawn(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Task {task_id} failed: {trace}")]
    TaskFailed { task_id: TaskId, trace: String },

    #[error("Task {task_id} lost: {reason}")]
    WorkerLost { task_id: TaskId, reason: String },

    #[error("Unknown or already retrieved task: {0}")]
    UnknownTask(TaskId),

    #[error("Pool is closed")]
    Closed,

    #[error("No live worker processes")]
    NoLiveWorkers,
}

impl PoolError {
    /// Failure trace of a task that ran and failed
    pub fn trace(&self) -> Option<&str> {
        match self {
            PoolError::TaskFailed { trace, .. } => Some(trace),
            _ => None,
        }
    }

    /// Whether the error belongs to one task rather than the pool
    pub fn is_task_error(&self) -> bool {
        matches!(
            self,
            PoolError::TaskFailed { .. } | PoolError::WorkerLost { .. }
        )
    }
}

/// Errors raised inside a worker process
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Worker initialization failed: {0}")]
    Initialization(String),

    #[error("IPC error: {0}")]
    Ipc(#[from] IpcError),

    #[error("Inner pool is closed")]
    PoolClosed,

    #[error("Worker I/O task failed: {0}")]
    Join(String),
}
