//! Multipool execution engine
//!
//! A pool manager spawns worker processes and feeds them tasks over
//! newline-delimited JSON on stdin/stdout. Every worker runs a fixed-width
//! pool of inner threads, each with its own async runtime. Task functions are
//! referenced by name and resolved in a [`TaskRegistry`] compiled into the
//! worker binary.

pub mod builtins;
pub mod error;
pub mod pool;
pub mod process;
pub mod registry;
pub mod scheduler;
pub mod thread_pool;
pub mod worker;

pub use builtins::builtin_registry;
pub use error::{PoolError, WorkerError};
pub use pool::{Pool, PoolBuilder, PoolStats, QueueStats, ShutdownReport, WorkerInfo};
pub use process::{WorkerCommand, WorkerProcessStatus};
pub use registry::{TaskCall, TaskError, TaskRegistry, TaskResult};
pub use scheduler::{LeastPending, QueueLoad, RoundRobin, Scheduler};
pub use thread_pool::{InnerPool, ThreadPool};
pub use worker::{serve, worker_main, WorkerArgs, WorkerBudget, WorkerLoop, WorkerSummary};

// Re-export configuration and protocol types used in the public API
pub use multipool_config::{LoggingConfig, PoolConfig};
pub use multipool_ipc::{QueueId, StopReason, TaskId, TaskOutcome, WorkerId};
