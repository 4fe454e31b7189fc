//! IPC protocol definitions and message types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use std::fmt;

/// IPC protocol version for compatibility checking
pub const IPC_PROTOCOL_VERSION: u32 = 1;

/// Pool-wide task identity, assigned monotonically by the pool manager
pub type TaskId = u64;

/// Identity of a task inside one worker's inner pool
pub type InnerTaskId = u64;

/// Index of a channel pair owned by the pool manager
pub type QueueId = usize;

/// Identity of a worker process for the lifetime of the pool
pub type WorkerId = u64;

/// A unit of submitted work. The function is referenced by its registered name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task_id: TaskId,
    pub function: String,
    #[serde(default)]
    pub args: Vec<JsonValue>,
    #[serde(default)]
    pub kwargs: Map<String, JsonValue>,
}

impl TaskEnvelope {
    /// Create a new task envelope
    pub fn new(
        task_id: TaskId,
        function: impl Into<String>,
        args: Vec<JsonValue>,
        kwargs: Map<String, JsonValue>,
    ) -> Self {
        Self {
            task_id,
            function: function.into(),
            args,
            kwargs,
        }
    }
}

/// Messages sent from the pool manager to a worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskMessage {
    /// Execute a task
    WorkItem(TaskEnvelope),

    /// No more work will follow on this channel
    StopSignal,
}

impl TaskMessage {
    pub fn is_stop(&self) -> bool {
        matches!(self, TaskMessage::StopSignal)
    }
}

/// Outcome of a completed task: a value or a failure trace, never both
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TaskOutcome {
    Value { value: JsonValue },
    Failure { trace: String },
}

impl TaskOutcome {
    pub fn value(value: JsonValue) -> Self {
        TaskOutcome::Value { value }
    }

    pub fn failure(trace: impl Into<String>) -> Self {
        TaskOutcome::Failure {
            trace: trace.into(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, TaskOutcome::Failure { .. })
    }
}

/// Result of one accepted task, emitted exactly once
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub task_id: TaskId,
    pub outcome: TaskOutcome,
}

impl ResultEnvelope {
    pub fn new(task_id: TaskId, outcome: TaskOutcome) -> Self {
        Self { task_id, outcome }
    }
}

/// Why a worker loop stopped accepting work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// A stop sentinel was dequeued
    StopSignal,
    /// The worker accepted as many tasks as its TTL allows
    TtlExhausted,
    /// The inbound channel was closed by the other side
    ChannelClosed,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::StopSignal => write!(f, "stop signal"),
            StopReason::TtlExhausted => write!(f, "ttl exhausted"),
            StopReason::ChannelClosed => write!(f, "channel closed"),
        }
    }
}

/// Messages sent from worker processes to the pool manager
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerReport {
    /// Worker initialised and ready for work
    Ready { worker_id: WorkerId, pid: u32 },

    /// A task finished
    Completed(ResultEnvelope),

    /// Worker drained all accepted work and is about to exit
    Stopped {
        worker_id: WorkerId,
        accepted: u64,
        completed: u64,
        reason: StopReason,
    },
}

/// Parameters handed to a worker process when it is spawned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSettings {
    pub worker_id: WorkerId,
    pub queue_id: QueueId,
    /// Number of inner threads
    pub thread_width: usize,
    /// Effective process TTL (`thread_ttl * thread_width`), 0 means unlimited
    pub ttl: u64,
    /// Effective process concurrency (`max(1, thread_concurrency * thread_width)`)
    pub concurrency: usize,
    pub thread_ttl: u64,
    pub thread_concurrency: usize,
    pub poll_interval_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initializer: Option<String>,
    #[serde(default)]
    pub initargs: Vec<JsonValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_level: Option<String>,
}

/// Message envelope for all IPC communications
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope<T> {
    pub protocol_version: u32,
    pub timestamp: DateTime<Utc>,
    pub message: T,
}

impl<T> MessageEnvelope<T> {
    /// Create a new message envelope
    pub fn new(message: T) -> Self {
        Self {
            protocol_version: IPC_PROTOCOL_VERSION,
            timestamp: Utc::now(),
            message,
        }
    }

    /// Check if protocol version is compatible
    pub fn is_compatible(&self) -> bool {
        self.protocol_version == IPC_PROTOCOL_VERSION
    }
}
