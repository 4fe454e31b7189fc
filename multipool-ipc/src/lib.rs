//! Inter-process communication for multipool
//!
//! This crate provides the wire protocol and the stream transport used between
//! the pool manager and its worker processes. Every frame is one JSON line
//! wrapped in a [`MessageEnvelope`].

pub mod error;
pub mod protocol;
pub mod transport;

// Re-export commonly used types
pub use error::IpcError;
pub use protocol::{
    InnerTaskId, MessageEnvelope, QueueId, ResultEnvelope, StopReason, TaskEnvelope, TaskId,
    TaskMessage, TaskOutcome, WorkerId, WorkerReport, WorkerSettings, IPC_PROTOCOL_VERSION,
};
pub use transport::{MessageReader, MessageWriter};
