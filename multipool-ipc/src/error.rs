//! IPC error types

use thiserror::Error;

/// IPC error types
#[derive(Debug, Error)]
pub enum IpcError {
    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    DeserializationError(String),

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// The other side closed the stream while a write was pending
    #[error("Connection closed")]
    ConnectionClosed,

    /// Protocol version mismatch
    #[error("Protocol version mismatch: expected {expected}, got {actual}")]
    ProtocolVersionMismatch { expected: u32, actual: u32 },
}

impl IpcError {
    /// Whether the stream is unusable after this error. A single bad frame is
    /// not fatal, the next line may still decode.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            IpcError::SerializationError(_) | IpcError::DeserializationError(_)
        )
    }
}

impl From<std::io::Error> for IpcError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::BrokenPipe | std::io::ErrorKind::ConnectionReset => {
                IpcError::ConnectionClosed
            }
            _ => IpcError::IoError(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for IpcError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_io() {
            IpcError::IoError(err.to_string())
        } else if err.is_data() || err.is_syntax() || err.is_eof() {
            IpcError::DeserializationError(err.to_string())
        } else {
            IpcError::SerializationError(err.to_string())
        }
    }
}
