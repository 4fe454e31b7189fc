//! Newline-delimited JSON transport over async byte streams
//!
//! One side of a channel pair writes [`MessageEnvelope`]s with a
//! [`MessageWriter`], the other reads them with a [`MessageReader`]. The worker
//! side wraps stdin/stdout, the manager side wraps the child's pipes.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::trace;

use crate::error::IpcError;
use crate::protocol::{MessageEnvelope, IPC_PROTOCOL_VERSION};

/// Writes one envelope per line and flushes after every frame
pub struct MessageWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> MessageWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Send a message to the other end
    pub async fn send<T: Serialize>(&mut self, message: T) -> Result<(), IpcError> {
        let envelope = MessageEnvelope::new(message);
        let mut line = serde_json::to_vec(&envelope)
            .map_err(|e| IpcError::SerializationError(e.to_string()))?;
        line.push(b'\n');

        self.inner.write_all(&line).await?;
        self.inner.flush().await?;
        Ok(())
    }

    /// Flush and release the underlying stream
    pub async fn close(mut self) -> Result<(), IpcError> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

/// Reads envelopes line by line, checking the protocol version of each frame
pub struct MessageReader<R> {
    reader: BufReader<R>,
    line: String,
}

impl<R: AsyncRead + Unpin> MessageReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            reader: BufReader::new(inner),
            line: String::new(),
        }
    }

    /// Receive the next message. Returns `Ok(None)` once the other end closed
    /// the stream.
    pub async fn receive<T: DeserializeOwned>(
        &mut self,
    ) -> Result<Option<MessageEnvelope<T>>, IpcError> {
        loop {
            self.line.clear();
            let read = self.reader.read_line(&mut self.line).await?;
            if read == 0 {
                return Ok(None);
            }

            let frame = self.line.trim();
            if frame.is_empty() {
                continue;
            }

            let envelope: MessageEnvelope<T> = serde_json::from_str(frame).map_err(|e| {
                trace!("Malformed frame: {}", frame);
                IpcError::DeserializationError(e.to_string())
            })?;

            if envelope.protocol_version != IPC_PROTOCOL_VERSION {
                return Err(IpcError::ProtocolVersionMismatch {
                    expected: IPC_PROTOCOL_VERSION,
                    actual: envelope.protocol_version,
                });
            }

            return Ok(Some(envelope));
        }
    }
}
