//! Error taxonomy shared by the capture ring and the connection engine.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// Failures of the capture device or of the frame ring built on top of it.
///
/// Any error returned while the ring is being initialized is fatal to the
/// caller. Errors from `acquire_frame` only affect the frame that was being
/// requested.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("failed to open capture device {path}")]
    OpenFailed {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("capture device rejected the requested format: {reason}")]
    FormatRejected { reason: String },

    #[error("buffer request failed: {reason}")]
    BufferRequestFailed { reason: String },

    #[error("failed to map buffer {index}")]
    MapFailed {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to enqueue buffer {index}")]
    EnqueueFailed {
        index: usize,
        #[source]
        source: io::Error,
    },

    #[error("failed to dequeue buffer")]
    DequeueFailed(#[source] io::Error),

    /// No buffer was filled within the wait. Nothing changed hands.
    #[error("no frame within {0:?}")]
    Timeout(Duration),

    #[error("failed to switch stream {state}")]
    StreamFailed {
        state: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("driver returned slot {index}, which was not queued")]
    UnexpectedSlot { index: usize },

    #[error("driver reported {bytes_used} bytes in slot {index} of capacity {capacity}")]
    Overrun {
        index: usize,
        bytes_used: usize,
        capacity: usize,
    },

    #[error("frame source is {0}, expected streaming")]
    NotStreaming(&'static str),

    #[error("frame feed unavailable: {0}")]
    Unavailable(String),
}

/// Failures while pulling request lines off a connection.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("read failed")]
    Io(#[from] io::Error),

    #[error("line exceeds the {capacity} byte buffer")]
    LineTooLong { capacity: usize },
}

/// Requests that are well-formed at the byte level but unusable.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("upgrade request carried no Sec-WebSocket-Key header")]
    MissingWebSocketKey,

    #[error("Sec-WebSocket-Key value is not a valid token")]
    MalformedWebSocketKey,

    #[error("malformed request line")]
    MalformedRequest,
}

/// Everything that can end a single connection early.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error(transparent)]
    Read(#[from] ReadError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("write failed")]
    Write(#[source] io::Error),
}
