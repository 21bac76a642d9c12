//! Error types for queue authority operations

use thiserror::Error;

/// Errors that can occur while talking to the queue authority
#[derive(Debug, Error)]
pub enum QueueError {
    /// I/O error communicating with the queue server
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Protocol serialization error
    #[error("Protocol error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    /// Protocol deserialization error
    #[error("Protocol error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The authority answered with an error
    #[error("Server error: {0}")]
    Server(String),

    /// The lock token presented no longer owns the delivery
    #[error("Lock mismatch for {id}.{seq}")]
    LockMismatch { id: String, seq: String },

    /// The request did not complete in time
    #[error("Request timeout")]
    Timeout,

    /// Connection closed unexpectedly
    #[error("Connection closed")]
    ConnectionClosed,

    /// A frame exceeded the maximum accepted size
    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(u32),

    /// The peer speaks a different protocol version
    #[error("Incompatible protocol version: peer={peer}, local={local}")]
    Version { peer: u32, local: u32 },
}

/// Result type for queue operations
pub type Result<T> = std::result::Result<T, QueueError>;
