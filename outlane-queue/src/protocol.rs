//! Queue server protocol types and framing
//!
//! Every message is a big-endian `u32` length followed by a bincode encoded
//! body.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{Bounce, Delivery, Lease, QueueError, Result};

/// Current protocol version
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted from a peer (10MB)
pub const MAX_FRAME_SIZE: u32 = 10_000_000;

/// Request sent to the queue server (versioned wrapper)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub version: u32,
    pub command: Command,
}

/// The commands a sender issues against the queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Check out the next deliverable unit for a zone
    Get { zone: String },
    /// Delivery finished (accepted or intentionally dropped)
    Release(Lease),
    /// Re-queue after `ttl_ms` milliseconds
    Defer { lease: Lease, ttl_ms: u64 },
    /// Record a terminal failure
    Bounce(Box<Bounce>),
}

impl Command {
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Get { .. } => "GET",
            Self::Release(_) => "RELEASE",
            Self::Defer { .. } => "DEFER",
            Self::Bounce(_) => "BOUNCE",
        }
    }
}

/// Response from the queue server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub version: u32,
    pub payload: Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Acknowledgement of a status update
    Ok,
    /// Answer to `Get`; `None` when nothing is ready
    Delivery(Option<Box<Delivery>>),
    /// The presented lock no longer owns the delivery
    LockMismatch { id: String, seq: String },
    /// Any other failure
    Error(String),
}

impl Request {
    #[must_use]
    pub const fn new(command: Command) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            command,
        }
    }
}

impl Response {
    #[must_use]
    pub const fn new(payload: Payload) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            payload,
        }
    }

    #[must_use]
    pub const fn is_version_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Converts an error into the payload reported to the peer.
    #[must_use]
    pub fn from_error(err: &QueueError) -> Self {
        Self::new(match err {
            QueueError::LockMismatch { id, seq } => Payload::LockMismatch {
                id: id.clone(),
                seq: seq.clone(),
            },
            other => Payload::Error(other.to_string()),
        })
    }
}

/// Writes one length-prefixed frame.
///
/// # Errors
///
/// Returns an error if encoding or writing fails.
pub async fn write_frame<W, T>(stream: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let bytes = bincode::serde::encode_to_vec(value, bincode::config::legacy())?;
    let len = u32::try_from(bytes.len())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    if len > MAX_FRAME_SIZE {
        return Err(QueueError::FrameTooLarge(len));
    }

    tracing::trace!("Sending frame: {len} bytes");

    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame.
///
/// A peer that closes the connection before the length prefix is reported
/// as [`QueueError::ConnectionClosed`].
///
/// # Errors
///
/// Returns an error if reading fails, the frame is too large, or the body
/// does not decode.
pub async fn read_frame<R, T>(stream: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(QueueError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_SIZE {
        return Err(QueueError::FrameTooLarge(len));
    }

    tracing::trace!("Receiving frame: {len} bytes");

    let mut bytes = vec![0u8; len as usize];
    stream.read_exact(&mut bytes).await?;

    let (value, _) = bincode::serde::decode_from_slice(&bytes, bincode::config::legacy())?;
    Ok(value)
}
