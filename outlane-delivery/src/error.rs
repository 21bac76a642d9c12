//! Typed error handling for delivery operations.
//!
//! [`DeliveryError`] covers everything that can go wrong with a single
//! delivery. Those failures are absorbed by the sender and turned into a
//! DEFER or a BOUNCE. [`SenderError`] is what escapes a worker: the queue's
//! view of a delivery is unknown and the worker must stop.

use std::time::Duration;

use outlane_queue::QueueError;
use outlane_smtp::ClientError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    /// No exchange could be found for the recipient domain.
    #[error("Can't find an MX server for {domain}")]
    NoRoute { domain: String },

    /// Every exchange and address was tried without getting a session.
    #[error("Can't connect to any MX server for {domain}")]
    Exhausted { domain: String },

    /// The smart host refused the zone's credentials.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// The server answered with a reply the transaction cannot continue from.
    #[error("Rejected: {0}")]
    Rejected(String),

    /// The session broke without a usable reply.
    #[error("{0}")]
    Transport(String),

    #[error("Timed out waiting for {phase} after {after:?}")]
    Timeout { phase: &'static str, after: Duration },

    /// An extension hook refused the delivery.
    #[error("{0}")]
    Vetoed(String),

    /// The message body could not be fetched.
    #[error("Failed to fetch message body: {0}")]
    Body(String),
}

impl DeliveryError {
    /// The SMTP-style response describing this failure.
    ///
    /// This is what the bounce classifier inspects and what ends up in logs
    /// and bounce notifications. Routing failures carry a synthesized 450
    /// reply so they are deferred rather than rejected. A refused login keeps
    /// its prefix so it is treated as a connection failure, not as a
    /// rejection of the message.
    #[must_use]
    pub fn response(&self) -> String {
        match self {
            Self::NoRoute { domain } => format!("450 Can't find an MX server for {domain}"),
            Self::Exhausted { domain } => {
                format!("450 Can't connect to any MX server for {domain}")
            }
            Self::Rejected(reply) => reply.clone(),
            other => other.to_string(),
        }
    }
}

impl From<ClientError> for DeliveryError {
    fn from(err: ClientError) -> Self {
        match err {
            ClientError::AuthError { .. } => Self::Auth(err.reply().unwrap_or_default()),
            ClientError::UnexpectedResponse { .. } => Self::Rejected(err.reply().unwrap_or_default()),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Failures that end a sender's run loop.
#[derive(Debug, Error)]
pub enum SenderError {
    /// The queue authority could not be reached or refused a status update.
    #[error("Queue authority failure: {0}")]
    Authority(#[from] QueueError),

    /// A worker task ended abnormally.
    #[error("Worker failed: {0}")]
    Worker(String),
}
