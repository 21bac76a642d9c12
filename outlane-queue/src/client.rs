//! Client for the queue server

use std::time::Duration;

use async_trait::async_trait;
use outlane_common::internal;
use tokio::{net::TcpStream, sync::Mutex};

use crate::{
    Bounce, Delivery, Lease, QueueAuthority, QueueError, Result,
    protocol::{Command, Payload, Request, Response, read_frame, write_frame},
};

/// Talks to a queue server over a persistent TCP connection.
///
/// Requests are serialised over the one connection. If a request fails on a
/// connection that was already open, the client reconnects once and retries.
pub struct QueueClient {
    address: String,
    timeout: Duration,
    connection: Mutex<Option<TcpStream>>,
}

impl QueueClient {
    #[must_use]
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            timeout: Duration::from_secs(10),
            connection: Mutex::new(None),
        }
    }

    /// Set the timeout for a whole request/response round trip
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    async fn connect(&self) -> Result<TcpStream> {
        tracing::debug!("Connecting to queue server: {}", self.address);
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send a command and receive the response payload
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Connection fails
    /// - Protocol error occurs
    /// - Request times out
    /// - Server returns an error
    pub async fn send(&self, command: Command) -> Result<Payload> {
        tokio::time::timeout(self.timeout, self.send_internal(command))
            .await
            .map_err(|_| QueueError::Timeout)?
    }

    async fn send_internal(&self, command: Command) -> Result<Payload> {
        let request = Request::new(command);
        let mut guard = self.connection.lock().await;

        if let Some(stream) = guard.as_mut() {
            match Self::round_trip(stream, &request).await {
                Ok(response) => return Self::check(response),
                Err(err) => {
                    tracing::warn!(
                        error = %err,
                        "Persistent connection failed, reconnecting to {}",
                        self.address
                    );
                    *guard = None;
                }
            }
        }

        let mut stream = self.connect().await?;
        let response = Self::round_trip(&mut stream, &request).await?;
        *guard = Some(stream);

        Self::check(response)
    }

    async fn round_trip(stream: &mut TcpStream, request: &Request) -> Result<Response> {
        write_frame(stream, request).await?;
        read_frame(stream).await
    }

    fn check(response: Response) -> Result<Payload> {
        if !response.is_version_compatible() {
            return Err(QueueError::Version {
                peer: response.version,
                local: crate::PROTOCOL_VERSION,
            });
        }

        match response.payload {
            Payload::Error(message) => Err(QueueError::Server(message)),
            Payload::LockMismatch { id, seq } => Err(QueueError::LockMismatch { id, seq }),
            payload => Ok(payload),
        }
    }

    async fn acknowledged(&self, command: Command) -> Result<()> {
        let name = command.name();
        match self.send(command).await? {
            Payload::Ok => Ok(()),
            other => Err(QueueError::Server(format!(
                "Unexpected reply to {name}: {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl QueueAuthority for QueueClient {
    async fn get(&self, zone: &str) -> Result<Option<Delivery>> {
        match self
            .send(Command::Get {
                zone: zone.to_string(),
            })
            .await?
        {
            Payload::Delivery(delivery) => Ok(delivery.map(|delivery| *delivery)),
            Payload::Ok => Ok(None),
            other => Err(QueueError::Server(format!("Unexpected reply to GET: {other:?}"))),
        }
    }

    async fn release(&self, lease: &Lease) -> Result<()> {
        internal!(id = %lease.id, seq = %lease.seq, "RELEASE");
        self.acknowledged(Command::Release(lease.clone())).await
    }

    async fn defer(&self, lease: &Lease, ttl: Duration) -> Result<()> {
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        internal!(id = %lease.id, seq = %lease.seq, ttl_ms, "DEFER");
        self.acknowledged(Command::Defer {
            lease: lease.clone(),
            ttl_ms,
        })
        .await
    }

    async fn bounce(&self, bounce: &Bounce) -> Result<()> {
        internal!(id = %bounce.id, seq = %bounce.seq, category = %bounce.category, "BOUNCE");
        self.acknowledged(Command::Bounce(Box::new(bounce.clone())))
            .await
    }
}
