//! Serves any [`QueueAuthority`] over the framed queue protocol

use std::{net::SocketAddr, sync::Arc, time::Duration};

use outlane_common::Signal;
use tokio::{
    net::{TcpListener, TcpStream},
    sync::broadcast,
};
use tracing::{debug, error, info, trace, warn};

use crate::{
    QueueAuthority, QueueError, Result,
    protocol::{Command, Payload, Request, Response, read_frame, write_frame},
};

/// How long a connected client may stay silent between requests
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Exposes an authority to remote senders
pub struct QueueServer {
    listener: TcpListener,
    authority: Arc<dyn QueueAuthority>,
}

impl QueueServer {
    /// Bind the listening socket
    ///
    /// # Errors
    ///
    /// Returns an error if the address cannot be bound
    pub async fn bind(address: &str, authority: Arc<dyn QueueAuthority>) -> Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self {
            listener,
            authority,
        })
    }

    /// The address actually bound, useful when binding port 0
    ///
    /// # Errors
    ///
    /// Returns an error if the socket has no local address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until a shutdown signal is received
    ///
    /// # Errors
    ///
    /// Currently infallible once bound; accept errors are logged and skipped
    pub async fn serve(self, mut shutdown: broadcast::Receiver<Signal>) -> Result<()> {
        info!("Queue server listening on {}", self.local_addr()?);

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let authority = Arc::clone(&self.authority);
                            tokio::spawn(async move {
                                if let Err(e) = Self::handle_connection(stream, authority).await {
                                    error!(%peer, "Error handling queue connection: {e}");
                                }
                            });
                        }
                        Err(e) => {
                            error!("Error accepting queue connection: {e}");
                        }
                    }
                }
                sig = shutdown.recv() => {
                    match sig {
                        Ok(Signal::Shutdown | Signal::Finalised) => {
                            info!("Queue server shutting down");
                        }
                        Err(e) => {
                            error!("Queue server shutdown channel error: {e}");
                        }
                    }
                    break;
                }
            }
        }

        Ok(())
    }

    async fn handle_connection(
        mut stream: TcpStream,
        authority: Arc<dyn QueueAuthority>,
    ) -> Result<()> {
        loop {
            let request: Request = match tokio::time::timeout(IDLE_TIMEOUT, read_frame(&mut stream))
                .await
                .map_err(|_| QueueError::Timeout)?
            {
                Ok(request) => request,
                Err(QueueError::ConnectionClosed) => {
                    debug!("Queue client disconnected");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };

            trace!("Received request: {request:?}");

            let response = if request.version == crate::PROTOCOL_VERSION {
                Self::dispatch(authority.as_ref(), request.command).await
            } else {
                Response::new(Payload::Error(format!(
                    "Incompatible protocol version: client={}, server={}",
                    request.version,
                    crate::PROTOCOL_VERSION
                )))
            };

            write_frame(&mut stream, &response).await?;
        }
    }

    async fn dispatch(authority: &dyn QueueAuthority, command: Command) -> Response {
        let result = match command {
            Command::Get { zone } => authority
                .get(&zone)
                .await
                .map(|delivery| Payload::Delivery(delivery.map(Box::new))),
            Command::Release(lease) => authority.release(&lease).await.map(|()| Payload::Ok),
            Command::Defer { lease, ttl_ms } => authority
                .defer(&lease, Duration::from_millis(ttl_ms))
                .await
                .map(|()| Payload::Ok),
            Command::Bounce(bounce) => authority.bounce(&bounce).await.map(|()| Payload::Ok),
        };

        result.map_or_else(
            |e| {
                warn!("Error handling request: {e}");
                Response::from_error(&e)
            },
            Response::new,
        )
    }
}
