//! Extension points around a delivery attempt
//!
//! Each hook may refuse the attempt by returning a [`Veto`]. What a refusal
//! means depends on the hook: a refused connect moves on to the next address,
//! a refused route or send fails the attempt.

use std::net::{IpAddr, SocketAddr};

use async_trait::async_trait;
use outlane_queue::Delivery;
use thiserror::Error;

use crate::{config::PoolAddress, dns::Exchange};

/// A hook's refusal. The text is treated like a server response, so a hook
/// can make a refusal permanent by starting it with a 5xx code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct Veto(pub String);

impl Veto {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

/// How the next connection will be made. Hooks may rewrite any of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// Exchange host name, also used for TLS SNI
    pub exchange: String,
    pub ip: IpAddr,
    pub port: u16,
    /// The pool entry the connection is bound to
    pub local: PoolAddress,
    /// Name announced in EHLO
    pub name: String,
    /// Upgrade with STARTTLS, failing the attempt if that is impossible
    pub require_tls: bool,
    /// Implicit TLS from the first byte
    pub secure: bool,
}

impl ConnectOptions {
    #[must_use]
    pub const fn remote(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// The address to bind, unless it is of the wrong family for the remote.
    #[must_use]
    pub const fn bind_address(&self) -> Option<IpAddr> {
        if self.local.address.is_ipv6() == self.ip.is_ipv6() {
            Some(self.local.address)
        } else {
            None
        }
    }
}

#[async_trait]
pub trait DeliveryHooks: Send + Sync {
    /// Exchanges to use instead of the recipient's MX records.
    ///
    /// An empty list means no override.
    async fn route_override(&self, _delivery: &Delivery) -> Result<Vec<Exchange>, Veto> {
        Ok(Vec::new())
    }

    /// Called before every connection attempt.
    async fn pre_connect(
        &self,
        _delivery: &Delivery,
        _options: &mut ConnectOptions,
    ) -> Result<(), Veto> {
        Ok(())
    }

    /// Called once a session is ready, before the message is sent. Headers
    /// may be changed here.
    async fn pre_send(&self, _delivery: &mut Delivery) -> Result<(), Veto> {
        Ok(())
    }
}

/// Hooks that never intervene
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHooks;

impl DeliveryHooks for NoHooks {}
