//! Connection negotiation
//!
//! Walks the exchange list, and for each exchange its addresses, until one
//! (remote, local) pair yields a greeted, optionally encrypted and
//! authenticated session:
//!
//! ```text
//! NEXT_EXCHANGE -> RESOLVE_IPS -> NEXT_IP -> CONNECTING -> HANDSHAKE -> AUTH -> READY
//!       ^               |            ^            |             |
//!       |   (no ips)    |            +- failure --+-------------+
//!       +---------------+ (ips exhausted)
//! ```
//!
//! When TLS was required for an address and could not be negotiated, the
//! same address is tried once more in plaintext and remembered, so later
//! deliveries through this negotiator go straight to plaintext.

use std::{future::Future, net::IpAddr, sync::Arc, time::Duration};

use dashmap::DashSet;
use outlane_common::internal;
use outlane_queue::Delivery;
use outlane_smtp::{ClientError, SmtpClient};
use outlane_tracing::traced;
use tokio::io::AsyncRead;

use crate::{
    binder,
    config::{SmtpTimeouts, ZoneConfig},
    dns::Exchange,
    error::DeliveryError,
    hooks::{ConnectOptions, DeliveryHooks},
    route::RouteResolver,
};

/// Bounds `future` by `secs`, reporting `phase` when it runs out.
pub(crate) async fn timed<T, F>(phase: &'static str, secs: u64, future: F) -> Result<T, DeliveryError>
where
    F: Future<Output = Result<T, ClientError>>,
{
    let after = Duration::from_secs(secs);
    tokio::time::timeout(after, future)
        .await
        .map_err(|_| DeliveryError::Timeout { phase, after })?
        .map_err(DeliveryError::from)
}

/// Why a single connection attempt did not produce a session.
enum AttemptError {
    /// TLS was required and could not be negotiated.
    Tls(String),
    /// Credentials were refused; trying elsewhere will not help.
    Auth(DeliveryError),
    /// Anything else; move on to the next address.
    Failed(DeliveryError),
}

/// A ready SMTP session bound to one (remote, local) pair.
///
/// The caller must [`close`](Session::close) it once the delivery is done.
pub struct Session {
    client: SmtpClient,
    options: ConnectOptions,
}

impl Session {
    /// The exchange this session is connected to.
    #[must_use]
    pub fn exchange(&self) -> &str {
        &self.options.exchange
    }

    #[must_use]
    pub const fn ip(&self) -> IpAddr {
        self.options.ip
    }

    /// The name announced in EHLO.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.options.name
    }

    #[must_use]
    pub const fn is_tls(&self) -> bool {
        self.client.is_tls()
    }

    /// Runs the mail transaction for one recipient and streams `content`.
    ///
    /// `size` is announced only when the server advertises SIZE.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Rejected`] carrying the server reply for any refused
    /// step, or a transport/timeout error.
    #[traced(instrument(level = tracing::Level::INFO, skip(self, content, timeouts), fields(exchange = %self.options.exchange, ip = %self.options.ip)), timing(precision = "ms"))]
    pub async fn send<R>(
        &mut self,
        from: &str,
        to: &str,
        size: u64,
        content: R,
        timeouts: &SmtpTimeouts,
    ) -> Result<String, DeliveryError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let size = self.client.supports("SIZE").then_some(size);

        let response = timed("MAIL FROM", timeouts.mail_from_secs, self.client.mail_from(from, size)).await?;
        if !response.is_success() {
            return Err(DeliveryError::Rejected(response.reply()));
        }

        let response = timed("RCPT TO", timeouts.rcpt_to_secs, self.client.rcpt_to(to)).await?;
        if !response.is_success() {
            return Err(DeliveryError::Rejected(response.reply()));
        }

        let response = timed("DATA", timeouts.data_secs, self.client.data()).await?;
        if !response.is_intermediate() {
            return Err(DeliveryError::Rejected(response.reply()));
        }

        let response = timed(
            "message content",
            timeouts.data_secs,
            self.client.send_data_stream(content),
        )
        .await?;
        if !response.is_success() {
            return Err(DeliveryError::Rejected(response.reply()));
        }

        Ok(response.reply())
    }

    /// Sends QUIT (best effort) and drops the connection.
    pub async fn close(mut self, timeouts: &SmtpTimeouts) {
        let quit = Duration::from_secs(timeouts.quit_secs);
        if tokio::time::timeout(quit, self.client.quit()).await.is_err() {
            tracing::debug!(exchange = %self.options.exchange, "QUIT timed out");
        }
        self.client.close().await;
    }
}

/// Opens sessions for one worker.
///
/// Owns the worker's memory of addresses where TLS failed.
pub struct Negotiator {
    zone: Arc<ZoneConfig>,
    routes: Arc<RouteResolver>,
    hooks: Arc<dyn DeliveryHooks>,
    timeouts: SmtpTimeouts,
    transcript: bool,
    tls_disabled: DashSet<IpAddr>,
}

impl Negotiator {
    #[must_use]
    pub fn new(
        zone: Arc<ZoneConfig>,
        routes: Arc<RouteResolver>,
        hooks: Arc<dyn DeliveryHooks>,
        timeouts: SmtpTimeouts,
        transcript: bool,
    ) -> Self {
        Self {
            zone,
            routes,
            hooks,
            timeouts,
            transcript,
            tls_disabled: DashSet::new(),
        }
    }

    /// Whether a previous attempt found TLS unusable at `ip`.
    #[must_use]
    pub fn is_tls_disabled(&self, ip: &IpAddr) -> bool {
        self.tls_disabled.contains(ip)
    }

    /// Resolves a route for `delivery` and opens a session on it.
    ///
    /// # Errors
    ///
    /// See [`RouteResolver::exchanges`] and [`Negotiator::negotiate`].
    pub async fn connect(&self, delivery: &Delivery) -> Result<Session, DeliveryError> {
        let exchanges = self.routes.exchanges(&self.zone, delivery).await?;
        self.negotiate(delivery, &exchanges).await
    }

    /// Tries `exchanges` in order until one yields a session.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::Exhausted`] once every exchange and address has
    /// failed, or [`DeliveryError::Auth`] as soon as credentials are refused.
    #[traced(instrument(level = tracing::Level::DEBUG, skip_all, fields(zone = %self.zone.name, id = %delivery.id, seq = %delivery.seq, domain = %delivery.domain)), timing(precision = "ms"))]
    pub async fn negotiate(
        &self,
        delivery: &Delivery,
        exchanges: &[Exchange],
    ) -> Result<Session, DeliveryError> {
        let key = delivery.key();

        for exchange in exchanges {
            let ips = match self.routes.addresses(&self.zone, &exchange.exchange).await {
                Ok(ips) if !ips.is_empty() => ips,
                Ok(_) => {
                    internal!(
                        level = DEBUG,
                        zone = %self.zone.name,
                        exchange = %exchange.exchange,
                        "Could not resolve A/AAAA"
                    );
                    continue;
                }
                Err(err) => {
                    internal!(
                        level = DEBUG,
                        zone = %self.zone.name,
                        exchange = %exchange.exchange,
                        "Error resolving A/AAAA: {err}"
                    );
                    continue;
                }
            };

            let mut index = 0;
            let mut plaintext_retry = false;

            while let Some(&ip) = ips.get(index) {
                let Some(local) = binder::bind(&self.zone.pool, &key, ip.is_ipv6()) else {
                    return Err(DeliveryError::Exhausted {
                        domain: delivery.domain.clone(),
                    });
                };

                let mut options = ConnectOptions {
                    exchange: exchange.exchange.clone(),
                    ip,
                    port: self.zone.port,
                    local: local.clone(),
                    name: local.name.clone(),
                    require_tls: !self.zone.secure && !self.tls_disabled.contains(&ip),
                    secure: self.zone.secure,
                };

                internal!(
                    level = DEBUG,
                    zone = %self.zone.name,
                    domain = %delivery.domain,
                    exchange = %options.exchange,
                    %ip,
                    local_address = %options.local.address,
                    "Connecting as {}",
                    options.name
                );

                if let Err(veto) = self.hooks.pre_connect(delivery, &mut options).await {
                    internal!(
                        level = DEBUG,
                        zone = %self.zone.name,
                        %ip,
                        "Connection vetoed: {veto}"
                    );
                    index += 1;
                    plaintext_retry = false;
                    continue;
                }

                match self.attempt(&options).await {
                    Ok(client) => return Ok(Session { client, options }),
                    Err(AttemptError::Auth(err)) => return Err(err),
                    Err(AttemptError::Tls(reason)) if !plaintext_retry => {
                        internal!(
                            level = INFO,
                            zone = %self.zone.name,
                            exchange = %options.exchange,
                            %ip,
                            "Failed to connect using STARTTLS ({reason}), proceeding with plaintext"
                        );
                        self.tls_disabled.insert(ip);
                        plaintext_retry = true;
                    }
                    Err(AttemptError::Tls(reason)) => {
                        internal!(level = DEBUG, zone = %self.zone.name, %ip, "TLS failed again: {reason}");
                        index += 1;
                        plaintext_retry = false;
                    }
                    Err(AttemptError::Failed(err)) => {
                        internal!(
                            level = DEBUG,
                            zone = %self.zone.name,
                            exchange = %options.exchange,
                            %ip,
                            local_address = %options.local.address,
                            "Failed to connect: {err}"
                        );
                        index += 1;
                        plaintext_retry = false;
                    }
                }
            }
        }

        internal!(
            level = INFO,
            zone = %self.zone.name,
            domain = %delivery.domain,
            "Failed to connect to any MX server"
        );
        Err(DeliveryError::Exhausted {
            domain: delivery.domain.clone(),
        })
    }

    async fn attempt(&self, options: &ConnectOptions) -> Result<SmtpClient, AttemptError> {
        let timeouts = &self.timeouts;
        let remote = options.remote();
        let local = options.bind_address();

        let connecting = async {
            if options.secure {
                SmtpClient::connect_tls(remote, local, options.exchange.clone(), true).await
            } else {
                SmtpClient::connect(remote, local, options.exchange.clone()).await
            }
        };
        let mut client = timed("connect", timeouts.connect_secs, connecting)
            .await
            .map_err(AttemptError::Failed)?
            .with_transcript(self.transcript);

        let greeting = timed("greeting", timeouts.greeting_secs, client.read_greeting())
            .await
            .map_err(AttemptError::Failed)?;
        if !greeting.is_success() {
            return Err(AttemptError::Failed(DeliveryError::Rejected(greeting.reply())));
        }

        self.hello(&mut client, &options.name)
            .await
            .map_err(AttemptError::Failed)?;

        if options.require_tls && !client.is_tls() {
            self.upgrade(&mut client, &options.name).await?;
        }

        if let Some(auth) = &self.zone.auth {
            timed(
                "AUTH",
                timeouts.auth_secs,
                client.auth(self.zone.auth_method, &auth.user, &auth.pass),
            )
            .await
            .map_err(|err| match err {
                DeliveryError::Auth(_) => AttemptError::Auth(err),
                other => AttemptError::Failed(other),
            })?;
        }

        Ok(client)
    }

    /// EHLO, falling back to HELO when EHLO is refused outright.
    async fn hello(&self, client: &mut SmtpClient, name: &str) -> Result<(), DeliveryError> {
        let ehlo = timed("EHLO", self.timeouts.ehlo_secs, client.ehlo(name)).await?;
        if ehlo.is_success() {
            return Ok(());
        }
        if !ehlo.is_permanent_error() {
            return Err(DeliveryError::Rejected(ehlo.reply()));
        }

        let helo = timed("HELO", self.timeouts.ehlo_secs, client.helo(name)).await?;
        if helo.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Rejected(helo.reply()))
        }
    }

    async fn upgrade(&self, client: &mut SmtpClient, name: &str) -> Result<(), AttemptError> {
        if !client.supports("STARTTLS") {
            return Err(AttemptError::Tls("STARTTLS not advertised".to_string()));
        }

        let response = tokio::time::timeout(
            Duration::from_secs(self.timeouts.starttls_secs),
            client.starttls(),
        )
        .await
        .map_err(|_| AttemptError::Tls("STARTTLS timed out".to_string()))?
        .map_err(|err| {
            if err.is_tls() {
                AttemptError::Tls(err.to_string())
            } else {
                AttemptError::Failed(err.into())
            }
        })?;

        if !response.is_success() {
            return Err(AttemptError::Tls(format!(
                "STARTTLS refused: {}",
                response.reply()
            )));
        }

        self.hello(client, name).await.map_err(AttemptError::Failed)
    }
}
