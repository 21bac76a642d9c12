//! The delivery loop run by each worker of a zone
//!
//! A sender checks one delivery out of the queue authority at a time, tries
//! to hand it to the recipient's exchange and reports exactly one outcome
//! back: RELEASE on success, DEFER for a transient failure, or RELEASE
//! followed by BOUNCE for a permanent one.

use std::{
    io::Cursor,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use chrono::Utc;
use outlane_common::internal;
use outlane_queue::{Bounce, Delivery, QueueAuthority};
use outlane_tracing::traced;
use tokio::{io::AsyncReadExt, sync::Notify};

use crate::{
    body::BodySource,
    classifier::{self, Action},
    config::{DeliveryConfig, ZoneConfig},
    dns::MailResolver,
    error::{DeliveryError, SenderError},
    hooks::{DeliveryHooks, NoHooks},
    negotiator::Negotiator,
    notice::{BounceNotice, BounceNotifier, LogNotifier},
    received::received_header,
    response::format_smtp_response,
    route::RouteResolver,
    signer::{self, NoopSigner, Signer},
    throttle::ThrottleGate,
};

/// Cap on the idle backoff multiplier.
const MAX_IDLE_STEPS: u32 = 1000;

/// How long to wait before polling again after `empty` empty GETs in a row.
///
/// Grows quadratically, in steps of 10ms, up to 10 seconds.
#[must_use]
pub fn idle_backoff(empty: u32) -> Duration {
    let steps = empty.saturating_mul(empty).min(MAX_IDLE_STEPS);
    Duration::from_millis(u64::from(steps) * 10)
}

/// The collaborators a sender talks to.
#[derive(Clone)]
pub struct Services {
    pub authority: Arc<dyn QueueAuthority>,
    pub resolver: Arc<dyn MailResolver>,
    pub body: Arc<dyn BodySource>,
    pub hooks: Arc<dyn DeliveryHooks>,
    pub signer: Arc<dyn Signer>,
    pub notifier: Arc<dyn BounceNotifier>,
}

impl Services {
    /// Services without hooks, signing or notification delivery.
    #[must_use]
    pub fn new(
        authority: Arc<dyn QueueAuthority>,
        resolver: Arc<dyn MailResolver>,
        body: Arc<dyn BodySource>,
    ) -> Self {
        Self {
            authority,
            resolver,
            body,
            hooks: Arc::new(NoHooks),
            signer: Arc::new(NoopSigner),
            notifier: Arc::new(LogNotifier),
        }
    }

    #[must_use]
    pub fn with_hooks(mut self, hooks: Arc<dyn DeliveryHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    #[must_use]
    pub fn with_signer(mut self, signer: Arc<dyn Signer>) -> Self {
        self.signer = signer;
        self
    }

    #[must_use]
    pub fn with_notifier(mut self, notifier: Arc<dyn BounceNotifier>) -> Self {
        self.notifier = notifier;
        self
    }
}

/// Asks one or more senders to stop after their current delivery.
#[derive(Debug, Clone, Default)]
pub struct CloseHandle {
    closed: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CloseHandle {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolves once [`close`](Self::close) has been called.
    pub async fn closed(&self) {
        loop {
            let notified = self.notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

/// One worker of a zone.
pub struct Sender {
    zone: Arc<ZoneConfig>,
    config: Arc<DeliveryConfig>,
    services: Services,
    throttle: Arc<ThrottleGate>,
    negotiator: Negotiator,
    close: CloseHandle,
    empty_polls: u32,
}

impl Sender {
    #[must_use]
    pub fn new(
        zone: Arc<ZoneConfig>,
        config: Arc<DeliveryConfig>,
        services: Services,
        throttle: Arc<ThrottleGate>,
    ) -> Self {
        let routes = Arc::new(RouteResolver::new(
            services.resolver.clone(),
            services.hooks.clone(),
        ));
        let negotiator = Negotiator::new(
            zone.clone(),
            routes,
            services.hooks.clone(),
            config.timeouts.clone(),
            zone.transcript(config.log_mx),
        );

        Self {
            zone,
            config,
            services,
            throttle,
            negotiator,
            close: CloseHandle::new(),
            empty_polls: 0,
        }
    }

    /// Shares the close signal with an existing handle, so one handle can
    /// stop a group of senders.
    #[must_use]
    pub fn with_close_handle(mut self, close: CloseHandle) -> Self {
        self.close = close;
        self
    }

    #[must_use]
    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    /// Stops taking new work once the current delivery is reported.
    pub fn close(&self) {
        self.close.close();
    }

    #[must_use]
    pub const fn negotiator(&self) -> &Negotiator {
        &self.negotiator
    }

    /// Runs deliveries until closed.
    ///
    /// # Errors
    ///
    /// Returns [`SenderError::Authority`] as soon as the queue authority
    /// fails a GET or a status update. The state of the delivery in hand is
    /// unknown at that point, so no further work is taken.
    #[traced(instrument(level = tracing::Level::TRACE, skip_all, fields(zone = %self.zone.name)))]
    pub async fn run(&mut self) -> Result<(), SenderError> {
        internal!(level = DEBUG, zone = %self.zone.name, "Sender started");

        while !self.close.is_closed() {
            let next = self
                .services
                .authority
                .get(&self.zone.name)
                .await
                .inspect_err(|err| {
                    internal!(level = ERROR, zone = %self.zone.name, "Failed to fetch work: {err}");
                })?;

            let Some(delivery) = next else {
                self.empty_polls = self.empty_polls.saturating_add(1);
                let delay = idle_backoff(self.empty_polls);
                tracing::trace!(
                    zone = %self.zone.name,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Queue empty"
                );

                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.close.closed() => {}
                }
                continue;
            };

            self.empty_polls = 0;
            self.deliver(delivery).await?;

            // Give other workers on this runtime a turn between deliveries.
            tokio::task::yield_now().await;
        }

        internal!(level = DEBUG, zone = %self.zone.name, "Sender closed");
        Ok(())
    }

    /// Attempts one delivery and reports the outcome to the authority.
    ///
    /// # Errors
    ///
    /// Only a failed status update escapes; every delivery failure is
    /// turned into a DEFER or a BOUNCE.
    #[traced(instrument(level = tracing::Level::INFO, skip_all, fields(zone = %self.zone.name, id = %delivery.id, seq = %delivery.seq, domain = %delivery.domain)), timing(precision = "ms"))]
    pub async fn deliver(&self, mut delivery: Delivery) -> Result<(), SenderError> {
        self.throttle
            .wait(&self.zone.name, self.zone.throttling)
            .await;

        let mut session = match self.negotiator.connect(&delivery).await {
            Ok(session) => session,
            Err(err) => {
                self.stamp(&mut delivery, &self.config.hostname);
                return self.handle_failure(&delivery, &err).await;
            }
        };

        self.stamp(&mut delivery, session.exchange());
        signer::sign_delivery(self.services.signer.as_ref(), &mut delivery);

        if let Err(veto) = self.services.hooks.pre_send(&mut delivery).await {
            session.close(&self.config.timeouts).await;
            return self
                .handle_failure(&delivery, &DeliveryError::Vetoed(veto.0))
                .await;
        }

        let result = match self.services.body.fetch(&delivery.id).await {
            Ok(body) => {
                // The headers already carry the Received line.
                let headers = delivery.headers.build();
                let size = headers.len() as u64 + delivery.body_size;
                let content = Cursor::new(headers).chain(body);

                session
                    .send(
                        &delivery.from,
                        &delivery.recipient,
                        size,
                        content,
                        &self.config.timeouts,
                    )
                    .await
            }
            Err(err) => Err(DeliveryError::Body(err.to_string())),
        };

        let exchange = session.exchange().to_string();
        let ip = session.ip();
        session.close(&self.config.timeouts).await;

        match result {
            Ok(response) => {
                internal!(
                    level = INFO,
                    zone = %self.zone.name,
                    id = %delivery.id,
                    seq = %delivery.seq,
                    recipient = %delivery.recipient,
                    %exchange,
                    %ip,
                    response = %format_smtp_response(&response),
                    "ACCEPTED"
                );
                self.services
                    .authority
                    .release(&delivery.lease())
                    .await
                    .inspect_err(|err| self.fatal("RELEASE", &delivery, err))?;
                Ok(())
            }
            Err(err) => self.handle_failure(&delivery, &err).await,
        }
    }

    /// Prepends the Received header naming `by` as the receiving host.
    fn stamp(&self, delivery: &mut Delivery, by: &str) {
        let received = received_header(
            delivery,
            &self.config.hostname,
            &self.config.app_name,
            by,
            Utc::now(),
        );
        delivery.headers.add_formatted("Received", &received, 0);
    }

    async fn handle_failure(
        &self,
        delivery: &Delivery,
        err: &DeliveryError,
    ) -> Result<(), SenderError> {
        let raw = err.response();
        let response = format_smtp_response(&raw);
        let classification = classifier::classify(&raw, delivery.deferred_count);
        let category = classification.category;

        match classification.action {
            Action::Defer => {
                let ttl = classifier::retry_delay(delivery.deferred_count);
                internal!(
                    level = INFO,
                    zone = %self.zone.name,
                    id = %delivery.id,
                    seq = %delivery.seq,
                    recipient = %delivery.recipient,
                    domain = %delivery.domain,
                    category,
                    %response,
                    retry_minutes = ttl.as_secs() / 60,
                    "DEFERRED[{category}]"
                );
                self.services
                    .authority
                    .defer(&delivery.lease(), ttl)
                    .await
                    .inspect_err(|err| self.fatal("DEFER", delivery, err))?;
            }
            Action::Reject => {
                internal!(
                    level = INFO,
                    zone = %self.zone.name,
                    id = %delivery.id,
                    seq = %delivery.seq,
                    recipient = %delivery.recipient,
                    domain = %delivery.domain,
                    category,
                    %response,
                    "REJECTED[{category}]"
                );
                self.services
                    .authority
                    .release(&delivery.lease())
                    .await
                    .inspect_err(|err| self.fatal("RELEASE", delivery, err))?;

                let now = Utc::now();
                let bounce =
                    Bounce::for_delivery(delivery, category, response, now.timestamp_millis());
                self.services
                    .authority
                    .bounce(&bounce)
                    .await
                    .inspect_err(|err| self.fatal("BOUNCE", delivery, err))?;

                if let Some(notice) = BounceNotice::compose(&bounce, &self.config.bounces, now) {
                    self.services.notifier.notify(notice).await;
                }
            }
        }

        Ok(())
    }

    fn fatal(&self, command: &str, delivery: &Delivery, err: &outlane_queue::QueueError) {
        internal!(
            level = ERROR,
            zone = %self.zone.name,
            id = %delivery.id,
            seq = %delivery.seq,
            "{command} failed, stopping sender: {err}"
        );
    }
}
