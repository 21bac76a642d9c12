#![allow(dead_code, clippy::expect_used, clippy::unwrap_used)]

pub mod mock_server;
pub mod resolver;

use std::{net::IpAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use outlane_delivery::{
    BounceNotice, BounceNotifier, DeliveryConfig, MemoryBodySource, PoolAddress, Sender,
    Services, SmtpTimeouts, ThrottleGate, ZoneConfig,
};
use outlane_queue::{Delivery, Headers, MemoryQueue};
use parking_lot::Mutex;

use self::resolver::ScriptedResolver;

pub const LOCALHOST: IpAddr = IpAddr::V4(std::net::Ipv4Addr::LOCALHOST);

/// Keeps every notice it is handed.
#[derive(Default)]
pub struct RecordingNotifier {
    notices: Mutex<Vec<BounceNotice>>,
}

impl RecordingNotifier {
    pub fn notices(&self) -> Vec<BounceNotice> {
        self.notices.lock().clone()
    }
}

#[async_trait]
impl BounceNotifier for RecordingNotifier {
    async fn notify(&self, notice: BounceNotice) {
        self.notices.lock().push(notice);
    }
}

/// A zone sending from 127.0.0.1 as `mta.test` to `port`, with short timeouts.
pub fn zone(port: u16) -> ZoneConfig {
    ZoneConfig {
        port,
        connections: 1,
        pool: vec![PoolAddress::new(LOCALHOST, "mta.test")],
        ..ZoneConfig::named("default")
    }
}

pub fn config() -> DeliveryConfig {
    DeliveryConfig {
        hostname: "mta.test".to_string(),
        log_mx: true,
        timeouts: SmtpTimeouts {
            connect_secs: 2,
            greeting_secs: 2,
            ehlo_secs: 2,
            starttls_secs: 2,
            auth_secs: 2,
            mail_from_secs: 2,
            rcpt_to_secs: 2,
            data_secs: 2,
            quit_secs: 1,
        },
        ..DeliveryConfig::default()
    }
}

/// A resolver routing `example.com` to `mx.test` at 127.0.0.1.
pub fn resolver() -> ScriptedResolver {
    ScriptedResolver::new()
        .with_mx("example.com", &[("mx.test", 10)])
        .with_ips("mx.test", &[LOCALHOST])
}

pub fn delivery(seq: &str, recipient: &str) -> Delivery {
    let mut headers = Headers::new();
    headers.add("From", "Sender <sender@example.net>");
    headers.add("To", recipient);
    headers.add("Subject", "Quarterly report");
    Delivery::new("18c4a1f2", seq, "sender@example.net", recipient)
        .with_headers(headers)
        .with_body_size(30)
}

/// Everything a sender under test talks to.
pub struct Harness {
    pub queue: Arc<MemoryQueue>,
    pub bodies: MemoryBodySource,
    pub notifier: Arc<RecordingNotifier>,
    pub resolver: Arc<ScriptedResolver>,
    pub services: Services,
}

impl Harness {
    pub fn new(resolver: ScriptedResolver) -> Self {
        let queue = Arc::new(MemoryQueue::new());
        let bodies = MemoryBodySource::new();
        bodies.insert("18c4a1f2", "Numbers are up this quarter.\r\n");
        let notifier = Arc::new(RecordingNotifier::default());
        let resolver = Arc::new(resolver);

        let services = Services::new(queue.clone(), resolver.clone(), Arc::new(bodies.clone()))
            .with_notifier(notifier.clone());

        Self {
            queue,
            bodies,
            notifier,
            resolver,
            services,
        }
    }

    pub fn sender(&self, zone: ZoneConfig) -> Sender {
        Sender::new(
            Arc::new(zone),
            Arc::new(config()),
            self.services.clone(),
            Arc::new(ThrottleGate::new()),
        )
    }

    /// Queues `delivery` and runs one attempt on it.
    pub async fn deliver_one(&self, sender: &Sender, delivery: Delivery) {
        use outlane_queue::QueueAuthority;

        self.queue.push("default", delivery);
        let checked_out = self
            .queue
            .get("default")
            .await
            .unwrap()
            .expect("delivery queued");
        sender.deliver(checked_out).await.unwrap();
    }

    /// Polls until `check` holds, for at most five seconds.
    pub async fn wait_for(&self, check: impl Fn(&MemoryQueue) -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !check(&self.queue) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }
}

/// A local port nothing is listening on.
pub async fn closed_port() -> u16 {
    let listener = tokio::net::TcpListener::bind((LOCALHOST, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}
