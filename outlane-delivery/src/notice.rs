//! Bounce notifications for the original sender

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outlane_common::internal;
use outlane_queue::{Bounce, Headers};

use crate::config::BounceConfig;

/// A `Received` count above this means the message is looping.
pub const MAX_HOPS: usize = 25;

/// A composed failure notice, ready to be queued for delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BounceNotice {
    /// Envelope recipient: the original sender
    pub to: String,
    /// Zone the notice should be sent through
    pub zone: String,
    /// The full RFC 5322 message
    pub message: String,
}

impl BounceNotice {
    /// Composes the notice for `bounce`.
    ///
    /// Returns `None` when bounces are disabled, when the original message
    /// had a null sender, or when it already passed through more than
    /// [`MAX_HOPS`] hosts.
    #[must_use]
    pub fn compose(bounce: &Bounce, config: &BounceConfig, now: DateTime<Utc>) -> Option<Self> {
        if !config.enabled || bounce.from.trim().is_empty() {
            return None;
        }

        let hops = bounce.headers.count("received");
        if hops > MAX_HOPS {
            internal!(
                level = INFO,
                id = %bounce.id,
                seq = %bounce.seq,
                "Too many hops ({hops}), delivery loop detected, dropping bounce"
            );
            return None;
        }

        let daemon = &config.mailer_daemon;
        let host = daemon.address.rsplit_once('@').map_or("localhost", |(_, host)| host);

        let mut headers = Headers::new();
        headers.add("From", &format!("\"{}\" <{}>", daemon.name, daemon.address));
        headers.add("To", &bounce.from);
        headers.add("Subject", "Delivery Status Notification (Failure)");
        headers.add("Date", &now.to_rfc2822());
        headers.add("Message-ID", &format!("<{}@{host}>", ulid::Ulid::new()));
        headers.add("MIME-Version", "1.0");
        headers.add("Content-Type", "text/plain; charset=utf-8");
        headers.add("Content-Transfer-Encoding", "8bit");
        headers.add("X-Sending-Zone", &config.sending_zone);
        headers.add("X-Failed-Recipients", &bounce.to);
        headers.add("Auto-Submitted", "auto-replied");

        let original = String::from_utf8_lossy(&bounce.headers.build()).trim().to_string();
        let text = format!(
            "Delivery to the following recipient failed permanently:\n    {}\nTechnical details of permanent failure:\n{}\n\n\n----- Original message -----\n{original}\n\n----- Message truncated -----",
            bounce.to, bounce.response
        );

        let mut message = String::from_utf8_lossy(&headers.build()).into_owned();
        message.push_str(&text.replace('\n', "\r\n"));
        message.push_str("\r\n");

        Some(Self {
            to: bounce.from.clone(),
            zone: config.sending_zone.clone(),
            message,
        })
    }
}

/// Receives composed notices for delivery back to the sender.
#[async_trait]
pub trait BounceNotifier: Send + Sync {
    async fn notify(&self, notice: BounceNotice);
}

/// Logs notices instead of sending them.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl BounceNotifier for LogNotifier {
    async fn notify(&self, notice: BounceNotice) {
        internal!(
            level = INFO,
            to = %notice.to,
            zone = %notice.zone,
            bytes = notice.message.len(),
            "Bounce notification composed"
        );
    }
}
