use chrono::{DateTime, Utc};
use outlane_queue::Delivery;

/// Builds the `Received` trace header for a delivery attempt.
///
/// `by` is the exchange the message is handed to, or this host's name when
/// no session could be opened.
#[must_use]
pub fn received_header(
    delivery: &Delivery,
    hostname: &str,
    app_name: &str,
    by: &str,
    now: DateTime<Utc>,
) -> String {
    format!(
        "Received: from {app_name} ({hostname})\r\n by {by} with {app_name} id {}.{}\r\n for <{}>; {}",
        delivery.id,
        delivery.seq,
        delivery.recipient,
        now.to_rfc2822()
    )
}
