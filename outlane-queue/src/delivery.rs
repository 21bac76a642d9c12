use serde::{Deserialize, Serialize};

use crate::headers::Headers;

/// A DKIM key the message should be signed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimKey {
    pub domain_name: String,
    pub key_selector: String,
    pub private_key: String,
}

/// Signing material attached to a delivery at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DkimData {
    pub hash_algo: String,
    /// Base64 body hash, computed once when the message was queued.
    pub body_hash: String,
    pub keys: Vec<DkimKey>,
}

/// The identity and lock of a checked out delivery.
///
/// Every status update must carry the lock unchanged; the authority rejects
/// updates whose lock no longer matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub seq: String,
    pub lock: String,
}

/// One recipient of one queued message, checked out for a send attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: String,
    pub seq: String,
    pub from: String,
    pub recipient: String,
    pub domain: String,
    pub headers: Headers,
    pub body_size: u64,
    pub dkim: Option<DkimData>,
    pub deferred_count: u32,
    pub lock: String,
    pub fbl: Option<String>,
}

impl Delivery {
    /// Creates an unlocked delivery, deriving the domain from the recipient.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        seq: impl Into<String>,
        from: impl Into<String>,
        recipient: impl Into<String>,
    ) -> Self {
        let recipient = recipient.into();
        Self {
            id: id.into(),
            seq: seq.into(),
            from: from.into(),
            domain: domain_of(&recipient),
            recipient,
            headers: Headers::new(),
            body_size: 0,
            dkim: None,
            deferred_count: 0,
            lock: String::new(),
            fbl: None,
        }
    }

    #[must_use]
    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    #[must_use]
    pub const fn with_body_size(mut self, body_size: u64) -> Self {
        self.body_size = body_size;
        self
    }

    #[must_use]
    pub fn with_dkim(mut self, dkim: DkimData) -> Self {
        self.dkim = Some(dkim);
        self
    }

    #[must_use]
    pub const fn with_deferred_count(mut self, deferred_count: u32) -> Self {
        self.deferred_count = deferred_count;
        self
    }

    #[must_use]
    pub fn with_fbl(mut self, fbl: impl Into<String>) -> Self {
        self.fbl = Some(fbl.into());
        self
    }

    /// `id.seq`, the identity used for logging and local address binding.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}.{}", self.id, self.seq)
    }

    #[must_use]
    pub fn lease(&self) -> Lease {
        Lease {
            id: self.id.clone(),
            seq: self.seq.clone(),
            lock: self.lock.clone(),
        }
    }
}

/// The lowercased part of an address after the last `@`.
#[must_use]
pub fn domain_of(address: &str) -> String {
    address
        .rsplit_once('@')
        .map_or(address, |(_, domain)| domain)
        .trim_end_matches('>')
        .to_ascii_lowercase()
}

/// A terminal failure, recorded by the authority for downstream notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bounce {
    pub id: String,
    pub from: String,
    pub to: String,
    pub seq: String,
    pub headers: Headers,
    pub return_path: String,
    pub category: String,
    /// Milliseconds since the Unix epoch.
    pub time: i64,
    pub response: String,
    pub fbl: Option<String>,
}

impl Bounce {
    /// Builds the bounce record for `delivery`.
    #[must_use]
    pub fn for_delivery(
        delivery: &Delivery,
        category: impl Into<String>,
        response: impl Into<String>,
        time: i64,
    ) -> Self {
        Self {
            id: delivery.id.clone(),
            from: delivery.from.clone(),
            to: delivery.recipient.clone(),
            seq: delivery.seq.clone(),
            headers: delivery.headers.clone(),
            return_path: delivery.from.clone(),
            category: category.into(),
            time,
            response: response.into(),
            fbl: delivery.fbl.clone(),
        }
    }
}
