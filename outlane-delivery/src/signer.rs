//! DKIM signing seam
//!
//! The queue precomputes the body hash and hands over the keys; the engine
//! only asks a [`Signer`] for the header value and prepends it.

use outlane_queue::{Delivery, DkimKey, Headers};

pub trait Signer: Send + Sync {
    /// The `DKIM-Signature` header value for `headers`, or `None` when this
    /// key cannot sign them. `None` is not an error, the message just goes
    /// out without that signature.
    fn sign(&self, headers: &Headers, hash_algo: &str, body_hash: &str, key: &DkimKey)
    -> Option<String>;
}

/// Never signs.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSigner;

impl Signer for NoopSigner {
    fn sign(&self, _: &Headers, _: &str, _: &str, _: &DkimKey) -> Option<String> {
        None
    }
}

/// Prepends one `DKIM-Signature` per key that produced a signature.
///
/// Keys are applied last to first so the first key's signature ends up on
/// top. Returns how many signatures were added.
pub fn sign_delivery(signer: &dyn Signer, delivery: &mut Delivery) -> usize {
    let Some(dkim) = delivery.dkim.clone() else {
        return 0;
    };

    let mut added = 0;
    for key in dkim.keys.iter().rev() {
        if let Some(value) = signer
            .sign(&delivery.headers, &dkim.hash_algo, &dkim.body_hash, key)
            .filter(|value| !value.trim().is_empty())
        {
            delivery
                .headers
                .add_formatted("DKIM-Signature", &format!("DKIM-Signature: {value}"), 0);
            added += 1;
        }
    }
    added
}
