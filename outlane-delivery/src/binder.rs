//! Picks the local address a delivery is sent from
//!
//! The choice depends only on the delivery identity and the address family,
//! so retries of a delivery always come from the same local identity while
//! different deliveries spread over the pool.

use sha2::{Digest, Sha256};

use crate::config::PoolAddress;

fn slot(key: &str, len: usize) -> usize {
    let digest = Sha256::digest(key.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);

    // `len` is a pool size, the remainder always fits
    usize::try_from(hash % len as u64).unwrap_or_default()
}

/// The pool entry for `key` (`id.seq`) when connecting to an IPv6 (or IPv4)
/// remote.
///
/// Entries of the wrong family are skipped; when none of the right family
/// exist any entry is used. Returns `None` only for an empty pool.
#[must_use]
pub fn bind<'a>(pool: &'a [PoolAddress], key: &str, ipv6: bool) -> Option<&'a PoolAddress> {
    let family: Vec<&PoolAddress> = pool
        .iter()
        .filter(|entry| entry.address.is_ipv6() == ipv6)
        .collect();

    if family.is_empty() {
        pool.get(slot(key, pool.len().max(1)))
    } else {
        family.get(slot(key, family.len())).copied()
    }
}
