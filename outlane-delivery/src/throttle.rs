//! Per-zone throttling using the token bucket algorithm
//!
//! Every worker of a zone shares one bucket, so the configured rate bounds
//! the zone as a whole. Zones never wait on each other.
//!
//! # Token Bucket Algorithm
//!
//! - Tokens are added to the bucket at the zone's rate
//! - Each delivery attempt consumes one token
//! - The bucket holds a single token, so attempts are evenly spaced rather
//!   than bursting at the start of each interval

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::config::Throttle;

/// Answer of [`ThrottleGate::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Proceed,
    Wait(Duration),
}

#[derive(Debug)]
struct TokenBucket {
    /// Current number of tokens
    tokens: f64,
    /// Maximum tokens
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
    /// Last time tokens were added
    last_refill: Instant,
}

impl TokenBucket {
    fn new(throttle: Throttle) -> Self {
        Self {
            tokens: 1.0,
            capacity: 1.0,
            refill_rate: throttle.per_second(),
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();

        self.tokens = elapsed.mul_add(self.refill_rate, self.tokens).min(self.capacity);
        self.last_refill = now;
    }

    fn try_consume(&mut self) -> bool {
        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn time_until_available(&mut self) -> Duration {
        self.refill();

        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }

        let tokens_needed = 1.0 - self.tokens;
        Duration::from_secs_f64(tokens_needed / self.refill_rate)
    }
}

/// Rate limiter keyed by zone name
#[derive(Debug, Default)]
pub struct ThrottleGate {
    buckets: DashMap<String, Arc<Mutex<TokenBucket>>>,
}

impl ThrottleGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn bucket(&self, zone: &str, throttle: Throttle) -> Arc<Mutex<TokenBucket>> {
        self.buckets
            .entry(zone.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(TokenBucket::new(throttle))))
            .clone()
    }

    /// Takes an admission for `zone` if one is available.
    ///
    /// Zones without a rate are always admitted.
    pub fn admit(&self, zone: &str, throttle: Option<Throttle>) -> Admission {
        let Some(throttle) = throttle else {
            return Admission::Proceed;
        };

        let bucket = self.bucket(zone, throttle);
        let mut bucket = bucket.lock();

        if bucket.try_consume() {
            Admission::Proceed
        } else {
            Admission::Wait(bucket.time_until_available())
        }
    }

    /// Waits until `zone` may make another attempt.
    ///
    /// Throttling only ever delays the caller, it never fails.
    pub async fn wait(&self, zone: &str, throttle: Option<Throttle>) {
        while let Admission::Wait(delay) = self.admit(zone, throttle) {
            tracing::trace!(
                zone,
                wait_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Throttled"
            );
            tokio::time::sleep(delay.max(Duration::from_millis(1))).await;
        }
    }
}
