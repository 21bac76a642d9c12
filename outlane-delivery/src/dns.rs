//! DNS resolution for mail delivery.
//!
//! The engine only needs two questions answered: which exchanges accept mail
//! for a domain, and which addresses an exchange has. [`MailResolver`] is the
//! seam; [`DnsResolver`] answers it with hickory and caches MX answers.
//!
//! # Caching Strategy
//!
//! - **DNS TTL by default**: Uses the actual TTL from DNS records
//! - **Bounded TTLs**: Applies min (60s) and max (3600s) bounds to prevent extremes
//! - **Optional override**: `cache_ttl_secs` config can override DNS TTL for all entries
//! - **Lock-free**: `DashMap` provides concurrent access without mutex contention

use std::{
    net::IpAddr,
    sync::Arc,
    time::{Duration, Instant},
};

use async_trait::async_trait;
use dashmap::DashMap;
use hickory_resolver::{
    TokioResolver,
    config::{ResolverConfig, ResolverOpts},
    name_server::TokioConnectionProvider,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur during DNS resolution.
#[derive(Debug, Error)]
pub enum DnsError {
    /// No MX, A, or AAAA records found for the name.
    #[error("No records found for {0}")]
    NoRecords(String),

    /// DNS query failed due to network or resolver issues.
    #[error("DNS lookup failed: {0}")]
    LookupFailed(#[from] hickory_resolver::ResolveError),
}

/// Configuration for DNS resolver.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DnsConfig {
    /// DNS query timeout in seconds (default: 5)
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Cache TTL override in seconds (optional)
    /// If set, overrides the DNS record's TTL for all cached entries
    #[serde(default)]
    pub cache_ttl_secs: Option<u64>,

    /// Minimum cache TTL in seconds (default: 60 = 1 minute)
    #[serde(default = "default_min_cache_ttl_secs")]
    pub min_cache_ttl_secs: u64,

    /// Maximum cache TTL in seconds (default: 3600 = 1 hour)
    #[serde(default = "default_max_cache_ttl_secs")]
    pub max_cache_ttl_secs: u64,
}

const fn default_timeout_secs() -> u64 {
    5
}

const fn default_min_cache_ttl_secs() -> u64 {
    60 // 1 minute
}

const fn default_max_cache_ttl_secs() -> u64 {
    3600 // 1 hour
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            cache_ttl_secs: None,
            min_cache_ttl_secs: default_min_cache_ttl_secs(),
            max_cache_ttl_secs: default_max_cache_ttl_secs(),
        }
    }
}

/// A mail exchange candidate and its preference (lower is tried first).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exchange {
    pub exchange: String,
    pub priority: u16,
}

impl Exchange {
    #[must_use]
    pub fn new(exchange: impl Into<String>, priority: u16) -> Self {
        Self {
            exchange: exchange.into(),
            priority,
        }
    }
}

/// Answers the DNS questions delivery needs.
#[async_trait]
pub trait MailResolver: Send + Sync {
    /// Exchanges for `domain`, ordered by priority.
    ///
    /// A domain without MX records yields itself as the only exchange
    /// (RFC 5321 implicit MX), provided it has an address record.
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsError>;

    /// Every A and AAAA address of `host`.
    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError>;
}

#[derive(Debug, Clone)]
struct CachedResult {
    exchanges: Arc<Vec<Exchange>>,
    expires_at: Instant,
}

/// Hickory-backed resolver with concurrent MX caching.
#[derive(Debug)]
pub struct DnsResolver {
    resolver: TokioResolver,
    cache: DashMap<String, CachedResult>,
    config: DnsConfig,
}

impl DnsResolver {
    /// Creates a resolver from the system configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the system DNS configuration cannot be loaded.
    pub fn new(config: DnsConfig) -> Result<Self, DnsError> {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(config.timeout_secs);

        let resolver = TokioResolver::builder(TokioConnectionProvider::default())?
            .with_options(opts)
            .build();

        Ok(Self {
            resolver,
            cache: DashMap::new(),
            config,
        })
    }

    /// Creates a resolver talking to explicitly configured name servers.
    #[must_use]
    pub fn with_resolver_config(
        resolver_config: ResolverConfig,
        opts: ResolverOpts,
        config: DnsConfig,
    ) -> Self {
        let resolver =
            TokioResolver::builder_with_config(resolver_config, TokioConnectionProvider::default())
                .with_options(opts)
                .build();

        Self {
            resolver,
            cache: DashMap::new(),
            config,
        }
    }

    async fn resolve_mx_uncached(&self, domain: &str) -> Result<(Vec<Exchange>, u32), DnsError> {
        match self.resolver.mx_lookup(domain).await {
            Ok(mx_lookup) => {
                let min_ttl = mx_lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(hickory_resolver::proto::rr::Record::ttl)
                    .min()
                    .unwrap_or(300);

                let mut exchanges: Vec<Exchange> = mx_lookup
                    .iter()
                    .map(|mx| {
                        let host = mx.exchange().to_utf8();
                        Exchange::new(host.trim_end_matches('.'), mx.preference())
                    })
                    .collect();

                if exchanges.is_empty() {
                    debug!("MX lookup returned no records, falling back to A/AAAA");
                    return self.implicit_mx(domain).await;
                }

                exchanges.sort_by_key(|exchange| exchange.priority);
                debug!(
                    "Resolved {} MX record(s) for {domain} with TTL {min_ttl}s",
                    exchanges.len()
                );
                Ok((exchanges, min_ttl))
            }
            Err(err) if err.is_no_records_found() => {
                debug!("No MX records found for {domain}, falling back to A/AAAA");
                self.implicit_mx(domain).await
            }
            Err(err) => {
                warn!("MX lookup failed for {domain}: {err}");
                Err(DnsError::LookupFailed(err))
            }
        }
    }

    /// The domain itself stands in as an exchange when it has addresses.
    async fn implicit_mx(&self, domain: &str) -> Result<(Vec<Exchange>, u32), DnsError> {
        match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => {
                #[allow(clippy::redundant_closure_for_method_calls)]
                let min_ttl = lookup
                    .as_lookup()
                    .records()
                    .iter()
                    .map(|r| r.ttl())
                    .min()
                    .unwrap_or(300);

                if lookup.iter().next().is_none() {
                    return Err(DnsError::NoRecords(domain.to_string()));
                }
                Ok((vec![Exchange::new(domain, 0)], min_ttl))
            }
            Err(err) if err.is_no_records_found() => Err(DnsError::NoRecords(domain.to_string())),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}

#[async_trait]
impl MailResolver for DnsResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsError> {
        if let Some(cached) = self.cache.get(domain) {
            if cached.expires_at > Instant::now() {
                debug!("Cache hit for {domain}, {} exchange(s)", cached.exchanges.len());
                return Ok(cached.exchanges.as_ref().clone());
            }
            debug!("Cache entry expired for {domain}");
        }

        let (exchanges, dns_ttl) = self.resolve_mx_uncached(domain).await?;
        let exchanges = Arc::new(exchanges);

        let cache_ttl = self.config.cache_ttl_secs.unwrap_or_else(|| {
            u64::from(dns_ttl).clamp(
                self.config.min_cache_ttl_secs,
                self.config.max_cache_ttl_secs,
            )
        });

        self.cache.insert(
            domain.to_string(),
            CachedResult {
                exchanges: Arc::clone(&exchanges),
                expires_at: Instant::now() + Duration::from_secs(cache_ttl),
            },
        );

        Ok(exchanges.as_ref().clone())
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        if let Ok(ip) = host.parse::<IpAddr>() {
            return Ok(vec![ip]);
        }

        match self.resolver.lookup_ip(host).await {
            Ok(lookup) => Ok(lookup.iter().collect()),
            Err(err) if err.is_no_records_found() => Err(DnsError::NoRecords(host.to_string())),
            Err(err) => Err(DnsError::LookupFailed(err)),
        }
    }
}
