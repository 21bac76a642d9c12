//! Scripted DNS answers

use std::{collections::HashMap, net::IpAddr};

use async_trait::async_trait;
use outlane_delivery::{DnsError, Exchange, MailResolver};
use parking_lot::Mutex;

/// Answers MX and address lookups from fixed tables and records every query.
#[derive(Default)]
pub struct ScriptedResolver {
    mx: HashMap<String, Vec<Exchange>>,
    ips: HashMap<String, Vec<IpAddr>>,
    queries: Mutex<Vec<String>>,
}

impl ScriptedResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_mx(mut self, domain: &str, exchanges: &[(&str, u16)]) -> Self {
        self.mx.insert(
            domain.to_string(),
            exchanges
                .iter()
                .map(|(host, priority)| Exchange::new(*host, *priority))
                .collect(),
        );
        self
    }

    #[must_use]
    pub fn with_ips(mut self, host: &str, ips: &[IpAddr]) -> Self {
        self.ips.insert(host.to_string(), ips.to_vec());
        self
    }

    /// Queries made so far, as `MX domain` or `A host`.
    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }
}

#[async_trait]
impl MailResolver for ScriptedResolver {
    async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsError> {
        self.queries.lock().push(format!("MX {domain}"));
        self.mx
            .get(domain)
            .cloned()
            .ok_or_else(|| DnsError::NoRecords(domain.to_string()))
    }

    async fn resolve_ip(&self, host: &str) -> Result<Vec<IpAddr>, DnsError> {
        self.queries.lock().push(format!("A {host}"));
        self.ips
            .get(host)
            .cloned()
            .ok_or_else(|| DnsError::NoRecords(host.to_string()))
    }
}
