//! Route resolution: recipient domain to exchanges, exchange to addresses

use std::{net::IpAddr, sync::Arc};

use outlane_common::internal;
use outlane_queue::Delivery;

use crate::{
    config::ZoneConfig,
    dns::{DnsError, Exchange, MailResolver},
    error::DeliveryError,
    hooks::DeliveryHooks,
};

pub struct RouteResolver {
    resolver: Arc<dyn MailResolver>,
    hooks: Arc<dyn DeliveryHooks>,
}

impl RouteResolver {
    #[must_use]
    pub fn new(resolver: Arc<dyn MailResolver>, hooks: Arc<dyn DeliveryHooks>) -> Self {
        Self { resolver, hooks }
    }

    /// Ordered exchanges for `delivery`.
    ///
    /// A zone with a smart host always routes to it. Otherwise the
    /// `route_override` hook is asked first and MX records are used when it
    /// has no opinion.
    ///
    /// # Errors
    ///
    /// [`DeliveryError::NoRoute`] when nothing was found or DNS failed, so the
    /// delivery is deferred. A hook veto is returned as
    /// [`DeliveryError::Vetoed`].
    pub async fn exchanges(
        &self,
        zone: &ZoneConfig,
        delivery: &Delivery,
    ) -> Result<Vec<Exchange>, DeliveryError> {
        if let Some(host) = &zone.host {
            return Ok(vec![Exchange::new(host.clone(), 0)]);
        }

        let exchanges = self
            .hooks
            .route_override(delivery)
            .await
            .map_err(|veto| DeliveryError::Vetoed(veto.0))?;
        if !exchanges.is_empty() {
            return Ok(exchanges);
        }

        match self.resolver.resolve_mx(&delivery.domain).await {
            Ok(exchanges) if !exchanges.is_empty() => Ok(exchanges),
            Ok(_) => Err(DeliveryError::NoRoute {
                domain: delivery.domain.clone(),
            }),
            Err(err) => {
                internal!(
                    level = DEBUG,
                    zone = %zone.name,
                    domain = %delivery.domain,
                    "MX resolution failed: {err}"
                );
                Err(DeliveryError::NoRoute {
                    domain: delivery.domain.clone(),
                })
            }
        }
    }

    /// Addresses of `exchange`, ordered by the zone's IPv6 policy.
    ///
    /// # Errors
    ///
    /// Returns the resolver's error.
    pub async fn addresses(
        &self,
        zone: &ZoneConfig,
        exchange: &str,
    ) -> Result<Vec<IpAddr>, DnsError> {
        let ips = match exchange.parse::<IpAddr>() {
            Ok(ip) => vec![ip],
            Err(_) => self.resolver.resolve_ip(exchange).await?,
        };
        Ok(order(ips, zone))
    }
}

/// Applies the IPv6 policy: dropped with `ignore_ipv6`, first with
/// `prefer_ipv6`, last otherwise. The order within a family is kept.
#[must_use]
pub fn order(ips: Vec<IpAddr>, zone: &ZoneConfig) -> Vec<IpAddr> {
    let (v6, v4): (Vec<IpAddr>, Vec<IpAddr>) = ips.into_iter().partition(IpAddr::is_ipv6);

    if zone.ignore_ipv6 {
        v4
    } else if zone.prefer_ipv6 {
        v6.into_iter().chain(v4).collect()
    } else {
        v4.into_iter().chain(v6).collect()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::hooks::{NoHooks, Veto};

    struct StaticResolver {
        mx: Option<Vec<Exchange>>,
        ips: Vec<IpAddr>,
    }

    #[async_trait]
    impl MailResolver for StaticResolver {
        async fn resolve_mx(&self, domain: &str) -> Result<Vec<Exchange>, DnsError> {
            self.mx
                .clone()
                .ok_or_else(|| DnsError::NoRecords(domain.to_string()))
        }

        async fn resolve_ip(&self, _host: &str) -> Result<Vec<IpAddr>, DnsError> {
            Ok(self.ips.clone())
        }
    }

    struct Override;

    #[async_trait]
    impl DeliveryHooks for Override {
        async fn route_override(&self, delivery: &Delivery) -> Result<Vec<Exchange>, Veto> {
            if delivery.domain == "blocked.example" {
                return Err(Veto::new("550 5.7.1 Domain blocked by policy"));
            }
            Ok(vec![Exchange::new("policy.example.net", 5)])
        }
    }

    fn resolver(mx: Option<Vec<Exchange>>, hooks: Arc<dyn DeliveryHooks>) -> RouteResolver {
        RouteResolver::new(
            Arc::new(StaticResolver {
                mx,
                ips: vec![
                    "2001:db8::1".parse().unwrap(),
                    "192.0.2.1".parse().unwrap(),
                    "2001:db8::2".parse().unwrap(),
                    "192.0.2.2".parse().unwrap(),
                ],
            }),
            hooks,
        )
    }

    fn delivery(recipient: &str) -> Delivery {
        Delivery::new("id", "001", "sender@example.net", recipient)
    }

    #[tokio::test]
    async fn smart_host_bypasses_lookup() {
        let routes = resolver(None, Arc::new(Override));
        let mut zone = ZoneConfig::named("relay");
        zone.host = Some("smtp.example.net".into());

        let exchanges = routes.exchanges(&zone, &delivery("a@example.com")).await.unwrap();
        assert_eq!(exchanges, vec![Exchange::new("smtp.example.net", 0)]);
    }

    #[tokio::test]
    async fn hook_routes_before_mx() {
        let routes = resolver(Some(vec![Exchange::new("mx.example.com", 10)]), Arc::new(Override));
        let zone = ZoneConfig::named("default");

        let exchanges = routes.exchanges(&zone, &delivery("a@example.com")).await.unwrap();
        assert_eq!(exchanges, vec![Exchange::new("policy.example.net", 5)]);

        let err = routes
            .exchanges(&zone, &delivery("a@blocked.example"))
            .await
            .unwrap_err();
        assert_eq!(err.response(), "550 5.7.1 Domain blocked by policy");
    }

    #[tokio::test]
    async fn mx_records_are_used() {
        let mx = vec![
            Exchange::new("mx1.example.com", 10),
            Exchange::new("mx2.example.com", 20),
        ];
        let routes = resolver(Some(mx.clone()), Arc::new(NoHooks));

        let exchanges = routes
            .exchanges(&ZoneConfig::named("default"), &delivery("a@example.com"))
            .await
            .unwrap();
        assert_eq!(exchanges, mx);
    }

    #[tokio::test]
    async fn missing_mx_is_a_temporary_routing_failure() {
        let zone = ZoneConfig::named("default");

        for mx in [None, Some(Vec::new())] {
            let routes = resolver(mx, Arc::new(NoHooks));
            let err = routes
                .exchanges(&zone, &delivery("a@example.com"))
                .await
                .unwrap_err();
            assert!(matches!(err, DeliveryError::NoRoute { .. }));
            assert_eq!(err.response(), "450 Can't find an MX server for example.com");
        }
    }

    #[tokio::test]
    async fn addresses_follow_the_ipv6_policy() {
        let routes = resolver(None, Arc::new(NoHooks));
        let mut zone = ZoneConfig::named("default");

        let ips = routes.addresses(&zone, "mx.example.com").await.unwrap();
        assert_eq!(
            ips,
            ["192.0.2.1", "192.0.2.2", "2001:db8::1", "2001:db8::2"]
                .map(|ip| ip.parse::<IpAddr>().unwrap())
                .to_vec()
        );

        zone.prefer_ipv6 = true;
        let ips = routes.addresses(&zone, "mx.example.com").await.unwrap();
        assert_eq!(ips[0], "2001:db8::1".parse::<IpAddr>().unwrap());
        assert_eq!(ips[2], "192.0.2.1".parse::<IpAddr>().unwrap());

        zone.ignore_ipv6 = true;
        let ips = routes.addresses(&zone, "mx.example.com").await.unwrap();
        assert!(ips.iter().all(IpAddr::is_ipv4));
        assert_eq!(ips.len(), 2);
    }

    #[tokio::test]
    async fn literal_exchanges_skip_resolution() {
        let routes = resolver(None, Arc::new(NoHooks));
        let ips = routes
            .addresses(&ZoneConfig::named("default"), "127.0.0.1")
            .await
            .unwrap();
        assert_eq!(ips, vec!["127.0.0.1".parse::<IpAddr>().unwrap()]);
    }
}
