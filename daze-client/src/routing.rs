/// Routing engine: classify a destination as DIRECT, TUNNELED, or
/// TRY_DIRECT_ELSE_TUNNELED from a CIDR table built out of a country's IPv4
/// allocations in an APNIC-style delegation registry.
use ipnet::Ipv4Net;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// The outcome of classifying one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Direct,
    Tunneled,
    TryDirectElseTunneled,
}

/// Immutable once built; reading it concurrently from many sessions needs
/// no locking, and nothing is ever added to it after construction.
pub struct Router {
    cidrs: Vec<Ipv4Net>,
}

impl Router {
    /// Build the CIDR table from the raw registry text, keeping only the
    /// rows for `country`'s IPv4 allocations (lines of the form
    /// `apnic|<CC>|ipv4|<base>|<count>|...`). `count` is only meaningful
    /// for power-of-two block sizes, which the registry guarantees for
    /// these rows.
    pub fn from_registry_text(text: &str, country: &str) -> Self {
        let prefix = format!("apnic|{}|ipv4|", country);
        let mut cidrs = Vec::new();

        for line in text.lines() {
            let Some(rest) = line.strip_prefix(&prefix) else {
                continue;
            };
            let mut fields = rest.split('|');
            let Some(base) = fields.next() else { continue };
            let Some(count_str) = fields.next() else { continue };
            let Ok(base_ip) = base.parse::<Ipv4Addr>() else {
                continue;
            };
            let Ok(count) = count_str.parse::<u32>() else {
                continue;
            };
            if count == 0 || !count.is_power_of_two() {
                continue;
            }
            let prefix_len = 32 - count.trailing_zeros();
            if let Ok(net) = Ipv4Net::new(base_ip, prefix_len as u8) {
                cidrs.push(net.trunc());
            }
        }

        Self { cidrs }
    }

    /// `host` is either an IP literal or a DNS name, already split from its
    /// port by the caller.
    pub async fn classify(&self, host: &str) -> Decision {
        let ip = if let Ok(ip) = host.parse::<IpAddr>() {
            Some(ip)
        } else {
            resolve_one(host).await
        };

        match ip {
            None => Decision::TryDirectElseTunneled,
            Some(ip) if is_private(&ip) => Decision::Direct,
            Some(IpAddr::V4(v4)) => {
                if self.cidrs.iter().any(|net| net.contains(&v4)) {
                    Decision::Direct
                } else {
                    Decision::Tunneled
                }
            }
            Some(IpAddr::V6(_)) => Decision::Tunneled,
        }
    }
}

/// Resolve one `A`/`AAAA` record via the system resolver. Returns `None` on
/// any failure — the caller treats that as "resolution failed" and falls
/// back to trying a direct connection before tunneling.
async fn resolve_one(host: &str) -> Option<IpAddr> {
    let addrs = tokio::net::lookup_host((host, 0)).await.ok()?;
    addrs.map(|sockaddr| sockaddr.ip()).next()
}

fn is_private(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_private() || v4.is_loopback() || v4.is_link_local(),
        IpAddr::V6(v6) => is_private_v6(v6),
    }
}

fn is_private_v6(v6: &Ipv6Addr) -> bool {
    if v6.is_loopback() || v6.is_unspecified() {
        return true;
    }
    // Unique local addresses, fc00::/7.
    matches!(v6.segments()[0] & 0xfe00, 0xfc00)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REGISTRY: &str = "\
apnic|CN|ipv4|1.0.1.0|256|20110414|allocated
apnic|CN|ipv4|1.0.2.0|512|20110414|allocated
apnic|JP|ipv4|1.0.64.0|1024|20110414|allocated
apnic|CN|ipv4|36.112.0.0|1048576|20110414|allocated
";

    #[test]
    fn test_builds_only_target_country_rows() {
        let router = Router::from_registry_text(SAMPLE_REGISTRY, "CN");
        assert_eq!(router.cidrs.len(), 3);
    }

    #[test]
    fn test_mask_length_from_count() {
        let router = Router::from_registry_text(SAMPLE_REGISTRY, "CN");
        let net = router
            .cidrs
            .iter()
            .find(|n| n.addr() == "1.0.1.0".parse::<Ipv4Addr>().unwrap())
            .unwrap();
        assert_eq!(net.prefix_len(), 24); // 32 - log2(256)
    }

    #[tokio::test]
    async fn test_ip_in_table_is_direct() {
        let router = Router::from_registry_text(SAMPLE_REGISTRY, "CN");
        assert_eq!(router.classify("1.0.1.37").await, Decision::Direct);
    }

    #[tokio::test]
    async fn test_ip_outside_table_is_tunneled() {
        let router = Router::from_registry_text(SAMPLE_REGISTRY, "CN");
        assert_eq!(router.classify("93.184.216.34").await, Decision::Tunneled);
    }

    #[tokio::test]
    async fn test_private_ip_is_always_direct() {
        let router = Router::from_registry_text("", "CN");
        assert_eq!(router.classify("10.0.0.5").await, Decision::Direct);
        assert_eq!(router.classify("192.168.1.1").await, Decision::Direct);
        assert_eq!(router.classify("127.0.0.1").await, Decision::Direct);
    }

    #[tokio::test]
    async fn test_unresolvable_domain_is_try_direct_else_tunneled() {
        let router = Router::from_registry_text(SAMPLE_REGISTRY, "CN");
        let decision = router
            .classify("this-domain-should-not-resolve.invalid")
            .await;
        assert_eq!(decision, Decision::TryDirectElseTunneled);
    }
}
