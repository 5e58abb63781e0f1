use async_trait::async_trait;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;
use tracing::debug;

/// Resolver turns a SOCKS4a HOSTNAME into an IPv4 address.
///
/// `None` means the name could not be resolved, for whatever reason.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, hostname: &str) -> Option<Ipv4Addr>;
}

/// SystemResolver uses the operating system resolver through tokio, which
/// runs the lookup on the blocking pool instead of the reactor
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

#[async_trait]
impl Resolver for SystemResolver {
    async fn resolve(&self, hostname: &str) -> Option<Ipv4Addr> {
        // Port is irrelevant, lookup_host just needs one
        let addrs = match tokio::net::lookup_host((hostname, 0)).await {
            Ok(addrs) => addrs,
            Err(e) => {
                debug!("lookup of {hostname} failed: {e}");
                return None;
            }
        };

        // SOCKS4 can only carry IPv4
        addrs.into_iter().find_map(|addr| match addr.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(_) => None,
        })
    }
}

/// resolve_with_timeout bounds a lookup by `limit`; running out of time
/// counts as unresolved
pub async fn resolve_with_timeout(
    resolver: &dyn Resolver,
    hostname: &str,
    limit: Duration,
) -> Option<Ipv4Addr> {
    match tokio::time::timeout(limit, resolver.resolve(hostname)).await {
        Ok(ip) => ip,
        Err(_) => {
            debug!("lookup of {hostname} timed out after {limit:?}");
            None
        }
    }
}
