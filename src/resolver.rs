//! Hostname resolution for the wake target
//!
//! Resolution happens fresh on every request. Nothing is cached, so a changed
//! DNS record is picked up by the next request.

use crate::error::ResolveError;
use futures::future::BoxFuture;
use std::net::IpAddr;
use std::time::Duration;

/// Source of host lookups.
///
/// Returns the raw address strings for a hostname in resolver order.
pub trait Resolve: Send + Sync {
    fn lookup_host<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, std::io::Result<Vec<String>>>;
}

/// Resolver backed by the operating system (`getaddrinfo`)
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemResolver;

impl Resolve for SystemResolver {
    fn lookup_host<'a>(&'a self, hostname: &'a str) -> BoxFuture<'a, std::io::Result<Vec<String>>> {
        Box::pin(async move {
            let addrs = tokio::net::lookup_host((hostname, 0)).await?;
            Ok(addrs.map(|addr| addr.ip().to_string()).collect())
        })
    }
}

/// Resolve `hostname` and return the first address
pub async fn resolve_first(resolver: &dyn Resolve, hostname: &str) -> Result<IpAddr, ResolveError> {
    let addrs = resolver
        .lookup_host(hostname)
        .await
        .map_err(|source| ResolveError::Lookup {
            host: hostname.to_string(),
            source,
        })?;

    let first = addrs
        .first()
        .ok_or_else(|| ResolveError::NotFound(hostname.to_string()))?;

    first
        .parse()
        .map_err(|_| ResolveError::InvalidAddress(first.clone()))
}

/// [`resolve_first`] bounded by `timeout`
pub async fn resolve_with_timeout(
    resolver: &dyn Resolve,
    hostname: &str,
    timeout: Duration,
) -> Result<IpAddr, ResolveError> {
    match tokio::time::timeout(timeout, resolve_first(resolver, hostname)).await {
        Ok(result) => result,
        Err(_) => Err(ResolveError::TimedOut {
            host: hostname.to_string(),
            timeout,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Resolver that answers every lookup with a fixed list
    struct StaticResolver(Vec<&'static str>);

    impl Resolve for StaticResolver {
        fn lookup_host<'a>(&'a self, _hostname: &'a str) -> BoxFuture<'a, std::io::Result<Vec<String>>> {
            let addrs: Vec<String> = self.0.iter().map(|s| s.to_string()).collect();
            Box::pin(async move { Ok(addrs) })
        }
    }

    struct FailingResolver;

    impl Resolve for FailingResolver {
        fn lookup_host<'a>(&'a self, _hostname: &'a str) -> BoxFuture<'a, std::io::Result<Vec<String>>> {
            Box::pin(async { Err::<Vec<String>, _>(std::io::Error::other("no such host")) })
        }
    }

    struct HangingResolver;

    impl Resolve for HangingResolver {
        fn lookup_host<'a>(&'a self, _hostname: &'a str) -> BoxFuture<'a, std::io::Result<Vec<String>>> {
            Box::pin(futures::future::pending::<std::io::Result<Vec<String>>>())
        }
    }

    #[tokio::test]
    async fn test_returns_first_address() {
        let resolver = StaticResolver(vec!["192.168.1.20", "192.168.1.21"]);
        let ip = resolve_first(&resolver, "nas.lan").await.unwrap();
        assert_eq!(ip, "192.168.1.20".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn test_ipv6_address() {
        let resolver = StaticResolver(vec!["fe80::1"]);
        let ip = resolve_first(&resolver, "nas.lan").await.unwrap();
        assert!(ip.is_ipv6());
    }

    #[tokio::test]
    async fn test_zero_addresses_is_not_found() {
        let resolver = StaticResolver(vec![]);
        let err = resolve_first(&resolver, "nas.lan").await.unwrap_err();
        assert!(matches!(err, ResolveError::NotFound(ref host) if host == "nas.lan"));
    }

    #[tokio::test]
    async fn test_non_ip_first_entry_is_invalid() {
        let resolver = StaticResolver(vec!["nas.lan", "192.168.1.20"]);
        let err = resolve_first(&resolver, "nas.lan").await.unwrap_err();
        assert!(matches!(err, ResolveError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_lookup_failure() {
        let err = resolve_first(&FailingResolver, "nas.lan").await.unwrap_err();
        assert!(matches!(err, ResolveError::Lookup { .. }));
        assert!(err.to_string().contains("no such host"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = resolve_with_timeout(&HangingResolver, "nas.lan", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_system_resolver_ip_literal() {
        let ip = resolve_first(&SystemResolver, "127.0.0.1").await.unwrap();
        assert_eq!(ip, "127.0.0.1".parse::<IpAddr>().unwrap());
    }
}
