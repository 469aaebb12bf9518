//! Resilient resolution: the endpoint pool, the DoH client, the lookup
//! cache and the façade tying them together.
//!
//! Two process-wide pools ship preconfigured (IPv4 and IPv6 flavors of
//! the same public resolvers). [`configure`] merges user endpoints and
//! fallbacks into both; [`default_resolver`] is the façade over them.

mod cache;
mod doh;
mod pool;

use std::net::IpAddr;
use std::sync::{Arc, LazyLock};

use tokio::time::Instant;

pub use cache::{LookupCache, DEFAULT_LOOKUP_TTL};
pub use doh::{lookup_with_type as doh_lookup, DohAnswer, DohQuestion, DohResponse, RecordType};
pub use pool::{Endpoint, ResolverPool, DEFAULT_DIAL_TIMEOUT, DEFAULT_ENDPOINT_COOLDOWN};

use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::net;
use crate::protocols::tls::{FragmentedTlsStream, DEFAULT_FIRST_FRAGMENT_LEN};

/// Resolver façade: picks the address-family pool by probed IPv6
/// availability, tries DoH across its healthy endpoints and falls back
/// to the pool's static records.
#[derive(Clone)]
pub struct DnsResolver {
    ipv4: Arc<ResolverPool>,
    ipv6: Arc<ResolverPool>,
    first_fragment_len: u8,
}

impl DnsResolver {
    pub fn new(ipv4: Arc<ResolverPool>, ipv6: Arc<ResolverPool>) -> Self {
        Self {
            ipv4,
            ipv6,
            first_fragment_len: DEFAULT_FIRST_FRAGMENT_LEN,
        }
    }

    /// Resolve `host` to addresses. Never returns an empty `Ok`.
    pub async fn lookup(&self, host: &str, deadline: Option<Instant>) -> Result<Vec<IpAddr>> {
        let prefer_v6 = net::ipv6_available().await;
        self.lookup_with(prefer_v6, host, deadline).await
    }

    pub(crate) async fn lookup_with(
        &self,
        prefer_v6: bool,
        host: &str,
        deadline: Option<Instant>,
    ) -> Result<Vec<IpAddr>> {
        if host.is_empty() {
            return Err(Error::EmptyHostAddress);
        }
        let pool = if prefer_v6 { &self.ipv6 } else { &self.ipv4 };
        let addrs = pool.lookup_doh(deadline, host, prefer_v6).await?;
        if addrs.is_empty() {
            return Err(Error::NoResolverAvailable);
        }
        Ok(addrs)
    }

    /// Open a fragmented TLS connection to the first healthy upstream
    /// DoT endpoint. This is the dial hook for plugging the pool under a
    /// stub resolver.
    pub async fn dial_upstream(&self, deadline: Option<Instant>) -> Result<FragmentedTlsStream> {
        let pool = if net::ipv6_available().await {
            &self.ipv6
        } else {
            &self.ipv4
        };
        pool.dial_tls(deadline, self.first_fragment_len).await
    }

    pub fn ipv4_pool(&self) -> &Arc<ResolverPool> {
        &self.ipv4
    }

    pub fn ipv6_pool(&self) -> &Arc<ResolverPool> {
        &self.ipv6
    }
}

static IPV4_SERVERS: LazyLock<Arc<ResolverPool>> = LazyLock::new(|| Arc::new(pool::seeded_ipv4()));
static IPV6_SERVERS: LazyLock<Arc<ResolverPool>> = LazyLock::new(|| Arc::new(pool::seeded_ipv6()));

/// The preconfigured IPv4 pool.
pub fn ipv4_servers() -> Arc<ResolverPool> {
    IPV4_SERVERS.clone()
}

/// The preconfigured IPv6 pool.
pub fn ipv6_servers() -> Arc<ResolverPool> {
    IPV6_SERVERS.clone()
}

/// The process-wide resolver façade over the default pools.
pub fn default_resolver() -> &'static DnsResolver {
    static RESOLVER: LazyLock<DnsResolver> =
        LazyLock::new(|| DnsResolver::new(ipv4_servers(), ipv6_servers()));
    &RESOLVER
}

/// Merge user endpoints and fallbacks into both default pools. Meant to
/// run once at program start; calling it again with the same config is a
/// no-op.
pub fn configure(config: &DnsConfig) {
    ipv4_servers().add(config);
    ipv6_servers().add(config);
}
