//! Resolver endpoint pool.
//!
//! A pool maps logical resolver names (`dns.google`, also used as the
//! SNI when dialing that group) to ordered endpoint lists, plus a static
//! `hostname -> [ip]` fallback map consulted when every DoH endpoint has
//! failed. Endpoints carry a health flag: a failure takes the endpoint
//! out of rotation and a timer puts it back after the cooldown.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::time::Instant;
use tokio_rustls::rustls::ClientConfig;
use tracing::{debug, warn};

use super::doh;
use crate::config::DnsConfig;
use crate::error::{Error, Result};
use crate::net;
use crate::protocols::tls::{default_client_config, FragmentedTlsStream, FragmentingConnector};

/// How long a failed endpoint stays out of rotation.
pub const DEFAULT_ENDPOINT_COOLDOWN: Duration = Duration::from_secs(3600);

/// Per-endpoint dial budget for the DoT path.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(4);

const DOH_SCHEME_PREFIX: &str = "https://";

/// One reachable resolver address: `host-or-ip:port` for DoT or an
/// `https://...` URL for DoH. Created at configuration time; only the
/// health flag ever changes.
pub struct Endpoint {
    address: String,
    healthy: AtomicBool,
}

impl Endpoint {
    fn new(address: String) -> Arc<Self> {
        Arc::new(Self {
            address,
            healthy: AtomicBool::new(true),
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    pub fn is_doh(&self) -> bool {
        self.address.starts_with(DOH_SCHEME_PREFIX)
    }

    /// Take the endpoint out of rotation and re-enable it after the
    /// cooldown. A concurrent second suspension simply restarts the
    /// cooldown; the flag flips are idempotent.
    fn suspend(self: &Arc<Self>, cooldown: Duration) {
        self.healthy.store(false, Ordering::Relaxed);
        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(cooldown).await;
            endpoint.healthy.store(true, Ordering::Relaxed);
        });
    }
}

#[derive(Default)]
struct PoolInner {
    /// Group iteration order; insertion order of first sighting.
    order: Vec<String>,
    groups: HashMap<String, Vec<Arc<Endpoint>>>,
    fallbacks: HashMap<String, Vec<IpAddr>>,
}

/// Concurrent-read registry of upstream resolver endpoints.
///
/// `add` takes the write lock; lookups snapshot the endpoint `Arc`s under
/// a short read lock and do all their I/O with no lock held, flipping
/// health flags through the atomics.
pub struct ResolverPool {
    inner: RwLock<PoolInner>,
    cooldown: Duration,
    dial_timeout: Duration,
    tls_config: Arc<ClientConfig>,
}

impl ResolverPool {
    pub fn new() -> Self {
        Self::with_timeouts(DEFAULT_ENDPOINT_COOLDOWN, DEFAULT_DIAL_TIMEOUT)
    }

    pub fn with_timeouts(cooldown: Duration, dial_timeout: Duration) -> Self {
        Self {
            inner: RwLock::new(PoolInner::default()),
            cooldown,
            dial_timeout,
            tls_config: Arc::new(default_client_config()),
        }
    }

    fn seeded(groups: &[(&str, &[&str])]) -> Self {
        let pool = Self::new();
        {
            let mut inner = pool.inner.write();
            for (name, addrs) in groups {
                inner.order.push(name.to_string());
                inner.groups.insert(
                    name.to_string(),
                    addrs.iter().map(|a| Endpoint::new(a.to_string())).collect(),
                );
            }
        }
        pool
    }

    /// Merge `config` into the pool. Duplicate endpoint addresses within
    /// a group and duplicate fallback IPs per host are discarded, so the
    /// operation is idempotent. New group names are appended to the
    /// iteration order.
    pub fn add(&self, config: &DnsConfig) {
        let mut inner = self.inner.write();
        for (name, addrs) in &config.servers {
            if !inner.groups.contains_key(name) {
                inner.order.push(name.clone());
            }
            let group = inner.groups.entry(name.clone()).or_default();
            for addr in addrs {
                if !group.iter().any(|ep| ep.address == *addr) {
                    group.push(Endpoint::new(addr.clone()));
                }
            }
        }
        for (host, addrs) in &config.fallbacks {
            let entry = inner.fallbacks.entry(host.clone()).or_default();
            for addr in addrs {
                match addr.parse::<IpAddr>() {
                    Ok(ip) => {
                        if !entry.contains(&ip) {
                            entry.push(ip);
                        }
                    }
                    Err(_) => warn!(%host, %addr, "ignoring fallback that is not an ip literal"),
                }
            }
        }
    }

    fn snapshot(&self) -> Vec<(String, Vec<Arc<Endpoint>>)> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    inner.groups.get(name).cloned().unwrap_or_default(),
                )
            })
            .collect()
    }

    fn fallback_for(&self, host: &str) -> Option<Vec<IpAddr>> {
        self.inner
            .read()
            .fallbacks
            .get(host)
            .filter(|addrs| !addrs.is_empty())
            .cloned()
    }

    /// Budget for the next endpoint attempt: the per-endpoint dial
    /// timeout, capped by whatever remains of the caller's deadline.
    fn attempt_deadline(&self, deadline: Option<Instant>) -> Result<Instant> {
        let now = Instant::now();
        let capped = now + self.dial_timeout;
        match deadline {
            Some(at) if at <= now => Err(Error::HandshakeTimeout),
            Some(at) => Ok(capped.min(at)),
            None => Ok(capped),
        }
    }

    /// Open a TLS connection to the first healthy DoT endpoint, in
    /// declared group and endpoint order, with the fragmented handshake
    /// and SNI set to the group's logical name. Failing endpoints are
    /// suspended for the cooldown and iteration moves on.
    pub async fn dial_tls(
        &self,
        deadline: Option<Instant>,
        first_fragment_len: u8,
    ) -> Result<FragmentedTlsStream> {
        let connector = FragmentingConnector::new(self.tls_config.clone(), first_fragment_len);
        for (group, endpoints) in self.snapshot() {
            for endpoint in endpoints {
                if !endpoint.is_healthy() || endpoint.is_doh() {
                    continue;
                }
                let attempt = self.attempt_deadline(deadline)?;
                match self.dial_endpoint(&connector, &group, &endpoint, attempt).await {
                    Ok(tls) => return Ok(tls),
                    Err(err) => {
                        debug!(
                            %group,
                            endpoint = endpoint.address(),
                            "upstream dial failed: {err}"
                        );
                        endpoint.suspend(self.cooldown);
                    }
                }
            }
        }
        // Either the deadline ran out mid-iteration or everything failed.
        self.attempt_deadline(deadline)?;
        Err(Error::NoResolverAvailable)
    }

    async fn dial_endpoint(
        &self,
        connector: &FragmentingConnector,
        group: &str,
        endpoint: &Endpoint,
        attempt: Instant,
    ) -> Result<FragmentedTlsStream> {
        let tcp = net::tcp_connect(endpoint.address(), Some(attempt)).await?;
        connector.connect_with_deadline(group, tcp, Some(attempt)).await
    }

    /// Resolve `host` through the healthy DoH endpoints, in declared
    /// order; the first non-empty answer wins. An endpoint that errors
    /// or answers empty is suspended. With every DoH endpoint exhausted
    /// the static fallback map gets the last word.
    pub async fn lookup_doh(
        &self,
        deadline: Option<Instant>,
        host: &str,
        prefer_aaaa: bool,
    ) -> Result<Vec<IpAddr>> {
        let mut expired = false;
        'groups: for (_group, endpoints) in self.snapshot() {
            for endpoint in endpoints {
                if !endpoint.is_healthy() || !endpoint.is_doh() {
                    continue;
                }
                let attempt = match self.attempt_deadline(deadline) {
                    Ok(at) => at,
                    Err(_) => {
                        expired = true;
                        break 'groups;
                    }
                };
                match doh::lookup(endpoint.address(), host, prefer_aaaa, Some(attempt)).await {
                    Ok(addrs) if !addrs.is_empty() => return Ok(addrs),
                    Ok(_) => {
                        debug!(endpoint = endpoint.address(), %host, "doh answer was empty");
                        endpoint.suspend(self.cooldown);
                    }
                    Err(err) => {
                        debug!(endpoint = endpoint.address(), %host, "doh lookup failed: {err}");
                        endpoint.suspend(self.cooldown);
                    }
                }
            }
        }

        if let Some(addrs) = self.fallback_for(host) {
            return Ok(addrs);
        }
        if expired {
            return Err(Error::HandshakeTimeout);
        }
        Err(Error::NoResolverAvailable)
    }
}

impl Default for ResolverPool {
    fn default() -> Self {
        Self::new()
    }
}

/// Default upstreams, IPv4 flavor. Order is significant.
pub(super) const IPV4_DEFAULTS: &[(&str, &[&str])] = &[
    (
        "dot.sb",
        &[
            "185.222.222.222:853",
            "45.11.45.11:853",
            "https://doh.sb/dns-query",
        ],
    ),
    (
        "dns.google",
        &[
            "8.8.8.8:853",
            "8.8.4.4:853",
            "https://dns.google/resolve",
            "https://8.8.8.8/resolve",
            "https://8.8.4.4/resolve",
        ],
    ),
    (
        "cloudflare-dns.com",
        &[
            "1.1.1.1:853",
            "1.0.0.1:853",
            "https://cloudflare-dns.com/dns-query",
            "https://1.1.1.1/dns-query",
            "https://1.0.0.1/dns-query",
        ],
    ),
    ("dns.opendns.com", &["208.67.222.222:853", "208.67.220.220:853"]),
    ("dns10.quad9.net", &["9.9.9.10:853", "149.112.112.10:853"]),
];

/// Default upstreams, IPv6 flavor. Order is significant.
pub(super) const IPV6_DEFAULTS: &[(&str, &[&str])] = &[
    (
        "dot.sb",
        &["[2a09::]:853", "[2a11::]:853", "https://doh.sb/dns-query"],
    ),
    (
        "dns.google",
        &[
            "[2001:4860:4860::8888]:853",
            "[2001:4860:4860::8844]:853",
            "https://dns.google/resolve",
            "https://[2001:4860:4860::8888]/resolve",
            "https://[2001:4860:4860::8844]/resolve",
        ],
    ),
    (
        "cloudflare-dns.com",
        &[
            "[2606:4700:4700::1111]:853",
            "[2606:4700:4700::1001]:853",
            "https://cloudflare-dns.com/dns-query",
            "https://[2606:4700:4700::1111]/dns-query",
            "https://[2606:4700:4700::1001]/dns-query",
        ],
    ),
    (
        "dns.opendns.com",
        &["[2620:119:35::35]:853", "[2620:119:53::53]:853"],
    ),
    (
        "dns10.quad9.net",
        &["[2620:fe::10]:853", "[2620:fe::fe:10]:853"],
    ),
];

pub(super) fn seeded_ipv4() -> ResolverPool {
    ResolverPool::seeded(IPV4_DEFAULTS)
}

pub(super) fn seeded_ipv6() -> ResolverPool {
    ResolverPool::seeded(IPV6_DEFAULTS)
}
