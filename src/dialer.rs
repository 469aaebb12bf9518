//! The custom dialer for user traffic: resolve through the resilient
//! resolver (with an optional OS fallback), then connect each address in
//! order with the fragmented handshake, SNI set to the requested host.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_rustls::rustls::ClientConfig;
use tracing::debug;

use crate::error::{Error, Result};
use crate::protocols::dns::{default_resolver, DnsResolver, LookupCache, DEFAULT_LOOKUP_TTL};
use crate::protocols::tls::{
    connect_first_available, FragmentedTlsStream, FragmentingConnector, DEFAULT_FIRST_FRAGMENT_LEN,
};

/// Overall budget for one `dial_tls` call when the caller passes no
/// deadline: resolution plus every connect and handshake attempt.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(60);

/// Fragmenting TLS dialer with a positive lookup cache.
///
/// Successful dials hand the stream to the caller; every failure path
/// drops its transient sockets before the error is returned.
#[derive(Clone)]
pub struct TlsDialer {
    resolver: DnsResolver,
    cache: Arc<LookupCache>,
    first_fragment_len: u8,
    retry_unfragmented: bool,
    dial_timeout: Duration,
    os_fallback: bool,
}

impl TlsDialer {
    pub fn builder() -> TlsDialerBuilder {
        TlsDialerBuilder::default()
    }

    /// Resolve `host`, then TLS-connect `host:port` with the fragmented
    /// first flight. Addresses are tried in resolver order; per address
    /// an ordinary handshake is retried once on a fresh connection when
    /// `retry_unfragmented` is on. The last error wins if nothing does.
    pub async fn dial_tls(
        &self,
        host: &str,
        port: u16,
        tls_config: Arc<ClientConfig>,
        deadline: Option<Instant>,
    ) -> Result<FragmentedTlsStream> {
        if host.is_empty() {
            return Err(Error::EmptyHostAddress);
        }
        let deadline = Some(deadline.unwrap_or_else(|| Instant::now() + self.dial_timeout));

        let addrs = self.resolve(host, port, deadline).await?;
        let connector = FragmentingConnector::new(tls_config, self.first_fragment_len);
        connect_first_available(
            &connector,
            host,
            &addrs,
            port,
            self.retry_unfragmented,
            deadline,
        )
        .await
    }

    async fn resolve(
        &self,
        host: &str,
        port: u16,
        deadline: Option<Instant>,
    ) -> Result<Vec<std::net::IpAddr>> {
        if let Some(addrs) = self.cache.get(host) {
            return Ok(addrs);
        }
        let addrs = match self.resolver.lookup(host, deadline).await {
            Ok(addrs) => addrs,
            Err(err) if self.os_fallback && err.is_retryable() => {
                debug!(%host, "pool resolution failed ({err}), trying the os resolver");
                tokio::net::lookup_host((host, port))
                    .await?
                    .map(|sa| sa.ip())
                    .collect()
            }
            Err(err) => return Err(err),
        };
        if addrs.is_empty() {
            return Err(Error::EmptyHostAddress);
        }
        self.cache.set(host, addrs.clone());
        Ok(addrs)
    }

    pub fn first_fragment_len(&self) -> u8 {
        self.first_fragment_len
    }

    pub fn cache(&self) -> &LookupCache {
        &self.cache
    }
}

impl Default for TlsDialer {
    fn default() -> Self {
        Self::builder().build()
    }
}

/// Builder for [`TlsDialer`]; the defaults match the shipped singleton.
pub struct TlsDialerBuilder {
    resolver: Option<DnsResolver>,
    lookup_ttl: Duration,
    first_fragment_len: u8,
    retry_unfragmented: bool,
    dial_timeout: Duration,
    os_fallback: bool,
}

impl Default for TlsDialerBuilder {
    fn default() -> Self {
        Self {
            resolver: None,
            lookup_ttl: DEFAULT_LOOKUP_TTL,
            first_fragment_len: DEFAULT_FIRST_FRAGMENT_LEN,
            retry_unfragmented: true,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            os_fallback: true,
        }
    }
}

impl TlsDialerBuilder {
    pub fn resolver(mut self, resolver: DnsResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn lookup_ttl(mut self, ttl: Duration) -> Self {
        self.lookup_ttl = ttl;
        self
    }

    /// Payload bytes of the first ClientHello record. Zero disables the
    /// split.
    pub fn first_fragment_len(mut self, len: u8) -> Self {
        self.first_fragment_len = len;
        self
    }

    /// Whether to retry each address once with an ordinary handshake
    /// after a failed fragmented one. Accommodates servers and paths
    /// that reject record fragmentation.
    pub fn retry_unfragmented(mut self, retry: bool) -> Self {
        self.retry_unfragmented = retry;
        self
    }

    pub fn dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Whether to fall back to OS resolution when the resolver pool is
    /// exhausted.
    pub fn os_fallback(mut self, fallback: bool) -> Self {
        self.os_fallback = fallback;
        self
    }

    pub fn build(self) -> TlsDialer {
        TlsDialer {
            resolver: self.resolver.unwrap_or_else(|| default_resolver().clone()),
            cache: Arc::new(LookupCache::new(self.lookup_ttl)),
            first_fragment_len: self.first_fragment_len,
            retry_unfragmented: self.retry_unfragmented,
            dial_timeout: self.dial_timeout,
            os_fallback: self.os_fallback,
        }
    }
}

/// The process-wide dialer over the default resolver.
pub fn default_dialer() -> &'static TlsDialer {
    static DIALER: std::sync::LazyLock<TlsDialer> = std::sync::LazyLock::new(TlsDialer::default);
    &DIALER
}
