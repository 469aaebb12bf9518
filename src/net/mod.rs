//! Network odds and ends: the IPv6-availability latch and deadline-aware
//! TCP connects shared by the pool, the DoH client and the dialer.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::OnceCell;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::debug;

use crate::error::{Error, Result};

/// An IPv6-only host: the connect succeeding is the whole signal.
const PROBE_HOST: (&str, u16) = ("v6.ipv6-test.com", 80);
const PROBE_TIMEOUT: Duration = Duration::from_secs(4);

static IPV6_AVAILABLE: OnceCell<bool> = OnceCell::const_new();

/// Whether this host has working IPv6 connectivity. Probed once on first
/// use and latched for the process lifetime.
pub async fn ipv6_available() -> bool {
    *IPV6_AVAILABLE
        .get_or_init(|| async {
            let available = matches!(
                timeout(PROBE_TIMEOUT, TcpStream::connect(PROBE_HOST)).await,
                Ok(Ok(_))
            );
            debug!(available, "probed ipv6 availability");
            available
        })
        .await
}

/// TCP connect to a `host:port` string, bounded by `deadline`.
pub(crate) async fn tcp_connect(addr: &str, deadline: Option<Instant>) -> Result<TcpStream> {
    let stream = match deadline {
        Some(at) => timeout_at(at, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::HandshakeTimeout)??,
        None => TcpStream::connect(addr).await?,
    };
    // Back-to-back small writes must go out as distinct segments.
    let _ = stream.set_nodelay(true);
    Ok(stream)
}

/// TCP connect to a socket address, bounded by `deadline`.
pub(crate) async fn tcp_connect_addr(
    addr: SocketAddr,
    deadline: Option<Instant>,
) -> Result<TcpStream> {
    let stream = match deadline {
        Some(at) => timeout_at(at, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::HandshakeTimeout)??,
        None => TcpStream::connect(addr).await?,
    };
    let _ = stream.set_nodelay(true);
    Ok(stream)
}
