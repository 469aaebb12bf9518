//! Convenience HTTP/2 client over the fragmenting dialer.
//!
//! Just enough surface for "fetch this URL through the bypass": parse,
//! dial with ALPN `h2`, drive one request, collect the body. Anything
//! fancier belongs to the caller's own HTTP stack, parameterised with
//! [`TlsDialer::dial_tls`] as its connect function.

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::{HeaderMap, ACCEPT};
use hyper::{Method, Request, StatusCode, Version};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use tokio::time::Instant;
use tracing::trace;
use url::{Host, Url};

use crate::dialer::{default_dialer, TlsDialer};
use crate::error::{Error, Result};
use crate::protocols::tls::{h2_client_config, FragmentedTlsStream};

/// A collected HTTP/2 response.
pub struct Response {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP/2 GET client bound to a [`TlsDialer`].
#[derive(Clone)]
pub struct Client {
    dialer: TlsDialer,
}

impl Client {
    /// Client over the process-wide default dialer.
    pub fn new() -> Self {
        Self {
            dialer: default_dialer().clone(),
        }
    }

    pub fn with_dialer(dialer: TlsDialer) -> Self {
        Self { dialer }
    }

    /// Fetch an `https://` URL through the fragmenting stack.
    pub async fn get(&self, url: &str, deadline: Option<Instant>) -> Result<Response> {
        let url = parse_https_url(url)?;
        let host = url_host(&url)?;
        let port = url.port().unwrap_or(443);

        let tls = self
            .dialer
            .dial_tls(&host, port, h2_client_config(), deadline)
            .await?;
        get_via(tls, &url, deadline).await
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

/// One-shot GET through the default client.
pub async fn get(url: &str) -> Result<Response> {
    Client::new().get(url, None).await
}

/// Drive a single GET over an already-established TLS connection. Used
/// by [`Client::get`] and by callers that dialed a fixed address
/// themselves.
pub async fn get_via(
    stream: FragmentedTlsStream,
    url: &Url,
    deadline: Option<Instant>,
) -> Result<Response> {
    let (mut sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .handshake(TokioIo::new(stream))
        .await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            trace!("http2 connection closed: {err:?}");
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .version(Version::HTTP_2)
        .header(ACCEPT, "*/*")
        .body(Empty::<Bytes>::new())?;

    let exchange = async {
        let response = sender.send_request(request).await?;
        let (parts, body) = response.into_parts();
        let body = body.collect().await?.to_bytes();
        Ok::<_, Error>(Response {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    };
    match deadline {
        Some(at) => tokio::time::timeout_at(at, exchange)
            .await
            .map_err(|_| Error::HandshakeTimeout)?,
        None => exchange.await,
    }
}

pub(crate) fn parse_https_url(url: &str) -> Result<Url> {
    let parsed = Url::parse(url).map_err(|_| Error::InvalidUrl(url.to_string()))?;
    if parsed.scheme() != "https" {
        return Err(Error::InvalidUrl(url.to_string()));
    }
    Ok(parsed)
}

/// Host portion of a URL in the form SNI and certificate checks expect:
/// bare hostname or IP literal, no brackets.
pub(crate) fn url_host(url: &Url) -> Result<String> {
    match url.host() {
        Some(Host::Domain(domain)) => Ok(domain.to_string()),
        Some(Host::Ipv4(ip)) => Ok(ip.to_string()),
        Some(Host::Ipv6(ip)) => Ok(ip.to_string()),
        None => Err(Error::InvalidUrl(url.to_string())),
    }
}
