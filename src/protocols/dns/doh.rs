//! DoH client, JSON variant of RFC 8484.
//!
//! One lookup is one `GET <endpoint>?name=<host>&type=<id>` with
//! `accept: application/dns-json`, carried over HTTP/2 on a fragmented
//! TLS connection — the resolver protects its own upstream traffic with
//! the same ClientHello split it exists to provide.
//!
//! The DoH endpoint's own hostname is the one name this crate resolves
//! through the OS (the resolver's resolver), cached for an hour.
//! Endpoints given as IP-literal URLs skip that step entirely.

use std::net::IpAddr;
use std::sync::LazyLock;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::header::ACCEPT;
use hyper::{Method, Request, Version};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use serde::Deserialize;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};
use url::{Host, Url};

use super::cache::LookupCache;
use crate::error::{Error, Result};
use crate::protocols::tls::{
    connect_first_available, h2_client_config, FragmentedTlsStream, FragmentingConnector,
    DEFAULT_FIRST_FRAGMENT_LEN,
};

/// DNS record types the JSON answers are filtered to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordType {
    A,
    Aaaa,
}

impl RecordType {
    pub const fn code(self) -> u16 {
        match self {
            RecordType::A => 1,
            RecordType::Aaaa => 28,
        }
    }
}

/// JSON body of a DoH answer, Google/Cloudflare dialect.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DohResponse {
    #[serde(rename = "Status")]
    pub status: u32,
    #[serde(rename = "TC")]
    pub truncated: bool,
    #[serde(rename = "RD")]
    pub recursion_desired: bool,
    #[serde(rename = "RA")]
    pub recursion_available: bool,
    #[serde(rename = "AD")]
    pub authenticated_data: bool,
    #[serde(rename = "CD")]
    pub checking_disabled: bool,
    #[serde(rename = "Question")]
    pub question: Vec<DohQuestion>,
    #[serde(rename = "Answer")]
    pub answer: Vec<DohAnswer>,
    #[serde(rename = "Comment")]
    pub comment: String,
    pub edns_client_subnet: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DohQuestion {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DohAnswer {
    pub name: String,
    #[serde(rename = "type")]
    pub rtype: u16,
    #[serde(rename = "TTL")]
    pub ttl: u32,
    pub data: String,
}

impl DohResponse {
    /// A/AAAA answer data, in answer order. CNAME chains and anything
    /// else the server interleaves are skipped.
    pub fn addresses(&self) -> Vec<IpAddr> {
        self.answer
            .iter()
            .filter(|ans| {
                ans.rtype == RecordType::A.code() || ans.rtype == RecordType::Aaaa.code()
            })
            .filter_map(|ans| ans.data.parse().ok())
            .collect()
    }
}

static ENDPOINT_LOOKUPS: LazyLock<LookupCache> = LazyLock::new(LookupCache::default);

/// Resolve `host` against one DoH endpoint. Queries AAAA first when
/// `prefer_aaaa` is set and falls back to A on error or empty answer.
pub async fn lookup(
    endpoint: &str,
    host: &str,
    prefer_aaaa: bool,
    deadline: Option<Instant>,
) -> Result<Vec<IpAddr>> {
    let first = if prefer_aaaa { RecordType::Aaaa } else { RecordType::A };
    match lookup_with_type(endpoint, host, first, deadline).await {
        Ok(addrs) if !addrs.is_empty() => Ok(addrs),
        other if !prefer_aaaa => other,
        other => {
            if let Err(err) = &other {
                trace!(%host, "aaaa lookup failed ({err}), retrying with a records");
            }
            lookup_with_type(endpoint, host, RecordType::A, deadline).await
        }
    }
}

/// Single-shot DoH query for one record type.
pub async fn lookup_with_type(
    endpoint: &str,
    host: &str,
    rtype: RecordType,
    deadline: Option<Instant>,
) -> Result<Vec<IpAddr>> {
    let response = query(endpoint, host, rtype, deadline).await?;
    if response.status != 0 {
        return Err(Error::DohStatus {
            status: response.status,
            comment: response.comment,
        });
    }
    Ok(response.addresses())
}

async fn query(
    endpoint: &str,
    host: &str,
    rtype: RecordType,
    deadline: Option<Instant>,
) -> Result<DohResponse> {
    let mut url =
        Url::parse(endpoint).map_err(|_| Error::InvalidUrl(endpoint.to_string()))?;
    if url.scheme() != "https" {
        return Err(Error::InvalidUrl(endpoint.to_string()));
    }
    url.query_pairs_mut()
        .append_pair("name", host)
        .append_pair("type", &rtype.code().to_string());

    let tls = connect_endpoint(&url, deadline).await?;
    let (mut sender, conn) = hyper::client::conn::http2::Builder::new(TokioExecutor::new())
        .timer(TokioTimer::new())
        .handshake(TokioIo::new(tls))
        .await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            trace!("doh connection closed: {err:?}");
        }
    });

    let request = Request::builder()
        .method(Method::GET)
        .uri(url.as_str())
        .version(Version::HTTP_2)
        .header(ACCEPT, "application/dns-json")
        .body(Empty::<Bytes>::new())?;

    let exchange = async {
        let response = sender.send_request(request).await?;
        Ok::<_, Error>(response.into_body().collect().await?.to_bytes())
    };
    let body = match deadline {
        Some(at) => timeout_at(at, exchange)
            .await
            .map_err(|_| Error::HandshakeTimeout)??,
        None => exchange.await?,
    };

    Ok(serde_json::from_slice(&body)?)
}

/// Dial the DoH server itself: OS-resolved (and cached) for hostname
/// endpoints, direct for IP-literal endpoints, fragmented handshake with
/// one plain retry per address.
async fn connect_endpoint(
    url: &Url,
    deadline: Option<Instant>,
) -> Result<FragmentedTlsStream> {
    let port = url.port().unwrap_or(443);
    let (server_name, addrs) = match url.host() {
        Some(Host::Domain(domain)) => {
            let domain = domain.to_string();
            let addrs = match ENDPOINT_LOOKUPS.get(&domain) {
                Some(addrs) => addrs,
                None => {
                    let addrs: Vec<IpAddr> = tokio::net::lookup_host((domain.as_str(), port))
                        .await?
                        .map(|sa| sa.ip())
                        .collect();
                    debug!(host = %domain, count = addrs.len(), "resolved doh endpoint via os");
                    ENDPOINT_LOOKUPS.set(&domain, addrs.clone());
                    addrs
                }
            };
            (domain, addrs)
        }
        Some(Host::Ipv4(ip)) => (ip.to_string(), vec![IpAddr::V4(ip)]),
        Some(Host::Ipv6(ip)) => (ip.to_string(), vec![IpAddr::V6(ip)]),
        None => return Err(Error::InvalidUrl(url.to_string())),
    };

    let connector = FragmentingConnector::new(h2_client_config(), DEFAULT_FIRST_FRAGMENT_LEN);
    connect_first_available(&connector, &server_name, &addrs, port, true, deadline).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOGLE_ANSWER: &str = r#"{
        "Status": 0,
        "TC": false,
        "RD": true,
        "RA": true,
        "AD": false,
        "CD": false,
        "Question": [{"name": "huggingface.co.", "type": 1}],
        "Answer": [
            {"name": "huggingface.co.", "type": 5, "TTL": 300, "data": "cname.example."},
            {"name": "huggingface.co.", "type": 1, "TTL": 60, "data": "18.65.159.2"},
            {"name": "huggingface.co.", "type": 1, "TTL": 60, "data": "18.65.159.90"}
        ]
    }"#;

    #[test]
    fn decodes_a_google_style_answer() {
        let response: DohResponse = serde_json::from_str(GOOGLE_ANSWER).unwrap();
        assert_eq!(response.status, 0);
        assert!(!response.truncated);
        assert_eq!(response.question[0].rtype, RecordType::A.code());

        let addrs = response.addresses();
        assert_eq!(
            addrs,
            vec!["18.65.159.2".parse::<IpAddr>().unwrap(), "18.65.159.90".parse().unwrap()]
        );
    }

    #[test]
    fn cname_only_answers_yield_no_addresses() {
        let response: DohResponse = serde_json::from_str(
            r#"{"Status": 0, "Answer": [{"name": "a.", "type": 5, "TTL": 1, "data": "b."}]}"#,
        )
        .unwrap();
        assert!(response.addresses().is_empty());
    }

    #[test]
    fn aaaa_answers_parse_as_ipv6() {
        let response: DohResponse = serde_json::from_str(
            r#"{"Status": 0, "Answer": [{"name": "a.", "type": 28, "TTL": 1, "data": "2606:4700::6810:85e5"}]}"#,
        )
        .unwrap();
        let addrs = response.addresses();
        assert_eq!(addrs.len(), 1);
        assert!(addrs[0].is_ipv6());
    }

    #[test]
    fn missing_fields_default() {
        let response: DohResponse = serde_json::from_str(r#"{"Status": 0}"#).unwrap();
        assert!(response.answer.is_empty());
        assert!(response.comment.is_empty());
        assert!(response.addresses().is_empty());
    }

    #[test]
    fn non_zero_status_surfaces_the_comment() {
        let response: DohResponse = serde_json::from_str(
            r#"{"Status": 3, "Comment": "Name does not exist."}"#,
        )
        .unwrap();
        assert_eq!(response.status, 3);
        assert_eq!(response.comment, "Name does not exist.");
    }

    #[test]
    fn record_type_codes_match_the_registry() {
        assert_eq!(RecordType::A.code(), 1);
        assert_eq!(RecordType::Aaaa.code(), 28);
    }

    #[tokio::test]
    async fn rejects_non_https_endpoints() {
        let err = lookup_with_type("http://dns.google/resolve", "example.com", RecordType::A, None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidUrl(_)));
    }
}
