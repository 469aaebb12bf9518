//! Fragmenting TLS connector.
//!
//! Thin layer over `tokio_rustls::TlsConnector` that interposes a
//! [`FragmentStream`] between rustls and the transport, so the
//! ClientHello leaves the socket as two records. The plain variants wrap
//! the transport in an inert adapter instead, keeping one stream type for
//! callers that fall back to an ordinary handshake.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, LazyLock};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout_at, Instant};
use tokio_rustls::client::TlsStream;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{ring, verify_tls12_signature, verify_tls13_signature};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::debug;

use super::FragmentStream;
use crate::error::{Error, Result};

/// The stream type produced by [`FragmentingConnector`] over TCP.
pub type FragmentedTlsStream = TlsStream<FragmentStream<TcpStream>>;

/// TLS connector that performs the fragmented first-flight handshake.
#[derive(Clone)]
pub struct FragmentingConnector {
    connector: TlsConnector,
    first_fragment_len: u8,
}

impl FragmentingConnector {
    pub fn new(config: Arc<ClientConfig>, first_fragment_len: u8) -> Self {
        Self {
            connector: TlsConnector::from(config),
            first_fragment_len,
        }
    }

    pub fn first_fragment_len(&self) -> u8 {
        self.first_fragment_len
    }

    /// Fragmented handshake: the ClientHello record is split at
    /// `first_fragment_len` payload bytes and flushed as two writes.
    pub async fn connect<S>(&self, server_name: &str, stream: S) -> Result<TlsStream<FragmentStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = parse_server_name(server_name)?;
        let wrapped = FragmentStream::new(stream, self.first_fragment_len);
        Ok(self.connector.connect(name, wrapped).await?)
    }

    /// Ordinary handshake through an inert adapter. Used for the
    /// unfragmented retry against servers or paths that reject the split.
    pub async fn connect_plain<S>(
        &self,
        server_name: &str,
        stream: S,
    ) -> Result<TlsStream<FragmentStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let name = parse_server_name(server_name)?;
        let wrapped = FragmentStream::passthrough(stream);
        Ok(self.connector.connect(name, wrapped).await?)
    }

    /// Fragmented handshake bounded by `deadline`. Expiry aborts the
    /// in-flight handshake, closes the stream and surfaces
    /// [`Error::HandshakeTimeout`].
    pub async fn connect_with_deadline<S>(
        &self,
        server_name: &str,
        stream: S,
        deadline: Option<Instant>,
    ) -> Result<TlsStream<FragmentStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match deadline {
            Some(at) => timeout_at(at, self.connect(server_name, stream))
                .await
                .map_err(|_| Error::HandshakeTimeout)?,
            None => self.connect(server_name, stream).await,
        }
    }

    /// Plain-handshake counterpart of [`connect_with_deadline`].
    ///
    /// [`connect_with_deadline`]: Self::connect_with_deadline
    pub async fn connect_plain_with_deadline<S>(
        &self,
        server_name: &str,
        stream: S,
        deadline: Option<Instant>,
    ) -> Result<TlsStream<FragmentStream<S>>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        match deadline {
            Some(at) => timeout_at(at, self.connect_plain(server_name, stream))
                .await
                .map_err(|_| Error::HandshakeTimeout)?,
            None => self.connect_plain(server_name, stream).await,
        }
    }
}

/// Try each address in order: TCP connect, fragmented handshake, then —
/// when `retry_plain` — one ordinary handshake on a fresh connection.
/// First success wins. An expired deadline aborts the loop instead of
/// moving on to the next address.
pub(crate) async fn connect_first_available(
    connector: &FragmentingConnector,
    server_name: &str,
    addrs: &[IpAddr],
    port: u16,
    retry_plain: bool,
    deadline: Option<Instant>,
) -> Result<FragmentedTlsStream> {
    if addrs.is_empty() {
        return Err(Error::EmptyHostAddress);
    }
    let mut last_err = Error::NoTlsConnection;
    for &addr in addrs {
        if deadline.is_some_and(|at| at <= Instant::now()) {
            return Err(Error::HandshakeTimeout);
        }
        let peer = SocketAddr::new(addr, port);
        match connect_one(connector, server_name, peer, false, deadline).await {
            Ok(tls) => return Ok(tls),
            Err(Error::HandshakeTimeout) => return Err(Error::HandshakeTimeout),
            Err(err) => {
                debug!(addr = %peer, "fragmented handshake failed: {err}");
                last_err = err;
            }
        }
        if !retry_plain {
            continue;
        }
        match connect_one(connector, server_name, peer, true, deadline).await {
            Ok(tls) => return Ok(tls),
            Err(Error::HandshakeTimeout) => return Err(Error::HandshakeTimeout),
            Err(err) => {
                debug!(addr = %peer, "plain handshake failed: {err}");
                last_err = err;
            }
        }
    }
    Err(last_err)
}

async fn connect_one(
    connector: &FragmentingConnector,
    server_name: &str,
    peer: SocketAddr,
    plain: bool,
    deadline: Option<Instant>,
) -> Result<FragmentedTlsStream> {
    let tcp = crate::net::tcp_connect_addr(peer, deadline).await?;
    if plain {
        connector.connect_plain_with_deadline(server_name, tcp, deadline).await
    } else {
        connector.connect_with_deadline(server_name, tcp, deadline).await
    }
}

/// Shared client config for HTTP/2 connections (ALPN `h2`).
pub fn h2_client_config() -> Arc<ClientConfig> {
    static CONFIG: LazyLock<Arc<ClientConfig>> = LazyLock::new(|| {
        let mut config = default_client_config();
        config.alpn_protocols = vec![b"h2".to_vec()];
        Arc::new(config)
    });
    CONFIG.clone()
}

fn parse_server_name(name: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(name.to_string()).map_err(|_| Error::InvalidServerName(name.to_string()))
}

/// Client config with the platform trust store.
pub fn default_client_config() -> ClientConfig {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    if !native.errors.is_empty() {
        debug!(errors = native.errors.len(), "some native certificates failed to load");
    }
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth()
}

/// Client config that accepts any certificate. Signatures are still
/// checked against whatever certificate the server presents.
pub fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerification))
        .with_no_client_auth()
}

#[derive(Debug)]
struct NoVerification;

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &ring::default_provider().signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &ring::default_provider().signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::tls::{CONTENT_TYPE_HANDSHAKE, TLS_RECORD_HEADER_LEN};
    use tokio::io::AsyncReadExt;

    fn empty_roots_config() -> ClientConfig {
        ClientConfig::builder()
            .with_root_certificates(RootCertStore::empty())
            .with_no_client_auth()
    }

    async fn read_exactly(io: &mut (impl AsyncReadExt + Unpin), buf: &mut Vec<u8>, want: usize) {
        let mut tmp = [0u8; 4096];
        while buf.len() < want {
            let n = io.read(&mut tmp).await.expect("read client bytes");
            assert!(n > 0, "client closed before writing its first flight");
            buf.extend_from_slice(&tmp[..n]);
        }
    }

    #[tokio::test]
    async fn rustls_client_hello_leaves_as_two_records() {
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);

        let connector = FragmentingConnector::new(Arc::new(empty_roots_config()), 4);
        // The handshake cannot complete against a silent peer; it only has
        // to get far enough to emit the first flight.
        let handshake = tokio::spawn(async move {
            let _ = connector.connect("example.com", client_io).await;
        });

        let mut buf = Vec::new();
        read_exactly(&mut server_io, &mut buf, TLS_RECORD_HEADER_LEN).await;
        assert_eq!(buf[0], CONTENT_TYPE_HANDSHAKE);
        let first_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        assert_eq!(first_len, 4);

        let second_header = TLS_RECORD_HEADER_LEN + first_len;
        read_exactly(&mut server_io, &mut buf, second_header + TLS_RECORD_HEADER_LEN).await;
        assert_eq!(buf[second_header], CONTENT_TYPE_HANDSHAKE);
        assert_eq!(&buf[second_header + 1..second_header + 3], &buf[1..3]);

        let second_len =
            u16::from_be_bytes([buf[second_header + 3], buf[second_header + 4]]) as usize;
        let total = second_header + TLS_RECORD_HEADER_LEN + second_len;
        read_exactly(&mut server_io, &mut buf, total).await;

        // Reassembled payload is one ClientHello handshake message.
        let mut payload = buf[TLS_RECORD_HEADER_LEN..second_header].to_vec();
        payload.extend_from_slice(&buf[second_header + TLS_RECORD_HEADER_LEN..total]);
        assert_eq!(payload[0], 0x01, "handshake type must be ClientHello");
        let handshake_len =
            u32::from_be_bytes([0, payload[1], payload[2], payload[3]]) as usize;
        assert_eq!(handshake_len, payload.len() - 4);

        handshake.abort();
    }

    #[tokio::test]
    async fn plain_connect_emits_a_single_record_first() {
        let (client_io, mut server_io) = tokio::io::duplex(64 * 1024);

        let connector = FragmentingConnector::new(Arc::new(empty_roots_config()), 4);
        let handshake = tokio::spawn(async move {
            let _ = connector.connect_plain("example.com", client_io).await;
        });

        let mut buf = Vec::new();
        read_exactly(&mut server_io, &mut buf, TLS_RECORD_HEADER_LEN).await;
        assert_eq!(buf[0], CONTENT_TYPE_HANDSHAKE);
        let first_len = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        assert!(
            first_len > 4,
            "unfragmented ClientHello should be one full record, got {first_len}"
        );

        handshake.abort();
    }

    #[tokio::test]
    async fn expired_deadline_aborts_the_handshake() {
        let (client_io, _server_io) = tokio::io::duplex(64 * 1024);

        let connector = FragmentingConnector::new(Arc::new(empty_roots_config()), 4);
        let deadline = Some(Instant::now() + std::time::Duration::from_millis(20));
        let err = connector
            .connect_with_deadline("example.com", client_io, deadline)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::HandshakeTimeout));
    }

    #[test]
    fn rejects_unparseable_server_names() {
        assert!(matches!(
            parse_server_name("bad name with spaces"),
            Err(Error::InvalidServerName(_))
        ));
        assert!(parse_server_name("dns.google").is_ok());
        assert!(parse_server_name("8.8.8.8").is_ok());
    }
}
