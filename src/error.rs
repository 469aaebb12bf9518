use std::io;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the fragmenting dialer and the resolver stack.
///
/// The resolver pool and the dialer recover locally by iterating endpoints
/// and addresses; only final exhaustion (`NoResolverAvailable`,
/// `NoTlsConnection`) or a deadline reaches the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    #[error("invalid server name {0:?}")]
    InvalidServerName(String),

    #[error("invalid url {0:?}")]
    InvalidUrl(String),

    #[error("handshake deadline exceeded")]
    HandshakeTimeout,

    /// Every configured resolver endpoint failed to produce an answer.
    #[error("no dns resolver available")]
    NoResolverAvailable,

    /// A lookup produced zero addresses for the requested host.
    #[error("empty host address")]
    EmptyHostAddress,

    /// Every resolved address failed the TLS handshake.
    #[error("no tls connection")]
    NoTlsConnection,

    /// The DoH server answered with a non-zero DNS status.
    #[error("doh status {status}: {comment}")]
    DohStatus { status: u32, comment: String },

    #[error("http: {0}")]
    Http(#[from] hyper::Error),

    #[error("request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("yaml config: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("json config: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Whether the error is worth retrying on another endpoint or address.
    ///
    /// Deadline expiry is final: it short-circuits iteration in the pool
    /// and the dialer.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::HandshakeTimeout)
    }
}
