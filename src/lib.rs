//! TLS with a fragmented ClientHello, plus the resolver to bootstrap it.
//!
//! SNI-based DPI reads the head of a connection's first TCP segment to
//! find the hostname in the cleartext ClientHello. This crate splits the
//! first handshake record into two valid TLS records flushed as separate
//! writes, so a stateless inspector never sees enough of the SNI to
//! match it, while any conformant server reassembles the handshake
//! unchanged. DNS itself bootstraps through a pool of DoT/DoH upstreams
//! dialed with the same split, so a poisoned or blocked OS resolver is
//! never on the path.
//!
//! ```no_run
//! # async fn run() -> tlsfrag::Result<()> {
//! let response = tlsfrag::http2::get("https://huggingface.co/").await?;
//! println!("{}", response.status);
//! # Ok(())
//! # }
//! ```
//!
//! The pieces compose in layers: [`FragmentStream`] splits the first
//! flight, [`FragmentingConnector`] runs handshakes over it, the
//! [`ResolverPool`] health-tracks upstream endpoints, [`DnsResolver`]
//! fronts the pools, and [`TlsDialer`] ties resolution and the
//! fragmented handshake together for arbitrary destinations.

pub mod config;
pub mod dialer;
pub mod error;
pub mod http2;
pub mod net;
pub mod protocols;

pub use config::DnsConfig;
pub use dialer::{default_dialer, TlsDialer, TlsDialerBuilder};
pub use error::{Error, Result};
pub use protocols::dns::{
    configure, default_resolver, ipv4_servers, ipv6_servers, DnsResolver, ResolverPool,
};
pub use protocols::tls::{
    default_client_config, h2_client_config, insecure_client_config, FragmentStream,
    FragmentedTlsStream, FragmentingConnector, DEFAULT_FIRST_FRAGMENT_LEN,
};
