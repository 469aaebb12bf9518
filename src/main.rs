use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing_subscriber::filter::EnvFilter;
use url::Url;

use tlsfrag::http2;
use tlsfrag::{
    default_client_config, insecure_client_config, DnsConfig, FragmentingConnector, TlsDialer,
    DEFAULT_FIRST_FRAGMENT_LEN,
};

/// Fetch an https URL through a fragmented TLS handshake.
#[derive(Parser, Debug)]
#[command(name = "tlsfrag", version, about)]
struct Args {
    /// The url to get
    #[arg(long, default_value = "https://huggingface.co/")]
    url: String,

    /// Dial this ip:port instead of resolving the url host
    #[arg(long)]
    dest: Option<String>,

    /// Skip certificate verification
    #[arg(long)]
    insecure: bool,

    /// Payload bytes of the first ClientHello record (0 disables the split)
    #[arg(long, default_value_t = DEFAULT_FIRST_FRAGMENT_LEN)]
    first_fragment_len: u8,

    /// Overall timeout in seconds
    #[arg(long, default_value_t = 60)]
    timeout: u64,

    /// Extra resolver config (yaml or json) merged into the default pools
    #[arg(long)]
    dns_config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let url = Url::parse(&args.url).context("invalid url")?;
    if url.scheme() != "https" {
        bail!("invalid url: only https is supported");
    }
    let host = url
        .host_str()
        .context("invalid url: missing host")?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();

    if let Some(path) = &args.dns_config {
        let config = DnsConfig::load(path).context("loading dns config")?;
        tlsfrag::configure(&config);
    }

    let deadline = Some(Instant::now() + Duration::from_secs(args.timeout));
    let mut tls_config = if args.insecure {
        insecure_client_config()
    } else {
        default_client_config()
    };
    tls_config.alpn_protocols = vec![b"h2".to_vec()];
    let tls_config = Arc::new(tls_config);

    let response = match &args.dest {
        // Fixed destination: skip resolution, SNI stays the url host.
        Some(dest) => {
            let tcp = TcpStream::connect(dest.as_str())
                .await
                .with_context(|| format!("connecting to {dest}"))?;
            let _ = tcp.set_nodelay(true);
            let connector = FragmentingConnector::new(tls_config, args.first_fragment_len);
            let tls = connector
                .connect_with_deadline(&host, tcp, deadline)
                .await
                .with_context(|| format!("tls handshake with {dest} as {host}"))?;
            http2::get_via(tls, &url, deadline).await?
        }
        None => {
            let dialer = TlsDialer::builder()
                .first_fragment_len(args.first_fragment_len)
                .build();
            let port = url.port().unwrap_or(443);
            let tls = dialer.dial_tls(&host, port, tls_config, deadline).await?;
            http2::get_via(tls, &url, deadline).await?
        }
    };

    if !response.status.is_success() {
        bail!("status code: {}", response.status);
    }
    std::io::stdout().write_all(&response.body)?;
    Ok(())
}
