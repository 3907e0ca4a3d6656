use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kadnode::config::{DEFAULT_ALPHA, DEFAULT_K, DEFAULT_PORT};
use kadnode::{Session, SessionConfig, SessionError, SessionHandle};

/// `KEY=VALUE` pair stored once the node is up.
#[derive(Clone, Debug)]
struct Put {
    key: String,
    value: String,
}

impl FromStr for Put {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (key, value) = s.split_once('=').context("expected KEY=VALUE")?;
        if key.is_empty() {
            anyhow::bail!("key must not be empty");
        }
        Ok(Put {
            key: key.to_string(),
            value: value.to_string(),
        })
    }
}

#[derive(Parser, Debug)]
#[command(name = "kadnode")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local address to listen on; repeat for one IPv4 and one IPv6 socket.
    #[arg(short, long = "listen", value_name = "ADDR")]
    listen: Vec<SocketAddr>,

    /// `host:port` of a node already in the network. Omit to start a new network.
    #[arg(short = 'B', long, value_name = "HOST:PORT")]
    bootstrap: Option<String>,

    #[arg(short, long, default_value_t = DEFAULT_K)]
    k: usize,

    #[arg(short, long, default_value_t = DEFAULT_ALPHA)]
    alpha: usize,

    /// Per-request timeout in milliseconds.
    #[arg(long, default_value = "500")]
    request_timeout_ms: u64,

    /// Store a value once joined.
    #[arg(long, value_name = "KEY=VALUE")]
    put: Vec<Put>,

    /// Look up a value once joined.
    #[arg(long, value_name = "KEY")]
    get: Vec<String>,

    /// Seconds between routing table status lines.
    #[arg(short, long, default_value = "300")]
    status_interval: u64,
}

impl Args {
    fn session_config(&self) -> SessionConfig {
        let listen = if self.listen.is_empty() {
            vec![SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT))]
        } else {
            self.listen.clone()
        };
        SessionConfig {
            listen,
            bootstrap: self.bootstrap.clone(),
            k: self.k,
            alpha: self.alpha,
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            ..SessionConfig::default()
        }
    }
}

async fn run_requests(handle: SessionHandle, puts: Vec<Put>, gets: Vec<String>) {
    for put in puts {
        match handle.save(put.key.as_bytes(), put.value.into_bytes()).await {
            Ok(report) => info!(
                key = %put.key,
                acknowledged = report.acknowledged,
                attempted = report.attempted,
                "value stored"
            ),
            Err(e) => warn!(key = %put.key, error = %e, "store failed"),
        }
    }
    for key in gets {
        match handle.load(key.as_bytes()).await {
            Ok(value) => info!(key = %key, value = %String::from_utf8_lossy(&value), "value found"),
            Err(e) => warn!(key = %key, error = %e, "lookup failed"),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let session = Session::bind(args.session_config())
        .await
        .context("failed to start session")?;
    let handle = session.handle();
    info!("Node identity: {}", handle.local_id());
    for addr in handle.local_addrs() {
        info!("Listening on {addr}");
    }

    let mut running = tokio::spawn(session.run());

    if !args.put.is_empty() || !args.get.is_empty() {
        // Give the bootstrap self-lookup a moment to fill the table.
        time::sleep(Duration::from_secs(1)).await;
        tokio::spawn(run_requests(handle.clone(), args.put.clone(), args.get.clone()));
    }

    let mut interval = time::interval(Duration::from_secs(args.status_interval.max(1)));
    interval.tick().await;

    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                handle.abort();
                break (&mut running).await.context("session task panicked")?;
            }
            result = &mut running => {
                break result.context("session task panicked")?;
            }
            _ = interval.tick() => {
                match handle.peer_count().await {
                    Ok(peers) => info!(peers, "routing table status"),
                    Err(e) => warn!(error = %e, "status unavailable"),
                }
            }
        }
    };

    match result {
        Ok(()) | Err(SessionError::Aborted) => Ok(()),
        Err(e) => Err(e).context("session stopped"),
    }
}
