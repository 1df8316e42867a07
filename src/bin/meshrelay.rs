//! `meshrelay`: the standalone DERP-style relay process (spec §4.9). Loads
//! its TLS material and machine key from disk, then runs `RelayServer`'s TCP
//! accept loop and UDP STUN responder side by side.

use std::collections::HashSet;
use std::io::BufReader;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};

use meshd::counters::Counters;
use meshd::relay::{RelayConfig, RelayServer};
use meshd::types::NodePublicKey;

#[derive(Parser)]
#[command(name = "meshrelay", about = "DERP-style relay for a mesh-VPN overlay")]
struct Cli {
    #[arg(long, default_value = "0.0.0.0:443")]
    tcp_listen: SocketAddr,

    #[arg(long)]
    stun_listen: Option<SocketAddr>,

    #[arg(long)]
    tls_cert: PathBuf,

    #[arg(long)]
    tls_key: PathBuf,

    /// 32-byte raw machine private key; generated fresh and discarded if omitted.
    #[arg(long)]
    machine_key: Option<PathBuf>,

    /// Node keys (hex) of relays this instance meshes with.
    #[arg(long = "mesh-peer-key")]
    mesh_peer_keys: Vec<String>,

    #[arg(long, default_value_t = 50.0)]
    accept_rate_per_sec: f64,

    #[arg(long, default_value_t = 100.0)]
    accept_burst: f64,

    #[arg(long)]
    debug_allow_ip: Option<std::net::IpAddr>,

    #[arg(long)]
    debug_allow_key: Option<String>,

    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Directory logs are additionally appended to; falls back to
    /// `TS_LOGS_DIR` when omitted (spec §6).
    #[arg(long)]
    logs_dir: Option<PathBuf>,
}

fn load_cert_chain(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut reader = BufReader::new(bytes.as_slice());
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing cert chain from {}", path.display()))
}

fn load_private_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut reader = BufReader::new(bytes.as_slice());
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key from {}", path.display()))?
        .context("no private key found in PEM file")
}

fn parse_node_key(hex_str: &str) -> Result<NodePublicKey> {
    let bytes = hex::decode(hex_str).context("mesh peer key is not valid hex")?;
    let arr: [u8; 32] = bytes.try_into().map_err(|_| anyhow::anyhow!("mesh peer key must be 32 bytes"))?;
    Ok(NodePublicKey(arr))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let logs_dir = cli.logs_dir.clone().or_else(|| std::env::var("TS_LOGS_DIR").ok().map(PathBuf::from));
    let (log_tx, log_rx) = meshd::log::channel(1_000);
    let (watch_tx, _watch_rx) = tokio::sync::broadcast::channel(1_000);
    tokio::spawn(meshd::log::drain(log_rx, cli.verbose, watch_tx, logs_dir));

    let tls_cert_chain = load_cert_chain(&cli.tls_cert)?;
    let tls_private_key = load_private_key(&cli.tls_key)?;

    let machine_priv = match &cli.machine_key {
        Some(path) => {
            let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
            bytes.try_into().map_err(|_| anyhow::anyhow!("machine key file must hold exactly 32 bytes"))?
        }
        None => meshd::wirecodec::generate_static_keypair().0,
    };

    let mesh_peer_keys: HashSet<NodePublicKey> =
        cli.mesh_peer_keys.iter().map(|s| parse_node_key(s)).collect::<Result<_>>()?;

    let config = RelayConfig {
        tcp_listen: cli.tcp_listen,
        stun_listen: cli.stun_listen,
        tls_cert_chain,
        tls_private_key,
        machine_priv,
        mesh_peer_keys,
        accept_rate_per_sec: cli.accept_rate_per_sec,
        accept_burst: cli.accept_burst,
        debug_allow_ip: cli.debug_allow_ip,
        debug_allow_key: cli.debug_allow_key,
    };

    let counters = Arc::new(Counters::default());
    let server = RelayServer::new(config, counters, log_tx)?;

    let listener = TcpListener::bind(cli.tcp_listen).await.with_context(|| format!("binding {}", cli.tcp_listen))?;
    let tcp_task = tokio::spawn(server.clone().run(listener));

    let stun_task = if let Some(stun_addr) = cli.stun_listen {
        let socket = UdpSocket::bind(stun_addr).await.with_context(|| format!("binding {stun_addr}"))?;
        Some(tokio::spawn(server.clone().run_stun(socket)))
    } else {
        None
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = tcp_task => {}
    }
    if let Some(task) = stun_task {
        task.abort();
    }
    Ok(())
}
