use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use meshd::config::{Cli, RuntimeConfig};
use meshd::counters::Counters;
use meshd::node_agent::NodeAgent;
use meshd::platform::NullPlatformAdapter;
use meshd::store::FileStore;
use meshd::types::Prefs;

const LOG_CHANNEL_CAPACITY: usize = 1_000;

/// Entry point for the `meshd` binary: parses `Cli`, wires the declared
/// external collaborators (`PlatformAdapter`, `KvStore`, `RuntimeConfig`)
/// into a `NodeAgent`, and runs until a termination signal arrives (spec §5,
/// §9). Exit codes: 0 clean shutdown, non-zero fatal init failure (spec §6).
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RuntimeConfig::from_cli(&cli);

    let (log_tx, log_rx) = meshd::log::channel(LOG_CHANNEL_CAPACITY);
    let (watch_tx, _watch_rx) = tokio::sync::broadcast::channel(LOG_CHANNEL_CAPACITY);
    tokio::spawn(meshd::log::drain(log_rx, config.log_verbosity, watch_tx, config.logs_dir.clone()));

    let store = Arc::new(FileStore::open(config.state_dir.clone()).await?);
    // Real TUN/route/DNS/firewall installation is platform glue that lives
    // outside this crate (spec §9); `NullPlatformAdapter` is the only
    // adapter this crate ships.
    let platform = Arc::new(NullPlatformAdapter::default());
    let counters = Arc::new(Counters::default());

    let agent = NodeAgent::new(config.clone(), store, platform, counters, log_tx).await?;

    let mut prefs = Prefs::default();
    if let Some(url) = &config.default_control_url {
        prefs.control_url = url.clone();
    }
    prefs.want_running = true;
    agent.start(prefs).await?;

    let run_agent = agent.clone();
    let agent_task = tokio::spawn(async move { run_agent.run().await });

    let admin_agent = agent.clone();
    let admin_task = tokio::spawn(async move { admin_agent.serve_admin_socket().await });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = agent_task => {}
        _ = admin_task => {}
    }

    agent.shutdown().await;
    Ok(())
}
