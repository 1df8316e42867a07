//! Process-level configuration: CLI flags and `TS_*` environment variables,
//! captured once at startup into an immutable [`RuntimeConfig`] (spec §9:
//! "no component may read process-wide mutable globals at request time").

use std::path::PathBuf;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "meshd", about = "mesh-VPN node agent")]
pub struct Cli {
    /// Directory holding persisted keys, prefs, and network-lock state.
    #[arg(long, default_value = "/var/lib/meshd")]
    pub state_dir: PathBuf,

    /// Coordinator base URL, e.g. https://controlplane.example.com
    #[arg(long)]
    pub control_url: Option<String>,

    /// Path to the local administrative Unix socket.
    #[arg(long, default_value = "/var/run/meshd/local-miraged.sock")]
    pub admin_socket: PathBuf,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}

/// Immutable, process-wide configuration snapshot, built once in `main()` and
/// passed by reference into every component that needs it.
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    pub state_dir: PathBuf,
    pub admin_socket: PathBuf,
    pub default_control_url: Option<String>,
    pub log_verbosity: u8,
    pub allow_debug_ip: Option<String>,
    /// Directory logs are additionally written to, one file per process
    /// start (`TS_LOGS_DIR`, spec §6). `None` means stderr only.
    pub logs_dir: Option<PathBuf>,
}

impl RuntimeConfig {
    pub fn from_cli(cli: &Cli) -> Self {
        let verbosity = cli.verbose.max(env_flag("TS_DEBUG_LOG") as u8);
        Self {
            state_dir: cli.state_dir.clone(),
            admin_socket: cli.admin_socket.clone(),
            default_control_url: cli.control_url.clone(),
            log_verbosity: verbosity,
            allow_debug_ip: std::env::var("TS_ALLOW_DEBUG_IP").ok(),
            logs_dir: std::env::var("TS_LOGS_DIR").ok().map(PathBuf::from),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}
