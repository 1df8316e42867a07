//! NodeAgent (spec §4 intro, §6, §9): the process-wide supervisor. Owns
//! `ControlClient` and a lazily-constructed `DataPlane`, serves the local
//! administrative socket, and is the one place the three declared-external
//! collaborators (`PlatformAdapter`, `KvStore`, `RuntimeConfig`) are wired
//! together.
//!
//! Grounded on `kinode/src/http_server/mod.rs`'s `warp` route shape (state
//! injected into filters via `warp::any().map(move || state.clone())`) for
//! the admin socket, and on `main.rs`'s `JoinSet` + top-level `select!`
//! startup/shutdown sequencing for how the background tasks are supervised
//! and torn down.

use std::net::IpAddr;
use std::sync::Arc;

use parking_lot::{Mutex as SyncMutex, RwLock as SyncRwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::{UdpSocket, UnixListener};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_stream::wrappers::UnixListenerStream;
use warp::Filter;

use crate::config::RuntimeConfig;
use crate::control::{ControlClient, ControlError, Notify};
use crate::counters::{Counters, CountersSnapshot};
use crate::dataplane::{DataPlane, DataPlaneError};
use crate::keymaterial::KeyMaterial;
use crate::log::LogSender;
use crate::log_event;
use crate::network_lock::{AuthorityStatus, Aum, NetworkLock, NetworkLockError};
use crate::platform::{PlatformAdapter, PlatformError};
use crate::prober::{EndpointProber, NetInfo};
use crate::store::{KvStore, StoreError};
use crate::types::{NetworkMap, NodePublicKey, Prefs};

const DISK_KEY_STORE_KEY: &str = "disk-key";
/// How often the peer-maintenance tick (heartbeats, probe timeouts) runs
/// (spec §4.5's `HEARTBEAT_INTERVAL` governs when a heartbeat actually
/// fires; this is just the poll granularity).
const MAINTENANCE_TICK: std::time::Duration = std::time::Duration::from_secs(1);
/// Upper bound on `shutdown()` (spec §5: "returns Canceled promptly, within 2s").
const SHUTDOWN_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(2);
/// How often `EndpointProber` re-ranks this node's reachability while idle
/// (spec §4.3).
const PROBE_TICK: std::time::Duration = crate::prober::IDLE_PROBE_INTERVAL;

#[derive(Debug, Error)]
pub enum NodeAgentError {
    #[error("node agent: control error: {0}")]
    Control(#[from] ControlError),
    #[error("node agent: store error: {0}")]
    Store(#[from] StoreError),
    #[error("node agent: platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("node agent: data plane error: {0}")]
    DataPlane(#[from] DataPlaneError),
    #[error("node agent: network lock error: {0}")]
    NetworkLock(#[from] NetworkLockError),
    #[error("node agent: network lock is not enabled")]
    NetworkLockDisabled,
    #[error("node agent: data plane not yet initialized, no NetworkMap observed")]
    DataPlaneNotReady,
    #[error("node agent: admin socket io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone, Debug, Serialize)]
pub struct AgentStatus {
    pub control_state: String,
    pub counters: CountersSnapshot,
    pub map_generation: Option<u64>,
    pub network_lock: Option<AuthorityStatus>,
}

#[derive(Deserialize)]
struct WhoisQuery {
    ip: IpAddr,
}

#[derive(Deserialize)]
struct NetworkLockInitBody {
    trusted_keys: Vec<(NodePublicKey, u32)>,
    disablement_hashes: Vec<[u8; 32]>,
}

#[derive(Deserialize)]
struct NetworkLockKeyBody {
    key: NodePublicKey,
    #[serde(default)]
    votes: u32,
}

#[derive(Deserialize)]
struct NetworkLockDisableBody {
    secret: Vec<u8>,
}

#[derive(Deserialize)]
struct LogQuery {
    #[serde(default = "default_log_limit")]
    limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// Fetches (or generates and persists, on first run) the symmetric key
/// `KeyMaterial`'s at-rest envelope is sealed under. Spec.md leaves the
/// disk-key source unspecified; `state_dir` filesystem permissions are
/// already the trust boundary the rest of the design assumes (see
/// DESIGN.md), so storing this key unencrypted alongside the sealed
/// material it protects adds no additional exposure.
async fn load_or_create_disk_key(store: &dyn KvStore) -> Result<[u8; 32], NodeAgentError> {
    if let Some(bytes) = store.get(DISK_KEY_STORE_KEY).await? {
        let mut key = [0u8; 32];
        if bytes.len() == 32 {
            key.copy_from_slice(&bytes);
            return Ok(key);
        }
    }
    let mut key = [0u8; 32];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut key);
    store.put(DISK_KEY_STORE_KEY, &key).await?;
    Ok(key)
}

/// Process-wide supervisor (spec §4 intro: "owns ControlClient + DataPlane;
/// serves a local IPC for administrative operations; persists prefs").
pub struct NodeAgent {
    config: RuntimeConfig,
    store: Arc<dyn KvStore>,
    platform: Arc<dyn PlatformAdapter>,
    key_material: Arc<KeyMaterial>,
    counters: Arc<Counters>,
    log: LogSender,
    control: Arc<ControlClient>,
    dataplane: SyncRwLock<Option<Arc<DataPlane>>>,
    current_map: SyncRwLock<Option<Arc<NetworkMap>>>,
    network_lock: SyncMutex<Option<NetworkLock>>,
    last_net_info: SyncMutex<Option<NetInfo>>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl NodeAgent {
    /// Loads or generates node identity from `store`, then wires a
    /// `ControlClient` pointed at `config.default_control_url` (spec §9's
    /// three declared-external collaborators: `PlatformAdapter`, `KvStore`,
    /// `RuntimeConfig`).
    pub async fn new(
        config: RuntimeConfig,
        store: Arc<dyn KvStore>,
        platform: Arc<dyn PlatformAdapter>,
        counters: Arc<Counters>,
        log: LogSender,
    ) -> Result<Arc<Self>, NodeAgentError> {
        let disk_key = load_or_create_disk_key(store.as_ref()).await?;
        let key_material = match KeyMaterial::load_or_generate(store.as_ref(), &disk_key).await {
            Ok(km) => km,
            Err(e) => return Err(ControlError::NonRetryable(e.to_string()).into()),
        };
        key_material.persist(store.as_ref(), &disk_key).await.map_err(|e| ControlError::NonRetryable(e.to_string()))?;
        let key_material = Arc::new(key_material);

        let control_url = config.default_control_url.clone().unwrap_or_default();
        let control = Arc::new(ControlClient::new(
            control_url,
            key_material.clone(),
            store.clone(),
            counters.clone(),
            log.clone(),
        ));
        let (stop_tx, stop_rx) = watch::channel(false);

        Ok(Arc::new(Self {
            config,
            store,
            platform,
            key_material,
            counters,
            log,
            control,
            dataplane: SyncRwLock::new(None),
            current_map: SyncRwLock::new(None),
            network_lock: SyncMutex::new(None),
            last_net_info: SyncMutex::new(None),
            stop_tx,
            stop_rx,
        }))
    }

    pub fn key_material(&self) -> &Arc<KeyMaterial> {
        &self.key_material
    }

    pub fn network_map(&self) -> Option<Arc<NetworkMap>> {
        self.current_map.read().clone()
    }

    pub fn whois(&self, addr: IpAddr) -> Option<crate::types::Peer> {
        self.current_map.read().as_ref()?.peer_by_overlay_addr(addr).cloned()
    }

    pub fn status(&self) -> AgentStatus {
        AgentStatus {
            control_state: format!("{:?}", self.control.state()),
            counters: self.counters.snapshot(),
            map_generation: self.current_map.read().as_ref().map(|m| m.generation),
            network_lock: self.network_lock.lock().as_ref().map(|nl| nl.status()),
        }
    }

    pub async fn start(&self, prefs: Prefs) -> Result<(), NodeAgentError> {
        Ok(self.control.start(prefs).await?)
    }

    pub async fn login_interactive(&self) -> Result<(), NodeAgentError> {
        Ok(self.control.start_login_interactive().await?)
    }

    pub async fn logout(&self) -> Result<(), NodeAgentError> {
        Ok(self.control.logout().await?)
    }

    pub async fn set_prefs(&self, prefs: Prefs) -> Result<(), NodeAgentError> {
        if let Some(dp) = self.dataplane.read().clone() {
            dp.set_shields_up(prefs.shields_up);
        }
        Ok(self.control.set_prefs(prefs).await?)
    }

    pub async fn prefs(&self) -> Result<Prefs, NodeAgentError> {
        Ok(self.control.current_prefs().await?)
    }

    /// `NetworkLock::init`: rejected here if an authority is already active,
    /// since `NetworkLock::init` itself has no way to tell a fresh
    /// initialization from clobbering a live one (DESIGN.md Open Question
    /// decision #3).
    pub fn network_lock_init(
        &self,
        trusted_keys: Vec<(NodePublicKey, u32)>,
        disablement_hashes: Vec<[u8; 32]>,
    ) -> Result<AuthorityStatus, NodeAgentError> {
        let mut slot = self.network_lock.lock();
        if slot.is_some() {
            return Err(NetworkLockError::AlreadyInitialized.into());
        }
        let nl = NetworkLock::init(self.key_material.clone(), trusted_keys, disablement_hashes);
        let status = nl.status();
        *slot = Some(nl);
        Ok(status)
    }

    /// Erases a disabled authority's AUM log so `network_lock_init` can run
    /// again (DESIGN.md Open Question decision #3); a no-op if no authority
    /// is currently held.
    pub fn network_lock_purge(&self) {
        *self.network_lock.lock() = None;
    }

    pub fn network_lock_status(&self) -> Result<AuthorityStatus, NodeAgentError> {
        self.network_lock.lock().as_ref().map(|nl| nl.status()).ok_or(NodeAgentError::NetworkLockDisabled)
    }

    pub fn network_lock_log(&self, limit: usize) -> Result<Vec<Aum>, NodeAgentError> {
        self.network_lock.lock().as_ref().map(|nl| nl.log(limit)).ok_or(NodeAgentError::NetworkLockDisabled)
    }

    pub fn network_lock_add_key(&self, key: NodePublicKey, votes: u32) -> Result<[u8; 32], NodeAgentError> {
        let guard = self.network_lock.lock();
        let nl = guard.as_ref().ok_or(NodeAgentError::NetworkLockDisabled)?;
        Ok(nl.add_key(key, votes)?)
    }

    pub fn network_lock_remove_key(&self, key: NodePublicKey) -> Result<[u8; 32], NodeAgentError> {
        let guard = self.network_lock.lock();
        let nl = guard.as_ref().ok_or(NodeAgentError::NetworkLockDisabled)?;
        Ok(nl.remove_key(key)?)
    }

    pub fn network_lock_disable(&self, secret: &[u8]) -> Result<[u8; 32], NodeAgentError> {
        let guard = self.network_lock.lock();
        let nl = guard.as_ref().ok_or(NodeAgentError::NetworkLockDisabled)?;
        Ok(nl.disable(secret)?)
    }

    /// Builds the `DataPlane` the first time a `NetworkMap` arrives:
    /// `PlatformAdapter::open_tun` needs `selfNode.addresses`, which are
    /// only known once the coordinator has assigned them (spec §4.6, §4.7).
    async fn ensure_dataplane(&self, map: &NetworkMap) -> Result<Arc<DataPlane>, NodeAgentError> {
        if let Some(dp) = self.dataplane.read().clone() {
            return Ok(dp);
        }
        let tun = self.platform.open_tun(&map.self_node.addresses).await?;
        let udp4 = UdpSocket::bind("0.0.0.0:0").await?;
        let udp6 = if map.self_node.addresses.iter().any(IpAddr::is_ipv6) {
            Some(UdpSocket::bind("[::]:0").await?)
        } else {
            None
        };
        let dp = DataPlane::new(
            udp4,
            udp6,
            tun,
            self.key_material.node_public(),
            *self.key_material.machine_private(),
            Arc::new(crate::dataplane::packet_filter::PacketFilter::default()),
            self.counters.clone(),
            self.log.clone(),
        );
        if let Ok(prefs) = self.control.current_prefs().await {
            dp.set_shields_up(prefs.shields_up);
        }
        *self.dataplane.write() = Some(dp.clone());
        Ok(dp)
    }

    /// Drops peers NetworkLock doesn't trust (spec §4.10: "a peer's node
    /// public key is trusted only if its current signature chains to an AUM
    /// key currently in the authority's head state. Unsigned peers are
    /// filtered out of the effective NetworkMap"). A no-op when no
    /// authority is active.
    fn apply_network_lock(&self, map: &NetworkMap) -> NetworkMap {
        let guard = self.network_lock.lock();
        let Some(nl) = guard.as_ref() else {
            return map.clone();
        };
        let mut trusted = map.clone();
        trusted.peers.retain(|peer| match &peer.node_key_signature {
            Some(sig) => nl.is_trusted(&peer.node_key, sig),
            None => false,
        });
        trusted
    }

    async fn apply_map(&self, map: Arc<NetworkMap>) -> Result<(), NodeAgentError> {
        let effective_map = self.apply_network_lock(&map);
        let dp = self.ensure_dataplane(&map).await?;
        dp.apply_network_map(&effective_map).await;
        self.platform.install_routes(&routes_from_map(&map)).await?;
        self.platform.install_dns(&map.dns_config).await?;
        self.platform.install_firewall_rules(&map.packet_filter).await?;
        *self.current_map.write() = Some(map);
        Ok(())
    }

    /// Runs the agent until `shutdown()` is called: drives `ControlClient`,
    /// consumes its notifications to keep the data plane and platform
    /// installed state in sync, and ticks peer maintenance once a data
    /// plane exists.
    pub async fn run(self: Arc<Self>) {
        let mut tasks = JoinSet::new();

        let control = self.control.clone();
        tasks.spawn(async move { control.run().await });

        let this = self.clone();
        tasks.spawn(async move { this.notification_loop().await });

        let this = self.clone();
        tasks.spawn(async move { this.maintenance_loop().await });

        let this = self.clone();
        tasks.spawn(async move { this.probe_loop().await });

        let mut stop_rx = self.stop_rx.clone();
        tokio::select! {
            _ = stop_rx.changed() => {}
            _ = tasks.join_next() => {}
        }
        tasks.shutdown().await;
    }

    async fn notification_loop(self: Arc<Self>) {
        let mut notifications = self.control.notifications();
        let mut stop_rx = self.stop_rx.clone();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                ev = notifications.recv() => {
                    match ev {
                        Ok(Notify::Map(map)) => {
                            if let Err(e) = self.apply_map(map).await {
                                log_event!(self.log, 0, "node_agent", "failed to apply network map: {e}");
                            }
                        }
                        Ok(Notify::ClockSkew(skew)) => {
                            log_event!(self.log, 0, "node_agent", "clock skew of {skew:?} detected against coordinator");
                        }
                        Ok(Notify::Error(msg)) => {
                            log_event!(self.log, 0, "node_agent", "control error: {msg}");
                        }
                        Ok(_) => {}
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    async fn maintenance_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut ticker = tokio::time::interval(MAINTENANCE_TICK);
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {
                    if let Some(dp) = self.dataplane.read().clone() {
                        dp.maintain_peers().await;
                    }
                }
            }
        }
    }

    /// Re-ranks reachability on `PROBE_TICK` and pushes the result to
    /// `ControlClient` only when something actually changed (spec §4.3,
    /// SPEC_FULL §C.3). A no-op until a `DataPlane` and `NetworkMap` both
    /// exist, since probing needs a bound socket and a relay map to probe
    /// against.
    async fn probe_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_rx.clone();
        let mut ticker = tokio::time::interval(PROBE_TICK);
        let http = reqwest::Client::new();
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return,
                _ = ticker.tick() => {
                    let (Some(dp), Some(map)) = (self.dataplane.read().clone(), self.current_map.read().clone()) else {
                        continue;
                    };
                    let prober = EndpointProber::new(dp.udp4_handle(), map.derp_map.clone());
                    let relay_latency = prober.probe_relay_latency(&http).await;
                    let info = NetInfo {
                        working_udp: prober.probe_reflexive().await.is_ok(),
                        preferred_relay_region: EndpointProber::preferred_region(&relay_latency),
                        relay_latency,
                        ..NetInfo::default()
                    };
                    let mut last = self.last_net_info.lock();
                    let changed = last.as_ref().map(|old| crate::prober::net_info_changed(old, &info)).unwrap_or(true);
                    if changed {
                        self.control.push_net_info(info.clone());
                        *last = Some(info);
                    }
                }
            }
        }
    }

    /// Serves the local administrative socket (spec §6): `warp` routes over
    /// a Unix domain socket, mirroring the teacher's pattern of injecting
    /// shared state into filters via `warp::any().map(move || ...)`.
    pub async fn serve_admin_socket(self: Arc<Self>) -> Result<(), NodeAgentError> {
        if let Some(parent) = self.config.admin_socket.parent() {
            tokio::fs::create_dir_all(parent).await.ok();
        }
        let _ = tokio::fs::remove_file(&self.config.admin_socket).await;
        let listener = UnixListener::bind(&self.config.admin_socket)?;
        let incoming = UnixListenerStream::new(listener);

        let agent = self.clone();
        let status_route = warp::path!("status")
            .and(warp::get())
            .and(warp::any().map(move || agent.clone()))
            .map(|agent: Arc<NodeAgent>| warp::reply::json(&agent.status()));

        let agent = self.clone();
        let start_route = warp::path!("start")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|prefs: Prefs, agent: Arc<NodeAgent>| async move {
                agent.start(prefs).await.map(|_| warp::reply()).map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let login_route = warp::path!("login-interactive")
            .and(warp::post())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|agent: Arc<NodeAgent>| async move {
                agent.login_interactive().await.map(|_| warp::reply()).map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let logout_route = warp::path!("logout")
            .and(warp::post())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|agent: Arc<NodeAgent>| async move {
                agent.logout().await.map(|_| warp::reply()).map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let map_route = warp::path!("network-map")
            .and(warp::get())
            .and(warp::any().map(move || agent.clone()))
            .map(|agent: Arc<NodeAgent>| warp::reply::json(&agent.network_map()));

        let agent = self.clone();
        let whois_route = warp::path!("whois")
            .and(warp::get())
            .and(warp::query::<WhoisQuery>())
            .and(warp::any().map(move || agent.clone()))
            .map(|q: WhoisQuery, agent: Arc<NodeAgent>| warp::reply::json(&agent.whois(q.ip)));

        let agent = self.clone();
        let get_prefs_route = warp::path!("prefs")
            .and(warp::get())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|agent: Arc<NodeAgent>| async move {
                agent.prefs().await.map(|p| warp::reply::json(&p)).map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let set_prefs_route = warp::path!("prefs")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|prefs: Prefs, agent: Arc<NodeAgent>| async move {
                agent.set_prefs(prefs).await.map(|_| warp::reply()).map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let nl_init_route = warp::path!("network-lock" / "init")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .map(|body: NetworkLockInitBody, agent: Arc<NodeAgent>| {
                match agent.network_lock_init(body.trusted_keys, body.disablement_hashes) {
                    Ok(status) => warp::reply::json(&status),
                    Err(e) => warp::reply::json(&e.to_string()),
                }
            });

        let agent = self.clone();
        let nl_status_route = warp::path!("network-lock" / "status")
            .and(warp::get())
            .and(warp::any().map(move || agent.clone()))
            .map(|agent: Arc<NodeAgent>| warp::reply::json(&agent.network_lock_status().ok()));

        let agent = self.clone();
        let nl_log_route = warp::path!("network-lock" / "log")
            .and(warp::get())
            .and(warp::query::<LogQuery>())
            .and(warp::any().map(move || agent.clone()))
            .map(|q: LogQuery, agent: Arc<NodeAgent>| warp::reply::json(&agent.network_lock_log(q.limit).unwrap_or_default()));

        let agent = self.clone();
        let nl_add_key_route = warp::path!("network-lock" / "add-key")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|body: NetworkLockKeyBody, agent: Arc<NodeAgent>| async move {
                agent
                    .network_lock_add_key(body.key, body.votes)
                    .map(|h| warp::reply::json(&hex::encode(h)))
                    .map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let nl_remove_key_route = warp::path!("network-lock" / "remove-key")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|body: NetworkLockKeyBody, agent: Arc<NodeAgent>| async move {
                agent
                    .network_lock_remove_key(body.key)
                    .map(|h| warp::reply::json(&hex::encode(h)))
                    .map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let nl_disable_route = warp::path!("network-lock" / "disable")
            .and(warp::post())
            .and(warp::body::json())
            .and(warp::any().map(move || agent.clone()))
            .and_then(|body: NetworkLockDisableBody, agent: Arc<NodeAgent>| async move {
                agent
                    .network_lock_disable(&body.secret)
                    .map(|h| warp::reply::json(&hex::encode(h)))
                    .map_err(|_| warp::reject::reject())
            });

        let agent = self.clone();
        let nl_purge_route = warp::path!("network-lock" / "purge")
            .and(warp::post())
            .and(warp::any().map(move || agent.clone()))
            .map(|agent: Arc<NodeAgent>| {
                agent.network_lock_purge();
                warp::reply()
            });

        let routes = status_route
            .or(start_route)
            .or(login_route)
            .or(logout_route)
            .or(map_route)
            .or(whois_route)
            .or(get_prefs_route)
            .or(set_prefs_route)
            .or(nl_init_route)
            .or(nl_status_route)
            .or(nl_log_route)
            .or(nl_add_key_route)
            .or(nl_remove_key_route)
            .or(nl_disable_route)
            .or(nl_purge_route);

        warp::serve(routes).run_incoming(incoming).await;
        Ok(())
    }

    /// Cancels all background tasks and returns within [`SHUTDOWN_TIMEOUT`]
    /// (spec §5: "cancels all tokens, closes sockets, drains outstanding
    /// work, then returns; it is safe to call once").
    pub async fn shutdown(&self) {
        self.control.stop();
        let _ = self.stop_tx.send(true);
        // best-effort: give in-flight select! branches one tick to unwind.
        let _ = tokio::time::timeout(SHUTDOWN_TIMEOUT, tokio::task::yield_now()).await;
    }
}

fn routes_from_map(map: &NetworkMap) -> Vec<ipnet::IpNet> {
    map.peers.iter().flat_map(|p| p.allowed_ips.clone()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::NullPlatformAdapter;
    use crate::store::MemoryStore;
    use std::path::PathBuf;

    fn test_config() -> RuntimeConfig {
        RuntimeConfig {
            state_dir: PathBuf::from("/tmp/meshd-test"),
            admin_socket: PathBuf::from("/tmp/meshd-test/local-miraged.sock"),
            default_control_url: Some("https://example.invalid".into()),
            log_verbosity: 1,
            allow_debug_ip: None,
        }
    }

    async fn test_agent() -> Arc<NodeAgent> {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let platform: Arc<dyn PlatformAdapter> = Arc::new(NullPlatformAdapter::default());
        let (log_tx, _log_rx) = crate::log::channel(16);
        NodeAgent::new(test_config(), store, platform, Arc::new(Counters::default()), log_tx).await.unwrap()
    }

    #[tokio::test]
    async fn new_generates_and_persists_key_material_once() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let platform: Arc<dyn PlatformAdapter> = Arc::new(NullPlatformAdapter::default());
        let (log_tx, _log_rx) = crate::log::channel(16);
        let agent = NodeAgent::new(test_config(), store.clone(), platform, Arc::new(Counters::default()), log_tx)
            .await
            .unwrap();
        let node_pub = agent.key_material().node_public();

        // a disk key and node/machine key documents were persisted.
        assert!(store.get(DISK_KEY_STORE_KEY).await.unwrap().is_some());
        assert!(store.get("node-key.pem").await.unwrap().is_some());

        // a fresh NodeAgent built against the same store recovers the same identity.
        let platform2: Arc<dyn PlatformAdapter> = Arc::new(NullPlatformAdapter::default());
        let (log_tx2, _log_rx2) = crate::log::channel(16);
        let agent2 = NodeAgent::new(test_config(), store, platform2, Arc::new(Counters::default()), log_tx2)
            .await
            .unwrap();
        assert_eq!(agent2.key_material().node_public(), node_pub);
    }

    #[tokio::test]
    async fn status_reports_no_map_before_any_network_map_observed() {
        let agent = test_agent().await;
        let status = agent.status();
        assert_eq!(status.map_generation, None);
        assert!(status.network_lock.is_none());
    }

    #[tokio::test]
    async fn network_lock_ops_require_init_first() {
        let agent = test_agent().await;
        assert!(matches!(agent.network_lock_status(), Err(NodeAgentError::NetworkLockDisabled)));
        assert!(matches!(
            agent.network_lock_add_key(NodePublicKey([1u8; 32]), 1),
            Err(NodeAgentError::NetworkLockDisabled)
        ));
    }

    #[tokio::test]
    async fn network_lock_init_then_add_key_reflects_in_status() {
        let agent = test_agent().await;
        let authority_pub = agent.key_material().node_public();
        // a NetworkLock needs its own authority key; NodeAgent's KeyMaterial
        // here has none, so init succeeds but signing operations would
        // fail. We only exercise init/status/double-init here.
        let _ = authority_pub;
        agent.network_lock_init(vec![], vec![]).unwrap();
        assert!(agent.network_lock_status().is_ok());
        assert!(agent.network_lock_init(vec![], vec![]).is_err());
    }

    #[tokio::test]
    async fn network_lock_purge_allows_reinit() {
        let agent = test_agent().await;
        agent.network_lock_init(vec![], vec![]).unwrap();
        assert!(agent.network_lock_init(vec![], vec![]).is_err());
        agent.network_lock_purge();
        assert!(agent.network_lock_status().is_err());
        assert!(agent.network_lock_init(vec![], vec![]).is_ok());
    }

    #[tokio::test]
    async fn prefs_round_trips_through_set_prefs() {
        let agent = test_agent().await;
        let default = agent.prefs().await.unwrap();
        assert_eq!(default, Prefs::default());

        let mut updated = Prefs::default();
        updated.hostname = "test-host".into();
        agent.set_prefs(updated.clone()).await.unwrap();
        assert_eq!(agent.prefs().await.unwrap(), updated);
    }

    #[tokio::test]
    async fn apply_map_installs_platform_state_and_builds_dataplane_once() {
        let agent = test_agent().await;
        let map = Arc::new(NetworkMap {
            generation: 1,
            self_node: crate::types::SelfNode {
                stable_id: "self".into(),
                display_name: "self".into(),
                addresses: vec!["100.64.0.1".parse().unwrap()],
                key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
            },
            peers: vec![],
            dns_config: Default::default(),
            packet_filter: vec![],
            ssh_policy: None,
            derp_map: Default::default(),
            control_time: chrono::Utc::now(),
        });
        agent.apply_map(map.clone()).await.unwrap();
        assert!(agent.network_map().is_some());
        let dp_first = agent.dataplane.read().clone().unwrap();
        agent.apply_map(map).await.unwrap();
        let dp_second = agent.dataplane.read().clone().unwrap();
        assert!(Arc::ptr_eq(&dp_first, &dp_second));
    }

    #[tokio::test]
    async fn shutdown_is_safe_to_call_once() {
        let agent = test_agent().await;
        agent.shutdown().await;
    }
}
