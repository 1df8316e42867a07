//! ControlClient (spec §4.7): registers with the coordinator, logs in, and
//! long-polls the NetworkMap.
//!
//! Grounded on the teacher's `http_client.rs` (`reqwest::Client`, JSON
//! request/response DTOs) for the plain-HTTP `/key` fetch, and on
//! `net/utils.rs`'s XK-handshake-over-TCP usage (shared code path: the same
//! `wirecodec::client_handshake` RelayServer uses to dial a mesh peer) for
//! the coordinator session itself.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, watch};

use crate::counters::Counters;
use crate::keymaterial::KeyMaterial;
use crate::log::LogSender;
use crate::log_event;
use crate::store::{KvStore, StoreError};
use crate::types::{DerpMap, DnsConfig, FilterRule, MachinePublicKey, NetworkMap, NodePublicKey, Prefs, StableId};
use crate::wirecodec::{self, Session, WireCodecError};

const CAP_VERSION: u32 = 1;
const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);
const CLOCK_SKEW_WARNING_MS: i64 = 30_000;

const AUTH_TOKEN_STORE_KEY: &str = "control/auth-token";
const PREFS_STORE_KEY: &str = "control/prefs";
const STABLE_ID_STORE_KEY: &str = "control/stable-id";

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control: http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("control: wire codec error: {0}")]
    WireCodec(#[from] WireCodecError),
    #[error("control: io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("control: store error: {0}")]
    Store(#[from] StoreError),
    #[error("control: serialization error: {0}")]
    Bincode(#[from] bincode::Error),
    #[error("control: json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("control: malformed coordinator key")]
    BadKeyFormat,
    #[error("control: malformed control URL")]
    BadControlUrl,
    #[error("control: map delta referenced unknown prior generation")]
    StaleDeltaBase,
    #[error("control: permanent failure: {0}")]
    NonRetryable(String),
}

impl ControlError {
    /// Permanent auth failures and terminated accounts are not retried
    /// (spec §4.7: "surface as `Notify{Error}` and leave the state machine
    /// in `NeedsLogin`"); everything else is.
    fn is_retryable(&self) -> bool {
        !matches!(self, ControlError::NonRetryable(_))
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ControlState {
    NoState,
    NeedsLogin,
    Starting,
    Running,
    NeedsMachineAuth,
    Stopped,
}

#[derive(Clone, Debug, Default)]
pub struct EngineStats {
    pub bytes_sent: u64,
    pub bytes_recv: u64,
}

#[derive(Clone, Debug)]
pub enum Notify {
    State(ControlState),
    BrowseToURL(String),
    Prefs(Prefs),
    Map(Arc<NetworkMap>),
    EngineStats(EngineStats),
    ClockSkew(Duration),
    Error(String),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HostInfo {
    pub hostname: String,
    pub os: String,
    pub version: String,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AuthMethod {
    OAuthToken(String),
    PreAuthKey(String),
    Interactive,
}

#[derive(Serialize, Deserialize)]
pub struct RegisterRequest {
    pub node_key: NodePublicKey,
    pub machine_key: MachinePublicKey,
    pub hostinfo: Option<HostInfo>,
    /// Signature by the node key over the machine key's bytes, binding the
    /// two keys together (the coordinator trusts `node_key` long-term; this
    /// proves whoever is dialing with `machine_key` also holds the node
    /// private key).
    pub node_key_signature: Vec<u8>,
    pub auth: AuthMethod,
}

#[derive(Serialize, Deserialize)]
pub enum RegisterResponse {
    LoginUrl(String),
    Accepted { stable_id: StableId, control_time: chrono::DateTime<chrono::Utc> },
}

#[derive(Serialize, Deserialize)]
pub struct MapRequest {
    pub generation: u64,
    /// Latest `EndpointProber` snapshot, re-sent whenever it changes so the
    /// coordinator can republish this node's endpoints/relay latencies to
    /// peers (spec §4.7 step 5: "periodically send updates: endpoint list,
    /// NetInfo, hostinfo changes, DERP latencies").
    pub net_info: Option<crate::prober::NetInfo>,
}

/// A non-full map update. Field shape is not specified by spec §4.7 beyond
/// "delta NetworkMap"; resolved here as an upsert/remove peer list plus
/// optional whole-field replacements for the map's other sections (see
/// DESIGN.md Open Question decisions).
#[derive(Serialize, Deserialize)]
pub struct MapDelta {
    pub base_generation: u64,
    pub generation: u64,
    pub peers_upserted: Vec<crate::types::Peer>,
    pub peers_removed: Vec<NodePublicKey>,
    pub dns_config: Option<DnsConfig>,
    pub packet_filter: Option<Vec<FilterRule>>,
    pub derp_map: Option<DerpMap>,
    pub control_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Serialize, Deserialize)]
pub enum MapResponse {
    Full(NetworkMap),
    Delta(MapDelta),
}

/// Applies `delta` on top of `base`, per spec §8: "map delta referencing an
/// unknown prior generation -> ControlClient discards and forces a full
/// refresh" (signaled here as [`ControlError::StaleDeltaBase`]).
fn apply_delta(base: &NetworkMap, delta: MapDelta) -> Result<NetworkMap, ControlError> {
    if delta.base_generation != base.generation {
        return Err(ControlError::StaleDeltaBase);
    }
    let mut peers: Vec<crate::types::Peer> = base
        .peers
        .iter()
        .filter(|p| !delta.peers_removed.contains(&p.node_key))
        .cloned()
        .collect();
    for upserted in delta.peers_upserted {
        match peers.iter_mut().find(|p| p.node_key == upserted.node_key) {
            Some(existing) => *existing = upserted,
            None => peers.push(upserted),
        }
    }
    Ok(NetworkMap {
        generation: delta.generation,
        self_node: base.self_node.clone(),
        peers,
        dns_config: delta.dns_config.unwrap_or_else(|| base.dns_config.clone()),
        packet_filter: delta.packet_filter.unwrap_or_else(|| base.packet_filter.clone()),
        ssh_policy: base.ssh_policy.clone(),
        derp_map: delta.derp_map.unwrap_or_else(|| base.derp_map.clone()),
        control_time: delta.control_time,
    })
}

#[derive(Deserialize)]
struct ModernKeyResponse {
    #[serde(rename = "keyType")]
    #[allow(dead_code)]
    key_type: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

/// Parses the `/key` response body (spec §4.7 step 1): the modern JSON
/// object form first, falling back to a bare hex string (SPEC_FULL §C.7).
pub fn parse_coordinator_key(body: &str) -> Result<[u8; 32], ControlError> {
    if let Ok(modern) = serde_json::from_str::<ModernKeyResponse>(body) {
        return decode_hex32(&modern.public_key);
    }
    decode_hex32(body.trim())
}

fn decode_hex32(s: &str) -> Result<[u8; 32], ControlError> {
    let bytes = hex::decode(s.trim()).map_err(|_| ControlError::BadKeyFormat)?;
    if bytes.len() != 32 {
        return Err(ControlError::BadKeyFormat);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

/// Exponential backoff from [`MIN_BACKOFF`], capped at [`MAX_BACKOFF`], with
/// full jitter (spec §4.7).
fn backoff_delay(attempt: u32) -> Duration {
    let base = MIN_BACKOFF.saturating_mul(1u32.checked_shl(attempt).unwrap_or(u32::MAX)).min(MAX_BACKOFF);
    let jittered_millis = rand::thread_rng().gen_range(0..=base.as_millis() as u64);
    Duration::from_millis(jittered_millis)
}

/// `None` if within tolerance; `Some(skew)` if the coordinator's clock
/// disagrees with ours by at least 30s (spec §4.7: "surfaced as a warning
/// but does not block").
fn clock_skew_warning(control_time: chrono::DateTime<chrono::Utc>) -> Option<Duration> {
    let skew_ms = (chrono::Utc::now() - control_time).num_milliseconds().abs();
    (skew_ms >= CLOCK_SKEW_WARNING_MS).then(|| Duration::from_millis(skew_ms as u64))
}

pub struct ControlClient {
    control_url: parking_lot::Mutex<String>,
    key_material: Arc<KeyMaterial>,
    store: Arc<dyn KvStore>,
    state: parking_lot::Mutex<ControlState>,
    notify_tx: broadcast::Sender<Notify>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
    netinfo_tx: watch::Sender<Option<crate::prober::NetInfo>>,
    netinfo_rx: watch::Receiver<Option<crate::prober::NetInfo>>,
    #[allow(dead_code)]
    counters: Arc<Counters>,
    log: LogSender,
    http: reqwest::Client,
}

impl ControlClient {
    pub fn new(
        control_url: String,
        key_material: Arc<KeyMaterial>,
        store: Arc<dyn KvStore>,
        counters: Arc<Counters>,
        log: LogSender,
    ) -> Self {
        let (notify_tx, _) = broadcast::channel(64);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (netinfo_tx, netinfo_rx) = watch::channel(None);
        Self {
            control_url: parking_lot::Mutex::new(control_url),
            key_material,
            store,
            state: parking_lot::Mutex::new(ControlState::NoState),
            notify_tx,
            stop_tx,
            stop_rx,
            netinfo_tx,
            netinfo_rx,
            counters,
            log,
            http: reqwest::Client::new(),
        }
    }

    pub fn state(&self) -> ControlState {
        self.state.lock().clone()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notify> {
        self.notify_tx.subscribe()
    }

    fn emit(&self, event: Notify) {
        let _ = self.notify_tx.send(event);
    }

    fn set_state(&self, state: ControlState) {
        *self.state.lock() = state.clone();
        self.emit(Notify::State(state));
    }

    /// Idempotent: a no-op if already `Starting`/`Running`. Resumes a prior
    /// session if one was persisted, otherwise begins interactive login
    /// (spec §4.7: "begins login if keys exist, else emits a `BrowseToURL`
    /// notification" — "keys" read here as a previously accepted session,
    /// not the long-term keypair, which always exists once `KeyMaterial` is
    /// constructed; see DESIGN.md Open Question decisions).
    pub async fn start(&self, prefs: Prefs) -> Result<(), ControlError> {
        self.set_prefs(prefs).await?;
        if matches!(self.state(), ControlState::Starting | ControlState::Running) {
            return Ok(());
        }
        match self.persisted_auth_token().await? {
            Some(token) => self.login(AuthMethod::PreAuthKey(token)).await,
            None => self.start_login_interactive().await,
        }
    }

    pub async fn start_login_interactive(&self) -> Result<(), ControlError> {
        self.login(AuthMethod::Interactive).await
    }

    pub async fn login(&self, auth: AuthMethod) -> Result<(), ControlError> {
        self.set_state(ControlState::Starting);
        let remote_pub = self.fetch_coordinator_key().await?;
        let mut stream = self.dial_coordinator().await?;
        let mut session =
            wirecodec::client_handshake(self.key_material.machine_private(), &remote_pub, &mut stream).await?;
        let req = self.build_register_request(auth.clone());
        let resp = send_register(&mut session, &mut stream, &req).await?;
        match resp {
            RegisterResponse::LoginUrl(url) => {
                self.set_state(ControlState::NeedsLogin);
                self.emit(Notify::BrowseToURL(url));
                Ok(())
            }
            RegisterResponse::Accepted { stable_id, control_time } => {
                if let AuthMethod::PreAuthKey(ref token) | AuthMethod::OAuthToken(ref token) = auth {
                    self.store.put(AUTH_TOKEN_STORE_KEY, token.as_bytes()).await?;
                }
                self.on_registered(stable_id, control_time).await
            }
        }
    }

    /// Drops session state and returns to `NeedsLogin` (spec §4.7).
    pub async fn logout(&self) -> Result<(), ControlError> {
        self.store.delete(AUTH_TOKEN_STORE_KEY).await?;
        self.set_state(ControlState::NeedsLogin);
        Ok(())
    }

    pub async fn set_prefs(&self, prefs: Prefs) -> Result<(), ControlError> {
        let bytes = serde_json::to_vec(&prefs)?;
        self.store.put(PREFS_STORE_KEY, &bytes).await?;
        self.emit(Notify::Prefs(prefs));
        Ok(())
    }

    /// Current persisted prefs, or the default if `set_prefs`/`start` has
    /// never run (spec §6's `GET /prefs`).
    pub async fn current_prefs(&self) -> Result<Prefs, ControlError> {
        match self.store.get(PREFS_STORE_KEY).await? {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Prefs::default()),
        }
    }

    /// Queues a fresh `EndpointProber` snapshot for the next `MapRequest`
    /// the running map-stream session sends; a no-op until a session is
    /// actually established (spec §4.3: "consumers push a NetInfo diff only
    /// when a field actually changed" — the caller is expected to have
    /// already diffed via [`crate::prober::net_info_changed`]).
    pub fn push_net_info(&self, info: crate::prober::NetInfo) {
        let _ = self.netinfo_tx.send(Some(info));
    }

    /// Aborts any in-flight request by dropping it at the next `select!`
    /// poll point, which happens within the suspension points named in spec
    /// §5 (sub-2s in practice, never more than one backoff sleep tick).
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
        self.set_state(ControlState::Stopped);
    }

    async fn persisted_auth_token(&self) -> Result<Option<String>, ControlError> {
        Ok(self.store.get(AUTH_TOKEN_STORE_KEY).await?.and_then(|b| String::from_utf8(b).ok()))
    }

    fn coordinator_addr(&self) -> Result<(String, u16), ControlError> {
        let url = reqwest::Url::parse(&self.control_url.lock()).map_err(|_| ControlError::BadControlUrl)?;
        let host = url.host_str().ok_or(ControlError::BadControlUrl)?.to_string();
        let port = url.port_or_known_default().unwrap_or(443);
        Ok((host, port))
    }

    async fn dial_coordinator(&self) -> Result<TcpStream, ControlError> {
        let (host, port) = self.coordinator_addr()?;
        Ok(TcpStream::connect((host.as_str(), port)).await?)
    }

    /// `GET U/key?v=<capVersion>` (spec §4.7 step 1).
    pub async fn fetch_coordinator_key(&self) -> Result<[u8; 32], ControlError> {
        let base = self.control_url.lock().clone();
        let url = format!("{}/key?v={}", base.trim_end_matches('/'), CAP_VERSION);
        let body = self.http.get(&url).send().await?.text().await?;
        parse_coordinator_key(&body)
    }

    fn build_register_request(&self, auth: AuthMethod) -> RegisterRequest {
        let node_key = self.key_material.node_public();
        let machine_key = self.key_material.machine_public();
        let node_key_signature = self.key_material.sign(&machine_key.0);
        RegisterRequest {
            node_key,
            machine_key,
            hostinfo: Some(HostInfo {
                hostname: local_hostname(),
                os: std::env::consts::OS.to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            }),
            node_key_signature,
            auth,
        }
    }

    async fn on_registered(
        &self,
        stable_id: StableId,
        control_time: chrono::DateTime<chrono::Utc>,
    ) -> Result<(), ControlError> {
        if let Some(skew) = clock_skew_warning(control_time) {
            self.emit(Notify::ClockSkew(skew));
        }
        self.store.put(STABLE_ID_STORE_KEY, stable_id.as_bytes()).await?;
        self.set_state(ControlState::Running);
        Ok(())
    }

    /// Long-poll map stream over an already-registered session: one
    /// `MapRequest` is sent, then the server pushes `MapResponse` chunks
    /// until the connection ends or `stop()` is called (spec §4.7 step 4).
    async fn run_map_stream<S>(
        &self,
        session: &mut Session,
        stream: &mut S,
        start_generation: u64,
    ) -> Result<(), ControlError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut stop_rx = self.stop_rx.clone();
        let mut netinfo_rx = self.netinfo_rx.clone();
        let req = MapRequest { generation: start_generation, net_info: netinfo_rx.borrow().clone() };
        session.send(stream, &bincode::serialize(&req)?).await?;

        let mut current: Option<NetworkMap> = None;
        loop {
            tokio::select! {
                _ = stop_rx.changed() => return Ok(()),
                changed = netinfo_rx.changed() => {
                    if changed.is_err() {
                        continue;
                    }
                    let net_info = netinfo_rx.borrow().clone();
                    let generation = current.as_ref().map(|m| m.generation).unwrap_or(start_generation);
                    let req = MapRequest { generation, net_info };
                    session.send(stream, &bincode::serialize(&req)?).await?;
                }
                received = session.recv(stream) => {
                    let bytes = received?;
                    let resp: MapResponse = bincode::deserialize(&bytes)?;
                    match resp {
                        MapResponse::Full(map) => {
                            self.emit(Notify::Map(Arc::new(map.clone())));
                            current = Some(map);
                        }
                        MapResponse::Delta(delta) => {
                            match current.as_ref().map(|base| apply_delta(base, delta)) {
                                Some(Ok(merged)) => {
                                    self.emit(Notify::Map(Arc::new(merged.clone())));
                                    current = Some(merged);
                                }
                                Some(Err(ControlError::StaleDeltaBase)) | None => {
                                    // discard and force a full refresh on the next request.
                                    current = None;
                                }
                                Some(Err(e)) => return Err(e),
                            }
                        }
                    }
                }
            }
        }
    }

    async fn run_once(&self) -> Result<(), ControlError> {
        let remote_pub = self.fetch_coordinator_key().await?;
        let mut stream = self.dial_coordinator().await?;
        let mut session =
            wirecodec::client_handshake(self.key_material.machine_private(), &remote_pub, &mut stream).await?;

        let auth = match self.persisted_auth_token().await? {
            Some(token) => AuthMethod::PreAuthKey(token),
            None => AuthMethod::Interactive,
        };
        let req = self.build_register_request(auth);
        match send_register(&mut session, &mut stream, &req).await? {
            RegisterResponse::LoginUrl(url) => {
                self.set_state(ControlState::NeedsLogin);
                self.emit(Notify::BrowseToURL(url));
                return Ok(());
            }
            RegisterResponse::Accepted { stable_id, control_time } => {
                self.on_registered(stable_id, control_time).await?;
            }
        }

        self.run_map_stream(&mut session, &mut stream, 0).await
    }

    /// The supervisory loop: dial, register, stream map updates, and retry
    /// with backoff on any retryable error, until `stop()` is called (spec
    /// §4.7 failure policy). Intended to run as one long-lived background
    /// task owned by `NodeAgent`.
    pub async fn run(self: Arc<Self>) {
        let mut attempt: u32 = 0;
        loop {
            if *self.stop_rx.borrow() {
                return;
            }
            match self.run_once().await {
                Ok(()) => {
                    if *self.stop_rx.borrow() {
                        return;
                    }
                    attempt = 0;
                }
                Err(e) => {
                    log_event!(self.log, 0, "control", "session ended: {e}");
                    self.emit(Notify::Error(e.to_string()));
                    if !e.is_retryable() {
                        self.set_state(ControlState::NeedsLogin);
                        return;
                    }
                    let delay = backoff_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    let mut stop_rx = self.stop_rx.clone();
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = stop_rx.changed() => return,
                    }
                }
            }
        }
    }
}

async fn send_register<S>(
    session: &mut Session,
    stream: &mut S,
    req: &RegisterRequest,
) -> Result<RegisterResponse, ControlError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    session.send(stream, &bincode::serialize(req)?).await?;
    let bytes = session.recv(stream).await?;
    Ok(bincode::deserialize(&bytes)?)
}

fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{DerpMap, DnsConfig, Peer, SelfNode};
    use tokio::net::{TcpListener, TcpStream};

    fn client() -> ControlClient {
        let km = Arc::new(KeyMaterial::generate().unwrap());
        ControlClient::new(
            "https://control.example.com".into(),
            km,
            Arc::new(MemoryStore::new()),
            Arc::new(Counters::default()),
            crate::log::channel(8).0,
        )
    }

    #[test]
    fn parses_modern_json_key_response() {
        let hex32 = "01".repeat(32);
        let body = format!(r#"{{"keyType":"nodeKey","publicKey":"{hex32}"}}"#);
        let key = parse_coordinator_key(&body).unwrap();
        assert_eq!(key, [1u8; 32]);
    }

    #[test]
    fn falls_back_to_legacy_hex_string() {
        let hex32 = "02".repeat(32);
        let key = parse_coordinator_key(&hex32).unwrap();
        assert_eq!(key, [2u8; 32]);
    }

    #[test]
    fn rejects_malformed_key_response() {
        assert!(matches!(parse_coordinator_key("not hex"), Err(ControlError::BadKeyFormat)));
    }

    #[test]
    fn backoff_never_exceeds_cap_and_grows_with_attempts() {
        for attempt in 0..20 {
            let d = backoff_delay(attempt);
            assert!(d <= MAX_BACKOFF);
        }
        // at a high enough attempt count the base has saturated at the cap,
        // so the only variance left is jitter within [0, cap].
        let d = backoff_delay(10);
        assert!(d <= MAX_BACKOFF);
    }

    #[test]
    fn clock_skew_within_tolerance_is_not_flagged() {
        assert!(clock_skew_warning(chrono::Utc::now()).is_none());
    }

    #[test]
    fn clock_skew_past_threshold_is_flagged() {
        let skewed = chrono::Utc::now() - chrono::Duration::seconds(45);
        assert!(clock_skew_warning(skewed).is_some());
    }

    fn test_peer(byte: u8, addr: &str) -> Peer {
        Peer {
            stable_id: format!("peer-{byte}"),
            node_key: NodePublicKey([byte; 32]),
            machine_key: MachinePublicKey([byte; 32]),
            disco_key: crate::types::DiscoPublicKey([byte; 32]),
            addresses: vec![addr.parse().unwrap()],
            allowed_ips: vec![format!("{addr}/32").parse().unwrap()],
            endpoints: vec![],
            preferred_relay_region: None,
            key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
            tags: vec![],
            user_id: "u1".into(),
            node_key_signature: None,
        }
    }

    fn test_map(generation: u64, peers: Vec<Peer>) -> NetworkMap {
        NetworkMap {
            generation,
            self_node: SelfNode {
                stable_id: "self".into(),
                display_name: "self".into(),
                addresses: vec!["100.64.0.1".parse().unwrap()],
                key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
            },
            peers,
            dns_config: DnsConfig::default(),
            packet_filter: vec![],
            ssh_policy: None,
            derp_map: DerpMap::default(),
            control_time: chrono::Utc::now(),
        }
    }

    #[test]
    fn apply_delta_upserts_and_removes_peers() {
        let base = test_map(1, vec![test_peer(1, "100.64.0.2"), test_peer(2, "100.64.0.3")]);
        let delta = MapDelta {
            base_generation: 1,
            generation: 2,
            peers_upserted: vec![test_peer(3, "100.64.0.4")],
            peers_removed: vec![NodePublicKey([1u8; 32])],
            dns_config: None,
            packet_filter: None,
            derp_map: None,
            control_time: chrono::Utc::now(),
        };
        let merged = apply_delta(&base, delta).unwrap();
        assert_eq!(merged.generation, 2);
        let keys: Vec<_> = merged.peers.iter().map(|p| p.node_key.clone()).collect();
        assert!(!keys.contains(&NodePublicKey([1u8; 32])));
        assert!(keys.contains(&NodePublicKey([2u8; 32])));
        assert!(keys.contains(&NodePublicKey([3u8; 32])));
    }

    #[test]
    fn apply_delta_rejects_stale_base_generation() {
        let base = test_map(5, vec![]);
        let delta = MapDelta {
            base_generation: 1,
            generation: 2,
            peers_upserted: vec![],
            peers_removed: vec![],
            dns_config: None,
            packet_filter: None,
            derp_map: None,
            control_time: chrono::Utc::now(),
        };
        assert!(matches!(apply_delta(&base, delta), Err(ControlError::StaleDeltaBase)));
    }

    #[tokio::test]
    async fn logout_clears_persisted_auth_token_and_sets_needs_login() {
        let client = client();
        client.store.put(AUTH_TOKEN_STORE_KEY, b"some-token").await.unwrap();
        client.logout().await.unwrap();
        assert_eq!(client.state(), ControlState::NeedsLogin);
        assert!(client.persisted_auth_token().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_prefs_persists_and_notifies() {
        let client = client();
        let mut notifications = client.notifications();
        let mut prefs = Prefs::default();
        prefs.hostname = "box".into();
        client.set_prefs(prefs.clone()).await.unwrap();
        let stored = client.store.get(PREFS_STORE_KEY).await.unwrap().unwrap();
        let decoded: Prefs = serde_json::from_slice(&stored).unwrap();
        assert_eq!(decoded.hostname, "box");
        match notifications.recv().await.unwrap() {
            Notify::Prefs(p) => assert_eq!(p.hostname, "box"),
            other => panic!("unexpected notification: {other:?}"),
        }
    }

    /// End-to-end register round trip: a bare TCP listener plays the
    /// coordinator's server-side handshake and answers one `RegisterRequest`
    /// directly (no `/key` HTTP fetch involved), mirroring DataPlane's own
    /// handshake tests.
    #[tokio::test]
    async fn register_round_trip_over_real_tcp() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let coordinator_priv = crate::wirecodec::generate_static_keypair();

        let server = tokio::spawn({
            let coordinator_priv = coordinator_priv.0;
            async move {
                let (mut stream, _) = listener.accept().await.unwrap();
                let (_client_key, mut session) =
                    wirecodec::server_handshake(&coordinator_priv, &mut stream).await.unwrap();
                let req_bytes = session.recv(&mut stream).await.unwrap();
                let _req: RegisterRequest = bincode::deserialize(&req_bytes).unwrap();
                let resp = RegisterResponse::Accepted {
                    stable_id: "node-1".into(),
                    control_time: chrono::Utc::now(),
                };
                session.send(&mut stream, &bincode::serialize(&resp).unwrap()).await.unwrap();
            }
        });

        let client_km = Arc::new(KeyMaterial::generate().unwrap());
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut session =
            wirecodec::client_handshake(client_km.machine_private(), &coordinator_priv.1, &mut stream)
                .await
                .unwrap();
        let req = RegisterRequest {
            node_key: client_km.node_public(),
            machine_key: client_km.machine_public(),
            hostinfo: None,
            node_key_signature: client_km.sign(&client_km.machine_public().0),
            auth: AuthMethod::Interactive,
        };
        let resp = send_register(&mut session, &mut stream, &req).await.unwrap();
        match resp {
            RegisterResponse::Accepted { stable_id, .. } => assert_eq!(stable_id, "node-1"),
            RegisterResponse::LoginUrl(_) => panic!("expected Accepted"),
        }
        server.await.unwrap();
    }
}
