//! DataPlane (spec §4.6): owns the UDP sockets, the TUN handle, and the
//! overlay-address ↔ peer ↔ session bookkeeping. Sessions are created
//! lazily, rekeyed per [`crate::wirecodec`] rules, and destroyed when a peer
//! disappears or the map generation rotates its keys.
//!
//! Grounded on the teacher's `net/connections.rs` `maintain_connection`/
//! `maintain_passthrough` select-loop shape (one task per peer, reconnect on
//! failure) translated from its WS+TCP transport to UDP, and on `innernet`'s
//! `ipnet`-based `AllowedIp` modeling for overlay address ownership.

pub mod packet_filter;
mod relay_client;

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use snow::HandshakeState;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;

use crate::counters::Counters;
use crate::disco::{self, DiscoKeyPair, DiscoMessage, DATA_WIRE_PREFIX, DISCO_WIRE_PREFIX};
use crate::keymaterial::key_id_bytes;
use crate::log::{LogEvent, LogSender};
use crate::peer_path::{Candidate, CandidateClass, PathState, PeerPath};
use crate::platform::{PlatformError, TunHandle};
use crate::relay::frame::{self, FrameType};
use crate::types::{DerpNode, NetworkMap, NodePublicKey, Peer, Protocol};
use crate::wirecodec::{self, Session, WireCodecError};
use packet_filter::PacketFilter;
use relay_client::RelayLink;

const KEY_ID_LEN: usize = 16;
/// Disco and data records share prefix 0x01/0x02; handshake records get a
/// third wire prefix so the two exchanges can share one UDP socket (spec
/// §4.4: "carried inside regular data-plane UDP packets via a distinguished
/// wire prefix").
const HANDSHAKE_WIRE_PREFIX: u8 = 0x03;
const HANDSHAKE_KIND_INITIATOR: u8 = 1;
const HANDSHAKE_KIND_RESPONDER: u8 = 2;

/// Where a record is headed, or where it arrived from: a direct UDP
/// address, or a relay region plus the peer's machine-key identity as the
/// relay server knows it (spec §4.6 relay fallback).
#[derive(Clone)]
enum ReplyVia {
    Udp(SocketAddr),
    Relay(u32, NodePublicKey),
}

#[derive(Debug, Error)]
pub enum DataPlaneError {
    #[error("dataplane: unknown peer")]
    UnknownPeer,
    #[error("dataplane: no path to peer, dropped")]
    NoPath,
    #[error("dataplane: blocked by packet filter")]
    FilterDenied,
    #[error("dataplane: wire codec error: {0}")]
    WireCodec(#[from] WireCodecError),
    #[error("dataplane: platform error: {0}")]
    Platform(#[from] PlatformError),
    #[error("dataplane: socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("dataplane: record too short")]
    Truncated,
    #[error("dataplane: handshake already in flight")]
    HandshakeInFlight,
}

/// Per-peer runtime state: the immutable `NetworkMap` record, the NAT
/// traversal state machine, and the lazily-established session.
pub struct PeerState {
    pub peer: Peer,
    pub path: Mutex<PeerPath>,
    pub session: Mutex<Option<Session>>,
}

impl PeerState {
    fn new(peer: Peer) -> Self {
        let mut path = PeerPath::new(peer.preferred_relay_region.unwrap_or(0));
        path.on_peer_appeared();
        Self { peer, path: Mutex::new(path), session: Mutex::new(None) }
    }
}

pub struct DataPlane {
    udp4: Arc<UdpSocket>,
    udp6: Option<Arc<UdpSocket>>,
    tun: Box<dyn TunHandle>,
    peers: DashMap<NodePublicKey, Arc<PeerState>>,
    overlay_to_key: DashMap<IpAddr, NodePublicKey>,
    key_id_to_key: DashMap<[u8; KEY_ID_LEN], NodePublicKey>,
    addr_to_key: DashMap<SocketAddr, NodePublicKey>,
    machine_to_key: DashMap<[u8; 32], NodePublicKey>,
    pending_initiator: DashMap<NodePublicKey, HandshakeState>,
    derp_regions: DashMap<u32, DerpNode>,
    relay_links: DashMap<u32, Arc<RelayLink>>,
    self_weak: Weak<DataPlane>,
    self_node_key: NodePublicKey,
    machine_priv: [u8; 32],
    disco_key: DiscoKeyPair,
    filter: Arc<PacketFilter>,
    counters: Arc<Counters>,
    shields_up: AtomicBool,
    log: LogSender,
}

impl DataPlane {
    pub fn new(
        udp4: UdpSocket,
        udp6: Option<UdpSocket>,
        tun: Box<dyn TunHandle>,
        self_node_key: NodePublicKey,
        machine_priv: [u8; 32],
        filter: Arc<PacketFilter>,
        counters: Arc<Counters>,
        log: LogSender,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            udp4: Arc::new(udp4),
            udp6: udp6.map(Arc::new),
            tun,
            peers: DashMap::new(),
            overlay_to_key: DashMap::new(),
            key_id_to_key: DashMap::new(),
            addr_to_key: DashMap::new(),
            machine_to_key: DashMap::new(),
            pending_initiator: DashMap::new(),
            derp_regions: DashMap::new(),
            relay_links: DashMap::new(),
            self_weak: weak.clone(),
            self_node_key,
            machine_priv,
            disco_key: DiscoKeyPair::generate(),
            filter,
            counters,
            shields_up: AtomicBool::new(false),
            log,
        })
    }

    /// Applies a `Prefs.shieldsUp` change (spec §4.8): when set, every
    /// inbound-from-peer packet is dropped before it reaches the packet
    /// filter, regardless of `allowedIPs`/filter rules.
    pub fn set_shields_up(&self, on: bool) {
        self.shields_up.store(on, Ordering::Relaxed);
    }

    /// Reconciles the peer table against a new `NetworkMap` generation:
    /// peers gone from the map are torn down, new peers start in
    /// `ProbingDirect`, and a packet-filter generation swap is installed
    /// atomically (spec §4.6, §4.8).
    pub async fn apply_network_map(&self, map: &NetworkMap) {
        let compiled = packet_filter::CompiledFilter::compile(map.generation, map.packet_filter.clone());
        self.filter.replace(compiled).await;

        self.derp_regions.clear();
        for node in &map.derp_map.regions {
            self.derp_regions.insert(node.region_id, node.clone());
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &map.peers {
            seen.insert(peer.node_key.clone());
            let key_id = key_id_bytes(&peer.node_key.0);
            self.key_id_to_key.insert(key_id, peer.node_key.clone());
            self.machine_to_key.insert(peer.machine_key.0, peer.node_key.clone());
            for addr in &peer.addresses {
                self.overlay_to_key.insert(*addr, peer.node_key.clone());
            }
            if !self.peers.contains_key(&peer.node_key) {
                let state = Arc::new(PeerState::new(peer.clone()));
                self.peers.insert(peer.node_key.clone(), state.clone());
                let needs_probe = state.path.lock().await.take_needs_probe();
                if needs_probe && !peer.endpoints.is_empty() {
                    let candidates: Vec<(SocketAddr, CandidateClass)> =
                        peer.endpoints.iter().map(|addr| (*addr, CandidateClass::Reflexive)).collect();
                    self.ping_candidates(&peer.node_key, &peer.disco_key.0, &candidates).await;
                }
            }
        }

        let stale: Vec<NodePublicKey> = self
            .peers
            .iter()
            .filter(|e| !seen.contains(e.key()))
            .map(|e| e.key().clone())
            .collect();
        for key in stale {
            self.remove_peer(&key).await;
        }
    }

    async fn remove_peer(&self, key: &NodePublicKey) {
        if let Some((_, _state)) = self.peers.remove(key) {
            self.overlay_to_key.retain(|_, v| *v != *key);
            self.key_id_to_key.retain(|_, v| *v != *key);
            self.addr_to_key.retain(|_, v| *v != *key);
            self.machine_to_key.retain(|_, v| *v != *key);
            self.pending_initiator.remove(key);
        }
    }

    /// Records that `candidate` pinged `peer_key` over disco, for
    /// correlating a later pong (spec §4.5).
    pub async fn record_ping_sent(&self, peer_key: &NodePublicKey, candidate: Candidate) {
        if let Some(state) = self.peers.get(peer_key) {
            state.path.lock().await.record_ping_sent(candidate);
        }
    }

    /// Outbound path: a plaintext packet read from TUN, destined for
    /// `overlay_dst`. Looks up the owning peer, applies egress policy,
    /// encrypts under that peer's session (creating one lazily if needed),
    /// and transmits on the peer's currently selected path. Drops with a
    /// counter if there is `NoPath` (spec §4.6). A `Relay{region}` path
    /// carries the same record over the region's relay-client session
    /// instead of UDP.
    pub async fn send_to_overlay(&self, overlay_dst: IpAddr, plaintext: &[u8]) -> Result<(), DataPlaneError> {
        let key = self
            .overlay_to_key
            .get(&overlay_dst)
            .map(|e| e.clone())
            .ok_or(DataPlaneError::UnknownPeer)?;
        let state = self.peers.get(&key).map(|e| e.clone()).ok_or(DataPlaneError::UnknownPeer)?;

        let via = match state.path.lock().await.state().clone() {
            PathState::Direct { addr } => ReplyVia::Udp(addr),
            PathState::Relay { region } => ReplyVia::Relay(region, NodePublicKey(state.peer.machine_key.0)),
            PathState::NoPath | PathState::ProbingDirect => {
                self.counters.inc_dropped_no_path();
                return Err(DataPlaneError::NoPath);
            }
        };

        let mut guard = state.session.lock().await;
        if guard.is_none() {
            drop(guard);
            self.start_handshake(&key, &state.peer, via).await?;
            self.counters.inc_dropped_no_path();
            return Err(DataPlaneError::NoPath);
        }
        let session = guard.as_mut().expect("session present");
        let ciphertext = session.encrypt(plaintext)?;
        drop(guard);

        let key_id = key_id_bytes(&key.0);
        let mut record = Vec::with_capacity(1 + KEY_ID_LEN + ciphertext.len());
        record.push(DATA_WIRE_PREFIX);
        record.extend_from_slice(&key_id);
        record.extend_from_slice(&ciphertext);
        self.transmit(&via, record).await?;
        Ok(())
    }

    /// Initiates an IK handshake to `peer` over `via` if one isn't already in
    /// flight. The response is processed asynchronously by [`Self::on_datagram`]
    /// or [`Self::on_relay_frame`] when it arrives; the caller's current
    /// packet is dropped (spec §4.6: session creation is lazy, on first
    /// outbound).
    async fn start_handshake(&self, key: &NodePublicKey, peer: &Peer, via: ReplyVia) -> Result<(), DataPlaneError> {
        if self.pending_initiator.contains_key(key) {
            return Ok(());
        }
        let (hs, msg1) = wirecodec::ik_initiator_start(&self.machine_priv, &peer.machine_key.0)?;
        self.pending_initiator.insert(key.clone(), hs);

        let mut record = Vec::with_capacity(2 + msg1.len());
        record.push(HANDSHAKE_WIRE_PREFIX);
        record.push(HANDSHAKE_KIND_INITIATOR);
        record.extend_from_slice(&msg1);
        self.transmit(&via, record).await?;
        Ok(())
    }

    /// Sends `record` to wherever `via` points: a direct UDP address, or a
    /// region's relay-client session (spec §4.6 relay fallback).
    async fn transmit(&self, via: &ReplyVia, record: Vec<u8>) -> Result<(), DataPlaneError> {
        match via {
            ReplyVia::Udp(addr) => {
                self.socket_for(*addr).send_to(&record, *addr).await?;
            }
            ReplyVia::Relay(region, dst) => {
                let link = self.relay_link_for(*region).ok_or(DataPlaneError::NoPath)?;
                link.send_packet(dst, &record).await;
            }
        }
        Ok(())
    }

    /// Returns the outbound link for `region`, dialing it lazily the first
    /// time it's needed.
    fn relay_link_for(&self, region: u32) -> Option<Arc<RelayLink>> {
        if let Some(existing) = self.relay_links.get(&region) {
            return Some(existing.clone());
        }
        let node = self.derp_regions.get(&region)?.clone();
        let link = relay_client::spawn(node, self.machine_priv, self.self_weak.clone());
        self.relay_links.insert(region, link.clone());
        Some(link)
    }

    /// Inbound path (spec §4.6): a raw datagram arrived from `from`. If it
    /// carries the disco prefix, it's handed off as a `DiscoMessage`;
    /// otherwise it's a data or handshake record, decrypted and delivered to
    /// TUN only if `from`'s source IP is within the sender's `allowedIPs`.
    pub async fn on_datagram(&self, from: SocketAddr, datagram: &[u8]) -> Result<(), DataPlaneError> {
        self.handle_record(ReplyVia::Udp(from), datagram).await
    }

    /// Inbound path for a `RecvPacket` frame handed back from a region's
    /// relay-client session: same record format as a direct UDP datagram,
    /// just unwrapped one layer of relay framing (spec §4.6, "identical to
    /// UDP after the relay framing is stripped").
    async fn on_relay_frame(&self, region: u32, body: &[u8]) -> Result<(), DataPlaneError> {
        match frame::frame_type(body) {
            Ok(FrameType::RecvPacket) => {
                let (src, payload) = frame::decode_recv_packet(body).map_err(|_| DataPlaneError::Truncated)?;
                self.handle_record(ReplyVia::Relay(region, src), payload).await
            }
            _ => Ok(()),
        }
    }

    async fn handle_record(&self, via: ReplyVia, datagram: &[u8]) -> Result<(), DataPlaneError> {
        if datagram.is_empty() {
            return Err(DataPlaneError::Truncated);
        }
        match datagram[0] {
            DISCO_WIRE_PREFIX => {
                // Hole-punch assist needs a real observed source address;
                // disco isn't carried over the relay client.
                let ReplyVia::Udp(from) = via else { return Ok(()) };
                let (sender_disco, msg) = disco::open(&self.disco_key, &datagram[1..])
                    .map_err(|_| DataPlaneError::Truncated)?;
                self.handle_disco(from, sender_disco, msg).await;
                Ok(())
            }
            DATA_WIRE_PREFIX => self.on_data_record(via, datagram).await,
            HANDSHAKE_WIRE_PREFIX => self.on_handshake_record(via, datagram).await,
            _ => Err(DataPlaneError::Truncated),
        }
    }

    async fn on_handshake_record(&self, via: ReplyVia, datagram: &[u8]) -> Result<(), DataPlaneError> {
        if datagram.len() < 2 {
            return Err(DataPlaneError::Truncated);
        }
        let kind = datagram[1];
        let payload = &datagram[2..];
        match kind {
            HANDSHAKE_KIND_INITIATOR => {
                let (hs, msg2, remote_static) = wirecodec::ik_responder_accept(&self.machine_priv, payload)?;
                // `remote_static` is the peer's machine key (the Noise DH
                // static), wrapped in `NodePublicKey` by wirecodec's generic
                // handshake helpers; resolve it back to the node identity
                // the data plane actually indexes peers by.
                let key = self
                    .machine_to_key
                    .get(&remote_static.0)
                    .map(|e| e.clone())
                    .ok_or(DataPlaneError::UnknownPeer)?;
                let session = wirecodec::ik_responder_finish(hs, remote_static)?;
                if let Some(state) = self.peers.get(&key) {
                    *state.session.lock().await = Some(session);
                    if let ReplyVia::Udp(from) = via {
                        self.addr_to_key.insert(from, key.clone());
                    }
                }

                let mut record = Vec::with_capacity(2 + msg2.len());
                record.push(HANDSHAKE_WIRE_PREFIX);
                record.push(HANDSHAKE_KIND_RESPONDER);
                record.extend_from_slice(&msg2);
                self.transmit(&via, record).await?;
                Ok(())
            }
            HANDSHAKE_KIND_RESPONDER => {
                let key = match &via {
                    ReplyVia::Udp(from) => self.addr_to_key.get(from).map(|e| e.clone()),
                    ReplyVia::Relay(_, sender_key) => self.machine_to_key.get(&sender_key.0).map(|e| e.clone()),
                }
                .ok_or(DataPlaneError::UnknownPeer)?;
                let Some((_, hs)) = self.pending_initiator.remove(&key) else {
                    return Err(DataPlaneError::HandshakeInFlight);
                };
                let session = wirecodec::ik_initiator_finish(hs, payload)?;
                if let Some(state) = self.peers.get(&key) {
                    *state.session.lock().await = Some(session);
                }
                Ok(())
            }
            _ => Err(DataPlaneError::Truncated),
        }
    }

    async fn on_data_record(&self, via: ReplyVia, datagram: &[u8]) -> Result<(), DataPlaneError> {
        if self.shields_up.load(Ordering::Relaxed) {
            self.counters.inc_dropped_by_filter();
            return Err(DataPlaneError::FilterDenied);
        }
        if datagram.len() < 1 + KEY_ID_LEN {
            return Err(DataPlaneError::Truncated);
        }
        let mut key_id = [0u8; KEY_ID_LEN];
        key_id.copy_from_slice(&datagram[1..1 + KEY_ID_LEN]);
        let ciphertext = &datagram[1 + KEY_ID_LEN..];

        let key = self
            .key_id_to_key
            .get(&key_id)
            .map(|e| e.clone())
            .ok_or(DataPlaneError::UnknownPeer)?;
        let state = self.peers.get(&key).map(|e| e.clone()).ok_or(DataPlaneError::UnknownPeer)?;

        let mut guard = state.session.lock().await;
        let Some(session) = guard.as_mut() else {
            return Err(DataPlaneError::NoPath);
        };
        let plaintext = match session.decrypt(ciphertext) {
            Ok(p) => p,
            Err(e) => {
                self.counters.inc_decrypt_failures();
                return Err(e.into());
            }
        };
        drop(guard);
        if let ReplyVia::Udp(from) = via {
            self.addr_to_key.insert(from, key.clone());
        }

        let Some(src_ip) = sniff_src_ip(&plaintext) else {
            return Ok(());
        };
        if !state.peer.owns_source(src_ip) {
            self.counters.inc_dropped_by_filter();
            return Err(DataPlaneError::FilterDenied);
        }

        let dst_ip = sniff_dst_ip(&plaintext).unwrap_or(src_ip);
        let port = sniff_dst_port(&plaintext).unwrap_or(0);
        if !self.filter.allows(src_ip, dst_ip, port, Protocol::Any).await {
            self.counters.inc_dropped_by_filter();
            return Err(DataPlaneError::FilterDenied);
        }

        self.tun.send(&plaintext).await?;
        Ok(())
    }

    async fn handle_disco(&self, from: SocketAddr, sender_disco: [u8; 32], msg: DiscoMessage) {
        match msg {
            DiscoMessage::Ping { tx_id, node_key } => {
                let pong = DiscoMessage::Pong { tx_id, observed_src: from };
                if let Ok(boxed) = disco::seal(&self.disco_key, &sender_disco, &pong) {
                    let mut record = Vec::with_capacity(1 + boxed.len());
                    record.push(DISCO_WIRE_PREFIX);
                    record.extend_from_slice(&boxed);
                    let _ = self.socket_for(from).send_to(&record, from).await;
                }
                let _ = node_key;
            }
            DiscoMessage::Pong { tx_id, observed_src } => {
                for entry in self.peers.iter() {
                    let key = entry.key().clone();
                    let state = entry.value().clone();
                    let mut path = state.path.lock().await;
                    if path.on_heartbeat_pong(tx_id, observed_src) {
                        break;
                    }
                    let locked_in = path.on_pong(tx_id, observed_src);
                    drop(path);
                    if locked_in {
                        self.addr_to_key.insert(observed_src, key);
                        break;
                    }
                }
            }
            DiscoMessage::CallMeMaybe { endpoints } => {
                let Some(key) = self.addr_to_key.get(&from).map(|e| e.clone()) else {
                    self.log_debug(&format!("call-me-maybe with {} endpoints from unknown peer", endpoints.len()));
                    return;
                };
                let Some(state) = self.peers.get(&key).map(|e| e.clone()) else { return };
                state.path.lock().await.on_call_me_maybe();
                // Invite: immediately ping every endpoint the peer listed,
                // in addition to its NetworkMap-advertised candidates (spec
                // §4.4 "call-me-maybe").
                let candidates: Vec<(SocketAddr, CandidateClass)> =
                    endpoints.iter().map(|addr| (*addr, CandidateClass::Reflexive)).collect();
                self.ping_candidates(&key, &state.peer.disco_key.0, &candidates).await;
            }
        }
    }

    /// Sends a disco `Ping` to every supplied candidate in parallel, for the
    /// caller's probing loop to invoke once per `PeerPath::on_peer_appeared`
    /// or `on_call_me_maybe` transition (spec §4.5).
    pub async fn ping_candidates(
        &self,
        peer_key: &NodePublicKey,
        peer_disco_pub: &[u8; 32],
        candidates: &[(SocketAddr, CandidateClass)],
    ) {
        for (addr, class) in candidates {
            let tx_id = disco::next_tx_id();
            let ping = DiscoMessage::Ping { tx_id, node_key: self.self_node_key.clone() };
            let Ok(boxed) = disco::seal(&self.disco_key, peer_disco_pub, &ping) else { continue };
            let mut record = Vec::with_capacity(1 + boxed.len());
            record.push(DISCO_WIRE_PREFIX);
            record.extend_from_slice(&boxed);
            if self.socket_for(*addr).send_to(&record, *addr).await.is_ok() {
                self.record_ping_sent(
                    peer_key,
                    Candidate { addr: *addr, class: *class, tx_id, sent_at: std::time::Instant::now() },
                )
                .await;
            }
        }
    }

    /// Per-peer maintenance tick (spec §4.5): sends a heartbeat ping on an
    /// established `Direct` path when one is due, or counts a loss if the
    /// last heartbeat went unanswered; always advances the probe-retry
    /// timeout. Meant to be called once per tick from the agent's
    /// maintenance loop, independent of inbound traffic.
    pub async fn maintain_peers(&self) {
        let snapshot: Vec<Arc<PeerState>> = self.peers.iter().map(|e| e.value().clone()).collect();
        for state in snapshot {
            let heartbeat_ping = {
                let mut path = state.path.lock().await;
                path.tick_probe_timeout();
                if path.heartbeat_due() {
                    if let PathState::Direct { addr } = path.state().clone() {
                        let tx_id = disco::next_tx_id();
                        path.mark_heartbeat_sent();
                        Some((addr, tx_id))
                    } else {
                        None
                    }
                } else {
                    path.check_heartbeat_timeout();
                    None
                }
            };
            if let Some((addr, tx_id)) = heartbeat_ping {
                let ping = DiscoMessage::Ping { tx_id, node_key: self.self_node_key.clone() };
                if let Ok(boxed) = disco::seal(&self.disco_key, &state.peer.disco_key.0, &ping) {
                    let mut record = Vec::with_capacity(1 + boxed.len());
                    record.push(DISCO_WIRE_PREFIX);
                    record.extend_from_slice(&boxed);
                    let _ = self.socket_for(addr).send_to(&record, addr).await;
                }
            }
        }
    }

    fn socket_for(&self, addr: SocketAddr) -> &Arc<UdpSocket> {
        match (addr, &self.udp6) {
            (SocketAddr::V6(_), Some(udp6)) => udp6,
            _ => &self.udp4,
        }
    }

    /// The bound UDP4 socket, shared with `EndpointProber` so STUN/reflexive
    /// probes observe the same source port the overlay traffic uses.
    pub fn udp4_handle(&self) -> Arc<UdpSocket> {
        self.udp4.clone()
    }

    /// This instance's disco public key, for `NodeAgent` to include in its
    /// registration with the coordinator so peers learn it via `Peer.disco_key`
    /// (spec §4.4).
    pub fn disco_public_key(&self) -> crate::types::DiscoPublicKey {
        crate::types::DiscoPublicKey(self.disco_key.public())
    }

    fn log_debug(&self, message: &str) {
        let _ = self.log.try_send(LogEvent::new(2, "dataplane", message.to_string()));
    }
}

/// Best-effort overlay-packet source IP sniff (IPv4/IPv6 header only; the
/// data plane does not otherwise parse payload contents per spec §4.6:
/// "the data plane preserves neither order nor delivery").
fn sniff_src_ip(packet: &[u8]) -> Option<IpAddr> {
    ip_header_field(packet, 12, 8)
}

fn sniff_dst_ip(packet: &[u8]) -> Option<IpAddr> {
    ip_header_field(packet, 16, 24)
}

fn ip_header_field(packet: &[u8], v4_offset: usize, v6_offset: usize) -> Option<IpAddr> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => {
            if packet.len() < v4_offset + 4 {
                return None;
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[v4_offset..v4_offset + 4]);
            Some(IpAddr::from(octets))
        }
        6 => {
            if packet.len() < v6_offset + 16 {
                return None;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[v6_offset..v6_offset + 16]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn sniff_dst_port(packet: &[u8]) -> Option<u16> {
    if packet.is_empty() {
        return None;
    }
    let (ihl_bytes, proto_offset) = match packet[0] >> 4 {
        4 => (((packet.first()? & 0x0f) as usize) * 4, 9),
        6 => (40, 6),
        _ => return None,
    };
    if packet.len() <= proto_offset {
        return None;
    }
    let proto = packet[proto_offset];
    if proto != 6 && proto != 17 {
        return None;
    }
    let dst_port_offset = ihl_bytes + 2;
    if packet.len() < dst_port_offset + 2 {
        return None;
    }
    Some(u16::from_be_bytes([packet[dst_port_offset], packet[dst_port_offset + 1]]))
}
