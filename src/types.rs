//! Shared data model (spec §3): the objects every component reads or
//! reconciles against. `NetworkMap` and `Peer` are immutable once observed;
//! `PeerState` and `Prefs` are the mutable counterparts owned elsewhere.

use std::collections::HashSet;
use std::net::SocketAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

/// A node's stable, coordinator-assigned identity. Unlike the node public
/// key, this never rotates.
pub type StableId = String;

/// Hex-encoded fixed-length fingerprint of a public key (see KeyMaterial::key_id).
pub type KeyId = String;

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodePublicKey(pub [u8; 32]);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MachinePublicKey(pub [u8; 32]);

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DiscoPublicKey(pub [u8; 32]);

impl std::fmt::Display for NodePublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// This node's coordinator-assigned identity within a [`NetworkMap`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SelfNode {
    pub stable_id: StableId,
    pub display_name: String,
    pub addresses: Vec<std::net::IpAddr>,
    pub key_expiry: chrono::DateTime<chrono::Utc>,
}

/// An immutable record of one other node in the overlay.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Peer {
    pub stable_id: StableId,
    pub node_key: NodePublicKey,
    pub machine_key: MachinePublicKey,
    pub disco_key: DiscoPublicKey,
    pub addresses: Vec<std::net::IpAddr>,
    pub allowed_ips: Vec<IpNet>,
    pub endpoints: Vec<SocketAddr>,
    pub preferred_relay_region: Option<u32>,
    pub key_expiry: chrono::DateTime<chrono::Utc>,
    pub tags: Vec<String>,
    pub user_id: String,
    /// Coordinator-attached signature over `node_key` by a key currently in
    /// the NetworkLock authority's head state. `None` when NetworkLock is
    /// disabled or the coordinator hasn't signed this peer yet; checked by
    /// [`crate::network_lock::NetworkLock::is_trusted`] when a lock is
    /// active (spec §4.10).
    pub node_key_signature: Option<Vec<u8>>,
}

impl Peer {
    /// Whether `addr` is authorized to be the packet source for this peer,
    /// per spec §8's "every delivered inbound packet's source is in some
    /// peer's allowedIPs" invariant. The exit-node default route
    /// (0.0.0.0/0 or ::/0) is excluded from this check; exit routing is
    /// handled by the data plane's default-route logic, not source
    /// validation.
    pub fn owns_source(&self, addr: std::net::IpAddr) -> bool {
        self.allowed_ips.iter().any(|n| n.contains(&addr) && !is_default_route(n))
    }

    pub fn is_exit_node(&self) -> bool {
        self.allowed_ips.iter().any(is_default_route)
    }
}

fn is_default_route(n: &IpNet) -> bool {
    n.prefix_len() == 0
}

/// Resolver rules to install (platform adapter consumes this; we only carry it).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DnsConfig {
    pub resolvers: Vec<std::net::IpAddr>,
    pub search_domains: Vec<String>,
    pub routes: Vec<(String, Vec<std::net::IpAddr>)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    Any,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self { start: port, end: port }
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }
}

/// One ordered packet-filter rule (spec §4.8).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FilterRule {
    pub src_nets: Vec<IpNet>,
    pub dst_nets: Vec<IpNet>,
    pub dst_ports: Vec<PortRange>,
    pub protocol: Protocol,
}

impl FilterRule {
    pub fn matches(&self, src: std::net::IpAddr, dst: std::net::IpAddr, port: u16, proto: Protocol) -> bool {
        let proto_ok = self.protocol == Protocol::Any || self.protocol == proto;
        proto_ok
            && self.src_nets.iter().any(|n| n.contains(&src))
            && self.dst_nets.iter().any(|n| n.contains(&dst))
            && self.dst_ports.iter().any(|r| r.contains(port))
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SshRule {
    pub principals: Vec<String>,
    pub allowed_local_users: Vec<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DerpNode {
    pub region_id: u32,
    pub host: String,
    pub stun_port: u16,
    pub https_port: u16,
    /// Machine public key the relay authenticates its WireCodec session
    /// with; dialing clients need this to address `client_handshake` (spec
    /// §4.6 relay fallback).
    pub pub_key: MachinePublicKey,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct DerpMap {
    pub regions: Vec<DerpNode>,
}

/// The authoritative snapshot of the overlay at a point in time (spec §3).
/// Immutable once observed; replacement is atomic (a whole new `Arc<NetworkMap>`
/// swap, never a field-by-field mutation).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkMap {
    pub generation: u64,
    pub self_node: SelfNode,
    pub peers: Vec<Peer>,
    pub dns_config: DnsConfig,
    pub packet_filter: Vec<FilterRule>,
    pub ssh_policy: Option<Vec<SshRule>>,
    pub derp_map: DerpMap,
    pub control_time: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkMapError {
    #[error("network map: selfNode.addresses must be non-empty")]
    EmptySelfAddresses,
    #[error("network map: selfNode address {0} collides with peer {1}")]
    SelfPeerAddressCollision(std::net::IpAddr, StableId),
    #[error("network map: duplicate peer node key {0}")]
    DuplicatePeerKey(NodePublicKey),
    #[error("network map: overlapping allowedIPs between {0} and {1}")]
    OverlappingAllowedIps(StableId, StableId),
    #[error("network map: more than one peer advertises the exit-node default route")]
    MultipleExitNodes,
}

impl NetworkMap {
    /// Validates the invariants from spec §3: non-empty, disjoint self
    /// addresses; unique peer keys; pairwise-disjoint allowedIPs except for
    /// at most one exit-node default route.
    pub fn validate(&self) -> Result<(), NetworkMapError> {
        if self.self_node.addresses.is_empty() {
            return Err(NetworkMapError::EmptySelfAddresses);
        }
        let self_addrs: HashSet<_> = self.self_node.addresses.iter().collect();
        let mut seen_keys = HashSet::new();
        for peer in &self.peers {
            if !seen_keys.insert(peer.node_key.clone()) {
                return Err(NetworkMapError::DuplicatePeerKey(peer.node_key.clone()));
            }
            for addr in &peer.addresses {
                if self_addrs.contains(addr) {
                    return Err(NetworkMapError::SelfPeerAddressCollision(
                        *addr,
                        peer.stable_id.clone(),
                    ));
                }
            }
        }
        if self.peers.iter().filter(|p| p.is_exit_node()).count() > 1 {
            return Err(NetworkMapError::MultipleExitNodes);
        }
        for (i, a) in self.peers.iter().enumerate() {
            for b in &self.peers[i + 1..] {
                for na in &a.allowed_ips {
                    if is_default_route(na) {
                        continue;
                    }
                    for nb in &b.allowed_ips {
                        if is_default_route(nb) {
                            continue;
                        }
                        if nets_overlap(na, nb) {
                            return Err(NetworkMapError::OverlappingAllowedIps(
                                a.stable_id.clone(),
                                b.stable_id.clone(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    pub fn peer_by_key(&self, key: &NodePublicKey) -> Option<&Peer> {
        self.peers.iter().find(|p| &p.node_key == key)
    }

    pub fn peer_by_overlay_addr(&self, addr: std::net::IpAddr) -> Option<&Peer> {
        self.peers.iter().find(|p| p.owns_source(addr) || p.addresses.contains(&addr))
    }
}

fn nets_overlap(a: &IpNet, b: &IpNet) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// User preferences (spec §3), persisted through the [`KvStore`] contract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Prefs {
    pub want_running: bool,
    pub control_url: String,
    pub exit_node_id: Option<StableId>,
    pub route_all: bool,
    pub corp_dns: bool,
    pub shields_up: bool,
    pub force_daemon: bool,
    pub advertise_routes: Vec<IpNet>,
    pub advertise_tags: Vec<String>,
    pub hostname: String,
}

impl Default for Prefs {
    fn default() -> Self {
        Self {
            want_running: false,
            control_url: String::new(),
            exit_node_id: None,
            route_all: false,
            corp_dns: true,
            shields_up: false,
            force_daemon: false,
            advertise_routes: Vec::new(),
            advertise_tags: Vec::new(),
            hostname: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(stable_id: &str, key_byte: u8, nets: Vec<&str>) -> Peer {
        Peer {
            stable_id: stable_id.to_string(),
            node_key: NodePublicKey([key_byte; 32]),
            machine_key: MachinePublicKey([key_byte; 32]),
            disco_key: DiscoPublicKey([key_byte; 32]),
            addresses: vec![],
            allowed_ips: nets.into_iter().map(|n| n.parse().unwrap()).collect(),
            endpoints: vec![],
            preferred_relay_region: None,
            key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
            tags: vec![],
            user_id: "u1".into(),
            node_key_signature: None,
        }
    }

    fn base_map(peers: Vec<Peer>) -> NetworkMap {
        NetworkMap {
            generation: 1,
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
    fn rejects_duplicate_peer_keys() {
        let map = base_map(vec![
            peer("a", 1, vec!["100.64.0.2/32"]),
            peer("b", 1, vec!["100.64.0.3/32"]),
        ]);
        assert!(matches!(map.validate(), Err(NetworkMapError::DuplicatePeerKey(_))));
    }

    #[test]
    fn rejects_overlapping_allowed_ips() {
        let map = base_map(vec![
            peer("a", 1, vec!["100.64.0.0/24"]),
            peer("b", 2, vec!["100.64.0.128/25"]),
        ]);
        assert!(matches!(map.validate(), Err(NetworkMapError::OverlappingAllowedIps(..))));
    }

    #[test]
    fn rejects_two_peers_advertising_default_route() {
        let map = base_map(vec![
            peer("a", 1, vec!["0.0.0.0/0"]),
            peer("b", 2, vec!["0.0.0.0/0"]),
        ]);
        assert!(matches!(map.validate(), Err(NetworkMapError::MultipleExitNodes)));
    }

    #[test]
    fn rejects_self_peer_address_collision() {
        let map = base_map(vec![Peer {
            addresses: vec!["100.64.0.1".parse().unwrap()],
            ..peer("a", 1, vec!["100.64.0.2/32"])
        }]);
        assert!(matches!(
            map.validate(),
            Err(NetworkMapError::SelfPeerAddressCollision(..))
        ));
    }

    #[test]
    fn filter_rule_matches_declared_fields_only() {
        let rule = FilterRule {
            src_nets: vec!["100.64.0.0/10".parse().unwrap()],
            dst_nets: vec!["100.64.0.5/32".parse().unwrap()],
            dst_ports: vec![PortRange::single(22)],
            protocol: Protocol::Tcp,
        };
        assert!(rule.matches(
            "100.64.1.1".parse().unwrap(),
            "100.64.0.5".parse().unwrap(),
            22,
            Protocol::Tcp
        ));
        assert!(!rule.matches(
            "100.64.1.1".parse().unwrap(),
            "100.64.0.5".parse().unwrap(),
            53,
            Protocol::Udp
        ));
    }
}
