//! Concrete Scenario 3 (spec §8): two nodes behind NATs that never manage a
//! direct path fall back to relaying through a DERP-style region. Spins up a
//! real (TLS-fronted, self-signed) `RelayServer` on loopback and drives two
//! `DataPlane`s against it entirely through public API, the same way a real
//! deployment's relay fallback would unfold once `PeerPath`'s direct-probe
//! timeout elapses.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rcgen::CertifiedKey;
use tokio::net::{TcpListener, UdpSocket};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use meshd::counters::Counters;
use meshd::dataplane::packet_filter::PacketFilter;
use meshd::dataplane::DataPlane;
use meshd::platform::{PlatformError, TunHandle};
use meshd::relay::{RelayConfig, RelayServer};
use meshd::types::{
    DerpMap, DerpNode, DnsConfig, FilterRule, MachinePublicKey, NetworkMap, NodePublicKey, Peer, PortRange, Protocol,
    SelfNode,
};

#[derive(Clone, Default)]
struct CapturingTunHandle {
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

#[async_trait]
impl TunHandle for CapturingTunHandle {
    async fn send(&self, packet: &[u8]) -> Result<(), PlatformError> {
        self.received.lock().unwrap().push(packet.to_vec());
        Ok(())
    }

    async fn recv(&self, _buf: &mut [u8]) -> Result<usize, PlatformError> {
        std::future::pending().await
    }
}

fn self_signed_cert() -> (Vec<CertificateDer<'static>>, PrivateKeyDer<'static>) {
    let CertifiedKey { cert, signing_key } =
        rcgen::generate_simple_self_signed(vec!["127.0.0.1".to_string()]).expect("self-signed cert generation");
    let key_der = PrivatePkcs8KeyDer::from(signing_key.serialize_der());
    (vec![cert.der().clone()], PrivateKeyDer::Pkcs8(key_der))
}

fn allow_all_rule() -> FilterRule {
    FilterRule {
        src_nets: vec!["0.0.0.0/0".parse().unwrap()],
        dst_nets: vec!["0.0.0.0/0".parse().unwrap()],
        dst_ports: vec![PortRange { start: 0, end: 65535 }],
        protocol: Protocol::Any,
    }
}

fn peer_record(
    node_key: NodePublicKey,
    machine_pub: [u8; 32],
    disco_pub: meshd::types::DiscoPublicKey,
    overlay_addr: &str,
    relay_region: u32,
) -> Peer {
    Peer {
        stable_id: overlay_addr.to_string(),
        node_key,
        machine_key: MachinePublicKey(machine_pub),
        disco_key: disco_pub,
        addresses: vec![overlay_addr.parse().unwrap()],
        allowed_ips: vec![format!("{overlay_addr}/32").parse().unwrap()],
        // no direct endpoints: the only way these two nodes converge is relay.
        endpoints: vec![],
        preferred_relay_region: Some(relay_region),
        key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
        tags: vec![],
        user_id: "u1".into(),
        node_key_signature: None,
    }
}

fn network_map(self_addr: &str, peers: Vec<Peer>, derp_map: DerpMap) -> NetworkMap {
    NetworkMap {
        generation: 1,
        self_node: SelfNode {
            stable_id: "self".into(),
            display_name: "self".into(),
            addresses: vec![self_addr.parse().unwrap()],
            key_expiry: chrono::Utc::now() + chrono::Duration::days(1),
        },
        peers,
        dns_config: DnsConfig::default(),
        packet_filter: vec![allow_all_rule()],
        ssh_policy: None,
        derp_map,
        control_time: chrono::Utc::now(),
    }
}

async fn new_dataplane(self_node_key: NodePublicKey, machine_priv: [u8; 32]) -> (Arc<DataPlane>, CapturingTunHandle) {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let tun = CapturingTunHandle::default();
    let dp = DataPlane::new(
        udp,
        None,
        Box::new(tun.clone()),
        self_node_key,
        machine_priv,
        Arc::new(PacketFilter::default()),
        Arc::new(Counters::default()),
        meshd::log::channel(16).0,
    );
    (dp, tun)
}

#[tokio::test]
async fn two_planes_fall_back_to_relay_when_direct_never_converges() {
    let (relay_machine_priv, relay_machine_pub) = meshd::wirecodec::generate_static_keypair();
    let (cert_chain, private_key) = self_signed_cert();
    let relay_config = RelayConfig {
        tcp_listen: "127.0.0.1:0".parse().unwrap(),
        stun_listen: None,
        tls_cert_chain: cert_chain,
        tls_private_key: private_key,
        machine_priv: relay_machine_priv,
        mesh_peer_keys: Default::default(),
        accept_rate_per_sec: 1000.0,
        accept_burst: 1000.0,
        debug_allow_ip: None,
        debug_allow_key: None,
    };
    let relay_counters = Arc::new(Counters::default());
    let relay = RelayServer::new(relay_config, relay_counters, meshd::log::channel(16).0).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = listener.local_addr().unwrap();
    tokio::spawn(relay.clone().run(listener));

    let derp_map = DerpMap {
        regions: vec![DerpNode {
            region_id: 1,
            host: "127.0.0.1".to_string(),
            stun_port: 0,
            https_port: relay_addr.port(),
            pub_key: MachinePublicKey(relay_machine_pub),
        }],
    };

    let (a_machine_priv, a_machine_pub) = meshd::wirecodec::generate_static_keypair();
    let (b_machine_priv, b_machine_pub) = meshd::wirecodec::generate_static_keypair();
    let a_key = NodePublicKey([0xCC; 32]);
    let b_key = NodePublicKey([0xDD; 32]);

    let (a, a_tun) = new_dataplane(a_key.clone(), a_machine_priv).await;
    let (b, b_tun) = new_dataplane(b_key.clone(), b_machine_priv).await;

    let a_map = network_map(
        "100.64.1.1",
        vec![peer_record(b_key.clone(), b_machine_pub, b.disco_public_key(), "100.64.1.2", 1)],
        derp_map.clone(),
    );
    let b_map = network_map(
        "100.64.1.2",
        vec![peer_record(a_key.clone(), a_machine_pub, a.disco_public_key(), "100.64.1.1", 1)],
        derp_map,
    );
    a.apply_network_map(&a_map).await;
    b.apply_network_map(&b_map).await;

    // with no endpoints to probe, PeerPath stays ProbingDirect until
    // DIRECT_PROBE_TIMEOUT elapses; drive it there with real wall-clock time.
    let fallback_deadline = tokio::time::Instant::now() + Duration::from_secs(7);
    loop {
        a.maintain_peers().await;
        b.maintain_peers().await;
        if tokio::time::Instant::now() >= fallback_deadline {
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    // both sides must dial the relay at least once so the server has them
    // registered as reachable destinations before either delivery can land.
    let dst_b: std::net::IpAddr = "100.64.1.2".parse().unwrap();
    let dst_a: std::net::IpAddr = "100.64.1.1".parse().unwrap();
    let _ = a.send_to_overlay(dst_b, b"warm up a's relay link").await;
    let _ = b.send_to_overlay(dst_a, b"warm up b's relay link").await;

    let both_registered = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if relay.client_count() == 2 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    assert!(both_registered.is_ok(), "both planes should have registered as relay clients");

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if a.send_to_overlay(dst_b, b"hello over relay").await.is_ok() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("relay path never converged within the timeout");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let delivered = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if !b_tun.received.lock().unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(delivered.is_ok(), "b's tun handle never received the relayed data packet");
    assert_eq!(b_tun.received.lock().unwrap()[0], b"hello over relay");
    assert!(a_tun.received.lock().unwrap().is_empty());
}
