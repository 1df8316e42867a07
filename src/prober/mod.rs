//! EndpointProber (spec §4.3): ranks the set of transport addresses this
//! node can offer to peers. Runs every `IDLE_PROBE_INTERVAL` while idle, and
//! on demand when a path is lost; all probe kinds run cooperatively on a
//! single task, coalescing at-most-one in-flight request per kind.
//!
//! Grounded on the teacher's single-task cooperative scheduling idiom
//! (`net/utils.rs`'s one coordinator loop multiplexing several concurrent
//! concerns over a `tokio::select!`) generalized to a periodic-plus-on-demand
//! schedule. STUN wire handling lives in [`stun`].

pub mod stun;

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::timeout;

use crate::types::DerpMap;

pub const IDLE_PROBE_INTERVAL: Duration = Duration::from_secs(30);
pub const STUN_TIMEOUT: Duration = Duration::from_secs(2);
pub const HTTPS_LATENCY_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Error)]
pub enum ProberError {
    #[error("prober: no relay regions configured")]
    NoRelayRegions,
    #[error("prober: stun probe failed: {0}")]
    Stun(#[from] stun::StunError),
    #[error("prober: socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("prober: probe timed out")]
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkType {
    Wired,
    Wifi,
    Unknown,
}

/// Advisory snapshot of this node's reachability (spec §4.3). Consumers must
/// treat this as advisory; the data plane always re-validates paths via
/// disco pings. Serializable so `ControlClient` can push it to the
/// coordinator as part of a `MapRequest` (spec §4.7 step 5).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NetInfo {
    pub mapping_varies_by_dest_ip: bool,
    pub hairpinning: bool,
    pub working_ipv6: bool,
    pub working_udp: bool,
    pub have_port_map: bool,
    pub preferred_relay_region: Option<u32>,
    pub relay_latency: HashMap<u32, Duration>,
    pub link_type: LinkType,
}

impl Default for NetInfo {
    fn default() -> Self {
        Self {
            mapping_varies_by_dest_ip: false,
            hairpinning: false,
            working_ipv6: false,
            working_udp: false,
            have_port_map: false,
            preferred_relay_region: None,
            relay_latency: HashMap::new(),
            link_type: LinkType::Unknown,
        }
    }
}

/// Tracks which probe kinds currently have a request in flight, so repeated
/// callers coalesce onto the one outstanding probe (spec §4.3 scheduling).
#[derive(Default)]
struct InFlight {
    local: AtomicBool,
    reflexive: AtomicBool,
    port_map: AtomicBool,
    relay: AtomicBool,
}

impl InFlight {
    fn try_enter(flag: &AtomicBool) -> bool {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok()
    }

    fn leave(flag: &AtomicBool) {
        flag.store(false, Ordering::Release);
    }
}

pub struct EndpointProber {
    socket: Arc<UdpSocket>,
    derp_map: DerpMap,
    in_flight: InFlight,
}

impl EndpointProber {
    pub fn new(socket: Arc<UdpSocket>, derp_map: DerpMap) -> Self {
        Self { socket, derp_map, in_flight: InFlight::default() }
    }

    pub fn set_derp_map(&mut self, derp_map: DerpMap) {
        self.derp_map = derp_map;
    }

    /// Local candidates: every non-loopback, non-link-local host address
    /// paired with the UDP socket's bound port (spec §4.3 probe 1).
    pub fn probe_local(&self, host_addrs: &[IpAddr]) -> Vec<SocketAddr> {
        if !InFlight::try_enter(&self.in_flight.local) {
            return Vec::new();
        }
        let _guard = scopeguard(&self.in_flight.local);
        let port = self.socket.local_addr().map(|a| a.port()).unwrap_or(0);
        host_addrs
            .iter()
            .filter(|a| !a.is_loopback() && !is_link_local(a))
            .map(|a| SocketAddr::new(*a, port))
            .collect()
    }

    /// Reflexive probe: STUN Binding request against each relay region's
    /// STUN endpoint, returning the first successfully mapped address
    /// (spec §4.3 probe 2).
    pub async fn probe_reflexive(&self) -> Result<SocketAddr, ProberError> {
        if !InFlight::try_enter(&self.in_flight.reflexive) {
            return Err(ProberError::Timeout);
        }
        let _guard = scopeguard(&self.in_flight.reflexive);

        if self.derp_map.regions.is_empty() {
            return Err(ProberError::NoRelayRegions);
        }
        for region in &self.derp_map.regions {
            let target = format!("{}:{}", region.host, region.stun_port);
            let Ok(mut addrs) = tokio::net::lookup_host(&target).await else { continue };
            let Some(addr) = addrs.next() else { continue };

            let (req, tx_id) = stun::build_binding_request();
            if self.socket.send_to(&req, addr).await.is_err() {
                continue;
            }
            let mut buf = [0u8; 512];
            match timeout(STUN_TIMEOUT, self.socket.recv_from(&mut buf)).await {
                Ok(Ok((n, _from))) => {
                    if let Ok(mapped) = stun::parse_binding_response(&buf[..n], &tx_id) {
                        return Ok(mapped);
                    }
                }
                _ => continue,
            }
        }
        Err(ProberError::Timeout)
    }

    /// Port-mapped probe via UPnP/NAT-PMP/PCP against the default gateway
    /// (spec §4.3 probe 3). Returns the external address igd-next negotiated.
    pub async fn probe_port_map(&self, internal_port: u16) -> Result<SocketAddr, ProberError> {
        if !InFlight::try_enter(&self.in_flight.port_map) {
            return Err(ProberError::Timeout);
        }
        let _guard = scopeguard(&self.in_flight.port_map);

        let gateway = igd_next::aio::tokio::search_gateway(Default::default())
            .await
            .map_err(|e| ProberError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        let external_ip = gateway
            .get_external_ip()
            .await
            .map_err(|e| ProberError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?;
        Ok(SocketAddr::new(external_ip, internal_port))
    }

    /// Relay latency probe: HTTPS round-trip time to each region, used to
    /// pick `preferredRelayRegion` (spec §4.3 probe 4).
    pub async fn probe_relay_latency(&self, client: &reqwest::Client) -> HashMap<u32, Duration> {
        if !InFlight::try_enter(&self.in_flight.relay) {
            return HashMap::new();
        }
        let _guard = scopeguard(&self.in_flight.relay);

        let mut latencies = HashMap::new();
        for region in &self.derp_map.regions {
            let url = format!("https://{}:{}/derp/probe", region.host, region.https_port);
            let start = std::time::Instant::now();
            if let Ok(resp) = timeout(HTTPS_LATENCY_TIMEOUT, client.get(&url).send()).await {
                if resp.is_ok() {
                    latencies.insert(region.region_id, start.elapsed());
                }
            }
        }
        latencies
    }

    pub fn preferred_region(latencies: &HashMap<u32, Duration>) -> Option<u32> {
        latencies.iter().min_by_key(|(_, d)| **d).map(|(region, _)| *region)
    }
}

fn is_link_local(addr: &IpAddr) -> bool {
    match addr {
        IpAddr::V4(v4) => v4.is_link_local(),
        IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
    }
}

/// Clears an in-flight flag when the probe call returns, including on early
/// `?` exit.
fn scopeguard(flag: &AtomicBool) -> impl Drop + '_ {
    struct Guard<'a>(&'a AtomicBool);
    impl<'a> Drop for Guard<'a> {
        fn drop(&mut self) {
            InFlight::leave(self.0);
        }
    }
    Guard(flag)
}

/// Compares two `NetInfo` snapshots field-by-field so a caller only pushes
/// an update to `ControlClient` when something actually changed (SPEC_FULL
/// §C.3: "a NetInfo diff is only pushed when a field actually changed").
pub fn net_info_changed(old: &NetInfo, new: &NetInfo) -> bool {
    old != new
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_probe_skips_loopback_and_link_local() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let prober = EndpointProber::new(socket, DerpMap::default());
        let addrs = prober.probe_local(&[
            "127.0.0.1".parse().unwrap(),
            "169.254.1.1".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
        ]);
        assert_eq!(addrs.len(), 1);
        assert_eq!(addrs[0].ip(), "10.0.0.5".parse::<IpAddr>().unwrap());
    }

    #[tokio::test]
    async fn local_probe_coalesces_concurrent_calls() {
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let prober = EndpointProber::new(socket, DerpMap::default());
        prober.in_flight.local.store(true, Ordering::SeqCst);
        let addrs = prober.probe_local(&["10.0.0.5".parse().unwrap()]);
        assert!(addrs.is_empty());
    }

    #[test]
    fn net_info_changed_detects_field_diff() {
        let a = NetInfo::default();
        let mut b = NetInfo::default();
        assert!(!net_info_changed(&a, &b));
        b.working_udp = true;
        assert!(net_info_changed(&a, &b));
    }

    #[test]
    fn preferred_region_picks_lowest_latency() {
        let mut latencies = HashMap::new();
        latencies.insert(1, Duration::from_millis(80));
        latencies.insert(2, Duration::from_millis(20));
        assert_eq!(EndpointProber::preferred_region(&latencies), Some(2));
    }
}
