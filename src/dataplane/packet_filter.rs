//! Packet filter (spec §4.8): first-match-wins evaluation over the ordered
//! rule list carried in each `NetworkMap` generation. Compiled once per
//! generation and atomically swapped, never mutated rule-by-rule.
//!
//! Grounded on the teacher's pervasive `tokio::sync::RwLock`-guarded shared
//! state pattern for anything replaced wholesale on update (no `arc-swap`
//! dependency needed for a swap this infrequent).

use std::net::IpAddr;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::types::{FilterRule, Protocol};

/// A compiled, immutable view of one `NetworkMap` generation's filter rules.
#[derive(Clone, Debug, Default)]
pub struct CompiledFilter {
    generation: u64,
    rules: Arc<Vec<FilterRule>>,
}

impl CompiledFilter {
    pub fn compile(generation: u64, rules: Vec<FilterRule>) -> Self {
        Self { generation, rules: Arc::new(rules) }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// First-match-wins: the first rule whose fields all match decides the
    /// outcome. No match means deny (spec §4.8: default deny).
    pub fn allows(&self, src: IpAddr, dst: IpAddr, port: u16, proto: Protocol) -> bool {
        self.rules.iter().any(|r| r.matches(src, dst, port, proto))
    }
}

/// Shared, swappable holder for the current generation's compiled filter.
/// `PacketFilter::replace` is the only mutation path; reads never block on a
/// writer longer than the swap itself.
#[derive(Default)]
pub struct PacketFilter {
    current: RwLock<CompiledFilter>,
}

impl PacketFilter {
    pub fn new(initial: CompiledFilter) -> Self {
        Self { current: RwLock::new(initial) }
    }

    pub async fn replace(&self, compiled: CompiledFilter) {
        let mut guard = self.current.write().await;
        // never regress to an older generation racing a newer one in.
        if compiled.generation >= guard.generation {
            *guard = compiled;
        }
    }

    pub async fn allows(&self, src: IpAddr, dst: IpAddr, port: u16, proto: Protocol) -> bool {
        self.current.read().await.allows(src, dst, port, proto)
    }

    pub async fn generation(&self) -> u64 {
        self.current.read().await.generation()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PortRange;

    fn rule(src: &str, dst: &str, port: u16, proto: Protocol) -> FilterRule {
        FilterRule {
            src_nets: vec![src.parse().unwrap()],
            dst_nets: vec![dst.parse().unwrap()],
            dst_ports: vec![PortRange::single(port)],
            protocol: proto,
        }
    }

    fn rule_any_port(src: &str, dst: &str, proto: Protocol) -> FilterRule {
        FilterRule {
            src_nets: vec![src.parse().unwrap()],
            dst_nets: vec![dst.parse().unwrap()],
            dst_ports: vec![PortRange { start: 0, end: 65535 }],
            protocol: proto,
        }
    }

    #[test]
    fn default_deny_with_no_matching_rule() {
        let filter = CompiledFilter::compile(1, vec![]);
        assert!(!filter.allows(
            "100.64.0.1".parse().unwrap(),
            "100.64.0.2".parse().unwrap(),
            22,
            Protocol::Tcp
        ));
    }

    #[test]
    fn first_match_wins_even_when_a_later_rule_would_deny() {
        // a broad allow-all precedes a narrow rule that would otherwise deny
        // this specific flow (different protocol); first match still wins.
        let filter = CompiledFilter::compile(
            1,
            vec![
                rule_any_port("100.64.0.0/10", "100.64.0.0/10", Protocol::Any),
                rule("100.64.0.5/32", "100.64.0.2/32", 22, Protocol::Tcp),
            ],
        );
        assert!(filter.allows(
            "100.64.0.5".parse().unwrap(),
            "100.64.0.2".parse().unwrap(),
            9999,
            Protocol::Udp
        ));
    }

    #[tokio::test]
    async fn replace_never_regresses_to_an_older_generation() {
        let filter = PacketFilter::new(CompiledFilter::compile(5, vec![]));
        filter
            .replace(CompiledFilter::compile(3, vec![rule("0.0.0.0/0", "0.0.0.0/0", 0, Protocol::Any)]))
            .await;
        assert_eq!(filter.generation().await, 5);

        filter
            .replace(CompiledFilter::compile(6, vec![rule("0.0.0.0/0", "0.0.0.0/0", 0, Protocol::Any)]))
            .await;
        assert_eq!(filter.generation().await, 6);
    }
}
