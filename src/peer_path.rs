//! PeerPath (spec §4.5): the per-peer NAT-traversal state machine. Tries
//! direct UDP candidates in parallel, falls back to relay, reselects on
//! heartbeat loss.
//!
//! Grounded on ZeroTier's peer path-selection shape
//! (`other_examples/..._ZeroTierOne..._peer.rs`: candidate endpoints ranked
//! by a quality metric, reselection on loss) and on the teacher's
//! `maintain_connection` reconnect idiom (`net/utils.rs`) for how a per-peer
//! task reacts to failure.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::disco::TxId;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
pub const HEARTBEAT_LOSS_WINDOW: Duration = Duration::from_secs(15);
pub const DIRECT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_CONSECUTIVE_LOSSES: u32 = 3;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CandidateClass {
    Local,
    Reflexive,
    PortMapped,
}

#[derive(Clone, Debug)]
pub struct Candidate {
    pub addr: SocketAddr,
    pub class: CandidateClass,
    pub tx_id: TxId,
    pub sent_at: Instant,
}

#[derive(Clone, Debug, PartialEq)]
pub enum PathState {
    NoPath,
    ProbingDirect,
    Direct { addr: SocketAddr },
    Relay { region: u32 },
}

/// Per-peer NAT traversal state. Owned by `DataPlane`'s peer table.
pub struct PeerPath {
    state: PathState,
    preferred_relay_region: u32,
    outstanding: HashMap<TxId, Candidate>,
    probing_since: Option<Instant>,
    consecutive_losses: u32,
    last_heartbeat_ok: Option<Instant>,
    last_heartbeat_sent: Option<Instant>,
    needs_probe: bool,
}

impl PeerPath {
    pub fn new(preferred_relay_region: u32) -> Self {
        Self {
            state: PathState::NoPath,
            preferred_relay_region,
            outstanding: HashMap::new(),
            probing_since: None,
            consecutive_losses: 0,
            last_heartbeat_ok: None,
            last_heartbeat_sent: None,
            needs_probe: false,
        }
    }

    pub fn state(&self) -> &PathState {
        &self.state
    }

    /// Reads and clears the flag set by [`Self::on_peer_appeared`]/
    /// [`Self::on_call_me_maybe`], for the caller's maintenance loop to
    /// decide whether `ping_candidates` needs to run this tick.
    pub fn take_needs_probe(&mut self) -> bool {
        std::mem::take(&mut self.needs_probe)
    }

    /// Peer appeared in the NetworkMap: begin probing every candidate in
    /// parallel while the relay tunnel stays open so data can flow
    /// immediately over `Relay` (spec §4.5, "Initial" transition).
    pub fn on_peer_appeared(&mut self) {
        self.state = PathState::ProbingDirect;
        self.probing_since = Some(Instant::now());
        self.needs_probe = true;
        self.outstanding.clear();
    }

    /// Records that a ping was sent to `candidate`, to be matched against a
    /// later pong.
    pub fn record_ping_sent(&mut self, candidate: Candidate) {
        self.outstanding.insert(candidate.tx_id, candidate);
    }

    /// A pong arrived for `tx_id` observed at `addr`. Unknown tx_ids are
    /// discarded (spec §4.5: "pongs referencing unknown nonces are
    /// discarded"). Returns `true` if this pong caused a transition into
    /// `Direct`.
    pub fn on_pong(&mut self, tx_id: TxId, addr: SocketAddr) -> bool {
        let Some(candidate) = self.outstanding.remove(&tx_id) else {
            return false;
        };
        if candidate.addr != addr {
            // the pong's observed source must match the candidate we pinged;
            // otherwise treat it like an unknown transaction.
            return false;
        }
        if matches!(self.state, PathState::Direct { .. }) {
            // already locked in via an earlier, better-ranked pong.
            return false;
        }
        self.state = PathState::Direct { addr };
        self.outstanding.clear();
        self.consecutive_losses = 0;
        self.last_heartbeat_ok = Some(Instant::now());
        true
    }

    /// Picks the best-ranked responder among candidates that have replied so
    /// far, per the tie-break order in spec §4.5: local > reflexive >
    /// port-mapped > relay, ties by first-to-respond (see DESIGN.md Open
    /// Question 1).
    pub fn best_responder<'a>(&self, responded: &'a [Candidate]) -> Option<&'a Candidate> {
        responded
            .iter()
            .min_by_key(|c| (c.class, c.sent_at))
    }

    /// A heartbeat round completed with no response on the current direct
    /// path. After `MAX_CONSECUTIVE_LOSSES` within `HEARTBEAT_LOSS_WINDOW`,
    /// drop back to `ProbingDirect`; if probing stays silent for
    /// `DIRECT_PROBE_TIMEOUT`, fall all the way to `Relay`.
    /// A pong arrived while already `Direct`, confirming liveness of the
    /// current path rather than selecting a new one ([`Self::on_pong`]
    /// discards further pongs once locked in). Returns `true` if it matched
    /// the current path and reset the loss counter.
    pub fn on_heartbeat_pong(&mut self, tx_id: TxId, addr: SocketAddr) -> bool {
        let Some(candidate) = self.outstanding.remove(&tx_id) else {
            return false;
        };
        if candidate.addr != addr {
            return false;
        }
        if let PathState::Direct { addr: current } = self.state {
            if current == addr {
                self.consecutive_losses = 0;
                self.last_heartbeat_ok = Some(Instant::now());
                return true;
            }
        }
        false
    }

    /// Called once per maintenance tick: if a heartbeat was sent at least
    /// one interval ago and no matching pong has landed since, counts as a
    /// loss (spec §4.5). No-op off the `Direct` path.
    pub fn check_heartbeat_timeout(&mut self) -> bool {
        let PathState::Direct { .. } = self.state else { return false };
        let Some(sent) = self.last_heartbeat_sent else { return false };
        if sent.elapsed() < HEARTBEAT_INTERVAL {
            return false;
        }
        let acked = self.last_heartbeat_ok.is_some_and(|ok| ok >= sent);
        if acked {
            return false;
        }
        self.on_heartbeat_loss();
        true
    }

    pub fn on_heartbeat_loss(&mut self) {
        self.consecutive_losses += 1;
        if self.consecutive_losses >= MAX_CONSECUTIVE_LOSSES {
            self.state = PathState::ProbingDirect;
            self.probing_since = Some(Instant::now());
            self.consecutive_losses = 0;
        }
    }

    pub fn on_heartbeat_ok(&mut self) {
        self.consecutive_losses = 0;
        self.last_heartbeat_ok = Some(Instant::now());
    }

    pub fn mark_heartbeat_sent(&mut self) {
        self.last_heartbeat_sent = Some(Instant::now());
    }

    pub fn heartbeat_due(&self) -> bool {
        match self.last_heartbeat_sent {
            None => true,
            Some(t) => t.elapsed() >= HEARTBEAT_INTERVAL,
        }
    }

    /// If we've been probing direct candidates without success for longer
    /// than `DIRECT_PROBE_TIMEOUT`, fall back to relay. No-op otherwise.
    pub fn tick_probe_timeout(&mut self) {
        if let PathState::ProbingDirect = self.state {
            if let Some(since) = self.probing_since {
                if since.elapsed() >= DIRECT_PROBE_TIMEOUT {
                    self.state = PathState::Relay { region: self.preferred_relay_region };
                    self.outstanding.clear();
                }
            }
        }
    }

    /// A `CallMeMaybe` arrived advertising new endpoints: re-enter probing
    /// with the new candidate set (spec §4.5).
    pub fn on_call_me_maybe(&mut self) {
        self.state = PathState::ProbingDirect;
        self.probing_since = Some(Instant::now());
        self.outstanding.clear();
        self.needs_probe = true;
    }

    pub fn on_peer_removed(&mut self) {
        self.state = PathState::NoPath;
        self.outstanding.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(addr: &str, class: CandidateClass, tx: u64) -> Candidate {
        Candidate { addr: addr.parse().unwrap(), class, tx_id: TxId(tx), sent_at: Instant::now() }
    }

    #[test]
    fn pong_with_unknown_tx_id_is_discarded() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        assert!(!path.on_pong(TxId(999), "1.2.3.4:1".parse().unwrap()));
        assert_eq!(path.state(), &PathState::ProbingDirect);
    }

    #[test]
    fn first_valid_pong_locks_in_direct() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        assert!(path.on_pong(TxId(1), c.addr));
        assert_eq!(path.state(), &PathState::Direct { addr: c.addr });
    }

    #[test]
    fn three_consecutive_losses_fall_back_to_probing() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        path.on_pong(TxId(1), c.addr);
        path.on_heartbeat_loss();
        path.on_heartbeat_loss();
        assert_eq!(path.state(), &PathState::Direct { addr: c.addr });
        path.on_heartbeat_loss();
        assert_eq!(path.state(), &PathState::ProbingDirect);
    }

    #[test]
    fn empty_candidate_set_stays_on_relay() {
        let mut path = PeerPath::new(7);
        path.on_peer_appeared();
        path.probing_since = Some(Instant::now() - DIRECT_PROBE_TIMEOUT - Duration::from_secs(1));
        path.tick_probe_timeout();
        assert_eq!(path.state(), &PathState::Relay { region: 7 });
    }

    #[test]
    fn call_me_maybe_reenters_probing() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        path.on_pong(TxId(1), c.addr);
        path.on_call_me_maybe();
        assert_eq!(path.state(), &PathState::ProbingDirect);
    }

    #[test]
    fn best_responder_prefers_local_over_reflexive_over_relay_order() {
        let path = PeerPath::new(1);
        let local = candidate("10.0.0.1:1", CandidateClass::Local, 1);
        let reflexive = candidate("203.0.113.1:1", CandidateClass::Reflexive, 2);
        let chosen = path.best_responder(&[reflexive.clone(), local.clone()]).unwrap();
        assert_eq!(chosen.addr, local.addr);
    }

    #[test]
    fn heartbeat_pong_on_current_direct_path_resets_losses() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        path.on_pong(TxId(1), c.addr);
        path.on_heartbeat_loss();
        path.on_heartbeat_loss();

        let hb = candidate(&c.addr.to_string(), CandidateClass::Local, 2);
        path.record_ping_sent(hb.clone());
        assert!(path.on_heartbeat_pong(TxId(2), c.addr));
        assert_eq!(path.state(), &PathState::Direct { addr: c.addr });
    }

    #[test]
    fn heartbeat_timeout_fires_when_no_pong_since_last_send() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        path.on_pong(TxId(1), c.addr);

        path.last_heartbeat_sent = Some(Instant::now() - HEARTBEAT_INTERVAL - Duration::from_secs(1));
        assert!(path.check_heartbeat_timeout());
    }

    #[test]
    fn heartbeat_timeout_is_a_no_op_when_acked_since_last_send() {
        let mut path = PeerPath::new(1);
        path.on_peer_appeared();
        let c = candidate("10.0.0.5:4000", CandidateClass::Local, 1);
        path.record_ping_sent(c.clone());
        path.on_pong(TxId(1), c.addr);

        path.last_heartbeat_sent = Some(Instant::now() - HEARTBEAT_INTERVAL - Duration::from_secs(1));
        path.last_heartbeat_ok = Some(Instant::now());
        assert!(!path.check_heartbeat_timeout());
    }
}
