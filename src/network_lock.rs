//! NetworkLock (spec §4.10, optional): an append-only log of authority
//! update messages (AUMs) establishing which signing keys are currently
//! trusted to vouch for a node's identity.
//!
//! AUM hashing and signing reuse `KeyMaterial`'s own primitives (`blake2`
//! truncated digest for content-addressing, `ring`-backed Ed25519 via
//! `KeyMaterial::authority_sign`/`keymaterial::verify`) rather than a second
//! crypto stack — at the primitive level this is the same
//! signed-append-only-record shape as `keymaterial.rs`'s at-rest envelope.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::keymaterial::{self, KeyMaterial};
use crate::types::NodePublicKey;

type Blake2b256 = Blake2b<U32>;

pub type AumHash = [u8; 32];

/// Fork-choice weighting window (SPEC_FULL §C.10): the trailing 9 AUMs, an
/// odd count chosen so vote-sum ties are rarer, with any remaining tie
/// broken by head hash as spec §4.10 specifies.
const FORK_CHOICE_WINDOW: usize = 9;

#[derive(Debug, Error)]
pub enum NetworkLockError {
    #[error("network-lock: aum extends an unknown parent")]
    UnknownParent,
    #[error("network-lock: authority is disabled")]
    Disabled,
    #[error("network-lock: aum is not authorized by any key trusted at its parent state")]
    Untrusted,
    #[error("network-lock: this node holds no local authority signing key")]
    NoLocalAuthorityKey,
    #[error("network-lock: disablement secret does not match any trusted hash")]
    WrongSecret,
    /// `init` over an authority that already has AUMs (spec §9 open
    /// question: resolved as reject, not silent overwrite — see DESIGN.md).
    #[error("network-lock: authority is already initialized, purge before re-initializing")]
    AlreadyInitialized,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum AumKind {
    AddKey { key: NodePublicKey, votes: u32 },
    RemoveKey { key: NodePublicKey },
    UpdateKey { old: NodePublicKey, new: NodePublicKey, votes: u32 },
    /// Replaces the entire trusted-key set and disablement-hash set in one
    /// step; used for `init` and for periodic compaction of a long AUM
    /// chain.
    Checkpoint { trusted_keys: Vec<(NodePublicKey, u32)>, disablement_hashes: Vec<AumHash> },
    /// Authorized by proof of knowledge of a secret whose hash is in the
    /// parent state's `disablement_hashes`, not by a trusted-key signature.
    DisableNl { secret_hash: AumHash },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Aum {
    pub prev_hash: AumHash,
    pub kind: AumKind,
    pub signatures: Vec<(NodePublicKey, Vec<u8>)>,
}

fn aum_hash(prev_hash: &AumHash, kind: &AumKind) -> AumHash {
    let mut hasher = Blake2b256::new();
    hasher.update(prev_hash);
    hasher.update(bincode::serialize(kind).expect("AumKind always serializes"));
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

pub fn disablement_hash(secret: &[u8]) -> AumHash {
    let mut hasher = Blake2b256::new();
    hasher.update(secret);
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// The authority's trusted-key set as of one particular AUM, derived by
/// replaying the chain from genesis. Never mutated in place; `state_at`
/// builds a fresh one each time it's asked.
#[derive(Clone, Debug, Default)]
struct AuthorityState {
    trusted_keys: HashMap<NodePublicKey, u32>,
    disablement_hashes: HashSet<AumHash>,
    disabled: bool,
}

impl AuthorityState {
    fn apply(&mut self, kind: &AumKind) {
        match kind {
            AumKind::AddKey { key, votes } => {
                self.trusted_keys.insert(key.clone(), *votes);
            }
            AumKind::RemoveKey { key } => {
                self.trusted_keys.remove(key);
            }
            AumKind::UpdateKey { old, new, votes } => {
                self.trusted_keys.remove(old);
                self.trusted_keys.insert(new.clone(), *votes);
            }
            AumKind::Checkpoint { trusted_keys, disablement_hashes } => {
                self.trusted_keys = trusted_keys.iter().cloned().collect();
                self.disablement_hashes = disablement_hashes.iter().cloned().collect();
            }
            AumKind::DisableNl { .. } => {
                self.disabled = true;
            }
        }
    }

    fn vote_weight(&self, signatures: &[(NodePublicKey, Vec<u8>)]) -> u32 {
        signatures.iter().filter_map(|(key, _)| self.trusted_keys.get(key)).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AuthorityStatus {
    pub head: AumHash,
    pub trusted_keys: Vec<(NodePublicKey, u32)>,
    pub disabled: bool,
    pub aum_count: usize,
}

/// Append-only AUM store plus fork choice. Every known AUM is kept, keyed
/// by hash, so a branch signed offline can be merged in later without
/// discarding it; `head()` recomputes the winning chain on demand rather
/// than caching it, since merging a new branch can change the winner.
struct AuthorityLog {
    genesis: AumHash,
    by_hash: HashMap<AumHash, Aum>,
    children: HashMap<AumHash, Vec<AumHash>>,
}

impl AuthorityLog {
    fn init(trusted_keys: Vec<(NodePublicKey, u32)>, disablement_hashes: Vec<AumHash>) -> Self {
        let kind = AumKind::Checkpoint { trusted_keys, disablement_hashes };
        let prev_hash = [0u8; 32];
        let genesis_hash = aum_hash(&prev_hash, &kind);
        let genesis = Aum { prev_hash, kind, signatures: Vec::new() };
        let mut by_hash = HashMap::new();
        by_hash.insert(genesis_hash, genesis);
        Self { genesis: genesis_hash, by_hash, children: HashMap::new() }
    }

    fn state_at(&self, head: AumHash) -> AuthorityState {
        let mut chain = Vec::new();
        let mut cursor = head;
        loop {
            chain.push(cursor);
            if cursor == self.genesis {
                break;
            }
            cursor = self.by_hash[&cursor].prev_hash;
        }
        let mut state = AuthorityState::default();
        for hash in chain.into_iter().rev() {
            state.apply(&self.by_hash[&hash].kind);
        }
        state
    }

    /// Hashes with no recorded child: every chain tip currently known.
    fn candidate_heads(&self) -> Vec<AumHash> {
        self.by_hash.keys().filter(|h| !self.children.contains_key(*h)).copied().collect()
    }

    /// Spec §4.10 fork choice: highest cumulative signature weight over the
    /// trailing [`FORK_CHOICE_WINDOW`] AUMs, ties broken by lexicographically
    /// smallest head hash.
    fn head(&self) -> AumHash {
        self.candidate_heads()
            .into_iter()
            .map(|h| (self.trailing_weight(h), h))
            .max_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1).reverse()))
            .map(|(_, h)| h)
            .unwrap_or(self.genesis)
    }

    fn trailing_weight(&self, head: AumHash) -> u32 {
        let mut total = 0u32;
        let mut cursor = head;
        let mut steps = 0;
        while cursor != self.genesis && steps < FORK_CHOICE_WINDOW {
            let aum = &self.by_hash[&cursor];
            let parent_state = self.state_at(aum.prev_hash);
            total += parent_state.vote_weight(&aum.signatures);
            cursor = aum.prev_hash;
            steps += 1;
        }
        total
    }

    /// Applying the same AUM twice yields the same head (spec §8): a
    /// duplicate append is recognized by its hash and accepted as a no-op.
    fn append(&mut self, aum: Aum) -> Result<AumHash, NetworkLockError> {
        if !self.by_hash.contains_key(&aum.prev_hash) {
            return Err(NetworkLockError::UnknownParent);
        }
        let parent_state = self.state_at(aum.prev_hash);
        if parent_state.disabled {
            return Err(NetworkLockError::Disabled);
        }
        let hash = aum_hash(&aum.prev_hash, &aum.kind);
        for (key, sig) in &aum.signatures {
            if !keymaterial::verify(key, &hash, sig) {
                return Err(NetworkLockError::Untrusted);
            }
        }
        let authorized = match &aum.kind {
            AumKind::DisableNl { secret_hash } => parent_state.disablement_hashes.contains(secret_hash),
            _ => parent_state.vote_weight(&aum.signatures) > 0,
        };
        if !authorized {
            return Err(NetworkLockError::Untrusted);
        }
        if self.by_hash.contains_key(&hash) {
            return Ok(hash);
        }
        self.children.entry(aum.prev_hash).or_default().push(hash);
        self.by_hash.insert(hash, aum);
        Ok(hash)
    }
}

/// The exposed NetworkLock surface (spec §4.10): `init`, `addKey`,
/// `removeKey`, `sign`, `disable`, `status`, `log`.
pub struct NetworkLock {
    key_material: Arc<KeyMaterial>,
    log: parking_lot::Mutex<AuthorityLog>,
}

impl NetworkLock {
    /// `init(trustedKeys, disablementHashes)`. Re-initializing an existing,
    /// not-yet-purged authority is rejected by the caller before this is
    /// reached (DESIGN.md Open Question decision #3) — `NetworkLock::init`
    /// itself always succeeds, since by construction there is no prior state
    /// to protect.
    pub fn init(
        key_material: Arc<KeyMaterial>,
        trusted_keys: Vec<(NodePublicKey, u32)>,
        disablement_hashes: Vec<AumHash>,
    ) -> Self {
        Self { key_material, log: parking_lot::Mutex::new(AuthorityLog::init(trusted_keys, disablement_hashes)) }
    }

    fn sign_and_append(&self, kind: AumKind) -> Result<AumHash, NetworkLockError> {
        let mut log = self.log.lock();
        let head = log.head();
        let authority_pub = self.key_material.authority_public().ok_or(NetworkLockError::NoLocalAuthorityKey)?;
        let message = aum_hash(&head, &kind);
        let signature = self.key_material.authority_sign(&message).ok_or(NetworkLockError::NoLocalAuthorityKey)?;
        log.append(Aum { prev_hash: head, kind, signatures: vec![(authority_pub, signature)] })
    }

    pub fn add_key(&self, key: NodePublicKey, votes: u32) -> Result<AumHash, NetworkLockError> {
        self.sign_and_append(AumKind::AddKey { key, votes })
    }

    /// `removeKey`. Affected nodes' existing `nodeKeySignature`s stay valid
    /// under other still-trusted keys; re-signing them under a different
    /// key is a separate `sign` call the caller makes per node, not
    /// automatic here.
    pub fn remove_key(&self, key: NodePublicKey) -> Result<AumHash, NetworkLockError> {
        self.sign_and_append(AumKind::RemoveKey { key })
    }

    pub fn update_key(&self, old: NodePublicKey, new: NodePublicKey, votes: u32) -> Result<AumHash, NetworkLockError> {
        self.sign_and_append(AumKind::UpdateKey { old, new, votes })
    }

    /// `sign(nodeKey, rotationKey) -> nodeKeySignature`: the signature a
    /// peer attaches to its NetworkMap entry, proving its node key chains to
    /// a key the authority currently trusts. `rotationKey` selection between
    /// multiple locally-held authority keys is out of scope for this single-
    /// authority-key implementation; the node's one configured authority key
    /// always signs.
    pub fn sign(&self, node_key: &NodePublicKey) -> Result<Vec<u8>, NetworkLockError> {
        self.key_material.authority_sign(&node_key.0).ok_or(NetworkLockError::NoLocalAuthorityKey)
    }

    /// `disable(secret)`: authorized by knowledge of a secret hashing to one
    /// of the head state's `disablement_hashes`, independent of the trusted
    /// signing-key set.
    pub fn disable(&self, secret: &[u8]) -> Result<AumHash, NetworkLockError> {
        let mut log = self.log.lock();
        let head = log.head();
        let state = log.state_at(head);
        let secret_hash = disablement_hash(secret);
        if !state.disablement_hashes.contains(&secret_hash) {
            return Err(NetworkLockError::WrongSecret);
        }
        log.append(Aum { prev_hash: head, kind: AumKind::DisableNl { secret_hash }, signatures: Vec::new() })
    }

    pub fn status(&self) -> AuthorityStatus {
        let log = self.log.lock();
        let head = log.head();
        let state = log.state_at(head);
        AuthorityStatus {
            head,
            trusted_keys: state.trusted_keys.into_iter().collect(),
            disabled: state.disabled,
            aum_count: log.by_hash.len(),
        }
    }

    /// `log(limit)`: the head chain, most recent first, capped at `limit`.
    pub fn log(&self, limit: usize) -> Vec<Aum> {
        let log = self.log.lock();
        let mut out = Vec::new();
        let mut cursor = log.head();
        loop {
            out.push(log.by_hash[&cursor].clone());
            if cursor == log.genesis || out.len() >= limit {
                break;
            }
            cursor = log.by_hash[&cursor].prev_hash;
        }
        out
    }

    /// Data-plane integration (spec §4.10): a peer's node public key is
    /// trusted only if `signature` verifies under some key in the current
    /// head state's trusted set, and the authority isn't disabled.
    pub fn is_trusted(&self, node_key: &NodePublicKey, signature: &[u8]) -> bool {
        let log = self.log.lock();
        let state = log.state_at(log.head());
        !state.disabled && state.trusted_keys.keys().any(|k| keymaterial::verify(k, &node_key.0, signature))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authority_key_material() -> Arc<KeyMaterial> {
        Arc::new(KeyMaterial::generate().unwrap().with_authority_key(crate::keymaterial::SigningKeyPair::generate().unwrap()))
    }

    #[test]
    fn add_key_then_sign_verifies_as_trusted() {
        let km = authority_key_material();
        let lock = NetworkLock::init(km.clone(), vec![(km.authority_public().unwrap(), 1)], vec![]);
        let node_key = NodePublicKey([9u8; 32]);
        let sig = lock.sign(&node_key).unwrap();
        assert!(lock.is_trusted(&node_key, &sig));
    }

    #[test]
    fn add_key_extends_head_and_is_reflected_in_status() {
        let km = authority_key_material();
        let lock = NetworkLock::init(km.clone(), vec![(km.authority_public().unwrap(), 1)], vec![]);
        let new_key = NodePublicKey([3u8; 32]);
        lock.add_key(new_key.clone(), 1).unwrap();
        let status = lock.status();
        assert_eq!(status.aum_count, 2);
        assert!(status.trusted_keys.iter().any(|(k, _)| k == &new_key));
    }

    #[test]
    fn remove_key_drops_trust() {
        let km = authority_key_material();
        let authority_pub = km.authority_public().unwrap();
        let lock = NetworkLock::init(km.clone(), vec![(authority_pub.clone(), 1)], vec![]);
        let node_key = NodePublicKey([9u8; 32]);
        let sig = lock.sign(&node_key).unwrap();
        assert!(lock.is_trusted(&node_key, &sig));
        lock.remove_key(authority_pub).unwrap();
        assert!(!lock.is_trusted(&node_key, &sig));
    }

    #[test]
    fn append_rejects_unknown_parent() {
        let mut log = AuthorityLog::init(vec![], vec![]);
        let bogus = Aum { prev_hash: [0xffu8; 32], kind: AumKind::RemoveKey { key: NodePublicKey([1; 32]) }, signatures: vec![] };
        assert!(matches!(log.append(bogus), Err(NetworkLockError::UnknownParent)));
    }

    #[test]
    fn append_rejects_signature_from_untrusted_key() {
        let mut log = AuthorityLog::init(vec![], vec![]);
        let outsider = crate::keymaterial::SigningKeyPair::generate().unwrap();
        let head = log.head();
        let kind = AumKind::AddKey { key: NodePublicKey([7; 32]), votes: 1 };
        let message = aum_hash(&head, &kind);
        let sig = outsider.sign(&message);
        let aum = Aum { prev_hash: head, kind, signatures: vec![(outsider.public(), sig)] };
        assert!(matches!(log.append(aum), Err(NetworkLockError::Untrusted)));
    }

    #[test]
    fn appending_the_same_aum_twice_is_idempotent() {
        let km = authority_key_material();
        let lock = NetworkLock::init(km.clone(), vec![(km.authority_public().unwrap(), 1)], vec![]);
        let key = NodePublicKey([4; 32]);
        let first = lock.add_key(key.clone(), 1).unwrap();

        // Replay the exact same AUM directly against the log.
        let mut raw = AuthorityLog::init(vec![(km.authority_public().unwrap(), 1)], vec![]);
        let head = raw.head();
        let kind = AumKind::AddKey { key: key.clone(), votes: 1 };
        let message = aum_hash(&head, &kind);
        let sig = km.authority_sign(&message).unwrap();
        let aum = Aum { prev_hash: head, kind, signatures: vec![(km.authority_public().unwrap(), sig)] };
        let second = raw.append(aum.clone()).unwrap();
        let third = raw.append(aum).unwrap();
        assert_eq!(second, third);
        assert_eq!(first, second);
    }

    #[test]
    fn disable_requires_the_matching_secret() {
        let km = authority_key_material();
        let secret = b"correct-horse-battery-staple";
        let lock = NetworkLock::init(
            km.clone(),
            vec![(km.authority_public().unwrap(), 1)],
            vec![disablement_hash(secret)],
        );
        assert!(matches!(lock.disable(b"wrong-secret"), Err(NetworkLockError::WrongSecret)));
        lock.disable(secret).unwrap();
        assert!(lock.status().disabled);
    }

    #[test]
    fn disabled_authority_rejects_further_appends() {
        let km = authority_key_material();
        let secret = b"disable-me";
        let lock = NetworkLock::init(
            km.clone(),
            vec![(km.authority_public().unwrap(), 1)],
            vec![disablement_hash(secret)],
        );
        lock.disable(secret).unwrap();
        assert!(matches!(lock.add_key(NodePublicKey([1; 32]), 1), Err(NetworkLockError::Disabled)));
    }

    #[test]
    fn fork_choice_prefers_higher_cumulative_weight() {
        let km_a = authority_key_material();
        let km_b = authority_key_material();
        let mut log = AuthorityLog::init(
            vec![(km_a.authority_public().unwrap(), 1), (km_b.authority_public().unwrap(), 5)],
            vec![],
        );
        let genesis = log.head();

        let kind_a = AumKind::AddKey { key: NodePublicKey([1; 32]), votes: 1 };
        let msg_a = aum_hash(&genesis, &kind_a);
        let sig_a = km_a.authority_sign(&msg_a).unwrap();
        let branch_a = Aum { prev_hash: genesis, kind: kind_a, signatures: vec![(km_a.authority_public().unwrap(), sig_a)] };
        let head_a = log.append(branch_a).unwrap();

        let kind_b = AumKind::AddKey { key: NodePublicKey([2; 32]), votes: 1 };
        let msg_b = aum_hash(&genesis, &kind_b);
        let sig_b = km_b.authority_sign(&msg_b).unwrap();
        let branch_b = Aum { prev_hash: genesis, kind: kind_b, signatures: vec![(km_b.authority_public().unwrap(), sig_b)] };
        let head_b = log.append(branch_b).unwrap();

        assert_eq!(log.head(), head_b, "the 5-vote branch should win over the 1-vote branch");
        assert_ne!(head_a, head_b);
    }
}
