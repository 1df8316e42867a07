//! DiscoChannel (spec §4.4): a tiny authenticated message protocol between
//! two peers for endpoint discovery and hole-punching, keyed by short-lived
//! disco keys distinct from node/machine identity.
//!
//! Grounded on the DERP-clone frame-enum shape in the pack
//! (`other_examples/..._dersp...proto/data.rs`'s small tagged `FrameType`
//! enum with fixed-size key/nonce prefixes) and on the teacher's
//! `net/types.rs` `Handshake`-carrying `NetworkMessage` enum for the overall
//! "small enum of wire message kinds" shape. The AEAD box is built directly
//! from primitives already in the dependency tree (ChaCha20-Poly1305 keyed
//! by an X25519 DH run through a BLAKE2-keyed KDF) rather than introducing a
//! separate NaCl-box crate.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use blake2::digest::{consts::U32, KeyInit as _, Mac};
use blake2::Blake2bMac;
use chacha20poly1305::aead::{Aead, KeyInit as _};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::NodePublicKey;

/// Disco keys rotate independently of node identity; 24h default lifetime.
pub const DISCO_KEY_LIFETIME: Duration = Duration::from_secs(24 * 3600);

#[derive(Debug, Error)]
pub enum DiscoError {
    #[error("disco: box open failed (wrong key or tampered message)")]
    OpenFailed,
    #[error("disco: message too short")]
    Truncated,
    #[error("disco: unsupported message tag {0}")]
    UnknownTag(u8),
    #[error("disco: serialization error: {0}")]
    Codec(#[from] bincode::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxId(pub u64);

/// Wire-prefix byte distinguishing disco traffic from data records inside a
/// regular data-plane UDP packet (spec §4.4: "carried inside regular
/// data-plane UDP packets via a distinguished wire prefix").
pub const DISCO_WIRE_PREFIX: u8 = 0x01;
pub const DATA_WIRE_PREFIX: u8 = 0x02;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum DiscoMessage {
    Ping { tx_id: TxId, node_key: NodePublicKey },
    Pong { tx_id: TxId, observed_src: SocketAddr },
    CallMeMaybe { endpoints: Vec<SocketAddr> },
}

impl DiscoMessage {
    fn tag(&self) -> u8 {
        match self {
            DiscoMessage::Ping { .. } => 1,
            DiscoMessage::Pong { .. } => 2,
            DiscoMessage::CallMeMaybe { .. } => 3,
        }
    }
}

/// A disco keypair: X25519, rotated independently of node/machine keys.
pub struct DiscoKeyPair {
    private: x25519_dalek::StaticSecret,
    public: [u8; 32],
    created_at: Instant,
}

impl DiscoKeyPair {
    pub fn generate() -> Self {
        let private = x25519_dalek::StaticSecret::random_from_rng(rand::thread_rng());
        let public = x25519_dalek::PublicKey::from(&private);
        Self { private, public: public.to_bytes(), created_at: Instant::now() }
    }

    pub fn public(&self) -> [u8; 32] {
        self.public
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() > DISCO_KEY_LIFETIME
    }

    fn shared_secret(&self, remote_pub: &[u8; 32]) -> [u8; 32] {
        let remote = x25519_dalek::PublicKey::from(*remote_pub);
        let dh = self.private.diffie_hellman(&remote);
        let mut okm = [0u8; 32];
        let mut mac = Blake2bMac::<U32>::new_from_slice(b"disco-hkdf").expect("blake2 key");
        mac.update(dh.as_bytes());
        okm.copy_from_slice(&mac.finalize().into_bytes());
        okm
    }
}

/// Encrypts `msg` as an authenticated box from `our_key` to `their_pub`.
pub fn seal(our_key: &DiscoKeyPair, their_pub: &[u8; 32], msg: &DiscoMessage) -> Result<Vec<u8>, DiscoError> {
    let shared = our_key.shared_secret(their_pub);
    let cipher = ChaCha20Poly1305::new((&shared).into());
    let mut nonce_bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let plaintext = bincode::serialize(msg)?;
    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_ref())
        .map_err(|_| DiscoError::OpenFailed)?;

    let mut out = Vec::with_capacity(1 + 32 + 12 + ciphertext.len());
    out.push(msg.tag());
    out.extend_from_slice(&our_key.public);
    out.extend_from_slice(&nonce_bytes);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypts a box addressed to `our_key`, returning the sender's disco
/// public key alongside the decoded message.
pub fn open(our_key: &DiscoKeyPair, boxed: &[u8]) -> Result<([u8; 32], DiscoMessage), DiscoError> {
    if boxed.len() < 1 + 32 + 12 {
        return Err(DiscoError::Truncated);
    }
    let _tag = boxed[0];
    let mut sender_pub = [0u8; 32];
    sender_pub.copy_from_slice(&boxed[1..33]);
    let nonce = Nonce::from_slice(&boxed[33..45]);
    let ciphertext = &boxed[45..];

    let shared = our_key.shared_secret(&sender_pub);
    let cipher = ChaCha20Poly1305::new((&shared).into());
    let plaintext = cipher.decrypt(nonce, ciphertext).map_err(|_| DiscoError::OpenFailed)?;
    let msg: DiscoMessage = bincode::deserialize(&plaintext)?;
    Ok((sender_pub, msg))
}

pub fn next_tx_id() -> TxId {
    TxId(rand::thread_rng().next_u64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_and_open_round_trip() {
        let alice = DiscoKeyPair::generate();
        let bob = DiscoKeyPair::generate();

        let ping = DiscoMessage::Ping { tx_id: TxId(42), node_key: NodePublicKey([9u8; 32]) };
        let boxed = seal(&alice, &bob.public(), &ping).unwrap();
        let (sender, decoded) = open(&bob, &boxed).unwrap();

        assert_eq!(sender, alice.public());
        match decoded {
            DiscoMessage::Ping { tx_id, .. } => assert_eq!(tx_id, TxId(42)),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn tampered_box_fails_to_open() {
        let alice = DiscoKeyPair::generate();
        let bob = DiscoKeyPair::generate();
        let msg = DiscoMessage::CallMeMaybe { endpoints: vec!["127.0.0.1:1234".parse().unwrap()] };
        let mut boxed = seal(&alice, &bob.public(), &msg).unwrap();
        *boxed.last_mut().unwrap() ^= 0xff;
        assert!(open(&bob, &boxed).is_err());
    }

    #[test]
    fn wrong_recipient_cannot_open() {
        let alice = DiscoKeyPair::generate();
        let bob = DiscoKeyPair::generate();
        let mallory = DiscoKeyPair::generate();
        let msg = DiscoMessage::Pong { tx_id: TxId(1), observed_src: "1.2.3.4:5".parse().unwrap() };
        let boxed = seal(&alice, &bob.public(), &msg).unwrap();
        assert!(open(&mallory, &boxed).is_err());
    }
}
