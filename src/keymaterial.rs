//! KeyMaterial (spec §4.2): long-term node/machine keys, signing, key IDs.
//!
//! Grounded on the teacher's `keygen.rs` (ring `Ed25519KeyPair` generation,
//! AES-GCM at-rest envelope) and `net/utils.rs` (signing handshake payloads
//! with the node keypair directly).

use aes_gcm::aead::{Aead, AeadCore, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Key as AesKey};
use blake2::digest::consts::U16;
use blake2::{Blake2b, Digest};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::{KvStore, StoreError};
use crate::types::{KeyId, MachinePublicKey, NodePublicKey};
use crate::wirecodec;

type Blake2b128 = Blake2b<U16>;

#[derive(Debug, Error)]
pub enum KeyMaterialError {
    #[error("keymaterial: key generation failed")]
    GenerationFailed,
    #[error("keymaterial: invalid pkcs8 document")]
    InvalidDocument,
    #[error("keymaterial: at-rest decryption failed, wrong passphrase or corrupt envelope")]
    DecryptFailed,
    #[error("keymaterial: no key stored under {0}")]
    NotFound(String),
    #[error("keymaterial: store error: {0}")]
    Store(#[from] StoreError),
    #[error("keymaterial: envelope serialization error: {0}")]
    Envelope(#[from] bincode::Error),
}

/// On-disk envelope: never the raw key bytes. `key` is the PKCS8 document
/// for Ed25519 keys, or a 32-byte Curve25519 scalar for machine/disco keys,
/// AES-256-GCM-encrypted under a key derived from a local passphrase.
#[derive(Serialize, Deserialize)]
struct Envelope {
    version: u8,
    created_at: i64,
    nonce: Vec<u8>,
    ciphertext: Vec<u8>,
}

fn seal(plaintext: &[u8], disk_key: &[u8; 32]) -> Envelope {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(disk_key));
    let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
    let ciphertext = cipher.encrypt(&nonce, plaintext).expect("aes-gcm seal");
    Envelope {
        version: 1,
        created_at: chrono::Utc::now().timestamp(),
        nonce: nonce.to_vec(),
        ciphertext,
    }
}

fn open(env: &Envelope, disk_key: &[u8; 32]) -> Result<Vec<u8>, KeyMaterialError> {
    let cipher = Aes256Gcm::new(AesKey::<Aes256Gcm>::from_slice(disk_key));
    let nonce = aes_gcm::Nonce::from_slice(&env.nonce);
    cipher
        .decrypt(nonce, env.ciphertext.as_ref())
        .map_err(|_| KeyMaterialError::DecryptFailed)
}

/// An Ed25519 identity keypair (used for the node key and, optionally, the
/// NetworkLock authority key).
pub struct SigningKeyPair {
    pair: Ed25519KeyPair,
    pkcs8: Vec<u8>,
}

impl SigningKeyPair {
    pub fn generate() -> Result<Self, KeyMaterialError> {
        let rng = SystemRandom::new();
        let doc = Ed25519KeyPair::generate_pkcs8(&rng).map_err(|_| KeyMaterialError::GenerationFailed)?;
        let pair = Ed25519KeyPair::from_pkcs8(doc.as_ref()).map_err(|_| KeyMaterialError::InvalidDocument)?;
        Ok(Self { pair, pkcs8: doc.as_ref().to_vec() })
    }

    pub fn from_pkcs8(bytes: &[u8]) -> Result<Self, KeyMaterialError> {
        let pair = Ed25519KeyPair::from_pkcs8(bytes).map_err(|_| KeyMaterialError::InvalidDocument)?;
        Ok(Self { pair, pkcs8: bytes.to_vec() })
    }

    pub fn public(&self) -> NodePublicKey {
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(self.pair.public_key().as_ref());
        NodePublicKey(bytes)
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.pair.sign(message).as_ref().to_vec()
    }
}

pub fn verify(pubkey: &NodePublicKey, message: &[u8], signature: &[u8]) -> bool {
    let unparsed = ring::signature::UnparsedPublicKey::new(&ring::signature::ED25519, &pubkey.0);
    unparsed.verify(message, signature).is_ok()
}

/// A Curve25519 keypair used only as the Noise `s`/`rs` static key for the
/// coordinator/relay/peer WireCodec handshakes (spec §4.7: "open a WireCodec
/// session to U using the machine key"). Deliberately not an Ed25519 key:
/// `snow`'s IK/NK patterns need a DH-capable static key, not a signing key.
pub struct MachineKeyPair {
    private: [u8; 32],
    public: [u8; 32],
}

impl MachineKeyPair {
    pub fn generate() -> Self {
        let (private, public) = wirecodec::generate_static_keypair();
        Self { private, public }
    }

    pub fn from_private(private: [u8; 32]) -> Self {
        let secret = x25519_dalek::StaticSecret::from(private);
        let public = x25519_dalek::PublicKey::from(&secret);
        Self { private, public: public.to_bytes() }
    }

    pub fn public(&self) -> MachinePublicKey {
        MachinePublicKey(self.public)
    }

    pub fn private_bytes(&self) -> &[u8; 32] {
        &self.private
    }
}

/// Truncated BLAKE2 digest of a public key (spec §4.2).
pub fn key_id(pubkey_bytes: &[u8]) -> KeyId {
    hex::encode(key_id_bytes(pubkey_bytes))
}

/// Same digest as [`key_id`] but as raw bytes, for the data plane's wire
/// prefix (spec §4.6: "indexed by a key identifier in the wire prefix")
/// where a hex string would be wasted space on every datagram.
pub fn key_id_bytes(pubkey_bytes: &[u8]) -> [u8; 16] {
    let mut hasher = Blake2b128::new();
    hasher.update(pubkey_bytes);
    let mut out = [0u8; 16];
    out.copy_from_slice(&hasher.finalize());
    out
}

const NODE_KEY_STORE_KEY: &str = "node-key.pem";
const MACHINE_KEY_STORE_KEY: &str = "machine-key.pem";

/// Holds the node's long-term identity, the separate machine key used only
/// for the coordinator/relay Noise handshake, and an optional NetworkLock
/// authority key. Private portions never leave this struct; only
/// `public()`/`sign()` are exposed to callers.
pub struct KeyMaterial {
    node_key: SigningKeyPair,
    machine_key: MachineKeyPair,
    authority_key: Option<SigningKeyPair>,
}

impl KeyMaterial {
    pub fn new(node_key: SigningKeyPair, machine_key: MachineKeyPair) -> Self {
        Self { node_key, machine_key, authority_key: None }
    }

    pub fn with_authority_key(mut self, authority_key: SigningKeyPair) -> Self {
        self.authority_key = Some(authority_key);
        self
    }

    pub fn generate() -> Result<Self, KeyMaterialError> {
        Ok(Self::new(SigningKeyPair::generate()?, MachineKeyPair::generate()))
    }

    pub fn node_public(&self) -> NodePublicKey {
        self.node_key.public()
    }

    pub fn machine_public(&self) -> MachinePublicKey {
        self.machine_key.public()
    }

    /// The machine key's private scalar, handed to `wirecodec` to open or
    /// accept a Noise session; never serialized or logged.
    pub fn machine_private(&self) -> &[u8; 32] {
        self.machine_key.private_bytes()
    }

    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.node_key.sign(message)
    }

    pub fn authority_sign(&self, message: &[u8]) -> Option<Vec<u8>> {
        self.authority_key.as_ref().map(|k| k.sign(message))
    }

    pub fn authority_public(&self) -> Option<NodePublicKey> {
        self.authority_key.as_ref().map(|k| k.public())
    }

    pub fn node_key_id(&self) -> KeyId {
        key_id(&self.node_public().0)
    }

    /// Loads node + machine keys from `store`, encrypted with `disk_key`;
    /// generates and persists a fresh pair if none exist.
    pub async fn load_or_generate(
        store: &dyn KvStore,
        disk_key: &[u8; 32],
    ) -> Result<Self, KeyMaterialError> {
        let node_key = load_or_create_signing(store, NODE_KEY_STORE_KEY, disk_key).await?;
        let machine_key = load_or_create_machine(store, MACHINE_KEY_STORE_KEY, disk_key).await?;
        Ok(Self::new(node_key, machine_key))
    }

    pub async fn persist(&self, store: &dyn KvStore, disk_key: &[u8; 32]) -> Result<(), KeyMaterialError> {
        persist_bytes(store, NODE_KEY_STORE_KEY, &self.node_key.pkcs8, disk_key).await?;
        persist_bytes(store, MACHINE_KEY_STORE_KEY, self.machine_key.private_bytes(), disk_key).await?;
        Ok(())
    }
}

async fn persist_bytes(
    store: &dyn KvStore,
    key: &str,
    plaintext: &[u8],
    disk_key: &[u8; 32],
) -> Result<(), KeyMaterialError> {
    let env = seal(plaintext, disk_key);
    let bytes = bincode::serialize(&env)?;
    store.put(key, &bytes).await?;
    Ok(())
}

async fn load_or_create_signing(
    store: &dyn KvStore,
    key: &str,
    disk_key: &[u8; 32],
) -> Result<SigningKeyPair, KeyMaterialError> {
    match store.get(key).await? {
        Some(bytes) => {
            let env: Envelope = bincode::deserialize(&bytes)?;
            let pkcs8 = open(&env, disk_key)?;
            SigningKeyPair::from_pkcs8(&pkcs8)
        }
        None => {
            let pair = SigningKeyPair::generate()?;
            persist_bytes(store, key, &pair.pkcs8, disk_key).await?;
            Ok(pair)
        }
    }
}

async fn load_or_create_machine(
    store: &dyn KvStore,
    key: &str,
    disk_key: &[u8; 32],
) -> Result<MachineKeyPair, KeyMaterialError> {
    match store.get(key).await? {
        Some(bytes) => {
            let env: Envelope = bincode::deserialize(&bytes)?;
            let scalar = open(&env, disk_key)?;
            if scalar.len() != 32 {
                return Err(KeyMaterialError::InvalidDocument);
            }
            let mut private = [0u8; 32];
            private.copy_from_slice(&scalar);
            Ok(MachineKeyPair::from_private(private))
        }
        None => {
            let pair = MachineKeyPair::generate();
            persist_bytes(store, key, pair.private_bytes(), disk_key).await?;
            Ok(pair)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn sign_and_verify_round_trip() {
        let pair = SigningKeyPair::generate().unwrap();
        let sig = pair.sign(b"hello");
        assert!(verify(&pair.public(), b"hello", &sig));
        assert!(!verify(&pair.public(), b"tampered", &sig));
    }

    #[test]
    fn key_id_is_stable_and_order_sensitive() {
        let a = key_id(&[1u8; 32]);
        let b = key_id(&[1u8; 32]);
        let c = key_id(&[2u8; 32]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn load_or_generate_persists_and_reloads_same_identity() {
        let store = MemoryStore::new();
        let disk_key = [7u8; 32];
        let km1 = KeyMaterial::load_or_generate(&store, &disk_key).await.unwrap();
        let pub1 = km1.node_public();

        let km2 = KeyMaterial::load_or_generate(&store, &disk_key).await.unwrap();
        assert_eq!(pub1, km2.node_public());
    }

    #[tokio::test]
    async fn wrong_disk_key_fails_to_decrypt() {
        let store = MemoryStore::new();
        let _ = KeyMaterial::load_or_generate(&store, &[1u8; 32]).await.unwrap();
        let err = KeyMaterial::load_or_generate(&store, &[2u8; 32]).await;
        assert!(matches!(err, Err(KeyMaterialError::DecryptFailed)));
    }
}
