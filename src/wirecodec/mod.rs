//! WireCodec (spec §4.1): an encrypted, authenticated bidirectional channel
//! between two long-term asymmetric keypairs, built on Noise over
//! Curve25519 with a ChaCha20-Poly1305 AEAD.
//!
//! Grounded on the teacher's `net/utils.rs` (`snow::Builder`, lazy_static
//! `NoiseParams`, `build_initiator`/`build_responder`), generalized from one
//! fixed `XX` pattern to the two patterns this spec actually needs: `XK`
//! (client dials a coordinator/relay whose static key it already learned
//! out-of-band via `/key`) and `IK` (two peers who already know each other's
//! node public key from the NetworkMap).

use std::time::{Duration, Instant};

use snow::params::NoiseParams;
use snow::{Builder, HandshakeState, TransportState};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::types::NodePublicKey;

lazy_static::lazy_static! {
    static ref PARAMS_XK: NoiseParams = "Noise_XK_25519_ChaChaPoly_BLAKE2s"
        .parse()
        .expect("wirecodec: invalid XK noise params");
    static ref PARAMS_IK: NoiseParams = "Noise_IK_25519_ChaChaPoly_BLAKE2s"
        .parse()
        .expect("wirecodec: invalid IK noise params");
}

/// Rekey thresholds: whichever bound is hit first forces a new handshake.
pub const REKEY_AFTER_MESSAGES: u64 = 1 << 20;
pub const REKEY_AFTER_BYTES: u64 = 1 << 30;
/// Per spec §5, outbound handshakes that don't complete within this window
/// are `HandshakeFailed`, not left pending forever.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum WireCodecError {
    #[error("wirecodec: handshake failed: {0}")]
    HandshakeFailed(String),
    #[error("wirecodec: handshake timed out")]
    Timeout,
    #[error("wirecodec: replayed or out-of-order record")]
    Replay,
    #[error("wirecodec: decrypt failed")]
    DecryptFailed,
    #[error("wirecodec: session expired, redial required")]
    SessionExpired,
    #[error("wirecodec: io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("wirecodec: frame too large ({0} bytes)")]
    FrameTooLarge(usize),
}

pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// A live, post-handshake session: a pair of directional symmetric keys plus
/// the remote party's verified static public key.
pub struct Session {
    transport: TransportState,
    remote_static: NodePublicKey,
    messages_sent: u64,
    bytes_sent: u64,
    established_at: Instant,
}

impl Session {
    pub fn remote_static(&self) -> &NodePublicKey {
        &self.remote_static
    }

    /// True once either rekey threshold (message count or byte count) is hit.
    /// Callers (ControlClient, PeerPath) redial/re-handshake when this flips.
    pub fn needs_rekey(&self) -> bool {
        self.messages_sent >= REKEY_AFTER_MESSAGES || self.bytes_sent >= REKEY_AFTER_BYTES
    }

    pub fn age(&self) -> Duration {
        self.established_at.elapsed()
    }

    /// Encrypts one message-level record (used directly for UDP datagrams,
    /// where each datagram is one Noise transport message).
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, WireCodecError> {
        let mut out = vec![0u8; plaintext.len() + 16];
        let len = self
            .transport
            .write_message(plaintext, &mut out)
            .map_err(|_| WireCodecError::DecryptFailed)?;
        out.truncate(len);
        self.messages_sent += 1;
        self.bytes_sent += len as u64;
        Ok(out)
    }

    /// Decrypts one message-level record. On failure, session state (nonce,
    /// keys) is left unchanged — spec §8: "every WireCodec decrypt failure
    /// leaves session state unchanged" — because `snow` does not advance its
    /// receive nonce on a failed `read_message` call.
    pub fn decrypt(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, WireCodecError> {
        let mut out = vec![0u8; ciphertext.len()];
        let len = self
            .transport
            .read_message(ciphertext, &mut out)
            .map_err(|_| WireCodecError::DecryptFailed)?;
        out.truncate(len);
        Ok(out)
    }

    /// Stream-oriented send: `{length | ciphertext}` framing, for use over
    /// a TCP/TLS byte stream (coordinator and relay connections).
    pub async fn send<S: tokio::io::AsyncWrite + Unpin>(
        &mut self,
        stream: &mut S,
        plaintext: &[u8],
    ) -> Result<(), WireCodecError> {
        let record = self.encrypt(plaintext)?;
        if record.len() > MAX_FRAME_LEN {
            return Err(WireCodecError::FrameTooLarge(record.len()));
        }
        stream.write_u32(record.len() as u32).await?;
        stream.write_all(&record).await?;
        Ok(())
    }

    /// Stream-oriented receive: reads one `{length | ciphertext}` frame and
    /// decrypts it.
    pub async fn recv<S: tokio::io::AsyncRead + Unpin>(
        &mut self,
        stream: &mut S,
    ) -> Result<Vec<u8>, WireCodecError> {
        let len = stream.read_u32().await? as usize;
        if len > MAX_FRAME_LEN {
            return Err(WireCodecError::FrameTooLarge(len));
        }
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await?;
        self.decrypt(&buf)
    }
}

/// Performs the client side of the `XK` handshake against a known remote
/// static key (spec §4.1: `clientHandshake`). Used by ControlClient dialing
/// the coordinator and by the data plane dialing a relay.
pub async fn client_handshake<S>(
    local_priv: &[u8; 32],
    remote_pub: &[u8; 32],
    stream: &mut S,
) -> Result<Session, WireCodecError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, run_xk_initiator(local_priv, remote_pub, stream))
        .await
        .map_err(|_| WireCodecError::Timeout)?
}

async fn run_xk_initiator<S>(
    local_priv: &[u8; 32],
    remote_pub: &[u8; 32],
    stream: &mut S,
) -> Result<Session, WireCodecError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut hs = Builder::new(PARAMS_XK.clone())
        .local_private_key(local_priv)
        .remote_public_key(remote_pub)
        .build_initiator()
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;

    // -> e
    write_hs_frame(stream, &mut hs, &[]).await?;
    // <- e, ee, es
    read_hs_frame(stream, &mut hs).await?;
    // -> s, se
    write_hs_frame(stream, &mut hs, &[]).await?;

    finish(hs, NodePublicKey(*remote_pub))
}

/// Performs the server side of the `XK` handshake, yielding the client's
/// static public key once the handshake completes (spec §4.1:
/// `serverHandshake`).
pub async fn server_handshake<S>(
    local_priv: &[u8; 32],
    stream: &mut S,
) -> Result<(NodePublicKey, Session), WireCodecError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    tokio::time::timeout(HANDSHAKE_TIMEOUT, run_xk_responder(local_priv, stream))
        .await
        .map_err(|_| WireCodecError::Timeout)?
}

async fn run_xk_responder<S>(
    local_priv: &[u8; 32],
    stream: &mut S,
) -> Result<(NodePublicKey, Session), WireCodecError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let mut hs = Builder::new(PARAMS_XK.clone())
        .local_private_key(local_priv)
        .build_responder()
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;

    // -> e
    read_hs_frame(stream, &mut hs).await?;
    // <- e, ee, es
    write_hs_frame(stream, &mut hs, &[]).await?;
    // -> s, se
    read_hs_frame(stream, &mut hs).await?;

    let remote_static = hs
        .get_remote_static()
        .ok_or_else(|| WireCodecError::HandshakeFailed("no remote static key".into()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(remote_static);
    let remote = NodePublicKey(key);
    let session = finish(hs, remote.clone())?;
    Ok((remote, session))
}

/// Performs an `IK` handshake as the initiator: both parties already know
/// each other's node public key from the NetworkMap (used for direct
/// peer-to-peer sessions set up via DiscoChannel).
pub fn ik_initiator_start(
    local_priv: &[u8; 32],
    remote_pub: &[u8; 32],
) -> Result<(HandshakeState, Vec<u8>), WireCodecError> {
    let mut hs = Builder::new(PARAMS_IK.clone())
        .local_private_key(local_priv)
        .remote_public_key(remote_pub)
        .build_initiator()
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    let mut buf = vec![0u8; 1024];
    let len = hs
        .write_message(&[], &mut buf)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    buf.truncate(len);
    Ok((hs, buf))
}

pub fn ik_initiator_finish(
    mut hs: HandshakeState,
    msg: &[u8],
) -> Result<Session, WireCodecError> {
    let mut buf = vec![0u8; msg.len() + 64];
    hs.read_message(msg, &mut buf)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    let remote = remote_static_of(&hs)?;
    finish(hs, remote)
}

pub fn ik_responder_accept(
    local_priv: &[u8; 32],
    msg: &[u8],
) -> Result<(HandshakeState, Vec<u8>, NodePublicKey), WireCodecError> {
    let mut hs = Builder::new(PARAMS_IK.clone())
        .local_private_key(local_priv)
        .build_responder()
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    let mut scratch = vec![0u8; msg.len() + 64];
    hs.read_message(msg, &mut scratch)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    let remote = remote_static_of(&hs)?;

    let mut out = vec![0u8; 1024];
    let len = hs
        .write_message(&[], &mut out)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    out.truncate(len);
    Ok((hs, out, remote))
}

pub fn ik_responder_finish(hs: HandshakeState, remote: NodePublicKey) -> Result<Session, WireCodecError> {
    finish(hs, remote)
}

fn remote_static_of(hs: &HandshakeState) -> Result<NodePublicKey, WireCodecError> {
    let bytes = hs
        .get_remote_static()
        .ok_or_else(|| WireCodecError::HandshakeFailed("no remote static key".into()))?;
    let mut key = [0u8; 32];
    key.copy_from_slice(bytes);
    Ok(NodePublicKey(key))
}

fn finish(hs: HandshakeState, remote_static: NodePublicKey) -> Result<Session, WireCodecError> {
    let transport = hs
        .into_transport_mode()
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    Ok(Session {
        transport,
        remote_static,
        messages_sent: 0,
        bytes_sent: 0,
        established_at: Instant::now(),
    })
}

async fn write_hs_frame<S>(
    stream: &mut S,
    hs: &mut HandshakeState,
    payload: &[u8],
) -> Result<(), WireCodecError>
where
    S: tokio::io::AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; payload.len() + 256];
    let len = hs
        .write_message(payload, &mut buf)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    stream.write_u32(len as u32).await?;
    stream.write_all(&buf[..len]).await?;
    Ok(())
}

async fn read_hs_frame<S>(stream: &mut S, hs: &mut HandshakeState) -> Result<Vec<u8>, WireCodecError>
where
    S: tokio::io::AsyncRead + Unpin,
{
    let len = stream.read_u32().await? as usize;
    if len > MAX_FRAME_LEN {
        return Err(WireCodecError::FrameTooLarge(len));
    }
    let mut msg = vec![0u8; len];
    stream.read_exact(&mut msg).await?;
    let mut payload = vec![0u8; len];
    let plen = hs
        .read_message(&msg, &mut payload)
        .map_err(|e| WireCodecError::HandshakeFailed(e.to_string()))?;
    payload.truncate(plen);
    Ok(payload)
}

/// Generates a fresh Curve25519 keypair suitable for a machine key (the
/// Noise static key distinct from the Ed25519 node identity).
pub fn generate_static_keypair() -> ([u8; 32], [u8; 32]) {
    let kp = Builder::new(PARAMS_XK.clone()).generate_keypair().expect("dh keygen");
    let mut priv_bytes = [0u8; 32];
    let mut pub_bytes = [0u8; 32];
    priv_bytes.copy_from_slice(&kp.private);
    pub_bytes.copy_from_slice(&kp.public);
    (priv_bytes, pub_bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    #[tokio::test]
    async fn xk_handshake_establishes_matching_sessions() {
        let (client_priv, client_pub) = generate_static_keypair();
        let (server_priv, server_pub) = generate_static_keypair();
        let _ = client_pub;

        let (mut client_stream, mut server_stream) = duplex(4096);

        let client_fut = client_handshake(&client_priv, &server_pub, &mut client_stream);
        let server_fut = server_handshake(&server_priv, &mut server_stream);

        let (client_session, server_result) = tokio::join!(client_fut, server_fut);
        let mut client_session = client_session.unwrap();
        let (remote_client_key, mut server_session) = server_result.unwrap();

        assert_eq!(remote_client_key.0, client_pub);

        let ct = client_session.encrypt(b"hello relay").unwrap();
        let pt = server_session.decrypt(&ct).unwrap();
        assert_eq!(pt, b"hello relay");
    }

    #[tokio::test]
    async fn framed_send_recv_round_trip_over_duplex_stream() {
        let (client_priv, _client_pub) = generate_static_keypair();
        let (server_priv, server_pub) = generate_static_keypair();
        let (mut client_stream, mut server_stream) = duplex(4096);

        let client_fut = client_handshake(&client_priv, &server_pub, &mut client_stream);
        let server_fut = server_handshake(&server_priv, &mut server_stream);
        let (client_session, server_result) = tokio::join!(client_fut, server_fut);
        let mut client_session = client_session.unwrap();
        let (_, mut server_session) = server_result.unwrap();

        client_session.send(&mut client_stream, b"map request").await.unwrap();
        let received = server_session.recv(&mut server_stream).await.unwrap();
        assert_eq!(received, b"map request");
    }

    #[test]
    fn decrypt_failure_does_not_advance_nonce() {
        let (a_priv, a_pub) = generate_static_keypair();
        let (b_priv, b_pub) = generate_static_keypair();

        let (mut a_hs, msg1) = ik_initiator_start(&a_priv, &b_pub).unwrap();
        let (b_hs, msg2, _a_remote) = ik_responder_accept(&b_priv, &msg1).unwrap();
        let mut a_session = {
            let mut buf = vec![0u8; msg2.len() + 64];
            a_hs.read_message(&msg2, &mut buf).unwrap();
            finish(a_hs, NodePublicKey(b_pub)).unwrap()
        };
        let mut b_session = ik_responder_finish(b_hs, NodePublicKey(a_pub)).unwrap();

        let good = a_session.encrypt(b"payload").unwrap();
        // tamper with the ciphertext
        let mut bad = good.clone();
        *bad.last_mut().unwrap() ^= 0xff;
        assert!(b_session.decrypt(&bad).is_err());
        // the untampered record still decrypts: the failed attempt didn't
        // advance the receiver's nonce.
        assert_eq!(b_session.decrypt(&good).unwrap(), b"payload");
    }
}
