//! Relay wire framing (spec §4.9). `WireCodec::Session::send`/`recv` already
//! provide length-prefixed, encrypted framing over the TLS stream; a frame
//! here is just the tagged plaintext carried inside one such record.
//!
//! Grounded directly on `other_examples/..._dersp...-proto-data.rs`'s
//! `FrameType` tagged-enum wire format, re-expressed for this crate's own
//! session/record types rather than copied verbatim (SPEC_FULL §C.9).

use thiserror::Error;

use crate::types::NodePublicKey;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("relay: frame too short")]
    Truncated,
    #[error("relay: unknown frame type {0}")]
    UnknownType(u8),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// client -> server: `{dstKey[32] | payload}` (spec §4.9).
    SendPacket = 0x01,
    /// server -> client: `{srcKey[32] | payload}` (spec §4.9).
    RecvPacket = 0x02,
    KeepAlive = 0x03,
    /// server -> client: a peer this client previously received from has
    /// disconnected (SPEC_FULL §C.9, mesh-mode bookkeeping).
    PeerGone = 0x04,
    /// server -> client: a mesh peer announces a locally-connected client.
    PeerPresent = 0x05,
    /// relay -> relay only: `{forwardedOnce[1] | srcKey[32] | dstKey[32] | payload}`.
    ForwardPacket = 0x06,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(v: u8) -> Result<Self, FrameError> {
        Ok(match v {
            0x01 => FrameType::SendPacket,
            0x02 => FrameType::RecvPacket,
            0x03 => FrameType::KeepAlive,
            0x04 => FrameType::PeerGone,
            0x05 => FrameType::PeerPresent,
            0x06 => FrameType::ForwardPacket,
            other => return Err(FrameError::UnknownType(other)),
        })
    }
}

pub fn frame_type(body: &[u8]) -> Result<FrameType, FrameError> {
    body.first().copied().ok_or(FrameError::Truncated)?.try_into()
}

fn encode_keyed(tag: FrameType, key: &NodePublicKey, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 32 + payload.len());
    out.push(tag as u8);
    out.extend_from_slice(&key.0);
    out.extend_from_slice(payload);
    out
}

fn decode_keyed(body: &[u8]) -> Result<(NodePublicKey, &[u8]), FrameError> {
    if body.len() < 1 + 32 {
        return Err(FrameError::Truncated);
    }
    let mut key = [0u8; 32];
    key.copy_from_slice(&body[1..33]);
    Ok((NodePublicKey(key), &body[33..]))
}

pub fn encode_send_packet(dst: &NodePublicKey, payload: &[u8]) -> Vec<u8> {
    encode_keyed(FrameType::SendPacket, dst, payload)
}

pub fn decode_send_packet(body: &[u8]) -> Result<(NodePublicKey, &[u8]), FrameError> {
    decode_keyed(body)
}

pub fn encode_recv_packet(src: &NodePublicKey, payload: &[u8]) -> Vec<u8> {
    encode_keyed(FrameType::RecvPacket, src, payload)
}

pub fn decode_recv_packet(body: &[u8]) -> Result<(NodePublicKey, &[u8]), FrameError> {
    decode_keyed(body)
}

pub fn encode_keep_alive() -> Vec<u8> {
    vec![FrameType::KeepAlive as u8]
}

pub fn encode_peer_gone(peer: &NodePublicKey) -> Vec<u8> {
    encode_keyed(FrameType::PeerGone, peer, &[])
}

pub fn encode_peer_present(peer: &NodePublicKey) -> Vec<u8> {
    encode_keyed(FrameType::PeerPresent, peer, &[])
}

pub fn decode_peer_key(body: &[u8]) -> Result<NodePublicKey, FrameError> {
    decode_keyed(body).map(|(key, _)| key)
}

pub struct ForwardPacket<'a> {
    pub forwarded_once: bool,
    pub src: NodePublicKey,
    pub dst: NodePublicKey,
    pub payload: &'a [u8],
}

/// `forwardedOnce` is always written `1` by the relay that first forwards a
/// record onto a mesh peer; the receiving mesh peer only attempts local
/// delivery of a `ForwardPacket`, never re-forwards it to a third mesh peer
/// (spec §4.9 loop prevention).
pub fn encode_forward_packet(src: &NodePublicKey, dst: &NodePublicKey, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(2 + 32 + 32 + payload.len());
    out.push(FrameType::ForwardPacket as u8);
    out.push(1u8);
    out.extend_from_slice(&src.0);
    out.extend_from_slice(&dst.0);
    out.extend_from_slice(payload);
    out
}

pub fn decode_forward_packet(body: &[u8]) -> Result<ForwardPacket<'_>, FrameError> {
    if body.len() < 2 + 32 + 32 {
        return Err(FrameError::Truncated);
    }
    let forwarded_once = body[1] != 0;
    let mut src = [0u8; 32];
    src.copy_from_slice(&body[2..34]);
    let mut dst = [0u8; 32];
    dst.copy_from_slice(&body[34..66]);
    Ok(ForwardPacket { forwarded_once, src: NodePublicKey(src), dst: NodePublicKey(dst), payload: &body[66..] })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> NodePublicKey {
        NodePublicKey([b; 32])
    }

    #[test]
    fn send_packet_round_trip() {
        let body = encode_send_packet(&key(7), b"hello");
        assert_eq!(frame_type(&body).unwrap(), FrameType::SendPacket);
        let (dst, payload) = decode_send_packet(&body).unwrap();
        assert_eq!(dst, key(7));
        assert_eq!(payload, b"hello");
    }

    #[test]
    fn recv_packet_round_trip() {
        let body = encode_recv_packet(&key(3), b"world");
        let (src, payload) = decode_recv_packet(&body).unwrap();
        assert_eq!(src, key(3));
        assert_eq!(payload, b"world");
    }

    #[test]
    fn forward_packet_round_trip_carries_forwarded_once() {
        let body = encode_forward_packet(&key(1), &key(2), b"x");
        let parsed = decode_forward_packet(&body).unwrap();
        assert!(parsed.forwarded_once);
        assert_eq!(parsed.src, key(1));
        assert_eq!(parsed.dst, key(2));
        assert_eq!(parsed.payload, b"x");
    }

    #[test]
    fn keep_alive_has_no_payload() {
        let body = encode_keep_alive();
        assert_eq!(frame_type(&body).unwrap(), FrameType::KeepAlive);
        assert_eq!(body.len(), 1);
    }

    #[test]
    fn truncated_keyed_frame_is_rejected() {
        assert!(matches!(decode_send_packet(&[FrameType::SendPacket as u8, 1, 2]), Err(FrameError::Truncated)));
    }

    #[test]
    fn unknown_frame_type_is_rejected() {
        assert!(matches!(frame_type(&[0xff]), Err(FrameError::UnknownType(0xff))));
    }
}
