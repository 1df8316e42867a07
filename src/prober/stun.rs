//! A minimal hand-rolled STUN client (RFC 5389 Binding Request/Response,
//! XOR-MAPPED-ADDRESS only). Backs [`super::EndpointProber`]'s reflexive
//! probe and the relay's STUN responder. Full RFC 5389/5780 compliance
//! (MESSAGE-INTEGRITY, FINGERPRINT, CHANGE-REQUEST) is out of scope; only
//! what NAT-mapping discovery needs (spec §4.3, §4.9).
//!
//! Wire layout and the XOR-MAPPED-ADDRESS construction are grounded on the
//! pack's own from-scratch STUN codec (`mycrl-turn-rs/lib/stun/src/address.rs`),
//! reimplemented directly over `bytes` rather than importing that crate.

use bytes::{Buf, BufMut, BytesMut};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use thiserror::Error;

pub const MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_RESPONSE: u16 = 0x0101;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const FAMILY_IPV4: u8 = 0x01;
const FAMILY_IPV6: u8 = 0x02;

#[derive(Debug, Error)]
pub enum StunError {
    #[error("stun: message too short")]
    Truncated,
    #[error("stun: not a binding response")]
    NotBindingResponse,
    #[error("stun: magic cookie mismatch")]
    BadCookie,
    #[error("stun: transaction id mismatch")]
    TransactionMismatch,
    #[error("stun: no XOR-MAPPED-ADDRESS attribute present")]
    MissingMappedAddress,
    #[error("stun: unknown address family {0}")]
    UnknownFamily(u8),
}

/// Builds a STUN Binding Request with a random 96-bit transaction id,
/// returning the wire bytes and the transaction id for response matching.
pub fn build_binding_request() -> (BytesMut, [u8; 12]) {
    let mut tx_id = [0u8; 12];
    rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut tx_id);

    let mut buf = BytesMut::with_capacity(20);
    buf.put_u16(BINDING_REQUEST);
    buf.put_u16(0); // message length; no attributes in the request
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(&tx_id);
    (buf, tx_id)
}

/// Parses an inbound STUN Binding Request, returning its transaction id so
/// the caller can build a matching response (spec §4.9: relay STUN
/// responder).
pub fn parse_binding_request(packet: &[u8]) -> Result<[u8; 12], StunError> {
    if packet.len() < 20 {
        return Err(StunError::Truncated);
    }
    let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
    if msg_type != BINDING_REQUEST {
        return Err(StunError::NotBindingResponse);
    }
    let cookie = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadCookie);
    }
    let mut tx_id = [0u8; 12];
    tx_id.copy_from_slice(&packet[8..20]);
    Ok(tx_id)
}

/// Parses a STUN Binding Response, verifying the header and transaction id,
/// and returns the XOR-decoded mapped address.
pub fn parse_binding_response(packet: &[u8], expected_tx: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if packet.len() < 20 {
        return Err(StunError::Truncated);
    }
    let msg_type = u16::from_be_bytes([packet[0], packet[1]]);
    if msg_type != BINDING_RESPONSE {
        return Err(StunError::NotBindingResponse);
    }
    let msg_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    let cookie = u32::from_be_bytes([packet[4], packet[5], packet[6], packet[7]]);
    if cookie != MAGIC_COOKIE {
        return Err(StunError::BadCookie);
    }
    if &packet[8..20] != expected_tx {
        return Err(StunError::TransactionMismatch);
    }

    let mut body = &packet[20..20 + msg_len.min(packet.len() - 20)];
    while body.len() >= 4 {
        let attr_type = u16::from_be_bytes([body[0], body[1]]);
        let attr_len = u16::from_be_bytes([body[2], body[3]]) as usize;
        let padded_len = (attr_len + 3) & !3;
        if body.len() < 4 + padded_len {
            break;
        }
        let value = &body[4..4 + attr_len];
        if attr_type == ATTR_XOR_MAPPED_ADDRESS {
            return decode_xor_mapped_address(value, expected_tx);
        }
        body.advance(4 + padded_len);
    }
    Err(StunError::MissingMappedAddress)
}

fn decode_xor_mapped_address(value: &[u8], tx_id: &[u8; 12]) -> Result<SocketAddr, StunError> {
    if value.len() < 4 {
        return Err(StunError::Truncated);
    }
    let family = value[1];
    let xor_port = u16::from_be_bytes([value[2], value[3]]);
    let port = xor_port ^ (MAGIC_COOKIE >> 16) as u16;

    let ip = match family {
        FAMILY_IPV4 => {
            if value.len() < 8 {
                return Err(StunError::Truncated);
            }
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&value[4..8]);
            for (i, b) in octets.iter_mut().enumerate() {
                *b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        FAMILY_IPV6 => {
            if value.len() < 20 {
                return Err(StunError::Truncated);
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&value[4..20]);
            for (i, b) in octets.iter_mut().enumerate().take(4) {
                *b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
            }
            for (i, b) in octets.iter_mut().enumerate().take(16).skip(4) {
                *b ^= tx_id[i - 4];
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(StunError::UnknownFamily(other)),
    };

    Ok(SocketAddr::new(ip, port))
}

/// Builds a Binding Response carrying `mapped` as an XOR-MAPPED-ADDRESS
/// attribute, echoing `tx_id`. Used by the relay's STUN responder (spec
/// §4.9).
pub fn build_binding_response(mapped: SocketAddr, tx_id: &[u8; 12]) -> BytesMut {
    let mut attr = BytesMut::with_capacity(20);
    attr.put_u8(0);
    let xor_port = mapped.port() ^ (MAGIC_COOKIE >> 16) as u16;
    match mapped.ip() {
        IpAddr::V4(v4) => {
            attr.put_u8(FAMILY_IPV4);
            attr.put_u16(xor_port);
            let mut octets = v4.octets();
            for (i, b) in octets.iter_mut().enumerate() {
                *b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
            }
            attr.put_slice(&octets);
        }
        IpAddr::V6(v6) => {
            attr.put_u8(FAMILY_IPV6);
            attr.put_u16(xor_port);
            let mut octets = v6.octets();
            for (i, b) in octets.iter_mut().enumerate().take(4) {
                *b ^= (MAGIC_COOKIE >> (24 - i * 8)) as u8;
            }
            for (i, b) in octets.iter_mut().enumerate().take(16).skip(4) {
                *b ^= tx_id[i - 4];
            }
            attr.put_slice(&octets);
        }
    }

    let mut buf = BytesMut::with_capacity(20 + 4 + attr.len());
    buf.put_u16(BINDING_RESPONSE);
    buf.put_u16((4 + attr.len()) as u16);
    buf.put_u32(MAGIC_COOKIE);
    buf.put_slice(tx_id);
    buf.put_u16(ATTR_XOR_MAPPED_ADDRESS);
    buf.put_u16(attr.len() as u16);
    buf.put_slice(&attr);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_request_response_round_trip_v4() {
        let (req, tx_id) = build_binding_request();
        assert_eq!(req.len(), 20);

        let mapped: SocketAddr = "203.0.113.7:51820".parse().unwrap();
        let resp = build_binding_response(mapped, &tx_id);
        let parsed = parse_binding_response(&resp, &tx_id).unwrap();
        assert_eq!(parsed, mapped);
    }

    #[test]
    fn binding_request_response_round_trip_v6() {
        let (_req, tx_id) = build_binding_request();
        let mapped: SocketAddr = "[2001:db8::1]:4242".parse().unwrap();
        let resp = build_binding_response(mapped, &tx_id);
        let parsed = parse_binding_response(&resp, &tx_id).unwrap();
        assert_eq!(parsed, mapped);
    }

    #[test]
    fn server_extracts_transaction_id_from_request() {
        let (req, tx_id) = build_binding_request();
        let parsed = parse_binding_request(&req).unwrap();
        assert_eq!(parsed, tx_id);
    }

    #[test]
    fn mismatched_transaction_id_is_rejected() {
        let (_req, tx_id) = build_binding_request();
        let other_tx = [0xffu8; 12];
        let resp = build_binding_response("203.0.113.7:1".parse().unwrap(), &other_tx);
        assert!(matches!(
            parse_binding_response(&resp, &tx_id),
            Err(StunError::TransactionMismatch)
        ));
    }
}
