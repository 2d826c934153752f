// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Length-prefixed, versioned, authenticated message framing (spec §6).
//!
//! Every message on the wire is: `u32` length, `u16` protocol version,
//! `u16` msg_type, `u8` flags, an auth header (uid, gid, HMAC), then a
//! JSON payload. Framing stays synchronous `std::io::Read`/`Write` rather
//! than the teacher's `tokio::io::AsyncRead`/`AsyncWrite` — this agent's
//! dispatcher is thread-per-request over blocking sockets (spec §4.4), so
//! there is no async runtime underneath these calls to await on.

use std::io::{self, Read, Write};
use thiserror::Error;

/// Current protocol version this build speaks natively.
pub const PROTOCOL_VERSION: u16 = 2;
/// Oldest protocol version still accepted (spec §6: "MUST accept at least
/// the current and the previous stable protocol version").
pub const MIN_SUPPORTED_PROTOCOL_VERSION: u16 = 1;

/// Largest payload this agent will allocate for, guarding against a
/// corrupt or hostile length prefix.
pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("message too large: {size} bytes (max {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("unsupported protocol version {version} (minimum {minimum})")]
    UnsupportedVersion { version: u16, minimum: u16 },

    #[error("connection closed")]
    ConnectionClosed,

    #[error("authentication header rejected: {0}")]
    AuthRejected(String),
}

/// Envelope flag bits. Only `COMPRESSED` is defined today; the byte exists
/// so future flags don't require a framing version bump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeFlags(u8);

impl EnvelopeFlags {
    pub const COMPRESSED: EnvelopeFlags = EnvelopeFlags(0b0000_0001);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn from_bits_truncate(bits: u8) -> Self {
        Self(bits & 0b0000_0001)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for EnvelopeFlags {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Authentication header carried on every envelope (spec §6: "auth-header
/// (uid, gid, HMAC)"). The HMAC covers the JSON payload bytes; `agentd-vault`
/// owns key derivation and verification, this struct only carries the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthHeader {
    pub uid: u32,
    pub gid: u32,
    pub hmac: [u8; 32],
}

impl AuthHeader {
    fn write_to(&self, w: &mut impl Write) -> Result<(), WireError> {
        w.write_all(&self.uid.to_be_bytes())?;
        w.write_all(&self.gid.to_be_bytes())?;
        w.write_all(&self.hmac)?;
        Ok(())
    }

    fn read_from(r: &mut impl Read) -> Result<Self, WireError> {
        let mut uid_buf = [0u8; 4];
        let mut gid_buf = [0u8; 4];
        let mut hmac = [0u8; 32];
        r.read_exact(&mut uid_buf)?;
        r.read_exact(&mut gid_buf)?;
        r.read_exact(&mut hmac)?;
        Ok(Self { uid: u32::from_be_bytes(uid_buf), gid: u32::from_be_bytes(gid_buf), hmac })
    }

    const WIRE_LEN: usize = 4 + 4 + 32;
}

/// An envelope header plus its undecoded payload bytes.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub protocol_version: u16,
    pub msg_type: u16,
    pub flags: EnvelopeFlags,
    pub auth: AuthHeader,
    pub payload: Vec<u8>,
}

/// Serializes `msg` to JSON and wraps it in an envelope, writing it to `w`.
pub fn write_envelope(
    w: &mut impl Write,
    protocol_version: u16,
    msg_type: u16,
    flags: EnvelopeFlags,
    auth: &AuthHeader,
    payload: &[u8],
) -> Result<(), WireError> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge { size: payload.len(), max: MAX_MESSAGE_SIZE });
    }

    let header_len = 2 + 2 + 1 + AuthHeader::WIRE_LEN;
    let total_len = (header_len + payload.len()) as u32;

    w.write_all(&total_len.to_be_bytes())?;
    w.write_all(&protocol_version.to_be_bytes())?;
    w.write_all(&msg_type.to_be_bytes())?;
    w.write_all(&[flags.bits()])?;
    auth.write_to(w)?;
    w.write_all(payload)?;
    w.flush()?;
    Ok(())
}

/// Reads one envelope from `r`, validating the length prefix and protocol
/// version before allocating the payload buffer.
pub fn read_envelope(r: &mut impl Read) -> Result<Envelope, WireError> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Err(WireError::ConnectionClosed),
        Err(e) => return Err(WireError::Io(e)),
    }
    let total_len = u32::from_be_bytes(len_buf) as usize;
    if total_len > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge { size: total_len, max: MAX_MESSAGE_SIZE });
    }

    let mut version_buf = [0u8; 2];
    let mut msg_type_buf = [0u8; 2];
    let mut flags_buf = [0u8; 1];
    r.read_exact(&mut version_buf)?;
    r.read_exact(&mut msg_type_buf)?;
    r.read_exact(&mut flags_buf)?;

    let protocol_version = u16::from_be_bytes(version_buf);
    if protocol_version < MIN_SUPPORTED_PROTOCOL_VERSION {
        return Err(WireError::UnsupportedVersion { version: protocol_version, minimum: MIN_SUPPORTED_PROTOCOL_VERSION });
    }

    let auth = AuthHeader::read_from(r)?;

    let header_len = 2 + 2 + 1 + AuthHeader::WIRE_LEN;
    let payload_len = total_len.saturating_sub(header_len);
    let mut payload = vec![0u8; payload_len];
    r.read_exact(&mut payload)?;

    Ok(Envelope {
        protocol_version,
        msg_type: u16::from_be_bytes(msg_type_buf),
        flags: EnvelopeFlags::from_bits_truncate(flags_buf[0]),
        auth,
        payload,
    })
}

/// Serializes `msg` to JSON, bounds-checking against `MAX_MESSAGE_SIZE`
/// (mirrors the teacher's standalone `encode`, kept separate from framing
/// so tests can inspect raw JSON without a full envelope).
pub fn encode<T: serde::Serialize>(msg: &T) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    if json.len() > MAX_MESSAGE_SIZE {
        return Err(WireError::MessageTooLarge { size: json.len(), max: MAX_MESSAGE_SIZE });
    }
    Ok(json)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(serde_json::from_slice(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn auth() -> AuthHeader {
        AuthHeader { uid: 1001, gid: 1001, hmac: [7u8; 32] }
    }

    #[test]
    fn envelope_roundtrips_through_a_cursor() {
        let payload = encode(&"hello world").expect("encode");
        let mut buf = Vec::new();
        write_envelope(&mut buf, PROTOCOL_VERSION, 42, EnvelopeFlags::empty(), &auth(), &payload).expect("write");

        let mut cursor = std::io::Cursor::new(buf);
        let envelope = read_envelope(&mut cursor).expect("read");

        assert_eq!(envelope.protocol_version, PROTOCOL_VERSION);
        assert_eq!(envelope.msg_type, 42);
        assert_eq!(envelope.auth, auth());
        let decoded: String = decode(&envelope.payload).expect("decode");
        assert_eq!(decoded, "hello world");
    }

    #[test]
    fn previous_stable_protocol_version_is_accepted() {
        let payload = encode(&"x").unwrap();
        let mut buf = Vec::new();
        write_envelope(&mut buf, MIN_SUPPORTED_PROTOCOL_VERSION, 1, EnvelopeFlags::empty(), &auth(), &payload).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let envelope = read_envelope(&mut cursor).expect("previous stable version must be accepted");
        assert_eq!(envelope.protocol_version, MIN_SUPPORTED_PROTOCOL_VERSION);
    }

    #[test]
    fn version_below_minimum_is_rejected() {
        let payload = encode(&"x").unwrap();
        let mut buf = Vec::new();
        write_envelope(&mut buf, 0, 1, EnvelopeFlags::empty(), &auth(), &payload).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let err = read_envelope(&mut cursor).unwrap_err();
        assert!(matches!(err, WireError::UnsupportedVersion { version: 0, .. }));
    }

    #[test]
    fn truncated_stream_yields_connection_closed() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = read_envelope(&mut cursor).unwrap_err();
        assert!(matches!(err, WireError::ConnectionClosed));
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocating() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes());
        let mut cursor = std::io::Cursor::new(buf);
        let err = read_envelope(&mut cursor).unwrap_err();
        assert!(matches!(err, WireError::MessageTooLarge { .. }));
    }
}
