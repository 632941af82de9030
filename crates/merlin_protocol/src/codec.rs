//! Primitive readers and writers.
//!
//! Readers consume from a `&mut &[u8]` cursor; writers append to a
//! `BytesMut`. Everything is big-endian.

use std::net::IpAddr;

use bytes::{BufMut, BytesMut};
use uuid::Uuid;

use merlin_common::{Endpoint, Token};

use crate::error::WireError;

type Result<T> = std::result::Result<T, WireError>;

fn ensure(buf: &[u8], need: usize) -> Result<()> {
    if buf.len() < need {
        return Err(WireError::Truncated { expected: need, actual: buf.len() });
    }
    Ok(())
}

pub fn read_u8(buf: &mut &[u8]) -> Result<u8> {
    ensure(buf, 1)?;
    let v = buf[0];
    *buf = &buf[1..];
    Ok(v)
}

pub fn read_u16(buf: &mut &[u8]) -> Result<u16> {
    ensure(buf, 2)?;
    let v = u16::from_be_bytes([buf[0], buf[1]]);
    *buf = &buf[2..];
    Ok(v)
}

pub fn read_i32(buf: &mut &[u8]) -> Result<i32> {
    ensure(buf, 4)?;
    let v = i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
    *buf = &buf[4..];
    Ok(v)
}

pub fn read_bool(buf: &mut &[u8]) -> Result<bool> {
    Ok(read_u8(buf)? != 0)
}

pub fn read_bytes(buf: &mut &[u8], n: usize) -> Result<Vec<u8>> {
    ensure(buf, n)?;
    let v = buf[..n].to_vec();
    *buf = &buf[n..];
    Ok(v)
}

pub fn read_fixed<const N: usize>(buf: &mut &[u8]) -> Result<[u8; N]> {
    ensure(buf, N)?;
    let mut out = [0u8; N];
    out.copy_from_slice(&buf[..N]);
    *buf = &buf[N..];
    Ok(out)
}

/// u16 length-prefixed UTF-8.
pub fn read_utf(buf: &mut &[u8], field: &'static str) -> Result<String> {
    let len = read_u16(buf)? as usize;
    let bytes = read_bytes(buf, len)?;
    String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8 { field })
}

/// u32 length-prefixed byte blob.
pub fn read_blob(buf: &mut &[u8]) -> Result<Vec<u8>> {
    let len = read_i32(buf)?;
    if len < 0 {
        return Err(WireError::BadField { field: "blob", detail: format!("negative length {}", len) });
    }
    read_bytes(buf, len as usize)
}

pub fn read_uuid(buf: &mut &[u8]) -> Result<Uuid> {
    Ok(Uuid::from_bytes(read_fixed::<16>(buf)?))
}

pub fn read_token(buf: &mut &[u8]) -> Result<Token> {
    Ok(Token::from_be_bytes(read_fixed::<16>(buf)?))
}

/// Compact endpoint form: address length byte (4 or 16) + raw octets.
pub fn read_endpoint(buf: &mut &[u8]) -> Result<Endpoint> {
    match read_u8(buf)? {
        4 => Ok(Endpoint(IpAddr::from(read_fixed::<4>(buf)?))),
        16 => Ok(Endpoint(IpAddr::from(read_fixed::<16>(buf)?))),
        n => Err(WireError::BadField {
            field: "endpoint",
            detail: format!("address length {} (expected 4 or 16)", n),
        }),
    }
}

pub fn write_u8(out: &mut BytesMut, v: u8) {
    out.put_u8(v);
}

pub fn write_u16(out: &mut BytesMut, v: u16) {
    out.put_u16(v);
}

pub fn write_i32(out: &mut BytesMut, v: i32) {
    out.put_i32(v);
}

pub fn write_bool(out: &mut BytesMut, v: bool) {
    out.put_u8(v as u8);
}

pub fn write_utf(out: &mut BytesMut, s: &str) {
    out.put_u16(s.len() as u16);
    out.put_slice(s.as_bytes());
}

pub fn write_blob(out: &mut BytesMut, bytes: &[u8]) {
    out.put_i32(bytes.len() as i32);
    out.put_slice(bytes);
}

pub fn write_uuid(out: &mut BytesMut, uuid: &Uuid) {
    out.put_slice(uuid.as_bytes());
}

pub fn write_token(out: &mut BytesMut, token: Token) {
    out.put_slice(&token.to_be_bytes());
}

pub fn write_endpoint(out: &mut BytesMut, endpoint: Endpoint) {
    match endpoint.0 {
        IpAddr::V4(addr) => {
            out.put_u8(4);
            out.put_slice(&addr.octets());
        }
        IpAddr::V6(addr) => {
            out.put_u8(16);
            out.put_slice(&addr.octets());
        }
    }
}

// ── size helpers ────────────────────────────────────────────────────────────

pub fn utf_size(s: &str) -> usize {
    2 + s.len()
}

pub fn blob_size(bytes: &[u8]) -> usize {
    4 + bytes.len()
}

pub fn endpoint_size(endpoint: Endpoint) -> usize {
    1 + match endpoint.0 {
        IpAddr::V4(_) => 4,
        IpAddr::V6(_) => 16,
    }
}

pub const TOKEN_SIZE: usize = 16;
pub const UUID_SIZE: usize = 16;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_primitive_round_trips() {
        let mut out = BytesMut::new();
        write_u8(&mut out, 7);
        write_u16(&mut out, 300);
        write_i32(&mut out, -42);
        write_bool(&mut out, true);
        write_utf(&mut out, "hello");

        let mut input: &[u8] = &out;
        assert_eq!(read_u8(&mut input).unwrap(), 7);
        assert_eq!(read_u16(&mut input).unwrap(), 300);
        assert_eq!(read_i32(&mut input).unwrap(), -42);
        assert!(read_bool(&mut input).unwrap());
        assert_eq!(read_utf(&mut input, "s").unwrap(), "hello");
        assert!(input.is_empty());
    }

    #[test]
    fn test_endpoint_round_trip_v4_and_v6() {
        for endpoint in [Endpoint::v4(10, 1, 2, 3), Endpoint("::1".parse().unwrap())] {
            let mut out = BytesMut::new();
            write_endpoint(&mut out, endpoint);
            assert_eq!(out.len(), endpoint_size(endpoint));
            let mut input: &[u8] = &out;
            assert_eq!(read_endpoint(&mut input).unwrap(), endpoint);
        }
    }

    #[test]
    fn test_truncated_read_fails() {
        let mut input: &[u8] = &[0x00];
        assert!(matches!(read_i32(&mut input), Err(WireError::Truncated { .. })));
    }

    #[test]
    fn test_token_and_uuid_round_trip() {
        let token = Token(0x0123_4567_89AB_CDEF_0011_2233_4455_6677);
        let uuid = Uuid::new_v4();
        let mut out = BytesMut::new();
        write_token(&mut out, token);
        write_uuid(&mut out, &uuid);
        let mut input: &[u8] = &out;
        assert_eq!(read_token(&mut input).unwrap(), token);
        assert_eq!(read_uuid(&mut input).unwrap(), uuid);
    }

    #[test]
    fn test_bad_endpoint_length_rejected() {
        let mut input: &[u8] = &[9, 0, 0];
        assert!(matches!(read_endpoint(&mut input), Err(WireError::BadField { .. })));
    }
}
