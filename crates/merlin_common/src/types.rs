//! Core identity types: ring tokens, decorated keys, endpoints, session ids.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};

use uuid::Uuid;

/// A partitioner-defined position on the token ring.
///
/// Tokens are opaque, totally ordered 128-bit key images. All ring math
/// (wrapping ranges, Merkle splitting) is expressed in terms of token
/// ordering and `midpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Token(pub u128);

impl Token {
    /// The smallest token on the ring.
    pub const MIN: Token = Token(0);

    /// The largest token on the ring.
    pub const MAX: Token = Token(u128::MAX);

    /// Midpoint of the ring arc from `self` (exclusive) to `right`
    /// (inclusive), walking clockwise. Wrap-aware: the arc length is
    /// computed modulo the ring size, so `midpoint` is well defined even
    /// when `right < self`. The degenerate full-ring arc (`self == right`)
    /// lands half a ring away.
    pub fn midpoint(self, right: Token) -> Token {
        let distance = right.0.wrapping_sub(self.0);
        if distance == 0 {
            // full ring
            return Token(self.0.wrapping_add(1 << 127));
        }
        Token(self.0.wrapping_add(distance / 2))
    }

    /// Big-endian byte image, used by the wire codecs.
    pub fn to_be_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn from_be_bytes(bytes: [u8; 16]) -> Token {
        Token(u128::from_be_bytes(bytes))
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:032x}", self.0)
    }
}

/// A raw partition key decorated with its ring token.
///
/// Ordered token-first, raw-key-second: the order rows are laid out in
/// sorted tables and the order the validator consumes them in.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DecoratedKey {
    pub token: Token,
    pub key: Vec<u8>,
}

impl DecoratedKey {
    pub fn new(token: Token, key: impl Into<Vec<u8>>) -> Self {
        Self { token, key: key.into() }
    }
}

impl PartialOrd for DecoratedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DecoratedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.token.cmp(&other.token).then_with(|| self.key.cmp(&other.key))
    }
}

impl fmt::Display for DecoratedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DecoratedKey({}, {})", self.token, hex(&self.key))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// A cluster member address.
///
/// Only the IP identifies a peer; ports are a transport concern and are
/// negotiated out of band (the wire form is the compact 4/16-byte image).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint(pub IpAddr);

impl Endpoint {
    pub fn v4(a: u8, b: u8, c: u8, d: u8) -> Endpoint {
        Endpoint(IpAddr::V4(Ipv4Addr::new(a, b, c, d)))
    }

    pub fn localhost() -> Endpoint {
        Endpoint::v4(127, 0, 0, 1)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Repair session identifier. Also used for stream-task ids on the legacy
/// wire, which sends a fresh random id per message.
pub type SessionId = Uuid;
