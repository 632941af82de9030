//! Connection framing: protocol magic, header bits, verb ordinals.
//!
//! Every framed message starts with the protocol magic and a header word:
//!
//! ```text
//! [magic: i32][header: i32][payload...]
//!   header bit 2      — payload is compressed
//!   header bit 3      — streaming connection
//!   header bits 8..   — messaging version
//! ```

use bytes::BytesMut;

use crate::codec::{read_i32, write_i32};
use crate::error::WireError;

/// "MRLN"
pub const PROTOCOL_MAGIC: i32 = 0x4D52_4C4E;

const COMPRESSION_BIT: i32 = 1 << 2;
const STREAMING_BIT: i32 = 1 << 3;

/// Message verbs carried by the framed connection. Unknown ordinals are a
/// decode error; the handler's policy is to log and drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum Verb {
    TreeRequest = 0,
    TreeResponse = 1,
    SyncRequest = 2,
    Snapshot = 3,
    RangeSlice = 4,
}

impl Verb {
    pub fn from_ordinal(ordinal: i32) -> Result<Verb, WireError> {
        match ordinal {
            0 => Ok(Verb::TreeRequest),
            1 => Ok(Verb::TreeResponse),
            2 => Ok(Verb::SyncRequest),
            3 => Ok(Verb::Snapshot),
            4 => Ok(Verb::RangeSlice),
            other => Err(WireError::UnknownVerb(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u32,
    pub compressed: bool,
    pub streaming: bool,
}

impl FrameHeader {
    pub fn new(version: u32, compressed: bool, streaming: bool) -> FrameHeader {
        FrameHeader { version, compressed, streaming }
    }

    pub fn encode(&self, out: &mut BytesMut) {
        write_i32(out, PROTOCOL_MAGIC);
        let mut header = 0i32;
        if self.compressed {
            header |= COMPRESSION_BIT;
        }
        if self.streaming {
            header |= STREAMING_BIT;
        }
        header |= (self.version as i32) << 8;
        write_i32(out, header);
    }

    pub fn decode(input: &mut &[u8]) -> Result<FrameHeader, WireError> {
        let magic = read_i32(input)?;
        if magic != PROTOCOL_MAGIC {
            return Err(WireError::BadMagic { found: magic });
        }
        let header = read_i32(input)?;
        Ok(FrameHeader {
            version: (header >> 8) as u32,
            compressed: header & COMPRESSION_BIT != 0,
            streaming: header & STREAMING_BIT != 0,
        })
    }

    pub const ENCODED_SIZE: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VERSION_20;

    #[test]
    fn test_frame_header_round_trip() {
        for (compressed, streaming) in [(false, false), (true, false), (false, true), (true, true)]
        {
            let header = FrameHeader::new(VERSION_20, compressed, streaming);
            let mut out = BytesMut::new();
            header.encode(&mut out);
            assert_eq!(out.len(), FrameHeader::ENCODED_SIZE);
            let mut input: &[u8] = &out;
            assert_eq!(FrameHeader::decode(&mut input).unwrap(), header);
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut out = BytesMut::new();
        FrameHeader::new(VERSION_20, false, false).encode(&mut out);
        out[0] ^= 0xFF;
        let mut input: &[u8] = &out;
        assert!(matches!(FrameHeader::decode(&mut input), Err(WireError::BadMagic { .. })));
    }

    #[test]
    fn test_unknown_verb_is_an_error() {
        assert_eq!(Verb::from_ordinal(2).unwrap(), Verb::SyncRequest);
        assert!(matches!(Verb::from_ordinal(99), Err(WireError::UnknownVerb(99))));
    }
}
