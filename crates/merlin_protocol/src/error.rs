//! Wire codec errors.

use thiserror::Error;

/// Errors during message encode/decode. Decoders fail closed: anything
/// malformed, truncated or over-long is an error, and the caller's policy
/// is to log and drop the message.
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Truncated message: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },

    #[error("Unexpected trailing bytes: {remaining} left after message")]
    TrailingBytes { remaining: usize },

    #[error("Invalid UTF-8 in field '{field}'")]
    InvalidUtf8 { field: &'static str },

    #[error("Invalid value in field '{field}': {detail}")]
    BadField { field: &'static str, detail: String },

    #[error("Unknown verb ordinal: {0}")]
    UnknownVerb(i32),

    #[error("Unknown bounds kind: {0}")]
    UnknownBoundsKind(u8),

    #[error("Unknown tree node tag: {0}")]
    UnknownNodeTag(u8),

    #[error("Bad protocol magic: {found:#010x}")]
    BadMagic { found: i32 },

    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u32),
}
