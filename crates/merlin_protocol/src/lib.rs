//! Versioned wire encodings for the repair and read-path messages.
//!
//! All multi-byte integers are big-endian (network order). Strings are
//! UTF-8 with a u16 length prefix. Every serializer implements the same
//! three-method contract and is exact: `serialized_size` equals the byte
//! length `serialize` produces, and message-level decoding rejects
//! trailing bytes instead of ignoring them.
//!
//! Version evolution (bit-exact):
//! - `< V11`  — predicates are legacy-framed with an i32 length prefix;
//!   range-slice commands carry no row filter or paging flags
//! - `≥ V11`  — row filter, `max_is_columns`, `is_paging` appended
//! - `≥ V12`  — predicate and filter items self-describe their length;
//!   the explicit prefix is dropped
//! - `≥ V20`  — tree requests carry `gc_before`

pub mod bounds;
pub mod codec;
pub mod error;
pub mod frame;
pub mod range_slice;
pub mod snapshot;
pub mod sync;
pub mod tree;
pub mod version;

use bytes::BytesMut;

pub use bounds::AbstractBoundsSerializer;
pub use error::WireError;
pub use frame::{FrameHeader, Verb, PROTOCOL_MAGIC};
pub use range_slice::{
    IndexExpression, IndexOperator, RangeSliceCommand, RangeSliceCommandSerializer,
    SlicePredicate,
};
pub use snapshot::SnapshotCommandSerializer;
pub use sync::StreamingRepairTaskSerializer;
pub use tree::{MerkleTreeSerializer, TreeRequestSerializer, TreeResponse, TreeResponseSerializer};
pub use version::{VERSION_10, VERSION_11, VERSION_12, VERSION_20};

/// The three-method contract every wire message implements.
pub trait VersionedSerializer<T> {
    fn serialize(&self, value: &T, out: &mut BytesMut, version: u32) -> Result<(), WireError>;
    fn deserialize(&self, input: &mut &[u8], version: u32) -> Result<T, WireError>;
    fn serialized_size(&self, value: &T, version: u32) -> usize;
}

/// Serialize to a fresh buffer.
pub fn to_bytes<T>(
    serializer: &impl VersionedSerializer<T>,
    value: &T,
    version: u32,
) -> Result<Vec<u8>, WireError> {
    let mut out = BytesMut::with_capacity(serializer.serialized_size(value, version));
    serializer.serialize(value, &mut out, version)?;
    Ok(out.to_vec())
}

/// Decode a full message body; trailing bytes are a protocol error, never
/// silently dropped.
pub fn from_bytes<T>(
    serializer: &impl VersionedSerializer<T>,
    bytes: &[u8],
    version: u32,
) -> Result<T, WireError> {
    let mut input = bytes;
    let value = serializer.deserialize(&mut input, version)?;
    if !input.is_empty() {
        return Err(WireError::TrailingBytes { remaining: input.len() });
    }
    Ok(value)
}
