//! Shared interval serializer.

use bytes::BytesMut;

use merlin_common::{AbstractBounds, Bounds, Range};

use crate::codec::{read_token, read_u8, write_token, write_u8, TOKEN_SIZE};
use crate::error::WireError;
use crate::VersionedSerializer;

const KIND_RANGE: u8 = 0;
const KIND_BOUNDS: u8 = 1;

/// `kind | left token | right token`, version-independent.
pub struct AbstractBoundsSerializer;

impl VersionedSerializer<AbstractBounds> for AbstractBoundsSerializer {
    fn serialize(
        &self,
        value: &AbstractBounds,
        out: &mut BytesMut,
        _version: u32,
    ) -> Result<(), WireError> {
        match value {
            AbstractBounds::Range(r) => {
                write_u8(out, KIND_RANGE);
                write_token(out, r.left);
                write_token(out, r.right);
            }
            AbstractBounds::Bounds(b) => {
                write_u8(out, KIND_BOUNDS);
                write_token(out, b.left);
                write_token(out, b.right);
            }
        }
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8], _version: u32) -> Result<AbstractBounds, WireError> {
        let kind = read_u8(input)?;
        let left = read_token(input)?;
        let right = read_token(input)?;
        match kind {
            KIND_RANGE => Ok(AbstractBounds::Range(Range::new(left, right))),
            KIND_BOUNDS => Ok(AbstractBounds::Bounds(Bounds::new(left, right))),
            other => Err(WireError::UnknownBoundsKind(other)),
        }
    }

    fn serialized_size(&self, _value: &AbstractBounds, _version: u32) -> usize {
        1 + 2 * TOKEN_SIZE
    }
}

/// Deserialize, requiring the wrapping `Range` flavor.
pub fn expect_range(input: &mut &[u8], version: u32) -> Result<Range, WireError> {
    match AbstractBoundsSerializer.deserialize(input, version)? {
        AbstractBounds::Range(range) => Ok(range),
        AbstractBounds::Bounds(_) => Err(WireError::BadField {
            field: "range",
            detail: "expected a wrapping range, found closed bounds".into(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::VERSION_12;
    use crate::{from_bytes, to_bytes};
    use merlin_common::Token;

    #[test]
    fn test_round_trip_both_kinds() {
        let values = [
            AbstractBounds::Range(Range::new(Token(5), Token(99))),
            AbstractBounds::Bounds(Bounds::new(Token(0), Token(42))),
        ];
        for value in values {
            let bytes = to_bytes(&AbstractBoundsSerializer, &value, VERSION_12).unwrap();
            assert_eq!(bytes.len(), AbstractBoundsSerializer.serialized_size(&value, VERSION_12));
            assert_eq!(from_bytes(&AbstractBoundsSerializer, &bytes, VERSION_12).unwrap(), value);
        }
    }

    #[test]
    fn test_unknown_kind_rejected() {
        let mut bytes = to_bytes(
            &AbstractBoundsSerializer,
            &AbstractBounds::Range(Range::new(Token(1), Token(2))),
            VERSION_12,
        )
        .unwrap();
        bytes[0] = 9;
        assert!(matches!(
            from_bytes(&AbstractBoundsSerializer, &bytes, VERSION_12),
            Err(WireError::UnknownBoundsKind(9))
        ));
    }
}
