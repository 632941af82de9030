//! Range-slice read command.
//!
//! Kept in the core as the shape example of the versioned-serializer
//! contract: it exercises every evolution rule at once. Pre-V11 encodings
//! carry no row filter or paging flags; pre-V12 encodings frame the
//! predicate and each filter item with an explicit i32 length prefix.

use bytes::BytesMut;

use merlin_common::AbstractBounds;

use crate::bounds::AbstractBoundsSerializer;
use crate::codec::{
    blob_size, read_blob, read_bool, read_bytes, read_i32, read_u8, read_utf, utf_size,
    write_blob, write_bool, write_i32, write_u8, write_utf,
};
use crate::error::WireError;
use crate::version::{VERSION_11, VERSION_12};
use crate::VersionedSerializer;

/// Column slice selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlicePredicate {
    pub start: Vec<u8>,
    pub finish: Vec<u8>,
    pub reversed: bool,
    pub count: i32,
}

impl SlicePredicate {
    pub fn all() -> SlicePredicate {
        SlicePredicate { start: Vec::new(), finish: Vec::new(), reversed: false, count: 100 }
    }

    fn write_body(&self, out: &mut BytesMut) {
        write_blob(out, &self.start);
        write_blob(out, &self.finish);
        write_bool(out, self.reversed);
        write_i32(out, self.count);
    }

    fn read_body(input: &mut &[u8]) -> Result<SlicePredicate, WireError> {
        let start = read_blob(input)?;
        let finish = read_blob(input)?;
        let reversed = read_bool(input)?;
        let count = read_i32(input)?;
        Ok(SlicePredicate { start, finish, reversed, count })
    }

    fn body_size(&self) -> usize {
        blob_size(&self.start) + blob_size(&self.finish) + 1 + 4
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum IndexOperator {
    Eq = 0,
    Gte = 1,
    Gt = 2,
    Lte = 3,
    Lt = 4,
}

impl IndexOperator {
    fn from_u8(v: u8) -> Result<IndexOperator, WireError> {
        match v {
            0 => Ok(IndexOperator::Eq),
            1 => Ok(IndexOperator::Gte),
            2 => Ok(IndexOperator::Gt),
            3 => Ok(IndexOperator::Lte),
            4 => Ok(IndexOperator::Lt),
            other => Err(WireError::BadField {
                field: "index_operator",
                detail: format!("unknown ordinal {}", other),
            }),
        }
    }
}

/// One secondary-index restriction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexExpression {
    pub column: Vec<u8>,
    pub op: IndexOperator,
    pub value: Vec<u8>,
}

impl IndexExpression {
    fn write_body(&self, out: &mut BytesMut) {
        write_blob(out, &self.column);
        write_u8(out, self.op as u8);
        write_blob(out, &self.value);
    }

    fn read_body(input: &mut &[u8]) -> Result<IndexExpression, WireError> {
        let column = read_blob(input)?;
        let op = IndexOperator::from_u8(read_u8(input)?)?;
        let value = read_blob(input)?;
        Ok(IndexExpression { column, op, value })
    }

    fn body_size(&self) -> usize {
        blob_size(&self.column) + 1 + blob_size(&self.value)
    }
}

/// Legacy sub-object framing: i32 length prefix, body must fill it exactly.
fn write_framed(out: &mut BytesMut, body_size: usize, write_body: impl FnOnce(&mut BytesMut)) {
    write_i32(out, body_size as i32);
    write_body(out);
}

fn read_framed<T>(
    input: &mut &[u8],
    read_body: impl FnOnce(&mut &[u8]) -> Result<T, WireError>,
) -> Result<T, WireError> {
    let len = read_i32(input)?;
    if len < 0 {
        return Err(WireError::BadField {
            field: "frame_length",
            detail: format!("negative length {}", len),
        });
    }
    let framed = read_bytes(input, len as usize)?;
    let mut body: &[u8] = &framed;
    let value = read_body(&mut body)?;
    if !body.is_empty() {
        return Err(WireError::TrailingBytes { remaining: body.len() });
    }
    Ok(value)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeSliceCommand {
    pub keyspace: String,
    pub column_family: String,
    pub super_column: Option<Vec<u8>>,
    pub predicate: SlicePredicate,
    pub row_filter: Vec<IndexExpression>,
    pub bounds: AbstractBounds,
    pub max_results: i32,
    pub max_is_columns: bool,
    pub is_paging: bool,
}

pub struct RangeSliceCommandSerializer;

impl VersionedSerializer<RangeSliceCommand> for RangeSliceCommandSerializer {
    fn serialize(
        &self,
        value: &RangeSliceCommand,
        out: &mut BytesMut,
        version: u32,
    ) -> Result<(), WireError> {
        write_utf(out, &value.keyspace);
        write_utf(out, &value.column_family);
        match &value.super_column {
            None => write_i32(out, 0),
            Some(bytes) => {
                write_i32(out, bytes.len() as i32);
                out.extend_from_slice(bytes);
            }
        }

        if version < VERSION_12 {
            write_framed(out, value.predicate.body_size(), |out| value.predicate.write_body(out));
        } else {
            value.predicate.write_body(out);
        }

        if version >= VERSION_11 {
            write_i32(out, value.row_filter.len() as i32);
            for expression in &value.row_filter {
                if version < VERSION_12 {
                    write_framed(out, expression.body_size(), |out| expression.write_body(out));
                } else {
                    expression.write_body(out);
                }
            }
        }

        AbstractBoundsSerializer.serialize(&value.bounds, out, version)?;
        write_i32(out, value.max_results);
        if version >= VERSION_11 {
            write_bool(out, value.max_is_columns);
            write_bool(out, value.is_paging);
        }
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8], version: u32) -> Result<RangeSliceCommand, WireError> {
        let keyspace = read_utf(input, "keyspace")?;
        let column_family = read_utf(input, "column_family")?;
        let super_column_len = read_i32(input)?;
        let super_column = if super_column_len > 0 {
            Some(read_bytes(input, super_column_len as usize)?)
        } else {
            None
        };

        let predicate = if version < VERSION_12 {
            read_framed(input, SlicePredicate::read_body)?
        } else {
            SlicePredicate::read_body(input)?
        };

        let mut row_filter = Vec::new();
        if version >= VERSION_11 {
            let count = read_i32(input)?;
            if count < 0 {
                return Err(WireError::BadField {
                    field: "row_filter",
                    detail: format!("negative count {}", count),
                });
            }
            for _ in 0..count {
                let expression = if version < VERSION_12 {
                    read_framed(input, IndexExpression::read_body)?
                } else {
                    IndexExpression::read_body(input)?
                };
                row_filter.push(expression);
            }
        }

        let bounds = AbstractBoundsSerializer.deserialize(input, version)?;
        let max_results = read_i32(input)?;
        let (max_is_columns, is_paging) = if version >= VERSION_11 {
            (read_bool(input)?, read_bool(input)?)
        } else {
            (false, false)
        };

        Ok(RangeSliceCommand {
            keyspace,
            column_family,
            super_column,
            predicate,
            row_filter,
            bounds,
            max_results,
            max_is_columns,
            is_paging,
        })
    }

    fn serialized_size(&self, value: &RangeSliceCommand, version: u32) -> usize {
        let mut size = utf_size(&value.keyspace) + utf_size(&value.column_family);
        size += 4 + value.super_column.as_ref().map_or(0, |b| b.len());

        size += value.predicate.body_size();
        if version < VERSION_12 {
            size += 4;
        }

        if version >= VERSION_11 {
            size += 4;
            for expression in &value.row_filter {
                size += expression.body_size();
                if version < VERSION_12 {
                    size += 4;
                }
            }
        }

        size += AbstractBoundsSerializer.serialized_size(&value.bounds, version);
        size += 4;
        if version >= VERSION_11 {
            size += 2;
        }
        size
    }
}
