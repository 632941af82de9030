//! Legacy streaming-repair task encoding.
//!
//! ```text
//! uuid id | compact_addr initiator | compact_addr src | compact_addr dst
//!   | utf8 keyspace | utf8 cf | i32 ranges_count | ranges…
//! ```

use bytes::BytesMut;

use merlin_common::AbstractBounds;
use merlin_repair::{StreamingRepairTask, SyncRequest};

use crate::bounds::{expect_range, AbstractBoundsSerializer};
use crate::codec::{
    endpoint_size, read_endpoint, read_i32, read_utf, read_uuid, utf_size, write_endpoint,
    write_i32, write_utf, write_uuid, UUID_SIZE,
};
use crate::error::WireError;
use crate::VersionedSerializer;

pub struct StreamingRepairTaskSerializer;

impl VersionedSerializer<StreamingRepairTask> for StreamingRepairTaskSerializer {
    fn serialize(
        &self,
        value: &StreamingRepairTask,
        out: &mut BytesMut,
        version: u32,
    ) -> Result<(), WireError> {
        write_uuid(out, &value.id);
        write_endpoint(out, value.request.initiator);
        write_endpoint(out, value.request.src);
        write_endpoint(out, value.request.dst);
        write_utf(out, &value.keyspace);
        write_utf(out, &value.cfname);
        write_i32(out, value.request.ranges.len() as i32);
        for range in &value.request.ranges {
            AbstractBoundsSerializer.serialize(&AbstractBounds::Range(*range), out, version)?;
        }
        Ok(())
    }

    fn deserialize(
        &self,
        input: &mut &[u8],
        version: u32,
    ) -> Result<StreamingRepairTask, WireError> {
        let id = read_uuid(input)?;
        let initiator = read_endpoint(input)?;
        let src = read_endpoint(input)?;
        let dst = read_endpoint(input)?;
        let keyspace = read_utf(input, "keyspace")?;
        let cfname = read_utf(input, "cfname")?;
        let count = read_i32(input)?;
        if count < 0 {
            return Err(WireError::BadField {
                field: "ranges_count",
                detail: format!("negative count {}", count),
            });
        }
        let mut ranges = Vec::with_capacity(count as usize);
        for _ in 0..count {
            ranges.push(expect_range(input, version)?);
        }
        Ok(StreamingRepairTask {
            id,
            keyspace,
            cfname,
            request: SyncRequest { initiator, src, dst, ranges },
        })
    }

    fn serialized_size(&self, value: &StreamingRepairTask, version: u32) -> usize {
        UUID_SIZE
            + endpoint_size(value.request.initiator)
            + endpoint_size(value.request.src)
            + endpoint_size(value.request.dst)
            + utf_size(&value.keyspace)
            + utf_size(&value.cfname)
            + 4
            + value
                .request
                .ranges
                .iter()
                .map(|r| {
                    AbstractBoundsSerializer.serialized_size(&AbstractBounds::Range(*r), version)
                })
                .sum::<usize>()
    }
}
