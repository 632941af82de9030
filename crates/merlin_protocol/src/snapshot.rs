//! Snapshot command encoding: `utf8 keyspace | utf8 table | utf8 session
//! | bool ephemeral`.

use bytes::BytesMut;
use uuid::Uuid;

use merlin_repair::SnapshotCommand;

use crate::codec::{read_bool, read_utf, utf_size, write_bool, write_utf};
use crate::error::WireError;
use crate::VersionedSerializer;

pub struct SnapshotCommandSerializer;

impl VersionedSerializer<SnapshotCommand> for SnapshotCommandSerializer {
    fn serialize(
        &self,
        value: &SnapshotCommand,
        out: &mut BytesMut,
        _version: u32,
    ) -> Result<(), WireError> {
        write_utf(out, &value.keyspace);
        write_utf(out, &value.table);
        write_utf(out, &value.session_id.to_string());
        write_bool(out, value.ephemeral);
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8], _version: u32) -> Result<SnapshotCommand, WireError> {
        let keyspace = read_utf(input, "keyspace")?;
        let table = read_utf(input, "table")?;
        let session_text = read_utf(input, "session_id")?;
        let session_id = Uuid::parse_str(&session_text).map_err(|e| WireError::BadField {
            field: "session_id",
            detail: e.to_string(),
        })?;
        let ephemeral = read_bool(input)?;
        Ok(SnapshotCommand { keyspace, table, session_id, ephemeral })
    }

    fn serialized_size(&self, value: &SnapshotCommand, _version: u32) -> usize {
        utf_size(&value.keyspace)
            + utf_size(&value.table)
            + utf_size(&value.session_id.to_string())
            + 1
    }
}
