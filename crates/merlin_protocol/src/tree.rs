//! Tree request/response encodings.
//!
//! TreeRequest wire layout:
//! ```text
//! utf8 session_id | compact_addr endpoint | [i32 gc_before]_{v≥V20}
//!   | utf8 keyspace | utf8 table | bounds range
//! ```
//! A TreeResponse is the request followed by the Merkle tree.

use bytes::BytesMut;
use uuid::Uuid;

use merlin_common::AbstractBounds;
use merlin_repair::merkle::{Digest, MerkleNode, MerkleTree};
use merlin_repair::TreeRequest;

use crate::bounds::{expect_range, AbstractBoundsSerializer};
use crate::codec::{
    endpoint_size, read_endpoint, read_fixed, read_i32, read_token, read_u8, read_utf, utf_size,
    write_endpoint, write_i32, write_token, write_u8, write_utf, TOKEN_SIZE,
};
use crate::error::WireError;
use crate::version::VERSION_20;
use crate::VersionedSerializer;

pub struct TreeRequestSerializer;

impl VersionedSerializer<TreeRequest> for TreeRequestSerializer {
    fn serialize(
        &self,
        value: &TreeRequest,
        out: &mut BytesMut,
        version: u32,
    ) -> Result<(), WireError> {
        write_utf(out, &value.session_id.to_string());
        write_endpoint(out, value.endpoint);
        if version >= VERSION_20 {
            write_i32(out, value.gc_before);
        }
        write_utf(out, &value.keyspace);
        write_utf(out, &value.table);
        AbstractBoundsSerializer.serialize(&AbstractBounds::Range(value.range), out, version)
    }

    fn deserialize(&self, input: &mut &[u8], version: u32) -> Result<TreeRequest, WireError> {
        let session_text = read_utf(input, "session_id")?;
        let session_id = Uuid::parse_str(&session_text).map_err(|e| WireError::BadField {
            field: "session_id",
            detail: e.to_string(),
        })?;
        let endpoint = read_endpoint(input)?;
        let gc_before = if version >= VERSION_20 { read_i32(input)? } else { -1 };
        let keyspace = read_utf(input, "keyspace")?;
        let table = read_utf(input, "table")?;
        let range = expect_range(input, version)?;
        Ok(TreeRequest { session_id, endpoint, gc_before, keyspace, table, range })
    }

    fn serialized_size(&self, value: &TreeRequest, version: u32) -> usize {
        let mut size = utf_size(&value.session_id.to_string())
            + endpoint_size(value.endpoint)
            + utf_size(&value.keyspace)
            + utf_size(&value.table)
            + AbstractBoundsSerializer
                .serialized_size(&AbstractBounds::Range(value.range), version);
        if version >= VERSION_20 {
            size += 4;
        }
        size
    }
}

// ── Merkle tree ─────────────────────────────────────────────────────────────

const TAG_LEAF_INVALID: u8 = 0;
const TAG_LEAF: u8 = 1;
const TAG_INNER: u8 = 2;

/// `u8 max_depth | i32 max_size | bounds range | node*`, nodes pre-order:
/// inner nodes carry their midpoint, leaves their digest (or an
/// invalid-leaf tag).
pub struct MerkleTreeSerializer;

impl MerkleTreeSerializer {
    fn write_node(out: &mut BytesMut, node: &MerkleNode) {
        match node {
            MerkleNode::Leaf { digest: None } => write_u8(out, TAG_LEAF_INVALID),
            MerkleNode::Leaf { digest: Some(digest) } => {
                write_u8(out, TAG_LEAF);
                out.extend_from_slice(&digest.0);
            }
            MerkleNode::Inner { midpoint, left, right } => {
                write_u8(out, TAG_INNER);
                write_token(out, *midpoint);
                Self::write_node(out, left);
                Self::write_node(out, right);
            }
        }
    }

    fn read_node(input: &mut &[u8]) -> Result<MerkleNode, WireError> {
        match read_u8(input)? {
            TAG_LEAF_INVALID => Ok(MerkleNode::Leaf { digest: None }),
            TAG_LEAF => Ok(MerkleNode::Leaf { digest: Some(Digest(read_fixed::<32>(input)?)) }),
            TAG_INNER => {
                let midpoint = read_token(input)?;
                let left = Box::new(Self::read_node(input)?);
                let right = Box::new(Self::read_node(input)?);
                Ok(MerkleNode::Inner { midpoint, left, right })
            }
            other => Err(WireError::UnknownNodeTag(other)),
        }
    }

    fn node_size(node: &MerkleNode) -> usize {
        match node {
            MerkleNode::Leaf { digest: None } => 1,
            MerkleNode::Leaf { digest: Some(_) } => 1 + 32,
            MerkleNode::Inner { left, right, .. } => {
                1 + TOKEN_SIZE + Self::node_size(left) + Self::node_size(right)
            }
        }
    }
}

impl VersionedSerializer<MerkleTree> for MerkleTreeSerializer {
    fn serialize(
        &self,
        value: &MerkleTree,
        out: &mut BytesMut,
        version: u32,
    ) -> Result<(), WireError> {
        write_u8(out, value.max_depth());
        write_i32(out, value.max_size() as i32);
        AbstractBoundsSerializer.serialize(&AbstractBounds::Range(value.range()), out, version)?;
        Self::write_node(out, value.root());
        Ok(())
    }

    fn deserialize(&self, input: &mut &[u8], version: u32) -> Result<MerkleTree, WireError> {
        let max_depth = read_u8(input)?;
        let max_size = read_i32(input)?;
        if max_size < 1 {
            return Err(WireError::BadField {
                field: "max_size",
                detail: format!("non-positive leaf budget {}", max_size),
            });
        }
        let range = expect_range(input, version)?;
        let root = Self::read_node(input)?;
        Ok(MerkleTree::from_parts(range, max_depth, max_size as usize, root))
    }

    fn serialized_size(&self, value: &MerkleTree, version: u32) -> usize {
        1 + 4
            + AbstractBoundsSerializer
                .serialized_size(&AbstractBounds::Range(value.range()), version)
            + Self::node_size(value.root())
    }
}

// ── TreeResponse ────────────────────────────────────────────────────────────

/// Validator payload: the originating request plus the finished tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeResponse {
    pub request: TreeRequest,
    pub tree: MerkleTree,
}

pub struct TreeResponseSerializer;

impl VersionedSerializer<TreeResponse> for TreeResponseSerializer {
    fn serialize(
        &self,
        value: &TreeResponse,
        out: &mut BytesMut,
        version: u32,
    ) -> Result<(), WireError> {
        TreeRequestSerializer.serialize(&value.request, out, version)?;
        MerkleTreeSerializer.serialize(&value.tree, out, version)
    }

    fn deserialize(&self, input: &mut &[u8], version: u32) -> Result<TreeResponse, WireError> {
        let request = TreeRequestSerializer.deserialize(input, version)?;
        let tree = MerkleTreeSerializer.deserialize(input, version)?;
        Ok(TreeResponse { request, tree })
    }

    fn serialized_size(&self, value: &TreeResponse, version: u32) -> usize {
        TreeRequestSerializer.serialized_size(&value.request, version)
            + MerkleTreeSerializer.serialized_size(&value.tree, version)
    }
}
