//! On-disk node shapes and their framing.
//!
//! Every node is written exactly once, at the offset `Store::append` hands
//! back. A node never changes after that: mutations produce new nodes and
//! leave old ones in place until a file they live in is no longer
//! referenced by anything live (see `cleanup`).

use std::convert::TryInto;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ErrorCode, Result};
use crate::store::Store;

const TAG_VALUE: u8 = 1;
const TAG_LEAF: u8 = 2;
const TAG_BRANCH: u8 = 3;

/// One entry at a leaf position: either a live key pointing at a `Value`
/// node, or a tombstone left behind so an in-flight compaction's snapshot
/// still observes the deletion (see `Btree::mark_deleted`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LeafEntry<K> {
    Present { key: K, value_offset: u64 },
    Tombstone { key: K },
}

impl<K> LeafEntry<K> {
    pub fn key(&self) -> &K {
        match self {
            LeafEntry::Present { key, .. } => key,
            LeafEntry::Tombstone { key } => key,
        }
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, LeafEntry::Tombstone { .. })
    }
}

/// A leaf's entries, ordered by key.
pub type Leaf<K> = Vec<LeafEntry<K>>;

/// A branch's children, ordered by `min_key`. `min_key` is a lower bound on
/// every key reachable through `child_offset`; it is refined downward as
/// smaller keys are inserted but never required to be exact after a
/// deletion (see `Btree::delete`).
pub type Branch<K> = Vec<(K, u64)>;

fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + 4 + payload.len() + 4);
    out.push(tag);
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(payload);
    out.extend_from_slice(&crc.to_be_bytes());
    out
}

fn read_frame(store: &dyn Store, offset: u64, expect_tag: u8) -> Result<Vec<u8>> {
    let head = store.read_at(offset, 5)?;
    let tag = head[0];
    if tag != expect_tag {
        return Err(ErrorCode::Corrupt {
            offset,
            reason: format!("expected tag {}, found {}", expect_tag, tag),
        });
    }
    let len = u32::from_be_bytes([head[1], head[2], head[3], head[4]]) as usize;
    let rest = store.read_at(offset + 5, (len + 4) as u32)?;
    let (payload, crc_bytes) = rest.split_at(len);
    let want = u32::from_be_bytes([crc_bytes[0], crc_bytes[1], crc_bytes[2], crc_bytes[3]]);
    let got = crc32fast::hash(payload);
    if want != got {
        return Err(ErrorCode::Corrupt { offset, reason: "checksum mismatch".into() });
    }
    Ok(payload.to_vec())
}

pub fn write_value<V: Serialize>(store: &dyn Store, value: &V) -> Result<u64> {
    let payload = bincode::serialize(value)?;
    store.append(&frame(TAG_VALUE, &payload))
}

pub fn read_value<V: DeserializeOwned>(store: &dyn Store, offset: u64) -> Result<V> {
    let payload = read_frame(store, offset, TAG_VALUE)?;
    Ok(bincode::deserialize(&payload)?)
}

pub fn write_leaf<K: Serialize>(store: &dyn Store, entries: &Leaf<K>) -> Result<u64> {
    let payload = bincode::serialize(entries)?;
    store.append(&frame(TAG_LEAF, &payload))
}

pub fn read_leaf<K: DeserializeOwned>(store: &dyn Store, offset: u64) -> Result<Leaf<K>> {
    let payload = read_frame(store, offset, TAG_LEAF)?;
    Ok(bincode::deserialize(&payload)?)
}

pub fn write_branch<K: Serialize>(store: &dyn Store, entries: &Branch<K>) -> Result<u64> {
    let payload = bincode::serialize(entries)?;
    store.append(&frame(TAG_BRANCH, &payload))
}

pub fn read_branch<K: DeserializeOwned>(store: &dyn Store, offset: u64) -> Result<Branch<K>> {
    let payload = read_frame(store, offset, TAG_BRANCH)?;
    Ok(bincode::deserialize(&payload)?)
}

/// Distinguishes a branch node from a leaf node without knowing which one
/// to expect ahead of time, used when walking down from the root (the root
/// is a leaf until it first outgrows a single node).
pub enum AnyNode<K> {
    Leaf(Leaf<K>),
    Branch(Branch<K>),
}

pub fn read_any<K: DeserializeOwned>(store: &dyn Store, offset: u64) -> Result<AnyNode<K>> {
    let head = store.read_at(offset, 1)?;
    match head[0] {
        TAG_LEAF => Ok(AnyNode::Leaf(read_leaf(store, offset)?)),
        TAG_BRANCH => Ok(AnyNode::Branch(read_branch(store, offset)?)),
        other => Err(ErrorCode::Corrupt { offset, reason: format!("unexpected tag {}", other) }),
    }
}

pub const HEADER_TAG: u8 = 0xFE;
const HEADER_MAGIC: u32 = 0x4355_4231; // "CUB1"
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 1 + 4 + 2 + 8 + 8 + 8 + 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeaderRecord {
    pub root_offset: u64,
    pub size: u64,
    pub dirt: u64,
}

pub fn encode_header(h: &HeaderRecord) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    let mut body = Vec::with_capacity(HEADER_LEN - 4);
    body.push(HEADER_TAG);
    body.extend_from_slice(&HEADER_MAGIC.to_be_bytes());
    body.extend_from_slice(&FORMAT_VERSION.to_be_bytes());
    body.extend_from_slice(&h.root_offset.to_be_bytes());
    body.extend_from_slice(&h.size.to_be_bytes());
    body.extend_from_slice(&h.dirt.to_be_bytes());
    let crc = crc32fast::hash(&body);
    buf[..body.len()].copy_from_slice(&body);
    buf[body.len()..].copy_from_slice(&crc.to_be_bytes());
    buf
}

/// Attempts to parse `bytes` (exactly `HEADER_LEN` long) as a header record
/// living at `offset`. `Ok(None)` means this offset isn't a header at all
/// (wrong tag, magic, or checksum) and the caller should keep scanning
/// backward; a structurally valid header whose `format_version` this build
/// doesn't understand is not the same thing — that's a real `Corrupt` error,
/// not an invitation to keep probing and eventually decide the store is
/// empty.
pub fn decode_header(bytes: &[u8], offset: u64) -> Result<Option<HeaderRecord>> {
    if bytes.len() != HEADER_LEN || bytes[0] != HEADER_TAG {
        return Ok(None);
    }
    let body = &bytes[..HEADER_LEN - 4];
    let crc_bytes = &bytes[HEADER_LEN - 4..];
    let Ok(want_bytes) = crc_bytes.try_into() else { return Ok(None) };
    let want = u32::from_be_bytes(want_bytes);
    if crc32fast::hash(body) != want {
        return Ok(None);
    }
    let Ok(magic_bytes) = body[1..5].try_into() else { return Ok(None) };
    let magic = u32::from_be_bytes(magic_bytes);
    if magic != HEADER_MAGIC {
        return Ok(None);
    }
    let format_version = u16::from_be_bytes(body[5..7].try_into().unwrap());
    if format_version != FORMAT_VERSION {
        return Err(ErrorCode::Corrupt {
            offset,
            reason: format!("unsupported header format_version {}, expected {}", format_version, FORMAT_VERSION),
        });
    }
    let root_offset = u64::from_be_bytes(body[7..15].try_into().unwrap());
    let size = u64::from_be_bytes(body[15..23].try_into().unwrap());
    let dirt = u64::from_be_bytes(body[23..31].try_into().unwrap());
    Ok(Some(HeaderRecord { root_offset, size, dirt }))
}
