//! B+tree node encoding.
//!
//! Nodes are decoded into owned structs, mutated, and re-encoded onto their
//! page. Leaves hold the records and form a doubly linked chain; internal
//! nodes hold separator keys and child pointers. A separator is the
//! smallest key of the subtree to its right.
//!
//! ```text
//! common:   kind u8 | is_leaf u8 | count u16 | reserved u32
//! leaf:     prev u32 | next u32
//!           entry: klen u16 | flags u8 | pad u8 | plen u32 | key | payload
//! internal: child[0] u32
//!           entry: klen u16 | pad u16 | child u32 | key
//! ```
//!
//! A leaf payload is either the inline value or, when the spilled flag is
//! set, a 12-byte overflow pointer (first page u32, total length u64).

use std::convert::TryInto;

use crate::error::{Result, TansuError};
use crate::pager::{PageId, PAGE_CHECKSUM_SIZE};
use crate::storage::record::RecordValue;
use crate::storage::PageKind;

const NODE_HEADER_SIZE: usize = 8;
const LEAF_LINKS_SIZE: usize = 8;
const LEAF_ENTRY_OVERHEAD: usize = 8;
const INTERNAL_ENTRY_OVERHEAD: usize = 8;
const FLAG_SPILLED: u8 = 0x01;
const SPILL_POINTER_SIZE: usize = 12;

#[derive(Debug, Clone)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: RecordValue,
}

impl LeafEntry {
    pub fn encoded_len(&self) -> usize {
        let payload = match &self.value {
            RecordValue::Inline(value) => value.len(),
            RecordValue::Spilled { .. } => SPILL_POINTER_SIZE,
        };
        LEAF_ENTRY_OVERHEAD + self.key.len() + payload
    }
}

#[derive(Debug, Clone, Default)]
pub struct LeafNode {
    pub prev: PageId,
    pub next: PageId,
    pub entries: Vec<LeafEntry>,
}

#[derive(Debug, Clone, Default)]
pub struct InternalNode {
    /// `children.len() == separators.len() + 1`; `separators[i]` is the
    /// smallest key under `children[i + 1]`.
    pub separators: Vec<Vec<u8>>,
    pub children: Vec<PageId>,
}

#[derive(Debug, Clone)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub fn is_leaf(&self) -> bool {
        matches!(self, Node::Leaf(_))
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Node::Leaf(leaf) => {
                NODE_HEADER_SIZE
                    + LEAF_LINKS_SIZE
                    + leaf.entries.iter().map(LeafEntry::encoded_len).sum::<usize>()
            }
            Node::Internal(node) => {
                NODE_HEADER_SIZE
                    + 4
                    + node
                        .separators
                        .iter()
                        .map(|sep| INTERNAL_ENTRY_OVERHEAD + sep.len())
                        .sum::<usize>()
            }
        }
    }

    /// Whether the node fits a page of `page_size` bytes.
    pub fn fits(&self, page_size: usize) -> bool {
        self.encoded_len() <= page_size - PAGE_CHECKSUM_SIZE
    }

    /// Encodes the node onto a page buffer.
    pub fn encode(&self, data: &mut [u8]) -> Result<()> {
        if !self.fits(data.len()) {
            return Err(TansuError::InvalidArgument(
                "node does not fit its page".into(),
            ));
        }
        data.fill(0);
        data[0] = PageKind::Node as u8;
        match self {
            Node::Leaf(leaf) => {
                data[1] = 1;
                if leaf.entries.len() > u16::MAX as usize {
                    return Err(TansuError::InvalidArgument(
                        "leaf entry count overflows u16".into(),
                    ));
                }
                data[2..4].copy_from_slice(&(leaf.entries.len() as u16).to_le_bytes());
                data[8..12].copy_from_slice(&leaf.prev.to_le_bytes());
                data[12..16].copy_from_slice(&leaf.next.to_le_bytes());
                let mut at = NODE_HEADER_SIZE + LEAF_LINKS_SIZE;
                for entry in &leaf.entries {
                    if entry.key.len() > u16::MAX as usize {
                        return Err(TansuError::InvalidArgument("key too large".into()));
                    }
                    data[at..at + 2].copy_from_slice(&(entry.key.len() as u16).to_le_bytes());
                    match &entry.value {
                        RecordValue::Inline(value) => {
                            data[at + 2] = 0;
                            data[at + 4..at + 8]
                                .copy_from_slice(&(value.len() as u32).to_le_bytes());
                            let key_at = at + LEAF_ENTRY_OVERHEAD;
                            data[key_at..key_at + entry.key.len()].copy_from_slice(&entry.key);
                            let val_at = key_at + entry.key.len();
                            data[val_at..val_at + value.len()].copy_from_slice(value);
                        }
                        RecordValue::Spilled { first, total_len } => {
                            data[at + 2] = FLAG_SPILLED;
                            data[at + 4..at + 8]
                                .copy_from_slice(&(SPILL_POINTER_SIZE as u32).to_le_bytes());
                            let key_at = at + LEAF_ENTRY_OVERHEAD;
                            data[key_at..key_at + entry.key.len()].copy_from_slice(&entry.key);
                            let val_at = key_at + entry.key.len();
                            data[val_at..val_at + 4].copy_from_slice(&first.to_le_bytes());
                            data[val_at + 4..val_at + 12]
                                .copy_from_slice(&total_len.to_le_bytes());
                        }
                    }
                    at += entry.encoded_len();
                }
            }
            Node::Internal(node) => {
                data[1] = 0;
                if node.children.len() != node.separators.len() + 1 {
                    return Err(TansuError::Corruption(
                        "internal node child count mismatch".into(),
                    ));
                }
                data[2..4].copy_from_slice(&(node.separators.len() as u16).to_le_bytes());
                data[8..12].copy_from_slice(&node.children[0].to_le_bytes());
                let mut at = NODE_HEADER_SIZE + 4;
                for (index, sep) in node.separators.iter().enumerate() {
                    if sep.len() > u16::MAX as usize {
                        return Err(TansuError::InvalidArgument("key too large".into()));
                    }
                    data[at..at + 2].copy_from_slice(&(sep.len() as u16).to_le_bytes());
                    data[at + 4..at + 8]
                        .copy_from_slice(&node.children[index + 1].to_le_bytes());
                    let key_at = at + INTERNAL_ENTRY_OVERHEAD;
                    data[key_at..key_at + sep.len()].copy_from_slice(sep);
                    at += INTERNAL_ENTRY_OVERHEAD + sep.len();
                }
            }
        }
        Ok(())
    }

    /// Decodes a node page.
    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < NODE_HEADER_SIZE + LEAF_LINKS_SIZE {
            return Err(TansuError::Corruption("node page too short".into()));
        }
        if data[0] != PageKind::Node as u8 {
            return Err(TansuError::Corruption(format!(
                "expected node page, found kind 0x{:02X}",
                data[0]
            )));
        }
        let count = u16::from_le_bytes([data[2], data[3]]) as usize;
        let limit = data.len() - PAGE_CHECKSUM_SIZE;
        if data[1] == 1 {
            let prev = read_u32(data, 8)?;
            let next = read_u32(data, 12)?;
            let mut entries = Vec::with_capacity(count);
            let mut at = NODE_HEADER_SIZE + LEAF_LINKS_SIZE;
            for _ in 0..count {
                if at + LEAF_ENTRY_OVERHEAD > limit {
                    return Err(TansuError::Corruption("leaf entry truncated".into()));
                }
                let klen = u16::from_le_bytes([data[at], data[at + 1]]) as usize;
                let flags = data[at + 2];
                let plen = read_u32(data, at + 4)? as usize;
                let key_at = at + LEAF_ENTRY_OVERHEAD;
                if key_at + klen + plen > limit {
                    return Err(TansuError::Corruption("leaf entry truncated".into()));
                }
                let key = data[key_at..key_at + klen].to_vec();
                let val_at = key_at + klen;
                let value = if flags & FLAG_SPILLED != 0 {
                    if plen != SPILL_POINTER_SIZE {
                        return Err(TansuError::Corruption(
                            "spilled leaf entry has a malformed pointer".into(),
                        ));
                    }
                    RecordValue::Spilled {
                        first: read_u32(data, val_at)?,
                        total_len: read_u64(data, val_at + 4)?,
                    }
                } else {
                    RecordValue::Inline(data[val_at..val_at + plen].to_vec())
                };
                entries.push(LeafEntry { key, value });
                at = key_at + klen + plen;
            }
            Ok(Node::Leaf(LeafNode {
                prev,
                next,
                entries,
            }))
        } else {
            let mut children = Vec::with_capacity(count + 1);
            children.push(read_u32(data, 8)?);
            let mut separators = Vec::with_capacity(count);
            let mut at = NODE_HEADER_SIZE + 4;
            for _ in 0..count {
                if at + INTERNAL_ENTRY_OVERHEAD > limit {
                    return Err(TansuError::Corruption("internal entry truncated".into()));
                }
                let klen = u16::from_le_bytes([data[at], data[at + 1]]) as usize;
                let child = read_u32(data, at + 4)?;
                let key_at = at + INTERNAL_ENTRY_OVERHEAD;
                if key_at + klen > limit {
                    return Err(TansuError::Corruption("internal entry truncated".into()));
                }
                separators.push(data[key_at..key_at + klen].to_vec());
                children.push(child);
                at = key_at + klen;
            }
            Ok(Node::Internal(InternalNode {
                separators,
                children,
            }))
        }
    }
}

fn read_u32(data: &[u8], at: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(
        data[at..at + 4]
            .try_into()
            .map_err(|_| TansuError::Corruption("node field truncated".into()))?,
    ))
}

fn read_u64(data: &[u8], at: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(
        data[at..at + 8]
            .try_into()
            .map_err(|_| TansuError::Corruption("node field truncated".into()))?,
    ))
}
