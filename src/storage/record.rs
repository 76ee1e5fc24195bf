//! On-disk encoding of hash store records.
//!
//! A record lives in one slot of a slotted page and embeds the chain link
//! to the next record in its bucket:
//!
//! ```text
//! next_page u32 | next_slot u16 | flags u8 | reserved u8
//! klen u32 | vlen u32 | key bytes | value bytes
//! ```
//!
//! Values larger than the spill threshold are moved to an overflow chain;
//! the record then carries a 12-byte pointer (first overflow page u32,
//! total length u64) instead of the value bytes and sets the spilled flag.
//! `vlen` always holds the logical value length.

use std::convert::TryInto;

use crate::error::{Result, TansuError};
use crate::pager::PageId;

const FLAG_SPILLED: u8 = 0x01;
pub const RECORD_HEADER_SIZE: usize = 16;
const SPILL_POINTER_SIZE: usize = 12;

/// Location of a record: page id plus slot index.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RecordPtr {
    pub page: PageId,
    pub slot: u16,
}

impl RecordPtr {
    pub const NIL: RecordPtr = RecordPtr { page: 0, slot: 0 };

    pub fn is_nil(&self) -> bool {
        self.page == 0
    }
}

/// Value payload of a decoded record.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum RecordValue {
    Inline(Vec<u8>),
    /// Value spilled to an overflow chain starting at `first`.
    Spilled { first: PageId, total_len: u64 },
}

/// A decoded hash store record.
#[derive(Debug, Clone)]
pub struct HashRecord {
    pub next: RecordPtr,
    pub key: Vec<u8>,
    pub value: RecordValue,
}

impl HashRecord {
    pub fn inline(next: RecordPtr, key: Vec<u8>, value: Vec<u8>) -> Self {
        Self {
            next,
            key,
            value: RecordValue::Inline(value),
        }
    }

    pub fn spilled(next: RecordPtr, key: Vec<u8>, first: PageId, total_len: u64) -> Self {
        Self {
            next,
            key,
            value: RecordValue::Spilled { first, total_len },
        }
    }

    /// Logical length of the value, spilled or not.
    pub fn value_len(&self) -> u64 {
        match &self.value {
            RecordValue::Inline(value) => value.len() as u64,
            RecordValue::Spilled { total_len, .. } => *total_len,
        }
    }

    /// Size of the encoded record in its slot.
    pub fn encoded_len(&self) -> usize {
        let payload = match &self.value {
            RecordValue::Inline(value) => value.len(),
            RecordValue::Spilled { .. } => SPILL_POINTER_SIZE,
        };
        RECORD_HEADER_SIZE + self.key.len() + payload
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.key.len() > u32::MAX as usize {
            return Err(TansuError::InvalidArgument("key too large".into()));
        }
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.extend_from_slice(&self.next.page.to_le_bytes());
        buf.extend_from_slice(&self.next.slot.to_le_bytes());
        let flags = match &self.value {
            RecordValue::Inline(_) => 0,
            RecordValue::Spilled { .. } => FLAG_SPILLED,
        };
        buf.push(flags);
        buf.push(0);
        buf.extend_from_slice(&(self.key.len() as u32).to_le_bytes());
        match &self.value {
            RecordValue::Inline(value) => {
                if value.len() > u32::MAX as usize {
                    return Err(TansuError::InvalidArgument("value too large".into()));
                }
                buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
                buf.extend_from_slice(&self.key);
                buf.extend_from_slice(value);
            }
            RecordValue::Spilled { first, total_len } => {
                let vlen = u32::try_from(*total_len).map_err(|_| {
                    TansuError::InvalidArgument("value too large".into())
                })?;
                buf.extend_from_slice(&vlen.to_le_bytes());
                buf.extend_from_slice(&self.key);
                buf.extend_from_slice(&first.to_le_bytes());
                buf.extend_from_slice(total_len.to_le_bytes().as_slice());
            }
        }
        Ok(buf)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < RECORD_HEADER_SIZE {
            return Err(TansuError::Corruption("record slot too short".into()));
        }
        let next = RecordPtr {
            page: u32::from_le_bytes(data[0..4].try_into().map_err(corrupt)?),
            slot: u16::from_le_bytes(data[4..6].try_into().map_err(corrupt)?),
        };
        let flags = data[6];
        let klen = u32::from_le_bytes(data[8..12].try_into().map_err(corrupt)?) as usize;
        let vlen = u32::from_le_bytes(data[12..16].try_into().map_err(corrupt)?) as usize;
        let key_end = RECORD_HEADER_SIZE + klen;
        if data.len() < key_end {
            return Err(TansuError::Corruption("record key truncated".into()));
        }
        let key = data[RECORD_HEADER_SIZE..key_end].to_vec();
        if flags & FLAG_SPILLED != 0 {
            if data.len() < key_end + SPILL_POINTER_SIZE {
                return Err(TansuError::Corruption("spill pointer truncated".into()));
            }
            let first =
                u32::from_le_bytes(data[key_end..key_end + 4].try_into().map_err(corrupt)?);
            let total_len = u64::from_le_bytes(
                data[key_end + 4..key_end + 12].try_into().map_err(corrupt)?,
            );
            Ok(Self::spilled(next, key, first, total_len))
        } else {
            if data.len() < key_end + vlen {
                return Err(TansuError::Corruption("record value truncated".into()));
            }
            let value = data[key_end..key_end + vlen].to_vec();
            Ok(Self::inline(next, key, value))
        }
    }
}

fn corrupt<E>(_: E) -> TansuError {
    TansuError::Corruption("record field truncated".into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_round_trip() {
        let rec = HashRecord::inline(
            RecordPtr { page: 9, slot: 3 },
            b"key".to_vec(),
            b"value".to_vec(),
        );
        let bytes = rec.encode().expect("encode");
        assert_eq!(bytes.len(), rec.encoded_len());
        let back = HashRecord::decode(&bytes).expect("decode");
        assert_eq!(back.next, RecordPtr { page: 9, slot: 3 });
        assert_eq!(back.key, b"key");
        assert_eq!(back.value, RecordValue::Inline(b"value".to_vec()));
    }

    #[test]
    fn spilled_round_trip() {
        let rec = HashRecord::spilled(RecordPtr::NIL, b"big".to_vec(), 77, 1_000_000);
        let bytes = rec.encode().expect("encode");
        let back = HashRecord::decode(&bytes).expect("decode");
        assert!(back.next.is_nil());
        assert_eq!(
            back.value,
            RecordValue::Spilled {
                first: 77,
                total_len: 1_000_000
            }
        );
        assert_eq!(back.value_len(), 1_000_000);
    }

    #[test]
    fn truncated_slot_is_corruption() {
        let rec = HashRecord::inline(RecordPtr::NIL, b"k".to_vec(), b"v".to_vec());
        let bytes = rec.encode().expect("encode");
        assert!(matches!(
            HashRecord::decode(&bytes[..bytes.len() - 1]),
            Err(TansuError::Corruption(_))
        ));
    }
}
