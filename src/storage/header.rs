//! Store header occupying page 0.
//!
//! Fixed-offset little-endian fields. A zero in a page-pointer field means
//! nil. The header is kept in memory by the kernel and written back on
//! sync, close, and transaction boundaries.

use std::convert::TryInto;

use crate::error::{Result, TansuError};
use crate::pager::PageId;

const MAGIC: &[u8; 8] = b"TANSU1\0\0";
const VERSION: u16 = 1;
pub const HEADER_REGION_SIZE: usize = 64;

/// Which store flavour owns the file.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum StoreKind {
    /// Unordered key-value store.
    Hash = 1,
    /// Ordered key-value store (also backs tables and their indexes).
    Btree = 2,
}

impl StoreKind {
    fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            1 => Ok(Self::Hash),
            2 => Ok(Self::Btree),
            other => Err(TansuError::Corruption(format!(
                "unknown store kind: 0x{other:02X}"
            ))),
        }
    }

    /// Short text tag used in diagnostics.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hash => "hash",
            Self::Btree => "btree",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Header {
    pub kind: StoreKind,
    pub comparator_tag: u8,
    pub page_size: u32,
    /// Live record count (duplicates included for btrees).
    pub rnum: u64,
    /// Head of the free-page list (0 = empty).
    pub free_head: PageId,
    /// Hash stores: number of buckets and directory pages.
    pub bucket_count: u32,
    pub dir_pages: u32,
    /// Btree stores: root node and the leaf chain endpoints.
    pub root: PageId,
    pub first_leaf: PageId,
    pub last_leaf: PageId,
    /// Next unique id handed out by `gen_uid`.
    pub next_uid: u64,
}

impl Header {
    pub fn new(kind: StoreKind, comparator_tag: u8, page_size: u32) -> Self {
        Self {
            kind,
            comparator_tag,
            page_size,
            rnum: 0,
            free_head: 0,
            bucket_count: 0,
            dir_pages: 0,
            root: 0,
            first_leaf: 0,
            last_leaf: 0,
            next_uid: 1,
        }
    }

    /// Parses a header region. `Ok(None)` means the page is still blank
    /// (fresh file).
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(TansuError::Corruption(
                "header page shorter than expected".into(),
            ));
        }
        if data[..MAGIC.len()].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &data[..MAGIC.len()] != MAGIC {
            return Err(TansuError::Corruption("invalid tansu header magic".into()));
        }
        let version = u16::from_le_bytes([data[8], data[9]]);
        if version != VERSION {
            return Err(TansuError::Corruption(format!(
                "unsupported format version {version}"
            )));
        }
        let kind = StoreKind::from_byte(data[10])?;
        let comparator_tag = data[11];
        let page_size = u32::from_le_bytes(data[12..16].try_into().map_err(|_| {
            TansuError::Corruption("header page size field truncated".into())
        })?);
        let rnum = read_u64(data, 16)?;
        let free_head = read_u32(data, 24)?;
        let bucket_count = read_u32(data, 28)?;
        let dir_pages = read_u32(data, 32)?;
        let root = read_u32(data, 36)?;
        let first_leaf = read_u32(data, 40)?;
        let last_leaf = read_u32(data, 44)?;
        let next_uid = read_u64(data, 48)?;
        Ok(Some(Self {
            kind,
            comparator_tag,
            page_size,
            rnum,
            free_head,
            bucket_count,
            dir_pages,
            root,
            first_leaf,
            last_leaf,
            next_uid,
        }))
    }

    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_REGION_SIZE {
            return Err(TansuError::Corruption(
                "header page shorter than expected".into(),
            ));
        }
        data[..HEADER_REGION_SIZE].fill(0);
        data[..MAGIC.len()].copy_from_slice(MAGIC);
        data[8..10].copy_from_slice(&VERSION.to_le_bytes());
        data[10] = self.kind as u8;
        data[11] = self.comparator_tag;
        data[12..16].copy_from_slice(&self.page_size.to_le_bytes());
        data[16..24].copy_from_slice(&self.rnum.to_le_bytes());
        data[24..28].copy_from_slice(&self.free_head.to_le_bytes());
        data[28..32].copy_from_slice(&self.bucket_count.to_le_bytes());
        data[32..36].copy_from_slice(&self.dir_pages.to_le_bytes());
        data[36..40].copy_from_slice(&self.root.to_le_bytes());
        data[40..44].copy_from_slice(&self.first_leaf.to_le_bytes());
        data[44..48].copy_from_slice(&self.last_leaf.to_le_bytes());
        data[48..56].copy_from_slice(&self.next_uid.to_le_bytes());
        Ok(())
    }
}

fn read_u32(data: &[u8], offset: usize) -> Result<u32> {
    Ok(u32::from_le_bytes(
        data[offset..offset + 4]
            .try_into()
            .map_err(|_| TansuError::Corruption("header field truncated".into()))?,
    ))
}

fn read_u64(data: &[u8], offset: usize) -> Result<u64> {
    Ok(u64::from_le_bytes(
        data[offset..offset + 8]
            .try_into()
            .map_err(|_| TansuError::Corruption("header field truncated".into()))?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip() {
        let mut header = Header::new(StoreKind::Btree, 1, 4096);
        header.rnum = 42;
        header.root = 7;
        header.first_leaf = 3;
        header.last_leaf = 9;
        header.next_uid = 100;
        let mut buf = vec![0u8; 128];
        header.write(&mut buf).expect("write");
        let back = Header::read(&buf).expect("read").expect("present");
        assert_eq!(back.kind, StoreKind::Btree);
        assert_eq!(back.rnum, 42);
        assert_eq!(back.root, 7);
        assert_eq!(back.next_uid, 100);
    }

    #[test]
    fn blank_region_reads_as_none() {
        let buf = vec![0u8; 128];
        assert!(Header::read(&buf).expect("read").is_none());
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut buf = vec![0u8; 128];
        buf[0] = b'X';
        assert!(matches!(
            Header::read(&buf),
            Err(TansuError::Corruption(_))
        ));
    }
}
