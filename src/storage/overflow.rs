//! Overflow page layout for spilled values.
//!
//! ```text
//! kind u8 | reserved u8 | used u16 | next_page u32 | chunk bytes
//! ```
//!
//! Chunks fill each page up to the checksum trailer; `next_page` chains the
//! pages, zero terminating the chain.

use crate::error::{Result, TansuError};
use crate::pager::{PageId, PAGE_CHECKSUM_SIZE};
use crate::storage::PageKind;

pub const OVERFLOW_HEADER_SIZE: usize = 8;

/// Usable chunk bytes per overflow page.
pub fn chunk_capacity(page_size: usize) -> usize {
    page_size - OVERFLOW_HEADER_SIZE - PAGE_CHECKSUM_SIZE
}

/// Writes one chunk of a spilled value into a page buffer.
pub fn write_chunk(data: &mut [u8], chunk: &[u8], next: PageId) -> Result<()> {
    if chunk.len() > chunk_capacity(data.len()) {
        return Err(TansuError::InvalidArgument(
            "overflow chunk exceeds page capacity".into(),
        ));
    }
    data.fill(0);
    data[0] = PageKind::Overflow as u8;
    data[2..4].copy_from_slice(&(chunk.len() as u16).to_le_bytes());
    data[4..8].copy_from_slice(&next.to_le_bytes());
    data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + chunk.len()].copy_from_slice(chunk);
    Ok(())
}

/// Reads one chunk back, returning the chunk bytes and the next page id.
pub fn read_chunk(data: &[u8]) -> Result<(&[u8], PageId)> {
    if data.len() < OVERFLOW_HEADER_SIZE + PAGE_CHECKSUM_SIZE {
        return Err(TansuError::Corruption("overflow page too short".into()));
    }
    if data[0] != PageKind::Overflow as u8 {
        return Err(TansuError::Corruption(format!(
            "expected overflow page, found kind 0x{:02X}",
            data[0]
        )));
    }
    let used = u16::from_le_bytes([data[2], data[3]]) as usize;
    if used > chunk_capacity(data.len()) {
        return Err(TansuError::Corruption(
            "overflow chunk length exceeds page capacity".into(),
        ));
    }
    let next = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    Ok((&data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + used], next))
}

/// Next page in a chain without borrowing the chunk.
pub fn next_page(data: &[u8]) -> Result<PageId> {
    let (_, next) = read_chunk(data)?;
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_round_trip() {
        let mut buf = vec![0u8; 512];
        write_chunk(&mut buf, b"overflowing", 33).expect("write");
        let (chunk, next) = read_chunk(&buf).expect("read");
        assert_eq!(chunk, b"overflowing");
        assert_eq!(next, 33);
    }

    #[test]
    fn oversized_chunk_is_rejected() {
        let mut buf = vec![0u8; 64];
        let chunk = vec![1u8; 64];
        assert!(write_chunk(&mut buf, &chunk, 0).is_err());
    }

    #[test]
    fn wrong_kind_is_corruption() {
        let buf = vec![0u8; 64];
        assert!(matches!(
            read_chunk(&buf),
            Err(TansuError::Corruption(_))
        ));
    }
}
