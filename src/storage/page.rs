//! Slotted record pages.
//!
//! Layout: an 8-byte page header (kind tag, slot count, free-space offset),
//! a slot directory growing upward (4 bytes per slot: record offset and
//! length), and record payloads growing downward from the checksum trailer.
//! Payloads are 8-byte aligned. A freed slot keeps its directory entry with
//! a zero offset; its payload space stays dead until `optimize` rebuilds
//! the file.

use crate::error::{Result, TansuError};
use crate::pager::PAGE_CHECKSUM_SIZE;
use crate::storage::PageKind;

pub const PAGE_HEADER_SIZE: usize = 8;
const SLOT_SIZE: usize = 4;
const COUNT_OFFSET: usize = 2;
const FREE_OFFSET_OFFSET: usize = 4;

pub struct RecordPage<'a> {
    data: &'a mut [u8],
}

impl<'a> RecordPage<'a> {
    pub fn from_bytes(data: &'a mut [u8]) -> Result<Self> {
        if data.len() < PAGE_HEADER_SIZE + PAGE_CHECKSUM_SIZE {
            return Err(TansuError::Corruption(
                "page smaller than slotted page header".into(),
            ));
        }
        Ok(Self { data })
    }

    /// Resets the page to an empty slotted page of the given kind.
    pub fn init(&mut self, kind: PageKind) {
        self.data.fill(0);
        self.data[0] = kind as u8;
        let limit = self.limit() as u16;
        self.data[FREE_OFFSET_OFFSET..FREE_OFFSET_OFFSET + 2]
            .copy_from_slice(&limit.to_le_bytes());
    }

    pub fn kind(&self) -> u8 {
        self.data[0]
    }

    fn limit(&self) -> usize {
        self.data.len() - PAGE_CHECKSUM_SIZE
    }

    pub fn slot_count(&self) -> u16 {
        u16::from_le_bytes([self.data[COUNT_OFFSET], self.data[COUNT_OFFSET + 1]])
    }

    fn set_slot_count(&mut self, value: u16) {
        self.data[COUNT_OFFSET..COUNT_OFFSET + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn free_offset(&self) -> usize {
        u16::from_le_bytes([
            self.data[FREE_OFFSET_OFFSET],
            self.data[FREE_OFFSET_OFFSET + 1],
        ]) as usize
    }

    fn set_free_offset(&mut self, value: usize) {
        self.data[FREE_OFFSET_OFFSET..FREE_OFFSET_OFFSET + 2]
            .copy_from_slice(&(value as u16).to_le_bytes());
    }

    fn dir_end(&self) -> usize {
        PAGE_HEADER_SIZE + self.slot_count() as usize * SLOT_SIZE
    }

    fn slot_entry(&self, index: usize) -> Result<(usize, usize)> {
        if index >= self.slot_count() as usize {
            return Err(TansuError::InvalidArgument(
                "slot index out of bounds".into(),
            ));
        }
        let pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        let offset = u16::from_le_bytes([self.data[pos], self.data[pos + 1]]) as usize;
        let len = u16::from_le_bytes([self.data[pos + 2], self.data[pos + 3]]) as usize;
        Ok((offset, len))
    }

    fn set_slot_entry(&mut self, index: usize, offset: usize, len: usize) {
        let pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
        self.data[pos..pos + 2].copy_from_slice(&(offset as u16).to_le_bytes());
        self.data[pos + 2..pos + 4].copy_from_slice(&(len as u16).to_le_bytes());
    }

    fn free_slot_index(&self) -> Option<usize> {
        for index in 0..self.slot_count() as usize {
            let pos = PAGE_HEADER_SIZE + index * SLOT_SIZE;
            if self.data[pos] == 0 && self.data[pos + 1] == 0 {
                return Some(index);
            }
        }
        None
    }

    /// Free bytes between the slot directory and the record payloads.
    pub fn free_space(&self) -> Result<usize> {
        let free_offset = self.free_offset();
        let dir_end = self.dir_end();
        if free_offset < dir_end || free_offset > self.limit() {
            return Err(TansuError::Corruption(
                "free space offset outside page bounds".into(),
            ));
        }
        Ok(free_offset - dir_end)
    }

    pub fn can_fit(&self, record_len: usize) -> Result<bool> {
        let slot_cost = if self.free_slot_index().is_some() {
            0
        } else {
            SLOT_SIZE
        };
        Ok(self.free_space()? >= align_to_eight(record_len) + slot_cost)
    }

    /// Appends a record, reusing a freed slot index when one exists.
    pub fn append(&mut self, record: &[u8]) -> Result<u16> {
        if record.is_empty() || record.len() > u16::MAX as usize {
            return Err(TansuError::InvalidArgument(
                "record length out of range for slotted page".into(),
            ));
        }
        if !self.can_fit(record.len())? {
            return Err(TansuError::InvalidArgument(
                "insufficient space for record".into(),
            ));
        }
        let padded = align_to_eight(record.len());
        let new_offset = self.free_offset() - padded;
        self.data[new_offset..new_offset + record.len()].copy_from_slice(record);
        if padded > record.len() {
            self.data[new_offset + record.len()..new_offset + padded].fill(0);
        }
        let index = match self.free_slot_index() {
            Some(index) => index,
            None => {
                let index = self.slot_count() as usize;
                if index >= u16::MAX as usize {
                    return Err(TansuError::InvalidArgument(
                        "slot count would overflow u16".into(),
                    ));
                }
                self.set_slot_count(index as u16 + 1);
                index
            }
        };
        self.set_slot_entry(index, new_offset, record.len());
        self.set_free_offset(new_offset);
        Ok(index as u16)
    }

    /// The record stored in a slot, or `None` if the slot was freed.
    pub fn slot(&self, index: usize) -> Result<Option<&[u8]>> {
        let (offset, len) = self.slot_entry(index)?;
        if offset == 0 {
            return Ok(None);
        }
        if offset + len > self.limit() {
            return Err(TansuError::Corruption(
                "record extends past end of page".into(),
            ));
        }
        Ok(Some(&self.data[offset..offset + len]))
    }

    /// Mutable view of a live slot's record bytes.
    pub fn slot_mut(&mut self, index: usize) -> Result<Option<&mut [u8]>> {
        let (offset, len) = self.slot_entry(index)?;
        if offset == 0 {
            return Ok(None);
        }
        if offset + len > self.limit() {
            return Err(TansuError::Corruption(
                "record extends past end of page".into(),
            ));
        }
        Ok(Some(&mut self.data[offset..offset + len]))
    }

    /// Overwrites a slot in place when the new record fits its current
    /// footprint. Returns false when it does not fit.
    pub fn update(&mut self, index: usize, record: &[u8]) -> Result<bool> {
        let (offset, len) = self.slot_entry(index)?;
        if offset == 0 {
            return Err(TansuError::InvalidArgument(
                "cannot update a freed slot".into(),
            ));
        }
        if align_to_eight(record.len()) > align_to_eight(len) {
            return Ok(false);
        }
        self.data[offset..offset + record.len()].copy_from_slice(record);
        let capacity = align_to_eight(len);
        if capacity > record.len() {
            self.data[offset + record.len()..offset + capacity].fill(0);
        }
        self.set_slot_entry(index, offset, record.len());
        Ok(true)
    }

    /// Marks a slot as freed; its payload space is reclaimed by `optimize`.
    pub fn free_slot(&mut self, index: usize) -> Result<()> {
        let (offset, len) = self.slot_entry(index)?;
        if offset == 0 {
            return Ok(());
        }
        self.data[offset..offset + len].fill(0);
        self.set_slot_entry(index, 0, 0);
        Ok(())
    }

    pub fn live_records(&self) -> Result<usize> {
        let mut live = 0;
        for index in 0..self.slot_count() as usize {
            let (offset, _) = self.slot_entry(index)?;
            if offset != 0 {
                live += 1;
            }
        }
        Ok(live)
    }
}

pub fn align_to_eight(value: usize) -> usize {
    (value + 7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_buf(size: usize) -> Vec<u8> {
        vec![0u8; size]
    }

    #[test]
    fn init_sets_kind_and_free_offset() {
        let mut buf = page_buf(256);
        let mut page = RecordPage::from_bytes(&mut buf).expect("page");
        page.init(PageKind::Record);
        assert_eq!(page.kind(), PageKind::Record as u8);
        assert_eq!(page.slot_count(), 0);
        assert_eq!(page.free_space().expect("free"), 252 - PAGE_HEADER_SIZE);
    }

    #[test]
    fn append_and_read_back() {
        let mut buf = page_buf(256);
        let mut page = RecordPage::from_bytes(&mut buf).expect("page");
        page.init(PageKind::Record);
        let slot = page.append(b"hello").expect("append");
        assert_eq!(slot, 0);
        assert_eq!(page.slot(0).expect("slot"), Some(&b"hello"[..]));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut buf = page_buf(256);
        let mut page = RecordPage::from_bytes(&mut buf).expect("page");
        page.init(PageKind::Record);
        page.append(b"first").expect("append");
        page.append(b"second").expect("append");
        page.free_slot(0).expect("free");
        assert_eq!(page.slot(0).expect("slot"), None);
        let slot = page.append(b"third").expect("append");
        assert_eq!(slot, 0);
        assert_eq!(page.slot(0).expect("slot"), Some(&b"third"[..]));
        assert_eq!(page.live_records().expect("live"), 2);
    }

    #[test]
    fn update_in_place_when_it_fits() {
        let mut buf = page_buf(256);
        let mut page = RecordPage::from_bytes(&mut buf).expect("page");
        page.init(PageKind::Record);
        page.append(b"abcdefgh").expect("append");
        assert!(page.update(0, b"xyz").expect("update"));
        assert_eq!(page.slot(0).expect("slot"), Some(&b"xyz"[..]));
        assert!(!page.update(0, &[7u8; 64]).expect("update too big"));
    }

    #[test]
    fn fills_until_capacity() {
        let mut buf = page_buf(128);
        let mut page = RecordPage::from_bytes(&mut buf).expect("page");
        page.init(PageKind::Record);
        let mut appended = 0;
        while page.can_fit(8).expect("can_fit") {
            page.append(&[1u8; 8]).expect("append");
            appended += 1;
        }
        assert!(appended > 0);
        let err = page.append(&[1u8; 8]).expect_err("page is full");
        assert!(matches!(err, TansuError::InvalidArgument(_)));
    }
}
