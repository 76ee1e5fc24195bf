//! Shared storage kernel.
//!
//! Every store flavour (hash, btree, table indexes) sits on the same
//! [`Kernel`]: a pager plus the page-0 header, free-page bookkeeping,
//! overflow chains for large values, and the rollback-journal transaction
//! protocol. The stores own the page content above the kind tag; the kernel
//! owns allocation, freeing, spilling, and durability.

pub mod header;
pub mod overflow;
pub mod page;
pub mod record;

use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info};

use crate::config::{Comparator, Config, OpenMode};
use crate::error::{Result, TansuError};
use crate::journal::Journal;
use crate::pager::{PageId, Pager, MIN_PAGE_SIZE};

pub use header::{Header, StoreKind};

/// Tag byte at offset 0 of every non-header page.
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PageKind {
    /// Member of the free-page list.
    Free = 0,
    /// Slotted page holding hash records.
    Record = 2,
    /// Hash bucket directory page.
    BucketDir = 3,
    /// B-tree node (leaf or internal).
    Node = 4,
    /// Overflow chunk of a spilled value.
    Overflow = 5,
}

/// Free pages keep the next free page id at this offset.
const FREE_NEXT_OFFSET: usize = 4;

/// Point-in-time store statistics, as reported by `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct Stats {
    pub path: String,
    pub kind: &'static str,
    pub page_size: u32,
    pub page_count: u32,
    pub file_size: u64,
    pub record_count: u64,
    pub free_pages: u64,
}

/// Pager, header, and transaction state shared by all store flavours.
pub struct Kernel {
    pub(crate) pager: Pager,
    pub(crate) header: Header,
    pub(crate) journal: Option<Journal>,
    pub(crate) comparator: Comparator,
    pub(crate) sync_writes: bool,
    path: PathBuf,
}

impl std::fmt::Debug for Kernel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kernel")
            .field("path", &self.path)
            .field("kind", &self.header.kind.as_str())
            .field("page_count", &self.pager.page_count())
            .field("in_transaction", &self.journal.is_some())
            .finish()
    }
}

impl Kernel {
    /// Opens (or creates) a store file of the given kind.
    ///
    /// For an existing file the page size is probed from the stored header,
    /// so a `Config` with a different `page_size` still opens it. The store
    /// kind and comparator tag in the header must match what the caller
    /// asks for.
    pub fn open(path: &Path, mode: OpenMode, config: &Config, kind: StoreKind) -> Result<Self> {
        let page_size = if mode.truncate {
            config.page_size
        } else {
            probe_page_size(path)?.unwrap_or(config.page_size)
        };
        let mut pager = Pager::open(path, mode, page_size, config.cache_pages)?;
        Journal::recover(path, &mut pager)?;

        let header = if pager.page_count() == 0 {
            if !pager.writable() {
                return Err(TansuError::InvalidArgument(
                    "cannot initialize a store opened read-only".into(),
                ));
            }
            let header = Header::new(kind, config.comparator.tag(), page_size);
            let id = pager.grow()?;
            debug_assert_eq!(id, 0);
            let page = pager.fetch_page(0)?;
            header.write(&mut page.data)?;
            page.dirty = true;
            pager.sync()?;
            info!(path = %path.display(), kind = kind.as_str(), page_size, "created store");
            header
        } else {
            let page = pager.fetch_page(0)?;
            let header = Header::read(&page.data)?.ok_or_else(|| {
                TansuError::Corruption("non-empty file with a blank header page".into())
            })?;
            if header.kind != kind {
                return Err(TansuError::InvalidArgument(format!(
                    "file is a {} store, opened as {}",
                    header.kind.as_str(),
                    kind.as_str()
                )));
            }
            if header.page_size != page_size {
                return Err(TansuError::Corruption(
                    "header page size disagrees with probed page size".into(),
                ));
            }
            header
        };

        let comparator = effective_comparator(&header, config.comparator)?;
        debug!(path = %path.display(), kind = kind.as_str(), rnum = header.rnum, "opened store");
        Ok(Self {
            pager,
            header,
            journal: None,
            comparator,
            sync_writes: config.sync_writes,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn writable(&self) -> bool {
        self.pager.writable()
    }

    pub fn page_size(&self) -> usize {
        self.pager.page_size()
    }

    pub fn file_size(&self) -> u64 {
        self.pager.file_size()
    }

    pub fn in_transaction(&self) -> bool {
        self.journal.is_some()
    }

    /// Values longer than this are spilled to overflow chains.
    pub fn spill_threshold(&self) -> usize {
        self.pager.page_size() / 4
    }

    /// Fetches a page for modification, journaling its pre-image when a
    /// transaction is active and the page predates it.
    pub fn page_mut(&mut self, id: PageId) -> Result<&mut crate::pager::Page> {
        if let Some(journal) = &mut self.journal {
            if journal.covers(id) && !journal.has(id) {
                let image = self.pager.page_image(id)?;
                journal.record(id, &image)?;
            }
        }
        let page = self.pager.fetch_page(id)?;
        page.dirty = true;
        Ok(page)
    }

    /// Fetches a page for reading.
    pub fn page(&mut self, id: PageId) -> Result<&crate::pager::Page> {
        Ok(self.pager.fetch_page(id)?)
    }

    /// Allocates a page, reusing the free list before extending the file.
    /// The page comes back zeroed with its kind tag set.
    pub fn alloc_page(&mut self, kind: PageKind) -> Result<PageId> {
        let id = if self.header.free_head != 0 {
            let id = self.header.free_head;
            let next = {
                let page = self.page_mut(id)?;
                u32::from_le_bytes([
                    page.data[FREE_NEXT_OFFSET],
                    page.data[FREE_NEXT_OFFSET + 1],
                    page.data[FREE_NEXT_OFFSET + 2],
                    page.data[FREE_NEXT_OFFSET + 3],
                ])
            };
            self.header.free_head = next;
            id
        } else {
            self.pager.grow()?
        };
        let page = self.page_mut(id)?;
        page.data.fill(0);
        page.data[0] = kind as u8;
        Ok(id)
    }

    /// Returns a page to the free list.
    pub fn free_page(&mut self, id: PageId) -> Result<()> {
        let head = self.header.free_head;
        let page = self.page_mut(id)?;
        page.data.fill(0);
        page.data[0] = PageKind::Free as u8;
        page.data[FREE_NEXT_OFFSET..FREE_NEXT_OFFSET + 4].copy_from_slice(&head.to_le_bytes());
        self.header.free_head = id;
        Ok(())
    }

    /// Spills a value into an overflow chain, returning its first page.
    pub fn spill_value(&mut self, value: &[u8]) -> Result<PageId> {
        let capacity = overflow::chunk_capacity(self.pager.page_size());
        let chunks: Vec<&[u8]> = if value.is_empty() {
            vec![&[]]
        } else {
            value.chunks(capacity).collect()
        };
        let mut ids = Vec::with_capacity(chunks.len());
        for _ in 0..chunks.len() {
            ids.push(self.alloc_page(PageKind::Overflow)?);
        }
        for (index, chunk) in chunks.iter().enumerate() {
            let next = ids.get(index + 1).copied().unwrap_or(0);
            let page = self.page_mut(ids[index])?;
            overflow::write_chunk(&mut page.data, chunk, next)?;
        }
        Ok(ids[0])
    }

    /// Reads a spilled value back, verifying its total length.
    pub fn read_spilled(&mut self, first: PageId, total_len: u64) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(total_len as usize);
        let mut current = first;
        while current != 0 {
            let page = self.pager.fetch_page(current)?;
            let (chunk, next) = overflow::read_chunk(&page.data)?;
            out.extend_from_slice(chunk);
            if out.len() as u64 > total_len {
                return Err(TansuError::Corruption(
                    "overflow chain longer than recorded value length".into(),
                ));
            }
            current = next;
        }
        if out.len() as u64 != total_len {
            return Err(TansuError::Corruption(
                "overflow chain shorter than recorded value length".into(),
            ));
        }
        Ok(out)
    }

    /// Frees every page of an overflow chain.
    pub fn free_spilled(&mut self, first: PageId) -> Result<()> {
        let mut current = first;
        while current != 0 {
            let next = {
                let page = self.pager.fetch_page(current)?;
                overflow::next_page(&page.data)?
            };
            self.free_page(current)?;
            current = next;
        }
        Ok(())
    }

    /// Begins a transaction. The header is made durable first so its
    /// pre-image reflects the pre-transaction state.
    pub fn tran_begin(&mut self) -> Result<()> {
        if !self.writable() {
            return Err(TansuError::ReadOnly);
        }
        if self.journal.is_some() {
            return Err(TansuError::InvalidArgument(
                "a transaction is already active".into(),
            ));
        }
        self.write_header()?;
        self.pager.flush()?;
        let mut journal =
            Journal::begin(&self.path, self.pager.page_size(), self.pager.page_count())?;
        let image = self.pager.page_image(0)?;
        journal.record(0, &image)?;
        self.journal = Some(journal);
        Ok(())
    }

    /// Commits the active transaction: data file flushed and fsynced, then
    /// the journal destroyed.
    pub fn tran_commit(&mut self) -> Result<()> {
        let journal = self.journal.take().ok_or_else(|| {
            TansuError::InvalidArgument("no transaction is active".into())
        })?;
        self.write_header()?;
        self.pager.flush()?;
        self.pager.sync_file()?;
        journal.commit()?;
        Ok(())
    }

    /// Aborts the active transaction and reloads the restored header.
    pub fn tran_abort(&mut self) -> Result<()> {
        let journal = self.journal.take().ok_or_else(|| {
            TansuError::InvalidArgument("no transaction is active".into())
        })?;
        journal.abort(&mut self.pager)?;
        let page = self.pager.fetch_page(0)?;
        self.header = Header::read(&page.data)?.ok_or_else(|| {
            TansuError::Corruption("header page blank after rollback".into())
        })?;
        self.comparator = effective_comparator(&self.header, self.comparator)?;
        Ok(())
    }

    /// Writes the in-memory header onto page 0.
    pub fn write_header(&mut self) -> Result<()> {
        let header = self.header.clone();
        let page = self.page_mut(0)?;
        header.write(&mut page.data)?;
        Ok(())
    }

    /// Persists the header and honors the sync-on-write policy. Called at
    /// the end of every mutating store operation outside a transaction.
    pub fn after_write(&mut self) -> Result<()> {
        self.write_header()?;
        if self.sync_writes && self.journal.is_none() {
            self.pager.sync()?;
        }
        Ok(())
    }

    /// Flushes everything and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.write_header()?;
        self.pager.sync()
    }

    /// Empties the store back to a lone header page, keeping its identity
    /// (kind, comparator, page size) but resetting all counters.
    pub fn reset(&mut self) -> Result<()> {
        if self.journal.is_some() {
            return Err(TansuError::InvalidArgument(
                "cannot reset inside a transaction".into(),
            ));
        }
        if !self.writable() {
            return Err(TansuError::ReadOnly);
        }
        self.pager.truncate(0)?;
        self.pager.invalidate_cache();
        self.header = Header::new(
            self.header.kind,
            self.header.comparator_tag,
            self.header.page_size,
        );
        let id = self.pager.grow()?;
        debug_assert_eq!(id, 0);
        self.write_header()?;
        self.pager.sync()?;
        Ok(())
    }

    /// Store statistics. Walks the free list to count reusable pages.
    pub fn stats(&mut self) -> Result<Stats> {
        let mut free_pages = 0u64;
        let mut current = self.header.free_head;
        while current != 0 {
            let page = self.pager.fetch_page(current)?;
            if page.data[0] != PageKind::Free as u8 {
                return Err(TansuError::Corruption(
                    "free list points at a live page".into(),
                ));
            }
            current = u32::from_le_bytes([
                page.data[FREE_NEXT_OFFSET],
                page.data[FREE_NEXT_OFFSET + 1],
                page.data[FREE_NEXT_OFFSET + 2],
                page.data[FREE_NEXT_OFFSET + 3],
            ]);
            free_pages += 1;
        }
        Ok(Stats {
            path: self.path.display().to_string(),
            kind: self.header.kind.as_str(),
            page_size: self.header.page_size,
            page_count: self.pager.page_count(),
            file_size: self.pager.file_size(),
            record_count: self.header.rnum,
            free_pages,
        })
    }
}

/// Resolves the comparator to use for a store given its header tag and what
/// the caller supplied. Custom comparators cannot be persisted, so a file
/// tagged custom must be reopened with one.
fn effective_comparator(header: &Header, supplied: Comparator) -> Result<Comparator> {
    match header.comparator_tag {
        0 => Ok(Comparator::Lexical),
        1 => Ok(Comparator::Decimal),
        2 => match supplied {
            Comparator::Custom(_) => Ok(supplied),
            _ => Err(TansuError::InvalidArgument(
                "store was created with a custom comparator; supply one on open".into(),
            )),
        },
        other => Err(TansuError::Corruption(format!(
            "unknown comparator tag {other}"
        ))),
    }
}

/// Reads the page size out of an existing file's header without paging it
/// in, so the pager can be sized correctly up front.
fn probe_page_size(path: &Path) -> Result<Option<u32>> {
    use std::io::Read;

    let mut file = match std::fs::File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };
    let mut prefix = [0u8; header::HEADER_REGION_SIZE];
    match file.read_exact(&mut prefix) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err.into()),
    }
    match Header::read(&prefix)? {
        Some(header) => {
            if !header.page_size.is_power_of_two() || header.page_size < MIN_PAGE_SIZE {
                return Err(TansuError::Corruption(format!(
                    "stored page size {} is invalid",
                    header.page_size
                )));
            }
            Ok(Some(header.page_size))
        }
        None => Ok(None),
    }
}
