//! Page cache over a single database file.
//!
//! The file is an array of fixed-size pages. Page 0 holds the store header;
//! every page carries a crc32 trailer in its last four bytes, verified on
//! read and stamped on write-back. A bounded LRU cache sits between the
//! stores and the file; dirty pages are written back on eviction, flush,
//! and close.
//!
//! Free-page bookkeeping lives above the pager (the free-list head is a
//! header field); the pager only knows how to extend, read, write, and
//! truncate the file.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use lru::LruCache;
use tracing::debug;

use crate::config::OpenMode;
use crate::error::{Result, TansuError};

/// Identifier of a page within the database file. Zero is the header page;
/// zero in a pointer field means nil.
pub type PageId = u32;

/// Bytes reserved at the end of every page for the crc32 trailer.
pub const PAGE_CHECKSUM_SIZE: usize = 4;

/// Smallest page size the pager accepts.
pub const MIN_PAGE_SIZE: u32 = 512;

/// An in-memory copy of one page.
#[derive(Debug)]
pub struct Page {
    /// Full page bytes including the checksum trailer region.
    pub data: Vec<u8>,
    /// Whether the page differs from its on-disk image.
    pub dirty: bool,
}

/// Page cache over one database file.
pub struct Pager {
    file: File,
    path: PathBuf,
    page_size: usize,
    writable: bool,
    locked: bool,
    page_count: u32,
    cache: LruCache<PageId, Page>,
}

impl std::fmt::Debug for Pager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pager")
            .field("path", &self.path)
            .field("page_size", &self.page_size)
            .field("page_count", &self.page_count)
            .field("writable", &self.writable)
            .finish()
    }
}

impl Pager {
    /// Opens (or creates) the database file and acquires the advisory lock
    /// dictated by `mode`.
    pub fn open(
        path: &Path,
        mode: OpenMode,
        page_size: u32,
        cache_pages: usize,
    ) -> Result<Self> {
        if !page_size.is_power_of_two() || page_size < MIN_PAGE_SIZE {
            return Err(TansuError::InvalidArgument(format!(
                "page size {page_size} must be a power of two >= {MIN_PAGE_SIZE}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(mode.write)
            .create(mode.write && mode.create)
            .open(path)?;
        if !mode.no_lock {
            lock_file(&file, mode)?;
        }
        if mode.write && mode.truncate {
            file.set_len(0)?;
        }
        let len = file.metadata()?.len();
        let page_count = (len / page_size as u64) as u32;
        let capacity = NonZeroUsize::new(cache_pages.max(8)).ok_or_else(|| {
            TansuError::InvalidArgument("page cache capacity must be non-zero".into())
        })?;
        debug!(path = %path.display(), page_count, "opened pager");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            page_size: page_size as usize,
            writable: mode.write,
            locked: !mode.no_lock,
            page_count,
            cache: LruCache::new(capacity),
        })
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages in the file (cached extensions included).
    pub fn page_count(&self) -> u32 {
        self.page_count
    }

    /// Size of the database in bytes.
    pub fn file_size(&self) -> u64 {
        self.page_count as u64 * self.page_size as u64
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the pager was opened writable.
    pub fn writable(&self) -> bool {
        self.writable
    }

    /// Fetches a page, reading and checksum-verifying it on a cache miss.
    pub fn fetch_page(&mut self, id: PageId) -> Result<&mut Page> {
        if id >= self.page_count {
            return Err(TansuError::Corruption(format!(
                "page {id} beyond end of file ({} pages)",
                self.page_count
            )));
        }
        if !self.cache.contains(&id) {
            let page = self.read_page(id)?;
            self.make_room()?;
            self.cache.put(id, page);
        }
        self.cache
            .get_mut(&id)
            .ok_or_else(|| TansuError::Corruption("page missing from cache after insert".into()))
    }

    /// Appends a zeroed page to the file and returns its id.
    pub fn grow(&mut self) -> Result<PageId> {
        let id = self.page_count;
        self.page_count = self
            .page_count
            .checked_add(1)
            .ok_or_else(|| TansuError::InvalidArgument("page count would overflow u32".into()))?;
        let page = Page {
            data: vec![0u8; self.page_size],
            dirty: true,
        };
        self.make_room()?;
        self.cache.put(id, page);
        Ok(id)
    }

    /// Copy of a page's current logical content: the cached image when
    /// present, otherwise the on-disk bytes. Used for journal pre-images.
    pub fn page_image(&mut self, id: PageId) -> Result<Vec<u8>> {
        if let Some(page) = self.cache.peek(&id) {
            return Ok(page.data.clone());
        }
        Ok(self.read_page(id)?.data)
    }

    /// Overwrites a page with `data`, restamping its checksum. Used by
    /// journal rollback; bypasses the dirty-tracking fast path and writes
    /// straight to disk.
    pub fn restore_page(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if data.len() != self.page_size {
            return Err(TansuError::Corruption(
                "journal pre-image size does not match page size".into(),
            ));
        }
        let mut copy = data.to_vec();
        stamp_checksum(&mut copy);
        write_at(&mut self.file, self.page_size, id, &copy)?;
        self.cache.pop(&id);
        if id >= self.page_count {
            self.page_count = id + 1;
        }
        Ok(())
    }

    /// Writes all dirty cached pages back to the file.
    pub fn flush(&mut self) -> Result<()> {
        let page_size = self.page_size;
        let file = &mut self.file;
        for (id, page) in self.cache.iter_mut() {
            if page.dirty {
                stamp_checksum(&mut page.data);
                write_at(file, page_size, *id, &page.data)?;
                page.dirty = false;
            }
        }
        Ok(())
    }

    /// Flushes and fsyncs the file.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// Fsyncs without flushing; callers that already flushed use this.
    pub fn sync_file(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Shrinks the file to `keep` pages, discarding cached pages beyond it.
    pub fn truncate(&mut self, keep: u32) -> Result<()> {
        let stale: Vec<PageId> = self
            .cache
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| *id >= keep)
            .collect();
        for id in stale {
            self.cache.pop(&id);
        }
        self.file.set_len(keep as u64 * self.page_size as u64)?;
        self.page_count = keep;
        Ok(())
    }

    /// Drops every cached page. Rollback uses this after rewriting the file.
    pub fn invalidate_cache(&mut self) {
        self.cache.clear();
    }

    fn make_room(&mut self) -> Result<()> {
        while self.cache.len() >= self.cache.cap().get() {
            if let Some((id, mut page)) = self.cache.pop_lru() {
                if page.dirty {
                    stamp_checksum(&mut page.data);
                    write_at(&mut self.file, self.page_size, id, &page.data)?;
                }
            } else {
                break;
            }
        }
        Ok(())
    }

    fn read_page(&mut self, id: PageId) -> Result<Page> {
        let mut data = vec![0u8; self.page_size];
        self.file
            .seek(SeekFrom::Start(id as u64 * self.page_size as u64))?;
        match self.file.read_exact(&mut data) {
            Ok(()) => {}
            // A page allocated but never flushed reads past EOF; treat the
            // missing tail as zeroes.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Ok(Page { data, dirty: false });
            }
            Err(err) => return Err(err.into()),
        }
        let stored = u32::from_le_bytes([
            data[self.page_size - 4],
            data[self.page_size - 3],
            data[self.page_size - 2],
            data[self.page_size - 1],
        ]);
        let computed = crc32fast::hash(&data[..self.page_size - PAGE_CHECKSUM_SIZE]);
        // All-zero pages pass unchecked: a page allocated but flushed only
        // partially (or not at all) reads back as zeroes with a zero
        // trailer. External corruption that zeroes a whole page is
        // indistinguishable from that.
        if stored != computed && data.iter().any(|b| *b != 0) {
            return Err(TansuError::Corruption(format!(
                "checksum mismatch on page {id}"
            )));
        }
        Ok(Page { data, dirty: false })
    }
}

impl Drop for Pager {
    fn drop(&mut self) {
        if self.writable {
            let _ = self.flush();
        }
        if self.locked {
            let _ = FileExt::unlock(&self.file);
        }
    }
}

// Fully qualified calls: std's `File` has inherent locking methods with a
// different error type that would otherwise shadow the fs2 trait.
fn lock_file(file: &File, mode: OpenMode) -> Result<()> {
    let outcome = match (mode.write, mode.lock_nonblocking) {
        (true, true) => FileExt::try_lock_exclusive(file),
        (true, false) => FileExt::lock_exclusive(file),
        (false, true) => FileExt::try_lock_shared(file),
        (false, false) => FileExt::lock_shared(file),
    };
    outcome.map_err(|err| {
        if err.kind() == ErrorKind::WouldBlock {
            TansuError::Locked
        } else {
            TansuError::Io(err)
        }
    })
}

fn stamp_checksum(data: &mut [u8]) {
    let len = data.len();
    let crc = crc32fast::hash(&data[..len - PAGE_CHECKSUM_SIZE]);
    data[len - 4..].copy_from_slice(&crc.to_le_bytes());
}

fn write_at(file: &mut File, page_size: usize, id: PageId, data: &[u8]) -> Result<()> {
    file.seek(SeekFrom::Start(id as u64 * page_size as u64))?;
    file.write_all(data)?;
    Ok(())
}
