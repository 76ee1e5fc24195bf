//! Rollback journal.
//!
//! Transactions are implemented as an undo log: before a page is first
//! modified inside a transaction its pre-image is appended to
//! `<db>.journal` and fsynced. Abort writes the pre-images back and
//! truncates the file to its original page count; commit truncates and
//! removes the journal. A journal left behind by a crash is rolled back the
//! next time the store is opened by a writer.
//!
//! Journal layout:
//!
//! ```text
//! header: magic "TANSUJRN" | version u16 | reserved u16
//!         page_size u32 | orig_page_count u32 | crc32 u32
//! record: page_id u32 | crc32 u32 | page bytes (page_size)
//! ```
//!
//! A torn trailing record is harmless: pre-images are written before their
//! page is touched, so a record that never fully reached the journal
//! corresponds to a page that was never modified.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{Result, TansuError};
use crate::pager::{PageId, Pager};

const JOURNAL_MAGIC: &[u8; 8] = b"TANSUJRN";
const JOURNAL_VERSION: u16 = 1;
const JOURNAL_HEADER_SIZE: usize = 24;
const RECORD_PREFIX_SIZE: usize = 8;

/// Active rollback journal for one transaction.
#[derive(Debug)]
pub struct Journal {
    file: File,
    path: PathBuf,
    page_size: usize,
    orig_page_count: u32,
    recorded: HashSet<PageId>,
}

impl Journal {
    /// Path of the journal that belongs to `db_path`.
    pub fn path_for(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_os_string();
        name.push(".journal");
        PathBuf::from(name)
    }

    /// Starts a transaction: creates the journal file and persists its
    /// header before any page may be modified.
    pub fn begin(db_path: &Path, page_size: usize, orig_page_count: u32) -> Result<Self> {
        let path = Self::path_for(db_path);
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        header[..8].copy_from_slice(JOURNAL_MAGIC);
        header[8..10].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
        header[12..16].copy_from_slice(&(page_size as u32).to_le_bytes());
        header[16..20].copy_from_slice(&orig_page_count.to_le_bytes());
        let crc = crc32fast::hash(&header[..20]);
        header[20..24].copy_from_slice(&crc.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;
        debug!(path = %path.display(), orig_page_count, "transaction journal started");
        Ok(Self {
            file,
            path,
            page_size,
            orig_page_count,
            recorded: HashSet::new(),
        })
    }

    /// Whether a pre-image for `id` has already been captured.
    pub fn has(&self, id: PageId) -> bool {
        self.recorded.contains(&id)
    }

    /// Whether `id` existed when the transaction began. Pages allocated
    /// inside the transaction need no pre-image; abort truncates them away.
    pub fn covers(&self, id: PageId) -> bool {
        id < self.orig_page_count
    }

    /// Appends the pre-image of a page. Idempotent per page; only the first
    /// image matters for rollback.
    pub fn record(&mut self, id: PageId, data: &[u8]) -> Result<()> {
        if self.recorded.contains(&id) {
            return Ok(());
        }
        if data.len() != self.page_size {
            return Err(TansuError::Corruption(
                "pre-image size does not match page size".into(),
            ));
        }
        let mut prefix = [0u8; RECORD_PREFIX_SIZE];
        prefix[..4].copy_from_slice(&id.to_le_bytes());
        prefix[4..8].copy_from_slice(&crc32fast::hash(data).to_le_bytes());
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&prefix)?;
        self.file.write_all(data)?;
        self.file.sync_all()?;
        self.recorded.insert(id);
        Ok(())
    }

    /// Commits the transaction: the caller has already flushed the data
    /// file, so the journal is simply destroyed.
    pub fn commit(self) -> Result<()> {
        self.file.set_len(0)?;
        self.file.sync_all()?;
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Aborts the transaction, restoring every journaled pre-image and the
    /// original file length.
    pub fn abort(mut self, pager: &mut Pager) -> Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        replay(&mut self.file, self.page_size, self.orig_page_count, pager)?;
        drop(self.file);
        fs::remove_file(&self.path)?;
        Ok(())
    }

    /// Rolls back a journal left behind by a crash, if one exists.
    ///
    /// Returns `true` when a rollback was performed. Readers cannot recover;
    /// they refuse to open a crashed store.
    pub fn recover(db_path: &Path, pager: &mut Pager) -> Result<bool> {
        let path = Self::path_for(db_path);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(false),
            Err(err) => return Err(err.into()),
        };
        let len = file.metadata()?.len();
        if len < JOURNAL_HEADER_SIZE as u64 {
            // Journal died before its header was durable; nothing was
            // modified under it.
            drop(file);
            if pager.writable() {
                fs::remove_file(&path)?;
            }
            return Ok(false);
        }
        if !pager.writable() {
            return Err(TansuError::Corruption(
                "rollback journal present; open with a writer to recover".into(),
            ));
        }
        warn!(path = %path.display(), "rolling back interrupted transaction");
        let mut header = [0u8; JOURNAL_HEADER_SIZE];
        file.read_exact(&mut header)?;
        if &header[..8] != JOURNAL_MAGIC {
            return Err(TansuError::Corruption("journal magic mismatch".into()));
        }
        let version = u16::from_le_bytes([header[8], header[9]]);
        if version != JOURNAL_VERSION {
            return Err(TansuError::Corruption(format!(
                "unsupported journal version {version}"
            )));
        }
        let crc = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
        if crc != crc32fast::hash(&header[..20]) {
            return Err(TansuError::Corruption("journal header crc mismatch".into()));
        }
        let page_size = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);
        if page_size as usize != pager.page_size() {
            return Err(TansuError::Corruption(
                "journal page size does not match database".into(),
            ));
        }
        let orig_page_count =
            u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
        replay(&mut file, page_size as usize, orig_page_count, pager)?;
        drop(file);
        fs::remove_file(&path)?;
        Ok(true)
    }
}

fn replay(
    file: &mut File,
    page_size: usize,
    orig_page_count: u32,
    pager: &mut Pager,
) -> Result<()> {
    file.seek(SeekFrom::Start(JOURNAL_HEADER_SIZE as u64))?;
    let mut prefix = [0u8; RECORD_PREFIX_SIZE];
    let mut data = vec![0u8; page_size];
    loop {
        match file.read_exact(&mut prefix) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        match file.read_exact(&mut data) {
            Ok(()) => {}
            // Torn tail record: its page was never modified.
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let id = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let crc = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);
        if crc != crc32fast::hash(&data) {
            break;
        }
        pager.restore_page(id, &data)?;
    }
    pager.truncate(orig_page_count)?;
    pager.invalidate_cache();
    pager.sync_file()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OpenMode;

    #[test]
    fn abort_restores_pre_images_and_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("j.db");
        let mut pager = Pager::open(&path, OpenMode::writer(), 512, 16).expect("open");
        let id = pager.grow().expect("grow");
        {
            let page = pager.fetch_page(id).expect("fetch");
            page.data[0] = 1;
            page.dirty = true;
        }
        pager.sync().expect("sync");

        let mut journal = Journal::begin(&path, 512, pager.page_count()).expect("begin");
        let image = pager.page_image(id).expect("image");
        journal.record(id, &image).expect("record");
        {
            let page = pager.fetch_page(id).expect("fetch");
            page.data[0] = 99;
            page.dirty = true;
        }
        let extra = pager.grow().expect("grow in tran");
        assert_eq!(extra, 1);
        journal.abort(&mut pager).expect("abort");

        assert_eq!(pager.page_count(), 1);
        let page = pager.fetch_page(id).expect("refetch");
        assert_eq!(page.data[0], 1);
        assert!(!Journal::path_for(&path).exists());
    }

    #[test]
    fn recover_rolls_back_leftover_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("crash.db");
        {
            let mut pager = Pager::open(&path, OpenMode::writer(), 512, 16).expect("open");
            let id = pager.grow().expect("grow");
            let page = pager.fetch_page(id).expect("fetch");
            page.data[0] = 5;
            page.dirty = true;
            pager.sync().expect("sync");

            let mut journal = Journal::begin(&path, 512, 1).expect("begin");
            let image = pager.page_image(id).expect("image");
            journal.record(id, &image).expect("record");
            let page = pager.fetch_page(id).expect("fetch");
            page.data[0] = 42;
            page.dirty = true;
            pager.sync().expect("sync modified");
            // Simulate a crash: the journal is never committed or aborted.
            std::mem::forget(journal);
        }
        let mut pager = Pager::open(&path, OpenMode::writer(), 512, 16).expect("reopen");
        let recovered = Journal::recover(&path, &mut pager).expect("recover");
        assert!(recovered);
        let page = pager.fetch_page(0).expect("fetch");
        assert_eq!(page.data[0], 5);
    }

    #[test]
    fn commit_removes_journal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("c.db");
        let mut pager = Pager::open(&path, OpenMode::writer(), 512, 16).expect("open");
        pager.grow().expect("grow");
        let journal = Journal::begin(&path, 512, 1).expect("begin");
        journal.commit().expect("commit");
        assert!(!Journal::path_for(&path).exists());
    }
}
