//! Unordered key-value store.
//!
//! Keys are hashed (xxh64) into a fixed set of buckets; each bucket heads a
//! singly linked chain of records stored in slotted pages. The bucket
//! directory occupies the pages directly after the header and is sized when
//! the file is created; `optimize` rebuilds the file with a new bucket
//! count.
//!
//! [`HashDb`] is a cheaply cloneable handle; all clones share one store
//! guarded by a mutex, so it can be used from multiple threads.

use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, info};
use xxhash_rust::xxh64::xxh64;

use crate::config::{Config, OpenMode};
use crate::error::{Result, TansuError};
use crate::pager::{PageId, PAGE_CHECKSUM_SIZE};
use crate::storage::page::{RecordPage, PAGE_HEADER_SIZE};
use crate::storage::record::{HashRecord, RecordPtr, RecordValue, RECORD_HEADER_SIZE};
use crate::storage::{Kernel, PageKind, Stats, StoreKind};

const BUCKET_ENTRY_SIZE: usize = 6;
const DIR_HEADER_SIZE: usize = 8;
const SPILL_POINTER_SIZE: usize = 12;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PutMode {
    Overwrite,
    Keep,
    Cat,
}

/// Handle to an unordered key-value store.
#[derive(Clone)]
pub struct HashDb {
    inner: Arc<Mutex<HashInner>>,
}

impl std::fmt::Debug for HashDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashDb").finish_non_exhaustive()
    }
}

impl HashDb {
    /// Opens a hash store with the default configuration.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with(path, mode, Config::default())
    }

    /// Opens a hash store with explicit tuning.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: Config) -> Result<Self> {
        let inner = HashInner::open(path.as_ref(), mode, &config)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Flushes the store and drops this handle. The file itself closes when
    /// the last clone is dropped.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.kernel.writable() {
            inner.kernel.sync()?;
        }
        Ok(())
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().kernel.path().to_path_buf()
    }

    /// Stores a record, replacing any existing value for the key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put_impl(key, value, PutMode::Overwrite)
    }

    /// Stores a record only if the key is absent.
    pub fn put_keep(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put_impl(key, value, PutMode::Keep)
    }

    /// Appends `value` to the existing value, creating the record if the
    /// key is absent.
    pub fn put_cat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put_impl(key, value, PutMode::Cat)
    }

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.inner.lock().get_impl(key)
    }

    /// Size of the stored value without reading it in full.
    pub fn vsiz(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        let bucket = inner.bucket_index(key);
        Ok(inner
            .find_in_bucket(bucket, key)?
            .map(|(_, _, rec)| rec.value_len()))
    }

    /// Removes a record. Returns false when the key was absent.
    pub fn out(&self, key: &[u8]) -> Result<bool> {
        self.inner.lock().out_impl(key)
    }

    /// Keys beginning with `prefix`, in unspecified order, capped at `max`.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.inner.lock().fwmkeys_impl(prefix, max)
    }

    /// Adds `amount` to the record's value interpreted as a little-endian
    /// i64, creating it when absent. Returns the new total.
    pub fn add_int(&self, key: &[u8], amount: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let current = match inner.fetch_value(key)? {
            Some(bytes) => Some(decode_i64(&bytes)?),
            None => None,
        };
        let total = current.unwrap_or(0).wrapping_add(amount);
        inner.put_impl(key, &total.to_le_bytes(), PutMode::Overwrite)?;
        Ok(total)
    }

    /// Adds `amount` to the record's value interpreted as a little-endian
    /// f64, creating it when absent. Returns the new total.
    pub fn add_double(&self, key: &[u8], amount: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        let current = match inner.fetch_value(key)? {
            Some(bytes) => Some(decode_f64(&bytes)?),
            None => None,
        };
        let total = current.unwrap_or(0.0) + amount;
        inner.put_impl(key, &total.to_le_bytes(), PutMode::Overwrite)?;
        Ok(total)
    }

    /// Iterates over every record in unspecified order.
    ///
    /// The iterator locks the store for each step; calling mutating methods
    /// from the same thread mid-iteration deadlocks.
    pub fn iter(&self) -> HashIter {
        HashIter {
            db: self.clone(),
            next_page: 1,
            next_slot: 0,
        }
    }

    /// Flushes dirty pages and fsyncs the file.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().kernel.sync()
    }

    /// Copies the database file to `dest` after syncing.
    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        self.inner.lock().copy_impl(dest.as_ref())
    }

    /// Rebuilds the file, reclaiming dead space. A new bucket count may be
    /// supplied; otherwise the current one is kept.
    pub fn optimize(&self, bucket_count: Option<u32>) -> Result<()> {
        self.inner.lock().optimize_impl(bucket_count)
    }

    /// Removes every record.
    pub fn vanish(&self) -> Result<()> {
        self.inner.lock().vanish_impl()
    }

    pub fn tran_begin(&self) -> Result<()> {
        self.inner.lock().kernel.tran_begin()
    }

    pub fn tran_commit(&self) -> Result<()> {
        self.inner.lock().kernel.tran_commit()
    }

    pub fn tran_abort(&self) -> Result<()> {
        self.inner.lock().abort_impl()
    }

    /// Number of live records.
    pub fn rnum(&self) -> u64 {
        self.inner.lock().kernel.header.rnum
    }

    /// Size of the database file in bytes.
    pub fn fsiz(&self) -> u64 {
        self.inner.lock().kernel.file_size()
    }

    pub fn stats(&self) -> Result<Stats> {
        self.inner.lock().kernel.stats()
    }
}

struct HashInner {
    kernel: Kernel,
    mode: OpenMode,
    config: Config,
    /// Page most recently appended to; fresh inserts try it first.
    insert_hint: Option<PageId>,
    cache: Option<LruCache<Vec<u8>, Vec<u8>>>,
}

impl HashInner {
    fn open(path: &Path, mode: OpenMode, config: &Config) -> Result<Self> {
        let kernel = Kernel::open(path, mode, config, StoreKind::Hash)?;
        let cache = NonZeroUsize::new(config.record_cache).map(LruCache::new);
        let mut inner = Self {
            kernel,
            mode,
            config: *config,
            insert_hint: None,
            cache,
        };
        inner.init_directory()?;
        Ok(inner)
    }

    /// Lays out the bucket directory on a freshly created file.
    fn init_directory(&mut self) -> Result<()> {
        if self.kernel.header.bucket_count != 0 {
            return Ok(());
        }
        if !self.kernel.writable() {
            return Err(TansuError::Corruption(
                "hash store has no bucket directory".into(),
            ));
        }
        let bucket_count = self.config.bucket_count.max(1);
        let per_page = self.entries_per_dir_page() as u32;
        let dir_pages = bucket_count.div_ceil(per_page);
        for index in 0..dir_pages {
            let id = self.kernel.alloc_page(PageKind::BucketDir)?;
            if id != index + 1 {
                return Err(TansuError::Corruption(
                    "bucket directory pages are not contiguous".into(),
                ));
            }
        }
        self.kernel.header.bucket_count = bucket_count;
        self.kernel.header.dir_pages = dir_pages;
        self.kernel.sync()?;
        debug!(bucket_count, dir_pages, "initialized bucket directory");
        Ok(())
    }

    fn entries_per_dir_page(&self) -> usize {
        (self.kernel.page_size() - DIR_HEADER_SIZE - PAGE_CHECKSUM_SIZE) / BUCKET_ENTRY_SIZE
    }

    fn bucket_index(&self, key: &[u8]) -> u32 {
        (xxh64(key, 0) % self.kernel.header.bucket_count as u64) as u32
    }

    fn bucket_location(&self, bucket: u32) -> (PageId, usize) {
        let per_page = self.entries_per_dir_page() as u32;
        let page = 1 + bucket / per_page;
        let offset = DIR_HEADER_SIZE + (bucket % per_page) as usize * BUCKET_ENTRY_SIZE;
        (page, offset)
    }

    fn read_bucket(&mut self, bucket: u32) -> Result<RecordPtr> {
        let (page_id, offset) = self.bucket_location(bucket);
        let page = self.kernel.page(page_id)?;
        let data = &page.data;
        Ok(RecordPtr {
            page: u32::from_le_bytes([
                data[offset],
                data[offset + 1],
                data[offset + 2],
                data[offset + 3],
            ]),
            slot: u16::from_le_bytes([data[offset + 4], data[offset + 5]]),
        })
    }

    fn write_bucket(&mut self, bucket: u32, ptr: RecordPtr) -> Result<()> {
        let (page_id, offset) = self.bucket_location(bucket);
        let page = self.kernel.page_mut(page_id)?;
        page.data[offset..offset + 4].copy_from_slice(&ptr.page.to_le_bytes());
        page.data[offset + 4..offset + 6].copy_from_slice(&ptr.slot.to_le_bytes());
        Ok(())
    }

    fn read_record(&mut self, ptr: RecordPtr) -> Result<HashRecord> {
        let page = self.kernel.pager.fetch_page(ptr.page)?;
        let rp = RecordPage::from_bytes(&mut page.data)?;
        if rp.kind() != PageKind::Record as u8 {
            return Err(TansuError::Corruption(
                "bucket chain points at a non-record page".into(),
            ));
        }
        let slot = rp.slot(ptr.slot as usize)?.ok_or_else(|| {
            TansuError::Corruption("bucket chain points at a freed slot".into())
        })?;
        HashRecord::decode(slot)
    }

    /// Walks a bucket chain looking for `key`. Returns the predecessor (for
    /// unlinking), the record's location, and the record itself.
    fn find_in_bucket(
        &mut self,
        bucket: u32,
        key: &[u8],
    ) -> Result<Option<(Option<RecordPtr>, RecordPtr, HashRecord)>> {
        let mut prev = None;
        let mut current = self.read_bucket(bucket)?;
        while !current.is_nil() {
            let record = self.read_record(current)?;
            if record.key == key {
                return Ok(Some((prev, current, record)));
            }
            prev = Some(current);
            current = record.next;
        }
        Ok(None)
    }

    fn resolve_value(&mut self, record: &HashRecord) -> Result<Vec<u8>> {
        match &record.value {
            RecordValue::Inline(value) => Ok(value.clone()),
            RecordValue::Spilled { first, total_len } => {
                self.kernel.read_spilled(*first, *total_len)
            }
        }
    }

    /// Looks up a value, bypassing the record cache.
    fn fetch_value(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let bucket = self.bucket_index(key);
        match self.find_in_bucket(bucket, key)? {
            Some((_, _, record)) => Ok(Some(self.resolve_value(&record)?)),
            None => Ok(None),
        }
    }

    fn get_impl(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if let Some(cache) = &mut self.cache {
            if let Some(value) = cache.get(key) {
                return Ok(Some(value.clone()));
            }
        }
        let value = self.fetch_value(key)?;
        if let (Some(cache), Some(value)) = (&mut self.cache, &value) {
            cache.put(key.to_vec(), value.clone());
        }
        Ok(value)
    }

    /// Largest record that fits in an empty slotted page.
    fn max_record_len(&self) -> usize {
        self.kernel.page_size() - PAGE_CHECKSUM_SIZE - PAGE_HEADER_SIZE - 8
    }

    /// Builds a record, spilling the value to an overflow chain when it is
    /// large relative to the page size.
    fn make_record(&mut self, key: &[u8], value: &[u8], next: RecordPtr) -> Result<HashRecord> {
        let max = self.max_record_len().min(u16::MAX as usize);
        if RECORD_HEADER_SIZE + key.len() + SPILL_POINTER_SIZE > max {
            return Err(TansuError::InvalidArgument(
                "key too large for the page size".into(),
            ));
        }
        let inline_len = RECORD_HEADER_SIZE + key.len() + value.len();
        if value.len() > self.kernel.spill_threshold() || inline_len > max {
            let first = self.kernel.spill_value(value)?;
            Ok(HashRecord::spilled(
                next,
                key.to_vec(),
                first,
                value.len() as u64,
            ))
        } else {
            Ok(HashRecord::inline(next, key.to_vec(), value.to_vec()))
        }
    }

    /// Places an encoded record in a page with room, extending the file
    /// when necessary.
    fn insert_record(&mut self, record: &HashRecord) -> Result<RecordPtr> {
        let bytes = record.encode()?;
        if let Some(hint) = self.insert_hint {
            let page = self.kernel.page_mut(hint)?;
            let mut rp = RecordPage::from_bytes(&mut page.data)?;
            if rp.kind() == PageKind::Record as u8 && rp.can_fit(bytes.len())? {
                let slot = rp.append(&bytes)?;
                return Ok(RecordPtr { page: hint, slot });
            }
        }
        let id = self.kernel.alloc_page(PageKind::Record)?;
        let page = self.kernel.page_mut(id)?;
        let mut rp = RecordPage::from_bytes(&mut page.data)?;
        rp.init(PageKind::Record);
        let slot = rp.append(&bytes)?;
        self.insert_hint = Some(id);
        Ok(RecordPtr { page: id, slot })
    }

    /// Redirects the chain link of `ptr` to `next`. The link prefix is
    /// fixed-size, so this always succeeds in place.
    fn patch_next(&mut self, ptr: RecordPtr, next: RecordPtr) -> Result<()> {
        let page = self.kernel.page_mut(ptr.page)?;
        let mut rp = RecordPage::from_bytes(&mut page.data)?;
        let slot = rp.slot_mut(ptr.slot as usize)?.ok_or_else(|| {
            TansuError::Corruption("chain predecessor slot is freed".into())
        })?;
        slot[0..4].copy_from_slice(&next.page.to_le_bytes());
        slot[4..6].copy_from_slice(&next.slot.to_le_bytes());
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.kernel.writable() {
            Ok(())
        } else {
            Err(TansuError::ReadOnly)
        }
    }

    fn put_impl(&mut self, key: &[u8], value: &[u8], mode: PutMode) -> Result<()> {
        self.ensure_writable()?;
        let bucket = self.bucket_index(key);
        match self.find_in_bucket(bucket, key)? {
            Some((prev, ptr, old)) => {
                if mode == PutMode::Keep {
                    return Err(TansuError::KeyExists);
                }
                let new_value = if mode == PutMode::Cat {
                    let mut joined = self.resolve_value(&old)?;
                    joined.extend_from_slice(value);
                    joined
                } else {
                    value.to_vec()
                };
                if let RecordValue::Spilled { first, .. } = old.value {
                    self.kernel.free_spilled(first)?;
                }
                let record = self.make_record(key, &new_value, old.next)?;
                let bytes = record.encode()?;
                let updated = {
                    let page = self.kernel.page_mut(ptr.page)?;
                    let mut rp = RecordPage::from_bytes(&mut page.data)?;
                    rp.update(ptr.slot as usize, &bytes)?
                };
                if !updated {
                    {
                        let page = self.kernel.page_mut(ptr.page)?;
                        let mut rp = RecordPage::from_bytes(&mut page.data)?;
                        rp.free_slot(ptr.slot as usize)?;
                    }
                    let new_ptr = self.insert_record(&record)?;
                    match prev {
                        Some(prev) => self.patch_next(prev, new_ptr)?,
                        None => self.write_bucket(bucket, new_ptr)?,
                    }
                }
                if let Some(cache) = &mut self.cache {
                    cache.put(key.to_vec(), new_value);
                }
            }
            None => {
                let head = self.read_bucket(bucket)?;
                let record = self.make_record(key, value, head)?;
                let ptr = self.insert_record(&record)?;
                self.write_bucket(bucket, ptr)?;
                self.kernel.header.rnum += 1;
                if let Some(cache) = &mut self.cache {
                    cache.put(key.to_vec(), value.to_vec());
                }
            }
        }
        self.kernel.after_write()
    }

    fn out_impl(&mut self, key: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        let bucket = self.bucket_index(key);
        let (prev, ptr, record) = match self.find_in_bucket(bucket, key)? {
            Some(found) => found,
            None => return Ok(false),
        };
        match prev {
            Some(prev) => self.patch_next(prev, record.next)?,
            None => self.write_bucket(bucket, record.next)?,
        }
        if let RecordValue::Spilled { first, .. } = record.value {
            self.kernel.free_spilled(first)?;
        }
        let now_empty = {
            let page = self.kernel.page_mut(ptr.page)?;
            let mut rp = RecordPage::from_bytes(&mut page.data)?;
            rp.free_slot(ptr.slot as usize)?;
            rp.live_records()? == 0
        };
        if now_empty {
            self.kernel.free_page(ptr.page)?;
            if self.insert_hint == Some(ptr.page) {
                self.insert_hint = None;
            }
        }
        self.kernel.header.rnum -= 1;
        if let Some(cache) = &mut self.cache {
            cache.pop(key);
        }
        self.kernel.after_write()?;
        Ok(true)
    }

    /// All records in one page, decoded. Empty for non-record pages.
    fn page_records(&mut self, id: PageId) -> Result<Vec<HashRecord>> {
        let page = self.kernel.pager.fetch_page(id)?;
        if page.data[0] != PageKind::Record as u8 {
            return Ok(Vec::new());
        }
        let rp = RecordPage::from_bytes(&mut page.data)?;
        let mut records = Vec::new();
        for slot in 0..rp.slot_count() as usize {
            if let Some(bytes) = rp.slot(slot)? {
                records.push(HashRecord::decode(bytes)?);
            }
        }
        Ok(records)
    }

    fn fwmkeys_impl(&mut self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let cap = max.unwrap_or(usize::MAX);
        let mut keys = Vec::new();
        for id in 1..self.kernel.pager.page_count() {
            for record in self.page_records(id)? {
                if record.key.starts_with(prefix) {
                    keys.push(record.key);
                    if keys.len() >= cap {
                        return Ok(keys);
                    }
                }
            }
        }
        Ok(keys)
    }

    fn copy_impl(&mut self, dest: &Path) -> Result<()> {
        if self.kernel.in_transaction() {
            return Err(TansuError::InvalidArgument(
                "cannot copy inside a transaction".into(),
            ));
        }
        self.kernel.sync()?;
        std::fs::copy(self.kernel.path(), dest)?;
        Ok(())
    }

    fn optimize_impl(&mut self, bucket_count: Option<u32>) -> Result<()> {
        self.ensure_writable()?;
        if self.kernel.in_transaction() {
            return Err(TansuError::InvalidArgument(
                "cannot optimize inside a transaction".into(),
            ));
        }
        self.kernel.sync()?;
        let path = self.kernel.path().to_path_buf();
        let mut tmp_name = path.as_os_str().to_os_string();
        tmp_name.push(".opt");
        let tmp_path = PathBuf::from(tmp_name);

        let mut tmp_config = self.config;
        tmp_config.bucket_count = bucket_count.unwrap_or(self.kernel.header.bucket_count);
        tmp_config.page_size = self.kernel.header.page_size;
        tmp_config.sync_writes = false;
        let mut rebuilt = HashInner::open(
            &tmp_path,
            OpenMode::writer().truncate(),
            &tmp_config,
        )?;
        for id in 1..self.kernel.pager.page_count() {
            for record in self.page_records(id)? {
                let value = self.resolve_value(&record)?;
                rebuilt.put_impl(&record.key, &value, PutMode::Overwrite)?;
            }
        }
        rebuilt.kernel.sync()?;
        drop(rebuilt);

        std::fs::rename(&tmp_path, &path)?;
        let mut mode = self.mode;
        mode.truncate = false;
        let mut config = self.config;
        if let Some(count) = bucket_count {
            config.bucket_count = count;
        }
        info!(path = %path.display(), "rebuilt hash store");
        *self = HashInner::open(&path, mode, &config)?;
        Ok(())
    }

    fn vanish_impl(&mut self) -> Result<()> {
        self.ensure_writable()?;
        self.kernel.reset()?;
        self.insert_hint = None;
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        self.init_directory()?;
        self.kernel.sync()
    }

    fn abort_impl(&mut self) -> Result<()> {
        self.kernel.tran_abort()?;
        self.insert_hint = None;
        if let Some(cache) = &mut self.cache {
            cache.clear();
        }
        Ok(())
    }
}

/// Iterator over all records of a [`HashDb`], in file order.
pub struct HashIter {
    db: HashDb,
    next_page: PageId,
    next_slot: u16,
}

impl Iterator for HashIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut inner = self.db.inner.lock();
        loop {
            if self.next_page >= inner.kernel.pager.page_count() {
                return None;
            }
            let step = step_page(&mut inner, self.next_page, self.next_slot);
            match step {
                Ok(Some((slot, record))) => {
                    self.next_slot = slot + 1;
                    let value = match inner.resolve_value(&record) {
                        Ok(value) => value,
                        Err(err) => return Some(Err(err)),
                    };
                    return Some(Ok((record.key, value)));
                }
                Ok(None) => {
                    self.next_page += 1;
                    self.next_slot = 0;
                }
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

/// Finds the next live record in `page` at or after `slot`.
fn step_page(
    inner: &mut HashInner,
    page_id: PageId,
    start_slot: u16,
) -> Result<Option<(u16, HashRecord)>> {
    let page = inner.kernel.pager.fetch_page(page_id)?;
    if page.data[0] != PageKind::Record as u8 {
        return Ok(None);
    }
    let rp = RecordPage::from_bytes(&mut page.data)?;
    for slot in start_slot..rp.slot_count() {
        if let Some(bytes) = rp.slot(slot as usize)? {
            return Ok(Some((slot, HashRecord::decode(bytes)?)));
        }
    }
    Ok(None)
}

fn decode_i64(bytes: &[u8]) -> Result<i64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        TansuError::InvalidArgument("existing value is not an 8-byte integer".into())
    })?;
    Ok(i64::from_le_bytes(array))
}

fn decode_f64(bytes: &[u8]) -> Result<f64> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| {
        TansuError::InvalidArgument("existing value is not an 8-byte float".into())
    })?;
    Ok(f64::from_le_bytes(array))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(name);
        (dir, path)
    }

    #[test]
    fn put_get_out() {
        let (_dir, path) = scratch("h.db");
        let db = HashDb::open(&path, OpenMode::writer()).expect("open");
        db.put(b"alpha", b"1").expect("put");
        db.put(b"beta", b"2").expect("put");
        assert_eq!(db.get(b"alpha").expect("get"), Some(b"1".to_vec()));
        assert_eq!(db.rnum(), 2);
        assert!(db.out(b"alpha").expect("out"));
        assert!(!db.out(b"alpha").expect("out again"));
        assert_eq!(db.get(b"alpha").expect("get"), None);
        assert_eq!(db.rnum(), 1);
    }

    #[test]
    fn put_keep_preserves_existing() {
        let (_dir, path) = scratch("keep.db");
        let db = HashDb::open(&path, OpenMode::writer()).expect("open");
        db.put(b"k", b"original").expect("put");
        assert!(matches!(
            db.put_keep(b"k", b"replacement"),
            Err(TansuError::KeyExists)
        ));
        assert_eq!(db.get(b"k").expect("get"), Some(b"original".to_vec()));
    }

    #[test]
    fn put_cat_appends() {
        let (_dir, path) = scratch("cat.db");
        let db = HashDb::open(&path, OpenMode::writer()).expect("open");
        db.put_cat(b"log", b"first").expect("cat creates");
        db.put_cat(b"log", b",second").expect("cat appends");
        assert_eq!(db.get(b"log").expect("get"), Some(b"first,second".to_vec()));
        assert_eq!(db.rnum(), 1);
    }

    #[test]
    fn counters() {
        let (_dir, path) = scratch("n.db");
        let db = HashDb::open(&path, OpenMode::writer()).expect("open");
        assert_eq!(db.add_int(b"hits", 3).expect("add"), 3);
        assert_eq!(db.add_int(b"hits", -1).expect("add"), 2);
        assert!((db.add_double(b"score", 1.5).expect("add") - 1.5).abs() < 1e-9);
        assert!((db.add_double(b"score", 2.0).expect("add") - 3.5).abs() < 1e-9);
        // Counters only check the stored width, so a value that is not
        // 8 bytes is rejected by either flavor.
        db.put(b"text", b"abc").expect("put");
        assert!(db.add_int(b"text", 1).is_err());
        assert!(db.add_double(b"text", 1.0).is_err());
    }
}
