//! Column-record store.
//!
//! A table record is a primary key plus a map of named string columns,
//! serialized into the value of an ordered (lexical) btree. Secondary
//! indexes are separate btree files next to the primary
//! (`<path>.idx.<column>.<kind>`), discovered on open and maintained
//! transparently by every write.
//!
//! Index entries map `encoded(column value) ++ 0x00 ++ pkey` to the pkey,
//! so equal column values stay distinguishable and scans come back in
//! column order. A [`IndexKind::Decimal`] index encodes the value so that
//! lexical order matches numeric order.

mod columns;
mod query;

pub use query::{Cond, MetaOp, Order, Query};

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::btree::BtreeDb;
use crate::config::{Comparator, Config, OpenMode};
use crate::error::{Result, TansuError};
use crate::storage::Stats;

use columns::{atof, atoi, decode_columns, encode_columns, encode_decimal};

/// Reserved column used by [`TableDb::add_int`] and [`TableDb::add_double`].
pub const NUM_COLUMN: &str = "_num";

/// How a secondary index orders its column values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum IndexKind {
    /// Bytewise string order.
    Lexical,
    /// Numeric order over the parsed value.
    Decimal,
}

impl IndexKind {
    fn suffix(self) -> &'static str {
        match self {
            IndexKind::Lexical => "lex",
            IndexKind::Decimal => "dec",
        }
    }

    fn from_suffix(suffix: &str) -> Option<Self> {
        match suffix {
            "lex" => Some(IndexKind::Lexical),
            "dec" => Some(IndexKind::Decimal),
            _ => None,
        }
    }
}

pub(crate) struct TableIndex {
    pub(crate) kind: IndexKind,
    pub(crate) db: BtreeDb,
}

/// Handle to a table store.
#[derive(Clone)]
pub struct TableDb {
    pub(crate) inner: Arc<Mutex<TableInner>>,
}

impl std::fmt::Debug for TableDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableDb").finish_non_exhaustive()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum PutMode {
    Overwrite,
    Keep,
    Cat,
}

impl TableDb {
    /// Opens a table store with the default configuration.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with(path, mode, Config::default())
    }

    /// Opens a table store with explicit tuning.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: Config) -> Result<Self> {
        let inner = TableInner::open(path.as_ref(), mode, &config)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Flushes everything and drops this handle.
    pub fn close(self) -> Result<()> {
        self.inner.lock().sync_all()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    /// Stores a record, replacing any existing one under the primary key.
    pub fn put(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> Result<()> {
        self.inner.lock().put_impl(pkey, cols, PutMode::Overwrite)
    }

    /// Stores a record only if the primary key is absent.
    pub fn put_keep(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> Result<()> {
        self.inner.lock().put_impl(pkey, cols, PutMode::Keep)
    }

    /// Merges columns into an existing record; on a name clash the stored
    /// value wins. Creates the record when absent.
    pub fn put_cat(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> Result<()> {
        self.inner.lock().put_impl(pkey, cols, PutMode::Cat)
    }

    /// Removes a record. Returns false when the primary key was absent.
    pub fn out(&self, pkey: &[u8]) -> Result<bool> {
        self.inner.lock().out_impl(pkey)
    }

    pub fn get(&self, pkey: &[u8]) -> Result<Option<BTreeMap<String, String>>> {
        self.inner.lock().get_cols(pkey)
    }

    /// Size of the serialized column map.
    pub fn vsiz(&self, pkey: &[u8]) -> Result<Option<u64>> {
        self.inner.lock().primary.vsiz(pkey)
    }

    /// Primary keys beginning with `prefix`, in order.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        self.inner.lock().primary.fwmkeys(prefix, max)
    }

    /// Adds `amount` to the record's `_num` column, creating the record or
    /// column as needed. Returns the new total.
    pub fn add_int(&self, pkey: &[u8], amount: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        let mut cols = inner.get_cols(pkey)?.unwrap_or_default();
        let current = cols.get(NUM_COLUMN).map(|v| atoi(v)).unwrap_or(0);
        let total = current.wrapping_add(amount);
        cols.insert(NUM_COLUMN.to_string(), total.to_string());
        inner.put_impl(pkey, &cols, PutMode::Overwrite)?;
        Ok(total)
    }

    /// Adds `amount` to the record's `_num` column as a decimal number.
    pub fn add_double(&self, pkey: &[u8], amount: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        let mut cols = inner.get_cols(pkey)?.unwrap_or_default();
        let current = cols.get(NUM_COLUMN).map(|v| atof(v)).unwrap_or(0.0);
        let total = current + amount;
        cols.insert(NUM_COLUMN.to_string(), total.to_string());
        inner.put_impl(pkey, &cols, PutMode::Overwrite)?;
        Ok(total)
    }

    /// Creates (or rebuilds) a secondary index on a column, populating it
    /// from the existing records.
    pub fn set_index(&self, column: &str, kind: IndexKind) -> Result<()> {
        self.inner.lock().set_index_impl(column, kind, false)
    }

    /// Like [`TableDb::set_index`] but fails when the index already exists.
    pub fn set_index_keep(&self, column: &str, kind: IndexKind) -> Result<()> {
        self.inner.lock().set_index_impl(column, kind, true)
    }

    /// Drops a secondary index and deletes its file. Returns false when no
    /// such index exists.
    pub fn remove_index(&self, column: &str) -> Result<bool> {
        self.inner.lock().remove_index_impl(column)
    }

    /// Columns currently indexed, with their kinds.
    pub fn indexed_columns(&self) -> Vec<(String, IndexKind)> {
        self.inner
            .lock()
            .indexes
            .iter()
            .map(|(col, index)| (col.clone(), index.kind))
            .collect()
    }

    /// Hands out a fresh unique id, persisted across reopens.
    pub fn gen_uid(&self) -> Result<u64> {
        self.inner.lock().primary.gen_uid()
    }

    /// Starts building a query against this table.
    pub fn query(&self) -> Query {
        Query::new(self.clone())
    }

    /// Flushes the primary and every index file.
    pub fn sync(&self) -> Result<()> {
        self.inner.lock().sync_all()
    }

    /// Copies the primary database file to `dest`. Index files are not
    /// copied; rebuild them with `set_index` on the copy.
    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        self.inner.lock().primary.copy(dest)
    }

    /// Rebuilds the primary and every index file compactly.
    pub fn optimize(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.primary.optimize()?;
        for index in inner.indexes.values() {
            index.db.optimize()?;
        }
        Ok(())
    }

    /// Removes every record, keeping index definitions.
    pub fn vanish(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.primary.vanish()?;
        for index in inner.indexes.values() {
            index.db.vanish()?;
        }
        Ok(())
    }

    /// Begins a transaction spanning the primary and all index files.
    pub fn tran_begin(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.primary.tran_begin()?;
        let mut started: Vec<BtreeDb> = Vec::new();
        for index in inner.indexes.values() {
            if let Err(err) = index.db.tran_begin() {
                for db in &started {
                    let _ = db.tran_abort();
                }
                let _ = inner.primary.tran_abort();
                return Err(err);
            }
            started.push(index.db.clone());
        }
        Ok(())
    }

    pub fn tran_commit(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.primary.tran_commit()?;
        for index in inner.indexes.values() {
            index.db.tran_commit()?;
        }
        Ok(())
    }

    pub fn tran_abort(&self) -> Result<()> {
        let inner = self.inner.lock();
        inner.primary.tran_abort()?;
        for index in inner.indexes.values() {
            index.db.tran_abort()?;
        }
        Ok(())
    }

    /// Number of records.
    pub fn rnum(&self) -> u64 {
        self.inner.lock().primary.rnum()
    }

    /// Size of the primary database file in bytes.
    pub fn fsiz(&self) -> u64 {
        self.inner.lock().primary.fsiz()
    }

    pub fn stats(&self) -> Result<Stats> {
        self.inner.lock().primary.stats()
    }
}

pub(crate) struct TableInner {
    pub(crate) primary: BtreeDb,
    pub(crate) indexes: BTreeMap<String, TableIndex>,
    path: PathBuf,
    mode: OpenMode,
    config: Config,
}

impl TableInner {
    fn open(path: &Path, mode: OpenMode, config: &Config) -> Result<Self> {
        let mut primary_config = *config;
        primary_config.comparator = Comparator::Lexical;
        if mode.write && mode.truncate {
            remove_index_files(path)?;
        }
        let primary = BtreeDb::open_with(path, mode, primary_config)?;
        let indexes = discover_indexes(path, mode, config)?;
        if !indexes.is_empty() {
            debug!(
                path = %path.display(),
                count = indexes.len(),
                "opened table with secondary indexes"
            );
        }
        Ok(Self {
            primary,
            indexes,
            path: path.to_path_buf(),
            mode,
            config: *config,
        })
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.mode.write {
            Ok(())
        } else {
            Err(TansuError::ReadOnly)
        }
    }

    pub(crate) fn get_cols(&mut self, pkey: &[u8]) -> Result<Option<BTreeMap<String, String>>> {
        match self.primary.get(pkey)? {
            Some(raw) => Ok(Some(decode_columns(&raw)?)),
            None => Ok(None),
        }
    }

    fn index_record(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> Result<()> {
        for (column, index) in &self.indexes {
            if let Some(value) = cols.get(column) {
                let key = index_entry_key(index.kind, value, pkey);
                index.db.put_dup(&key, pkey)?;
            }
        }
        Ok(())
    }

    fn deindex_record(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> Result<()> {
        for (column, index) in &self.indexes {
            if let Some(value) = cols.get(column) {
                let key = index_entry_key(index.kind, value, pkey);
                index.db.out_dup_value(&key, pkey)?;
            }
        }
        Ok(())
    }

    fn put_impl(
        &mut self,
        pkey: &[u8],
        cols: &BTreeMap<String, String>,
        mode: PutMode,
    ) -> Result<()> {
        self.ensure_writable()?;
        let old = self.get_cols(pkey)?;
        if mode == PutMode::Keep && old.is_some() {
            return Err(TansuError::KeyExists);
        }
        let merged = match (&old, mode) {
            (Some(old_cols), PutMode::Cat) => {
                let mut merged = cols.clone();
                for (name, value) in old_cols {
                    merged.insert(name.clone(), value.clone());
                }
                merged
            }
            _ => cols.clone(),
        };
        if let Some(old_cols) = &old {
            self.deindex_record(pkey, old_cols)?;
        }
        self.primary.put(pkey, &encode_columns(&merged))?;
        self.index_record(pkey, &merged)?;
        Ok(())
    }

    fn out_impl(&mut self, pkey: &[u8]) -> Result<bool> {
        self.ensure_writable()?;
        let old = match self.get_cols(pkey)? {
            Some(cols) => cols,
            None => return Ok(false),
        };
        self.deindex_record(pkey, &old)?;
        self.primary.out(pkey)
    }

    fn index_path(&self, column: &str, kind: IndexKind) -> PathBuf {
        index_path_for(&self.path, column, kind)
    }

    fn index_config(&self) -> Config {
        let mut config = self.config;
        config.comparator = Comparator::Lexical;
        config
    }

    fn set_index_impl(&mut self, column: &str, kind: IndexKind, keep: bool) -> Result<()> {
        self.ensure_writable()?;
        if column.is_empty() {
            return Err(TansuError::InvalidArgument(
                "the primary key is already ordered; index a named column".into(),
            ));
        }
        if self.indexes.contains_key(column) {
            if keep {
                return Err(TansuError::KeyExists);
            }
            self.remove_index_impl(column)?;
        }
        let path = self.index_path(column, kind);
        let db = BtreeDb::open_with(
            &path,
            OpenMode::writer().truncate(),
            self.index_config(),
        )?;
        for item in self.primary.iter() {
            let (pkey, raw) = item?;
            let cols = decode_columns(&raw)?;
            if let Some(value) = cols.get(column) {
                db.put_dup(&index_entry_key(kind, value, &pkey), &pkey)?;
            }
        }
        db.sync()?;
        info!(column, kind = kind.suffix(), "built secondary index");
        self.indexes
            .insert(column.to_string(), TableIndex { kind, db });
        Ok(())
    }

    fn remove_index_impl(&mut self, column: &str) -> Result<bool> {
        self.ensure_writable()?;
        match self.indexes.remove(column) {
            Some(index) => {
                let path = self.index_path(column, index.kind);
                drop(index);
                std::fs::remove_file(&path)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn sync_all(&mut self) -> Result<()> {
        if self.mode.write {
            self.primary.sync()?;
            for index in self.indexes.values() {
                index.db.sync()?;
            }
        }
        Ok(())
    }
}

/// Key of one index entry: the encoded column value, a NUL separator, and
/// the primary key to keep equal values distinct.
pub(crate) fn index_entry_key(kind: IndexKind, value: &str, pkey: &[u8]) -> Vec<u8> {
    let mut key = encode_index_value(kind, value);
    key.push(0);
    key.extend_from_slice(pkey);
    key
}

pub(crate) fn encode_index_value(kind: IndexKind, value: &str) -> Vec<u8> {
    match kind {
        IndexKind::Lexical => value.as_bytes().to_vec(),
        IndexKind::Decimal => encode_decimal(atof(value)).to_vec(),
    }
}

fn index_path_for(base: &Path, column: &str, kind: IndexKind) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(format!(".idx.{}.{}", column, kind.suffix()));
    PathBuf::from(name)
}

fn remove_index_files(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => return Ok(()),
    };
    let prefix = format!("{file_name}.idx.");
    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.strip_prefix(&prefix).is_some_and(valid_index_suffix) {
            std::fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn valid_index_suffix(rest: &str) -> bool {
    rest.rsplit_once('.')
        .map(|(_, suffix)| IndexKind::from_suffix(suffix).is_some())
        .unwrap_or(false)
}

fn discover_indexes(
    path: &Path,
    mode: OpenMode,
    config: &Config,
) -> Result<BTreeMap<String, TableIndex>> {
    let mut indexes = BTreeMap::new();
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = match path.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => {
            return Err(TansuError::InvalidArgument(
                "table path has no file name".into(),
            ))
        }
    };
    let prefix = format!("{file_name}.idx.");
    let entries = match std::fs::read_dir(parent) {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(indexes),
        Err(err) => return Err(err.into()),
    };
    let mut index_mode = mode;
    index_mode.truncate = false;
    let mut index_config = *config;
    index_config.comparator = Comparator::Lexical;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let rest = match name.strip_prefix(&prefix) {
            Some(rest) => rest,
            None => continue,
        };
        let (column, suffix) = match rest.rsplit_once('.') {
            Some(split) => split,
            None => continue,
        };
        let kind = match IndexKind::from_suffix(suffix) {
            Some(kind) => kind,
            None => continue,
        };
        let db = BtreeDb::open_with(entry.path(), index_mode, index_config)?;
        indexes.insert(column.to_string(), TableIndex { kind, db });
    }
    Ok(indexes)
}
