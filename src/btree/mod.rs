//! Ordered key-value store (B+tree).
//!
//! Records live in leaf pages chained into a doubly linked list; internal
//! pages route by separator keys. Duplicate keys are allowed through
//! [`BtreeDb::put_dup`] and keep their insertion order. Key order is
//! decided by the store's [`Comparator`](crate::config::Comparator), fixed
//! at creation.
//!
//! Deletion never rebalances: a leaf that empties out stays in the chain
//! and is skipped by traversal. `optimize` rebuilds the file compactly.

mod cursor;
mod node;

pub use cursor::{Cursor, CursorPutMode};

use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::{Config, OpenMode};
use crate::error::{Result, TansuError};
use crate::pager::PageId;
use crate::storage::record::RecordValue;
use crate::storage::{Kernel, PageKind, Stats, StoreKind};

use node::{InternalNode, LeafEntry, LeafNode, Node};

/// Where an insert lands among entries with an equal key.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum DupPos {
    First,
    Last,
}

/// Handle to an ordered key-value store.
#[derive(Clone)]
pub struct BtreeDb {
    pub(crate) inner: Arc<Mutex<BtreeInner>>,
}

impl std::fmt::Debug for BtreeDb {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BtreeDb").finish_non_exhaustive()
    }
}

impl BtreeDb {
    /// Opens a btree store with the default configuration.
    pub fn open(path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        Self::open_with(path, mode, Config::default())
    }

    /// Opens a btree store with explicit tuning.
    pub fn open_with(path: impl AsRef<Path>, mode: OpenMode, config: Config) -> Result<Self> {
        let inner = BtreeInner::open(path.as_ref(), mode, &config)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(inner)),
        })
    }

    /// Flushes the store and drops this handle.
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

    /// Stores a record, replacing the first existing record of the key.
    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put_overwrite(key, value, false)
    }

    /// Stores a record only if the key is absent.
    pub fn put_keep(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.check_key(key)?;
        if let Some((leaf, idx)) = inner.seek(key)? {
            if inner.exact_at(leaf, idx, key)? {
                return Err(TansuError::KeyExists);
            }
        }
        let value = inner.make_value(value)?;
        inner.insert_entry(key, value, DupPos::First)?;
        inner.kernel.header.rnum += 1;
        inner.kernel.after_write()
    }

    /// Appends `value` to the first record of the key, creating it when
    /// absent.
    pub fn put_cat(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner.lock().put_overwrite(key, value, true)
    }

    /// Stores a record after any existing records of the same key.
    pub fn put_dup(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.check_key(key)?;
        let value = inner.make_value(value)?;
        inner.insert_entry(key, value, DupPos::Last)?;
        inner.kernel.header.rnum += 1;
        inner.kernel.after_write()
    }

    /// Value of the first record of the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let mut inner = self.inner.lock();
        match inner.seek_exact(key)? {
            Some((leaf, idx)) => {
                let entry = inner.entry_at(leaf, idx)?.ok_or_else(|| {
                    TansuError::Corruption("seek returned a vanished entry".into())
                })?;
                Ok(Some(inner.resolve_value(&entry.value)?))
            }
            None => Ok(None),
        }
    }

    /// All values stored under the key, in insertion order.
    pub fn get_dup(&self, key: &[u8]) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let mut values = Vec::new();
        let mut pos = inner.seek_exact(key)?;
        while let Some((leaf, idx)) = pos {
            let entry = match inner.entry_at(leaf, idx)? {
                Some(entry) => entry,
                None => break,
            };
            if inner.cmp(&entry.key, key) != Ordering::Equal {
                break;
            }
            values.push(inner.resolve_value(&entry.value)?);
            pos = inner.next_pos(leaf, idx)?;
        }
        Ok(values)
    }

    /// Number of records stored under the key.
    pub fn vnum(&self, key: &[u8]) -> Result<u64> {
        let mut inner = self.inner.lock();
        let mut count = 0;
        let mut pos = inner.seek_exact(key)?;
        while let Some((leaf, idx)) = pos {
            let entry = match inner.entry_at(leaf, idx)? {
                Some(entry) => entry,
                None => break,
            };
            if inner.cmp(&entry.key, key) != Ordering::Equal {
                break;
            }
            count += 1;
            pos = inner.next_pos(leaf, idx)?;
        }
        Ok(count)
    }

    /// Size of the first record's value.
    pub fn vsiz(&self, key: &[u8]) -> Result<Option<u64>> {
        let mut inner = self.inner.lock();
        match inner.seek_exact(key)? {
            Some((leaf, idx)) => Ok(inner.entry_at(leaf, idx)?.map(|entry| match entry.value {
                RecordValue::Inline(value) => value.len() as u64,
                RecordValue::Spilled { total_len, .. } => total_len,
            })),
            None => Ok(None),
        }
    }

    /// Removes the first record of the key. Returns false when absent.
    pub fn out(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        match inner.seek_exact(key)? {
            Some((leaf, idx)) => {
                inner.remove_at(leaf, idx)?;
                inner.kernel.after_write()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Removes every record of the key. Returns false when absent.
    pub fn out_dup(&self, key: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let mut removed = false;
        while let Some((leaf, idx)) = inner.seek_exact(key)? {
            inner.remove_at(leaf, idx)?;
            removed = true;
        }
        if removed {
            inner.kernel.after_write()?;
        }
        Ok(removed)
    }

    /// Keys of records between the bounds, in order, duplicates repeated.
    pub fn range(
        &self,
        begin: Option<(&[u8], bool)>,
        end: Option<(&[u8], bool)>,
        max: Option<usize>,
    ) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let cap = max.unwrap_or(usize::MAX);
        let mut keys = Vec::new();
        let mut pos = match begin {
            Some((key, _)) => inner.seek(key)?,
            None => inner.first_pos()?,
        };
        while let Some((leaf, idx)) = pos {
            if keys.len() >= cap {
                break;
            }
            let entry = match inner.entry_at(leaf, idx)? {
                Some(entry) => entry,
                None => break,
            };
            if let Some((key, inclusive)) = begin {
                let order = inner.cmp(&entry.key, key);
                if order == Ordering::Equal && !inclusive {
                    pos = inner.next_pos(leaf, idx)?;
                    continue;
                }
                debug_assert_ne!(order, Ordering::Less);
            }
            if let Some((key, inclusive)) = end {
                match inner.cmp(&entry.key, key) {
                    Ordering::Greater => break,
                    Ordering::Equal if !inclusive => break,
                    _ => {}
                }
            }
            keys.push(entry.key);
            pos = inner.next_pos(leaf, idx)?;
        }
        Ok(keys)
    }

    /// Keys beginning with `prefix`, in order, capped at `max`. Assumes the
    /// lexical comparator; under other comparators matching keys may be
    /// missed.
    pub fn fwmkeys(&self, prefix: &[u8], max: Option<usize>) -> Result<Vec<Vec<u8>>> {
        let mut inner = self.inner.lock();
        let cap = max.unwrap_or(usize::MAX);
        let mut keys = Vec::new();
        let mut pos = inner.seek(prefix)?;
        while let Some((leaf, idx)) = pos {
            if keys.len() >= cap {
                break;
            }
            let entry = match inner.entry_at(leaf, idx)? {
                Some(entry) => entry,
                None => break,
            };
            if !entry.key.starts_with(prefix) {
                break;
            }
            keys.push(entry.key);
            pos = inner.next_pos(leaf, idx)?;
        }
        Ok(keys)
    }

    /// Adds `amount` to the first record's value as a little-endian i64.
    pub fn add_int(&self, key: &[u8], amount: i64) -> Result<i64> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let current = match inner.fetch_first(key)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    TansuError::InvalidArgument("existing value is not an 8-byte integer".into())
                })?;
                Some(i64::from_le_bytes(array))
            }
            None => None,
        };
        let total = current.unwrap_or(0).wrapping_add(amount);
        inner.put_overwrite(key, &total.to_le_bytes(), false)?;
        Ok(total)
    }

    /// Adds `amount` to the first record's value as a little-endian f64.
    pub fn add_double(&self, key: &[u8], amount: f64) -> Result<f64> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let current = match inner.fetch_first(key)? {
            Some(bytes) => {
                let array: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                    TansuError::InvalidArgument("existing value is not an 8-byte float".into())
                })?;
                Some(f64::from_le_bytes(array))
            }
            None => None,
        };
        let total = current.unwrap_or(0.0) + amount;
        inner.put_overwrite(key, &total.to_le_bytes(), false)?;
        Ok(total)
    }

    /// Cursor positioned nowhere; call `first`, `last`, or `jump`.
    pub fn cursor(&self) -> Cursor {
        Cursor::new(self.clone())
    }

    /// Iterates over every record in key order.
    pub fn iter(&self) -> BtreeIter {
        BtreeIter {
            db: self.clone(),
            pos: None,
            started: false,
        }
    }

    pub fn sync(&self) -> Result<()> {
        self.inner.lock().kernel.sync()
    }

    /// Copies the database file to `dest` after syncing.
    pub fn copy(&self, dest: impl AsRef<Path>) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.kernel.in_transaction() {
            return Err(TansuError::InvalidArgument(
                "cannot copy inside a transaction".into(),
            ));
        }
        inner.kernel.sync()?;
        std::fs::copy(inner.kernel.path(), dest.as_ref())?;
        Ok(())
    }

    /// Rebuilds the file compactly, dropping dead pages and slack.
    pub fn optimize(&self) -> Result<()> {
        self.inner.lock().optimize_impl()
    }

    /// Removes every record.
    pub fn vanish(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        inner.kernel.reset()
    }

    pub fn tran_begin(&self) -> Result<()> {
        self.inner.lock().kernel.tran_begin()
    }

    pub fn tran_commit(&self) -> Result<()> {
        self.inner.lock().kernel.tran_commit()
    }

    pub fn tran_abort(&self) -> Result<()> {
        self.inner.lock().kernel.tran_abort()
    }

    /// Number of live records, duplicates included.
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

    /// Hands out a fresh unique id. Used by table stores for primary keys.
    pub(crate) fn gen_uid(&self) -> Result<u64> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let uid = inner.kernel.header.next_uid;
        inner.kernel.header.next_uid += 1;
        inner.kernel.after_write()?;
        Ok(uid)
    }

    /// Removes the one duplicate of `key` whose value equals `value`.
    pub(crate) fn out_dup_value(&self, key: &[u8], value: &[u8]) -> Result<bool> {
        let mut inner = self.inner.lock();
        inner.ensure_writable()?;
        let mut pos = inner.seek_exact(key)?;
        while let Some((leaf, idx)) = pos {
            let entry = match inner.entry_at(leaf, idx)? {
                Some(entry) => entry,
                None => break,
            };
            if inner.cmp(&entry.key, key) != Ordering::Equal {
                break;
            }
            if inner.resolve_value(&entry.value)? == value {
                inner.remove_at(leaf, idx)?;
                inner.kernel.after_write()?;
                return Ok(true);
            }
            pos = inner.next_pos(leaf, idx)?;
        }
        Ok(false)
    }
}

/// Iterator over all records of a [`BtreeDb`] in key order.
pub struct BtreeIter {
    db: BtreeDb,
    pos: Option<(PageId, usize)>,
    started: bool,
}

impl Iterator for BtreeIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut inner = self.db.inner.lock();
        let pos = if self.started {
            let (leaf, idx) = self.pos?;
            match inner.next_pos(leaf, idx) {
                Ok(pos) => pos,
                Err(err) => return Some(Err(err)),
            }
        } else {
            self.started = true;
            match inner.first_pos() {
                Ok(pos) => pos,
                Err(err) => return Some(Err(err)),
            }
        };
        self.pos = pos;
        let (leaf, idx) = pos?;
        let entry = match inner.entry_at(leaf, idx) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(err) => return Some(Err(err)),
        };
        match inner.resolve_value(&entry.value) {
            Ok(value) => Some(Ok((entry.key, value))),
            Err(err) => Some(Err(err)),
        }
    }
}

pub(crate) struct BtreeInner {
    kernel: Kernel,
    mode: OpenMode,
    config: Config,
}

impl BtreeInner {
    fn open(path: &Path, mode: OpenMode, config: &Config) -> Result<Self> {
        let kernel = Kernel::open(path, mode, config, StoreKind::Btree)?;
        Ok(Self {
            kernel,
            mode,
            config: *config,
        })
    }

    pub(crate) fn kernel(&mut self) -> &mut Kernel {
        &mut self.kernel
    }

    pub(crate) fn ensure_writable(&self) -> Result<()> {
        if self.kernel.writable() {
            Ok(())
        } else {
            Err(TansuError::ReadOnly)
        }
    }

    pub(crate) fn cmp(&self, a: &[u8], b: &[u8]) -> Ordering {
        self.kernel.comparator.compare(a, b)
    }

    fn check_key(&self, key: &[u8]) -> Result<()> {
        if key.len() > (self.kernel.page_size() - 64) / 4 {
            return Err(TansuError::InvalidArgument(
                "key too large for the page size".into(),
            ));
        }
        Ok(())
    }

    fn read_node(&mut self, id: PageId) -> Result<Node> {
        let page = self.kernel.page(id)?;
        Node::decode(&page.data)
    }

    fn write_node(&mut self, id: PageId, node: &Node) -> Result<()> {
        let page = self.kernel.page_mut(id)?;
        node.encode(&mut page.data)
    }

    fn read_leaf(&mut self, id: PageId) -> Result<LeafNode> {
        match self.read_node(id)? {
            Node::Leaf(leaf) => Ok(leaf),
            Node::Internal(_) => Err(TansuError::Corruption(
                "expected a leaf node, found an internal node".into(),
            )),
        }
    }

    /// Root page, creating the initial empty leaf on first use.
    fn ensure_root(&mut self) -> Result<PageId> {
        if self.kernel.header.root != 0 {
            return Ok(self.kernel.header.root);
        }
        let id = self.kernel.alloc_page(PageKind::Node)?;
        self.write_node(id, &Node::Leaf(LeafNode::default()))?;
        self.kernel.header.root = id;
        self.kernel.header.first_leaf = id;
        self.kernel.header.last_leaf = id;
        Ok(id)
    }

    pub(crate) fn make_value(&mut self, value: &[u8]) -> Result<RecordValue> {
        if value.len() > self.kernel.spill_threshold() {
            let first = self.kernel.spill_value(value)?;
            Ok(RecordValue::Spilled {
                first,
                total_len: value.len() as u64,
            })
        } else {
            Ok(RecordValue::Inline(value.to_vec()))
        }
    }

    fn free_value(&mut self, value: &RecordValue) -> Result<()> {
        if let RecordValue::Spilled { first, .. } = value {
            self.kernel.free_spilled(*first)?;
        }
        Ok(())
    }

    pub(crate) fn resolve_value(&mut self, value: &RecordValue) -> Result<Vec<u8>> {
        match value {
            RecordValue::Inline(bytes) => Ok(bytes.clone()),
            RecordValue::Spilled { first, total_len } => {
                self.kernel.read_spilled(*first, *total_len)
            }
        }
    }

    /// Inserts a record, splitting nodes up to the root as needed.
    pub(crate) fn insert_entry(
        &mut self,
        key: &[u8],
        value: RecordValue,
        pos: DupPos,
    ) -> Result<()> {
        let root = self.ensure_root()?;
        if let Some((separator, right)) = self.insert_rec(root, key, value, pos)? {
            let new_root = self.kernel.alloc_page(PageKind::Node)?;
            let node = Node::Internal(InternalNode {
                separators: vec![separator],
                children: vec![root, right],
            });
            self.write_node(new_root, &node)?;
            self.kernel.header.root = new_root;
        }
        Ok(())
    }

    fn insert_rec(
        &mut self,
        id: PageId,
        key: &[u8],
        value: RecordValue,
        pos: DupPos,
    ) -> Result<Option<(Vec<u8>, PageId)>> {
        match self.read_node(id)? {
            Node::Leaf(mut leaf) => {
                let idx = match pos {
                    DupPos::First => leaf
                        .entries
                        .partition_point(|e| self.cmp(&e.key, key) == Ordering::Less),
                    DupPos::Last => leaf
                        .entries
                        .partition_point(|e| self.cmp(&e.key, key) != Ordering::Greater),
                };
                leaf.entries.insert(
                    idx,
                    LeafEntry {
                        key: key.to_vec(),
                        value,
                    },
                );
                let node = Node::Leaf(leaf);
                if node.fits(self.kernel.page_size()) {
                    self.write_node(id, &node)?;
                    return Ok(None);
                }
                match node {
                    Node::Leaf(leaf) => self.split_leaf(id, leaf).map(Some),
                    Node::Internal(_) => unreachable!(),
                }
            }
            Node::Internal(mut inner) => {
                let child_idx = match pos {
                    DupPos::First => inner
                        .separators
                        .partition_point(|sep| self.cmp(sep, key) == Ordering::Less),
                    DupPos::Last => inner
                        .separators
                        .partition_point(|sep| self.cmp(sep, key) != Ordering::Greater),
                };
                let child = inner.children[child_idx];
                match self.insert_rec(child, key, value, pos)? {
                    None => Ok(None),
                    Some((separator, right)) => {
                        inner.separators.insert(child_idx, separator);
                        inner.children.insert(child_idx + 1, right);
                        let node = Node::Internal(inner);
                        if node.fits(self.kernel.page_size()) {
                            self.write_node(id, &node)?;
                            return Ok(None);
                        }
                        match node {
                            Node::Internal(inner) => self.split_internal(id, inner).map(Some),
                            Node::Leaf(_) => unreachable!(),
                        }
                    }
                }
            }
        }
    }

    fn split_leaf(&mut self, id: PageId, mut leaf: LeafNode) -> Result<(Vec<u8>, PageId)> {
        if leaf.entries.len() < 2 {
            return Err(TansuError::Corruption(
                "overflowing leaf has too few entries to split".into(),
            ));
        }
        let mid = leaf.entries.len() / 2;
        let right_entries = leaf.entries.split_off(mid);
        let right_id = self.kernel.alloc_page(PageKind::Node)?;
        let separator = right_entries[0].key.clone();
        let right = LeafNode {
            prev: id,
            next: leaf.next,
            entries: right_entries,
        };
        if right.next != 0 {
            let mut after = self.read_leaf(right.next)?;
            after.prev = right_id;
            let next_id = right.next;
            self.write_node(next_id, &Node::Leaf(after))?;
        } else {
            self.kernel.header.last_leaf = right_id;
        }
        leaf.next = right_id;
        self.write_node(id, &Node::Leaf(leaf))?;
        self.write_node(right_id, &Node::Leaf(right))?;
        Ok((separator, right_id))
    }

    fn split_internal(
        &mut self,
        id: PageId,
        mut node: InternalNode,
    ) -> Result<(Vec<u8>, PageId)> {
        if node.separators.len() < 3 {
            return Err(TansuError::Corruption(
                "overflowing internal node has too few separators to split".into(),
            ));
        }
        let mid = node.separators.len() / 2;
        let up = node.separators[mid].clone();
        let right_separators = node.separators.split_off(mid + 1);
        node.separators.pop();
        let right_children = node.children.split_off(mid + 1);
        let right_id = self.kernel.alloc_page(PageKind::Node)?;
        let right = InternalNode {
            separators: right_separators,
            children: right_children,
        };
        self.write_node(id, &Node::Internal(node))?;
        self.write_node(right_id, &Node::Internal(right))?;
        Ok((up, right_id))
    }

    /// First entry with key >= `key`, hopping over empty leaves.
    pub(crate) fn seek(&mut self, key: &[u8]) -> Result<Option<(PageId, usize)>> {
        if self.kernel.header.root == 0 {
            return Ok(None);
        }
        let mut id = self.kernel.header.root;
        loop {
            match self.read_node(id)? {
                Node::Internal(inner) => {
                    let idx = inner
                        .separators
                        .partition_point(|sep| self.cmp(sep, key) == Ordering::Less);
                    id = inner.children[idx];
                }
                Node::Leaf(leaf) => {
                    let idx = leaf
                        .entries
                        .partition_point(|e| self.cmp(&e.key, key) == Ordering::Less);
                    if idx < leaf.entries.len() {
                        return Ok(Some((id, idx)));
                    }
                    return self.skip_forward(leaf.next);
                }
            }
        }
    }

    /// Position of the first record of `key`, or None when absent.
    pub(crate) fn seek_exact(&mut self, key: &[u8]) -> Result<Option<(PageId, usize)>> {
        match self.seek(key)? {
            Some((leaf, idx)) if self.exact_at(leaf, idx, key)? => Ok(Some((leaf, idx))),
            _ => Ok(None),
        }
    }

    fn exact_at(&mut self, leaf: PageId, idx: usize, key: &[u8]) -> Result<bool> {
        match self.entry_at(leaf, idx)? {
            Some(entry) => Ok(self.cmp(&entry.key, key) == Ordering::Equal),
            None => Ok(false),
        }
    }

    fn fetch_first(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        match self.seek_exact(key)? {
            Some((leaf, idx)) => match self.entry_at(leaf, idx)? {
                Some(entry) => Ok(Some(self.resolve_value(&entry.value)?)),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// First non-empty leaf starting at `id`, position 0.
    fn skip_forward(&mut self, mut id: PageId) -> Result<Option<(PageId, usize)>> {
        while id != 0 {
            let leaf = self.read_leaf(id)?;
            if !leaf.entries.is_empty() {
                return Ok(Some((id, 0)));
            }
            id = leaf.next;
        }
        Ok(None)
    }

    /// Last entry of the first non-empty leaf walking backwards from `id`.
    fn skip_backward(&mut self, mut id: PageId) -> Result<Option<(PageId, usize)>> {
        while id != 0 {
            let leaf = self.read_leaf(id)?;
            if !leaf.entries.is_empty() {
                return Ok(Some((id, leaf.entries.len() - 1)));
            }
            id = leaf.prev;
        }
        Ok(None)
    }

    pub(crate) fn first_pos(&mut self) -> Result<Option<(PageId, usize)>> {
        let first = self.kernel.header.first_leaf;
        if first == 0 {
            return Ok(None);
        }
        self.skip_forward(first)
    }

    pub(crate) fn last_pos(&mut self) -> Result<Option<(PageId, usize)>> {
        let last = self.kernel.header.last_leaf;
        if last == 0 {
            return Ok(None);
        }
        self.skip_backward(last)
    }

    pub(crate) fn next_pos(
        &mut self,
        leaf_id: PageId,
        idx: usize,
    ) -> Result<Option<(PageId, usize)>> {
        let leaf = self.read_leaf(leaf_id)?;
        if idx + 1 < leaf.entries.len() {
            return Ok(Some((leaf_id, idx + 1)));
        }
        self.skip_forward(leaf.next)
    }

    pub(crate) fn prev_pos(
        &mut self,
        leaf_id: PageId,
        idx: usize,
    ) -> Result<Option<(PageId, usize)>> {
        if idx > 0 {
            return Ok(Some((leaf_id, idx - 1)));
        }
        let leaf = self.read_leaf(leaf_id)?;
        self.skip_backward(leaf.prev)
    }

    pub(crate) fn entry_at(&mut self, leaf_id: PageId, idx: usize) -> Result<Option<LeafEntry>> {
        let leaf = self.read_leaf(leaf_id)?;
        Ok(leaf.entries.get(idx).cloned())
    }

    /// Clamps a possibly stale position to the record now occupying it, or
    /// the next record after it.
    pub(crate) fn normalize_pos(
        &mut self,
        leaf_id: PageId,
        idx: usize,
    ) -> Result<Option<(PageId, usize)>> {
        let leaf = self.read_leaf(leaf_id)?;
        if idx < leaf.entries.len() {
            return Ok(Some((leaf_id, idx)));
        }
        self.skip_forward(leaf.next)
    }

    /// Removes the entry at a position, freeing any spilled value. The leaf
    /// stays in the chain even when it empties.
    pub(crate) fn remove_at(&mut self, leaf_id: PageId, idx: usize) -> Result<()> {
        let mut leaf = self.read_leaf(leaf_id)?;
        if idx >= leaf.entries.len() {
            return Err(TansuError::Corruption(
                "removal position is out of bounds".into(),
            ));
        }
        let entry = leaf.entries.remove(idx);
        self.write_node(leaf_id, &Node::Leaf(leaf))?;
        self.free_value(&entry.value)?;
        self.kernel.header.rnum -= 1;
        Ok(())
    }

    /// Replaces the value at a position. Falls back to remove-and-reinsert
    /// when the grown leaf no longer fits its page; returns false in that
    /// case, since the record may have moved.
    pub(crate) fn replace_at(
        &mut self,
        leaf_id: PageId,
        idx: usize,
        new_value: &[u8],
    ) -> Result<bool> {
        let value = self.make_value(new_value)?;
        let mut leaf = self.read_leaf(leaf_id)?;
        if idx >= leaf.entries.len() {
            return Err(TansuError::Corruption(
                "replacement position is out of bounds".into(),
            ));
        }
        let old = std::mem::replace(&mut leaf.entries[idx].value, value);
        let node = Node::Leaf(leaf);
        if node.fits(self.kernel.page_size()) {
            self.write_node(leaf_id, &node)?;
            self.free_value(&old)?;
            return Ok(true);
        }
        let mut leaf = match node {
            Node::Leaf(leaf) => leaf,
            Node::Internal(_) => unreachable!(),
        };
        let entry = leaf.entries.remove(idx);
        self.write_node(leaf_id, &Node::Leaf(leaf))?;
        self.free_value(&old)?;
        self.insert_entry(&entry.key, entry.value, DupPos::First)?;
        Ok(false)
    }

    /// Shared body of `put`, `put_cat`, and the counters.
    fn put_overwrite(&mut self, key: &[u8], value: &[u8], cat: bool) -> Result<()> {
        self.ensure_writable()?;
        self.check_key(key)?;
        match self.seek_exact(key)? {
            Some((leaf, idx)) => {
                let new_value = if cat {
                    let entry = self.entry_at(leaf, idx)?.ok_or_else(|| {
                        TansuError::Corruption("seek returned a vanished entry".into())
                    })?;
                    let mut joined = self.resolve_value(&entry.value)?;
                    joined.extend_from_slice(value);
                    joined
                } else {
                    value.to_vec()
                };
                self.replace_at(leaf, idx, &new_value)?;
            }
            None => {
                let value = self.make_value(value)?;
                self.insert_entry(key, value, DupPos::First)?;
                self.kernel.header.rnum += 1;
            }
        }
        self.kernel.after_write()
    }

    /// All records in key order, resolved. Used by `optimize`.
    fn all_records(&mut self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut records = Vec::new();
        let mut pos = self.first_pos()?;
        while let Some((leaf, idx)) = pos {
            if let Some(entry) = self.entry_at(leaf, idx)? {
                let value = self.resolve_value(&entry.value)?;
                records.push((entry.key, value));
            }
            pos = self.next_pos(leaf, idx)?;
        }
        Ok(records)
    }

    fn optimize_impl(&mut self) -> Result<()> {
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
        tmp_config.page_size = self.kernel.header.page_size;
        tmp_config.sync_writes = false;
        let mut rebuilt =
            BtreeInner::open(&tmp_path, OpenMode::writer().truncate(), &tmp_config)?;
        for (key, value) in self.all_records()? {
            let value = rebuilt.make_value(&value)?;
            rebuilt.insert_entry(&key, value, DupPos::Last)?;
            rebuilt.kernel.header.rnum += 1;
        }
        rebuilt.kernel.header.next_uid = self.kernel.header.next_uid;
        rebuilt.kernel.sync()?;
        drop(rebuilt);

        std::fs::rename(&tmp_path, &path)?;
        let mut mode = self.mode;
        mode.truncate = false;
        info!(path = %path.display(), "rebuilt btree store");
        *self = BtreeInner::open(&path, mode, &self.config)?;
        Ok(())
    }
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
    fn put_get_in_order() {
        let (_dir, path) = scratch("b.db");
        let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
        db.put(b"cherry", b"3").expect("put");
        db.put(b"apple", b"1").expect("put");
        db.put(b"banana", b"2").expect("put");
        let keys: Vec<Vec<u8>> = db
            .iter()
            .map(|item| item.expect("record").0)
            .collect();
        assert_eq!(
            keys,
            vec![b"apple".to_vec(), b"banana".to_vec(), b"cherry".to_vec()]
        );
    }

    #[test]
    fn duplicates_keep_insertion_order() {
        let (_dir, path) = scratch("dup.db");
        let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
        db.put_dup(b"k", b"first").expect("dup");
        db.put_dup(b"k", b"second").expect("dup");
        db.put_dup(b"k", b"third").expect("dup");
        assert_eq!(db.vnum(b"k").expect("vnum"), 3);
        assert_eq!(
            db.get_dup(b"k").expect("get_dup"),
            vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]
        );
        assert_eq!(db.get(b"k").expect("get"), Some(b"first".to_vec()));
        assert!(db.out(b"k").expect("out"));
        assert_eq!(db.vnum(b"k").expect("vnum"), 2);
        assert_eq!(db.get(b"k").expect("get"), Some(b"second".to_vec()));
        assert!(db.out_dup(b"k").expect("out_dup"));
        assert_eq!(db.vnum(b"k").expect("vnum"), 0);
    }

    #[test]
    fn overwrite_replaces_first_duplicate_only() {
        let (_dir, path) = scratch("ow.db");
        let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
        db.put_dup(b"k", b"a").expect("dup");
        db.put_dup(b"k", b"b").expect("dup");
        db.put(b"k", b"A").expect("overwrite");
        assert_eq!(
            db.get_dup(b"k").expect("get_dup"),
            vec![b"A".to_vec(), b"b".to_vec()]
        );
        assert_eq!(db.rnum(), 2);
    }

    #[test]
    fn range_and_prefix() {
        let (_dir, path) = scratch("r.db");
        let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
        for key in ["ant", "bee", "beetle", "cat", "dog"] {
            db.put(key.as_bytes(), b"x").expect("put");
        }
        let keys = db
            .range(Some((b"bee", true)), Some((b"cat", false)), None)
            .expect("range");
        assert_eq!(keys, vec![b"bee".to_vec(), b"beetle".to_vec()]);
        let keys = db.fwmkeys(b"be", None).expect("fwmkeys");
        assert_eq!(keys, vec![b"bee".to_vec(), b"beetle".to_vec()]);
        let keys = db.fwmkeys(b"be", Some(1)).expect("fwmkeys capped");
        assert_eq!(keys, vec![b"bee".to_vec()]);
    }

    #[test]
    fn survives_many_inserts_with_small_pages() {
        let (_dir, path) = scratch("split.db");
        let config = Config::default().with_page_size(512);
        let db = BtreeDb::open_with(&path, OpenMode::writer(), config).expect("open");
        for i in 0..1000u32 {
            let key = format!("key-{i:05}");
            let value = format!("value-{i}");
            db.put(key.as_bytes(), value.as_bytes()).expect("put");
        }
        assert_eq!(db.rnum(), 1000);
        for i in (0..1000u32).step_by(97) {
            let key = format!("key-{i:05}");
            assert_eq!(
                db.get(key.as_bytes()).expect("get"),
                Some(format!("value-{i}").into_bytes())
            );
        }
        let keys: Vec<Vec<u8>> = db.iter().map(|item| item.expect("record").0).collect();
        assert_eq!(keys.len(), 1000);
        assert!(keys.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn decimal_comparator_orders_numeric_keys() {
        let (_dir, path) = scratch("num.db");
        let config = Config::default().with_comparator(crate::config::Comparator::Decimal);
        let db = BtreeDb::open_with(&path, OpenMode::writer(), config).expect("open");
        for key in ["10", "2", "33", "4"] {
            db.put(key.as_bytes(), b"x").expect("put");
        }
        let keys: Vec<Vec<u8>> = db.iter().map(|item| item.expect("record").0).collect();
        assert_eq!(
            keys,
            vec![b"2".to_vec(), b"4".to_vec(), b"10".to_vec(), b"33".to_vec()]
        );
    }

    #[test]
    fn reopen_preserves_records() {
        let (_dir, path) = scratch("persist.db");
        {
            let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
            db.put(b"k1", b"v1").expect("put");
            db.put_dup(b"k2", b"a").expect("dup");
            db.put_dup(b"k2", b"b").expect("dup");
            db.close().expect("close");
        }
        let db = BtreeDb::open(&path, OpenMode::reader()).expect("reopen");
        assert_eq!(db.get(b"k1").expect("get"), Some(b"v1".to_vec()));
        assert_eq!(
            db.get_dup(b"k2").expect("get_dup"),
            vec![b"a".to_vec(), b"b".to_vec()]
        );
        assert_eq!(db.rnum(), 3);
    }
}
