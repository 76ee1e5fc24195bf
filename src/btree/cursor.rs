//! Cursor over a [`BtreeDb`](super::BtreeDb).
//!
//! A cursor tracks one record position and can walk the store in either
//! direction, update the record under it, insert duplicates around it, and
//! delete it. Positions are not tracked across writes made through other
//! handles; interleaving those with cursor movement may skip or repeat
//! records.

use crate::error::{Result, TansuError};
use crate::pager::PageId;

use super::{BtreeDb, DupPos};

/// Placement for [`Cursor::put`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CursorPutMode {
    /// Replace the value of the record under the cursor.
    Current,
    /// Insert a duplicate of the current key before the cursor.
    Before,
    /// Insert a duplicate of the current key after the cursor.
    After,
}

pub struct Cursor {
    db: BtreeDb,
    pos: Option<(PageId, usize)>,
}

impl Cursor {
    pub(super) fn new(db: BtreeDb) -> Self {
        Self { db, pos: None }
    }

    /// Moves to the first record. Returns false when the store is empty.
    pub fn first(&mut self) -> Result<bool> {
        self.pos = self.db.inner.lock().first_pos()?;
        Ok(self.pos.is_some())
    }

    /// Moves to the last record.
    pub fn last(&mut self) -> Result<bool> {
        self.pos = self.db.inner.lock().last_pos()?;
        Ok(self.pos.is_some())
    }

    /// Moves to the first record with key >= `key`.
    pub fn jump(&mut self, key: &[u8]) -> Result<bool> {
        self.pos = self.db.inner.lock().seek(key)?;
        Ok(self.pos.is_some())
    }

    /// Advances to the next record. Returns false past the end.
    pub fn next(&mut self) -> Result<bool> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(false),
        };
        self.pos = self.db.inner.lock().next_pos(leaf, idx)?;
        Ok(self.pos.is_some())
    }

    /// Steps back to the previous record. Returns false past the start.
    pub fn prev(&mut self) -> Result<bool> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(false),
        };
        self.pos = self.db.inner.lock().prev_pos(leaf, idx)?;
        Ok(self.pos.is_some())
    }

    /// Key of the record under the cursor.
    pub fn key(&self) -> Result<Option<Vec<u8>>> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let mut inner = self.db.inner.lock();
        Ok(inner.entry_at(leaf, idx)?.map(|entry| entry.key))
    }

    /// Value of the record under the cursor.
    pub fn value(&self) -> Result<Option<Vec<u8>>> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let mut inner = self.db.inner.lock();
        match inner.entry_at(leaf, idx)? {
            Some(entry) => Ok(Some(inner.resolve_value(&entry.value)?)),
            None => Ok(None),
        }
    }

    /// Key and value of the record under the cursor.
    pub fn rec(&self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(None),
        };
        let mut inner = self.db.inner.lock();
        match inner.entry_at(leaf, idx)? {
            Some(entry) => {
                let value = inner.resolve_value(&entry.value)?;
                Ok(Some((entry.key, value)))
            }
            None => Ok(None),
        }
    }

    /// Writes through the cursor: replaces the current record's value or
    /// inserts a duplicate of its key next to it.
    pub fn put(&mut self, value: &[u8], mode: CursorPutMode) -> Result<()> {
        let (leaf, idx) = self.pos.ok_or_else(|| {
            TansuError::InvalidArgument("cursor is not positioned on a record".into())
        })?;
        let mut inner = self.db.inner.lock();
        inner.ensure_writable()?;
        let entry = inner.entry_at(leaf, idx)?.ok_or_else(|| {
            TansuError::InvalidArgument("cursor position is no longer valid".into())
        })?;
        match mode {
            CursorPutMode::Current => {
                // A grown value can push the record off its leaf; land back
                // on the key when that happens.
                if !inner.replace_at(leaf, idx, value)? {
                    self.pos = inner.seek(&entry.key)?;
                }
            }
            CursorPutMode::Before => {
                let value = inner.make_value(value)?;
                inner.insert_entry(&entry.key, value, DupPos::First)?;
                inner.kernel().header.rnum += 1;
                // The insert may have shifted leaves; land on the new first
                // duplicate of the key.
                self.pos = inner.seek(&entry.key)?;
            }
            CursorPutMode::After => {
                let value = inner.make_value(value)?;
                inner.insert_entry(&entry.key, value, DupPos::Last)?;
                inner.kernel().header.rnum += 1;
                // The insert may have split the leaf under the cursor; land
                // on the key's first duplicate.
                self.pos = inner.seek(&entry.key)?;
            }
        }
        inner.kernel().after_write()
    }

    /// Deletes the record under the cursor and advances to the next one.
    /// Returns false when the cursor is unset or stale.
    pub fn out(&mut self) -> Result<bool> {
        let (leaf, idx) = match self.pos {
            Some(pos) => pos,
            None => return Ok(false),
        };
        let mut inner = self.db.inner.lock();
        if inner.entry_at(leaf, idx)?.is_none() {
            return Ok(false);
        }
        inner.remove_at(leaf, idx)?;
        inner.kernel().after_write()?;
        self.pos = inner.normalize_pos(leaf, idx)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, OpenMode};

    fn db(name: &str) -> (tempfile::TempDir, BtreeDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = BtreeDb::open(dir.path().join(name), OpenMode::writer()).expect("open");
        (dir, db)
    }

    fn small_page_db(name: &str) -> (tempfile::TempDir, BtreeDb) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = BtreeDb::open_with(
            dir.path().join(name),
            OpenMode::writer(),
            Config::default().with_page_size(512),
        )
        .expect("open");
        (dir, db)
    }

    #[test]
    fn walks_forward_and_backward() {
        let (_dir, db) = db("walk.db");
        for key in ["a", "b", "c"] {
            db.put(key.as_bytes(), key.as_bytes()).expect("put");
        }
        let mut cursor = db.cursor();
        assert!(cursor.first().expect("first"));
        assert_eq!(cursor.key().expect("key"), Some(b"a".to_vec()));
        assert!(cursor.next().expect("next"));
        assert!(cursor.next().expect("next"));
        assert_eq!(cursor.key().expect("key"), Some(b"c".to_vec()));
        assert!(!cursor.next().expect("exhausted"));

        assert!(cursor.last().expect("last"));
        assert_eq!(cursor.key().expect("key"), Some(b"c".to_vec()));
        assert!(cursor.prev().expect("prev"));
        assert_eq!(cursor.key().expect("key"), Some(b"b".to_vec()));
    }

    #[test]
    fn jump_lands_on_first_at_or_after() {
        let (_dir, db) = db("jump.db");
        for key in ["apple", "banana", "date"] {
            db.put(key.as_bytes(), b"x").expect("put");
        }
        let mut cursor = db.cursor();
        assert!(cursor.jump(b"b").expect("jump"));
        assert_eq!(cursor.key().expect("key"), Some(b"banana".to_vec()));
        assert!(cursor.jump(b"cherry").expect("jump"));
        assert_eq!(cursor.key().expect("key"), Some(b"date".to_vec()));
        assert!(!cursor.jump(b"zebra").expect("past the end"));
    }

    #[test]
    fn put_current_replaces_value() {
        let (_dir, db) = db("cput.db");
        db.put(b"k", b"old").expect("put");
        let mut cursor = db.cursor();
        assert!(cursor.first().expect("first"));
        cursor.put(b"new", CursorPutMode::Current).expect("put");
        assert_eq!(db.get(b"k").expect("get"), Some(b"new".to_vec()));
        assert_eq!(db.rnum(), 1);
    }

    #[test]
    fn put_before_and_after_insert_duplicates() {
        let (_dir, db) = db("dup.db");
        db.put(b"k", b"middle").expect("put");
        let mut cursor = db.cursor();
        assert!(cursor.first().expect("first"));
        cursor.put(b"head", CursorPutMode::Before).expect("before");
        cursor.put(b"tail", CursorPutMode::After).expect("after");
        assert_eq!(
            db.get_dup(b"k").expect("get_dup"),
            vec![b"head".to_vec(), b"middle".to_vec(), b"tail".to_vec()]
        );
    }

    #[test]
    fn put_after_tracks_key_across_leaf_split() {
        let (_dir, db) = small_page_db("asplit.db");
        for i in 0..8u8 {
            db.put_dup(b"k", &[i; 48]).expect("put_dup");
        }
        let mut cursor = db.cursor();
        assert!(cursor.last().expect("last"));
        cursor.put(&[0xaa; 48], CursorPutMode::After).expect("after");
        assert_eq!(cursor.key().expect("key"), Some(b"k".to_vec()));
        cursor.put(&[0xbb; 48], CursorPutMode::After).expect("after");
        assert_eq!(cursor.key().expect("key"), Some(b"k".to_vec()));
        assert_eq!(db.vnum(b"k").expect("vnum"), 10);
    }

    #[test]
    fn put_current_tracks_key_when_record_moves() {
        let (_dir, db) = small_page_db("creloc.db");
        for i in 0..8u8 {
            db.put_dup(b"k", &[i; 48]).expect("put_dup");
        }
        let mut cursor = db.cursor();
        assert!(cursor.first().expect("first"));
        // A 90-byte replacement no longer fits the full leaf, so the record
        // gets reinserted elsewhere.
        cursor.put(&[0xcc; 90], CursorPutMode::Current).expect("put");
        assert_eq!(cursor.key().expect("key"), Some(b"k".to_vec()));
        assert!(db
            .get_dup(b"k")
            .expect("get_dup")
            .contains(&vec![0xcc; 90]));
        assert_eq!(db.rnum(), 8);
    }

    #[test]
    fn out_advances_to_next_record() {
        let (_dir, db) = db("cout.db");
        for key in ["a", "b", "c"] {
            db.put(key.as_bytes(), b"x").expect("put");
        }
        let mut cursor = db.cursor();
        assert!(cursor.first().expect("first"));
        assert!(cursor.out().expect("out"));
        assert_eq!(cursor.key().expect("key"), Some(b"b".to_vec()));
        assert!(cursor.out().expect("out"));
        assert!(cursor.out().expect("out"));
        assert_eq!(db.rnum(), 0);
        assert!(!cursor.out().expect("empty"));
    }
}
