//! Transaction semantics across the store flavours.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tansu::{BtreeDb, Cond, Config, HashDb, IndexKind, OpenMode, TableDb};

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

#[test]
fn hash_abort_rolls_back_everything() {
    let (_dir, path) = scratch("habort.db");
    let db = HashDb::open(&path, OpenMode::writer()).expect("open");
    db.put(b"stable", b"before").expect("put");

    db.tran_begin().expect("begin");
    db.put(b"stable", b"changed").expect("put in tran");
    db.put(b"fresh", b"new").expect("put in tran");
    assert!(db.out(b"stable").expect("out in tran"));
    db.tran_abort().expect("abort");

    assert_eq!(db.get(b"stable").expect("get"), Some(b"before".to_vec()));
    assert_eq!(db.get(b"fresh").expect("get"), None);
    assert_eq!(db.rnum(), 1);
}

#[test]
fn hash_commit_persists_across_reopen() {
    let (_dir, path) = scratch("hcommit.db");
    {
        let db = HashDb::open(&path, OpenMode::writer()).expect("open");
        db.tran_begin().expect("begin");
        db.put(b"k", b"v").expect("put");
        db.tran_commit().expect("commit");
        db.close().expect("close");
    }
    let db = HashDb::open(&path, OpenMode::reader()).expect("reopen");
    assert_eq!(db.get(b"k").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn abort_discards_pages_grown_during_the_transaction() {
    let (_dir, path) = scratch("grow.db");
    let config = Config::default().with_page_size(512).with_buckets(8);
    let db = HashDb::open_with(&path, OpenMode::writer(), config).expect("open");
    db.put(b"anchor", b"kept").expect("put");
    db.sync().expect("sync");
    let size_before = db.fsiz();

    db.tran_begin().expect("begin");
    for i in 0..200u32 {
        db.put(format!("bulk-{i}").as_bytes(), &[1u8; 100])
            .expect("bulk put");
    }
    assert!(db.fsiz() > size_before);
    db.tran_abort().expect("abort");

    assert_eq!(db.fsiz(), size_before);
    assert_eq!(db.rnum(), 1);
    assert_eq!(db.get(b"anchor").expect("get"), Some(b"kept".to_vec()));
    assert_eq!(db.get(b"bulk-0").expect("get"), None);
    // The store keeps working after the rollback.
    db.put(b"after", b"abort").expect("put after abort");
    assert_eq!(db.get(b"after").expect("get"), Some(b"abort".to_vec()));
}

#[test]
fn btree_abort_restores_structure() {
    let (_dir, path) = scratch("babort.db");
    let config = Config::default().with_page_size(512);
    let db = BtreeDb::open_with(&path, OpenMode::writer(), config).expect("open");
    for i in 0..20u32 {
        db.put(format!("base-{i:02}").as_bytes(), b"v").expect("put");
    }

    db.tran_begin().expect("begin");
    for i in 0..200u32 {
        db.put(format!("tran-{i:03}").as_bytes(), b"t").expect("put");
    }
    for i in 0..10u32 {
        assert!(db.out(format!("base-{i:02}").as_bytes()).expect("out"));
    }
    db.tran_abort().expect("abort");

    assert_eq!(db.rnum(), 20);
    let keys: Vec<Vec<u8>> = db.iter().map(|item| item.expect("record").0).collect();
    assert_eq!(keys.len(), 20);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert!(keys.iter().all(|k| k.starts_with(b"base-")));
    assert_eq!(db.get(b"base-05").expect("get"), Some(b"v".to_vec()));
}

#[test]
fn btree_commit_then_abort_only_undoes_the_second() {
    let (_dir, path) = scratch("two.db");
    let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");

    db.tran_begin().expect("begin");
    db.put(b"committed", b"1").expect("put");
    db.tran_commit().expect("commit");

    db.tran_begin().expect("begin again");
    db.put(b"aborted", b"2").expect("put");
    db.tran_abort().expect("abort");

    assert_eq!(db.get(b"committed").expect("get"), Some(b"1".to_vec()));
    assert_eq!(db.get(b"aborted").expect("get"), None);
}

#[test]
fn nested_transactions_are_rejected() {
    let (_dir, path) = scratch("nested.db");
    let db = HashDb::open(&path, OpenMode::writer()).expect("open");
    db.tran_begin().expect("begin");
    assert!(db.tran_begin().is_err());
    db.tran_commit().expect("commit");
    // Commit or abort without a transaction fails too.
    assert!(db.tran_commit().is_err());
    assert!(db.tran_abort().is_err());
}

#[test]
fn table_abort_covers_primary_and_indexes() {
    let (_dir, path) = scratch("tabort.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    db.set_index("kind", IndexKind::Lexical).expect("index");
    let mut cols = BTreeMap::new();
    cols.insert("kind".to_string(), "fruit".to_string());
    db.put(b"1", &cols).expect("put");

    db.tran_begin().expect("begin");
    db.put(b"2", &cols).expect("put in tran");
    assert!(db.out(b"1").expect("out in tran"));
    db.tran_abort().expect("abort");

    assert_eq!(db.rnum(), 1);
    assert!(db.get(b"1").expect("get").is_some());
    assert_eq!(db.get(b"2").expect("get"), None);
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fruit")
        .search()
        .expect("search");
    assert_eq!(hits, vec![b"1".to_vec()]);
}

#[test]
fn table_commit_spans_index_files() {
    let (_dir, path) = scratch("tcommit.db");
    {
        let db = TableDb::open(&path, OpenMode::writer()).expect("open");
        db.set_index("kind", IndexKind::Lexical).expect("index");
        let mut cols = BTreeMap::new();
        cols.insert("kind".to_string(), "veg".to_string());
        db.tran_begin().expect("begin");
        db.put(b"1", &cols).expect("put");
        db.tran_commit().expect("commit");
        db.close().expect("close");
    }
    let db = TableDb::open(&path, OpenMode::writer()).expect("reopen");
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "veg")
        .search()
        .expect("search");
    assert_eq!(hits, vec![b"1".to_vec()]);
}
