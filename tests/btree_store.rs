//! End-to-end tests for the ordered store.

use std::collections::BTreeMap;
use std::path::PathBuf;

use proptest::prelude::*;
use tansu::{BtreeDb, Config, OpenMode};

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

fn small_pages(path: &PathBuf) -> BtreeDb {
    let config = Config::default().with_page_size(512);
    BtreeDb::open_with(path, OpenMode::writer(), config).expect("open")
}

#[test]
fn cursor_walks_across_page_splits() {
    let (_dir, path) = scratch("walk.db");
    let db = small_pages(&path);
    for i in 0..400u32 {
        db.put(format!("key-{i:04}").as_bytes(), format!("v{i}").as_bytes())
            .expect("put");
    }
    let mut cursor = db.cursor();
    assert!(cursor.first().expect("first"));
    let mut count = 1;
    let mut last = cursor.key().expect("key").expect("present");
    while cursor.next().expect("next") {
        let key = cursor.key().expect("key").expect("present");
        assert!(key > last, "cursor went backwards");
        last = key;
        count += 1;
    }
    assert_eq!(count, 400);

    assert!(cursor.last().expect("last"));
    let mut count = 1;
    while cursor.prev().expect("prev") {
        count += 1;
    }
    assert_eq!(count, 400);
}

#[test]
fn traversal_skips_emptied_leaves() {
    let (_dir, path) = scratch("holes.db");
    let db = small_pages(&path);
    for i in 0..300u32 {
        db.put(format!("key-{i:04}").as_bytes(), b"x").expect("put");
    }
    // Carve a hole wide enough to empty whole leaves.
    for i in 100..200u32 {
        assert!(db.out(format!("key-{i:04}").as_bytes()).expect("out"));
    }
    assert_eq!(db.rnum(), 200);
    let keys: Vec<Vec<u8>> = db.iter().map(|item| item.expect("record").0).collect();
    assert_eq!(keys.len(), 200);
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(keys[99], b"key-0099".to_vec());
    assert_eq!(keys[100], b"key-0200".to_vec());

    // Backward traversal hops the hole too.
    let mut cursor = db.cursor();
    assert!(cursor.jump(b"key-0200").expect("jump"));
    assert!(cursor.prev().expect("prev"));
    assert_eq!(cursor.key().expect("key"), Some(b"key-0099".to_vec()));
}

#[test]
fn optimize_compacts_and_preserves_duplicates() {
    let (_dir, path) = scratch("opt.db");
    let db = small_pages(&path);
    for i in 0..300u32 {
        db.put(format!("key-{i:04}").as_bytes(), &[7u8; 100])
            .expect("put");
    }
    db.put_dup(b"dup", b"one").expect("dup");
    db.put_dup(b"dup", b"two").expect("dup");
    for i in 0..250u32 {
        assert!(db.out(format!("key-{i:04}").as_bytes()).expect("out"));
    }
    let before = db.fsiz();
    db.optimize().expect("optimize");
    assert!(db.fsiz() < before);
    assert_eq!(db.rnum(), 52);
    assert_eq!(
        db.get_dup(b"dup").expect("get_dup"),
        vec![b"one".to_vec(), b"two".to_vec()]
    );
    let keys: Vec<Vec<u8>> = db.iter().map(|item| item.expect("record").0).collect();
    assert!(keys.windows(2).all(|w| w[0] <= w[1]));
}

#[test]
fn large_values_spill_and_return() {
    let (_dir, path) = scratch("spill.db");
    let db = small_pages(&path);
    let big: Vec<u8> = (0..20_000u32).map(|i| (i % 253) as u8).collect();
    db.put(b"big", &big).expect("put");
    db.put(b"a", b"small").expect("put");
    assert_eq!(db.get(b"big").expect("get"), Some(big.clone()));
    assert_eq!(db.vsiz(b"big").expect("vsiz"), Some(big.len() as u64));
    db.put(b"big", b"short now").expect("replace");
    assert_eq!(db.get(b"big").expect("get"), Some(b"short now".to_vec()));
}

#[test]
fn range_respects_bounds() {
    let (_dir, path) = scratch("range.db");
    let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
    for key in ["a", "b", "c", "d", "e"] {
        db.put(key.as_bytes(), b"x").expect("put");
    }
    assert_eq!(
        db.range(Some((b"b", false)), Some((b"d", true)), None)
            .expect("range"),
        vec![b"c".to_vec(), b"d".to_vec()]
    );
    assert_eq!(
        db.range(None, Some((b"b", true)), None).expect("range"),
        vec![b"a".to_vec(), b"b".to_vec()]
    );
    assert_eq!(
        db.range(Some((b"d", true)), None, Some(1)).expect("range"),
        vec![b"d".to_vec()]
    );
}

#[test]
fn put_cat_appends_to_first_duplicate() {
    let (_dir, path) = scratch("cat.db");
    let db = BtreeDb::open(&path, OpenMode::writer()).expect("open");
    db.put_cat(b"log", b"first").expect("cat creates");
    db.put_cat(b"log", b"|second").expect("cat appends");
    assert_eq!(
        db.get(b"log").expect("get"),
        Some(b"first|second".to_vec())
    );
    assert_eq!(db.rnum(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn matches_an_in_memory_model(ops in prop::collection::vec(
        (0u16..200, prop::option::of(prop::collection::vec(any::<u8>(), 0..64))),
        1..300,
    )) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = Config::default().with_page_size(512);
        let db = BtreeDb::open_with(dir.path().join("model.db"), OpenMode::writer(), config)
            .expect("open");
        let mut model: BTreeMap<Vec<u8>, Vec<u8>> = BTreeMap::new();
        for (key, op) in ops {
            let key = format!("{key:03}").into_bytes();
            match op {
                Some(value) => {
                    db.put(&key, &value).expect("put");
                    model.insert(key, value);
                }
                None => {
                    let removed = db.out(&key).expect("out");
                    prop_assert_eq!(removed, model.remove(&key).is_some());
                }
            }
        }
        prop_assert_eq!(db.rnum(), model.len() as u64);
        let stored: Vec<(Vec<u8>, Vec<u8>)> =
            db.iter().map(|item| item.expect("record")).collect();
        let expected: Vec<(Vec<u8>, Vec<u8>)> = model.into_iter().collect();
        prop_assert_eq!(stored, expected);
    }
}
