//! End-to-end tests for the table store and its query engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use tansu::{Cond, IndexKind, MetaOp, OpenMode, Order, Query, TableDb};

fn scratch(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join(name);
    (dir, path)
}

fn cols(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// A small product catalog used by most query tests.
fn seed(db: &TableDb) {
    let rows: &[(&str, &[(&str, &str)])] = &[
        ("1", &[("name", "apple"), ("kind", "fruit"), ("price", "1.5")]),
        ("2", &[("name", "banana"), ("kind", "fruit"), ("price", "0.5")]),
        ("3", &[("name", "carrot"), ("kind", "veg"), ("price", "0.8")]),
        ("4", &[("name", "daikon"), ("kind", "veg"), ("price", "2.0")]),
        ("5", &[("name", "eel"), ("kind", "fish"), ("price", "9.0")]),
        ("6", &[("name", "flounder"), ("kind", "fish"), ("price", "7.5")]),
    ];
    for (pkey, columns) in rows {
        db.put(pkey.as_bytes(), &cols(columns)).expect("seed");
    }
}

fn sorted(mut keys: Vec<Vec<u8>>) -> Vec<Vec<u8>> {
    keys.sort();
    keys
}

fn pkeys(keys: &[&str]) -> Vec<Vec<u8>> {
    keys.iter().map(|k| k.as_bytes().to_vec()).collect()
}

#[test]
fn string_conditions() {
    let (_dir, path) = scratch("str.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fruit")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["1", "2"]));

    let hits = db
        .query()
        .add_cond("name", Cond::StrBw, "f")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["6"]));

    let hits = db
        .query()
        .add_cond("name", Cond::StrInc, "an")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["2"]));

    let hits = db
        .query()
        .add_cond("kind", Cond::StrOrEq, "veg,fish")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["3", "4", "5", "6"]));
}

#[test]
fn numeric_conditions() {
    let (_dir, path) = scratch("num.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let hits = db
        .query()
        .add_cond("price", Cond::NumGt, "2")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["5", "6"]));

    let hits = db
        .query()
        .add_cond("price", Cond::NumBt, "0.8 2.0")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["1", "3", "4"]));

    let hits = db
        .query()
        .add_cond("price", Cond::NumLe, "0.8")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["2", "3"]));
}

#[test]
fn conditions_combine_and_negate() {
    let (_dir, path) = scratch("combo.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fish")
        .add_cond("price", Cond::NumLt, "8")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["6"]));

    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fruit")
        .negate()
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["3", "4", "5", "6"]));

    // The empty column name matches against the primary key.
    let hits = db
        .query()
        .add_cond("", Cond::NumGe, "5")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["5", "6"]));
}

#[test]
fn index_served_queries_match_full_scans() {
    let (_dir, path) = scratch("idx.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let scan = |db: &TableDb| -> (Vec<Vec<u8>>, Vec<Vec<u8>>, Vec<Vec<u8>>) {
        let eq = db
            .query()
            .add_cond("kind", Cond::StrEq, "veg")
            .search()
            .expect("eq");
        let gt = db
            .query()
            .add_cond("price", Cond::NumGt, "1")
            .search()
            .expect("gt");
        let bw = db
            .query()
            .add_cond("name", Cond::StrBw, "b")
            .search()
            .expect("bw");
        (sorted(eq), sorted(gt), sorted(bw))
    };
    let unindexed = scan(&db);

    db.set_index("kind", IndexKind::Lexical).expect("index");
    db.set_index("price", IndexKind::Decimal).expect("index");
    db.set_index("name", IndexKind::Lexical).expect("index");
    assert_eq!(scan(&db), unindexed);

    // no_index forces the full scan path and must agree too.
    let suppressed = db
        .query()
        .add_cond("kind", Cond::StrEq, "veg")
        .no_index()
        .search()
        .expect("suppressed");
    assert_eq!(sorted(suppressed), unindexed.0);
}

#[test]
fn indexes_follow_updates_and_deletes() {
    let (_dir, path) = scratch("maint.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    db.set_index("kind", IndexKind::Lexical).expect("index");
    seed(&db);

    db.put(b"2", &cols(&[("name", "banana"), ("kind", "veg")]))
        .expect("recategorize");
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fruit")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["1"]));

    assert!(db.out(b"3").expect("out"));
    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "veg")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["2", "4"]));
}

#[test]
fn order_and_limit() {
    let (_dir, path) = scratch("order.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let hits = db
        .query()
        .add_cond("price", Cond::NumGt, "0")
        .set_order("price", Order::NumDesc)
        .search()
        .expect("search");
    assert_eq!(hits, pkeys(&["5", "6", "4", "1", "3", "2"]));

    let hits = db
        .query()
        .add_cond("price", Cond::NumGt, "0")
        .set_order("price", Order::NumDesc)
        .set_limit(2, 1)
        .search()
        .expect("search");
    assert_eq!(hits, pkeys(&["6", "4"]));

    let hits = db
        .query()
        .add_cond("kind", Cond::StrEq, "fruit")
        .set_order("name", Order::StrDesc)
        .search()
        .expect("search");
    assert_eq!(hits, pkeys(&["2", "1"]));
}

#[test]
fn metasearch_combines_result_sets() {
    let (_dir, path) = scratch("meta.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let fruit = db.query().add_cond("kind", Cond::StrEq, "fruit");
    let cheap = db.query().add_cond("price", Cond::NumLt, "1");

    let union = Query::metasearch(&[fruit.clone(), cheap.clone()], MetaOp::Union).expect("union");
    assert_eq!(sorted(union), pkeys(&["1", "2", "3"]));

    let both =
        Query::metasearch(&[fruit.clone(), cheap.clone()], MetaOp::Intersect).expect("intersect");
    assert_eq!(sorted(both), pkeys(&["2"]));

    let diff = Query::metasearch(&[fruit, cheap], MetaOp::Diff).expect("diff");
    assert_eq!(sorted(diff), pkeys(&["1"]));
}

#[test]
fn search_out_deletes_matches() {
    let (_dir, path) = scratch("del.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    seed(&db);
    let removed = db
        .query()
        .add_cond("kind", Cond::StrEq, "fish")
        .search_out()
        .expect("search_out");
    assert_eq!(removed, 2);
    assert_eq!(db.rnum(), 4);
    assert_eq!(db.get(b"5").expect("get"), None);
    assert_eq!(
        db.query()
            .add_cond("kind", Cond::StrEq, "fish")
            .count()
            .expect("count"),
        0
    );
}

#[test]
fn token_conditions() {
    let (_dir, path) = scratch("tok.db");
    let db = TableDb::open(&path, OpenMode::writer()).expect("open");
    db.put(b"1", &cols(&[("tags", "red,round,sweet")])).expect("put");
    db.put(b"2", &cols(&[("tags", "red,long")])).expect("put");
    db.put(b"3", &cols(&[("tags", "green round")])).expect("put");

    let hits = db
        .query()
        .add_cond("tags", Cond::StrAnd, "red,round")
        .search()
        .expect("and");
    assert_eq!(sorted(hits), pkeys(&["1"]));

    let hits = db
        .query()
        .add_cond("tags", Cond::StrOr, "long round")
        .search()
        .expect("or");
    assert_eq!(sorted(hits), pkeys(&["1", "2", "3"]));
}

#[test]
fn queries_survive_reopen_with_indexes() {
    let (_dir, path) = scratch("reopen.db");
    {
        let db = TableDb::open(&path, OpenMode::writer()).expect("open");
        seed(&db);
        db.set_index("price", IndexKind::Decimal).expect("index");
        db.close().expect("close");
    }
    let db = TableDb::open(&path, OpenMode::writer()).expect("reopen");
    assert_eq!(
        db.indexed_columns(),
        vec![("price".to_string(), IndexKind::Decimal)]
    );
    let hits = db
        .query()
        .add_cond("price", Cond::NumGe, "7.5")
        .search()
        .expect("search");
    assert_eq!(sorted(hits), pkeys(&["5", "6"]));
}
