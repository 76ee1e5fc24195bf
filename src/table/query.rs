//! Query builder for table stores.
//!
//! A query is a list of column conditions plus optional ordering and a
//! limit window. The first non-negated, non-suppressed condition whose
//! column has an index of a compatible kind is served by an index range
//! scan; every candidate is still checked against the full condition list,
//! so the index only narrows the work.

use std::collections::{BTreeMap, HashSet};

use crate::btree::BtreeDb;
use crate::error::Result;

use super::columns::{atof, decode_columns, encode_decimal};
use super::{IndexKind, TableDb};

/// Condition operators. `Str*` compare column text, `Num*` compare the
/// column parsed as a decimal number (non-numeric text counts as zero).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Cond {
    /// Exactly equal.
    StrEq,
    /// Contains the expression.
    StrInc,
    /// Begins with the expression.
    StrBw,
    /// Ends with the expression.
    StrEw,
    /// Contains every token of the expression (comma or space separated).
    StrAnd,
    /// Contains at least one token of the expression.
    StrOr,
    /// Equals one of the tokens of the expression.
    StrOrEq,
    NumEq,
    NumGt,
    NumGe,
    NumLt,
    NumLe,
    /// Between the two numbers of the expression, inclusive.
    NumBt,
    /// Equals one of the numbers of the expression.
    NumOrEq,
}

impl Cond {
    fn indexable_with(self, kind: IndexKind) -> bool {
        match self {
            Cond::StrEq | Cond::StrBw | Cond::StrOrEq => kind == IndexKind::Lexical,
            Cond::NumEq
            | Cond::NumGt
            | Cond::NumGe
            | Cond::NumLt
            | Cond::NumLe
            | Cond::NumBt
            | Cond::NumOrEq => kind == IndexKind::Decimal,
            _ => false,
        }
    }
}

/// Result ordering for [`Query::set_order`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Order {
    StrAsc,
    StrDesc,
    NumAsc,
    NumDesc,
}

/// Set combinator for [`Query::metasearch`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MetaOp {
    Union,
    Intersect,
    Diff,
}

#[derive(Debug, Clone)]
struct Condition {
    column: String,
    op: Cond,
    expr: String,
    negate: bool,
    no_index: bool,
}

/// A query under construction. Build with the chained setters, then run
/// with [`Query::search`], [`Query::count`], or [`Query::search_out`].
#[derive(Clone)]
pub struct Query {
    db: TableDb,
    conds: Vec<Condition>,
    order: Option<(String, Order)>,
    limit: Option<usize>,
    skip: usize,
}

impl Query {
    pub(crate) fn new(db: TableDb) -> Self {
        Self {
            db,
            conds: Vec::new(),
            order: None,
            limit: None,
            skip: 0,
        }
    }

    /// Adds a condition. The empty column name tests the primary key.
    pub fn add_cond(mut self, column: &str, op: Cond, expr: &str) -> Self {
        self.conds.push(Condition {
            column: column.to_string(),
            op,
            expr: expr.to_string(),
            negate: false,
            no_index: false,
        });
        self
    }

    /// Inverts the most recently added condition.
    pub fn negate(mut self) -> Self {
        if let Some(cond) = self.conds.last_mut() {
            cond.negate = true;
        }
        self
    }

    /// Forbids the most recently added condition from using an index.
    pub fn no_index(mut self) -> Self {
        if let Some(cond) = self.conds.last_mut() {
            cond.no_index = true;
        }
        self
    }

    /// Orders the result by a column. The empty column name orders by the
    /// primary key.
    pub fn set_order(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    /// Keeps at most `max` results after dropping the first `skip`.
    pub fn set_limit(mut self, max: usize, skip: usize) -> Self {
        self.limit = Some(max);
        self.skip = skip;
        self
    }

    /// Primary keys of the matching records.
    pub fn search(&self) -> Result<Vec<Vec<u8>>> {
        let (primary, plan) = {
            let inner = self.db.inner.lock();
            let plan = self.conds.iter().find_map(|cond| {
                if cond.negate || cond.no_index || cond.column.is_empty() {
                    return None;
                }
                let index = inner.indexes.get(&cond.column)?;
                cond.op
                    .indexable_with(index.kind)
                    .then(|| (index.db.clone(), cond.clone()))
            });
            (inner.primary.clone(), plan)
        };

        let mut hits: Vec<(Vec<u8>, BTreeMap<String, String>)> = Vec::new();
        match plan {
            Some((index, cond)) => {
                for pkey in index_scan(&index, &cond)? {
                    if let Some(raw) = primary.get(&pkey)? {
                        let cols = decode_columns(&raw)?;
                        if self.matches(&pkey, &cols) {
                            hits.push((pkey, cols));
                        }
                    }
                }
            }
            None => {
                for item in primary.iter() {
                    let (pkey, raw) = item?;
                    let cols = decode_columns(&raw)?;
                    if self.matches(&pkey, &cols) {
                        hits.push((pkey, cols));
                    }
                }
            }
        }

        if let Some((column, order)) = &self.order {
            sort_hits(&mut hits, column, *order);
        }
        let taken = hits
            .into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .map(|(pkey, _)| pkey)
            .collect();
        Ok(taken)
    }

    /// Number of matching records, honoring the limit window.
    pub fn count(&self) -> Result<usize> {
        Ok(self.search()?.len())
    }

    /// Deletes the matching records. Returns how many were removed.
    pub fn search_out(&self) -> Result<usize> {
        let pkeys = self.search()?;
        let mut removed = 0;
        for pkey in &pkeys {
            if self.db.out(pkey)? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Combines the result sets of several queries by primary key. Order
    /// follows the first query, with union extras appended in query order.
    pub fn metasearch(queries: &[Query], op: MetaOp) -> Result<Vec<Vec<u8>>> {
        let mut queries = queries.iter();
        let first = match queries.next() {
            Some(query) => query,
            None => return Ok(Vec::new()),
        };
        let mut result = first.search()?;
        match op {
            MetaOp::Union => {
                let mut seen: HashSet<Vec<u8>> = result.iter().cloned().collect();
                for query in queries {
                    for pkey in query.search()? {
                        if seen.insert(pkey.clone()) {
                            result.push(pkey);
                        }
                    }
                }
            }
            MetaOp::Intersect => {
                for query in queries {
                    let keep: HashSet<Vec<u8>> = query.search()?.into_iter().collect();
                    result.retain(|pkey| keep.contains(pkey));
                }
            }
            MetaOp::Diff => {
                for query in queries {
                    let drop: HashSet<Vec<u8>> = query.search()?.into_iter().collect();
                    result.retain(|pkey| !drop.contains(pkey));
                }
            }
        }
        Ok(result)
    }

    fn matches(&self, pkey: &[u8], cols: &BTreeMap<String, String>) -> bool {
        self.conds.iter().all(|cond| eval(cond, pkey, cols))
    }
}

fn eval(cond: &Condition, pkey: &[u8], cols: &BTreeMap<String, String>) -> bool {
    let pkey_text;
    let value: Option<&str> = if cond.column.is_empty() {
        pkey_text = String::from_utf8_lossy(pkey);
        Some(pkey_text.as_ref())
    } else {
        cols.get(&cond.column).map(String::as_str)
    };
    let hit = match value {
        Some(value) => op_match(cond.op, value, &cond.expr),
        None => false,
    };
    hit != cond.negate
}

fn tokens(text: &str) -> Vec<&str> {
    text.split([',', ' ']).filter(|t| !t.is_empty()).collect()
}

fn op_match(op: Cond, value: &str, expr: &str) -> bool {
    match op {
        Cond::StrEq => value == expr,
        Cond::StrInc => value.contains(expr),
        Cond::StrBw => value.starts_with(expr),
        Cond::StrEw => value.ends_with(expr),
        Cond::StrAnd => {
            let have: HashSet<&str> = tokens(value).into_iter().collect();
            tokens(expr).into_iter().all(|t| have.contains(t))
        }
        Cond::StrOr => {
            let have: HashSet<&str> = tokens(value).into_iter().collect();
            tokens(expr).into_iter().any(|t| have.contains(t))
        }
        Cond::StrOrEq => tokens(expr).into_iter().any(|t| t == value),
        Cond::NumEq => atof(value) == atof(expr),
        Cond::NumGt => atof(value) > atof(expr),
        Cond::NumGe => atof(value) >= atof(expr),
        Cond::NumLt => atof(value) < atof(expr),
        Cond::NumLe => atof(value) <= atof(expr),
        Cond::NumBt => {
            let bounds = tokens(expr);
            let a = bounds.first().map(|t| atof(t)).unwrap_or(0.0);
            let b = bounds.get(1).map(|t| atof(t)).unwrap_or(a);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            let x = atof(value);
            lo <= x && x <= hi
        }
        Cond::NumOrEq => {
            let x = atof(value);
            tokens(expr).into_iter().any(|t| atof(t) == x)
        }
    }
}

fn sort_hits(hits: &mut [(Vec<u8>, BTreeMap<String, String>)], column: &str, order: Order) {
    let text_key = |record: &(Vec<u8>, BTreeMap<String, String>)| -> String {
        if column.is_empty() {
            String::from_utf8_lossy(&record.0).into_owned()
        } else {
            record.1.get(column).cloned().unwrap_or_default()
        }
    };
    match order {
        Order::StrAsc => hits.sort_by_key(text_key),
        Order::StrDesc => {
            hits.sort_by(|a, b| text_key(b).cmp(&text_key(a)));
        }
        Order::NumAsc => {
            hits.sort_by(|a, b| atof(&text_key(a)).total_cmp(&atof(&text_key(b))));
        }
        Order::NumDesc => {
            hits.sort_by(|a, b| atof(&text_key(b)).total_cmp(&atof(&text_key(a))));
        }
    }
}

/// Candidate primary keys for an indexed condition, in index order.
fn index_scan(index: &BtreeDb, cond: &Condition) -> Result<Vec<Vec<u8>>> {
    match cond.op {
        Cond::StrEq => {
            let mut prefix = cond.expr.as_bytes().to_vec();
            prefix.push(0);
            prefix_values(index, &prefix)
        }
        Cond::StrBw => prefix_values(index, cond.expr.as_bytes()),
        Cond::StrOrEq => {
            let mut seen = HashSet::new();
            let mut pkeys = Vec::new();
            for token in tokens(&cond.expr) {
                let mut prefix = token.as_bytes().to_vec();
                prefix.push(0);
                for pkey in prefix_values(index, &prefix)? {
                    if seen.insert(pkey.clone()) {
                        pkeys.push(pkey);
                    }
                }
            }
            Ok(pkeys)
        }
        Cond::NumEq => {
            let mut prefix = encode_decimal(atof(&cond.expr)).to_vec();
            prefix.push(0);
            prefix_values(index, &prefix)
        }
        Cond::NumGt => range_values(index, Some((atof(&cond.expr), false)), None),
        Cond::NumGe => range_values(index, Some((atof(&cond.expr), true)), None),
        Cond::NumLt => range_values(index, None, Some((atof(&cond.expr), false))),
        Cond::NumLe => range_values(index, None, Some((atof(&cond.expr), true))),
        Cond::NumBt => {
            let bounds = tokens(&cond.expr);
            let a = bounds.first().map(|t| atof(t)).unwrap_or(0.0);
            let b = bounds.get(1).map(|t| atof(t)).unwrap_or(a);
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            range_values(index, Some((lo, true)), Some((hi, true)))
        }
        Cond::NumOrEq => {
            let mut seen = HashSet::new();
            let mut pkeys = Vec::new();
            for token in tokens(&cond.expr) {
                let mut prefix = encode_decimal(atof(token)).to_vec();
                prefix.push(0);
                for pkey in prefix_values(index, &prefix)? {
                    if seen.insert(pkey.clone()) {
                        pkeys.push(pkey);
                    }
                }
            }
            Ok(pkeys)
        }
        _ => Ok(Vec::new()),
    }
}

fn prefix_values(index: &BtreeDb, prefix: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut pkeys = Vec::new();
    let mut cursor = index.cursor();
    if !cursor.jump(prefix)? {
        return Ok(pkeys);
    }
    loop {
        match cursor.key()? {
            Some(key) if key.starts_with(prefix) => {
                if let Some(value) = cursor.value()? {
                    pkeys.push(value);
                }
            }
            _ => break,
        }
        if !cursor.next()? {
            break;
        }
    }
    Ok(pkeys)
}

/// Walks a decimal index between numeric bounds. Entry keys start with the
/// 8-byte order-preserving encoding of the column value.
fn range_values(
    index: &BtreeDb,
    lower: Option<(f64, bool)>,
    upper: Option<(f64, bool)>,
) -> Result<Vec<Vec<u8>>> {
    let mut pkeys = Vec::new();
    let mut cursor = index.cursor();
    let positioned = match lower {
        Some((bound, _)) => cursor.jump(&encode_decimal(bound))?,
        None => cursor.first()?,
    };
    if !positioned {
        return Ok(pkeys);
    }
    loop {
        let key = match cursor.key()? {
            Some(key) if key.len() >= 8 => key,
            _ => break,
        };
        let encoded: [u8; 8] = match key[..8].try_into() {
            Ok(encoded) => encoded,
            Err(_) => break,
        };
        if let Some((bound, inclusive)) = lower {
            let low = encode_decimal(bound);
            if encoded == low && !inclusive {
                if !cursor.next()? {
                    break;
                }
                continue;
            }
        }
        if let Some((bound, inclusive)) = upper {
            let high = encode_decimal(bound);
            if encoded > high || (encoded == high && !inclusive) {
                break;
            }
        }
        if let Some(value) = cursor.value()? {
            pkeys.push(value);
        }
        if !cursor.next()? {
            break;
        }
    }
    Ok(pkeys)
}
