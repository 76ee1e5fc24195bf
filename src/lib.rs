//! Embedded key-value and table storage engine.
//!
//! Tansu stores records in single files with three flavours on a shared
//! page kernel:
//!
//! - [`HashDb`]: unordered key-value store with hashed bucket chains.
//! - [`BtreeDb`]: ordered store with duplicate keys, range scans, and
//!   [`Cursor`] traversal.
//! - [`TableDb`]: column records addressed by primary key, with optional
//!   secondary indexes and a [`Query`] builder.
//!
//! All stores share fixed-size checksummed pages, an LRU page cache,
//! overflow chains for large values, and rollback-journal transactions
//! that survive crashes.
//!
//! ```no_run
//! use tansu::{BtreeDb, OpenMode};
//!
//! # fn main() -> tansu::Result<()> {
//! let db = BtreeDb::open("data.tansu", OpenMode::writer())?;
//! db.put(b"alpha", b"1")?;
//! assert_eq!(db.get(b"alpha")?, Some(b"1".to_vec()));
//! # Ok(())
//! # }
//! ```

pub mod btree;
pub mod config;
pub mod error;
pub mod hash;
pub mod table;

mod journal;
mod logging;
mod pager;
mod storage;

pub use btree::{BtreeDb, BtreeIter, Cursor, CursorPutMode};
pub use config::{Comparator, Config, OpenMode};
pub use error::{Result, TansuError};
pub use hash::{HashDb, HashIter};
pub use logging::init_logging;
pub use storage::{Stats, StoreKind};
pub use table::{Cond, IndexKind, MetaOp, Order, Query, TableDb, NUM_COLUMN};
