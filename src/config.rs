//! Store configuration and open-mode flags.
//!
//! Every store takes an [`OpenMode`] describing how the file is opened and
//! locked, and optionally a [`Config`] bundling the tuning knobs the engine
//! exposes (page size, cache sizes, bucket count, sync policy). Presets
//! cover the common cases.

use std::cmp::Ordering;

/// Key comparator used by the ordered (B-tree) stores.
///
/// The comparator is fixed when the database file is created and its tag is
/// recorded in the header. A file created with [`Comparator::Custom`] must
/// be reopened with a custom comparator or the open fails.
#[derive(Debug, Clone, Copy)]
pub enum Comparator {
    /// Bytewise lexical comparison (default).
    Lexical,
    /// Compare keys as decimal numbers, falling back to lexical order for
    /// keys that do not parse.
    Decimal,
    /// User-supplied comparison function.
    Custom(fn(&[u8], &[u8]) -> Ordering),
}

impl Comparator {
    pub(crate) fn tag(&self) -> u8 {
        match self {
            Comparator::Lexical => 0,
            Comparator::Decimal => 1,
            Comparator::Custom(_) => 2,
        }
    }

    /// Compares two keys under this comparator.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self {
            Comparator::Lexical => a.cmp(b),
            Comparator::Decimal => {
                let na = parse_decimal(a);
                let nb = parse_decimal(b);
                match (na, nb) {
                    (Some(x), Some(y)) => x.total_cmp(&y).then_with(|| a.cmp(b)),
                    (Some(_), None) => Ordering::Less,
                    (None, Some(_)) => Ordering::Greater,
                    (None, None) => a.cmp(b),
                }
            }
            Comparator::Custom(f) => f(a, b),
        }
    }
}

impl Default for Comparator {
    fn default() -> Self {
        Comparator::Lexical
    }
}

fn parse_decimal(bytes: &[u8]) -> Option<f64> {
    let text = std::str::from_utf8(bytes).ok()?;
    text.trim().parse::<f64>().ok()
}

/// How a database file is opened and locked.
///
/// The flags mirror the usual reader/writer open semantics: writers take an
/// exclusive advisory lock on the file, readers a shared one. `no_lock`
/// skips locking entirely and `lock_nonblocking` fails fast instead of
/// waiting for a conflicting lock to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenMode {
    /// Open for writing. Readers can only query.
    pub write: bool,
    /// Create the file if it does not exist (writers only).
    pub create: bool,
    /// Truncate an existing file to an empty store (writers only).
    pub truncate: bool,
    /// Skip file locking entirely.
    pub no_lock: bool,
    /// Use a non-blocking lock attempt; a held lock yields `Locked`.
    pub lock_nonblocking: bool,
}

impl OpenMode {
    /// Read-only access with a shared lock.
    pub fn reader() -> Self {
        Self {
            write: false,
            create: false,
            truncate: false,
            no_lock: false,
            lock_nonblocking: false,
        }
    }

    /// Read-write access, creating the file if missing.
    pub fn writer() -> Self {
        Self {
            write: true,
            create: true,
            truncate: false,
            no_lock: false,
            lock_nonblocking: false,
        }
    }

    /// Truncate the store on open.
    pub fn truncate(mut self) -> Self {
        self.truncate = true;
        self
    }

    /// Skip file locking.
    pub fn no_lock(mut self) -> Self {
        self.no_lock = true;
        self
    }

    /// Fail with `Locked` instead of blocking on a held lock.
    pub fn nonblocking(mut self) -> Self {
        self.lock_nonblocking = true;
        self
    }
}

/// Tuning knobs shared by all store flavours.
///
/// `page_size` and `bucket_count` only matter when the file is created (or
/// rebuilt through `optimize`); cache sizes and the sync policy take effect
/// on every open.
#[derive(Debug, Clone, Copy)]
pub struct Config {
    /// Page size in bytes. Power of two, at least 512. Fixed at creation.
    pub page_size: u32,
    /// Number of pages held in the pager cache.
    pub cache_pages: usize,
    /// Bucket count for hash stores. Fixed at creation.
    pub bucket_count: u32,
    /// Entries in the hash store's record cache (0 disables it).
    pub record_cache: usize,
    /// Fsync the data file after every committing operation.
    pub sync_writes: bool,
    /// Key comparator for ordered stores.
    pub comparator: Comparator,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_pages: 256,
            bucket_count: 4096,
            record_cache: 0,
            sync_writes: false,
            comparator: Comparator::Lexical,
        }
    }
}

impl Config {
    /// Fsync-everything configuration for crash-sensitive data.
    pub fn durable() -> Self {
        Self {
            sync_writes: true,
            ..Self::default()
        }
    }

    /// Large caches for read-heavy workloads.
    pub fn cache_heavy() -> Self {
        Self {
            cache_pages: 4096,
            record_cache: 65536,
            ..Self::default()
        }
    }

    /// Sets the comparator, builder-style.
    pub fn with_comparator(mut self, cmp: Comparator) -> Self {
        self.comparator = cmp;
        self
    }

    /// Sets the bucket count, builder-style.
    pub fn with_buckets(mut self, bucket_count: u32) -> Self {
        self.bucket_count = bucket_count;
        self
    }

    /// Sets the page size, builder-style.
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size;
        self
    }
}
