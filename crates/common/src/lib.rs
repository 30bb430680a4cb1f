#[cfg(test)]
mod tests;

use serde::{Deserialize, Serialize};
use std::{io, path::PathBuf};
use thiserror::Error;

/// Index of a physical column within a table's column files.
///
/// Columns `0..NUM_INTERNAL_COLUMNS` are bookkeeping; user feature `j` lives
/// in physical column `NUM_INTERNAL_COLUMNS + j`.
pub type ColumnId = usize;

/// RID column: a record's own identifier, invalidated on delete.
pub const RID_COLUMN: ColumnId = 0;
/// Indirection column: for base records the RID of the latest tail update,
/// for tail records the RID of the previous update in the chain.
pub const INDIRECTION_COLUMN: ColumnId = 1;
/// Schema-encoding column: bitmap with bit `j` set once feature `j` has been
/// updated on this record.
pub const SCHEMA_ENCODING_COLUMN: ColumnId = 2;
/// Timestamp column: microseconds since the epoch at record creation.
pub const TIMESTAMP_COLUMN: ColumnId = 3;
/// Number of bookkeeping columns preceding the user features.
pub const NUM_INTERNAL_COLUMNS: usize = 4;

/// Which of the two page ranges a page or record belongs to.
///
/// Base pages hold the immutable initial version of every record; tail pages
/// hold appended update deltas.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RangeKind {
    Base,
    Tail,
}

impl RangeKind {
    /// Single-character tag used in column file names (`"{appendix}_{b|t}_{col}"`).
    pub fn tag(self) -> char {
        match self {
            RangeKind::Base => 'b',
            RangeKind::Tail => 't',
        }
    }

    /// Initial record counter of a fresh page: base pages reserve the counter
    /// and lineage words, tail pages only the counter.
    pub fn initial_records(self) -> u64 {
        match self {
            RangeKind::Base => 2,
            RangeKind::Tail => 1,
        }
    }

    /// First payload word index, i.e. where the RID allocator wraps to after
    /// crossing into a fresh page.
    pub fn first_payload_word(self) -> u32 {
        match self {
            RangeKind::Base => 2,
            RangeKind::Tail => 1,
        }
    }
}

/// Record identifier: the location of a one-word record slot within a range.
///
/// Packed on disk as two little-endian `u32`s, `(page_index, byte_offset)`.
/// The derived ordering is lexicographic by `(page_index, byte_offset)`,
/// which is exactly the comparison the merge lineage protocol needs.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Rid {
    pub page_index: u32,
    pub byte_offset: u32,
}

impl Rid {
    /// Sentinel marking deleted records and "no update yet" indirections.
    pub const INVALID: Rid = Rid {
        page_index: u32::MAX,
        byte_offset: u32::MAX,
    };

    pub fn new(page_index: u32, byte_offset: u32) -> Self {
        Self {
            page_index,
            byte_offset,
        }
    }

    pub fn is_invalid(self) -> bool {
        self == Self::INVALID
    }

    /// Packs as `(page_index: u32 LE, byte_offset: u32 LE)`.
    pub fn to_bytes(self) -> [u8; 8] {
        let mut buf = [0u8; 8];
        buf[..4].copy_from_slice(&self.page_index.to_le_bytes());
        buf[4..].copy_from_slice(&self.byte_offset.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: [u8; 8]) -> Self {
        Self {
            page_index: u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]),
            byte_offset: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        }
    }
}

/// Identity of a cached page: the triple the buffer pool keys frames by.
///
/// A page itself does not know its identity; it lives here.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PageKey {
    pub range: RangeKind,
    pub page_index: u32,
    pub column: ColumnId,
}

impl PageKey {
    pub fn new(range: RangeKind, page_index: u32, column: ColumnId) -> Self {
        Self {
            range,
            page_index,
            column,
        }
    }
}

/// Canonical error type shared across the engine's subsystems.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("offset {offset} out of bounds")]
    OutOfBounds { offset: usize },
    #[error("expected a {expected}-byte word, got {got} bytes")]
    BadWordSize { expected: usize, got: usize },
    #[error("duplicate primary key {0}")]
    DuplicateKey(i64),
    #[error("column {column} has no index")]
    NotIndexed { column: ColumnId },
    #[error("expected {expected} columns, got {got}")]
    SchemaMismatch { expected: usize, got: usize },
    #[error("lock contended")]
    LockContended,
    #[error("corrupt storage: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Result alias that carries a `DbError`.
pub type DbResult<T> = Result<T, DbError>;

/// Runtime configuration for a database instance.
///
/// Page geometry is compile-time (`storage::PAGE_SIZE`, `storage::WORD_SIZE`);
/// everything that tests want to shrink is runtime.
///
/// # Example
/// ```
/// use common::Config;
/// use std::path::PathBuf;
///
/// let config = Config::builder()
///     .data_dir(PathBuf::from("./my_db"))
///     .cache_pages(64)
///     .merge_epoch(2)
///     .build();
/// assert_eq!(config.merge_epoch, 2);
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, bon::Builder)]
pub struct Config {
    /// Directory where column files, index files, and table metadata live.
    #[builder(default = PathBuf::from("./lstore_data"))]
    pub data_dir: PathBuf,
    /// Number of pages the buffer pool keeps resident.
    #[builder(default = 256)]
    pub cache_pages: usize,
    /// Number of freshly allocated tail pages between background merges.
    #[builder(default = 8)]
    pub merge_epoch: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./lstore_data"),
            cache_pages: 256,
            merge_epoch: 8,
        }
    }
}

/// Convenient re-exports for downstream crates.
pub mod prelude {
    pub use crate::{
        ColumnId, Config, DbError, DbResult, PageKey, RangeKind, Rid,
        INDIRECTION_COLUMN, NUM_INTERNAL_COLUMNS, RID_COLUMN, SCHEMA_ENCODING_COLUMN,
        TIMESTAMP_COLUMN,
    };
}
