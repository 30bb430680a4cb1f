//! Test support utilities shared by the workspace's integration tests:
//! temp-directory databases that can be closed and reopened in place, plus
//! small helpers for column masks and update vectors.

use std::path::PathBuf;

use common::Config;
use database::Database;
use engine::Record;
use tempfile::TempDir;

/// A database rooted in a temp directory that outlives close/reopen cycles.
pub struct TestDb {
    pub db: Database,
    dir: TempDir,
    config: Config,
}

impl TestDb {
    /// Closes the database cleanly and reopens it over the same folder.
    pub fn reopen(mut self) -> TestDb {
        self.db.close().expect("clean close");
        let db = Database::open_with_config(self.config.clone()).expect("reopen");
        TestDb {
            db,
            dir: self.dir,
            config: self.config,
        }
    }

    pub fn path(&self) -> PathBuf {
        self.dir.path().to_path_buf()
    }
}

/// Fresh database with default cache/merge settings.
pub fn test_db() -> TestDb {
    test_db_with(64, 8)
}

/// Fresh database with explicit buffer-pool and merge-epoch sizing.
pub fn test_db_with(cache_pages: usize, merge_epoch: usize) -> TestDb {
    let dir = TempDir::new().expect("temp dir");
    let config = Config::builder()
        .data_dir(dir.path().to_path_buf())
        .cache_pages(cache_pages)
        .merge_epoch(merge_epoch)
        .build();
    let db = Database::open_with_config(config.clone()).expect("open");
    TestDb { db, dir, config }
}

/// Mask selecting every column of an `n`-column table.
pub fn all_columns(n: usize) -> Vec<bool> {
    vec![true; n]
}

/// Update vector touching nothing.
pub fn no_change(n: usize) -> Vec<Option<i64>> {
    vec![None; n]
}

/// Unwraps a fully projected record into plain values.
pub fn row_values(record: &Record) -> Vec<i64> {
    record
        .columns
        .iter()
        .map(|v| v.expect("column was projected"))
        .collect()
}

/// Tiny deterministic generator for reproducible "random" workloads.
/// (Multiplier from Knuth's MMIX LCG.)
pub struct Lcg(u64);

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Self(seed)
    }

    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0
    }

    /// Uniform-ish draw in `0..bound`.
    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Convenient re-exports for integration tests.
pub mod prelude {
    pub use crate::{all_columns, no_change, row_values, test_db, test_db_with, Lcg, TestDb};
}
