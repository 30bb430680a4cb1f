//! Database-object lifecycle and the user-facing query boundary.
//!
//! Thin adapters around the record engine: `Database` manages named tables
//! and their on-disk files, `Query` translates user calls into table
//! operations with the boundary's lenient error reporting (failures are
//! logged and reported as `false`/empty, never panics).

use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use common::{Config, DbError, DbResult, RangeKind, NUM_INTERNAL_COLUMNS};
use engine::{Record, Table};
use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Schema facts that cannot be recovered from the column files alone.
#[derive(Debug, Serialize, Deserialize)]
struct TableMeta {
    num_features: usize,
    key_index: usize,
}

/// Manages one folder of tables.
pub struct Database {
    config: Config,
    tables: HashMap<String, Arc<Table>>,
}

impl Database {
    /// Opens the database folder, creating it if missing.
    pub fn open(folder: impl Into<PathBuf>) -> DbResult<Self> {
        Self::open_with_config(Config::builder().data_dir(folder.into()).build())
    }

    pub fn open_with_config(config: Config) -> DbResult<Self> {
        fs::create_dir_all(&config.data_dir)?;
        info!(data_dir = %config.data_dir.display(), "database opened");
        Ok(Self {
            config,
            tables: HashMap::new(),
        })
    }

    /// Creates (or recreates, truncating) a table with `num_features` user
    /// columns whose primary key lives at `key_index`.
    pub fn create_table(
        &mut self,
        name: &str,
        num_features: usize,
        key_index: usize,
    ) -> DbResult<Arc<Table>> {
        let appendix = self.appendix(name);

        for kind in [RangeKind::Base, RangeKind::Tail] {
            for column in 0..num_features + NUM_INTERNAL_COLUMNS {
                File::create(format!("{appendix}_{}_{column}", kind.tag()))?;
            }
        }
        File::create(format!("{appendix}_index"))?;

        let meta = TableMeta {
            num_features,
            key_index,
        };
        let encoded = serde_json::to_string_pretty(&meta)
            .map_err(|e| DbError::Corrupt(format!("serialize table metadata failed: {e}")))?;
        fs::write(format!("{appendix}_meta"), encoded)?;

        let table = Arc::new(Table::create(&appendix, num_features, key_index, &self.config)?);
        self.tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Returns an open table, reloading schema and primary index from disk
    /// if this is the first access since open.
    pub fn get_table(&mut self, name: &str) -> DbResult<Arc<Table>> {
        if let Some(table) = self.tables.get(name) {
            return Ok(Arc::clone(table));
        }

        let appendix = self.appendix(name);
        let raw = fs::read_to_string(format!("{appendix}_meta"))?;
        let meta: TableMeta = serde_json::from_str(&raw)
            .map_err(|e| DbError::Corrupt(format!("invalid table metadata: {e}")))?;

        let table = Arc::new(Table::create(
            &appendix,
            meta.num_features,
            meta.key_index,
            &self.config,
        )?);
        table.load_primary_index(Path::new(&format!("{appendix}_index")))?;

        self.tables.insert(name.to_string(), Arc::clone(&table));
        Ok(table)
    }

    /// Closes every open table: final merge pass, buffer flush, and primary
    /// index save. The engine flushes on shutdown; there is no WAL.
    pub fn close(&mut self) -> DbResult<()> {
        for (name, table) in self.tables.drain() {
            table.close()?;
            let index_path = format!("{}_index", table.appendix());
            table.save_primary_index(Path::new(&index_path))?;
            info!(name, "table saved");
        }
        Ok(())
    }

    /// Unregisters a table. Returns `false` for unknown names.
    pub fn drop_table(&mut self, name: &str) -> bool {
        if self.tables.remove(name).is_none() {
            warn!(name, "drop of unknown table");
            return false;
        }
        true
    }

    fn appendix(&self, name: &str) -> String {
        self.config
            .data_dir
            .join(name)
            .to_string_lossy()
            .into_owned()
    }
}

/// User-facing query interface over one table.
pub struct Query {
    table: Arc<Table>,
}

impl Query {
    pub fn new(table: Arc<Table>) -> Self {
        Self { table }
    }

    pub fn table(&self) -> &Arc<Table> {
        &self.table
    }

    /// Inserts a record; `false` on schema mismatch or duplicate key.
    pub fn insert(&self, values: &[i64]) -> bool {
        match self.table.insert(values) {
            Ok(()) => true,
            Err(err) => {
                warn!(%err, "insert failed");
                false
            }
        }
    }

    /// Selects records matching `key` in `key_column`, projected by `mask`.
    pub fn select(&self, key: i64, key_column: usize, mask: &[bool]) -> Vec<Record> {
        match self.table.select(key, key_column, mask) {
            Ok(records) => records,
            Err(err) => {
                warn!(%err, "select failed");
                Vec::new()
            }
        }
    }

    /// Updates `key`'s record; `None` values leave columns unchanged.
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> bool {
        match self.table.update(key, values) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(%err, "update failed");
                false
            }
        }
    }

    pub fn delete(&self, key: i64) -> bool {
        match self.table.delete(key) {
            Ok(deleted) => deleted,
            Err(err) => {
                warn!(%err, "delete failed");
                false
            }
        }
    }

    /// Sums `column` over existing keys in `[start, end]`, inclusive.
    pub fn sum(&self, start: i64, end: i64, column: usize) -> i64 {
        match self.table.sum(start, end, column) {
            Ok(total) => total,
            Err(err) => {
                warn!(%err, "sum failed");
                0
            }
        }
    }

    pub fn increment(&self, key: i64, column: usize) -> bool {
        match self.table.increment(key, column) {
            Ok(updated) => updated,
            Err(err) => {
                warn!(%err, "increment failed");
                false
            }
        }
    }
}
