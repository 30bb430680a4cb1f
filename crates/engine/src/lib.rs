//! The record engine: base/tail record lifecycle, indirection chains, and
//! the background merge worker.
//!
//! Base records are written once and never moved. Updates append tail
//! records linked through the indirection column, newest first; the base
//! record always points at its most recent update and the chain terminates
//! at the invalid RID. A per-table merge thread periodically folds recent
//! tail values back into copies of the base pages so point reads stay close
//! to O(1), recording its progress in each page's lineage word.

mod merge;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use ahash::RandomState;
use buffer::PageCache;
use common::{
    ColumnId, Config, DbError, DbResult, RangeKind, Rid, INDIRECTION_COLUMN,
    NUM_INTERNAL_COLUMNS, RID_COLUMN, SCHEMA_ENCODING_COLUMN, TIMESTAMP_COLUMN,
};
use hashbrown::HashMap;
use index::Index;
use lock::LockManager;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use storage::WORD_SIZE;
use tracing::{debug, info};

type Map<K, V> = HashMap<K, V, RandomState>;

/// Logical tuple handed across the engine's interfaces.
///
/// `None` columns mean "not supplied" on tail records and "not selected" on
/// query results.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rid: Rid,
    pub key: i64,
    pub columns: Vec<Option<i64>>,
    pub range: RangeKind,
}

/// Returns whether `feature`'s bit is set in a schema encoding word.
fn is_updated(encoding: u64, feature: ColumnId) -> bool {
    encoding & (1u64 << feature) != 0
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

pub(crate) struct TableCore {
    appendix: String,
    key_index: ColumnId,
    num_columns: usize,
    merge_epoch: usize,
    pub(crate) cache: PageCache,
    lock_manager: LockManager,
    index: Mutex<Index>,
    /// `MQ[feature][base_page_index]`: per-base-page FIFOs of
    /// `(base_rid, tail_rid)` pairs awaiting merge.
    pub(crate) merge_queues: Mutex<Vec<Vec<VecDeque<(Rid, Rid)>>>>,
    /// Tail pages opened since the last merge pass.
    merge_pending: Mutex<usize>,
    trigger: Mutex<bool>,
    trigger_cv: Condvar,
    pub(crate) closed: AtomicBool,
}

/// A multi-column table backed by base/tail column files, with its own
/// buffer pool, indexes, lock registry, and merge thread.
pub struct Table {
    core: Arc<TableCore>,
    merge_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Table {
    /// Opens (or continues) the table stored at the `appendix` path prefix
    /// and starts its merge worker.
    pub fn create(
        appendix: impl Into<String>,
        num_columns: usize,
        key_index: ColumnId,
        config: &Config,
    ) -> DbResult<Table> {
        let appendix = appendix.into();
        let cache = PageCache::new(&appendix, config.cache_pages)?;

        let num_base_pages = cache.last_page_index(RangeKind::Base) as usize + 1;
        let merge_queues = (0..num_columns)
            .map(|_| (0..num_base_pages).map(|_| VecDeque::new()).collect())
            .collect();

        let core = Arc::new(TableCore {
            appendix,
            key_index,
            num_columns,
            merge_epoch: config.merge_epoch,
            cache,
            lock_manager: LockManager::new(),
            index: Mutex::new(Index::new(num_columns, key_index)),
            merge_queues: Mutex::new(merge_queues),
            merge_pending: Mutex::new(0),
            trigger: Mutex::new(false),
            trigger_cv: Condvar::new(),
            closed: AtomicBool::new(false),
        });

        let worker = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("merge".into())
            .spawn(move || merge::run(worker))?;

        info!(appendix = %core.appendix, num_columns, "table opened");
        Ok(Table {
            core,
            merge_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn appendix(&self) -> &str {
        &self.core.appendix
    }

    pub fn key_index(&self) -> ColumnId {
        self.core.key_index
    }

    pub fn num_columns(&self) -> usize {
        self.core.num_columns
    }

    pub fn lock_manager(&self) -> &LockManager {
        &self.core.lock_manager
    }

    /// Signals the merge worker to wind down, joins it (it runs one final
    /// pass covering the open base page), and flushes the buffer pool.
    /// A worker that died mid-pass is reported as `Corrupt` after the flush.
    pub fn close(&self) -> DbResult<()> {
        let handle = self.merge_thread.lock().take();
        let mut worker_panicked = false;
        if let Some(handle) = handle {
            self.core.closed.store(true, Ordering::SeqCst);
            self.core.set_trigger();
            worker_panicked = handle.join().is_err();
            info!(appendix = %self.core.appendix, "table closed");
        }
        self.core.cache.flush()?;
        if worker_panicked {
            return Err(DbError::Corrupt("merge worker panicked".into()));
        }
        Ok(())
    }

    // ---- record operations -------------------------------------------------

    /// Inserts a new record. Fails with `DuplicateKey` before touching any
    /// page if the primary key already exists.
    pub fn insert(&self, values: &[i64]) -> DbResult<()> {
        if values.len() != self.core.num_columns {
            return Err(DbError::SchemaMismatch {
                expected: self.core.num_columns,
                got: values.len(),
            });
        }

        // Check for a duplicate before allocating: a burned RID desyncs the
        // allocator from the page counters across a reopen. The index insert
        // below still enforces uniqueness under its own lock.
        let key = values[self.core.key_index];
        if self.locate(key, self.core.key_index)?.is_some() {
            return Err(DbError::DuplicateKey(key));
        }

        let rid = self.get_new_rid(RangeKind::Base);
        self.core.index.lock().insert(rid, values)?;

        let record = Record {
            rid,
            key,
            columns: values.iter().copied().map(Some).collect(),
            range: RangeKind::Base,
        };
        self.insert_record(&record)
    }

    /// Selects every record matching `key` in `key_column`, projecting the
    /// masked columns. Absent keys yield an empty list.
    pub fn select(&self, key: i64, key_column: ColumnId, mask: &[bool]) -> DbResult<Vec<Record>> {
        if mask.len() != self.core.num_columns {
            return Err(DbError::SchemaMismatch {
                expected: self.core.num_columns,
                got: mask.len(),
            });
        }

        let rids = match self.locate(key, key_column)? {
            Some(rids) => rids,
            None => return Ok(Vec::new()),
        };

        let mut records = Vec::with_capacity(rids.len());
        for rid in rids {
            let mut columns = Vec::with_capacity(self.core.num_columns);
            for feature in 0..self.core.num_columns {
                if mask[feature] {
                    columns.push(Some(self.select_feature(rid, feature)?));
                } else {
                    columns.push(None);
                }
            }
            records.push(Record {
                rid,
                key,
                columns,
                range: RangeKind::Base,
            });
        }
        Ok(records)
    }

    /// Appends a tail record updating `key`. `None` values leave the column
    /// unchanged. Returns `false` when the key does not exist.
    pub fn update(&self, key: i64, values: &[Option<i64>]) -> DbResult<bool> {
        if values.len() != self.core.num_columns {
            return Err(DbError::SchemaMismatch {
                expected: self.core.num_columns,
                got: values.len(),
            });
        }

        let base_rid = {
            let index = self.core.index.lock();
            match index.locate(key, self.core.key_index)? {
                Some(rids) => rids[0],
                None => return Ok(false),
            }
        };

        // Reject a primary-key collision before anything lands in the tail
        // range, so a failed update leaves no partial state.
        if let Some(new_key) = values[self.core.key_index] {
            if new_key != key {
                let index = self.core.index.lock();
                if index.locate(new_key, self.core.key_index)?.is_some() {
                    return Err(DbError::DuplicateKey(new_key));
                }
            }
        }

        let all = vec![true; self.core.num_columns];
        let old = self
            .select(key, self.core.key_index, &all)?
            .into_iter()
            .next()
            .ok_or_else(|| DbError::Corrupt(format!("indexed key {key} has no record")))?;
        let old_values: Vec<i64> = old.columns.iter().map(|v| v.unwrap_or(0)).collect();

        let tail_rid = self.get_new_rid(RangeKind::Tail);
        let tail = Record {
            rid: tail_rid,
            key,
            columns: values.to_vec(),
            range: RangeKind::Tail,
        };
        self.insert_record(&tail)?;
        self.core.index.lock().change(base_rid, &old_values, values)?;
        self.update_record(base_rid, &tail)?;
        Ok(true)
    }

    /// Invalidates `key`'s base record and its whole tail chain, then drops
    /// the key from every built index. Returns `false` for unknown keys.
    pub fn delete(&self, key: i64) -> DbResult<bool> {
        let rids = match self.locate(key, self.core.key_index)? {
            Some(rids) => rids,
            None => return Ok(false),
        };
        let base_rid = rids[0];

        let all = vec![true; self.core.num_columns];
        let old = self.select(key, self.core.key_index, &all)?;
        let old_values: Vec<i64> = old
            .first()
            .map(|r| r.columns.iter().map(|v| v.unwrap_or(0)).collect())
            .unwrap_or_default();

        self.invalidate_chain(base_rid)?;
        self.core.index.lock().delete(key, &old_values)?;
        Ok(true)
    }

    /// Sums `column` over all existing keys in `[start, end]` (inclusive,
    /// either direction). A zero-length range short-circuits to the single
    /// record's value, 0 when absent.
    pub fn sum(&self, start: i64, end: i64, column: ColumnId) -> DbResult<i64> {
        let mut mask = vec![false; self.core.num_columns];
        mask[column] = true;

        if start == end {
            let records = self.select(start, self.core.key_index, &mask)?;
            return Ok(records
                .first()
                .and_then(|r| r.columns[column])
                .unwrap_or(0));
        }

        let step: i64 = if end > start { 1 } else { -1 };
        let mut total = 0i64;
        let mut key = start;
        loop {
            if self.locate(key, self.core.key_index)?.is_some() {
                if let Some(record) = self.select(key, self.core.key_index, &mask)?.first() {
                    total += record.columns[column].unwrap_or(0);
                }
            }
            if key == end {
                break;
            }
            key += step;
        }
        Ok(total)
    }

    /// Adds 1 to `column` of `key`'s record. Returns `false` for unknown keys.
    pub fn increment(&self, key: i64, column: ColumnId) -> DbResult<bool> {
        let all = vec![true; self.core.num_columns];
        let Some(record) = self.select(key, self.core.key_index, &all)?.into_iter().next() else {
            return Ok(false);
        };

        let mut values = vec![None; self.core.num_columns];
        values[column] = record.columns[column].map(|v| v + 1);
        self.update(key, &values)
    }

    // ---- index plumbing ----------------------------------------------------

    /// Equality lookup returning the base RIDs mapped under `key`.
    pub fn locate(&self, key: i64, column: ColumnId) -> DbResult<Option<Vec<Rid>>> {
        let index = self.core.index.lock();
        Ok(index.locate(key, column)?.map(|rids| rids.to_vec()))
    }

    /// Resolves base RIDs back to their primary keys (for transaction
    /// preprocessing of secondary-index selects).
    pub fn primary_keys_of(&self, rids: &[Rid]) -> Vec<i64> {
        let index = self.core.index.lock();
        let reverse: Map<Rid, i64> = index.primary_entries().map(|(k, r)| (r, k)).collect();
        rids.iter().filter_map(|rid| reverse.get(rid).copied()).collect()
    }

    /// Builds a secondary index over `column` by scanning the primary map
    /// and reading each record's current value. Idempotent.
    pub fn build_index(&self, column: ColumnId) -> DbResult<()> {
        let rids: Vec<Rid> = {
            let index = self.core.index.lock();
            if index.is_created(column) {
                return Ok(());
            }
            index.primary_entries().map(|(_, rid)| rid).collect()
        };

        let mut entries = Vec::with_capacity(rids.len());
        for rid in rids {
            entries.push((self.select_feature(rid, column)?, rid));
        }

        let mut index = self.core.index.lock();
        index.begin_build(column);
        for (value, rid) in entries {
            index.add_entry(column, value, rid);
        }
        Ok(())
    }

    pub fn drop_index(&self, column: ColumnId) {
        self.core.index.lock().drop_index(column);
    }

    /// Writes the primary index image next to the column files.
    pub fn save_primary_index(&self, path: &std::path::Path) -> DbResult<()> {
        index::save_primary(&self.core.index.lock(), path)
    }

    /// Restores the primary index image written by a previous close.
    pub fn load_primary_index(&self, path: &std::path::Path) -> DbResult<()> {
        index::load_primary(&mut self.core.index.lock(), path)
    }

    // ---- storage protocol --------------------------------------------------

    /// Allocates the next RID, growing the merge-queue matrix when the
    /// allocation crosses into a fresh base page.
    pub fn get_new_rid(&self, kind: RangeKind) -> Rid {
        let rid = self.core.cache.get_new_rid(kind);
        if kind == RangeKind::Base && rid.byte_offset == 2 * WORD_SIZE as u32 {
            let mut queues = self.core.merge_queues.lock();
            for feature in queues.iter_mut() {
                feature.push(VecDeque::new());
            }
        }
        rid
    }

    /// Appends a record's columns into its range, bumping every column
    /// page's counter so it tracks the occupied slots.
    pub fn insert_record(&self, record: &Record) -> DbResult<()> {
        let kind = record.range;
        let rid = record.rid;
        let cache = &self.core.cache;

        cache.set_entry(kind, rid, RID_COLUMN, Some(&rid.to_bytes()), true)?;
        cache.set_entry(
            kind,
            rid,
            INDIRECTION_COLUMN,
            Some(&Rid::INVALID.to_bytes()),
            true,
        )?;
        // Schema encoding starts all-clean: counter bump only.
        cache.set_entry(kind, rid, SCHEMA_ENCODING_COLUMN, None, true)?;
        cache.set_entry(
            kind,
            rid,
            TIMESTAMP_COLUMN,
            Some(&now_micros().to_le_bytes()),
            true,
        )?;

        for (feature, value) in record.columns.iter().enumerate() {
            let data = value.map(i64::to_le_bytes);
            cache.set_entry(
                kind,
                rid,
                NUM_INTERNAL_COLUMNS + feature,
                data.as_ref(),
                true,
            )?;
        }
        Ok(())
    }

    /// Links an appended tail record into `base_rid`'s chain and records the
    /// updated features in the schema encodings and merge queues.
    pub fn update_record(&self, base_rid: Rid, tail: &Record) -> DbResult<()> {
        let cache = &self.core.cache;
        let tail_rid = tail.rid;

        // A tail RID at the first payload word means a tail page was opened.
        if tail_rid.byte_offset == WORD_SIZE as u32 {
            let mut pending = self.core.merge_pending.lock();
            *pending += 1;
            if *pending > self.core.merge_epoch {
                self.core.set_trigger();
            }
        }

        let base_indirection = Rid::from_bytes(cache.get_entry(
            RangeKind::Base,
            base_rid,
            INDIRECTION_COLUMN,
        )?);
        if base_indirection.is_invalid() {
            // First update: base points straight at the new tail.
            cache.set_entry(
                RangeKind::Base,
                base_rid,
                INDIRECTION_COLUMN,
                Some(&tail_rid.to_bytes()),
                false,
            )?;
        } else {
            // Chain the previous newest update behind the new tail, then
            // rewire the base to the new tail.
            cache.set_entry(
                RangeKind::Tail,
                tail_rid,
                INDIRECTION_COLUMN,
                Some(&base_indirection.to_bytes()),
                false,
            )?;
            cache.set_entry(
                RangeKind::Base,
                base_rid,
                INDIRECTION_COLUMN,
                Some(&tail_rid.to_bytes()),
                false,
            )?;
        }

        for (feature, value) in tail.columns.iter().enumerate() {
            let data = match value {
                Some(v) => {
                    self.update_schema(RangeKind::Base, feature, base_rid)?;
                    self.update_schema(RangeKind::Tail, feature, tail_rid)?;

                    let mut queues = self.core.merge_queues.lock();
                    queues[feature][base_rid.page_index as usize].push_back((base_rid, tail_rid));
                    Some(v.to_le_bytes())
                }
                None => None,
            };
            cache.set_entry(
                RangeKind::Tail,
                tail_rid,
                NUM_INTERNAL_COLUMNS + feature,
                data.as_ref(),
                false,
            )?;
        }
        Ok(())
    }

    /// Reads feature `feature` of the record rooted at `base_rid`: straight
    /// from the base page when it is authoritative, otherwise from the first
    /// tail record in the chain carrying the feature's schema bit.
    pub fn select_feature(&self, base_rid: Rid, feature: ColumnId) -> DbResult<i64> {
        let cache = &self.core.cache;
        let encoding = u64::from_le_bytes(cache.get_entry(
            RangeKind::Base,
            base_rid,
            SCHEMA_ENCODING_COLUMN,
        )?);

        if self.base_up_to_date(base_rid, feature)? || !is_updated(encoding, feature) {
            let word =
                cache.get_entry(RangeKind::Base, base_rid, NUM_INTERNAL_COLUMNS + feature)?;
            return Ok(i64::from_le_bytes(word));
        }

        // Walk newest-to-oldest; every link points at a strictly older tail
        // record, so the walk is finite.
        let mut tail_rid =
            Rid::from_bytes(cache.get_entry(RangeKind::Base, base_rid, INDIRECTION_COLUMN)?);
        loop {
            if tail_rid.is_invalid() {
                return Err(DbError::Corrupt(format!(
                    "indirection chain exhausted before feature {feature} was found"
                )));
            }
            let encoding = u64::from_le_bytes(cache.get_entry(
                RangeKind::Tail,
                tail_rid,
                SCHEMA_ENCODING_COLUMN,
            )?);
            if is_updated(encoding, feature) {
                break;
            }
            tail_rid =
                Rid::from_bytes(cache.get_entry(RangeKind::Tail, tail_rid, INDIRECTION_COLUMN)?);
        }

        let word = cache.get_entry(RangeKind::Tail, tail_rid, NUM_INTERNAL_COLUMNS + feature)?;
        Ok(i64::from_le_bytes(word))
    }

    /// A base record's feature is authoritative when its page's lineage is
    /// strictly newer than the record's current indirection RID.
    pub fn base_up_to_date(&self, base_rid: Rid, feature: ColumnId) -> DbResult<bool> {
        let page = self.core.cache.get_page(
            RangeKind::Base,
            base_rid.page_index,
            NUM_INTERNAL_COLUMNS + feature,
        )?;
        let latest = Rid::from_bytes(self.core.cache.get_entry(
            RangeKind::Base,
            base_rid,
            INDIRECTION_COLUMN,
        )?);
        Ok(page.lineage() > latest)
    }

    fn update_schema(&self, kind: RangeKind, feature: ColumnId, rid: Rid) -> DbResult<()> {
        let cache = &self.core.cache;
        let mut encoding =
            u64::from_le_bytes(cache.get_entry(kind, rid, SCHEMA_ENCODING_COLUMN)?);
        encoding |= 1u64 << feature;
        cache.set_entry(
            kind,
            rid,
            SCHEMA_ENCODING_COLUMN,
            Some(&encoding.to_le_bytes()),
            false,
        )?;
        Ok(())
    }

    /// Tombstones a base record and its tail chain by overwriting their RID
    /// columns with the invalid sentinel.
    fn invalidate_chain(&self, base_rid: Rid) -> DbResult<()> {
        let cache = &self.core.cache;
        let mut next =
            Rid::from_bytes(cache.get_entry(RangeKind::Base, base_rid, INDIRECTION_COLUMN)?);
        cache.set_entry(
            RangeKind::Base,
            base_rid,
            RID_COLUMN,
            Some(&Rid::INVALID.to_bytes()),
            false,
        )?;
        while !next.is_invalid() {
            cache.set_entry(
                RangeKind::Tail,
                next,
                RID_COLUMN,
                Some(&Rid::INVALID.to_bytes()),
                false,
            )?;
            next = Rid::from_bytes(cache.get_entry(RangeKind::Tail, next, INDIRECTION_COLUMN)?);
        }
        Ok(())
    }
}

impl TableCore {
    /// Parks until the trigger fires. The closed flag is part of the wait
    /// predicate so a shutdown signaled between a pass and the next sleep is
    /// never missed.
    pub(crate) fn wait_trigger(&self) {
        let mut fired = self.trigger.lock();
        while !*fired && !self.closed.load(Ordering::SeqCst) {
            self.trigger_cv.wait(&mut fired);
        }
    }

    pub(crate) fn set_trigger(&self) {
        let mut fired = self.trigger.lock();
        *fired = true;
        self.trigger_cv.notify_one();
    }

    pub(crate) fn clear_trigger(&self) {
        *self.trigger.lock() = false;
    }

    pub(crate) fn finish_epoch(&self) {
        let mut pending = self.merge_pending.lock();
        *pending = pending.saturating_sub(self.merge_epoch);
        debug!(remaining = *pending, "merge epoch consumed");
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
