//! In-memory equality indexes over base records.
//!
//! One hash map per user column, `key -> [base RID]`. The primary column's
//! index always exists and maps each key to exactly one RID; secondary
//! indexes are built on demand and may hold duplicates. Only exact-match
//! lookups are supported.
//!
//! The index never reaches back into the table: building a secondary index is
//! driven by the table, which materializes current column values and feeds
//! them in through [`Index::begin_build`] / [`Index::add_entry`].

use std::fs;
use std::path::Path;

use ahash::RandomState;
use common::{ColumnId, DbError, DbResult, Rid};
use hashbrown::HashMap;

type Map<K, V> = HashMap<K, V, RandomState>;

/// Per-table index registry.
#[derive(Debug)]
pub struct Index {
    num_features: usize,
    key_index: ColumnId,
    created: Vec<bool>,
    maps: Vec<Map<i64, Vec<Rid>>>,
}

impl Index {
    pub fn new(num_features: usize, key_index: ColumnId) -> Self {
        let mut created = vec![false; num_features];
        created[key_index] = true;
        Self {
            num_features,
            key_index,
            created,
            maps: (0..num_features).map(|_| Map::default()).collect(),
        }
    }

    pub fn key_index(&self) -> ColumnId {
        self.key_index
    }

    pub fn is_created(&self, column: ColumnId) -> bool {
        self.created.get(column).copied().unwrap_or(false)
    }

    /// Registers a freshly inserted base record under every built index.
    ///
    /// The primary column rejects duplicates; nothing is modified on failure.
    pub fn insert(&mut self, rid: Rid, values: &[i64]) -> DbResult<()> {
        if values.len() != self.num_features {
            return Err(DbError::SchemaMismatch {
                expected: self.num_features,
                got: values.len(),
            });
        }

        let key = values[self.key_index];
        if self.maps[self.key_index].contains_key(&key) {
            return Err(DbError::DuplicateKey(key));
        }

        for column in 0..self.num_features {
            if !self.created[column] {
                continue;
            }
            let value = values[column];
            if column == self.key_index {
                self.maps[column].insert(value, vec![rid]);
            } else {
                self.maps[column].entry(value).or_default().push(rid);
            }
        }
        Ok(())
    }

    /// Rebuckets `rid` for every indexed column whose value changes.
    /// `None` entries in `new_values` mean "unchanged".
    pub fn change(
        &mut self,
        rid: Rid,
        old_values: &[i64],
        new_values: &[Option<i64>],
    ) -> DbResult<()> {
        if old_values.len() != self.num_features || new_values.len() != self.num_features {
            return Err(DbError::SchemaMismatch {
                expected: self.num_features,
                got: old_values.len().min(new_values.len()),
            });
        }

        // Validate the primary move up front so a duplicate leaves no
        // half-applied secondary changes behind.
        if let Some(new_key) = new_values[self.key_index] {
            let old_key = old_values[self.key_index];
            if new_key != old_key && self.maps[self.key_index].contains_key(&new_key) {
                return Err(DbError::DuplicateKey(new_key));
            }
        }

        for column in 0..self.num_features {
            if !self.created[column] {
                continue;
            }
            let old_key = old_values[column];
            let new_key = match new_values[column] {
                Some(v) if v != old_key => v,
                _ => continue,
            };

            if column == self.key_index {
                self.maps[column].remove(&old_key);
                self.maps[column].insert(new_key, vec![rid]);
            } else {
                self.remove_from_bucket(column, old_key, rid)?;
                self.maps[column].entry(new_key).or_default().push(rid);
            }
        }
        Ok(())
    }

    /// Unregisters a deleted record: drops the primary entry and sweeps the
    /// RID out of every built secondary index.
    pub fn delete(&mut self, key: i64, old_values: &[i64]) -> DbResult<()> {
        let Some(bucket) = self.maps[self.key_index].remove(&key) else {
            return Ok(());
        };
        let rid = bucket[0];

        for column in 0..self.num_features {
            if column == self.key_index || !self.created[column] {
                continue;
            }
            if let Some(&value) = old_values.get(column) {
                self.remove_from_bucket(column, value, rid)?;
            }
        }
        Ok(())
    }

    /// O(1) equality lookup. `Ok(None)` when the key is absent.
    pub fn locate(&self, key: i64, column: ColumnId) -> DbResult<Option<&[Rid]>> {
        if !self.is_created(column) {
            return Err(DbError::NotIndexed { column });
        }
        Ok(self.maps[column]
            .get(&key)
            .map(|rids| rids.as_slice())
            .filter(|rids| !rids.is_empty()))
    }

    /// Iterates the primary map as `(key, base RID)` pairs.
    pub fn primary_entries(&self) -> impl Iterator<Item = (i64, Rid)> + '_ {
        self.maps[self.key_index]
            .iter()
            .map(|(key, rids)| (*key, rids[0]))
    }

    /// Marks `column` indexed with an empty map; the caller backfills it
    /// through [`Index::add_entry`].
    pub fn begin_build(&mut self, column: ColumnId) {
        self.created[column] = true;
        self.maps[column] = Map::default();
    }

    pub fn add_entry(&mut self, column: ColumnId, key: i64, rid: Rid) {
        self.maps[column].entry(key).or_default().push(rid);
    }

    /// Drops a secondary index; the primary index cannot be dropped.
    pub fn drop_index(&mut self, column: ColumnId) {
        if column == self.key_index {
            return;
        }
        self.created[column] = false;
        self.maps[column] = Map::default();
    }

    /// Seeds the primary map after a reopen.
    pub fn set_primary(&mut self, entries: impl IntoIterator<Item = (i64, Rid)>) {
        let map = entries
            .into_iter()
            .map(|(key, rid)| (key, vec![rid]))
            .collect();
        self.maps[self.key_index] = map;
    }

    fn remove_from_bucket(&mut self, column: ColumnId, key: i64, rid: Rid) -> DbResult<()> {
        let bucket = self.maps[column].get_mut(&key).ok_or_else(|| {
            DbError::Corrupt(format!("index bucket for column {column} missing key {key}"))
        })?;
        bucket.retain(|r| *r != rid);
        if bucket.is_empty() {
            self.maps[column].remove(&key);
        }
        Ok(())
    }
}

/// On-disk image of the primary index: a flat concatenation of
/// `(key: i64 LE, rid: 8 bytes)` entries, written at close and read at open.
const ENTRY_BYTES: usize = 16;

pub fn save_primary(index: &Index, path: &Path) -> DbResult<()> {
    let mut buf = Vec::new();
    for (key, rid) in index.primary_entries() {
        let entry = (key, rid.to_bytes());
        let encoded = bincode::serde::encode_to_vec(entry, bincode::config::legacy())
            .map_err(|e| DbError::Corrupt(format!("encode index entry failed: {e}")))?;
        buf.extend_from_slice(&encoded);
    }
    fs::write(path, buf)?;
    Ok(())
}

pub fn load_primary(index: &mut Index, path: &Path) -> DbResult<()> {
    let data = fs::read(path)?;
    if data.len() % ENTRY_BYTES != 0 {
        return Err(DbError::Corrupt(format!(
            "index file length {} is not a multiple of {ENTRY_BYTES}",
            data.len()
        )));
    }

    let mut entries = Vec::with_capacity(data.len() / ENTRY_BYTES);
    for chunk in data.chunks_exact(ENTRY_BYTES) {
        let ((key, rid_bytes), _): ((i64, [u8; 8]), usize) =
            bincode::serde::decode_from_slice(chunk, bincode::config::legacy())
                .map_err(|e| DbError::Corrupt(format!("decode index entry failed: {e}")))?;
        entries.push((key, Rid::from_bytes(rid_bytes)));
    }
    index.set_primary(entries);
    Ok(())
}
