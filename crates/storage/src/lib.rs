//! Physical page layout and column-file I/O.
//!
//! A table with `F` user features is stored as `F + NUM_INTERNAL_COLUMNS`
//! files per range (base, tail), each file a sequence of `PAGE_SIZE`-byte
//! pages. Every page stores its record counter at word 0; base pages
//! additionally reserve word 1 for the merge lineage RID.

#[cfg(test)]
mod tests;

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use common::{ColumnId, DbError, DbResult, RangeKind, Rid};
use hashbrown::HashMap;

/// Fixed page allocation in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Field granularity: every stored value is one 8-byte word.
pub const WORD_SIZE: usize = 8;
/// Word slots per page, header included.
pub const WORDS_PER_PAGE: usize = PAGE_SIZE / WORD_SIZE;
/// Byte offset of the lineage RID on base pages.
pub const LINEAGE_OFFSET: usize = WORD_SIZE;

/// A fixed-size page of one column file.
///
/// The page does not know its own identity (range, index, column); identity
/// lives in the buffer pool's `PageKey`. `Clone` is a deep copy; the cache's
/// copy-then-swap discipline depends on it.
#[derive(Debug, Clone)]
pub struct Page {
    data: Vec<u8>,
    num_records: u64,
}

impl Page {
    /// Fresh zero-filled page. The counter starts at 2 for base pages
    /// (counter + lineage words) and 1 for tail pages (counter word).
    pub fn new(kind: RangeKind) -> Self {
        let mut page = Self {
            data: vec![0u8; PAGE_SIZE],
            num_records: kind.initial_records(),
        };
        page.store_counter();
        page
    }

    /// Wraps an on-disk page; the counter is read back from word 0.
    pub fn from_bytes(data: &[u8]) -> DbResult<Self> {
        if data.len() != PAGE_SIZE {
            return Err(DbError::Corrupt(format!(
                "page must be {PAGE_SIZE} bytes, got {}",
                data.len()
            )));
        }
        let num_records = u64::from_le_bytes(data[..WORD_SIZE].try_into().unwrap());
        Ok(Self {
            data: data.to_vec(),
            num_records,
        })
    }

    /// Reads the word starting at `offset`.
    pub fn read_field(&self, offset: usize) -> DbResult<[u8; WORD_SIZE]> {
        if offset + WORD_SIZE > PAGE_SIZE {
            return Err(DbError::OutOfBounds { offset });
        }
        Ok(self.data[offset..offset + WORD_SIZE].try_into().unwrap())
    }

    /// Overwrites the word starting at `offset`.
    pub fn write_field(&mut self, offset: usize, word: &[u8]) -> DbResult<()> {
        if word.len() != WORD_SIZE {
            return Err(DbError::BadWordSize {
                expected: WORD_SIZE,
                got: word.len(),
            });
        }
        if offset + WORD_SIZE > PAGE_SIZE {
            return Err(DbError::OutOfBounds { offset });
        }
        self.data[offset..offset + WORD_SIZE].copy_from_slice(word);
        Ok(())
    }

    /// Occupied word slots, header words included.
    pub fn num_records(&self) -> u64 {
        self.num_records
    }

    /// Increments the record counter and persists it at word 0.
    pub fn bump_records(&mut self) {
        self.num_records += 1;
        self.store_counter();
    }

    /// Lineage RID of a base page: the high-water-mark tail RID merged into
    /// it. Zero on an unmerged page, which compares below any real tail RID.
    pub fn lineage(&self) -> Rid {
        Rid::from_bytes(
            self.data[LINEAGE_OFFSET..LINEAGE_OFFSET + WORD_SIZE]
                .try_into()
                .unwrap(),
        )
    }

    pub fn set_lineage(&mut self, rid: Rid) {
        self.data[LINEAGE_OFFSET..LINEAGE_OFFSET + WORD_SIZE].copy_from_slice(&rid.to_bytes());
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    fn store_counter(&mut self) {
        self.data[..WORD_SIZE].copy_from_slice(&self.num_records.to_le_bytes());
    }
}

/// Translates `(range, page_index, column)` to file offsets and lazily grows
/// column files by whole header-initialized pages.
///
/// Keeps a cache of open handles keyed by `(range, column)`; file names are
/// `"{appendix}_{b|t}_{column}"`.
#[derive(Debug)]
pub struct DiskManager {
    appendix: String,
    handles: HashMap<(RangeKind, ColumnId), File>,
}

impl DiskManager {
    pub fn new(appendix: impl Into<String>) -> Self {
        Self {
            appendix: appendix.into(),
            handles: HashMap::new(),
        }
    }

    /// Reads one page, growing the file first if it does not yet reach
    /// `page_index`. Appended pages are fresh `Page::new` images so a faulted
    /// page always carries a valid initial counter.
    pub fn read_page(
        &mut self,
        kind: RangeKind,
        page_index: u32,
        column: ColumnId,
    ) -> DbResult<Page> {
        let (file, size) = self.open_file(kind, column)?;

        let have_pages = size / PAGE_SIZE as u64;
        if u64::from(page_index) >= have_pages {
            file.seek(SeekFrom::End(0))?;
            let fresh = Page::new(kind);
            for _ in have_pages..=u64::from(page_index) {
                file.write_all(fresh.bytes())?;
            }
        }

        file.seek(SeekFrom::Start(u64::from(page_index) * PAGE_SIZE as u64))?;
        let mut buf = vec![0u8; PAGE_SIZE];
        file.read_exact(&mut buf)?;
        Page::from_bytes(&buf)
    }

    /// Writes one page in place. The file must already contain the page.
    pub fn write_page(
        &mut self,
        kind: RangeKind,
        page_index: u32,
        column: ColumnId,
        page: &Page,
    ) -> DbResult<()> {
        let (file, size) = self.open_file(kind, column)?;

        if u64::from(page_index) >= size / PAGE_SIZE as u64 {
            return Err(DbError::OutOfBounds {
                offset: page_index as usize * PAGE_SIZE,
            });
        }

        file.seek(SeekFrom::Start(u64::from(page_index) * PAGE_SIZE as u64))?;
        file.write_all(page.bytes())?;
        Ok(())
    }

    /// Recovers the last allocated RID of each range from column 0's file,
    /// so the allocator can resume after a reopen.
    pub fn last_rids(&mut self) -> DbResult<(Rid, Rid)> {
        let mut rids = [Rid::INVALID; 2];
        for (slot, kind) in [RangeKind::Base, RangeKind::Tail].into_iter().enumerate() {
            let (file, size) = self.open_file(kind, 0)?;

            if size % PAGE_SIZE as u64 != 0 {
                return Err(DbError::Corrupt(format!(
                    "column file size {size} is not a multiple of {PAGE_SIZE}"
                )));
            }

            rids[slot] = if size == 0 {
                // Last occupied word of a not-yet-materialized page: the
                // header, so the first allocation lands on the first payload
                // slot.
                match kind {
                    RangeKind::Base => Rid::new(0, WORD_SIZE as u32),
                    RangeKind::Tail => Rid::new(0, 0),
                }
            } else {
                let last_page_index = (size / PAGE_SIZE as u64 - 1) as u32;
                file.seek(SeekFrom::Start(
                    u64::from(last_page_index) * PAGE_SIZE as u64,
                ))?;
                let mut word = [0u8; WORD_SIZE];
                file.read_exact(&mut word)?;
                let num_records = u64::from_le_bytes(word);
                Rid::new(last_page_index, (num_records * WORD_SIZE as u64) as u32)
            };
        }
        Ok((rids[0], rids[1]))
    }

    fn open_file(&mut self, kind: RangeKind, column: ColumnId) -> DbResult<(&mut File, u64)> {
        if !self.handles.contains_key(&(kind, column)) {
            let name = format!("{}_{}_{}", self.appendix, kind.tag(), column);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&name)?;
            self.handles.insert((kind, column), file);
        }
        let file = self.handles.get_mut(&(kind, column)).unwrap();
        let size = file.metadata()?.len();
        Ok((file, size))
    }
}
