//! Buffer pool and RID allocator for the page store.
//!
//! The cache sits between the record engine and the disk manager, providing:
//! - an LRU-ordered page cache with write-back eviction
//! - word-granular entry access addressed by RID
//! - the monotonic RID allocator for both ranges
//!
//! Eviction is write-back, not write-through: dirty frames hit disk only when
//! evicted or when [`PageCache::flush`] runs at shutdown.
//!
//! # Example
//!
//! ```no_run
//! use buffer::PageCache;
//! use common::RangeKind;
//!
//! let cache = PageCache::new("/tmp/db/Grades", 64).unwrap();
//! let rid = cache.get_new_rid(RangeKind::Base);
//! cache.set_entry(RangeKind::Base, rid, 0, Some(&rid.to_bytes()), true).unwrap();
//! ```


use std::num::NonZeroUsize;

use common::{ColumnId, DbResult, PageKey, RangeKind, Rid};
use lru::LruCache;
use parking_lot::Mutex;
use storage::{DiskManager, Page, WORDS_PER_PAGE, WORD_SIZE};
use tracing::{debug, trace};

struct Frame {
    dirty: bool,
    page: Page,
}

struct FrameTable {
    lru: LruCache<PageKey, Frame>,
    disk: DiskManager,
}

impl FrameTable {
    /// Returns the resident frame for `key`, faulting it in clean on a miss.
    fn frame(&mut self, key: PageKey) -> DbResult<&mut Frame> {
        if !self.lru.contains(&key) {
            trace!(?key, "page fault");
            let page = self.disk.read_page(key.range, key.page_index, key.column)?;
            self.insert(key, Frame { dirty: false, page })?;
        }
        Ok(self.lru.get_mut(&key).unwrap())
    }

    /// Inserts at MRU, writing back whichever dirty frame the insertion
    /// evicts. Replacing an existing key discards the superseded frame.
    fn insert(&mut self, key: PageKey, frame: Frame) -> DbResult<()> {
        if let Some((victim_key, victim)) = self.lru.push(key, frame) {
            if victim_key != key && victim.dirty {
                debug!(key = ?victim_key, "evicting dirty page");
                self.disk
                    .write_page(victim_key.range, victim_key.page_index, victim_key.column, &victim.page)?;
            }
        }
        Ok(())
    }
}

struct RidAllocator {
    last: [Rid; 2],
}

impl RidAllocator {
    fn slot(kind: RangeKind) -> usize {
        match kind {
            RangeKind::Base => 0,
            RangeKind::Tail => 1,
        }
    }
}

/// Shared, internally synchronized buffer pool for one table.
///
/// Two latches: one over the frame table (page lookups, mutations, and
/// eviction write-back) and one over the RID allocator. Neither is held
/// across calls into the other.
pub struct PageCache {
    frames: Mutex<FrameTable>,
    alloc: Mutex<RidAllocator>,
}

impl PageCache {
    /// Opens the buffer pool over the column files at `appendix`, recovering
    /// the allocator position from the files' last pages.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is 0.
    pub fn new(appendix: impl Into<String>, capacity: usize) -> DbResult<Self> {
        assert!(capacity > 0, "capacity must be > 0");
        let mut disk = DiskManager::new(appendix);
        let (last_base, last_tail) = disk.last_rids()?;

        Ok(Self {
            frames: Mutex::new(FrameTable {
                lru: LruCache::new(NonZeroUsize::new(capacity).unwrap()),
                disk,
            }),
            alloc: Mutex::new(RidAllocator {
                last: [last_base, last_tail],
            }),
        })
    }

    /// Returns a copy of the page, faulting it in from disk on a miss.
    pub fn get_page(&self, kind: RangeKind, page_index: u32, column: ColumnId) -> DbResult<Page> {
        let key = PageKey::new(kind, page_index, column);
        let mut frames = self.frames.lock();
        Ok(frames.frame(key)?.page.clone())
    }

    /// Replaces the page, marking it dirty at MRU.
    pub fn set_page(
        &self,
        kind: RangeKind,
        page_index: u32,
        column: ColumnId,
        page: Page,
    ) -> DbResult<()> {
        let key = PageKey::new(kind, page_index, column);
        let mut frames = self.frames.lock();
        frames.insert(key, Frame { dirty: true, page })
    }

    /// Reads the single word addressed by `rid` in `column`'s range.
    pub fn get_entry(
        &self,
        kind: RangeKind,
        rid: Rid,
        column: ColumnId,
    ) -> DbResult<[u8; WORD_SIZE]> {
        let key = PageKey::new(kind, rid.page_index, column);
        let mut frames = self.frames.lock();
        frames.frame(key)?.page.read_field(rid.byte_offset as usize)
    }

    /// Writes one entry on a copy of the page and swaps the copy in dirty.
    ///
    /// With `is_append` the page's record counter is bumped (and persisted at
    /// word 0) before any write; `data: None` with `is_append` records the
    /// counter bump alone. A call with neither is a no-op.
    pub fn set_entry(
        &self,
        kind: RangeKind,
        rid: Rid,
        column: ColumnId,
        data: Option<&[u8; WORD_SIZE]>,
        is_append: bool,
    ) -> DbResult<()> {
        if data.is_none() && !is_append {
            return Ok(());
        }
        let key = PageKey::new(kind, rid.page_index, column);
        let mut frames = self.frames.lock();
        let mut page = frames.frame(key)?.page.clone();
        if is_append {
            page.bump_records();
        }
        if let Some(word) = data {
            page.write_field(rid.byte_offset as usize, word)?;
        }
        frames.insert(key, Frame { dirty: true, page })
    }

    /// Allocates the next RID in `kind`'s range: one word past the previous
    /// allocation, skipping the header words when crossing into a new page.
    pub fn get_new_rid(&self, kind: RangeKind) -> Rid {
        let mut alloc = self.alloc.lock();
        let last = alloc.last[RidAllocator::slot(kind)];

        let mut page_index = last.page_index;
        let mut word = last.byte_offset / WORD_SIZE as u32 + 1;
        if word as usize == WORDS_PER_PAGE {
            page_index += 1;
            word = kind.first_payload_word();
        }

        let rid = Rid::new(page_index, word * WORD_SIZE as u32);
        alloc.last[RidAllocator::slot(kind)] = rid;
        rid
    }

    /// Page index of the most recent allocation in `kind`'s range.
    pub fn last_page_index(&self, kind: RangeKind) -> u32 {
        self.alloc.lock().last[RidAllocator::slot(kind)].page_index
    }

    /// Writes every dirty frame back to disk. Frames stay resident, clean.
    pub fn flush(&self) -> DbResult<()> {
        let mut frames = self.frames.lock();
        let FrameTable { lru, disk } = &mut *frames;
        for (key, frame) in lru.iter_mut() {
            if frame.dirty {
                disk.write_page(key.range, key.page_index, key.column, &frame.page)?;
                frame.dirty = false;
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for PageCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCache").finish_non_exhaustive()
    }
}
