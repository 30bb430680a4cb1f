//! Background merge: folds queued tail updates back into base pages.
//!
//! The worker never touches tail pages or indirection chains; it races live
//! readers only on the base pages of merged columns. Because a merged page's
//! lineage supersedes the value chain for every slot it covers, both the
//! pre-merge path (walk the chain) and the post-merge path (read the base)
//! return the same values. The copy-then-`set_page` discipline means readers
//! observe either the old page or the fully built new page, never a partial
//! one.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use ahash::RandomState;
use common::{DbResult, RangeKind, Rid, NUM_INTERNAL_COLUMNS};
use hashbrown::HashMap;
use tracing::{debug, warn};

use crate::TableCore;

type Map<K, V> = HashMap<K, V, RandomState>;

/// Worker loop: one per table, parked on the merge trigger.
///
/// Shutdown protocol: the table sets `closed`, then fires the trigger; the
/// flag is checked after every wakeup and the final pass also covers the
/// still-open last base page.
pub(crate) fn run(core: Arc<TableCore>) {
    loop {
        core.wait_trigger();

        let closed = core.closed.load(Ordering::SeqCst);
        let mut merge_range = core.cache.last_page_index(RangeKind::Base) as usize;
        if closed {
            // Nothing will touch the open base page anymore; fold it too.
            merge_range += 1;
        }

        if let Err(err) = merge_pass(&core, merge_range) {
            warn!(%err, "merge pass failed");
        }

        if closed {
            return;
        }
        core.finish_epoch();
        core.clear_trigger();
    }
}

/// Consolidates every non-empty merge queue for base pages `0..merge_range`.
fn merge_pass(core: &TableCore, merge_range: usize) -> DbResult<()> {
    for feature in 0..core.num_columns {
        for page_index in 0..merge_range {
            let drained: Vec<(Rid, Rid)> = {
                let mut queues = core.merge_queues.lock();
                // The allocator publishes a new page index a moment before
                // the queue matrix grows its row. A page in that window has
                // no record yet, so nothing can be queued for it; skip it
                // instead of indexing past the row.
                let Some(queue) = queues[feature].get_mut(page_index) else {
                    continue;
                };
                if queue.is_empty() {
                    continue;
                }
                queue.drain(..).collect()
            };

            let column = NUM_INTERNAL_COLUMNS + feature;
            let mut page = core
                .cache
                .get_page(RangeKind::Base, page_index as u32, column)?;

            // Last-writer-wins: later updates to the same base record
            // dominate earlier ones, and the final pair popped becomes the
            // page's new lineage.
            let mut latest: Map<Rid, Rid> = Map::default();
            let mut lineage = page.lineage();
            for (base_rid, tail_rid) in drained {
                latest.insert(base_rid, tail_rid);
                lineage = tail_rid;
            }
            page.set_lineage(lineage);

            for (base_rid, tail_rid) in &latest {
                let word = core.cache.get_entry(RangeKind::Tail, *tail_rid, column)?;
                page.write_field(base_rid.byte_offset as usize, &word)?;
            }

            debug!(feature, page_index, updates = latest.len(), "merged base page");
            core.cache
                .set_page(RangeKind::Base, page_index as u32, column, page)?;
        }
    }
    Ok(())
}
