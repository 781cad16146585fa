use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::gc::cms::CmsCollector;
use crate::gc::worker::{YieldScope, YieldingTask};
use crate::gc::{formatted_size, Address, Region};
use crate::object;

/// Blocks between proactive flushes of the open range.
const FLUSH_INTERVAL: usize = 64;

/// Open free range between two live objects.
struct FreeRange {
    start: Address,
    size: usize,
    /// The current extent has already been published by a flush; it must be
    /// taken back before it can grow.
    already_in_free_lists: bool,
    coalesced: bool,
}

impl FreeRange {
    fn new(start: Address, size: usize) -> FreeRange {
        FreeRange {
            start,
            size,
            already_in_free_lists: false,
            coalesced: false,
        }
    }
}

/// Extends the open range by the dead block at `addr`. A flushed range is
/// first taken back from the free list; if the allocator already claimed
/// it, the range restarts at `addr` instead of coalescing across it.
fn extend(collector: &CmsCollector, range: &mut FreeRange, addr: Address, size: usize) {
    if range.already_in_free_lists {
        if collector.heap.remove_free_chunk(range.start) {
            range.already_in_free_lists = false;
        } else {
            *range = FreeRange::new(addr, size);
            return;
        }
    }

    range.size += size;
    range.coalesced = true;
}

/// Lookahead-and-flush: publishes the still-open range without closing it,
/// bounding how much reclaimed memory sits unpublished across yields.
fn flush(collector: &CmsCollector, range: &mut FreeRange) {
    if !range.already_in_free_lists {
        collector.heap.add_free_range(range.start, range.size);
        range.already_in_free_lists = true;
    }
}

fn close(collector: &CmsCollector, range: FreeRange, reclaimed: &mut usize) {
    if !range.already_in_free_lists {
        collector.heap.add_free_range(range.start, range.size);
    }

    *reclaimed += range.size;
}

/// Single linear pass from the generation start to the precomputed sweep
/// limit. Dead and already-free blocks extend the open range; live objects
/// close it. `checkpoint` runs at every block boundary and returns false to
/// abort. Returns reclaimed bytes.
pub(crate) fn sweep_pass<F>(collector: &CmsCollector, mut checkpoint: F) -> usize
where
    F: FnMut() -> bool,
{
    let limit = collector.sweep_limit();
    assert!(limit.is_non_null());

    let region = Region::new(collector.heap.total().start, limit);
    let mut open: Option<FreeRange> = None;
    let mut reclaimed = 0usize;
    let mut blocks = 0usize;

    object::walk_region(region, |addr, obj| {
        let size = obj.size();
        let dead = obj.is_free() || collector.bitmap.is_unmarked(addr);

        if dead {
            match open.as_mut() {
                Some(range) => extend(collector, range, addr, size),
                None => open = Some(FreeRange::new(addr, size)),
            }
        } else if let Some(range) = open.take() {
            close(collector, range, &mut reclaimed);
        }

        blocks += 1;

        if blocks % FLUSH_INTERVAL == 0 {
            if let Some(range) = open.as_mut() {
                flush(collector, range);
            }
        }

        checkpoint()
    });

    if let Some(range) = open.take() {
        close(collector, range, &mut reclaimed);
    }

    reclaimed
}

struct SweepTask {
    collector: Arc<CmsCollector>,
    reclaimed: AtomicUsize,
}

impl YieldingTask for SweepTask {
    fn name(&self) -> &'static str {
        "concurrent-sweep"
    }

    fn work(&self, _worker_id: usize, scope: &YieldScope) {
        let reclaimed = sweep_pass(&self.collector, || self.collector.worker_checkpoint(scope));
        self.reclaimed.store(reclaimed, Ordering::Relaxed);
    }
}

/// Concurrent sweeping phase. The sweep limit is the top of the heap when
/// sweeping starts: objects allocated afterwards sit above it and are never
/// touched. Returns false when the pass aborted.
pub fn concurrent_sweep(collector: &Arc<CmsCollector>) -> bool {
    let limit = collector.heap.used_region().end;
    collector.set_sweep_limit(limit);
    collector.heap.clear_free_list();

    let task = Arc::new(SweepTask {
        collector: collector.clone(),
        reclaimed: AtomicUsize::new(0),
    });

    // The pass is inherently sequential: block sizes are only known once
    // the walk reaches them, so one worker carries it.
    let completed = collector.run_gang_phase(task.clone(), 1);

    if completed && collector.flags.gc_verbose {
        println!(
            "GC: sweep reclaimed {}",
            formatted_size(task.reclaimed.load(Ordering::Relaxed))
        );
    }

    completed
}
