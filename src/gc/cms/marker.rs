use crossbeam_deque::{Injector, Steal};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::gc::cms::CmsCollector;
use crate::gc::mark_stack::MarkStack;
use crate::gc::worker::{YieldScope, YieldingTask};
use crate::gc::{Address, Region};

/// Objects scanned between two yield checks.
const CHECKPOINT_INTERVAL: usize = 64;

/// Stop-the-world initial mark: establishes the grey set from the roots.
/// The world is already stopped by the caller.
pub fn checkpoint_roots_initial(collector: &CmsCollector) {
    mark_roots(collector);
}

fn mark_roots(collector: &CmsCollector) {
    let total = collector.heap.total();

    collector.heap.visit_roots(|slot| {
        let target = slot.get();

        if target.is_non_null() && total.contains(target) && collector.bitmap.par_mark(target) {
            if !collector.mark_stack.par_push(target) {
                collector.overflow.push(target);
            }
        }
    });
}

/// Claims `target` and queues it for scanning, spilling to the shared stack
/// and then the overflow channel when the local stack is full.
fn mark_and_push(collector: &CmsCollector, target: Address, local: &mut MarkStack) {
    if collector.bitmap.par_mark(target) && !local.push(target) {
        if !collector.mark_stack.par_push(target) {
            collector.overflow.push(target);
        }
    }
}

fn scan_object(collector: &CmsCollector, obj: Address, local: &mut MarkStack) {
    let total = collector.heap.total();

    obj.to_obj().visit_reference_fields(|slot| {
        let target = slot.get();

        if target.is_non_null() && total.contains(target) {
            mark_and_push(collector, target, local);
        }
    });
}

pub(crate) struct Terminator {
    workers: usize,
    idle: AtomicUsize,
}

impl Terminator {
    pub(crate) fn new(workers: usize) -> Terminator {
        Terminator {
            workers,
            idle: AtomicUsize::new(0),
        }
    }

    pub(crate) fn enter_idle(&self) {
        self.idle.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn exit_idle(&self) {
        self.idle.fetch_sub(1, Ordering::SeqCst);
    }

    pub(crate) fn all_idle(&self) -> bool {
        self.idle.load(Ordering::SeqCst) == self.workers
    }
}

/// Transitive closure over the grey set, run by the gang. Each worker owns
/// a bounded local stack; the injector and the shared stack distribute
/// work, the overflow channel catches what no stack can hold. Termination:
/// a worker goes idle when it finds nothing anywhere; once all workers are
/// idle no new work can appear, because only workers generate work.
struct ConcurrentMarkTask {
    collector: Arc<CmsCollector>,
    injector: Injector<Address>,
    terminator: Terminator,
}

impl ConcurrentMarkTask {
    fn next_object(&self, local: &mut MarkStack) -> Option<Address> {
        if let Some(obj) = local.pop() {
            return Some(obj);
        }

        loop {
            match self.injector.steal() {
                Steal::Success(obj) => return Some(obj),
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        if let Some(obj) = self.collector.mark_stack.par_pop() {
            return Some(obj);
        }

        let batch = self.collector.overflow.take_all();

        if batch.is_empty() {
            return None;
        }

        let mut iter = batch.into_iter();
        let first = iter.next();

        for obj in iter {
            self.injector.push(obj);
        }

        first
    }

    fn work_available(&self) -> bool {
        !self.injector.is_empty()
            || !self.collector.mark_stack.par_is_empty()
            || !self.collector.overflow.is_empty()
    }
}

impl YieldingTask for ConcurrentMarkTask {
    fn name(&self) -> &'static str {
        "concurrent-mark"
    }

    fn work(&self, _worker_id: usize, scope: &YieldScope) {
        let collector = &self.collector;
        let mut local = MarkStack::new(
            collector.flags.mark_stack_capacity,
            collector.flags.mark_stack_max_capacity,
        );
        let mut processed = 0usize;

        loop {
            while let Some(obj) = self.next_object(&mut local) {
                scan_object(collector, obj, &mut local);
                processed += 1;

                if processed % CHECKPOINT_INTERVAL == 0 && !collector.worker_checkpoint(scope) {
                    return;
                }
            }

            self.terminator.enter_idle();

            loop {
                if self.terminator.all_idle() {
                    return;
                }

                if self.work_available() {
                    self.terminator.exit_idle();
                    break;
                }

                if !collector.worker_checkpoint(scope) {
                    return;
                }

                std::thread::yield_now();
            }
        }
    }
}

/// Concurrent marking phase. Returns false when the task aborted.
pub fn concurrent_mark(collector: &Arc<CmsCollector>) -> bool {
    let workers = collector.gang.workers();

    let task = Arc::new(ConcurrentMarkTask {
        collector: collector.clone(),
        injector: Injector::new(),
        terminator: Terminator::new(workers),
    });

    collector.run_gang_phase(task, workers)
}

/// Concurrent precleaning: drains cards dirtied since marking started and
/// rescans the objects on them, shrinking the remark pause.
pub fn preclean(collector: &CmsCollector) {
    collector.token.cms_acquire();
    preclean_pass(collector, true);
    drain_serial(collector, true);
    collector.token.cms_release();
}

/// Budget-bounded extra precleaning. Cut short by the budget, an empty
/// dirty set, a pending yield request, or a foreground request. Purely an
/// optimization; correctness never depends on how much runs.
pub fn abortable_preclean(collector: &CmsCollector) {
    let budget = Duration::from_millis(collector.flags.abortable_preclean_budget_ms);
    let deadline = Instant::now() + budget;

    collector.token.cms_acquire();

    loop {
        if Instant::now() >= deadline
            || collector.pending_yield.is_pending()
            || collector.baton_requested()
        {
            break;
        }

        let dirty_cards = preclean_pass(collector, true);
        drain_serial(collector, true);

        if dirty_cards == 0 || !collector.driver_checkpoint() {
            break;
        }
    }

    collector.token.cms_release();
}

/// Stop-the-world remark: completes the closure. The world is already
/// stopped by the caller.
pub fn checkpoint_roots_final(collector: &CmsCollector) {
    mark_roots(collector);
    preclean_pass(collector, false);
    drain_serial(collector, false);

    // Overflow backstop: a forward scan from the restart address
    // re-discovers every overflowed object even if the list was mangled.
    if collector.overflow.overflow_count() > 0 {
        restart_rescan(collector);
    }

    if collector.flags.gc_verify {
        verify_marking(collector);
    }
}

/// Takes all dirty cards in the used region, then walks the heap linearly
/// rescanning marked objects that overlap them. Returns the number of
/// dirty cards found. The walk runs in short brackets under the allocator
/// lock: a concurrent free-chunk split rewrites block headers, and a
/// header must not change under the walk's size read. When `yielding`,
/// suspends at driver checkpoints between brackets; if the pass must stop
/// early, unprocessed cards are re-dirtied so remark sees them.
fn preclean_pass(collector: &CmsCollector, yielding: bool) -> usize {
    let used = collector.heap.used_region();
    let card_table = collector.heap.card_table();

    let mut dirty: Vec<Region> = Vec::new();
    let mut dirty_cards = 0;

    card_table.visit_cards(used, |table, card| {
        if table.take_dirty(card) {
            dirty_cards += 1;
            let region = table.card_region(card);

            match dirty.last_mut() {
                Some(last) if last.end == region.start => last.end = region.end,
                _ => dirty.push(region),
            }
        }
    });

    if dirty.is_empty() {
        return 0;
    }

    let mut local = MarkStack::new(
        collector.flags.mark_stack_capacity,
        collector.flags.mark_stack_max_capacity,
    );
    let mut dirty_idx = 0;
    let mut scan = used.start;
    let mut stopped_at = None;

    'walk: while scan < used.end {
        {
            let _alloc = collector.heap.lock_allocator();

            for _ in 0..CHECKPOINT_INTERVAL {
                if scan >= used.end {
                    break;
                }

                let obj = scan.to_obj();
                let size = obj.size();
                assert!(size > 0, "unformatted block at {}", scan);
                let obj_end = scan.offset(size);

                while dirty_idx < dirty.len() && dirty[dirty_idx].end <= scan {
                    dirty_idx += 1;
                }

                if dirty_idx == dirty.len() {
                    break 'walk;
                }

                if dirty[dirty_idx].start < obj_end
                    && !obj.is_free()
                    && collector.bitmap.is_marked(scan)
                {
                    scan_object(collector, scan, &mut local);
                }

                scan = obj_end;
            }
        }

        if yielding && scan < used.end && !collector.driver_checkpoint() {
            stopped_at = Some(scan);
            break;
        }
    }

    flush_local(collector, &mut local);

    if let Some(stop) = stopped_at {
        // Hand the unprocessed tail back to the card table.
        for region in &dirty[dirty_idx..] {
            let mut addr = region.start.max(stop);

            while addr < region.end {
                card_table.dirty(addr);
                addr = addr.offset(crate::gc::card::CARD_SIZE);
            }
        }
    }

    dirty_cards
}

fn flush_local(collector: &CmsCollector, local: &mut MarkStack) {
    while let Some(obj) = local.pop() {
        if !collector.mark_stack.par_push(obj) {
            collector.overflow.push(obj);
        }
    }
}

/// Serial drain of the shared stack and the overflow channel to a local
/// fixpoint.
fn drain_serial(collector: &CmsCollector, yielding: bool) {
    let mut local = MarkStack::new(
        collector.flags.mark_stack_capacity,
        collector.flags.mark_stack_max_capacity,
    );
    let mut processed = 0usize;

    loop {
        let obj = if let Some(obj) = local.pop() {
            obj
        } else if let Some(obj) = collector.mark_stack.par_pop() {
            obj
        } else {
            let batch = collector.overflow.take_all();

            if batch.is_empty() {
                return;
            }

            for &obj in batch.iter().skip(1) {
                if !collector.mark_stack.par_push(obj) {
                    collector.overflow.push(obj);
                }
            }

            batch[0]
        };

        scan_object(collector, obj, &mut local);
        processed += 1;

        if yielding && processed % CHECKPOINT_INTERVAL == 0 && !collector.driver_checkpoint() {
            flush_local(collector, &mut local);
            return;
        }
    }
}

/// Linear bitmap scan from the lowest address ever overflowed, rescanning
/// every marked object. Combined with the transitive drain this reaches a
/// fixpoint in a single pass: anything newly claimed is scanned by the
/// drain before the pass moves on.
fn restart_rescan(collector: &CmsCollector) {
    let restart = match collector.overflow.restart_address() {
        Some(addr) => addr,
        None => return,
    };

    let top = collector.heap.used_region().end;
    let mut local = MarkStack::new(
        collector.flags.mark_stack_capacity,
        collector.flags.mark_stack_max_capacity,
    );
    let mut cursor = restart;

    while let Some(addr) = collector.bitmap.next_marked_address(cursor, top) {
        scan_object(collector, addr, &mut local);
        flush_local(collector, &mut local);
        drain_serial(collector, false);
        cursor = addr.add_ptr(1);
    }
}

/// Recomputes reachability from the roots with an independent bitset and
/// checks every reachable object is marked. Stop-the-world only.
pub fn verify_marking(collector: &CmsCollector) {
    use fixedbitset::FixedBitSet;

    let used = collector.heap.used_region();
    let total = collector.heap.total();
    let word = crate::mem::ptr_width_usize();

    let granules = used.size() / word;
    let mut reachable = FixedBitSet::with_capacity(granules);
    let mut stack: Vec<Address> = Vec::new();

    let visit = |target: Address, reachable: &mut FixedBitSet, stack: &mut Vec<Address>| {
        if target.is_non_null() && total.contains(target) {
            let granule = target.offset_from(used.start) / word;

            if !reachable.contains(granule) {
                reachable.insert(granule);
                stack.push(target);
            }
        }
    };

    collector
        .heap
        .visit_roots(|slot| visit(slot.get(), &mut reachable, &mut stack));

    while let Some(obj) = stack.pop() {
        obj.to_obj()
            .visit_reference_fields(|slot| visit(slot.get(), &mut reachable, &mut stack));
    }

    for granule in reachable.ones() {
        let addr = used.start.add_ptr(granule);
        assert!(
            collector.bitmap.is_marked(addr),
            "reachable object {} not marked",
            addr
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;
    use crate::gc::M;
    use crate::mem;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn collector() -> Arc<CmsCollector> {
        let flags = Flags {
            heap_size: 2 * M,
            gc_workers: 2,
            occupancy_trigger_percent: 101,
            ..Flags::default()
        };
        CmsCollector::new(flags)
    }

    fn link(parent: Address, child: Address) -> crate::gc::Slot {
        let mut slot = None;
        parent.to_obj().visit_reference_fields(|s| slot = Some(s));
        let slot = slot.unwrap();
        slot.set(child);
        slot
    }

    #[test]
    fn preclean_rescans_marked_objects_on_dirty_cards() {
        let collector = collector();

        let parent = collector.heap.allocate(8, 1).unwrap();
        let child = collector.heap.allocate(8, 0).unwrap();

        // Marking claimed the parent before the mutator stored the
        // reference; the write barrier leaves the card dirty.
        collector.bitmap.mark(parent);
        let slot = link(parent, child);
        collector.heap.write_barrier(slot);

        preclean_pass(&collector, false);
        drain_serial(&collector, false);

        assert!(collector.bitmap.is_marked(child));
        collector.stop();
    }

    #[test]
    fn preclean_ignores_unmarked_objects() {
        let collector = collector();

        let parent = collector.heap.allocate(8, 1).unwrap();
        let child = collector.heap.allocate(8, 0).unwrap();

        let slot = link(parent, child);
        collector.heap.write_barrier(slot);

        preclean_pass(&collector, false);
        drain_serial(&collector, false);

        // The parent was never claimed, so the dirty card rescans nothing.
        assert!(collector.bitmap.is_unmarked(child));
        collector.stop();
    }

    #[test]
    fn preclean_survives_concurrent_free_list_carving() {
        let collector = collector();
        let word = mem::ptr_width_usize();

        let parent = collector.heap.allocate(8, 1).unwrap();
        let child = collector.heap.allocate(8, 0).unwrap();

        // A long run of chunks the allocator will carve from the free list
        // while the pass walks over them.
        let mut chunks = Vec::new();
        for _ in 0..1_500 {
            chunks.push(collector.heap.allocate(64, 0).unwrap());
        }

        // Exhaust bump space so allocation splits free chunks.
        while collector.heap.allocate(3, 0).is_some() {}

        for &chunk in &chunks {
            collector.heap.add_free_range(chunk, 64 * word);
        }

        collector.bitmap.mark(parent);
        let slot = link(parent, child);
        collector.heap.write_barrier(slot);

        let stop = Arc::new(AtomicBool::new(false));

        let allocator = {
            let collector = collector.clone();
            let stop = stop.clone();

            std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    if collector.heap.allocate(5, 0).is_none() {
                        break;
                    }
                }
            })
        };

        preclean_pass(&collector, false);
        drain_serial(&collector, false);

        stop.store(true, Ordering::SeqCst);
        allocator.join().unwrap();

        assert!(collector.bitmap.is_marked(child));
        collector.stop();
    }
}
