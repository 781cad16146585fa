use crossbeam_deque::{Injector, Steal};
use scoped_threadpool::Pool;

use crate::gc::cms::marker::Terminator;
use crate::gc::cms::CmsCollector;
use crate::gc::{Address, GcReason};
use crate::object;

/// Local marking buffer size before spilling back to the injector.
const SPILL_THRESHOLD: usize = 256;

/// Synchronous full mark-sweep. The caller has already stopped the world
/// and holds the safepoint-side token; any background cycle was abandoned
/// through the baton protocol before we get here.
pub fn collect(collector: &CmsCollector, _reason: GcReason) {
    assert!(collector.phase.is_outside_cycle());

    collector.bitmap.clear_all();
    collector.mark_stack.reset();
    collector.overflow.reset();
    collector.set_sweep_limit(Address::null());

    mark_all(collector);
    sweep_all(collector);

    collector.heap.card_table().clear_all();
    collector.bitmap.clear_all();

    let capacity = {
        let controller = collector.controller.lock();
        controller.compute_capacity(collector.heap.used())
    };
    collector.heap.set_capacity(capacity);
}

/// Parallel transitive closure from the roots. The world is stopped, so
/// plain unbounded local buffers are fine; the injector distributes work
/// and catches spills.
fn mark_all(collector: &CmsCollector) {
    let total = collector.heap.total();
    let injector: Injector<Address> = Injector::new();

    collector.heap.visit_roots(|slot| {
        let target = slot.get();

        if target.is_non_null() && total.contains(target) && collector.bitmap.par_mark(target) {
            injector.push(target);
        }
    });

    let workers = collector.flags.gc_workers();
    let terminator = Terminator::new(workers);
    let mut pool = Pool::new(workers as u32);

    pool.scoped(|scoped| {
        for _ in 0..workers {
            scoped.execute(|| {
                mark_worker(collector, &injector, &terminator);
            });
        }
    });
}

fn mark_worker(collector: &CmsCollector, injector: &Injector<Address>, terminator: &Terminator) {
    let total = collector.heap.total();
    let mut local: Vec<Address> = Vec::new();

    loop {
        while let Some(obj) = next_object(&mut local, injector) {
            obj.to_obj().visit_reference_fields(|slot| {
                let target = slot.get();

                if target.is_non_null()
                    && total.contains(target)
                    && collector.bitmap.par_mark(target)
                {
                    if local.len() >= SPILL_THRESHOLD {
                        injector.push(target);
                    } else {
                        local.push(target);
                    }
                }
            });
        }

        terminator.enter_idle();

        loop {
            if terminator.all_idle() {
                return;
            }

            if !injector.is_empty() {
                terminator.exit_idle();
                break;
            }

            std::thread::yield_now();
        }
    }
}

fn next_object(local: &mut Vec<Address>, injector: &Injector<Address>) -> Option<Address> {
    if let Some(obj) = local.pop() {
        return Some(obj);
    }

    loop {
        match injector.steal() {
            Steal::Success(obj) => return Some(obj),
            Steal::Empty => return None,
            Steal::Retry => continue,
        }
    }
}

/// Serial linear sweep rebuilding the free list from scratch.
fn sweep_all(collector: &CmsCollector) {
    let used = collector.heap.used_region();
    collector.heap.clear_free_list();

    let mut garbage_start = Address::null();

    object::walk_region(used, |addr, obj| {
        let dead = obj.is_free() || collector.bitmap.is_unmarked(addr);

        if dead {
            if garbage_start.is_null() {
                garbage_start = addr;
            }
        } else if garbage_start.is_non_null() {
            add_freelist(collector, garbage_start, addr);
            garbage_start = Address::null();
        }

        true
    });

    if garbage_start.is_non_null() {
        add_freelist(collector, garbage_start, used.end);
    }
}

fn add_freelist(collector: &CmsCollector, start: Address, end: Address) {
    assert!(start < end);
    collector.heap.add_free_range(start, end.offset_from(start));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::Flags;
    use crate::gc::{Slot, M};
    use crate::mem;
    use std::sync::Arc;

    fn collector() -> Arc<CmsCollector> {
        let flags = Flags {
            heap_size: 4 * M,
            gc_workers: 2,
            ..Flags::default()
        };
        CmsCollector::new(flags)
    }

    #[test]
    fn full_collection_keeps_reachable_reclaims_rest() {
        let collector = collector();
        let word = mem::ptr_width_usize();

        let root_target = collector.allocate(16, 1).unwrap();
        let child = collector.allocate(8, 0).unwrap();
        let garbage = collector.allocate(64, 0).unwrap();

        // root -> root_target -> child; garbage unreachable.
        let mut field = None;
        root_target.to_obj().visit_reference_fields(|slot| field = Some(slot));
        field.unwrap().set(child);

        let root_storage = Box::new(root_target);
        let root = Slot::at(Address::from_ptr(&*root_storage));
        collector.heap.add_root(root);

        let used_before = collector.heap.used();
        collector.collect_full(GcReason::AllocationFailure);

        // Reachable objects survive intact.
        assert_eq!(root_target.to_obj().size_words(), 16);
        assert_eq!(root_target.to_obj().ref_count(), 1);
        assert_eq!(child.to_obj().size_words(), 8);

        // The garbage block became a free chunk.
        assert!(garbage.to_obj().is_free());
        assert!(collector.heap.used() <= used_before - 64 * word);

        // State is back to idle, bitmap cleared.
        assert!(collector.state().is_outside_cycle());
        assert!(collector.bitmap.is_unmarked(root_target));

        collector.stop();
    }

    #[test]
    fn allocation_failure_triggers_full_collection() {
        let flags = Flags {
            heap_size: M,
            gc_workers: 2,
            ..Flags::default()
        };
        let collector = CmsCollector::new(flags);

        // Fill the heap with garbage; no roots, so everything is dead.
        while collector.heap.allocate(1024, 0).is_some() {}

        // The failure path runs a full collection and retries.
        let obj = collector.allocate(1024, 0);
        assert!(obj.is_some());
        assert!(collector.controller.lock().total_full_collections >= 1);
        assert!(collector.state().is_outside_cycle());

        collector.stop();
    }
}
