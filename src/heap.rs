use parking_lot::{Mutex, MutexGuard};

use crate::flags::Flags;
use crate::gc::card::CardTable;
use crate::gc::freelist::FreeList;
use crate::gc::{Address, Region, Slot};
use crate::mem;
use crate::object;
use crate::os;
use crate::os::MemoryPermission;

struct AllocState {
    top: Address,
    limit: Address,
    free_list: FreeList,
}

/// Holds the allocation lock: no bump or free-list allocation can run, so
/// block headers stay stable under a linear walk.
pub struct AllocatorGuard<'a> {
    _state: MutexGuard<'a, AllocState>,
}

/// The managed generation: one contiguous space, linearly walkable from
/// `start` to `top` because every block is a self-describing object or free
/// chunk. Allocation bumps `top` until the soft capacity limit, then falls
/// back to the free list rebuilt by the sweeper.
pub struct Heap {
    reservation: os::Reservation,
    total: Region,
    state: Mutex<AllocState>,
    roots: Mutex<Vec<Slot>>,
    card_table: CardTable,
    initial_capacity: usize,
}

impl Heap {
    pub fn new(flags: &Flags) -> Heap {
        let max_size = flags.max_heap_size();
        let reservation = os::reserve(max_size);
        os::commit_at(reservation.start(), max_size, MemoryPermission::ReadWrite);

        let total = reservation.start().region_start(max_size);

        // Start with half the reservation as capacity; resizing can grow
        // toward the reservation end.
        let initial_capacity = std::cmp::max(
            mem::align_usize_up(max_size / 2, os::page_size()),
            os::page_size(),
        );
        let limit = total.start.offset(std::cmp::min(initial_capacity, max_size));

        let card_table = CardTable::new(total);

        Heap {
            reservation,
            total,
            state: Mutex::new(AllocState {
                top: total.start,
                limit,
                free_list: FreeList::new(),
            }),
            roots: Mutex::new(Vec::new()),
            card_table,
            initial_capacity: limit.offset_from(total.start),
        }
    }

    pub fn total(&self) -> Region {
        self.total
    }

    /// Region that linear walks must cover: everything below `top`.
    pub fn used_region(&self) -> Region {
        let state = self.state.lock();
        Region::new(self.total.start, state.top)
    }

    pub fn card_table(&self) -> &CardTable {
        &self.card_table
    }

    /// Allocates and formats a live object with `ref_count` cleared
    /// reference slots. Returns None when neither bump space nor the free
    /// list can satisfy the request; the caller triggers a collection.
    pub fn allocate(&self, size_words: usize, ref_count: usize) -> Option<Address> {
        assert!(size_words >= object::MIN_OBJECT_WORDS + ref_count);

        let size = size_words * mem::ptr_width_usize();
        let mut state = self.state.lock();

        let next_top = state.top.offset(size);

        if next_top <= state.limit {
            let obj = state.top;
            state.top = next_top;
            object::init_object(obj, size_words, ref_count);
            return Some(obj);
        }

        let space = state.free_list.alloc(size);

        if space.is_non_null() {
            let chunk = space.addr();
            let chunk_size = space.size();
            assert!(chunk_size >= size);

            let remainder = chunk_size - size;

            if remainder >= object::MIN_FREE_WORDS * mem::ptr_width_usize() {
                state.free_list.add(chunk.offset(size), remainder);
                object::init_object(chunk, size_words, ref_count);
            } else {
                // Too small to stand alone as a free chunk; absorb it as
                // object padding so the linear walk stays intact.
                object::init_object(chunk, chunk_size / mem::ptr_width_usize(), ref_count);
            }

            return Some(chunk);
        }

        None
    }

    /// Records a reference store for concurrent marking. Called by the
    /// embedder after every `Slot::set` into the heap.
    pub fn write_barrier(&self, slot: Slot) {
        debug_assert!(self.total.contains(slot.address()));
        self.card_table.dirty(slot.address());
    }

    pub fn add_root(&self, slot: Slot) {
        self.roots.lock().push(slot);
    }

    pub fn remove_root(&self, slot: Slot) {
        let mut roots = self.roots.lock();

        if let Some(idx) = roots.iter().position(|&root| root == slot) {
            roots.swap_remove(idx);
        }
    }

    pub fn visit_roots<F>(&self, mut f: F)
    where
        F: FnMut(Slot),
    {
        for &slot in self.roots.lock().iter() {
            f(slot);
        }
    }

    pub fn capacity(&self) -> usize {
        let state = self.state.lock();
        state.limit.offset_from(self.total.start)
    }

    pub fn initial_capacity(&self) -> usize {
        self.initial_capacity
    }

    pub fn max_capacity(&self) -> usize {
        self.total.size()
    }

    /// Bytes in live-or-allocated blocks: everything below `top` minus
    /// what the free list holds.
    pub fn used(&self) -> usize {
        let state = self.state.lock();
        state.top.offset_from(self.total.start) - state.free_list.total()
    }

    pub fn free_list_total(&self) -> usize {
        self.state.lock().free_list.total()
    }

    pub fn occupancy_percent(&self) -> usize {
        self.used() * 100 / self.capacity()
    }

    /// Adjusts the soft capacity limit. Never below `top` or above the
    /// reservation.
    pub fn set_capacity(&self, capacity: usize) {
        let mut state = self.state.lock();

        let capacity = std::cmp::min(capacity, self.total.size());
        let limit = self.total.start.offset(capacity);
        state.limit = std::cmp::max(limit, state.top);
    }

    /// Blocks allocation while held. Concurrent precleaning brackets its
    /// heap walks with this: a free-chunk split rewrites block headers, and
    /// a header must not change under the walk's size read.
    pub fn lock_allocator(&self) -> AllocatorGuard<'_> {
        AllocatorGuard {
            _state: self.state.lock(),
        }
    }

    /// Drops all free-list entries before a sweep rebuilds them. The chunks
    /// themselves stay formatted in the heap, so walks are unaffected; they
    /// are simply not allocatable until the sweeper re-registers them.
    pub fn clear_free_list(&self) {
        self.state.lock().free_list.clear();
    }

    /// Sweeper flush: registers a coalesced free range.
    pub fn add_free_range(&self, start: Address, size: usize) {
        debug_assert!(self.total.contains(start));
        self.state.lock().free_list.add(start, size);
    }

    /// Sweeper coalescing support: takes back the chunk at `start` if it is
    /// still in the free list. False means the allocator claimed it.
    pub fn remove_free_chunk(&self, start: Address) -> bool {
        self.state.lock().free_list.remove(start)
    }

    /// Address-sorted snapshot of the free list.
    pub fn free_chunks(&self) -> Vec<(Address, usize)> {
        self.state.lock().free_list.chunks()
    }

    pub fn reservation_start(&self) -> Address {
        self.reservation.start()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::M;

    fn test_heap() -> Heap {
        let flags = Flags {
            heap_size: 2 * M,
            ..Flags::default()
        };
        Heap::new(&flags)
    }

    #[test]
    fn bump_allocation_until_capacity() {
        let heap = test_heap();
        let word = mem::ptr_width_usize();

        let first = heap.allocate(8, 2).expect("allocation failed");
        let second = heap.allocate(8, 0).expect("allocation failed");
        assert_eq!(second, first.offset(8 * word));

        assert!(!first.to_obj().is_free());
        assert_eq!(first.to_obj().ref_count(), 2);

        // Exhaust the capacity; allocation must fail, not grow.
        let capacity_words = heap.capacity() / word;
        let mut allocated = 2 * 8;

        while heap.allocate(512, 0).is_some() {
            allocated += 512;
            assert!(allocated <= capacity_words);
        }

        assert!(heap.allocate(512, 0).is_none());
    }

    #[test]
    fn free_list_allocation_splits_chunks() {
        let heap = test_heap();
        let word = mem::ptr_width_usize();

        let obj = heap.allocate(64, 0).expect("allocation failed");

        // Exhaust bump space, including the tail below 512 words, so the
        // next allocation must come from the free list.
        while heap.allocate(512, 0).is_some() {}
        while heap.allocate(3, 0).is_some() {}

        // Pretend the sweeper reclaimed the first object.
        heap.add_free_range(obj, 64 * word);

        let reused = heap.allocate(16, 0).expect("free list allocation failed");
        assert_eq!(reused, obj);

        // The remainder is formatted as a free chunk.
        let remainder = obj.add_ptr(16);
        assert!(remainder.to_obj().is_free());
        assert_eq!(remainder.to_obj().size_words(), 48);

        let next = heap.allocate(40, 0).expect("remainder allocation failed");
        assert_eq!(next, remainder);
    }

    #[test]
    fn undersized_remainder_is_absorbed() {
        let heap = test_heap();
        let word = mem::ptr_width_usize();

        let obj = heap.allocate(8, 0).expect("allocation failed");
        while heap.allocate(512, 0).is_some() {}
        while heap.allocate(3, 0).is_some() {}

        heap.add_free_range(obj, 8 * word);

        // Requesting 7 words leaves a 1-word remainder, below the free
        // chunk minimum; the object absorbs it.
        let reused = heap.allocate(7, 0).expect("free list allocation failed");
        assert_eq!(reused, obj);
        assert_eq!(reused.to_obj().size_words(), 8);
    }

    #[test]
    fn occupancy_tracks_used_bytes() {
        let heap = test_heap();
        assert_eq!(heap.used(), 0);

        heap.allocate(1024, 0).expect("allocation failed");
        let used = heap.used();
        assert_eq!(used, 1024 * mem::ptr_width_usize());
        assert!(heap.occupancy_percent() <= 100);

        heap.set_capacity(heap.max_capacity());
        assert_eq!(heap.capacity(), heap.max_capacity());
    }

    #[test]
    fn write_barrier_dirties_card() {
        let heap = test_heap();

        let obj = heap.allocate(8, 1).expect("allocation failed");
        let mut slot = None;
        obj.to_obj().visit_reference_fields(|s| slot = Some(s));
        let slot = slot.unwrap();

        slot.set(obj);
        heap.write_barrier(slot);

        let card = heap.card_table().card_idx(slot.address());
        assert!(heap.card_table().is_dirty(card));
    }
}
