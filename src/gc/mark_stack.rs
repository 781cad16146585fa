use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::{Address, Region};
use crate::mem;
use crate::os;

/// Bounded marking stack. Capacity is fixed per cycle so marking memory is
/// bounded eagerly; `push` reports failure instead of growing and the caller
/// falls back to the overflow channel. A single capacity expansion per cycle
/// is allowed at a safe checkpoint when overflow is sustained.
pub struct MarkStack {
    entries: Vec<Address>,
    capacity: usize,
    max_capacity: usize,
    expanded: bool,
}

impl MarkStack {
    pub fn new(capacity: usize, max_capacity: usize) -> MarkStack {
        assert!(capacity > 0 && capacity <= max_capacity);

        MarkStack {
            entries: Vec::with_capacity(max_capacity),
            capacity,
            max_capacity,
            expanded: false,
        }
    }

    pub fn push(&mut self, obj: Address) -> bool {
        debug_assert!(self.entries.len() <= self.capacity);

        if self.entries.len() == self.capacity {
            return false;
        }

        self.entries.push(obj);
        true
    }

    pub fn pop(&mut self) -> Option<Address> {
        self.entries.pop()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// One-time capacity expansion, invoked only at a safe checkpoint.
    /// Returns false when the stack already expanded this cycle or is at its
    /// maximum.
    pub fn expand(&mut self) -> bool {
        if self.expanded || self.capacity == self.max_capacity {
            return false;
        }

        self.capacity = std::cmp::min(self.capacity * 2, self.max_capacity);
        self.expanded = true;
        true
    }

    pub fn reset(&mut self) {
        self.entries.clear();
        self.expanded = false;
    }
}

/// Shared-instance wrapper adding the coarse mutex for `par_push`/`par_pop`.
pub struct SharedMarkStack {
    inner: Mutex<MarkStack>,
}

impl SharedMarkStack {
    pub fn new(capacity: usize, max_capacity: usize) -> SharedMarkStack {
        SharedMarkStack {
            inner: Mutex::new(MarkStack::new(capacity, max_capacity)),
        }
    }

    pub fn par_push(&self, obj: Address) -> bool {
        self.inner.lock().push(obj)
    }

    pub fn par_pop(&self) -> Option<Address> {
        self.inner.lock().pop()
    }

    pub fn par_is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn expand(&self) -> bool {
        self.inner.lock().expand()
    }

    pub fn reset(&self) {
        self.inner.lock().reset()
    }
}

const RESTART_NONE: usize = usize::MAX;

/// Lock-free overflow channel: a process-wide list of objects that did not
/// fit on any mark stack. The default implementation keeps the per-object
/// link in a side table parallel to the covered region instead of inside the
/// object header (see `intrusive` for the in-header variant).
///
/// The restart address is maintained independently of the list: even if the
/// list is never walked, a forward bitmap scan from the restart address
/// re-discovers every overflowed object. Overflow never drops an object.
pub struct OverflowChannel {
    covered: Region,
    links: Address,
    links_size: usize,
    head: AtomicUsize,
    restart: AtomicUsize,
    overflows: AtomicUsize,
}

impl OverflowChannel {
    pub fn new(covered: Region) -> OverflowChannel {
        let granules = covered.size() / mem::ptr_width_usize();
        let links_size = mem::os_page_align_up(granules * mem::ptr_width_usize());
        let links = os::commit(links_size);

        OverflowChannel {
            covered,
            links,
            links_size,
            head: AtomicUsize::new(0),
            restart: AtomicUsize::new(RESTART_NONE),
            overflows: AtomicUsize::new(0),
        }
    }

    fn link_slot(&self, obj: Address) -> &AtomicUsize {
        debug_assert!(self.covered.contains(obj));
        let granule = obj.offset_from(self.covered.start) / mem::ptr_width_usize();
        unsafe { &*self.links.add_ptr(granule).to_ptr::<AtomicUsize>() }
    }

    pub fn push(&self, obj: Address) {
        debug_assert!(obj.is_non_null());

        let slot = self.link_slot(obj);
        let mut prev = self.head.load(Ordering::Acquire);

        loop {
            slot.store(prev, Ordering::Release);

            match self.head.compare_exchange_weak(
                prev,
                obj.to_usize(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }

        self.lower_restart(obj);
        self.overflows.fetch_add(1, Ordering::Relaxed);
    }

    fn lower_restart(&self, obj: Address) {
        let mut current = self.restart.load(Ordering::Relaxed);

        while obj.to_usize() < current {
            match self.restart.compare_exchange_weak(
                current,
                obj.to_usize(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    /// Detaches the whole list atomically and returns its objects. Taking
    /// everything at once sidesteps ABA on the list head; leftovers are
    /// simply pushed again.
    pub fn take_all(&self) -> Vec<Address> {
        let mut current = self.head.swap(0, Ordering::AcqRel);
        let mut objects = Vec::new();

        while current != 0 {
            let obj = Address::from(current);
            objects.push(obj);
            current = self.link_slot(obj).load(Ordering::Acquire);
        }

        objects
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire) == 0
    }

    /// Lowest address ever pushed in the current cycle.
    pub fn restart_address(&self) -> Option<Address> {
        let restart = self.restart.load(Ordering::Acquire);

        if restart == RESTART_NONE {
            None
        } else {
            Some(Address::from(restart))
        }
    }

    pub fn overflow_count(&self) -> usize {
        self.overflows.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        self.head.store(0, Ordering::Release);
        self.restart.store(RESTART_NONE, Ordering::Release);
        self.overflows.store(0, Ordering::Relaxed);
    }
}

impl Drop for OverflowChannel {
    fn drop(&mut self) {
        os::free(self.links, self.links_size);
    }
}

/// Record of (object, original header word) for every header repurposed by
/// the intrusive overflow list. Single writer per generation: the thread
/// holding that generation's free-list lock. Drained/restored once per cycle.
pub struct PreservedMarksTable {
    entries: Mutex<Vec<(Address, usize)>>,
}

impl PreservedMarksTable {
    pub fn new() -> PreservedMarksTable {
        PreservedMarksTable {
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn preserve(&self, obj: Address, header_word: usize) {
        self.entries.lock().push((obj, header_word));
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Puts every repurposed header word back. Must run at a safepoint
    /// before anything reads headers again.
    pub fn restore_all(&self) {
        let mut entries = self.entries.lock();

        for &(obj, header_word) in entries.iter() {
            obj.to_obj().header().set_raw(header_word);
        }

        entries.clear();
    }
}

/// In-place variant chaining overflowed objects through their own header
/// word. A classic unsafe space optimization: the header value must be
/// preserved first and restored before the header is interpreted again.
/// Prefer `OverflowChannel`; this exists for embedders that cannot afford
/// the side table.
pub mod intrusive {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::{PreservedMarksTable, RESTART_NONE};
    use crate::gc::Address;

    pub struct IntrusiveOverflowList {
        head: AtomicUsize,
        restart: AtomicUsize,
        overflows: AtomicUsize,
        preserved: PreservedMarksTable,
    }

    impl IntrusiveOverflowList {
        pub fn new() -> IntrusiveOverflowList {
            IntrusiveOverflowList {
                head: AtomicUsize::new(0),
                restart: AtomicUsize::new(RESTART_NONE),
                overflows: AtomicUsize::new(0),
                preserved: PreservedMarksTable::new(),
            }
        }

        /// Links `obj` in front of the previous head by storing the head in
        /// the object's own header word.
        pub fn push(&self, obj: Address) {
            let header = obj.to_obj().header();
            self.preserved.preserve(obj, header.raw());

            let mut prev = self.head.load(Ordering::Acquire);

            loop {
                header.atomic().store(prev, Ordering::Release);

                match self.head.compare_exchange_weak(
                    prev,
                    obj.to_usize(),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => break,
                    Err(actual) => prev = actual,
                }
            }

            let mut current = self.restart.load(Ordering::Relaxed);

            while obj.to_usize() < current {
                match self.restart.compare_exchange_weak(
                    current,
                    obj.to_usize(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(actual) => current = actual,
                }
            }

            self.overflows.fetch_add(1, Ordering::Relaxed);
        }

        pub fn take_all(&self) -> Vec<Address> {
            let mut current = self.head.swap(0, Ordering::AcqRel);
            let mut objects = Vec::new();

            while current != 0 {
                let obj = Address::from(current);
                objects.push(obj);
                current = obj.to_obj().header().atomic().load(Ordering::Acquire);
            }

            objects
        }

        pub fn is_empty(&self) -> bool {
            self.head.load(Ordering::Acquire) == 0
        }

        pub fn restart_address(&self) -> Option<Address> {
            let restart = self.restart.load(Ordering::Acquire);

            if restart == RESTART_NONE {
                None
            } else {
                Some(Address::from(restart))
            }
        }

        pub fn overflow_count(&self) -> usize {
            self.overflows.load(Ordering::Relaxed)
        }

        /// Restores every repurposed header and empties the list.
        pub fn reset(&self) {
            self.head.store(0, Ordering::Release);
            self.restart.store(RESTART_NONE, Ordering::Release);
            self.overflows.store(0, Ordering::Relaxed);
            self.preserved.restore_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn push_fails_only_at_capacity() {
        let mut stack = MarkStack::new(4, 8);

        for idx in 0..4 {
            assert!(stack.push(Address::from(0x1000 + idx * 8)));
        }

        assert_eq!(stack.len(), 4);
        assert!(!stack.push(Address::from(0x2000)));

        assert_eq!(stack.pop(), Some(Address::from(0x1018)));
        assert!(stack.push(Address::from(0x2000)));
    }

    #[test]
    fn expansion_is_one_time() {
        let mut stack = MarkStack::new(4, 16);

        assert!(stack.expand());
        assert_eq!(stack.capacity(), 8);
        assert!(!stack.expand());

        stack.reset();
        assert!(stack.expand());
        assert_eq!(stack.capacity(), 16);
        assert!(!stack.expand());
    }

    fn channel_fixture(words: usize) -> (Address, Region, OverflowChannel) {
        let size = mem::os_page_align_up(words * mem::ptr_width_usize());
        let start = os::commit(size);
        let region = start.region_start(size);
        let channel = OverflowChannel::new(region);
        (start, region, channel)
    }

    #[test]
    fn overflow_channel_loses_nothing() {
        let (start, _region, channel) = channel_fixture(4096);
        let channel = Arc::new(channel);

        let handles: Vec<_> = (0..4)
            .map(|worker| {
                let channel = channel.clone();

                std::thread::spawn(move || {
                    for idx in 0..64 {
                        channel.push(start.add_ptr(worker * 64 + idx));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let mut seen = HashSet::new();

        loop {
            let batch = channel.take_all();

            if batch.is_empty() {
                break;
            }

            for obj in batch {
                assert!(seen.insert(obj), "object delivered twice");
            }
        }

        assert_eq!(seen.len(), 4 * 64);
        assert_eq!(channel.overflow_count(), 4 * 64);
        assert_eq!(channel.restart_address(), Some(start));

        os::free(start, mem::os_page_align_up(4096 * mem::ptr_width_usize()));
    }

    #[test]
    fn restart_address_is_minimum_ever_pushed() {
        let (start, _region, channel) = channel_fixture(1024);

        channel.push(start.add_ptr(100));
        channel.push(start.add_ptr(10));
        channel.push(start.add_ptr(500));
        let _ = channel.take_all();

        // Draining the list does not raise the restart address.
        assert_eq!(channel.restart_address(), Some(start.add_ptr(10)));

        channel.reset();
        assert_eq!(channel.restart_address(), None);

        os::free(start, mem::os_page_align_up(1024 * mem::ptr_width_usize()));
    }

    #[test]
    fn intrusive_list_preserves_headers() {
        let size = mem::os_page_align_up(1024 * mem::ptr_width_usize());
        let start = os::commit(size);

        let a = start;
        let b = start.add_ptr(8);
        object::init_object(a, 8, 0);
        object::init_object(b, 8, 0);

        let list = intrusive::IntrusiveOverflowList::new();
        list.push(a);
        list.push(b);

        // Headers now hold links, not their original values.
        assert_eq!(b.to_obj().header().raw(), a.to_usize());

        let taken = list.take_all();
        assert_eq!(taken, vec![b, a]);
        assert_eq!(list.restart_address(), Some(a));

        list.reset();
        assert_eq!(a.to_obj().header().raw(), 0);
        assert_eq!(b.to_obj().header().raw(), 0);

        os::free(start, size);
    }
}
