use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::{Address, Region, Slot};
use crate::mem;

/// Minimal heap block model used by the collector core. A block is either a
/// live object or a free chunk; both are self-describing so the sweeper can
/// walk a region linearly:
///
/// live object: [header][size in words][ref count][ref slots...][payload...]
/// free chunk:  [header | FREE_BIT][size in words]
///
/// Mark state lives in the mark bitmap, not in the header. The header word is
/// only repurposed by the intrusive overflow-list variant, which preserves
/// its original value first.
pub const FREE_BIT: usize = 1;

pub const HDR_OFFSET: usize = 0;
pub const SIZE_OFFSET: usize = 1;
pub const REFS_OFFSET: usize = 2;

/// Smallest live object: header, size, ref count.
pub const MIN_OBJECT_WORDS: usize = 3;
/// Smallest free chunk: header, size.
pub const MIN_FREE_WORDS: usize = 2;

#[repr(C)]
pub struct Header {
    word: AtomicUsize,
}

impl Header {
    pub fn raw(&self) -> usize {
        self.word.load(Ordering::Relaxed)
    }

    pub fn set_raw(&self, value: usize) {
        self.word.store(value, Ordering::Relaxed);
    }

    pub fn is_free(&self) -> bool {
        (self.raw() & FREE_BIT) != 0
    }

    pub fn atomic(&self) -> &AtomicUsize {
        &self.word
    }
}

#[repr(C)]
pub struct Obj {
    header: Header,
    size_words: usize,
    ref_count: usize,
}

impl Obj {
    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn is_free(&self) -> bool {
        self.header.is_free()
    }

    pub fn size_words(&self) -> usize {
        self.size_words
    }

    pub fn size(&self) -> usize {
        self.size_words * mem::ptr_width_usize()
    }

    pub fn address(&self) -> Address {
        Address::from_ptr(self as *const _)
    }

    pub fn ref_count(&self) -> usize {
        debug_assert!(!self.is_free());
        self.ref_count
    }

    fn ref_slot(&self, idx: usize) -> Slot {
        debug_assert!(idx < self.ref_count());
        Slot::at(self.address().add_ptr(REFS_OFFSET + 1 + idx))
    }

    pub fn visit_reference_fields<F>(&self, mut visitor: F)
    where
        F: FnMut(Slot),
    {
        debug_assert!(!self.is_free());

        for idx in 0..self.ref_count() {
            visitor(self.ref_slot(idx));
        }
    }
}

impl Address {
    pub fn to_obj(self) -> &'static Obj {
        debug_assert!(self.is_word_aligned());
        unsafe { &*self.to_mut_ptr::<Obj>() }
    }
}

/// Visits every block in `region` in address order, live objects and free
/// chunks alike. The region must be fully formatted. The visitor returns
/// false to stop the walk early.
pub fn walk_region<F>(region: Region, mut f: F)
where
    F: FnMut(Address, &Obj) -> bool,
{
    let mut scan = region.start;

    while scan < region.end {
        let obj = scan.to_obj();
        let size = obj.size();
        assert!(size > 0, "unformatted block at {}", scan);

        if !f(scan, obj) {
            return;
        }

        scan = scan.offset(size);
    }

    assert_eq!(scan, region.end);
}

/// Formats a region as a live object with `ref_count` reference slots.
/// The slots are cleared; the rest of the payload is left untouched.
pub fn init_object(start: Address, size_words: usize, ref_count: usize) {
    assert!(size_words >= MIN_OBJECT_WORDS + ref_count);

    unsafe {
        *start.to_mut_ptr::<usize>() = 0;
        *start.add_ptr(SIZE_OFFSET).to_mut_ptr::<usize>() = size_words;
        *start.add_ptr(REFS_OFFSET).to_mut_ptr::<usize>() = ref_count;

        for idx in 0..ref_count {
            *start.add_ptr(REFS_OFFSET + 1 + idx).to_mut_ptr::<usize>() = 0;
        }
    }
}

/// Formats a region as a free chunk so a linear walk can skip over it.
pub fn init_free_chunk(start: Address, size_words: usize) {
    assert!(size_words >= MIN_FREE_WORDS);

    unsafe {
        *start.to_mut_ptr::<usize>() = FREE_BIT;
        *start.add_ptr(SIZE_OFFSET).to_mut_ptr::<usize>() = size_words;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;

    #[test]
    fn object_layout_round_trip() {
        let mem = os::commit(os::page_size());
        init_object(mem, 8, 2);

        let obj = mem.to_obj();
        assert!(!obj.is_free());
        assert_eq!(obj.size_words(), 8);
        assert_eq!(obj.ref_count(), 2);

        let mut slots = Vec::new();
        obj.visit_reference_fields(|slot| slots.push(slot));
        assert_eq!(slots.len(), 2);
        assert!(slots.iter().all(|slot| slot.get().is_null()));

        let target = mem.add_ptr(32);
        slots[1].set(target);
        assert_eq!(slots[1].get(), target);

        os::free(mem, os::page_size());
    }

    #[test]
    fn free_chunk_layout() {
        let mem = os::commit(os::page_size());
        init_free_chunk(mem, 16);

        let obj = mem.to_obj();
        assert!(obj.is_free());
        assert_eq!(obj.size_words(), 16);

        os::free(mem, os::page_size());
    }
}
