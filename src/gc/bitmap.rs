use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::gc::{Address, Region};
use crate::mem;
use crate::os;

const BITS_PER_WORD: usize = mem::ptr_width_usize() * 8;

/// Marking bitmap with one bit per heap word. A set bit means the word is the
/// start of an object claimed as reachable in the current cycle.
///
/// `par_mark` is the lock-free claim primitive used during concurrent
/// marking; the advisory lock only guards bulk non-atomic operations
/// (`mark_range`, `clear_range`, `clear_all`).
pub struct MarkBitMap {
    covered: Region,
    bitmap_start: Address,
    bitmap_size: usize,
    bulk_lock: Mutex<()>,
}

impl MarkBitMap {
    pub fn new(covered: Region) -> MarkBitMap {
        assert!(covered.start.is_word_aligned() && covered.end.is_word_aligned());

        let words = covered.size() / mem::ptr_width_usize();
        let bitmap_words = (words + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let bitmap_size = mem::os_page_align_up(bitmap_words * mem::ptr_width_usize());
        let bitmap_start = os::commit(bitmap_size);

        MarkBitMap {
            covered,
            bitmap_start,
            bitmap_size,
            bulk_lock: Mutex::new(()),
        }
    }

    pub fn covered(&self) -> Region {
        self.covered
    }

    #[inline]
    fn word_and_mask(&self, addr: Address) -> (usize, usize) {
        debug_assert!(self.covered.valid_top(addr));
        let granule = addr.offset_from(self.covered.start) / mem::ptr_width_usize();
        (granule / BITS_PER_WORD, 1 << (granule % BITS_PER_WORD))
    }

    #[inline]
    fn word(&self, index: usize) -> &AtomicUsize {
        assert!(index * mem::ptr_width_usize() < self.bitmap_size);
        unsafe { &*self.bitmap_start.add_ptr(index).to_ptr::<AtomicUsize>() }
    }

    pub fn is_marked(&self, addr: Address) -> bool {
        let (index, mask) = self.word_and_mask(addr);
        (self.word(index).load(Ordering::Relaxed) & mask) != 0
    }

    pub fn is_unmarked(&self, addr: Address) -> bool {
        !self.is_marked(addr)
    }

    /// Sets the bit without claiming; only safe while a single thread mutates
    /// this part of the bitmap (root scan at a safepoint, tests).
    pub fn mark(&self, addr: Address) {
        let (index, mask) = self.word_and_mask(addr);
        let word = self.word(index);
        let value = word.load(Ordering::Relaxed);
        word.store(value | mask, Ordering::Relaxed);
    }

    pub fn clear(&self, addr: Address) {
        let (index, mask) = self.word_and_mask(addr);
        let word = self.word(index);
        let value = word.load(Ordering::Relaxed);
        word.store(value & !mask, Ordering::Relaxed);
    }

    /// Atomically claims `addr`. Returns true iff this call set the bit:
    /// under any interleaving exactly one caller observes true per cycle.
    pub fn par_mark(&self, addr: Address) -> bool {
        let (index, mask) = self.word_and_mask(addr);
        let word = self.word(index);

        let mut current = word.load(Ordering::Relaxed);

        loop {
            if (current & mask) != 0 {
                return false;
            }

            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn mark_range(&self, region: Region) {
        let _lock = self.bulk_lock.lock();
        self.for_each_granule(region, |word, mask| {
            let value = word.load(Ordering::Relaxed);
            word.store(value | mask, Ordering::Relaxed);
        });
    }

    pub fn clear_range(&self, region: Region) {
        let _lock = self.bulk_lock.lock();
        self.for_each_granule(region, |word, mask| {
            let value = word.load(Ordering::Relaxed);
            word.store(value & !mask, Ordering::Relaxed);
        });
    }

    /// Parallel-safe variant of `mark_range`: atomic per word, no advisory
    /// lock needed.
    pub fn par_mark_range(&self, region: Region) {
        self.for_each_granule(region, |word, mask| {
            word.fetch_or(mask, Ordering::AcqRel);
        });
    }

    /// Parallel-safe variant of `clear_range`.
    pub fn par_clear_range(&self, region: Region) {
        self.for_each_granule(region, |word, mask| {
            word.fetch_and(!mask, Ordering::AcqRel);
        });
    }

    fn for_each_granule<F>(&self, region: Region, f: F)
    where
        F: Fn(&AtomicUsize, usize),
    {
        debug_assert!(self.covered.valid_top(region.start) && self.covered.valid_top(region.end));

        let mut addr = region.start;

        while addr < region.end {
            let (index, mask) = self.word_and_mask(addr);
            f(self.word(index), mask);
            addr = addr.add_ptr(1);
        }
    }

    pub fn clear_all(&self) {
        let _lock = self.bulk_lock.lock();

        let words = self.bitmap_size / mem::ptr_width_usize();
        for index in 0..words {
            self.word(index).store(0, Ordering::Relaxed);
        }
    }

    /// Address of the next marked granule in `[start, limit)`, scanning
    /// forward word-by-word. Supports linear rescans independent of push/pop
    /// order (remark fallback, verification).
    pub fn next_marked_address(&self, start: Address, limit: Address) -> Option<Address> {
        debug_assert!(self.covered.valid_top(start) && self.covered.valid_top(limit));

        if start >= limit {
            return None;
        }

        let first_granule = start.offset_from(self.covered.start) / mem::ptr_width_usize();
        let end_granule = limit.offset_from(self.covered.start) / mem::ptr_width_usize();

        let mut index = first_granule / BITS_PER_WORD;
        let last_index = (end_granule + BITS_PER_WORD - 1) / BITS_PER_WORD;

        let mut word = self.word(index).load(Ordering::Acquire);
        word &= !((1usize << (first_granule % BITS_PER_WORD)) - 1);

        loop {
            if word != 0 {
                let granule = index * BITS_PER_WORD + word.trailing_zeros() as usize;

                if granule >= end_granule {
                    return None;
                }

                return Some(self.covered.start.add_ptr(granule));
            }

            index += 1;

            if index >= last_index {
                return None;
            }

            word = self.word(index).load(Ordering::Acquire);
        }
    }
}

impl Drop for MarkBitMap {
    fn drop(&mut self) {
        os::free(self.bitmap_start, self.bitmap_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::K;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    fn test_region(size: usize) -> (Address, Region) {
        let start = os::commit(mem::os_page_align_up(size));
        (start, start.region_start(size))
    }

    #[test]
    fn mark_and_clear() {
        let (start, region) = test_region(64 * K);
        let bitmap = MarkBitMap::new(region);

        let addr = start.add_ptr(17);
        assert!(bitmap.is_unmarked(addr));
        bitmap.mark(addr);
        assert!(bitmap.is_marked(addr));
        assert!(bitmap.is_unmarked(start.add_ptr(16)));
        assert!(bitmap.is_unmarked(start.add_ptr(18)));
        bitmap.clear(addr);
        assert!(bitmap.is_unmarked(addr));

        os::free(start, mem::os_page_align_up(64 * K));
    }

    #[test]
    fn par_mark_claims_exactly_once() {
        let (start, region) = test_region(64 * K);
        let bitmap = Arc::new(MarkBitMap::new(region));

        for round in 0..64 {
            let addr = start.add_ptr(round * 3);
            let claims = Arc::new(AtomicUsize::new(0));

            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let bitmap = bitmap.clone();
                    let claims = claims.clone();

                    std::thread::spawn(move || {
                        if bitmap.par_mark(addr) {
                            claims.fetch_add(1, Ordering::SeqCst);
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(claims.load(Ordering::SeqCst), 1);
            assert!(bitmap.is_marked(addr));
        }

        os::free(start, mem::os_page_align_up(64 * K));
    }

    #[test]
    fn range_operations() {
        let (start, region) = test_region(64 * K);
        let bitmap = MarkBitMap::new(region);

        let marked = Region::new(start.add_ptr(10), start.add_ptr(200));
        bitmap.mark_range(marked);

        assert!(bitmap.is_unmarked(start.add_ptr(9)));
        assert!(bitmap.is_marked(start.add_ptr(10)));
        assert!(bitmap.is_marked(start.add_ptr(199)));
        assert!(bitmap.is_unmarked(start.add_ptr(200)));

        bitmap.par_clear_range(Region::new(start.add_ptr(50), start.add_ptr(60)));
        assert!(bitmap.is_marked(start.add_ptr(49)));
        assert!(bitmap.is_unmarked(start.add_ptr(55)));
        assert!(bitmap.is_marked(start.add_ptr(60)));

        bitmap.clear_all();
        assert!(bitmap.is_unmarked(start.add_ptr(10)));

        bitmap.par_mark_range(Region::new(start.add_ptr(5), start.add_ptr(9)));
        assert!(bitmap.is_unmarked(start.add_ptr(4)));
        assert!(bitmap.is_marked(start.add_ptr(5)));
        assert!(bitmap.is_marked(start.add_ptr(8)));
        assert!(bitmap.is_unmarked(start.add_ptr(9)));

        os::free(start, mem::os_page_align_up(64 * K));
    }

    #[test]
    fn forward_scan_finds_marks_in_order() {
        let (start, region) = test_region(64 * K);
        let bitmap = MarkBitMap::new(region);

        for &offset in &[3usize, 64, 65, 1000] {
            bitmap.mark(start.add_ptr(offset));
        }

        let mut found = Vec::new();
        let mut cursor = start;

        while let Some(addr) = bitmap.next_marked_address(cursor, region.end) {
            found.push(addr.offset_from(start) / mem::ptr_width_usize());
            cursor = addr.add_ptr(1);
        }

        assert_eq!(found, vec![3, 64, 65, 1000]);
        assert!(bitmap
            .next_marked_address(start.add_ptr(1001), region.end)
            .is_none());

        os::free(start, mem::os_page_align_up(64 * K));
    }
}
