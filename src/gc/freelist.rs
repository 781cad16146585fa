use crate::gc::Address;
use crate::mem;
use crate::object;

/// Handle to a chunk handed out by the free list. Null when no fit exists.
#[derive(Copy, Clone)]
pub struct FreeSpace(Address);

impl FreeSpace {
    pub fn null() -> FreeSpace {
        FreeSpace(Address::null())
    }

    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    pub fn is_non_null(&self) -> bool {
        self.0.is_non_null()
    }

    pub fn addr(&self) -> Address {
        self.0
    }

    pub fn size(&self) -> usize {
        assert!(self.is_non_null());
        self.0.to_obj().size()
    }
}

// Chunks are binned by size class; the last class collects everything large.
// Class k holds chunks of [2^(k+1), 2^(k+2)) words.
const SIZE_CLASSES: usize = 6;

fn class_for_words(words: usize) -> usize {
    debug_assert!(words >= object::MIN_FREE_WORDS);

    let class = words.ilog2() as usize - 1;
    std::cmp::min(class, SIZE_CLASSES - 1)
}

/// Segregated-fit free list over self-describing free chunks. Not thread
/// safe; callers hold the generation's free-list lock.
pub struct FreeList {
    classes: Vec<Vec<Address>>,
    total: usize,
}

impl FreeList {
    pub fn new() -> FreeList {
        FreeList {
            classes: (0..SIZE_CLASSES).map(|_| Vec::new()).collect(),
            total: 0,
        }
    }

    /// Adds `[start, start+size)` as a free chunk. The chunk is formatted
    /// in place so linear heap walks can skip it.
    pub fn add(&mut self, start: Address, size: usize) {
        debug_assert!(start.is_word_aligned());
        debug_assert!(mem::is_aligned(size, mem::ptr_width_usize()));

        let words = size / mem::ptr_width_usize();
        assert!(words >= object::MIN_FREE_WORDS);

        object::init_free_chunk(start, words);
        self.classes[class_for_words(words)].push(start);
        self.total += size;
    }

    /// First fit of at least `size` bytes, searching the smallest class
    /// that can hold it and up. The chunk is removed from the list; the
    /// caller splits off any remainder and re-adds it.
    pub fn alloc(&mut self, size: usize) -> FreeSpace {
        let words = size / mem::ptr_width_usize();
        let first_class = class_for_words(std::cmp::max(words, object::MIN_FREE_WORDS));

        for class in first_class..SIZE_CLASSES {
            let chunks = &mut self.classes[class];

            if let Some(idx) = chunks.iter().position(|&chunk| chunk.to_obj().size() >= size) {
                let chunk = chunks.swap_remove(idx);
                self.total -= chunk.to_obj().size();
                return FreeSpace(chunk);
            }
        }

        FreeSpace::null()
    }

    /// Removes the chunk starting exactly at `addr`, if it is still listed.
    /// Used by the sweeper to take back a flushed range for coalescing;
    /// fails when the allocator claimed the chunk in the meantime.
    pub fn remove(&mut self, addr: Address) -> bool {
        for chunks in &mut self.classes {
            if let Some(idx) = chunks.iter().position(|&chunk| chunk == addr) {
                chunks.swap_remove(idx);
                self.total -= addr.to_obj().size();
                return true;
            }
        }

        false
    }

    /// Snapshot of (start, size) pairs, sorted by address. Verification and
    /// test support.
    pub fn chunks(&self) -> Vec<(Address, usize)> {
        let mut chunks: Vec<(Address, usize)> = self
            .classes
            .iter()
            .flatten()
            .map(|&chunk| (chunk, chunk.to_obj().size()))
            .collect();
        chunks.sort();
        chunks
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.classes.iter().map(|chunks| chunks.len()).sum()
    }

    pub fn clear(&mut self) {
        for chunks in &mut self.classes {
            chunks.clear();
        }
        self.total = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::os;

    #[test]
    fn alloc_prefers_fitting_chunk() {
        let size = os::page_size();
        let start = os::commit(size);
        let word = mem::ptr_width_usize();

        let mut list = FreeList::new();
        list.add(start, 4 * word);
        list.add(start.add_ptr(4), 64 * word);
        assert_eq!(list.chunk_count(), 2);
        assert_eq!(list.total(), 68 * word);

        let small = list.alloc(3 * word);
        assert!(small.is_non_null());
        assert_eq!(small.addr(), start);
        assert_eq!(small.size(), 4 * word);

        let large = list.alloc(40 * word);
        assert!(large.is_non_null());
        assert_eq!(large.addr(), start.add_ptr(4));

        assert!(list.alloc(word).is_null());
        assert!(list.is_empty());

        os::free(start, size);
    }

    #[test]
    fn alloc_skips_undersized_chunks_in_class() {
        let size = os::page_size();
        let start = os::commit(size);
        let word = mem::ptr_width_usize();

        // Both land in the same size class, only the second fits.
        let mut list = FreeList::new();
        list.add(start, 8 * word);
        list.add(start.add_ptr(8), 14 * word);

        let space = list.alloc(12 * word);
        assert!(space.is_non_null());
        assert_eq!(space.addr(), start.add_ptr(8));

        os::free(start, size);
    }

    #[test]
    fn chunks_are_formatted_for_linear_walks() {
        let size = os::page_size();
        let start = os::commit(size);
        let word = mem::ptr_width_usize();

        let mut list = FreeList::new();
        list.add(start, 16 * word);

        let obj = start.to_obj();
        assert!(obj.is_free());
        assert_eq!(obj.size_words(), 16);

        os::free(start, size);
    }
}
