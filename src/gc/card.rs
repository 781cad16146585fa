use std::sync::atomic::{AtomicU8, Ordering};

use crate::gc::{Address, Region};
use crate::mem;
use crate::os;

// Heap is divided into cards of CARD_SIZE bytes. A card entry records
// whether a mutator stored a reference into that part of the heap while
// concurrent marking was running; precleaning drains dirty cards and
// rescans the objects on them.
pub const CARD_SIZE_BITS: usize = 9;
pub const CARD_SIZE: usize = 1 << CARD_SIZE_BITS;

const CLEAN: u8 = 0;
const DIRTY: u8 = 1;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct CardIdx(usize);

impl CardIdx {
    pub fn to_usize(self) -> usize {
        self.0
    }
}

impl From<usize> for CardIdx {
    fn from(val: usize) -> CardIdx {
        CardIdx(val)
    }
}

pub struct CardTable {
    covered: Region,
    table_start: Address,
    table_size: usize,
    cards: usize,
}

impl CardTable {
    pub fn new(covered: Region) -> CardTable {
        assert!(mem::is_aligned(covered.size(), CARD_SIZE));

        let cards = covered.size() >> CARD_SIZE_BITS;
        let table_size = mem::os_page_align_up(cards);
        let table_start = os::commit(table_size);

        CardTable {
            covered,
            table_start,
            table_size,
            cards,
        }
    }

    pub fn card_idx(&self, addr: Address) -> CardIdx {
        debug_assert!(self.covered.contains(addr));
        CardIdx(addr.offset_from(self.covered.start) >> CARD_SIZE_BITS)
    }

    pub fn card_address(&self, card: CardIdx) -> Address {
        self.covered.start.offset(card.to_usize() << CARD_SIZE_BITS)
    }

    pub fn card_region(&self, card: CardIdx) -> Region {
        let start = self.card_address(card);
        start.region_start(CARD_SIZE)
    }

    fn entry(&self, card: CardIdx) -> &AtomicU8 {
        assert!(card.to_usize() < self.cards);
        unsafe {
            &*self
                .table_start
                .offset(card.to_usize())
                .to_ptr::<AtomicU8>()
        }
    }

    /// Write-barrier entry point: records that a reference was stored at
    /// `addr`. Cheap unconditional store, safe from any thread.
    pub fn dirty(&self, addr: Address) {
        self.entry(self.card_idx(addr)).store(DIRTY, Ordering::Release);
    }

    pub fn is_dirty(&self, card: CardIdx) -> bool {
        self.entry(card).load(Ordering::Acquire) == DIRTY
    }

    /// Atomically reads and cleans a card. A mutator dirtying the card
    /// again after the swap is not lost; the card simply shows up dirty in
    /// the next preclean pass or at remark.
    pub fn take_dirty(&self, card: CardIdx) -> bool {
        self.entry(card).swap(CLEAN, Ordering::AcqRel) == DIRTY
    }

    /// Marks every card overlapping `region` dirty. Used for objects
    /// promoted during a cycle: their fields were written without barriers.
    pub fn dirty_range(&self, region: Region) {
        self.visit_cards(region, |table, card| {
            table.entry(card).store(DIRTY, Ordering::Release);
        });
    }

    pub fn clear_all(&self) {
        for idx in 0..self.cards {
            self.entry(CardIdx(idx)).store(CLEAN, Ordering::Relaxed);
        }
    }

    pub fn dirty_card_count(&self, region: Region) -> usize {
        let mut count = 0;
        self.visit_cards(region, |table, card| {
            if table.is_dirty(card) {
                count += 1;
            }
        });
        count
    }

    /// Visits every card overlapping `region`, in address order.
    pub fn visit_cards<F>(&self, region: Region, mut f: F)
    where
        F: FnMut(&CardTable, CardIdx),
    {
        debug_assert!(self.covered.valid_top(region.start) && self.covered.valid_top(region.end));

        if region.empty() {
            return;
        }

        let first = self.card_idx(region.start).to_usize();
        let last = self.card_idx(region.end.sub(1)).to_usize();

        for idx in first..=last {
            f(self, CardIdx(idx));
        }
    }
}

impl Drop for CardTable {
    fn drop(&mut self) {
        os::free(self.table_start, self.table_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gc::K;

    fn fixture() -> (Address, Region, CardTable) {
        let size = mem::os_page_align_up(64 * K);
        let start = os::commit(size);
        let region = start.region_start(64 * K);
        let table = CardTable::new(region);
        (start, region, table)
    }

    #[test]
    fn dirty_and_take() {
        let (start, _region, table) = fixture();

        let addr = start.offset(CARD_SIZE + 40);
        let card = table.card_idx(addr);
        assert_eq!(card.to_usize(), 1);
        assert!(!table.is_dirty(card));

        table.dirty(addr);
        assert!(table.is_dirty(card));
        assert!(!table.is_dirty(CardIdx(0)));

        assert!(table.take_dirty(card));
        assert!(!table.is_dirty(card));
        assert!(!table.take_dirty(card));

        os::free(start, mem::os_page_align_up(64 * K));
    }

    #[test]
    fn visit_covers_partial_cards() {
        let (start, _region, table) = fixture();

        table.dirty(start.offset(10));
        table.dirty(start.offset(3 * CARD_SIZE));

        // Region ends mid-card; the card containing the last byte is still
        // visited.
        let region = Region::new(start, start.offset(3 * CARD_SIZE + 1));
        let mut dirty = Vec::new();

        table.visit_cards(region, |table, card| {
            if table.is_dirty(card) {
                dirty.push(card.to_usize());
            }
        });

        assert_eq!(dirty, vec![0, 3]);
        assert_eq!(table.dirty_card_count(region), 2);

        table.clear_all();
        assert_eq!(table.dirty_card_count(region), 0);

        os::free(start, mem::os_page_align_up(64 * K));
    }
}
