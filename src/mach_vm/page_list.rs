//! Sparse page table
//!
//! Every node of a clone tree owns one [`SparsePageTable`]: an ordered map
//! from page-aligned offset to [`PageSlot`]. Absent keys are `Empty`; the
//! table never stores an `Empty` slot.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::ops::ControlFlow;

use crate::mach_vm::vm_page::{is_page_aligned, PageHandle};

/// Which child of a hidden node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Left,
    Right,
}

impl Side {
    pub const fn other(self) -> Self {
        match self {
            Side::Left => Side::Right,
            Side::Right => Side::Left,
        }
    }

    pub(crate) const fn index(self) -> usize {
        match self {
            Side::Left => 0,
            Side::Right => 1,
        }
    }
}

/// Per-direction fork record of a page held by a hidden node.
///
/// A bit is set once that child direction has its own private copy. At most
/// one bit may ever be set: the second fork migrates or frees the page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SplitBits {
    left: bool,
    right: bool,
}

impl SplitBits {
    pub const fn is_split(&self, side: Side) -> bool {
        match side {
            Side::Left => self.left,
            Side::Right => self.right,
        }
    }

    pub const fn any(&self) -> bool {
        self.left || self.right
    }

    pub const fn both(&self) -> bool {
        self.left && self.right
    }

    /// Record that `side` forked away.
    pub fn set(&mut self, side: Side) {
        assert!(
            !self.is_split(side.other()),
            "page already split toward {:?}",
            side.other()
        );
        match side {
            Side::Left => self.left = true,
            Side::Right => self.right = true,
        }
    }

    pub fn clear(&mut self) {
        self.left = false;
        self.right = false;
    }
}

/// A physical page committed at one offset, plus its bookkeeping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedPage {
    pub page: PageHandle,
    pub pin_count: u32,
    pub split: SplitBits,
}

impl CommittedPage {
    pub const fn new(page: PageHandle) -> Self {
        Self {
            page,
            pin_count: 0,
            split: SplitBits {
                left: false,
                right: false,
            },
        }
    }

    pub const fn is_pinned(&self) -> bool {
        self.pin_count > 0
    }
}

/// Contents of one page-aligned offset
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSlot {
    Empty,
    /// Explicit zero with no physical page behind it
    Marker,
    Committed(CommittedPage),
}

impl PageSlot {
    pub const fn is_empty(&self) -> bool {
        matches!(self, PageSlot::Empty)
    }

    pub const fn is_marker(&self) -> bool {
        matches!(self, PageSlot::Marker)
    }

    pub const fn page(&self) -> Option<PageHandle> {
        match self {
            PageSlot::Committed(p) => Some(p.page),
            _ => None,
        }
    }
}

/// Offset-indexed sparse table of [`PageSlot`]s
#[derive(Debug, Default)]
pub struct SparsePageTable {
    slots: BTreeMap<u64, PageSlot>,
}

impl SparsePageTable {
    pub const fn new() -> Self {
        Self {
            slots: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Number of non-empty slots
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Number of committed pages
    pub fn committed_count(&self) -> usize {
        self.slots
            .values()
            .filter(|s| matches!(s, PageSlot::Committed(_)))
            .count()
    }

    pub fn get(&self, offset: u64) -> PageSlot {
        self.slots.get(&offset).copied().unwrap_or(PageSlot::Empty)
    }

    pub fn get_mut(&mut self, offset: u64) -> Option<&mut PageSlot> {
        self.slots.get_mut(&offset)
    }

    /// Committed page at `offset`, if any
    pub fn committed_mut(&mut self, offset: u64) -> Option<&mut CommittedPage> {
        match self.slots.get_mut(&offset) {
            Some(PageSlot::Committed(p)) => Some(p),
            _ => None,
        }
    }

    /// Store `slot` at `offset` and return what was there. Storing `Empty`
    /// removes the entry.
    pub fn insert(&mut self, offset: u64, slot: PageSlot) -> PageSlot {
        assert!(is_page_aligned(offset), "unaligned slot offset {:#x}", offset);
        let previous = match slot {
            PageSlot::Empty => self.slots.remove(&offset),
            _ => self.slots.insert(offset, slot),
        };
        previous.unwrap_or(PageSlot::Empty)
    }

    pub fn remove(&mut self, offset: u64) -> PageSlot {
        self.slots.remove(&offset).unwrap_or(PageSlot::Empty)
    }

    /// Non-empty slots in `[start, end)`, ascending
    pub fn range(&self, start: u64, end: u64) -> impl Iterator<Item = (u64, &PageSlot)> + '_ {
        let upper = if start < end { end } else { start };
        self.slots.range(start..upper).map(|(&off, slot)| (off, slot))
    }

    pub fn range_mut(
        &mut self,
        start: u64,
        end: u64,
    ) -> impl Iterator<Item = (u64, &mut PageSlot)> + '_ {
        let upper = if start < end { end } else { start };
        self.slots.range_mut(start..upper).map(|(&off, slot)| (off, slot))
    }

    /// Any slot (page or marker) in `[start, end)`?
    pub fn any_in_range(&self, start: u64, end: u64) -> bool {
        self.range(start, end).next().is_some()
    }

    /// Remove every slot in `[start, end)` and return them in order
    pub fn remove_range(&mut self, start: u64, end: u64) -> Vec<(u64, PageSlot)> {
        let offsets: Vec<u64> = self.range(start, end).map(|(off, _)| off).collect();
        offsets
            .into_iter()
            .map(|off| (off, self.slots.remove(&off).unwrap_or(PageSlot::Empty)))
            .collect()
    }

    /// Remove every slot and return them in order
    pub fn drain_all(&mut self) -> Vec<(u64, PageSlot)> {
        core::mem::take(&mut self.slots).into_iter().collect()
    }

    /// Walk `[start, end)` page-aligned, visiting slots and the gaps between
    /// them. Gaps are reported as half-open `[gap_start, gap_end)`.
    pub fn for_every_page_and_gap<P, G>(
        &self,
        start: u64,
        end: u64,
        mut page_fn: P,
        mut gap_fn: G,
    ) -> ControlFlow<()>
    where
        P: FnMut(u64, &PageSlot) -> ControlFlow<()>,
        G: FnMut(u64, u64) -> ControlFlow<()>,
    {
        let mut cursor = start;
        for (off, slot) in self.range(start, end) {
            if off > cursor {
                gap_fn(cursor, off)?;
            }
            page_fn(off, slot)?;
            cursor = off + crate::mach_vm::vm_page::PAGE_SIZE;
        }
        if cursor < end {
            gap_fn(cursor, end)?;
        }
        ControlFlow::Continue(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach_vm::vm_page::PAGE_SIZE;

    fn page(n: u32) -> PageSlot {
        PageSlot::Committed(CommittedPage::new(PageHandle::new(n)))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut table = SparsePageTable::new();
        assert!(table.get(0).is_empty());

        assert_eq!(table.insert(0, page(1)), PageSlot::Empty);
        assert_eq!(table.insert(PAGE_SIZE, PageSlot::Marker), PageSlot::Empty);
        assert_eq!(table.get(0).page(), Some(PageHandle::new(1)));
        assert!(table.get(PAGE_SIZE).is_marker());
        assert_eq!(table.committed_count(), 1);

        assert_eq!(table.insert(PAGE_SIZE, PageSlot::Empty), PageSlot::Marker);
        assert_eq!(table.len(), 1);
        assert_eq!(table.remove(0).page(), Some(PageHandle::new(1)));
        assert!(table.is_empty());
    }

    #[test]
    #[should_panic]
    fn test_unaligned_insert_panics() {
        let mut table = SparsePageTable::new();
        table.insert(7, PageSlot::Marker);
    }

    #[test]
    fn test_remove_range() {
        let mut table = SparsePageTable::new();
        for i in 0..5u64 {
            table.insert(i * PAGE_SIZE, page(i as u32 + 1));
        }
        let removed = table.remove_range(PAGE_SIZE, 3 * PAGE_SIZE);
        assert_eq!(removed.len(), 2);
        assert_eq!(removed[0].0, PAGE_SIZE);
        assert_eq!(table.len(), 3);
        assert!(!table.any_in_range(PAGE_SIZE, 3 * PAGE_SIZE));
        assert!(table.any_in_range(0, PAGE_SIZE));
    }

    #[test]
    fn test_pages_and_gaps() {
        let mut table = SparsePageTable::new();
        table.insert(PAGE_SIZE, page(1));
        table.insert(3 * PAGE_SIZE, PageSlot::Marker);

        let mut slots = Vec::new();
        let mut gaps = Vec::new();
        let _ = table.for_every_page_and_gap(
            0,
            5 * PAGE_SIZE,
            |off, _| {
                slots.push(off);
                ControlFlow::Continue(())
            },
            |s, e| {
                gaps.push((s, e));
                ControlFlow::Continue(())
            },
        );
        assert_eq!(slots, [PAGE_SIZE, 3 * PAGE_SIZE]);
        assert_eq!(
            gaps,
            [
                (0, PAGE_SIZE),
                (2 * PAGE_SIZE, 3 * PAGE_SIZE),
                (4 * PAGE_SIZE, 5 * PAGE_SIZE)
            ]
        );
    }

    #[test]
    fn test_split_bits() {
        let mut bits = SplitBits::default();
        assert!(!bits.any());
        bits.set(Side::Left);
        assert!(bits.is_split(Side::Left));
        assert!(!bits.is_split(Side::Right));
        bits.clear();
        bits.set(Side::Right);
        assert!(!bits.both());
    }

    #[test]
    #[should_panic]
    fn test_split_both_directions_panics() {
        let mut bits = SplitBits::default();
        bits.set(Side::Left);
        bits.set(Side::Right);
    }
}
