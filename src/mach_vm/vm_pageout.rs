//! Pageout - Eviction and discardable reclamation
//!
//! Based on Mach4 vm/vm_pageout.h/c
//!
//! Two ways memory leaves an object without its owner asking:
//! - **Eviction**: a clean page of a pager-backed object is dropped; the
//!   pager can supply it again on the next fault.
//! - **Discard**: an unlocked discardable object that has been reclaimable
//!   long enough loses all of its pages at once. The owner learns about it
//!   the next time it locks the object.
//!
//! Discardable objects live on one of two lists of the
//! [`DiscardableRegistry`]: reclaim candidates (unlocked) and everything
//! else. The registry is locked strictly after a hierarchy lock, never
//! before, so [`DiscardableRegistry::reclaim`] snapshots its candidates and
//! drops its own lock before visiting them. Every list update checks, in
//! debug builds, that the object's hierarchy lock is held. spin locks have
//! no owner, so this catches a missing hierarchy lock, not one held by
//! another thread.

use alloc::collections::VecDeque;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info, trace};
use spin::Mutex;

use crate::error::{VmError, VmResult};
use crate::kern::timer::Nanos;
use crate::mach_vm::page_list::PageSlot;
use crate::mach_vm::pmap::RangeChangeOp;
use crate::mach_vm::vm_object::{Hierarchy, HierarchyState, NodeId, VmObject, VmObjectId};
use crate::mach_vm::vm_page::{PageBatch, PageHandle, PAGE_SIZE};

// ============================================================================
// Discardable State
// ============================================================================

/// Reclamation state of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscardableState {
    /// Not a discardable object
    Unset,
    /// Unlocked; may be discarded once the dwell time passed
    Reclaimable,
    /// Locked by its owner
    Unreclaimable,
    /// Pages were dropped; reads fail until the owner locks again
    Discarded,
}

/// Per-object discardable bookkeeping
#[derive(Debug, Clone)]
pub(crate) struct DiscardableTracker {
    state: DiscardableState,
    lock_count: u32,
    last_unlock_ns: Nanos,
}

impl DiscardableTracker {
    /// New discardable objects start locked.
    pub(crate) fn new() -> Self {
        Self {
            state: DiscardableState::Unreclaimable,
            lock_count: 1,
            last_unlock_ns: 0,
        }
    }

    pub(crate) fn state(&self) -> DiscardableState {
        self.state
    }

    pub(crate) fn is_discarded(&self) -> bool {
        self.state == DiscardableState::Discarded
    }
}

// ============================================================================
// Reclaim Statistics
// ============================================================================

/// Reclamation statistics
#[derive(Debug, Default)]
pub struct ReclaimStats {
    /// Pages dropped by eviction
    pub evicted: AtomicU64,
    /// Objects discarded
    pub discarded_objects: AtomicU64,
    /// Pages freed by discarding
    pub discarded_pages: AtomicU64,
    /// Candidates skipped (gone, locked, too young or pinned)
    pub skipped: AtomicU64,
}

impl ReclaimStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ReclaimSnapshot {
        ReclaimSnapshot {
            evicted: self.evicted.load(Ordering::Relaxed),
            discarded_objects: self.discarded_objects.load(Ordering::Relaxed),
            discarded_pages: self.discarded_pages.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of reclamation counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimSnapshot {
    pub evicted: u64,
    pub discarded_objects: u64,
    pub discarded_pages: u64,
    pub skipped: u64,
}

// ============================================================================
// Discardable Registry
// ============================================================================

#[derive(Clone)]
struct DiscardableEntry {
    object_id: VmObjectId,
    hierarchy: Weak<Hierarchy>,
    node: NodeId,
}

impl DiscardableEntry {
    fn debug_assert_hierarchy_locked(&self) {
        if cfg!(debug_assertions) {
            if let Some(hierarchy) = self.hierarchy.upgrade() {
                assert!(
                    hierarchy.is_locked(),
                    "registry updated for {:?} outside its hierarchy lock",
                    self.object_id
                );
            }
        }
    }
}

#[derive(Default)]
struct DiscardableLists {
    reclaim_candidates: VecDeque<DiscardableEntry>,
    non_candidates: Vec<DiscardableEntry>,
}

impl DiscardableLists {
    fn take(&mut self, object_id: VmObjectId) -> Option<DiscardableEntry> {
        if let Some(pos) = self
            .reclaim_candidates
            .iter()
            .position(|e| e.object_id == object_id)
        {
            return self.reclaim_candidates.remove(pos);
        }
        let pos = self
            .non_candidates
            .iter()
            .position(|e| e.object_id == object_id)?;
        Some(self.non_candidates.swap_remove(pos))
    }
}

/// Every live discardable object, split by whether it may be reclaimed
#[derive(Default)]
pub struct DiscardableRegistry {
    lists: Mutex<DiscardableLists>,
    stats: ReclaimStats,
}

impl DiscardableRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, object_id: VmObjectId, hierarchy: Weak<Hierarchy>, node: NodeId) {
        let entry = DiscardableEntry {
            object_id,
            hierarchy,
            node,
        };
        entry.debug_assert_hierarchy_locked();
        self.lists.lock().non_candidates.push(entry);
    }

    pub(crate) fn remove(&self, object_id: VmObjectId) {
        if let Some(entry) = self.lists.lock().take(object_id) {
            entry.debug_assert_hierarchy_locked();
        }
    }

    fn make_candidate(&self, object_id: VmObjectId) {
        let mut lists = self.lists.lock();
        if let Some(entry) = lists.take(object_id) {
            entry.debug_assert_hierarchy_locked();
            lists.reclaim_candidates.push_back(entry);
        }
    }

    fn make_non_candidate(&self, object_id: VmObjectId) {
        let mut lists = self.lists.lock();
        if let Some(entry) = lists.take(object_id) {
            entry.debug_assert_hierarchy_locked();
            lists.non_candidates.push(entry);
        }
    }

    pub fn candidate_count(&self) -> usize {
        self.lists.lock().reclaim_candidates.len()
    }

    pub fn non_candidate_count(&self) -> usize {
        self.lists.lock().non_candidates.len()
    }

    pub fn stats(&self) -> ReclaimSnapshot {
        self.stats.snapshot()
    }

    /// Discard candidates, oldest unlock first, until `target_pages` were
    /// freed or the candidates run out. Returns the pages freed.
    pub fn reclaim(&self, target_pages: u64, min_dwell_ns: Nanos) -> u64 {
        let candidates: Vec<DiscardableEntry> =
            self.lists.lock().reclaim_candidates.iter().cloned().collect();

        let mut reclaimed = 0;
        for entry in candidates {
            if reclaimed >= target_pages {
                break;
            }
            let Some(hierarchy) = entry.hierarchy.upgrade() else {
                self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                continue;
            };
            let mut batch = PageBatch::new();
            let freed = {
                let mut state = hierarchy.lock();
                if state.arena.contains(entry.node) {
                    state.discard(entry.node, min_dwell_ns, &mut batch)
                } else {
                    None
                }
            };
            batch.release(hierarchy.context().allocator().as_ref());
            match freed {
                Some(pages) => reclaimed += pages,
                None => {
                    self.stats.skipped.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        info!(
            "reclaim: freed {} of {} requested pages",
            reclaimed, target_pages
        );
        reclaimed
    }
}

// ============================================================================
// Hierarchy Operations
// ============================================================================

impl HierarchyState {
    /// Drop `page` from a pager-backed object if it is still committed,
    /// unpinned, at `offset`.
    pub(crate) fn evict_page(
        &mut self,
        id: NodeId,
        page: PageHandle,
        offset: u64,
        batch: &mut PageBatch,
    ) -> bool {
        let Ok((id, offset)) = self.resolve_slice(id, offset, 1) else {
            return false;
        };
        let node = &self.arena[id];
        if node.page_source.is_none() {
            return false;
        }
        match node.pages.get(offset) {
            PageSlot::Committed(p) if p.page == page && !p.is_pinned() => {}
            _ => return false,
        }
        self.range_change_update(id, offset, PAGE_SIZE, RangeChangeOp::Unmap);
        let node = &mut self.arena[id];
        node.pages.remove(offset);
        node.eviction_event_count += 1;
        batch.push(page);
        self.ctx.registry().stats.evicted.fetch_add(1, Ordering::Relaxed);
        self.bump_generation();
        trace!("evicted {:?} from {:?}@{:#x}", page, id, offset);
        true
    }

    fn tracker_mut(&mut self, id: NodeId) -> VmResult<&mut DiscardableTracker> {
        self.arena[id]
            .discardable
            .as_mut()
            .ok_or(VmError::BadState("object is not discardable"))
    }

    /// Take a lock on a discardable object. Returns whether its pages were
    /// discarded since the last lock.
    pub(crate) fn discardable_lock(&mut self, id: NodeId, try_lock: bool) -> VmResult<bool> {
        let object_id = self.arena[id].attribution_id;
        let tracker = self.tracker_mut(id)?;
        if try_lock && tracker.state == DiscardableState::Discarded {
            return Err(VmError::Unavailable);
        }
        tracker.lock_count += 1;
        if tracker.lock_count > 1 {
            return Ok(false);
        }
        let was_discarded = tracker.state == DiscardableState::Discarded;
        tracker.state = DiscardableState::Unreclaimable;
        self.ctx.registry().make_non_candidate(object_id);
        Ok(was_discarded)
    }

    pub(crate) fn discardable_unlock(&mut self, id: NodeId) -> VmResult<()> {
        let object_id = self.arena[id].attribution_id;
        let now = self.ctx.clock().now();
        let tracker = self.tracker_mut(id)?;
        if tracker.lock_count == 0 {
            return Err(VmError::BadState("unlock of an unlocked object"));
        }
        tracker.lock_count -= 1;
        if tracker.lock_count == 0 {
            tracker.state = DiscardableState::Reclaimable;
            tracker.last_unlock_ns = now;
            self.ctx.registry().make_candidate(object_id);
        }
        Ok(())
    }

    /// Drop every page of a reclaimable object that has dwelt long enough.
    /// Returns the pages freed, or `None` if the object was not eligible.
    pub(crate) fn discard(
        &mut self,
        id: NodeId,
        min_dwell_ns: Nanos,
        batch: &mut PageBatch,
    ) -> Option<u64> {
        let now = self.ctx.clock().now();
        let node = &self.arena[id];
        let tracker = node.discardable.as_ref()?;
        if tracker.state != DiscardableState::Reclaimable
            || now.saturating_sub(tracker.last_unlock_ns) < min_dwell_ns
            || node.pinned_count > 0
        {
            return None;
        }
        let (size, object_id) = (node.size, node.attribution_id);

        self.range_change_update(id, 0, size, RangeChangeOp::Unmap);
        let node = &mut self.arena[id];
        let mut freed = 0;
        for (_, slot) in node.pages.drain_all() {
            if let PageSlot::Committed(p) = slot {
                batch.push(p.page);
                freed += 1;
            }
        }
        if let Some(tracker) = node.discardable.as_mut() {
            tracker.state = DiscardableState::Discarded;
        }
        let registry = self.ctx.registry();
        registry.make_non_candidate(object_id);
        registry.stats.discarded_objects.fetch_add(1, Ordering::Relaxed);
        registry.stats.discarded_pages.fetch_add(freed, Ordering::Relaxed);
        self.bump_generation();
        debug!("discarded {:?}: {} pages", object_id, freed);
        Some(freed)
    }
}

// ============================================================================
// Object Entry Points
// ============================================================================

impl VmObject {
    /// Evict `page` if it is still what this object holds at `offset`
    pub fn evict_page(&self, page: PageHandle, offset: u64) -> bool {
        self.with_state(|state, id, batch| state.evict_page(id, page, offset, batch))
    }

    pub fn eviction_event_count(&self) -> u64 {
        self.with_state(|state, id, _| state.arena[id].eviction_event_count)
    }

    /// Lock against discard; returns whether the content was discarded
    pub fn lock_discardable(&self) -> VmResult<bool> {
        self.with_state(|state, id, _| state.discardable_lock(id, false))
    }

    /// Lock only if the content is still there
    pub fn try_lock_discardable(&self) -> VmResult<()> {
        self.with_state(|state, id, _| state.discardable_lock(id, true).map(|_| ()))
    }

    pub fn unlock_discardable(&self) -> VmResult<()> {
        self.with_state(|state, id, _| state.discardable_unlock(id))
    }

    pub fn discardable_state(&self) -> DiscardableState {
        self.with_state(|state, id, _| {
            state.arena[id]
                .discardable
                .as_ref()
                .map_or(DiscardableState::Unset, |t| t.state())
        })
    }

    /// Discard now if eligible under `min_dwell_ns`
    pub fn discard(&self, min_dwell_ns: Nanos) -> Option<u64> {
        self.with_state(|state, id, batch| state.discard(id, min_dwell_ns, batch))
    }
}

/// Reclaim up to `target_pages` from the context's discardable objects
/// using the configured dwell time.
pub fn reclaim_discardable(ctx: &Arc<crate::mach_vm::VmContext>, target_pages: u64) -> u64 {
    ctx.registry()
        .reclaim(target_pages, ctx.config().discard_min_dwell_ns)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::{VmConfig, NSEC_PER_SEC};
    use crate::error::ErrorKind;
    use crate::kern::timer::ManualClock;
    use crate::mach_vm::memory_object::{PageProvider, PageSpliceList};
    use crate::mach_vm::vm_object::PageContent;
    use crate::mach_vm::vm_page::{PageManager, PhysicalPageAllocator};
    use crate::mach_vm::VmContext;

    const PAGE: u64 = PAGE_SIZE;

    struct NullProvider;

    impl PageProvider for NullProvider {
        fn data_request(&self, _offset: u64, _len: u64) {}
    }

    fn setup() -> (Arc<VmContext>, Arc<PageManager>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(0));
        let (ctx, pm) =
            VmContext::with_page_manager(VmConfig::new().with_total_pages(16), clock.clone());
        (ctx, pm, clock)
    }

    #[test]
    fn test_evict_pager_page() {
        let (ctx, pm, _) = setup();
        let obj = VmObject::create_external(&ctx, 2 * PAGE, Arc::new(NullProvider)).unwrap();
        let page = pm.alloc_page().unwrap();
        obj.supply_pages(0, PageSpliceList::from_pages(alloc::vec![page]))
            .unwrap();

        assert!(!obj.evict_page(page, PAGE));
        obj.pin_range(0, PAGE).unwrap();
        assert!(!obj.evict_page(page, 0));
        obj.unpin_range(0, PAGE).unwrap();

        assert!(obj.evict_page(page, 0));
        assert_eq!(obj.eviction_event_count(), 1);
        assert_eq!(obj.content_at(0).unwrap(), PageContent::PagerBacked);
        assert_eq!(pm.in_use(), 0);
    }

    #[test]
    fn test_evict_requires_pager() {
        let (ctx, _, _) = setup();
        let obj = VmObject::create(&ctx, PAGE).unwrap();
        let lookup = obj
            .get_page(0, crate::mach_vm::vm_fault::FaultFlags::WRITE)
            .unwrap();
        assert!(!obj.evict_page(lookup.page, 0));
    }

    #[test]
    fn test_discardable_lock_cycle() {
        let (ctx, pm, clock) = setup();
        let obj = VmObject::create_discardable(&ctx, 2 * PAGE).unwrap();
        assert_eq!(obj.discardable_state(), DiscardableState::Unreclaimable);
        obj.write(0, &[1]).unwrap();
        obj.write(PAGE, &[1]).unwrap();

        obj.unlock_discardable().unwrap();
        assert_eq!(obj.discardable_state(), DiscardableState::Reclaimable);
        assert_eq!(ctx.registry().candidate_count(), 1);

        // Too young.
        assert_eq!(obj.discard(NSEC_PER_SEC), None);
        clock.advance(2 * NSEC_PER_SEC);
        assert_eq!(obj.discard(NSEC_PER_SEC), Some(2));
        assert_eq!(pm.in_use(), 0);
        assert_eq!(obj.discardable_state(), DiscardableState::Discarded);
        assert_eq!(ctx.registry().candidate_count(), 0);

        let mut byte = [0u8];
        assert_eq!(obj.read(0, &mut byte).unwrap_err().kind(), ErrorKind::NotFound);
        assert_eq!(
            obj.try_lock_discardable().unwrap_err().kind(),
            ErrorKind::Unavailable
        );
        assert!(obj.lock_discardable().unwrap());
        obj.read(0, &mut byte).unwrap();
        assert_eq!(byte[0], 0);
    }

    #[test]
    fn test_unlock_without_lock() {
        let (ctx, _, _) = setup();
        let obj = VmObject::create_discardable(&ctx, PAGE).unwrap();
        obj.unlock_discardable().unwrap();
        assert_eq!(
            obj.unlock_discardable().unwrap_err().kind(),
            ErrorKind::BadState
        );
        let plain = VmObject::create(&ctx, PAGE).unwrap();
        assert_eq!(plain.discardable_state(), DiscardableState::Unset);
        assert!(plain.lock_discardable().is_err());
    }

    #[test]
    fn test_reclaim_skips_locked_and_pinned() {
        let (ctx, pm, clock) = setup();
        let locked = VmObject::create_discardable(&ctx, PAGE).unwrap();
        locked.write(0, &[1]).unwrap();

        let pinned = VmObject::create_discardable(&ctx, PAGE).unwrap();
        pinned.write(0, &[1]).unwrap();
        pinned.pin_range(0, PAGE).unwrap();
        pinned.unlock_discardable().unwrap();

        let idle = VmObject::create_discardable(&ctx, 2 * PAGE).unwrap();
        idle.commit_range(0, 2 * PAGE).unwrap();
        idle.unlock_discardable().unwrap();

        clock.advance(10 * NSEC_PER_SEC);
        let freed = reclaim_discardable(&ctx, 100);
        assert_eq!(freed, 2);
        assert_eq!(pm.in_use(), 2);
        assert_eq!(idle.discardable_state(), DiscardableState::Discarded);
        assert_eq!(pinned.discardable_state(), DiscardableState::Reclaimable);
        assert_eq!(locked.discardable_state(), DiscardableState::Unreclaimable);
        pinned.unpin_range(0, PAGE).unwrap();
    }

    #[test]
    #[cfg(debug_assertions)]
    #[should_panic(expected = "outside its hierarchy lock")]
    fn test_registry_update_needs_hierarchy_lock() {
        let (ctx, _, _) = setup();
        let obj = VmObject::create_discardable(&ctx, PAGE).unwrap();
        ctx.registry().make_candidate(obj.id());
    }

    #[test]
    fn test_dropped_object_leaves_registry() {
        let (ctx, _, _) = setup();
        let obj = VmObject::create_discardable(&ctx, PAGE).unwrap();
        assert_eq!(ctx.registry().non_candidate_count(), 1);
        drop(obj);
        assert_eq!(ctx.registry().non_candidate_count(), 0);
        assert_eq!(reclaim_discardable(&ctx, 1), 0);
    }
}
