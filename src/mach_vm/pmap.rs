//! Physical Map (pmap) - Mapping invalidation
//!
//! Based on Mach4 vm/pmap.h/c
//!
//! The COW core never touches page tables itself. Whoever maps an object
//! registers a [`RangeChangeListener`] on it; when committed content
//! changes underneath a mapping the core tells the listener to drop the
//! translations (`Unmap`) or downgrade them to read-only (`RemoveWrite`).
//!
//! ## Propagation
//!
//! A change at offset `o` of a node also affects every descendant that
//! reads through it, so notifications walk down the tree, translating the
//! range into each child's offsets and clipping it to the child's window.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use crate::mach_vm::vm_object::{HierarchyState, NodeId, VmObject};

// ============================================================================
// Range Change Interface
// ============================================================================

/// What a mapping must do for the affected range
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeChangeOp {
    /// Remove translations
    Unmap,
    /// Keep translations but make them read-only
    RemoveWrite,
}

/// Mapping callback. Invoked with the hierarchy lock held; must not call
/// back into the object.
pub trait RangeChangeListener: Send + Sync {
    fn range_change(&self, offset: u64, len: u64, op: RangeChangeOp);
}

/// One recorded notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeChange {
    pub offset: u64,
    pub len: u64,
    pub op: RangeChangeOp,
}

impl RangeChange {
    pub fn contains(&self, offset: u64) -> bool {
        self.offset <= offset && offset - self.offset < self.len
    }
}

/// Listener that keeps every notification it receives
#[derive(Debug, Default)]
pub struct RecordingListener {
    changes: Mutex<Vec<RangeChange>>,
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn changes(&self) -> Vec<RangeChange> {
        self.changes.lock().clone()
    }

    pub fn take(&self) -> Vec<RangeChange> {
        core::mem::take(&mut *self.changes.lock())
    }

    pub fn clear(&self) {
        self.changes.lock().clear();
    }

    /// Was `offset` covered by an `op` notification?
    pub fn saw(&self, offset: u64, op: RangeChangeOp) -> bool {
        self.changes
            .lock()
            .iter()
            .any(|c| c.op == op && c.contains(offset))
    }
}

impl RangeChangeListener for RecordingListener {
    fn range_change(&self, offset: u64, len: u64, op: RangeChangeOp) {
        self.changes.lock().push(RangeChange { offset, len, op });
    }
}

/// Intersection of `[a_start, a_end)` and `[b_start, b_end)`
pub fn get_intersect(a_start: u64, a_end: u64, b_start: u64, b_end: u64) -> Option<(u64, u64)> {
    let start = a_start.max(b_start);
    let end = a_end.min(b_end);
    (start < end).then_some((start, end))
}

// ============================================================================
// Propagation
// ============================================================================

impl HierarchyState {
    /// Notify mappings of `id` and of every descendant reading through the
    /// range.
    pub(crate) fn range_change_update(&self, id: NodeId, offset: u64, len: u64, op: RangeChangeOp) {
        if len == 0 {
            return;
        }
        let mut work = vec![(id, offset, offset.saturating_add(len))];
        while let Some((node_id, start, end)) = work.pop() {
            let node = &self.arena[node_id];
            for mapping in &node.mappings {
                mapping.range_change(start, end - start, op);
            }
            for &child in &node.children {
                let c = &self.arena[child];
                let (win_start, win_end) = c.window_in_parent();
                if let Some((s, e)) = get_intersect(start, end, win_start, win_end) {
                    work.push((child, s - c.parent_offset, e - c.parent_offset));
                }
            }
        }
    }
}

impl VmObject {
    /// Register a mapping of this object
    pub fn add_mapping(&self, listener: Arc<dyn RangeChangeListener>) {
        self.with_state(|state, id, _| state.arena[id].mappings.push(listener));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::config::VmConfig;
    use crate::kern::timer::ManualClock;
    use crate::mach_vm::vm_object::CloneMode;
    use crate::mach_vm::vm_page::PAGE_SIZE;
    use crate::mach_vm::VmContext;

    const PAGE: u64 = PAGE_SIZE;

    #[test]
    fn test_get_intersect() {
        assert_eq!(get_intersect(0, 10, 5, 20), Some((5, 10)));
        assert_eq!(get_intersect(0, 5, 5, 20), None);
        assert_eq!(get_intersect(3, 4, 0, 100), Some((3, 4)));
    }

    #[test]
    fn test_snapshot_write_protects_mappings() {
        let (ctx, _) = VmContext::with_page_manager(
            VmConfig::new().with_total_pages(8),
            Arc::new(ManualClock::new(0)),
        );
        let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
        let mapping = Arc::new(RecordingListener::new());
        obj.add_mapping(mapping.clone());
        obj.write(0, &[1]).unwrap();
        mapping.clear();

        let _clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();
        assert_eq!(
            mapping.changes(),
            vec![RangeChange {
                offset: 0,
                len: 2 * PAGE,
                op: RangeChangeOp::RemoveWrite
            }]
        );
    }

    #[test]
    fn test_changes_reach_slices_translated() {
        let (ctx, _) = VmContext::with_page_manager(
            VmConfig::new().with_total_pages(8),
            Arc::new(ManualClock::new(0)),
        );
        let obj = VmObject::create(&ctx, 4 * PAGE).unwrap();
        let slice = obj.create_child_slice(2 * PAGE, 2 * PAGE).unwrap();
        let mapping = Arc::new(RecordingListener::new());
        slice.add_mapping(mapping.clone());

        obj.write(3 * PAGE, &[1]).unwrap();
        assert!(mapping.saw(PAGE, RangeChangeOp::Unmap));
        mapping.clear();

        // Outside the slice's window: no notification.
        obj.write(0, &[1]).unwrap();
        assert!(mapping.take().is_empty());
    }

    #[test]
    fn test_fork_unmaps_writer_only() {
        let (ctx, _) = VmContext::with_page_manager(
            VmConfig::new().with_total_pages(8),
            Arc::new(ManualClock::new(0)),
        );
        let obj = VmObject::create(&ctx, PAGE).unwrap();
        obj.write(0, &[1]).unwrap();
        let clone = obj.create_clone(0, PAGE, CloneMode::Snapshot).unwrap();
        let original_map = Arc::new(RecordingListener::new());
        let clone_map = Arc::new(RecordingListener::new());
        obj.add_mapping(original_map.clone());
        clone.add_mapping(clone_map.clone());

        clone.write(0, &[2]).unwrap();
        assert!(clone_map.saw(0, RangeChangeOp::Unmap));
        assert!(original_map.changes().is_empty());
    }
}
