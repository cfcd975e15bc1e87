//! Page attribution
//!
//! Charges each committed page to exactly one user-visible object. Pages an
//! object committed itself are its own. A page held by a hidden ancestor is
//! charged to one of the leaves that can still read it: the leaf the hidden
//! node is tagged with if it is among them, the leftmost reader otherwise.
//! Slices are windows and are never charged.

use alloc::vec::Vec;

use crate::error::{VmError, VmResult};
use crate::mach_vm::page_list::{PageSlot, Side};
use crate::mach_vm::vm_object::{checked_offset, HierarchyState, NodeId, VmObject};
use crate::mach_vm::vm_page::{round_page, trunc_page, PAGE_SIZE};

impl HierarchyState {
    /// Pages in `[offset, offset + len)` charged to `id`
    pub(crate) fn attributed_pages(&self, id: NodeId, offset: u64, len: u64) -> VmResult<u64> {
        let node = &self.arena[id];
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > node.size {
            return Err(VmError::OutOfRange);
        }
        if node.is_slice() {
            return Ok(0);
        }
        let start = trunc_page(offset);
        let end = round_page(end).ok_or(VmError::OutOfRange)?;

        let mut count = 0;
        for off in (start..end).step_by(PAGE_SIZE as usize) {
            let charged = match node.pages.get(off) {
                PageSlot::Committed(_) => true,
                PageSlot::Marker => false,
                PageSlot::Empty => self.ancestor_page_charged_to(id, off),
            };
            if charged {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Is the page `leaf` reads through its ancestors at `offset` charged
    /// to `leaf`?
    fn ancestor_page_charged_to(&self, leaf: NodeId, offset: u64) -> bool {
        let mut cur = leaf;
        let mut off = offset;
        loop {
            let node = &self.arena[cur];
            let Some(parent) = node.parent else { return false };
            if !node.window_contains(off) {
                return false;
            }
            off = checked_offset(off, node.parent_offset);
            cur = parent;
            let parent_node = &self.arena[cur];
            // Pages of visible ancestors are theirs.
            if !parent_node.is_hidden() {
                return false;
            }
            match parent_node.pages.get(off) {
                PageSlot::Marker => return false,
                PageSlot::Committed(_) => return self.charged_reader(cur, off) == Some(leaf),
                PageSlot::Empty => {}
            }
        }
    }

    /// The one leaf charged for the page hidden node `owner` holds at
    /// `offset`.
    ///
    /// Readers are the leaves below `owner` that still reach the page: the
    /// window covers it, no split bit points their way and nothing on the
    /// path shadows it. The leaf `owner` is tagged with wins when it is a
    /// reader; otherwise the leftmost reader pays.
    fn charged_reader(&self, owner: NodeId, offset: u64) -> Option<NodeId> {
        let hidden = &self.arena[owner];
        let PageSlot::Committed(page) = hidden.pages.get(offset) else {
            return None;
        };
        let tag = hidden.attribution_id;

        let mut work: Vec<(NodeId, u64)> = Vec::new();
        for side in [Side::Right, Side::Left] {
            if let Some(&child) = hidden.children.get(side.index()) {
                if !page.split.is_split(side) && self.child_sees(child, offset) {
                    work.push((child, offset));
                }
            }
        }

        let mut leftmost = None;
        while let Some((id, parent_off)) = work.pop() {
            let node = &self.arena[id];
            let off = parent_off - node.parent_offset;
            if !node.pages.get(off).is_empty() {
                continue;
            }
            if node.is_hidden() {
                for &child in node.children.iter().rev() {
                    if self.child_sees(child, off) {
                        work.push((child, off));
                    }
                }
                continue;
            }
            if node.attribution_id == tag {
                return Some(id);
            }
            leftmost.get_or_insert(id);
        }
        leftmost
    }
}

impl VmObject {
    /// Committed pages charged to this object in range
    pub fn attributed_pages(&self, offset: u64, len: u64) -> VmResult<u64> {
        self.with_state(|state, id, _| state.attributed_pages(id, offset, len))
    }
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use crate::config::VmConfig;
    use crate::kern::timer::ManualClock;
    use crate::mach_vm::vm_object::{CloneMode, VmObject};
    use crate::mach_vm::vm_page::PAGE_SIZE;
    use crate::mach_vm::VmContext;

    const PAGE: u64 = PAGE_SIZE;

    fn context() -> Arc<VmContext> {
        VmContext::with_page_manager(
            VmConfig::new().with_total_pages(16),
            Arc::new(ManualClock::new(0)),
        )
        .0
    }

    #[test]
    fn test_shared_pages_charged_to_original() {
        let ctx = context();
        let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
        obj.write(0, &[1]).unwrap();
        obj.write(PAGE, &[1]).unwrap();
        let clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();

        assert_eq!(obj.attributed_pages(0, 2 * PAGE).unwrap(), 2);
        assert_eq!(clone.attributed_pages(0, 2 * PAGE).unwrap(), 0);

        clone.write(0, &[2]).unwrap();
        assert_eq!(clone.attributed_pages(0, 2 * PAGE).unwrap(), 1);
        assert_eq!(obj.attributed_pages(0, 2 * PAGE).unwrap(), 2);
    }

    #[test]
    fn test_unshared_page_charged_to_reader() {
        let ctx = context();
        let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
        obj.write(PAGE, &[1]).unwrap();
        let clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();
        // The original stops seeing page 1; only the clone can read it.
        obj.resize(PAGE).unwrap();
        assert_eq!(clone.attributed_pages(0, 2 * PAGE).unwrap(), 1);
        assert_eq!(obj.attributed_pages(0, PAGE).unwrap(), 0);
    }

    #[test]
    fn test_shared_page_charged_after_tagged_leaf_loses_view() {
        let (ctx, pm) = VmContext::with_page_manager(
            VmConfig::new().with_total_pages(16),
            Arc::new(ManualClock::new(0)),
        );
        let r = VmObject::create(&ctx, 4 * PAGE).unwrap();
        r.write(3 * PAGE, &[1]).unwrap();
        let c1 = r.create_clone(0, 4 * PAGE, CloneMode::Snapshot).unwrap();
        let c2 = r.create_clone(0, 0, CloneMode::Snapshot).unwrap();
        // The merge hands r's charge to c2, which sees nothing.
        drop(r);
        let c4 = c1.create_clone(3 * PAGE, PAGE, CloneMode::Snapshot).unwrap();

        let total = c1.attributed_pages(0, 4 * PAGE).unwrap()
            + c2.attributed_pages(0, 0).unwrap()
            + c4.attributed_pages(0, PAGE).unwrap();
        assert_eq!(pm.in_use(), 1);
        assert_eq!(total, 1);
        assert_eq!(c1.attributed_pages(0, 4 * PAGE).unwrap(), 1);
        c1.debug_validate().unwrap();
    }

    #[test]
    fn test_slices_are_never_charged() {
        let ctx = context();
        let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
        obj.write(0, &[1]).unwrap();
        let slice = obj.create_child_slice(0, PAGE).unwrap();
        assert_eq!(slice.attributed_pages(0, PAGE).unwrap(), 0);
        assert_eq!(obj.attributed_pages(0, 2 * PAGE).unwrap(), 1);
        assert!(slice.attributed_pages(0, 2 * PAGE).is_err());
    }
}
