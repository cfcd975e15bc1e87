//! VM Object - Copy-on-write page collections
//!
//! Based on Mach4 vm/vm_object.h/c, reworked around clone trees instead of
//! shadow chains. Every object created from one root shares a single
//! [`Hierarchy`]: one lock guarding an arena of nodes. A node is either
//! - a leaf (user-visible object),
//! - a hidden interior node, created when a leaf is snapshot-cloned, holding
//!   the pages both children still share,
//! - a slice, a window onto its non-slice parent with no pages of its own.
//!
//! Lookups walk up the parent links through each child's parent window;
//! forks walk back down (see `vm_fault`). When a leaf goes away its hidden
//! parent is merged into the surviving sibling.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::{Index, IndexMut};
use core::sync::atomic::{AtomicU64, Ordering};

use log::{debug, trace, warn};
use spin::{Mutex, MutexGuard};

use crate::error::{ErrorKind, VmError, VmResult};
use crate::mach_vm::memory_object::{PageProvider, PageSource};
use crate::mach_vm::page_list::{PageSlot, Side, SparsePageTable};
use crate::mach_vm::pmap::{RangeChangeListener, RangeChangeOp};
use crate::mach_vm::vm_fault::{ContentSource, FaultFlags};
use crate::mach_vm::vm_page::{is_page_aligned, PageBatch, PageHandle, PAGE_SIZE};
use crate::mach_vm::vm_pageout::DiscardableTracker;
use crate::mach_vm::VmContext;

// ============================================================================
// VM Object Types
// ============================================================================

/// VM Object ID
///
/// Unique across all hierarchies. Doubles as the attribution id of the
/// object's node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VmObjectId(pub u64);

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

impl VmObjectId {
    /// Null object ID
    pub const NULL: Self = Self(0);

    fn allocate() -> Self {
        Self(NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Role of a node in its clone tree
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// User-visible object
    Leaf,
    /// Interior node holding pages shared by exactly two children
    Hidden,
    /// Window onto a non-slice parent
    Slice,
}

/// Clone flavours
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Full copy-on-write snapshot. Not available in pager-backed trees.
    Snapshot,
    /// Copy-on-write view of a pager-backed object, hung off the nearest
    /// ancestor that actually holds pages in range
    PrivatePagerCopy,
}

/// The part of its parent a child may see: child offset `o` maps to parent
/// offset `o + offset` and is visible when `start_limit <= o < limit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParentWindow {
    pub offset: u64,
    pub start_limit: u64,
    pub limit: u64,
}

// ============================================================================
// Node Arena
// ============================================================================

/// Generation-checked index of a node in its hierarchy's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

struct ArenaSlot {
    generation: u32,
    node: Option<Node>,
}

/// Slab of nodes with a free list. Indexing with a stale id panics.
#[derive(Default)]
pub(crate) struct NodeArena {
    slots: Vec<ArenaSlot>,
    free: Vec<u32>,
    live: usize,
}

impl NodeArena {
    pub(crate) fn insert(&mut self, node: Node) -> NodeId {
        self.live += 1;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.node = Some(node);
            return NodeId {
                index,
                generation: slot.generation,
            };
        }
        let index = self.slots.len() as u32;
        self.slots.push(ArenaSlot {
            generation: 0,
            node: Some(node),
        });
        NodeId {
            index,
            generation: 0,
        }
    }

    pub(crate) fn remove(&mut self, id: NodeId) -> Node {
        let slot = &mut self.slots[id.index as usize];
        assert_eq!(slot.generation, id.generation, "stale node id {:?}", id);
        let node = match slot.node.take() {
            Some(node) => node,
            None => panic!("node {:?} already removed", id),
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.live -= 1;
        node
    }

    pub(crate) fn get(&self, id: NodeId) -> Option<&Node> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.live
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.slots.iter().enumerate().filter_map(|(index, slot)| {
            slot.node.as_ref().map(|_| NodeId {
                index: index as u32,
                generation: slot.generation,
            })
        })
    }
}

impl Index<NodeId> for NodeArena {
    type Output = Node;

    fn index(&self, id: NodeId) -> &Node {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale node id {:?}", id),
        }
    }
}

impl IndexMut<NodeId> for NodeArena {
    fn index_mut(&mut self, id: NodeId) -> &mut Node {
        let slot = &mut self.slots[id.index as usize];
        if slot.generation != id.generation {
            panic!("stale node id {:?}", id);
        }
        match slot.node.as_mut() {
            Some(node) => node,
            None => panic!("stale node id {:?}", id),
        }
    }
}

// ============================================================================
// Node
// ============================================================================

/// One page collection in a clone tree
pub(crate) struct Node {
    pub(crate) kind: NodeKind,
    /// Id of the user-visible object this node is (or, for hidden nodes,
    /// the leaf its shared pages are charged to while it can read them)
    pub(crate) attribution_id: VmObjectId,
    pub(crate) size: u64,

    pub(crate) parent: Option<NodeId>,
    pub(crate) parent_offset: u64,
    pub(crate) parent_start_limit: u64,
    pub(crate) parent_limit: u64,
    /// Accumulated offset into the root; only bounds overflow
    pub(crate) root_parent_offset: u64,
    /// `[left, right]` for hidden nodes
    pub(crate) children: Vec<NodeId>,

    pub(crate) pages: SparsePageTable,
    /// Sum of the pin counts of every page in `pages`
    pub(crate) pinned_count: u64,
    pub(crate) eviction_event_count: u64,
    /// Set once a child released part of its view without being able to
    /// narrow its window; split bits then carry meaning beyond windows.
    pub(crate) partial_cow_release: bool,

    pub(crate) page_source: Option<Arc<PageSource>>,
    pub(crate) discardable: Option<DiscardableTracker>,
    /// Live `VmObject` handles
    pub(crate) handles: u32,
    pub(crate) mappings: Vec<Arc<dyn RangeChangeListener>>,
}

impl Node {
    fn new(kind: NodeKind, attribution_id: VmObjectId, size: u64) -> Self {
        Self {
            kind,
            attribution_id,
            size,
            parent: None,
            parent_offset: 0,
            parent_start_limit: 0,
            parent_limit: 0,
            root_parent_offset: 0,
            children: Vec::new(),
            pages: SparsePageTable::new(),
            pinned_count: 0,
            eviction_event_count: 0,
            partial_cow_release: false,
            page_source: None,
            discardable: None,
            handles: 0,
            mappings: Vec::new(),
        }
    }

    pub(crate) fn is_hidden(&self) -> bool {
        self.kind == NodeKind::Hidden
    }

    pub(crate) fn is_slice(&self) -> bool {
        self.kind == NodeKind::Slice
    }

    /// Is `offset` (in this node's space) visible in the parent?
    pub(crate) fn window_contains(&self, offset: u64) -> bool {
        self.parent_start_limit <= offset && offset < self.parent_limit
    }

    /// Visible window expressed in the parent's offsets
    pub(crate) fn window_in_parent(&self) -> (u64, u64) {
        if self.parent_limit <= self.parent_start_limit {
            return (0, 0);
        }
        (
            self.parent_offset + self.parent_start_limit,
            self.parent_offset + self.parent_limit,
        )
    }

    fn collapse_window_if_empty(&mut self) {
        if self.parent_limit <= self.parent_start_limit {
            self.parent_start_limit = 0;
            self.parent_limit = 0;
        }
    }

    pub(crate) fn any_pinned(&self, start: u64, end: u64) -> bool {
        self.pinned_count > 0
            && self.pages.range(start, end).any(|(_, slot)| match slot {
                PageSlot::Committed(p) => p.is_pinned(),
                _ => false,
            })
    }
}

/// How much of a `size`-byte window at `offset` fits in `parent_size`
pub(crate) fn clamped_limit(offset: u64, size: u64, parent_size: u64) -> u64 {
    if offset >= parent_size {
        0
    } else {
        size.min(parent_size - offset)
    }
}

/// Offset composition along a parent chain; overflow is a broken invariant.
pub(crate) fn checked_offset(a: u64, b: u64) -> u64 {
    match a.checked_add(b) {
        Some(sum) => sum,
        None => panic!("offset overflow composing {:#x} + {:#x}", a, b),
    }
}

pub(crate) fn require_aligned(offset: u64, len: u64) -> VmResult<()> {
    if is_page_aligned(offset) && is_page_aligned(len) {
        Ok(())
    } else {
        Err(VmError::InvalidArgs)
    }
}

// ============================================================================
// Hierarchy
// ============================================================================

/// One clone tree: the lock every member node shares
pub struct Hierarchy {
    ctx: Arc<VmContext>,
    state: Mutex<HierarchyState>,
}

impl Hierarchy {
    fn new(ctx: Arc<VmContext>) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HierarchyState {
                arena: NodeArena::default(),
                generation: 1,
                ctx: ctx.clone(),
            }),
            ctx,
        })
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, HierarchyState> {
        self.state.lock()
    }

    pub(crate) fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }
}

/// Everything guarded by the hierarchy lock
pub struct HierarchyState {
    pub(crate) arena: NodeArena,
    /// Bumped when pages are committed or removed anywhere in the tree
    pub(crate) generation: u64,
    pub(crate) ctx: Arc<VmContext>,
}

impl HierarchyState {
    pub(crate) fn bump_generation(&mut self) {
        self.generation += 1;
    }

    pub(crate) fn side_of(&self, parent: NodeId, child: NodeId) -> Side {
        let children = &self.arena[parent].children;
        if children.first() == Some(&child) {
            Side::Left
        } else {
            assert_eq!(children.get(1), Some(&child), "{:?} is not a child", child);
            Side::Right
        }
    }

    /// Can `child` see `parent_offset` of its parent?
    pub(crate) fn child_sees(&self, child: NodeId, parent_offset: u64) -> bool {
        let (start, end) = self.arena[child].window_in_parent();
        start <= parent_offset && parent_offset < end
    }

    pub(crate) fn root_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(parent) = self.arena[cur].parent {
            cur = parent;
        }
        cur
    }

    /// Map a slice onto the node that actually holds its pages
    pub(crate) fn resolve_slice(
        &self,
        id: NodeId,
        offset: u64,
        len: u64,
    ) -> VmResult<(NodeId, u64)> {
        let node = &self.arena[id];
        if !node.is_slice() {
            return Ok((id, offset));
        }
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > node.size {
            return Err(VmError::OutOfRange);
        }
        match node.parent {
            Some(parent) => Ok((parent, checked_offset(offset, node.parent_offset))),
            None => Err(VmError::BadState("detached slice")),
        }
    }

    /// End of `[offset, offset + len)` if it lies within the node
    pub(crate) fn checked_end(&self, id: NodeId, offset: u64, len: u64) -> VmResult<u64> {
        let end = offset.checked_add(len).ok_or(VmError::OutOfRange)?;
        if end > self.arena[id].size {
            return Err(VmError::OutOfRange);
        }
        Ok(end)
    }

    pub(crate) fn check_not_discarded(&self, id: NodeId) -> VmResult<()> {
        match &self.arena[id].discardable {
            Some(tracker) if tracker.is_discarded() => Err(VmError::NotFound),
            _ => Ok(()),
        }
    }

    fn can_decommit(&self, id: NodeId) -> bool {
        let node = &self.arena[id];
        node.parent.is_none() && node.page_source.is_none()
    }

    fn free_slot(slot: PageSlot, batch: &mut PageBatch) {
        if let PageSlot::Committed(p) = slot {
            batch.push(p.page);
        }
    }

    // ------------------------------------------------------------------------
    // Creation and cloning
    // ------------------------------------------------------------------------

    fn create_snapshot(&mut self, id: NodeId, offset: u64, size: u64) -> VmResult<NodeId> {
        let node = &self.arena[id];
        if node.is_slice() {
            return Err(VmError::BadState("slices cannot be snapshot-cloned"));
        }
        if node.discardable.is_some() {
            return Err(VmError::BadState("discardable objects cannot be cloned"));
        }
        if node.pinned_count > 0 {
            return Err(VmError::BadState("object has pinned pages"));
        }
        let root = self.root_of(id);
        if self.arena[root].page_source.is_some() {
            return Err(VmError::BadState("pager-backed trees cannot be snapshot-cloned"));
        }
        let node = &self.arena[id];
        let root_offset = node
            .root_parent_offset
            .checked_add(offset)
            .ok_or(VmError::InvalidArgs)?;
        root_offset.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let original_size = node.size;

        // Existing writable mappings must fault before they can diverge.
        self.range_change_update(id, 0, original_size, RangeChangeOp::RemoveWrite);

        let original = &mut self.arena[id];
        let mut hidden = Node::new(NodeKind::Hidden, original.attribution_id, original.size);
        hidden.parent = original.parent;
        hidden.parent_offset = original.parent_offset;
        hidden.parent_start_limit = original.parent_start_limit;
        hidden.parent_limit = original.parent_limit;
        hidden.root_parent_offset = original.root_parent_offset;
        hidden.pages = core::mem::take(&mut original.pages);
        hidden.partial_cow_release = core::mem::replace(&mut original.partial_cow_release, false);
        let grandparent = original.parent;
        let hidden_size = hidden.size;
        let hidden_root_offset = hidden.root_parent_offset;
        let h = self.arena.insert(hidden);

        if let Some(gp) = grandparent {
            for child in self.arena[gp].children.iter_mut() {
                if *child == id {
                    *child = h;
                }
            }
        }

        let original = &mut self.arena[id];
        original.parent = Some(h);
        original.parent_offset = 0;
        original.parent_start_limit = 0;
        original.parent_limit = original.size;

        let mut clone = Node::new(NodeKind::Leaf, VmObjectId::allocate(), size);
        clone.parent = Some(h);
        clone.parent_offset = offset;
        clone.parent_limit = clamped_limit(offset, size, hidden_size);
        clone.root_parent_offset = checked_offset(hidden_root_offset, offset);
        clone.handles = 1;
        let c = self.arena.insert(clone);
        self.arena[h].children = vec![id, c];

        debug!(
            "snapshot: {:?} split under hidden {:?}, clone {:?} at {:#x}+{:#x}",
            id, h, c, offset, size
        );
        Ok(c)
    }

    fn create_private_pager_copy(&mut self, id: NodeId, offset: u64, size: u64) -> VmResult<NodeId> {
        let (id, offset) = self.resolve_slice(id, offset, 0)?;
        let root = self.root_of(id);
        if self.arena[root].page_source.is_none() {
            return Err(VmError::BadState("private pager copies need a pager-backed tree"));
        }
        let mut cur = id;
        let mut cur_offset = offset;
        let mut limit = clamped_limit(offset, size, self.arena[id].size);

        // Skip ancestors that have nothing of their own in range.
        loop {
            let node = &self.arena[cur];
            let Some(parent) = node.parent else { break };
            let end = cur_offset.saturating_add(limit);
            if node.pages.any_in_range(cur_offset, end) || node.parent_start_limit > cur_offset {
                break;
            }
            limit = if cur_offset >= node.parent_limit {
                0
            } else {
                limit.min(node.parent_limit - cur_offset)
            };
            cur_offset = checked_offset(cur_offset, node.parent_offset);
            cur = parent;
        }

        let root_offset = self.arena[cur]
            .root_parent_offset
            .checked_add(cur_offset)
            .ok_or(VmError::InvalidArgs)?;
        root_offset.checked_add(size).ok_or(VmError::InvalidArgs)?;

        let mut clone = Node::new(NodeKind::Leaf, VmObjectId::allocate(), size);
        clone.parent = Some(cur);
        clone.parent_offset = cur_offset;
        clone.parent_limit = limit;
        clone.root_parent_offset = root_offset;
        clone.handles = 1;
        let c = self.arena.insert(clone);
        self.arena[cur].children.push(c);
        debug!("private pager copy {:?} attached to {:?} at {:#x}", c, cur, cur_offset);
        Ok(c)
    }

    fn create_child_slice(&mut self, id: NodeId, offset: u64, size: u64) -> VmResult<NodeId> {
        require_aligned(offset, size)?;
        self.checked_end(id, offset, size)?;
        let node = &self.arena[id];
        if node.discardable.is_some() {
            return Err(VmError::BadState("discardable objects cannot be sliced"));
        }
        // Slices never nest: hang this one off the slice's own parent.
        let (target, base) = match (node.kind, node.parent) {
            (NodeKind::Slice, Some(parent)) => (parent, node.parent_offset),
            (NodeKind::Slice, None) => return Err(VmError::BadState("detached slice")),
            _ => (id, 0),
        };
        let absolute = checked_offset(base, offset);
        let root_offset = self.arena[target]
            .root_parent_offset
            .checked_add(absolute)
            .ok_or(VmError::InvalidArgs)?;

        let mut slice = Node::new(NodeKind::Slice, VmObjectId::allocate(), size);
        slice.parent = Some(target);
        slice.parent_offset = absolute;
        slice.parent_limit = size;
        slice.root_parent_offset = root_offset;
        slice.handles = 1;
        let s = self.arena.insert(slice);
        self.arena[target].children.push(s);
        trace!("slice {:?} of {:?} at {:#x}+{:#x}", s, target, absolute, size);
        Ok(s)
    }

    // ------------------------------------------------------------------------
    // Destruction and merge
    // ------------------------------------------------------------------------

    pub(crate) fn release_handle(&mut self, id: NodeId, batch: &mut PageBatch) {
        let node = &mut self.arena[id];
        node.handles -= 1;
        if node.handles > 0 {
            return;
        }
        node.mappings.clear();
        if node.discardable.is_some() {
            let object_id = node.attribution_id;
            self.ctx.registry().remove(object_id);
        }
        self.destroy_if_unreferenced(id, batch);
    }

    /// Remove dead nodes starting at `id`, walking up through plain parents.
    /// A hidden parent losing a child is merged into the other one.
    fn destroy_if_unreferenced(&mut self, id: NodeId, batch: &mut PageBatch) {
        let mut cur = id;
        loop {
            let node = &self.arena[cur];
            if node.handles > 0 || !node.children.is_empty() || node.is_hidden() {
                return;
            }
            let parent = node.parent;
            let removed = self.arena.remove(cur);
            let departing = removed.attribution_id;
            self.free_node(removed, batch);
            trace!("destroyed node {:?}", cur);

            match parent {
                None => return,
                Some(p) if self.arena[p].is_hidden() => {
                    self.remove_child_of_hidden(p, cur, departing, batch);
                    return;
                }
                Some(p) => {
                    self.arena[p].children.retain(|&c| c != cur);
                    cur = p;
                }
            }
        }
    }

    fn free_node(&mut self, node: Node, batch: &mut PageBatch) {
        if node.pinned_count > 0 {
            warn!("destroying object with {} pins outstanding", node.pinned_count);
        }
        let mut pages = node.pages;
        for (_, slot) in pages.drain_all() {
            if let PageSlot::Committed(p) = slot {
                if p.is_pinned() {
                    self.ctx.queues().set_unwired(p.page);
                }
                batch.push(p.page);
            }
        }
        if let Some(source) = node.page_source {
            source.close();
        }
    }

    fn remove_child_of_hidden(
        &mut self,
        h: NodeId,
        removed: NodeId,
        departing: VmObjectId,
        batch: &mut PageBatch,
    ) {
        let side = self.side_of(h, removed);
        let child = self.arena[h].children[side.other().index()];

        // Ancestors still charging shared pages to the departing leaf are
        // retagged with a descendant that is still around.
        let survivor_id = self.arena[child].attribution_id;
        let mut cur = self.arena[h].parent;
        while let Some(ancestor) = cur {
            let node = &mut self.arena[ancestor];
            if !node.is_hidden() || node.attribution_id != departing {
                break;
            }
            node.attribution_id = survivor_id;
            cur = node.parent;
        }

        self.merge_content_with_child(h, child, batch);
    }

    /// Fold hidden node `h` into its only remaining child and splice it out.
    fn merge_content_with_child(&mut self, h: NodeId, child: NodeId, batch: &mut PageBatch) {
        let child_side = self.side_of(h, child);
        let c = &self.arena[child];
        let (c_off, c_start, c_limit) = (c.parent_offset, c.parent_start_limit, c.parent_limit);
        let child_hidden = c.is_hidden();

        // The survivor's view of `h`, in `h`'s offsets
        let (visible_start, visible_end) = if c_limit > c_start {
            (c_off + c_start, c_off + c_limit)
        } else {
            (c_off, c_off)
        };

        let h_parent = self.arena[h].parent;
        if let Some(p) = h_parent {
            if self.arena[p].is_hidden() {
                let (h_start, h_limit) = {
                    let hn = &self.arena[h];
                    (hn.parent_start_limit, hn.parent_limit)
                };
                if visible_end.max(h_start) < h_limit {
                    self.release_cow_parent_pages(h, visible_end.max(h_start), h_limit, batch);
                }
                let (h_start, h_limit) = {
                    let hn = &self.arena[h];
                    (hn.parent_start_limit, hn.parent_limit)
                };
                if h_start < visible_start.min(h_limit) {
                    self.release_cow_parent_pages(h, h_start, visible_start.min(h_limit), batch);
                }
            }
        }

        let mut pages = core::mem::take(&mut self.arena[h].pages);
        let fast = c_off == 0 && !self.arena[h].partial_cow_release && !child_hidden;
        if fast {
            for (_, slot) in pages.remove_range(0, visible_start) {
                Self::free_slot(slot, batch);
            }
            for (_, slot) in pages.remove_range(visible_end, u64::MAX) {
                Self::free_slot(slot, batch);
            }
            for (_, slot) in pages.range_mut(visible_start, visible_end) {
                if let PageSlot::Committed(p) = slot {
                    p.split.clear();
                }
            }
            // The child's own content shadows whatever it covers.
            let child_node = &mut self.arena[child];
            for (off, slot) in child_node.pages.drain_all() {
                Self::free_slot(pages.insert(off, slot), batch);
            }
            child_node.pages = pages;
        } else {
            for (off, slot) in pages.drain_all() {
                if off < visible_start || off >= visible_end {
                    Self::free_slot(slot, batch);
                    continue;
                }
                let coff = off - c_off;
                let child_node = &mut self.arena[child];
                let occupied = !child_node.pages.get(coff).is_empty();
                match slot {
                    PageSlot::Committed(mut p) => {
                        if occupied || p.split.is_split(child_side) {
                            batch.push(p.page);
                        } else {
                            p.split.clear();
                            child_node.pages.insert(coff, PageSlot::Committed(p));
                        }
                    }
                    PageSlot::Marker => {
                        if !occupied {
                            child_node.pages.insert(coff, PageSlot::Marker);
                        }
                    }
                    PageSlot::Empty => {}
                }
            }
        }

        let hidden = self.arena.remove(h);
        let child_node = &mut self.arena[child];
        child_node.parent = hidden.parent;
        if hidden.parent.is_some() {
            child_node.parent_offset = checked_offset(hidden.parent_offset, c_off);
            child_node.parent_start_limit =
                c_start.max(hidden.parent_start_limit.saturating_sub(c_off));
            child_node.parent_limit = c_limit.min(hidden.parent_limit.saturating_sub(c_off));
            child_node.collapse_window_if_empty();
        } else {
            child_node.parent_offset = 0;
            child_node.parent_start_limit = 0;
            child_node.parent_limit = 0;
        }
        if let Some(p) = hidden.parent {
            for slot in self.arena[p].children.iter_mut() {
                if *slot == h {
                    *slot = child;
                }
            }
        }
        debug!(
            "merged hidden {:?} into {:?} ({})",
            h,
            child,
            if fast { "fast" } else { "slow" }
        );
    }

    /// `id` no longer needs `[start, end)` (its own offsets) of its parent.
    ///
    /// Pages nobody else can see are freed; the rest are marked so that the
    /// sibling may later take them without copying. Parts the sibling cannot
    /// see are released from the grandparent in turn.
    pub(crate) fn release_cow_parent_pages(
        &mut self,
        id: NodeId,
        start: u64,
        end: u64,
        batch: &mut PageBatch,
    ) {
        let mut work = vec![(id, start, end)];
        while let Some((node_id, start, end)) = work.pop() {
            let node = &self.arena[node_id];
            let Some(parent) = node.parent else { continue };
            if !self.arena[parent].is_hidden() {
                continue;
            }
            let start = start.max(node.parent_start_limit);
            let end = end.min(node.parent_limit);
            if start >= end {
                continue;
            }
            let off = node.parent_offset;
            let side = self.side_of(parent, node_id);
            let sibling = self.arena[parent].children[side.other().index()];
            let (vis_start, vis_end) = self.arena[sibling].window_in_parent();

            let node = &mut self.arena[node_id];
            let tightened = if node.parent_limit <= end {
                node.parent_limit = node.parent_limit.min(start);
                true
            } else if start <= node.parent_start_limit {
                node.parent_start_limit = node.parent_start_limit.max(end);
                true
            } else {
                false
            };
            if tightened {
                node.collapse_window_if_empty();
            }

            let (ps, pe) = (start + off, end + off);
            let parent_node = &mut self.arena[parent];
            if !tightened {
                parent_node.partial_cow_release = true;
            }
            let offsets: Vec<u64> = parent_node.pages.range(ps, pe).map(|(o, _)| o).collect();
            for poff in offsets {
                let sibling_sees = vis_start <= poff && poff < vis_end;
                match parent_node.pages.get(poff) {
                    PageSlot::Marker if !sibling_sees => {
                        parent_node.pages.remove(poff);
                    }
                    PageSlot::Committed(p) if !sibling_sees || p.split.is_split(side.other()) => {
                        parent_node.pages.remove(poff);
                        batch.push(p.page);
                    }
                    PageSlot::Committed(_) => {
                        if let Some(p) = parent_node.pages.committed_mut(poff) {
                            if tightened {
                                p.split.clear();
                            } else {
                                p.split.set(side);
                            }
                        }
                    }
                    _ => {}
                }
            }

            let head_end = pe.min(vis_start);
            if ps < head_end {
                work.push((parent, ps, head_end));
            }
            let tail_start = ps.max(vis_end);
            if tail_start < pe {
                work.push((parent, tail_start, pe));
            }
        }
    }

    // ------------------------------------------------------------------------
    // Range operations
    // ------------------------------------------------------------------------

    fn resize(&mut self, id: NodeId, new_size: u64, batch: &mut PageBatch) -> VmResult<()> {
        if !is_page_aligned(new_size) {
            return Err(VmError::InvalidArgs);
        }
        let node = &self.arena[id];
        if node.is_slice() {
            return Err(VmError::BadState("slices cannot be resized"));
        }
        if node.children.iter().any(|&c| self.arena[c].is_slice()) {
            return Err(VmError::BadState("object has slice children"));
        }
        let old_size = node.size;
        if new_size == old_size {
            return Ok(());
        }
        node.root_parent_offset
            .checked_add(new_size)
            .ok_or(VmError::InvalidArgs)?;

        if new_size > old_size {
            self.arena[id].size = new_size;
            self.range_change_update(id, old_size, new_size - old_size, RangeChangeOp::Unmap);
            return Ok(());
        }

        if self.arena[id].any_pinned(new_size, old_size) {
            return Err(VmError::BadState("pinned pages in truncated range"));
        }
        self.range_change_update(id, new_size, old_size - new_size, RangeChangeOp::Unmap);

        if let Some(parent) = self.arena[id].parent {
            if self.arena[parent].is_hidden() {
                self.release_cow_parent_pages(id, new_size, old_size, batch);
            }
            let node = &mut self.arena[id];
            node.parent_limit = node.parent_limit.min(new_size);
            node.collapse_window_if_empty();
        }

        let children = self.arena[id].children.clone();
        for child in children {
            let c = &mut self.arena[child];
            c.parent_limit = c.parent_limit.min(new_size.saturating_sub(c.parent_offset));
            c.collapse_window_if_empty();
        }

        let node = &mut self.arena[id];
        for (_, slot) in node.pages.remove_range(new_size, old_size) {
            Self::free_slot(slot, batch);
        }
        node.size = new_size;
        if let Some(source) = node.page_source.clone() {
            source.fail_range(new_size, old_size - new_size, ErrorKind::OutOfRange);
        }
        self.bump_generation();
        debug!("resized {:?} {:#x} -> {:#x}", id, old_size, new_size);
        Ok(())
    }

    fn decommit_range(
        &mut self,
        id: NodeId,
        offset: u64,
        len: u64,
        batch: &mut PageBatch,
    ) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        if !self.can_decommit(id) {
            return Err(VmError::BadState("decommit needs a root without a page source"));
        }
        if self.arena[id].any_pinned(offset, end) {
            return Err(VmError::BadState("pinned pages in range"));
        }
        if len == 0 {
            return Ok(());
        }
        self.range_change_update(id, offset, len, RangeChangeOp::Unmap);
        for (_, slot) in self.arena[id].pages.remove_range(offset, end) {
            Self::free_slot(slot, batch);
        }
        self.bump_generation();
        Ok(())
    }

    fn zero_range(&mut self, id: NodeId, offset: u64, len: u64, batch: &mut PageBatch) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.check_not_discarded(id)?;
        if self.can_decommit(id) && !self.arena[id].any_pinned(offset, end) {
            return self.decommit_range(id, offset, len, batch);
        }

        self.range_change_update(id, offset, len, RangeChangeOp::Unmap);
        let mut changed = false;
        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            match self.arena[id].pages.get(off) {
                PageSlot::Committed(p) if p.is_pinned() => {
                    self.ctx.allocator().zero_page(p.page);
                }
                PageSlot::Committed(p) => {
                    self.arena[id].pages.remove(off);
                    batch.push(p.page);
                    if matches!(
                        self.find_initial_content(id, off),
                        ContentSource::Page { .. } | ContentSource::Pager { .. }
                    ) {
                        self.arena[id].pages.insert(off, PageSlot::Marker);
                    }
                    changed = true;
                }
                PageSlot::Marker => {}
                PageSlot::Empty => match self.find_initial_content(id, off) {
                    ContentSource::Page {
                        owner,
                        owner_offset,
                        ..
                    } if self.arena[owner].is_hidden() => {
                        // Fork first so the split bits record that this side
                        // is done with the shared page.
                        let page = match self.fork_page(id, off, owner, owner_offset) {
                            Ok(page) => page,
                            Err(err) => {
                                if changed {
                                    self.bump_generation();
                                }
                                return Err(err);
                            }
                        };
                        self.arena[id].pages.insert(off, PageSlot::Marker);
                        batch.push(page);
                        changed = true;
                    }
                    ContentSource::Page { .. } | ContentSource::Pager { .. } => {
                        self.arena[id].pages.insert(off, PageSlot::Marker);
                        changed = true;
                    }
                    ContentSource::Marker { .. } | ContentSource::Zero => {}
                },
            }
        }
        if changed {
            self.bump_generation();
        }
        Ok(())
    }

    fn pin_range(&mut self, id: NodeId, offset: u64, len: u64) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        let max_pins = self.ctx.config().max_pin_count;
        let queues = self.ctx.queues();
        let node = &mut self.arena[id];

        let mut pinned = 0usize;
        let mut failure = None;
        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            match node.pages.committed_mut(off) {
                Some(p) if p.pin_count < max_pins => {
                    p.pin_count += 1;
                    if p.pin_count == 1 {
                        queues.set_wired(p.page);
                    }
                    pinned += 1;
                }
                Some(_) => {
                    failure = Some(VmError::Unavailable);
                    break;
                }
                None => {
                    failure = Some(VmError::BadState("page not committed"));
                    break;
                }
            }
        }

        if let Some(err) = failure {
            for off in (offset..).step_by(PAGE_SIZE as usize).take(pinned) {
                if let Some(p) = node.pages.committed_mut(off) {
                    p.pin_count -= 1;
                    if p.pin_count == 0 {
                        queues.set_unwired(p.page);
                    }
                }
            }
            warn!("pin {:#x}+{:#x} failed: {}", offset, len, err);
            return Err(err);
        }
        node.pinned_count += pinned as u64;
        Ok(())
    }

    fn unpin_range(&mut self, id: NodeId, offset: u64, len: u64) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        let queues = self.ctx.queues();
        let node = &mut self.arena[id];

        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            match node.pages.get(off) {
                PageSlot::Committed(p) if p.is_pinned() => {}
                _ => return Err(VmError::BadState("unpin of a page that is not pinned")),
            }
        }
        let mut unpinned = 0u64;
        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            if let Some(p) = node.pages.committed_mut(off) {
                p.pin_count -= 1;
                if p.pin_count == 0 {
                    queues.set_unwired(p.page);
                }
                unpinned += 1;
            }
        }
        node.pinned_count -= unpinned;
        Ok(())
    }

    fn content_at(&self, id: NodeId, offset: u64) -> VmResult<PageContent> {
        let (id, offset) = self.resolve_slice(id, offset, 1)?;
        if offset >= self.arena[id].size {
            return Err(VmError::OutOfRange);
        }
        let offset = offset & !(PAGE_SIZE - 1);
        Ok(match self.find_initial_content(id, offset) {
            ContentSource::Page { owner, page, .. } if owner == id => PageContent::Local(page),
            ContentSource::Page { page, .. } => PageContent::Ancestor(page),
            ContentSource::Marker { .. } => PageContent::Marker,
            ContentSource::Zero => PageContent::Zero,
            ContentSource::Pager { .. } => PageContent::PagerBacked,
        })
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Check the structural invariants of every node in the tree
    pub(crate) fn validate(&self) -> VmResult<()> {
        for id in self.arena.ids() {
            let node = &self.arena[id];
            let mut pin_sum = 0u64;
            for (_, slot) in node.pages.range(0, u64::MAX) {
                if let PageSlot::Committed(p) = slot {
                    if p.split.both() {
                        return Err(VmError::BadState("page split in both directions"));
                    }
                    if p.split.any() && !node.is_hidden() {
                        return Err(VmError::BadState("split bits on a non-hidden node"));
                    }
                    pin_sum += p.pin_count as u64;
                }
            }
            if pin_sum != node.pinned_count {
                return Err(VmError::BadState("pinned_count out of sync"));
            }
            for &child in &node.children {
                if self.arena.get(child).and_then(|c| c.parent) != Some(id) {
                    return Err(VmError::BadState("child does not point back at parent"));
                }
            }
            match node.kind {
                NodeKind::Hidden => {
                    if node.children.len() != 2 || node.handles != 0 || node.pinned_count != 0 {
                        return Err(VmError::BadState("malformed hidden node"));
                    }
                }
                NodeKind::Leaf => {
                    if node.parent_start_limit != 0 {
                        return Err(VmError::BadState("leaf with a non-zero start limit"));
                    }
                }
                NodeKind::Slice => {
                    if !node.pages.is_empty() || node.parent_limit != node.size {
                        return Err(VmError::BadState("malformed slice"));
                    }
                }
            }
            let Some(parent) = node.parent else { continue };
            let Some(parent_node) = self.arena.get(parent) else {
                return Err(VmError::BadState("dangling parent link"));
            };
            if !parent_node.children.contains(&id) {
                return Err(VmError::BadState("parent does not list child"));
            }
            if parent_node.is_slice() || (node.is_slice() && parent_node.is_hidden()) {
                return Err(VmError::BadState("slice attached to the wrong kind of node"));
            }
            if node.parent_start_limit > node.parent_limit {
                return Err(VmError::BadState("parent window start beyond its limit"));
            }
            if node.parent_limit > 0 {
                let end = node
                    .parent_offset
                    .checked_add(node.parent_limit)
                    .ok_or(VmError::BadState("parent window overflows"))?;
                if end > parent_node.size {
                    return Err(VmError::BadState("parent window beyond parent size"));
                }
            }
        }
        Ok(())
    }
}

/// What a read at one offset would observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageContent {
    /// Committed in the object itself
    Local(PageHandle),
    /// Explicit zero
    Marker,
    /// Shared with an ancestor
    Ancestor(PageHandle),
    /// Nothing anywhere: implicit zero
    Zero,
    /// Must be fetched from the pager
    PagerBacked,
}

// ============================================================================
// VM Object Handle
// ============================================================================

/// A user-visible memory object: one handle on a node of a clone tree.
///
/// Cloning the handle adds a reference to the same object; dropping the
/// last one destroys it.
pub struct VmObject {
    hierarchy: Arc<Hierarchy>,
    node: NodeId,
    id: VmObjectId,
}

impl VmObject {
    /// Create an anonymous object of `size` bytes
    pub fn create(ctx: &Arc<VmContext>, size: u64) -> VmResult<Self> {
        Self::create_root(ctx, size, None, false)
    }

    /// Create an object whose initial content comes from `provider`
    pub fn create_external(
        ctx: &Arc<VmContext>,
        size: u64,
        provider: Arc<dyn PageProvider>,
    ) -> VmResult<Self> {
        Self::create_root(ctx, size, Some(Arc::new(PageSource::new(provider))), false)
    }

    /// Create an object whose pages may be reclaimed while it is unlocked
    pub fn create_discardable(ctx: &Arc<VmContext>, size: u64) -> VmResult<Self> {
        Self::create_root(ctx, size, None, true)
    }

    fn create_root(
        ctx: &Arc<VmContext>,
        size: u64,
        page_source: Option<Arc<PageSource>>,
        discardable: bool,
    ) -> VmResult<Self> {
        if !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        let hierarchy = Hierarchy::new(ctx.clone());
        let id = VmObjectId::allocate();
        let node = {
            let mut state = hierarchy.lock();
            let mut node = Node::new(NodeKind::Leaf, id, size);
            node.page_source = page_source;
            node.handles = 1;
            if discardable {
                node.discardable = Some(DiscardableTracker::new());
            }
            let node = state.arena.insert(node);
            if discardable {
                ctx.registry().add(id, Arc::downgrade(&hierarchy), node);
            }
            node
        };
        debug!("created object {:?} ({:#x} bytes)", id, size);
        Ok(Self {
            hierarchy,
            node,
            id,
        })
    }

    /// Run `f` under the hierarchy lock; pages it frees are returned to the
    /// allocator after the lock is dropped.
    pub(crate) fn with_state<R>(
        &self,
        f: impl FnOnce(&mut HierarchyState, NodeId, &mut PageBatch) -> R,
    ) -> R {
        let mut batch = PageBatch::new();
        let result = {
            let mut state = self.hierarchy.lock();
            f(&mut state, self.node, &mut batch)
        };
        batch.release(self.hierarchy.ctx.allocator().as_ref());
        result
    }

    fn adopt(&self, node: NodeId) -> Self {
        let id = self.hierarchy.lock().arena[node].attribution_id;
        Self {
            hierarchy: self.hierarchy.clone(),
            node,
            id,
        }
    }

    /// Copy-on-write clone of `[offset, offset + size)`
    pub fn create_clone(&self, offset: u64, size: u64, mode: CloneMode) -> VmResult<Self> {
        require_aligned(offset, size)?;
        offset.checked_add(size).ok_or(VmError::InvalidArgs)?;
        let node = self.with_state(|state, id, _| match mode {
            CloneMode::Snapshot => state.create_snapshot(id, offset, size),
            CloneMode::PrivatePagerCopy => state.create_private_pager_copy(id, offset, size),
        })?;
        Ok(self.adopt(node))
    }

    /// Window onto `[offset, offset + size)` sharing this object's pages
    pub fn create_child_slice(&self, offset: u64, size: u64) -> VmResult<Self> {
        let node = self.with_state(|state, id, _| state.create_child_slice(id, offset, size))?;
        Ok(self.adopt(node))
    }

    pub fn resize(&self, new_size: u64) -> VmResult<()> {
        self.with_state(|state, id, batch| state.resize(id, new_size, batch))
    }

    /// Free the committed pages in range. Only for parentless objects
    /// without a pager.
    pub fn decommit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.with_state(|state, id, batch| state.decommit_range(id, offset, len, batch))
    }

    /// Make every page in range read as zero
    pub fn zero_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.with_state(|state, id, batch| state.zero_range(id, offset, len, batch))
    }

    /// Pin committed pages; all-or-nothing
    pub fn pin_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.with_state(|state, id, _| state.pin_range(id, offset, len))
    }

    pub fn unpin_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.with_state(|state, id, _| state.unpin_range(id, offset, len))
    }

    /// Copy bytes out, faulting pages in read-only
    pub fn read(&self, offset: u64, buf: &mut [u8]) -> VmResult<()> {
        self.with_state(|state, id, _| {
            let end = offset
                .checked_add(buf.len() as u64)
                .ok_or(VmError::OutOfRange)?;
            if end > state.arena[id].size {
                return Err(VmError::OutOfRange);
            }
            let mut done = 0usize;
            while done < buf.len() {
                let pos = offset + done as u64;
                let in_page = (pos % PAGE_SIZE) as usize;
                let chunk = (PAGE_SIZE as usize - in_page).min(buf.len() - done);
                let lookup = state.get_page(id, pos, FaultFlags::SW_FAULT)?;
                state
                    .ctx
                    .allocator()
                    .read(lookup.page, in_page, &mut buf[done..done + chunk]);
                done += chunk;
            }
            Ok(())
        })
    }

    /// Copy bytes in, forking shared pages as needed
    pub fn write(&self, offset: u64, data: &[u8]) -> VmResult<()> {
        self.with_state(|state, id, _| {
            let end = offset
                .checked_add(data.len() as u64)
                .ok_or(VmError::OutOfRange)?;
            if end > state.arena[id].size {
                return Err(VmError::OutOfRange);
            }
            let mut done = 0usize;
            while done < data.len() {
                let pos = offset + done as u64;
                let in_page = (pos % PAGE_SIZE) as usize;
                let chunk = (PAGE_SIZE as usize - in_page).min(data.len() - done);
                let lookup = state.get_page(id, pos, FaultFlags::WRITE | FaultFlags::SW_FAULT)?;
                state
                    .ctx
                    .allocator()
                    .write(lookup.page, in_page, &data[done..done + chunk]);
                done += chunk;
            }
            Ok(())
        })
    }

    /// Visit every page committed in this object in range. Never faults.
    pub fn lookup<F>(&self, offset: u64, len: u64, mut f: F) -> VmResult<()>
    where
        F: FnMut(u64, PageHandle),
    {
        self.with_state(|state, id, _| {
            let (target, base) = state.resolve_slice(id, offset, len)?;
            let end = state.checked_end(target, base, len)?;
            for (off, slot) in state.arena[target].pages.range(base, end) {
                if let PageSlot::Committed(p) = slot {
                    f(off - base + offset, p.page);
                }
            }
            Ok(())
        })
    }

    pub fn content_at(&self, offset: u64) -> VmResult<PageContent> {
        self.with_state(|state, id, _| state.content_at(id, offset))
    }

    /// Would a read at `offset` return zeros?
    pub fn reads_as_zero(&self, offset: u64) -> VmResult<bool> {
        let content = self.content_at(offset)?;
        let allocator = self.hierarchy.ctx.allocator();
        Ok(match content {
            PageContent::Marker | PageContent::Zero => true,
            PageContent::Local(page) | PageContent::Ancestor(page) => allocator.is_zero(page),
            PageContent::PagerBacked => false,
        })
    }

    pub fn id(&self) -> VmObjectId {
        self.id
    }

    pub fn size(&self) -> u64 {
        self.with_state(|state, id, _| state.arena[id].size)
    }

    pub fn kind(&self) -> NodeKind {
        self.with_state(|state, id, _| state.arena[id].kind)
    }

    pub fn context(&self) -> &Arc<VmContext> {
        &self.hierarchy.ctx
    }

    /// Window onto the parent, if the object has one
    pub fn parent_window(&self) -> Option<ParentWindow> {
        self.with_state(|state, id, _| {
            let node = &state.arena[id];
            node.parent.map(|_| ParentWindow {
                offset: node.parent_offset,
                start_limit: node.parent_start_limit,
                limit: node.parent_limit,
            })
        })
    }

    /// Is `other` this object's direct parent?
    pub fn is_child_of(&self, other: &VmObject) -> bool {
        Arc::ptr_eq(&self.hierarchy, &other.hierarchy)
            && self.with_state(|state, id, _| state.arena[id].parent == Some(other.node))
    }

    pub fn committed_page_count(&self) -> usize {
        self.with_state(|state, id, _| state.arena[id].pages.committed_count())
    }

    pub fn pinned_count(&self) -> u64 {
        self.with_state(|state, id, _| state.arena[id].pinned_count)
    }

    pub fn hierarchy_generation(&self) -> u64 {
        self.with_state(|state, _, _| state.generation)
    }

    /// Live nodes in the clone tree, hidden ones included
    pub fn hierarchy_node_count(&self) -> usize {
        self.with_state(|state, _, _| state.arena.len())
    }

    pub fn debug_validate(&self) -> VmResult<()> {
        self.with_state(|state, _, _| state.validate())
    }
}

impl Clone for VmObject {
    fn clone(&self) -> Self {
        self.hierarchy.lock().arena[self.node].handles += 1;
        Self {
            hierarchy: self.hierarchy.clone(),
            node: self.node,
            id: self.id,
        }
    }
}

impl Drop for VmObject {
    fn drop(&mut self) {
        let node = self.node;
        self.with_state(|state, _, batch| state.release_handle(node, batch));
    }
}

impl fmt::Debug for VmObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmObject")
            .field("id", &self.id)
            .field("node", &self.node)
            .finish()
    }
}
