//! VM Fault - Page lookup and copy-on-write resolution
//!
//! Based on Mach4 vm/vm_fault.h/c
//! Resolves a fault at one offset of an object by locating the content
//! that would currently be read there and, for writes, giving the object
//! a private page.
//!
//! ## Fault Types
//!
//! - **Zero-fill**: nothing in the chain (or an explicit zero marker); a
//!   write allocates a fresh zeroed page
//! - **Page-in**: the root is pager-backed and the page is absent; the
//!   fault returns a request to wait on
//! - **Copy-on-write**: an ancestor holds the page; writes either migrate
//!   it down (nobody else can see it) or copy it
//!
//! Reads of zero content return the shared [`ZERO_PAGE`] read-only.

use alloc::vec::Vec;
use core::ops::BitOr;
use core::sync::atomic::{AtomicU64, Ordering};

use log::{trace, warn};

use crate::error::{VmError, VmResult};
use crate::mach_vm::memory_object::PageRequest;
use crate::mach_vm::page_list::{CommittedPage, PageSlot, Side};
use crate::mach_vm::pmap::RangeChangeOp;
use crate::mach_vm::vm_object::{checked_offset, require_aligned, HierarchyState, NodeId, VmObject};
use crate::mach_vm::vm_page::{trunc_page, PageHandle, PAGE_SIZE, ZERO_PAGE};

/// Upper bound on a single pager request
pub const MAX_REQUEST_PAGES: u64 = 64;

// ============================================================================
// Fault Flags
// ============================================================================

/// Fault flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FaultFlags(u32);

impl FaultFlags {
    /// Caller intends to write
    pub const WRITE: Self = Self(0x0001);
    /// Fault raised by software (read/write/commit paths)
    pub const SW_FAULT: Self = Self(0x0002);
    /// Fault raised by the MMU; enables pager readahead
    pub const HW_FAULT: Self = Self(0x0004);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn bits(&self) -> u32 {
        self.0
    }

    pub const fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for FaultFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Page returned by a successful fault
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupPage {
    pub page: PageHandle,
    /// Only pages owned by the faulting object may be mapped writable.
    pub writable: bool,
}

// ============================================================================
// Fault Statistics
// ============================================================================

/// Global fault statistics
static FAULT_STATS: FaultStats = FaultStats::new();

/// Fault statistics counters
pub struct FaultStats {
    /// Total faults
    pub total: AtomicU64,
    /// Pages copied for copy-on-write
    pub cow: AtomicU64,
    /// Shared pages moved down without copying
    pub migrations: AtomicU64,
    /// Zero-fill faults
    pub zero_fill: AtomicU64,
    /// Requests handed to a pager
    pub pager_requests: AtomicU64,
    /// Failed faults
    pub failures: AtomicU64,
}

impl FaultStats {
    pub const fn new() -> Self {
        Self {
            total: AtomicU64::new(0),
            cow: AtomicU64::new(0),
            migrations: AtomicU64::new(0),
            zero_fill: AtomicU64::new(0),
            pager_requests: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    pub fn incr_total(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_cow(&self) {
        self.cow.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_migrations(&self) {
        self.migrations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_zero_fill(&self) {
        self.zero_fill.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_pager_requests(&self) {
        self.pager_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_failures(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }
}

impl Default for FaultStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Get fault statistics
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Content Lookup
// ============================================================================

/// Where the content at an offset currently comes from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ContentSource {
    /// A committed page in `owner` (possibly the object itself)
    Page {
        owner: NodeId,
        owner_offset: u64,
        page: PageHandle,
    },
    /// An explicit zero marker in `owner`
    Marker { owner: NodeId },
    /// Nothing anywhere
    Zero,
    /// Absent from a pager-backed root
    Pager { root: NodeId, root_offset: u64 },
}

impl HierarchyState {
    /// Walk up from `id` until something occupies `offset` or the parent
    /// window ends.
    pub(crate) fn find_initial_content(&self, id: NodeId, offset: u64) -> ContentSource {
        let mut cur = id;
        let mut off = offset;
        loop {
            let node = &self.arena[cur];
            match node.pages.get(off) {
                PageSlot::Committed(p) => {
                    return ContentSource::Page {
                        owner: cur,
                        owner_offset: off,
                        page: p.page,
                    }
                }
                PageSlot::Marker => return ContentSource::Marker { owner: cur },
                PageSlot::Empty => {}
            }
            match node.parent {
                Some(parent) if node.window_contains(off) => {
                    off = checked_offset(off, node.parent_offset);
                    cur = parent;
                }
                Some(_) => return ContentSource::Zero,
                None if node.page_source.is_some() && off < node.size => {
                    return ContentSource::Pager {
                        root: cur,
                        root_offset: off,
                    }
                }
                None => return ContentSource::Zero,
            }
        }
    }

    fn alloc_page(&self) -> VmResult<PageHandle> {
        self.ctx.allocator().alloc_page().ok_or_else(|| {
            stats().incr_failures();
            warn!("fault: out of pages");
            VmError::NoMemory
        })
    }

    /// Install a freshly filled page in `id`
    fn commit_new_page(&mut self, id: NodeId, offset: u64, page: PageHandle) {
        let previous = self.arena[id]
            .pages
            .insert(offset, PageSlot::Committed(CommittedPage::new(page)));
        assert!(
            !matches!(previous, PageSlot::Committed(_)),
            "commit over a committed slot at {:#x}",
            offset
        );
        self.range_change_update(id, offset, PAGE_SIZE, RangeChangeOp::Unmap);
        self.ctx.queues().mark_accessed(page);
        self.bump_generation();
    }

    // ------------------------------------------------------------------------
    // Faults
    // ------------------------------------------------------------------------

    /// Resolve a fault at `offset` of `id`
    pub(crate) fn get_page(
        &mut self,
        id: NodeId,
        offset: u64,
        flags: FaultFlags,
    ) -> VmResult<LookupPage> {
        let offset = trunc_page(offset);
        let (id, offset) = self.resolve_slice(id, offset, PAGE_SIZE)?;
        if offset >= self.arena[id].size {
            return Err(VmError::OutOfRange);
        }
        self.check_not_discarded(id)?;
        stats().incr_total();
        let write = flags.contains(FaultFlags::WRITE);

        if let PageSlot::Committed(p) = self.arena[id].pages.get(offset) {
            self.ctx.queues().mark_accessed(p.page);
            return Ok(LookupPage {
                page: p.page,
                writable: true,
            });
        }

        match self.find_initial_content(id, offset) {
            ContentSource::Marker { .. } | ContentSource::Zero => {
                if !write {
                    return Ok(LookupPage {
                        page: ZERO_PAGE,
                        writable: false,
                    });
                }
                let page = self.alloc_page()?;
                self.ctx.allocator().zero_page(page);
                self.commit_new_page(id, offset, page);
                stats().incr_zero_fill();
                trace!("zero-fill {:?}@{:#x}", id, offset);
                Ok(LookupPage {
                    page,
                    writable: true,
                })
            }
            ContentSource::Pager { root, root_offset } => {
                let request = self.request_pages(root, root_offset, flags)?;
                Err(VmError::ShouldWait(request))
            }
            ContentSource::Page {
                owner,
                owner_offset,
                page,
            } => {
                if !write {
                    self.ctx.queues().mark_accessed(page);
                    return Ok(LookupPage {
                        page,
                        writable: false,
                    });
                }
                if self.arena[owner].is_hidden() {
                    let page = self.fork_page(id, offset, owner, owner_offset)?;
                    return Ok(LookupPage {
                        page,
                        writable: true,
                    });
                }
                // Visible ancestor (pager trees): private copy, ancestor untouched.
                let copy = self.alloc_page()?;
                self.ctx.allocator().copy_page(copy, page);
                self.commit_new_page(id, offset, copy);
                stats().incr_cow();
                Ok(LookupPage {
                    page: copy,
                    writable: true,
                })
            }
        }
    }

    /// Ask the root's pager for content starting at `root_offset`
    fn request_pages(
        &self,
        root: NodeId,
        root_offset: u64,
        flags: FaultFlags,
    ) -> VmResult<PageRequest> {
        let node = &self.arena[root];
        let Some(source) = node.page_source.as_ref() else {
            return Err(VmError::BadState("object is not pager-backed"));
        };
        let mut pages = 1u64;
        if flags.contains(FaultFlags::HW_FAULT) {
            let max = (self.ctx.config().pager_readahead_pages as u64).clamp(1, MAX_REQUEST_PAGES);
            while pages < max {
                let next = root_offset + pages * PAGE_SIZE;
                if next >= node.size || !node.pages.get(next).is_empty() {
                    break;
                }
                pages += 1;
            }
        }
        stats().incr_pager_requests();
        Ok(source.request(root_offset, pages * PAGE_SIZE))
    }

    /// Bring the page `owner` holds at `owner_offset` down to `leaf`,
    /// copying at every hidden level whose other child can still read it
    /// and moving it otherwise. Returns the page now committed in `leaf`.
    pub(crate) fn fork_page(
        &mut self,
        leaf: NodeId,
        offset: u64,
        owner: NodeId,
        owner_offset: u64,
    ) -> VmResult<PageHandle> {
        // (hidden node, side toward leaf, offset within the hidden node)
        let mut path: Vec<(NodeId, Side, u64)> = Vec::new();
        let mut cur = leaf;
        let mut cur_off = offset;
        while cur != owner {
            let node = &self.arena[cur];
            let Some(parent) = node.parent else {
                panic!("fork source {:?} is not an ancestor of {:?}", owner, leaf);
            };
            let parent_off = checked_offset(cur_off, node.parent_offset);
            path.push((parent, self.side_of(parent, cur), parent_off));
            cur = parent;
            cur_off = parent_off;
        }
        debug_assert_eq!(cur_off, owner_offset);
        path.reverse();

        let mut unmapped = false;
        let mut progressed = false;
        let mut result = None;
        for (hidden, side, hidden_off) in path {
            let child = self.arena[hidden].children[side.index()];
            let sibling = self.arena[hidden].children[side.other().index()];
            let child_off = hidden_off - self.arena[child].parent_offset;
            let source = match self.arena[hidden].pages.get(hidden_off) {
                PageSlot::Committed(p) => p,
                other => panic!("fork source slot at {:#x} is {:?}", hidden_off, other),
            };
            assert!(
                !source.split.is_split(side),
                "page at {:#x} already split toward {:?}",
                hidden_off,
                side
            );

            let uni_accessible =
                source.split.is_split(side.other()) || !self.child_sees(sibling, hidden_off);
            let page = if uni_accessible {
                self.arena[hidden].pages.remove(hidden_off);
                stats().incr_migrations();
                source.page
            } else {
                let copy = match self.alloc_page() {
                    Ok(copy) => copy,
                    Err(err) => {
                        if progressed {
                            self.bump_generation();
                        }
                        return Err(err);
                    }
                };
                self.ctx.allocator().copy_page(copy, source.page);
                if let Some(p) = self.arena[hidden].pages.committed_mut(hidden_off) {
                    p.split.set(side);
                }
                stats().incr_cow();
                if !unmapped {
                    // Everything below still maps the shared page.
                    self.range_change_update(child, child_off, PAGE_SIZE, RangeChangeOp::Unmap);
                    unmapped = true;
                }
                copy
            };

            let previous = self.arena[child]
                .pages
                .insert(child_off, PageSlot::Committed(CommittedPage::new(page)));
            assert!(previous.is_empty(), "fork target slot at {:#x} occupied", child_off);
            progressed = true;
            result = Some(page);
        }

        self.bump_generation();
        match result {
            Some(page) => {
                self.ctx.queues().mark_accessed(page);
                trace!("forked {:?}@{:#x} from {:?}", leaf, offset, owner);
                Ok(page)
            }
            None => Err(VmError::BadState("fork from the object itself")),
        }
    }

    /// Fault every non-committed page in range in for writing
    pub(crate) fn commit_range(&mut self, id: NodeId, offset: u64, len: u64) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        self.check_not_discarded(id)?;
        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            if matches!(self.arena[id].pages.get(off), PageSlot::Committed(_)) {
                continue;
            }
            self.get_page(id, off, FaultFlags::WRITE | FaultFlags::SW_FAULT)?;
        }
        Ok(())
    }
}

// ============================================================================
// Object Entry Points
// ============================================================================

impl VmObject {
    /// Resolve a fault at `offset`
    pub fn get_page(&self, offset: u64, flags: FaultFlags) -> VmResult<LookupPage> {
        self.with_state(|state, id, _| state.get_page(id, offset, flags))
    }

    /// Make every page in range private and committed
    pub fn commit_range(&self, offset: u64, len: u64) -> VmResult<()> {
        self.with_state(|state, id, _| state.commit_range(id, offset, len))
    }
}
