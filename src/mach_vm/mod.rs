//! Mach Virtual Memory Subsystem
//!
//! Based on Mach4 vm/ subsystem, narrowed to the copy-on-write page core:
//! - vm_page: Physical page collaborators and the reference page manager
//! - page_list: Sparse per-object page tables and split bits
//! - vm_object: Clone trees, slices, range operations
//! - vm_fault: Content lookup, forks, zero-fill, pager faults
//! - memory_object: External pager interface
//! - pmap: Mapping invalidation callbacks
//! - attribution: Charging shared pages to visible objects
//! - vm_pageout: Eviction and discardable reclamation
//!
//! Every hierarchy is built against a [`VmContext`], which bundles the
//! collaborators (allocator, page queues, clock) and the tunables.

pub mod attribution;
pub mod memory_object;
pub mod page_list;
pub mod pmap;
pub mod vm_fault;
pub mod vm_object;
pub mod vm_page;
pub mod vm_pageout;

use alloc::sync::Arc;

use log::info;

use crate::config::VmConfig;
use crate::kern::timer::Clock;

pub use memory_object::{
    PageProvider, PageRequest, PageSource, PageSpliceList, RequestStatus, SplicedPage,
};
pub use page_list::{CommittedPage, PageSlot, Side, SparsePageTable, SplitBits};
pub use pmap::{RangeChange, RangeChangeListener, RangeChangeOp, RecordingListener};
pub use vm_fault::{FaultFlags, FaultStats, LookupPage};
pub use vm_object::{CloneMode, NodeKind, PageContent, ParentWindow, VmObject, VmObjectId};
pub use vm_page::{
    PageBatch, PageHandle, PageManager, PageQueues, PhysicalPageAllocator, PAGE_SIZE, ZERO_PAGE,
};
pub use vm_pageout::{DiscardableRegistry, DiscardableState, ReclaimSnapshot};

// ============================================================================
// VM Context
// ============================================================================

/// Collaborators and tunables shared by every hierarchy built on them
pub struct VmContext {
    allocator: Arc<dyn PhysicalPageAllocator>,
    queues: Arc<dyn PageQueues>,
    clock: Arc<dyn Clock>,
    registry: DiscardableRegistry,
    config: VmConfig,
}

impl VmContext {
    pub fn new(
        allocator: Arc<dyn PhysicalPageAllocator>,
        queues: Arc<dyn PageQueues>,
        clock: Arc<dyn Clock>,
        config: VmConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            allocator,
            queues,
            clock,
            registry: DiscardableRegistry::new(),
            config,
        })
    }

    /// Context backed by a fresh [`PageManager`] of `config.total_pages`
    /// frames, which serves as both allocator and page queues.
    pub fn with_page_manager(config: VmConfig, clock: Arc<dyn Clock>) -> (Arc<Self>, Arc<PageManager>) {
        let pages = Arc::new(PageManager::new(config.total_pages));
        let ctx = Self::new(pages.clone(), pages.clone(), clock, config);
        (ctx, pages)
    }

    pub fn allocator(&self) -> &Arc<dyn PhysicalPageAllocator> {
        &self.allocator
    }

    pub fn queues(&self) -> &Arc<dyn PageQueues> {
        &self.queues
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn registry(&self) -> &DiscardableRegistry {
        &self.registry
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }
}

// ============================================================================
// Global State
// ============================================================================

static CONTEXT: spin::Once<Arc<VmContext>> = spin::Once::new();

/// Install the system-wide context. Later calls keep the first one.
pub fn init(ctx: Arc<VmContext>) -> &'static Arc<VmContext> {
    let installed = CONTEXT.call_once(|| {
        info!(
            "mach_vm: {} frames, pin limit {}, readahead {} pages",
            ctx.config.total_pages, ctx.config.max_pin_count, ctx.config.pager_readahead_pages
        );
        ctx
    });
    installed
}

/// The context installed by [`init`], if any
pub fn context() -> Option<&'static Arc<VmContext>> {
    CONTEXT.get()
}
