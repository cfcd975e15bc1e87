//! Memory Object - External pager interface
//!
//! Based on Mach4 vm/memory_object.h/c
//! A pager-backed object delegates missing content to a [`PageProvider`].
//! Faults on absent pages turn into [`PageRequest`]s: the faulting thread
//! gets the request back (as `ShouldWait`), drops the hierarchy lock and
//! waits; the pager answers with [`VmObject::supply_pages`] or
//! [`VmObject::fail_page_requests`], which complete the request, and the
//! fault is retried.
//!
//! Requests are tracked per page by the object's [`PageSource`]. A fault on
//! a page that is already being fetched joins the outstanding request
//! instead of issuing a new one.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use log::{debug, warn};
use spin::Mutex;

use crate::error::{ErrorKind, VmError, VmResult};
use crate::mach_vm::page_list::{CommittedPage, PageSlot};
use crate::mach_vm::pmap::RangeChangeOp;
use crate::mach_vm::vm_object::{require_aligned, HierarchyState, NodeId, VmObject};
use crate::mach_vm::vm_page::{PageBatch, PageHandle, PAGE_SIZE};

// ============================================================================
// Page Provider
// ============================================================================

/// The pager side of an external object.
///
/// Called with the hierarchy lock held: implementations must queue the work
/// and return, never calling back into the object from inside a callback.
pub trait PageProvider: Send + Sync {
    /// Content for `[offset, offset + len)` is wanted
    fn data_request(&self, offset: u64, len: u64);

    /// A run of pages was installed
    fn pages_supplied(&self, _offset: u64, _len: u64) {}

    /// Requests covering the range were failed
    fn pages_failed(&self, _offset: u64, _len: u64, _error: ErrorKind) {}
}

// ============================================================================
// Page Request
// ============================================================================

/// Lifecycle of a request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Completed,
    Failed(ErrorKind),
}

#[derive(Debug)]
struct RequestState {
    status: RequestStatus,
    /// Bit `i` set while page `i` of the request is still missing
    remaining: u64,
}

#[derive(Debug)]
struct RequestInner {
    id: u64,
    offset: u64,
    len: u64,
    state: Mutex<RequestState>,
}

static NEXT_REQUEST_ID: AtomicU64 = AtomicU64::new(1);

/// Token a faulting thread waits on. Clones refer to the same request.
#[derive(Debug, Clone)]
pub struct PageRequest {
    inner: Arc<RequestInner>,
}

impl PageRequest {
    fn new(offset: u64, len: u64) -> Self {
        let pages = len / PAGE_SIZE;
        let remaining = if pages >= 64 { u64::MAX } else { (1u64 << pages) - 1 };
        Self {
            inner: Arc::new(RequestInner {
                id: NEXT_REQUEST_ID.fetch_add(1, Ordering::Relaxed),
                offset,
                len,
                state: Mutex::new(RequestState {
                    status: RequestStatus::Pending,
                    remaining,
                }),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Offset into the pager-backed root
    pub fn offset(&self) -> u64 {
        self.inner.offset
    }

    pub fn len(&self) -> u64 {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn status(&self) -> RequestStatus {
        self.inner.state.lock().status
    }

    pub fn is_pending(&self) -> bool {
        self.status() == RequestStatus::Pending
    }

    /// Poll the request: `Ok` once every page arrived, `ShouldWait` while
    /// still pending, the failure otherwise.
    pub fn wait(&self) -> VmResult<()> {
        match self.status() {
            RequestStatus::Completed => Ok(()),
            RequestStatus::Pending => Err(VmError::ShouldWait(self.clone())),
            RequestStatus::Failed(kind) => Err(VmError::from_kind(kind)),
        }
    }

    /// Do both tokens refer to the same request?
    pub fn same_request(&self, other: &PageRequest) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Mark page `offset` as supplied. Returns true when this completed
    /// the request.
    fn page_arrived(&self, offset: u64) -> bool {
        let index = (offset - self.inner.offset) / PAGE_SIZE;
        let mut state = self.inner.state.lock();
        if state.status != RequestStatus::Pending {
            return false;
        }
        state.remaining &= !(1u64 << index);
        if state.remaining == 0 {
            state.status = RequestStatus::Completed;
            return true;
        }
        false
    }

    fn fail(&self, kind: ErrorKind) {
        let mut state = self.inner.state.lock();
        if state.status == RequestStatus::Pending {
            state.status = RequestStatus::Failed(kind);
        }
    }

    fn pages(&self) -> impl Iterator<Item = u64> {
        let start = self.inner.offset;
        let end = start + self.inner.len;
        (start..end).step_by(PAGE_SIZE as usize)
    }
}

// ============================================================================
// Page Source
// ============================================================================

/// Outstanding-request bookkeeping between an object and its provider
pub struct PageSource {
    provider: Arc<dyn PageProvider>,
    /// Page offset -> request waiting for it
    outstanding: Mutex<BTreeMap<u64, PageRequest>>,
    closed: AtomicBool,
}

impl PageSource {
    pub fn new(provider: Arc<dyn PageProvider>) -> Self {
        Self {
            provider,
            outstanding: Mutex::new(BTreeMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Request `[offset, offset + len)`. Joins an outstanding request for
    /// `offset` if there is one; otherwise readahead stops at the first page
    /// already being fetched.
    pub(crate) fn request(&self, offset: u64, len: u64) -> PageRequest {
        let mut outstanding = self.outstanding.lock();
        if let Some(existing) = outstanding.get(&offset) {
            return existing.clone();
        }
        if self.closed.load(Ordering::Acquire) {
            let request = PageRequest::new(offset, PAGE_SIZE);
            request.fail(ErrorKind::BadState);
            return request;
        }

        let mut pages = 1u64;
        while pages * PAGE_SIZE < len && !outstanding.contains_key(&(offset + pages * PAGE_SIZE)) {
            pages += 1;
        }
        let request = PageRequest::new(offset, pages * PAGE_SIZE);
        for page in request.pages() {
            outstanding.insert(page, request.clone());
        }
        drop(outstanding);

        debug!("pager request {:#x}+{:#x}", offset, pages * PAGE_SIZE);
        self.provider.data_request(offset, pages * PAGE_SIZE);
        request
    }

    /// Pages in range are present; complete whatever waited on them.
    fn resolve(&self, offset: u64, len: u64) {
        let mut outstanding = self.outstanding.lock();
        let end = offset + len;
        let pages: Vec<u64> = outstanding.range(offset..end).map(|(&o, _)| o).collect();
        for page in pages {
            if let Some(request) = outstanding.remove(&page) {
                request.page_arrived(page);
            }
        }
    }

    /// A run of pages was installed by the pager
    pub(crate) fn on_pages_supplied(&self, offset: u64, len: u64) {
        self.resolve(offset, len);
        self.provider.pages_supplied(offset, len);
    }

    /// Fail every request touching the range. Returns how many failed.
    pub(crate) fn fail_range(&self, offset: u64, len: u64, kind: ErrorKind) -> usize {
        let mut outstanding = self.outstanding.lock();
        let end = offset.saturating_add(len);
        let mut failed: Vec<PageRequest> = Vec::new();
        for (_, request) in outstanding.range(offset..end) {
            if !failed.iter().any(|r| r.same_request(request)) {
                failed.push(request.clone());
            }
        }
        for request in &failed {
            request.fail(kind);
            for page in request.pages() {
                outstanding.remove(&page);
            }
        }
        failed.len()
    }

    /// Pager-reported failure: fail the requests and tell the provider
    pub(crate) fn on_pages_failed(&self, offset: u64, len: u64, kind: ErrorKind) {
        let failed = self.fail_range(offset, len, kind);
        warn!(
            "pager failed {:#x}+{:#x} ({:?}), {} requests",
            offset, len, kind, failed
        );
        self.provider.pages_failed(offset, len, kind);
    }

    /// Object is going away: nothing outstanding will ever complete.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.fail_range(0, u64::MAX, ErrorKind::BadState);
    }

    /// Distinct requests still pending
    pub fn outstanding_requests(&self) -> usize {
        let outstanding = self.outstanding.lock();
        let mut seen: Vec<u64> = outstanding.values().map(|r| r.id()).collect();
        seen.dedup();
        seen.len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

// ============================================================================
// Splice Lists
// ============================================================================

/// One page handed across the object boundary
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplicedPage {
    Page(PageHandle),
    /// Known zero content
    Zero,
}

/// Contiguous run of pages moved in by `supply_pages` or out by `take_pages`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PageSpliceList {
    pages: Vec<SplicedPage>,
}

impl PageSpliceList {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn from_pages(pages: Vec<PageHandle>) -> Self {
        Self {
            pages: pages.into_iter().map(SplicedPage::Page).collect(),
        }
    }

    pub fn push(&mut self, page: SplicedPage) {
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Length in bytes
    pub fn byte_len(&self) -> u64 {
        self.pages.len() as u64 * PAGE_SIZE
    }

    pub fn iter(&self) -> impl Iterator<Item = &SplicedPage> {
        self.pages.iter()
    }

    pub fn into_pages(self) -> Vec<SplicedPage> {
        self.pages
    }

    fn free_into(self, batch: &mut PageBatch) {
        for entry in self.pages {
            if let SplicedPage::Page(page) = entry {
                batch.push(page);
            }
        }
    }
}

// ============================================================================
// Pager Operations
// ============================================================================

impl HierarchyState {
    /// Install pager content. Occupied slots keep their content and the
    /// supplied page is freed. Returns the number of slots filled.
    pub(crate) fn supply_pages(
        &mut self,
        id: NodeId,
        offset: u64,
        pages: PageSpliceList,
        batch: &mut PageBatch,
    ) -> VmResult<u64> {
        let len = pages.byte_len();
        let checked = require_aligned(offset, len)
            .and_then(|_| self.resolve_slice(id, offset, len))
            .and_then(|(id, offset)| self.checked_end(id, offset, len).map(|_| (id, offset)));
        let (id, offset) = match checked {
            Ok(target) => target,
            Err(err) => {
                pages.free_into(batch);
                return Err(err);
            }
        };
        let Some(source) = self.arena[id].page_source.clone() else {
            pages.free_into(batch);
            return Err(VmError::BadState("object is not pager-backed"));
        };

        let queues = self.ctx.queues();
        let node = &mut self.arena[id];
        let mut inserted = 0u64;
        let mut run: Option<(u64, u64)> = None;
        for (i, entry) in pages.into_pages().into_iter().enumerate() {
            let off = offset + i as u64 * PAGE_SIZE;
            if !node.pages.get(off).is_empty() {
                if let SplicedPage::Page(page) = entry {
                    batch.push(page);
                }
                source.resolve(off, PAGE_SIZE);
                if let Some((start, run_len)) = run.take() {
                    source.on_pages_supplied(start, run_len);
                }
                continue;
            }
            let slot = match entry {
                SplicedPage::Page(page) => {
                    queues.mark_accessed(page);
                    PageSlot::Committed(CommittedPage::new(page))
                }
                SplicedPage::Zero => PageSlot::Marker,
            };
            node.pages.insert(off, slot);
            inserted += 1;
            run = match run {
                Some((start, run_len)) => Some((start, run_len + PAGE_SIZE)),
                None => Some((off, PAGE_SIZE)),
            };
        }
        if let Some((start, run_len)) = run {
            source.on_pages_supplied(start, run_len);
        }
        if inserted > 0 {
            self.bump_generation();
        }
        debug!("supplied {} pages at {:#x}", inserted, offset);
        Ok(inserted)
    }

    /// Remove the range from a parentless, childless object and hand the
    /// content to the caller.
    pub(crate) fn take_pages(
        &mut self,
        id: NodeId,
        offset: u64,
        len: u64,
    ) -> VmResult<PageSpliceList> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        let end = self.checked_end(id, offset, len)?;
        let node = &self.arena[id];
        if node.parent.is_some() || !node.children.is_empty() {
            return Err(VmError::BadState("take needs an object outside any clone tree"));
        }
        if node.any_pinned(offset, end) {
            return Err(VmError::BadState("pinned pages in range"));
        }

        self.range_change_update(id, offset, len, RangeChangeOp::Unmap);
        let node = &mut self.arena[id];
        let mut list = PageSpliceList::new();
        for off in (offset..end).step_by(PAGE_SIZE as usize) {
            list.push(match node.pages.remove(off) {
                PageSlot::Committed(p) => SplicedPage::Page(p.page),
                _ => SplicedPage::Zero,
            });
        }
        self.bump_generation();
        Ok(list)
    }

    /// Insert `pages` into empty slots of a parentless, childless object.
    /// Nothing is inserted if any slot in range is occupied. On error the
    /// pages are freed.
    pub(crate) fn splice_pages(
        &mut self,
        id: NodeId,
        offset: u64,
        pages: PageSpliceList,
        batch: &mut PageBatch,
    ) -> VmResult<()> {
        let len = pages.byte_len();
        let checked = require_aligned(offset, len)
            .and_then(|_| self.resolve_slice(id, offset, len))
            .and_then(|(id, offset)| self.checked_end(id, offset, len).map(|end| (id, offset, end)))
            .and_then(|(id, offset, end)| {
                let node = &self.arena[id];
                if node.parent.is_some() || !node.children.is_empty() {
                    Err(VmError::BadState("splice needs an object outside any clone tree"))
                } else if node.pages.range(offset, end).next().is_some() {
                    Err(VmError::AlreadyExists)
                } else {
                    Ok((id, offset))
                }
            });
        let (id, offset) = match checked {
            Ok(target) => target,
            Err(err) => {
                pages.free_into(batch);
                return Err(err);
            }
        };

        let queues = self.ctx.queues();
        let node = &mut self.arena[id];
        let pager_backed = node.page_source.is_some();
        for (i, entry) in pages.into_pages().into_iter().enumerate() {
            let off = offset + i as u64 * PAGE_SIZE;
            match entry {
                SplicedPage::Page(page) => {
                    queues.mark_accessed(page);
                    node.pages.insert(off, PageSlot::Committed(CommittedPage::new(page)));
                }
                // Without a pager an empty slot already reads as zero.
                SplicedPage::Zero if pager_backed => {
                    node.pages.insert(off, PageSlot::Marker);
                }
                SplicedPage::Zero => {}
            }
        }
        if let Some(source) = node.page_source.as_ref() {
            source.resolve(offset, len);
        }
        self.bump_generation();
        debug!("spliced {:#x}+{:#x} into {:?}", offset, len, id);
        Ok(())
    }

    pub(crate) fn fail_page_requests(
        &mut self,
        id: NodeId,
        offset: u64,
        len: u64,
        error: ErrorKind,
    ) -> VmResult<()> {
        require_aligned(offset, len)?;
        let (id, offset) = self.resolve_slice(id, offset, len)?;
        self.checked_end(id, offset, len)?;
        let Some(source) = self.arena[id].page_source.as_ref() else {
            return Err(VmError::BadState("object is not pager-backed"));
        };
        source.on_pages_failed(offset, len, error);
        Ok(())
    }
}

impl VmObject {
    /// Pager answer: install `pages` starting at `offset`
    pub fn supply_pages(&self, offset: u64, pages: PageSpliceList) -> VmResult<u64> {
        self.with_state(|state, id, batch| state.supply_pages(id, offset, pages, batch))
    }

    /// Move the range's content out of the object
    pub fn take_pages(&self, offset: u64, len: u64) -> VmResult<PageSpliceList> {
        self.with_state(|state, id, _| state.take_pages(id, offset, len))
    }

    /// Put content taken with [`VmObject::take_pages`] back. Fails with
    /// `AlreadyExists` if any slot in range already has content.
    pub fn splice_pages(&self, offset: u64, pages: PageSpliceList) -> VmResult<()> {
        self.with_state(|state, id, batch| state.splice_pages(id, offset, pages, batch))
    }

    /// Pager answer: the range cannot be provided
    pub fn fail_page_requests(&self, offset: u64, len: u64, error: ErrorKind) -> VmResult<()> {
        self.with_state(|state, id, _| state.fail_page_requests(id, offset, len, error))
    }

    /// Outstanding pager requests on this object's tree root
    pub fn outstanding_page_requests(&self) -> usize {
        self.with_state(|state, id, _| {
            let root = state.root_of(id);
            state.arena[root]
                .page_source
                .as_ref()
                .map_or(0, |source| source.outstanding_requests())
        })
    }
}
