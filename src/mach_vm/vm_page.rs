//! VM Page Management - Physical Page Abstraction
//!
//! Based on Mach4 vm/vm_page.h/c
//!
//! The COW core never owns physical memory itself. It talks to two
//! collaborators through the traits defined here:
//! - [`PhysicalPageAllocator`]: hands out and reclaims raw pages and
//!   moves their contents around
//! - [`PageQueues`]: tracks page temperature and wired state
//!
//! [`PageManager`] is the reference implementation of both, used by hosted
//! builds and by the test suite. Page contents live in lazily allocated
//! frame buffers; a frame that was never written reads as zeros.

use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::Mutex;

// ============================================================================
// Constants
// ============================================================================

/// Page size (4KB on most platforms)
pub const PAGE_SIZE: u64 = 4096;

/// Page shift (log2 of PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// The shared, read-only zero page. Never allocated, never freed.
pub const ZERO_PAGE: PageHandle = PageHandle(0);

// ============================================================================
// Page Handle
// ============================================================================

/// Handle to one physical page frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PageHandle(u32);

impl PageHandle {
    /// Wrap a raw frame number
    pub const fn new(frame: u32) -> Self {
        Self(frame)
    }

    /// Frame number
    pub const fn frame(&self) -> u32 {
        self.0
    }

    /// Physical address of the frame
    pub const fn phys_addr(&self) -> u64 {
        (self.0 as u64) << PAGE_SHIFT
    }

    /// Is this the shared zero page?
    pub const fn is_zero_page(&self) -> bool {
        self.0 == ZERO_PAGE.0
    }
}

// ============================================================================
// Collaborator Traits
// ============================================================================

/// Physical page allocator (pmm)
///
/// Independently locked; the COW core calls into it while holding a
/// hierarchy lock, so implementations must never call back into a
/// hierarchy.
pub trait PhysicalPageAllocator: Send + Sync {
    /// Allocate one page. Contents are unspecified.
    fn alloc_page(&self) -> Option<PageHandle>;

    /// Return a page to the free pool.
    fn free_page(&self, page: PageHandle);

    /// Copy the full contents of `src` into `dst`.
    fn copy_page(&self, dst: PageHandle, src: PageHandle);

    /// Fill `page` with zeros.
    fn zero_page(&self, page: PageHandle);

    /// Read bytes out of a page.
    fn read(&self, page: PageHandle, offset: usize, buf: &mut [u8]);

    /// Write bytes into a page.
    fn write(&self, page: PageHandle, offset: usize, data: &[u8]);

    /// Does the page contain only zeros?
    fn is_zero(&self, page: PageHandle) -> bool {
        let mut buf = [0u8; 256];
        let mut offset = 0;
        while offset < PAGE_SIZE as usize {
            self.read(page, offset, &mut buf);
            if buf.iter().any(|&b| b != 0) {
                return false;
            }
            offset += buf.len();
        }
        true
    }
}

/// Global page queues (LRU and wired tracking)
pub trait PageQueues: Send + Sync {
    /// Page was pinned for the first time; move it to the wired queue.
    fn set_wired(&self, page: PageHandle);

    /// Last pin dropped; return the page to the normal queues.
    fn set_unwired(&self, page: PageHandle);

    /// Page was accessed or newly committed.
    fn mark_accessed(&self, page: PageHandle);
}

// ============================================================================
// Page Queue Type
// ============================================================================

/// Page queue type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageQueueType {
    /// Not on any queue (allocated, not yet committed)
    None = 0,
    /// Free page queue
    Free = 1,
    /// Active page queue
    Active = 2,
    /// Wire queue (pinned pages)
    Wire = 3,
    /// Inactive queue (not touched since the last aging pass)
    Inactive = 4,
}

// ============================================================================
// Page Queue
// ============================================================================

/// A queue of pages
#[derive(Debug)]
pub struct PageQueue {
    pages: VecDeque<PageHandle>,
    queue_type: PageQueueType,
}

impl PageQueue {
    /// Create a new page queue
    pub fn new(queue_type: PageQueueType) -> Self {
        Self {
            pages: VecDeque::new(),
            queue_type,
        }
    }

    /// Add a page to the back of the queue
    pub fn enqueue(&mut self, page: PageHandle) {
        self.pages.push_back(page);
    }

    /// Remove a page from the front of the queue
    pub fn dequeue(&mut self) -> Option<PageHandle> {
        self.pages.pop_front()
    }

    /// Remove a specific page from the queue
    pub fn remove(&mut self, page: PageHandle) -> bool {
        if let Some(pos) = self.pages.iter().position(|&p| p == page) {
            self.pages.remove(pos);
            true
        } else {
            false
        }
    }

    /// Get queue length
    pub fn len(&self) -> usize {
        self.pages.len()
    }

    /// Check if queue is empty
    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    /// Get queue type
    pub fn queue_type(&self) -> PageQueueType {
        self.queue_type
    }
}

// ============================================================================
// Page Manager
// ============================================================================

struct Frame {
    queue: PageQueueType,
    data: Option<Box<[u8]>>,
}

struct PageManagerInner {
    frames: Vec<Frame>,
    free_queue: PageQueue,
    active_queue: PageQueue,
    inactive_queue: PageQueue,
    wire_queue: PageQueue,
}

impl PageManagerInner {
    fn frame(&self, page: PageHandle) -> &Frame {
        &self.frames[page.frame() as usize]
    }

    fn frame_mut(&mut self, page: PageHandle) -> &mut Frame {
        &mut self.frames[page.frame() as usize]
    }

    fn unlink(&mut self, page: PageHandle) {
        match self.frame(page).queue {
            PageQueueType::Active => {
                self.active_queue.remove(page);
            }
            PageQueueType::Inactive => {
                self.inactive_queue.remove(page);
            }
            PageQueueType::Wire => {
                self.wire_queue.remove(page);
            }
            PageQueueType::Free => {
                self.free_queue.remove(page);
            }
            PageQueueType::None => {}
        }
        self.frame_mut(page).queue = PageQueueType::None;
    }

    fn link(&mut self, page: PageHandle, queue: PageQueueType) {
        self.unlink(page);
        match queue {
            PageQueueType::Active => self.active_queue.enqueue(page),
            PageQueueType::Inactive => self.inactive_queue.enqueue(page),
            PageQueueType::Wire => self.wire_queue.enqueue(page),
            PageQueueType::Free => self.free_queue.enqueue(page),
            PageQueueType::None => {}
        }
        self.frame_mut(page).queue = queue;
    }
}

/// Page statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageStats {
    pub total: u32,
    pub free: u32,
    pub active: u32,
    pub inactive: u32,
    pub wired: u32,
    /// Pages handed out since creation
    pub allocations: u64,
}

/// Reference physical memory: a fixed pool of frames plus the page queues.
///
/// Frame 0 is reserved for [`ZERO_PAGE`].
pub struct PageManager {
    inner: Mutex<PageManagerInner>,
    allocations: AtomicU64,
    total: u32,
}

impl PageManager {
    /// Create a pool of `total_pages` allocatable frames
    pub fn new(total_pages: u32) -> Self {
        let mut frames = Vec::with_capacity(total_pages as usize + 1);
        let mut free_queue = PageQueue::new(PageQueueType::Free);
        frames.push(Frame {
            queue: PageQueueType::None,
            data: None,
        });
        for frame in 1..=total_pages {
            frames.push(Frame {
                queue: PageQueueType::Free,
                data: None,
            });
            free_queue.enqueue(PageHandle::new(frame));
        }
        Self {
            inner: Mutex::new(PageManagerInner {
                frames,
                free_queue,
                active_queue: PageQueue::new(PageQueueType::Active),
                inactive_queue: PageQueue::new(PageQueueType::Inactive),
                wire_queue: PageQueue::new(PageQueueType::Wire),
            }),
            allocations: AtomicU64::new(0),
            total: total_pages,
        }
    }

    /// Get statistics
    pub fn stats(&self) -> PageStats {
        let inner = self.inner.lock();
        PageStats {
            total: self.total,
            free: inner.free_queue.len() as u32,
            active: inner.active_queue.len() as u32,
            inactive: inner.inactive_queue.len() as u32,
            wired: inner.wire_queue.len() as u32,
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }

    /// Number of free pages
    pub fn free_count(&self) -> u32 {
        self.inner.lock().free_queue.len() as u32
    }

    /// Pages currently handed out
    pub fn in_use(&self) -> u32 {
        self.total - self.free_count()
    }

    /// Which queue a page sits on
    pub fn queue_of(&self, page: PageHandle) -> PageQueueType {
        self.inner.lock().frame(page).queue
    }

    /// Is the page on the wired queue?
    pub fn is_wired(&self, page: PageHandle) -> bool {
        self.queue_of(page) == PageQueueType::Wire
    }

    /// Aging pass: move up to `count` of the least recently accessed
    /// active pages to the inactive queue. An access moves a page back.
    pub fn deactivate_oldest(&self, count: usize) -> usize {
        let mut inner = self.inner.lock();
        let mut moved = 0;
        while moved < count {
            let Some(page) = inner.active_queue.dequeue() else { break };
            inner.frame_mut(page).queue = PageQueueType::None;
            inner.link(page, PageQueueType::Inactive);
            moved += 1;
        }
        moved
    }
}

impl PhysicalPageAllocator for PageManager {
    fn alloc_page(&self) -> Option<PageHandle> {
        let mut inner = self.inner.lock();
        let page = inner.free_queue.dequeue()?;
        inner.frame_mut(page).queue = PageQueueType::None;
        self.allocations.fetch_add(1, Ordering::Relaxed);
        Some(page)
    }

    fn free_page(&self, page: PageHandle) {
        assert!(!page.is_zero_page(), "attempt to free the zero page");
        let mut inner = self.inner.lock();
        assert!(
            inner.frame(page).queue != PageQueueType::Free,
            "double free of page {:?}",
            page
        );
        inner.frame_mut(page).data = None;
        inner.link(page, PageQueueType::Free);
    }

    fn copy_page(&self, dst: PageHandle, src: PageHandle) {
        assert!(!dst.is_zero_page(), "attempt to write the zero page");
        let mut inner = self.inner.lock();
        let data = inner.frame(src).data.clone();
        inner.frame_mut(dst).data = data;
    }

    fn zero_page(&self, page: PageHandle) {
        if page.is_zero_page() {
            return;
        }
        self.inner.lock().frame_mut(page).data = None;
    }

    fn read(&self, page: PageHandle, offset: usize, buf: &mut [u8]) {
        let inner = self.inner.lock();
        match &inner.frame(page).data {
            Some(data) => buf.copy_from_slice(&data[offset..offset + buf.len()]),
            None => buf.fill(0),
        }
    }

    fn write(&self, page: PageHandle, offset: usize, data: &[u8]) {
        assert!(!page.is_zero_page(), "attempt to write the zero page");
        let mut inner = self.inner.lock();
        let frame = inner.frame_mut(page);
        let bytes = frame
            .data
            .get_or_insert_with(|| vec![0u8; PAGE_SIZE as usize].into_boxed_slice());
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    fn is_zero(&self, page: PageHandle) -> bool {
        let inner = self.inner.lock();
        match &inner.frame(page).data {
            Some(data) => data.iter().all(|&b| b == 0),
            None => true,
        }
    }
}

impl PageQueues for PageManager {
    fn set_wired(&self, page: PageHandle) {
        self.inner.lock().link(page, PageQueueType::Wire);
    }

    fn set_unwired(&self, page: PageHandle) {
        self.inner.lock().link(page, PageQueueType::Active);
    }

    fn mark_accessed(&self, page: PageHandle) {
        if page.is_zero_page() {
            return;
        }
        let mut inner = self.inner.lock();
        match inner.frame(page).queue {
            PageQueueType::Wire | PageQueueType::Free => {}
            _ => inner.link(page, PageQueueType::Active),
        }
    }
}

// ============================================================================
// Deferred Free List
// ============================================================================

/// Pages collected under a hierarchy lock and freed after it is dropped.
#[derive(Debug, Default)]
pub struct PageBatch {
    pages: Vec<PageHandle>,
}

impl PageBatch {
    pub fn new() -> Self {
        Self { pages: Vec::new() }
    }

    pub fn push(&mut self, page: PageHandle) {
        debug_assert!(!page.is_zero_page());
        self.pages.push(page);
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn pages(&self) -> &[PageHandle] {
        &self.pages
    }

    /// Hand every collected page back to the allocator.
    pub fn release(&mut self, allocator: &dyn PhysicalPageAllocator) {
        for page in self.pages.drain(..) {
            allocator.free_page(page);
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Is `value` a multiple of the page size?
pub const fn is_page_aligned(value: u64) -> bool {
    value & (PAGE_SIZE - 1) == 0
}

/// Round address down to page boundary
pub const fn trunc_page(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// Round address up to page boundary, `None` on overflow
pub const fn round_page(addr: u64) -> Option<u64> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(v) => Some(v & !(PAGE_SIZE - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_queue() {
        let mut queue = PageQueue::new(PageQueueType::Free);
        assert!(queue.is_empty());

        queue.enqueue(PageHandle::new(1));
        queue.enqueue(PageHandle::new(2));
        queue.enqueue(PageHandle::new(3));

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue(), Some(PageHandle::new(1)));
        assert!(queue.remove(PageHandle::new(3)));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_alloc_and_free() {
        let pm = PageManager::new(2);
        let a = pm.alloc_page().unwrap();
        let b = pm.alloc_page().unwrap();
        assert!(!a.is_zero_page() && !b.is_zero_page());
        assert!(pm.alloc_page().is_none());
        assert_eq!(pm.in_use(), 2);

        pm.free_page(a);
        assert_eq!(pm.free_count(), 1);
        assert_eq!(pm.stats().allocations, 2);
    }

    #[test]
    fn test_contents() {
        let pm = PageManager::new(4);
        let a = pm.alloc_page().unwrap();
        let b = pm.alloc_page().unwrap();
        assert!(pm.is_zero(a));

        pm.write(a, 10, b"mach");
        pm.copy_page(b, a);
        let mut buf = [0u8; 4];
        pm.read(b, 10, &mut buf);
        assert_eq!(&buf, b"mach");

        pm.zero_page(b);
        assert!(pm.is_zero(b));
        assert!(!pm.is_zero(a));
    }

    #[test]
    fn test_wired_queue() {
        let pm = PageManager::new(4);
        let a = pm.alloc_page().unwrap();
        pm.mark_accessed(a);
        assert_eq!(pm.queue_of(a), PageQueueType::Active);

        pm.set_wired(a);
        assert!(pm.is_wired(a));
        pm.mark_accessed(a);
        assert!(pm.is_wired(a));

        pm.set_unwired(a);
        assert_eq!(pm.queue_of(a), PageQueueType::Active);
        assert_eq!(pm.stats().wired, 0);
    }

    #[test]
    fn test_inactive_queue_aging() {
        let pm = PageManager::new(4);
        let a = pm.alloc_page().unwrap();
        let b = pm.alloc_page().unwrap();
        pm.mark_accessed(a);
        pm.mark_accessed(b);

        assert_eq!(pm.deactivate_oldest(1), 1);
        assert_eq!(pm.queue_of(a), PageQueueType::Inactive);
        assert_eq!(pm.queue_of(b), PageQueueType::Active);

        pm.mark_accessed(a);
        assert_eq!(pm.queue_of(a), PageQueueType::Active);
        assert_eq!(pm.deactivate_oldest(8), 2);
        assert_eq!(pm.stats().inactive, 2);
        assert_eq!(pm.stats().active, 0);

        // Pinning takes a page off the inactive queue; unpinning makes it
        // active again.
        pm.set_wired(b);
        assert_eq!(pm.stats().inactive, 1);
        pm.set_unwired(b);
        assert_eq!(pm.queue_of(b), PageQueueType::Active);

        pm.free_page(a);
        assert_eq!(pm.stats().inactive, 0);
        assert_eq!(pm.free_count(), 3);
    }

    #[test]
    fn test_page_batch_release() {
        let pm = PageManager::new(4);
        let mut batch = PageBatch::new();
        batch.push(pm.alloc_page().unwrap());
        batch.push(pm.alloc_page().unwrap());
        assert_eq!(pm.free_count(), 2);

        batch.release(&pm);
        assert!(batch.is_empty());
        assert_eq!(pm.free_count(), 4);
    }

    #[test]
    fn test_page_utils() {
        assert!(is_page_aligned(0x5000));
        assert!(!is_page_aligned(0x5001));
        assert_eq!(trunc_page(0x5678), 0x5000);
        assert_eq!(round_page(0x5001), Some(0x6000));
        assert_eq!(round_page(u64::MAX), None);
        assert_eq!(PageHandle::new(5).phys_addr(), 0x5000);
    }
}
