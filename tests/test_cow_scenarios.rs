//! End-to-end scenarios for clone trees, pager-backed objects and
//! discardable memory, driven only through the public API.

use std::sync::{Arc, Mutex};

use vmcow::kern::ManualClock;
use vmcow::mach_vm::vm_pageout::reclaim_discardable;
use vmcow::mach_vm::{
    DiscardableState, PageContent, PageManager, PhysicalPageAllocator, RangeChangeOp,
    RecordingListener, PAGE_SIZE,
};
use vmcow::{
    CloneMode, ErrorKind, FaultFlags, PageProvider, PageSpliceList, VmConfig, VmContext, VmError,
    VmObject,
};

const PAGE: u64 = PAGE_SIZE;

fn setup(pages: u32) -> (Arc<VmContext>, Arc<PageManager>) {
    VmContext::with_page_manager(
        VmConfig::new().with_total_pages(pages),
        Arc::new(ManualClock::new(0)),
    )
}

fn read_byte(obj: &VmObject, offset: u64) -> u8 {
    let mut byte = [0u8];
    obj.read(offset, &mut byte).unwrap();
    byte[0]
}

/// A pager that only records what it was asked for
#[derive(Default)]
struct QueuedPager {
    requests: Mutex<Vec<(u64, u64)>>,
}

impl PageProvider for QueuedPager {
    fn data_request(&self, offset: u64, len: u64) {
        self.requests.lock().unwrap().push((offset, len));
    }
}

// ════════════════════════════════════════════════════════════
// Snapshot Clones
// ════════════════════════════════════════════════════════════

#[test]
fn test_snapshot_then_write_through_clone() {
    let (ctx, pm) = setup(32);
    let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
    obj.write(0, b"original").unwrap();
    obj.write(PAGE, &[7]).unwrap();

    let listener = Arc::new(RecordingListener::new());
    obj.add_mapping(listener.clone());
    let clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();
    // Both pages were shared, so the original lost write access to them.
    assert!(listener.saw(0, RangeChangeOp::RemoveWrite));
    assert!(listener.saw(PAGE, RangeChangeOp::RemoveWrite));

    clone.write(0, b"changed!").unwrap();
    let mut buf = [0u8; 8];
    obj.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"original");
    clone.read(0, &mut buf).unwrap();
    assert_eq!(&buf, b"changed!");
    assert_eq!(read_byte(&clone, PAGE), 7);

    // One copy on top of the two originals.
    assert_eq!(pm.in_use(), 3);
    assert_eq!(obj.attributed_pages(0, 2 * PAGE).unwrap(), 2);
    assert_eq!(clone.attributed_pages(0, 2 * PAGE).unwrap(), 1);
    obj.debug_validate().unwrap();
}

#[test]
fn test_three_generation_chain_survives_middle_drop() {
    let (ctx, pm) = setup(32);
    let a = VmObject::create(&ctx, 3 * PAGE).unwrap();
    a.write(0, &[1]).unwrap();
    a.write(PAGE, &[1]).unwrap();

    let b = a.create_clone(0, 3 * PAGE, CloneMode::Snapshot).unwrap();
    b.write(PAGE, &[2]).unwrap();
    b.write(2 * PAGE, &[2]).unwrap();

    let c = b.create_clone(0, 3 * PAGE, CloneMode::Snapshot).unwrap();
    drop(b);

    assert_eq!(read_byte(&c, 0), 1);
    assert_eq!(read_byte(&c, PAGE), 2);
    assert_eq!(read_byte(&c, 2 * PAGE), 2);
    assert_eq!(read_byte(&a, PAGE), 1);
    assert_eq!(read_byte(&a, 2 * PAGE), 0);
    c.debug_validate().unwrap();

    drop(a);
    assert_eq!(read_byte(&c, 0), 1);
    assert_eq!(c.hierarchy_node_count(), 1);
    assert_eq!(c.committed_page_count(), 3);
    c.debug_validate().unwrap();

    drop(c);
    assert_eq!(pm.in_use(), 0);
}

#[test]
fn test_dropping_every_object_frees_every_page() {
    let (ctx, pm) = setup(64);
    let root = VmObject::create(&ctx, 4 * PAGE).unwrap();
    root.commit_range(0, 4 * PAGE).unwrap();
    let mut objects = vec![root];
    for i in 0..4u64 {
        let parent = &objects[i as usize];
        let clone = parent.create_clone(i * PAGE, 2 * PAGE, CloneMode::Snapshot).unwrap();
        clone.write(0, &[i as u8 + 1]).unwrap();
        objects.push(clone);
    }
    assert!(pm.in_use() > 4);

    while let Some(obj) = objects.pop() {
        obj.debug_validate().unwrap();
        drop(obj);
    }
    assert_eq!(pm.in_use(), 0);
}

// ════════════════════════════════════════════════════════════
// Range Operations
// ════════════════════════════════════════════════════════════

#[test]
fn test_decommit_only_on_plain_roots() {
    let (ctx, pm) = setup(16);
    let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
    obj.commit_range(0, 2 * PAGE).unwrap();
    obj.decommit_range(0, PAGE).unwrap();
    assert_eq!(obj.committed_page_count(), 1);
    assert_eq!(pm.in_use(), 1);

    let clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();
    assert_eq!(
        clone.decommit_range(0, PAGE).unwrap_err().kind(),
        ErrorKind::BadState
    );
    assert_eq!(
        obj.decommit_range(0, PAGE).unwrap_err().kind(),
        ErrorKind::BadState
    );
}

#[test]
fn test_zero_range_over_shared_content() {
    let (ctx, _pm) = setup(16);
    let obj = VmObject::create(&ctx, 2 * PAGE).unwrap();
    obj.write(0, &[9]).unwrap();
    let clone = obj.create_clone(0, 2 * PAGE, CloneMode::Snapshot).unwrap();

    clone.zero_range(0, PAGE).unwrap();
    assert!(clone.reads_as_zero(0).unwrap());
    assert_eq!(read_byte(&clone, 0), 0);
    assert_eq!(read_byte(&obj, 0), 9);
    obj.debug_validate().unwrap();
}

#[test]
fn test_pin_unpin_balance() {
    let (ctx, pm) = setup(16);
    let obj = VmObject::create(&ctx, 3 * PAGE).unwrap();
    obj.commit_range(0, 2 * PAGE).unwrap();

    // The third page is not committed: nothing stays pinned.
    assert!(obj.pin_range(0, 3 * PAGE).is_err());
    assert_eq!(obj.pinned_count(), 0);
    assert_eq!(pm.stats().wired, 0);

    obj.pin_range(0, 2 * PAGE).unwrap();
    obj.pin_range(0, PAGE).unwrap();
    assert_eq!(obj.pinned_count(), 3);
    assert_eq!(pm.stats().wired, 2);
    assert_eq!(
        obj.resize(PAGE).unwrap_err().kind(),
        ErrorKind::BadState
    );

    obj.unpin_range(0, 2 * PAGE).unwrap();
    assert_eq!(pm.stats().wired, 1);
    obj.unpin_range(0, PAGE).unwrap();
    assert_eq!(pm.stats().wired, 0);
    assert_eq!(obj.pinned_count(), 0);
    assert!(obj.unpin_range(0, PAGE).is_err());
    obj.resize(PAGE).unwrap();
}

#[test]
fn test_slice_writes_reach_parent() {
    let (ctx, _pm) = setup(16);
    let obj = VmObject::create(&ctx, 4 * PAGE).unwrap();
    let slice = obj.create_child_slice(PAGE, 2 * PAGE).unwrap();
    slice.write(PAGE, &[3]).unwrap();
    assert_eq!(read_byte(&obj, 2 * PAGE), 3);
    assert_eq!(slice.attributed_pages(0, 2 * PAGE).unwrap(), 0);
    assert_eq!(obj.attributed_pages(0, 4 * PAGE).unwrap(), 1);
    assert_eq!(
        slice.read(2 * PAGE, &mut [0u8]).unwrap_err().kind(),
        ErrorKind::OutOfRange
    );
}

// ════════════════════════════════════════════════════════════
// Pager-Backed Objects
// ════════════════════════════════════════════════════════════

#[test]
fn test_pager_fault_wait_supply_retry() {
    let (ctx, pm) = setup(16);
    let pager = Arc::new(QueuedPager::default());
    let obj = VmObject::create_external(&ctx, 4 * PAGE, pager.clone()).unwrap();

    let request = match obj.get_page(2 * PAGE, FaultFlags::SW_FAULT) {
        Err(VmError::ShouldWait(request)) => request,
        other => panic!("expected ShouldWait, got {:?}", other),
    };
    assert!(request.is_pending());
    assert_eq!(*pager.requests.lock().unwrap(), vec![(2 * PAGE, PAGE)]);

    let page = pm.alloc_page().unwrap();
    pm.write(page, 0, b"from disk");
    assert_eq!(
        obj.supply_pages(2 * PAGE, PageSpliceList::from_pages(vec![page]))
            .unwrap(),
        1
    );
    assert!(request.wait().is_ok());
    assert_eq!(obj.outstanding_page_requests(), 0);

    let mut buf = [0u8; 9];
    obj.read(2 * PAGE, &mut buf).unwrap();
    assert_eq!(&buf, b"from disk");
    assert_eq!(obj.content_at(2 * PAGE).unwrap(), PageContent::Local(page));
    assert_eq!(obj.content_at(0).unwrap(), PageContent::PagerBacked);

    assert!(obj.evict_page(page, 2 * PAGE));
    assert_eq!(obj.eviction_event_count(), 1);
    assert_eq!(obj.content_at(2 * PAGE).unwrap(), PageContent::PagerBacked);
    assert_eq!(pm.in_use(), 0);
}

#[test]
fn test_pager_failure_reaches_waiter() {
    let (ctx, _pm) = setup(16);
    let obj =
        VmObject::create_external(&ctx, 2 * PAGE, Arc::new(QueuedPager::default())).unwrap();
    let request = match obj.get_page(PAGE, FaultFlags::WRITE | FaultFlags::SW_FAULT) {
        Err(VmError::ShouldWait(request)) => request,
        other => panic!("expected ShouldWait, got {:?}", other),
    };
    obj.fail_page_requests(PAGE, PAGE, ErrorKind::Io).unwrap();
    assert_eq!(request.wait().unwrap_err().kind(), ErrorKind::Io);
}

// ════════════════════════════════════════════════════════════
// Discardable Objects
// ════════════════════════════════════════════════════════════

#[test]
fn test_discardable_reclaimed_after_dwell() {
    let clock = Arc::new(ManualClock::new(0));
    let (ctx, pm) = VmContext::with_page_manager(
        VmConfig::new().with_total_pages(16),
        clock.clone(),
    );
    let dwell = ctx.config().discard_min_dwell_ns;
    let obj = VmObject::create_discardable(&ctx, 2 * PAGE).unwrap();
    assert_eq!(obj.discardable_state(), DiscardableState::Unreclaimable);
    obj.write(0, &[5]).unwrap();
    obj.write(PAGE, &[5]).unwrap();

    obj.unlock_discardable().unwrap();
    assert_eq!(obj.discardable_state(), DiscardableState::Reclaimable);
    assert_eq!(reclaim_discardable(&ctx, 8), 0);

    clock.advance(dwell);
    assert_eq!(reclaim_discardable(&ctx, 8), 2);
    assert_eq!(obj.discardable_state(), DiscardableState::Discarded);
    assert_eq!(pm.in_use(), 0);
    assert_eq!(
        obj.read(0, &mut [0u8]).unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        obj.try_lock_discardable().unwrap_err().kind(),
        ErrorKind::Unavailable
    );

    assert!(obj.lock_discardable().unwrap());
    assert_eq!(read_byte(&obj, 0), 0);
    assert_eq!(ctx.registry().stats().discarded_pages, 2);
}
