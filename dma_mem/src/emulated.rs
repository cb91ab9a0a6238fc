// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Emulated collaborators for exercising receive pools in tests.
//!
//! Every implementation counts the calls made against it, so tests can prove
//! lifecycle properties (each page unmapped and freed exactly once, no double
//! frees) and can inject the failure modes a pool must tolerate (allocation
//! failure, mapping failure, reserved and remote-node pages).

use crate::Clock;
use crate::DeferredTask;
use crate::DmaAddress;
use crate::DmaMapper;
use crate::DmaPage;
use crate::MapError;
use crate::OutOfPages;
use crate::PAGE_SIZE64;
use crate::PageAllocator;
use crate::TaskScheduler;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use std::time::Instant;

/// A counting page allocator with fault injection.
#[derive(Default)]
pub struct EmulatedPageAllocator {
    state: Mutex<AllocState>,
}

#[derive(Default)]
struct AllocState {
    next_pfn: u64,
    live: HashSet<u64>,
    allocated: u64,
    freed: u64,
    fail_allocs: u32,
    reserved_allocs: u32,
    remote_allocs: u32,
    remote_node: u32,
}

impl EmulatedPageAllocator {
    /// Creates an allocator with no pages outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` allocations with [`OutOfPages`].
    pub fn fail_next_allocs(&self, n: u32) {
        self.state.lock().fail_allocs = n;
    }

    /// Marks the next `n` allocated pages as host-reserved memory.
    pub fn reserve_next_allocs(&self, n: u32) {
        self.state.lock().reserved_allocs = n;
    }

    /// Satisfies the next `n` allocations from `node` regardless of the node
    /// requested.
    pub fn remote_next_allocs(&self, node: u32, n: u32) {
        let mut state = self.state.lock();
        state.remote_allocs = n;
        state.remote_node = node;
    }

    /// Total pages handed out.
    pub fn allocated(&self) -> u64 {
        self.state.lock().allocated
    }

    /// Total pages returned.
    pub fn freed(&self) -> u64 {
        self.state.lock().freed
    }

    /// Pages currently outstanding.
    pub fn live(&self) -> usize {
        self.state.lock().live.len()
    }
}

impl PageAllocator for EmulatedPageAllocator {
    fn alloc_page(&self, numa_node: u32) -> Result<DmaPage, OutOfPages> {
        let mut state = self.state.lock();
        if state.fail_allocs > 0 {
            state.fail_allocs -= 1;
            tracing::debug!("injecting page allocation failure");
            return Err(OutOfPages);
        }
        let pfn = state.next_pfn;
        state.next_pfn += 1;
        let reserved = if state.reserved_allocs > 0 {
            state.reserved_allocs -= 1;
            true
        } else {
            false
        };
        let node = if state.remote_allocs > 0 {
            state.remote_allocs -= 1;
            state.remote_node
        } else {
            numa_node
        };
        state.live.insert(pfn);
        state.allocated += 1;
        Ok(DmaPage::new(pfn, node, reserved))
    }

    fn free_page(&self, page: DmaPage) {
        let mut state = self.state.lock();
        assert!(
            state.live.remove(&page.pfn()),
            "double free of pfn {}",
            page.pfn()
        );
        state.freed += 1;
        page.ref_sub(1);
    }
}

/// A counting DMA mapper with fault injection.
#[derive(Default)]
pub struct EmulatedDmaMapper {
    state: Mutex<MapState>,
}

#[derive(Default)]
struct MapState {
    mapped: HashMap<u64, DmaAddress>,
    maps: u64,
    unmaps: u64,
    syncs: u64,
    fail_maps: u32,
}

impl EmulatedDmaMapper {
    /// Creates a mapper with no mappings outstanding.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next `n` mapping attempts.
    pub fn fail_next_maps(&self, n: u32) {
        self.state.lock().fail_maps = n;
    }

    /// Total mappings created.
    pub fn maps(&self) -> u64 {
        self.state.lock().maps
    }

    /// Total mappings torn down.
    pub fn unmaps(&self) -> u64 {
        self.state.lock().unmaps
    }

    /// Total device-ownership re-assertions.
    pub fn syncs(&self) -> u64 {
        self.state.lock().syncs
    }

    /// Mappings currently outstanding.
    pub fn active_mappings(&self) -> usize {
        self.state.lock().mapped.len()
    }
}

impl DmaMapper for EmulatedDmaMapper {
    fn map(&self, page: &DmaPage) -> Result<DmaAddress, MapError> {
        let mut state = self.state.lock();
        if state.fail_maps > 0 {
            state.fail_maps -= 1;
            tracing::debug!("injecting dma map failure");
            return Err(MapError(anyhow::anyhow!("emulated iommu exhausted")));
        }
        let addr = DmaAddress(0x8000_0000 + page.pfn() * PAGE_SIZE64);
        let prev = state.mapped.insert(page.pfn(), addr);
        assert!(prev.is_none(), "pfn {} mapped twice", page.pfn());
        state.maps += 1;
        Ok(addr)
    }

    fn unmap(&self, page: &DmaPage, addr: DmaAddress) {
        let mut state = self.state.lock();
        let mapped = state.mapped.remove(&page.pfn());
        assert_eq!(mapped, Some(addr), "unmap of pfn {} without mapping", page.pfn());
        state.unmaps += 1;
    }

    fn sync_for_device(&self, page: &DmaPage, addr: DmaAddress) {
        let mut state = self.state.lock();
        assert_eq!(
            state.mapped.get(&page.pfn()),
            Some(&addr),
            "sync of pfn {} without mapping",
            page.pfn()
        );
        state.syncs += 1;
    }
}

struct Scheduled {
    task: Arc<dyn DeferredTask>,
    due: Instant,
}

/// A scheduler that holds deferred tasks until the test pumps them with
/// [`ManualScheduler::run_due`] or [`ManualScheduler::run_all`].
#[derive(Default)]
pub struct ManualScheduler {
    queue: Mutex<Vec<Scheduled>>,
}

impl ManualScheduler {
    /// Creates an empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs every task whose delay has elapsed by `now`, returning the number
    /// run.
    pub fn run_due(&self, now: Instant) -> usize {
        let due: Vec<_> = {
            let mut queue = self.queue.lock();
            let (due, rest) = std::mem::take(&mut *queue)
                .into_iter()
                .partition(|entry| entry.due <= now);
            *queue = rest;
            due
        };
        // Run outside the lock; tasks may reschedule themselves.
        let n = due.len();
        for entry in due {
            entry.task.run();
        }
        n
    }

    /// Runs every pending task regardless of its due time.
    pub fn run_all(&self) -> usize {
        let due: Vec<_> = std::mem::take(&mut *self.queue.lock());
        let n = due.len();
        for entry in due {
            entry.task.run();
        }
        n
    }

    /// The number of tasks waiting to run.
    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }
}

impl TaskScheduler for ManualScheduler {
    fn schedule(&self, task: Arc<dyn DeferredTask>, delay: Duration) {
        let due = Instant::now() + delay;
        self.queue.lock().push(Scheduled { task, due });
    }

    fn cancel(&self, task: &Arc<dyn DeferredTask>) {
        self.queue
            .lock()
            .retain(|entry| !Arc::ptr_eq(&entry.task, task));
    }
}

/// A clock that only advances when the test tells it to.
#[derive(Clone)]
pub struct ManualClock {
    base: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl ManualClock {
    /// Creates a clock pinned at the current instant.
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Moves the clock forward by `delta`.
    pub fn advance(&self, delta: Duration) {
        *self.offset.lock() += delta;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    #[test]
    fn test_allocator_accounting() {
        let alloc = EmulatedPageAllocator::new();
        let a = alloc.alloc_page(0).unwrap();
        let b = alloc.alloc_page(0).unwrap();
        assert_eq!(alloc.allocated(), 2);
        assert_eq!(alloc.live(), 2);

        alloc.free_page(a);
        assert_eq!(alloc.freed(), 1);
        assert_eq!(alloc.live(), 1);
        alloc.free_page(b);
        assert_eq!(alloc.live(), 0);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_allocator_double_free() {
        let alloc = EmulatedPageAllocator::new();
        let a = alloc.alloc_page(0).unwrap();
        let dup = a.clone();
        a.ref_add(1);
        alloc.free_page(a);
        alloc.free_page(dup);
    }

    #[test]
    fn test_fault_injection() {
        let alloc = EmulatedPageAllocator::new();
        alloc.fail_next_allocs(1);
        assert!(alloc.alloc_page(0).is_err());
        assert!(alloc.alloc_page(0).is_ok());

        alloc.reserve_next_allocs(1);
        assert!(alloc.alloc_page(0).unwrap().is_reserved());

        alloc.remote_next_allocs(3, 1);
        assert_eq!(alloc.alloc_page(0).unwrap().numa_node(), 3);
        assert_eq!(alloc.alloc_page(0).unwrap().numa_node(), 0);
    }

    #[test]
    fn test_mapper_accounting() {
        let alloc = EmulatedPageAllocator::new();
        let mapper = EmulatedDmaMapper::new();
        let page = alloc.alloc_page(0).unwrap();

        let addr = mapper.map(&page).unwrap();
        mapper.sync_for_device(&page, addr);
        assert_eq!((mapper.maps(), mapper.syncs()), (1, 1));
        assert_eq!(mapper.active_mappings(), 1);

        mapper.unmap(&page, addr);
        assert_eq!(mapper.unmaps(), 1);
        assert_eq!(mapper.active_mappings(), 0);
        alloc.free_page(page);
    }

    struct CountingTask(AtomicUsize);

    impl DeferredTask for CountingTask {
        fn run(&self) {
            self.0.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_scheduler_run_and_cancel() {
        let sched = ManualScheduler::new();
        let task = Arc::new(CountingTask(AtomicUsize::new(0)));
        let dyn_task: Arc<dyn DeferredTask> = task.clone();

        sched.schedule(dyn_task.clone(), Duration::from_millis(10));
        assert_eq!(sched.pending(), 1);
        assert_eq!(sched.run_all(), 1);
        assert_eq!(task.0.load(Ordering::Relaxed), 1);

        sched.schedule(dyn_task.clone(), Duration::from_millis(10));
        sched.cancel(&dyn_task);
        assert_eq!(sched.pending(), 0);
        assert_eq!(sched.run_all(), 0);
        assert_eq!(task.0.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_manual_clock() {
        let clock = ManualClock::new();
        let start = clock.now();
        clock.advance(Duration::from_millis(500));
        assert_eq!(clock.now() - start, Duration::from_millis(500));
    }
}
