// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Receive page lifecycle management for a queue-based datapath device.
//!
//! A receive queue posts page-sized buffers to its device faster than any
//! general-purpose allocator can turn them around, and most pages come back
//! from the completion path almost immediately. [`RxPagePool`] exploits that:
//! released pages park in a per-queue recycling cache and are re-posted
//! without a fresh allocation or DMA mapping, reference counting on the hot
//! path is amortized through a pre-paid bias on each page, and the cache
//! capacity adapts to the workload (doubling under sustained pressure,
//! halving back after a graceful idle period, with evictions drained by a
//! deferred task).
//!
//! One pool serves one queue. All pool methods take `&mut self` and are meant
//! to be called from that queue's completion-processing context; none of them
//! block. Failure to allocate is the datapath's backpressure signal, not a
//! fault: the caller stops posting descriptors and retries on a later pass.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

mod cache;
mod page;
mod reduce;

pub use page::PAGE_REF_ELEV;
pub use page::PAGE_REF_THRESHOLD;
pub use page::RxPage;

use cache::Miss;
use cache::PageCache;
use cache::Rejected;
use dma_mem::Clock;
use dma_mem::DeferredTask;
use dma_mem::DmaMapper;
use dma_mem::PageAllocator;
use dma_mem::TaskScheduler;
use reduce::PendingShrink;
use reduce::ReduceTask;
use reduce::release_page;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Smallest cache capacity a pool will be configured with.
pub const MIN_CACHE_SIZE: usize = 8;

/// Error returned when no page can be produced for a new descriptor.
///
/// This is the receive path's admission control: the caller stops posting and
/// retries later. It is expected under load and never fatal.
#[derive(Debug, Error)]
#[error("out of receive buffer memory")]
pub struct OutOfMemory;

/// Tuning for an [`RxPagePool`].
#[derive(Debug, Clone)]
pub struct PoolParams {
    /// Initial (and minimum) cache capacity, in pages. Rounded up to a power
    /// of two, floor [`MIN_CACHE_SIZE`].
    pub initial_size: usize,
    /// log2 of the growth ceiling relative to `initial_size`.
    pub max_log_mult: u32,
    /// Idle time required before the cache becomes a shrink candidate. The
    /// effective period backs off exponentially across repeated shrinks.
    pub reduce_grace_period: Duration,
    /// Consecutive qualifying idle checks required before a shrink happens.
    pub reduce_debounce_count: u32,
    /// Delay before the deferred drain of evicted pages runs.
    pub reduce_delay: Duration,
    /// Node this queue's pages should come from; pages from other nodes are
    /// not recycled.
    pub numa_node: u32,
}

impl Default for PoolParams {
    fn default() -> Self {
        Self {
            initial_size: 128,
            max_log_mult: 2,
            reduce_grace_period: Duration::from_millis(1000),
            reduce_debounce_count: 5,
            reduce_delay: Duration::from_millis(200),
            numa_node: 0,
        }
    }
}

impl PoolParams {
    /// Derives parameters for a queue of `depth` descriptors: the cache
    /// starts sized to hold the queue's working set.
    pub fn for_queue_depth(depth: usize) -> Self {
        Self {
            initial_size: depth,
            ..Self::default()
        }
    }

    fn validated(mut self) -> Self {
        self.initial_size = self.initial_size.next_power_of_two().max(MIN_CACHE_SIZE);
        self.max_log_mult = self.max_log_mult.min(8);
        self.reduce_debounce_count = self.reduce_debounce_count.max(1);
        self
    }
}

/// Counters tracking pool behavior. Monotonic over the pool's lifetime.
#[derive(Debug, Default, Clone, Copy)]
pub struct PoolStats {
    /// Allocations satisfied from the cache.
    pub cache_reuse: u64,
    /// Allocations that found the cache empty.
    pub cache_empty: u64,
    /// Allocations that found the probed entry still referenced.
    pub cache_busy: u64,
    /// Releases that found the cache full at its growth ceiling.
    pub cache_full: u64,
    /// Releases of pages unsuitable for recycling (reserved or remote-node).
    pub cache_waive: u64,
    /// Times the cache doubled.
    pub cache_extend: u64,
    /// Times the cache halved.
    pub cache_reduce: u64,
    /// Pages released through the deferred drain.
    pub deferred_releases: u64,
    /// Host page allocation failures.
    pub alloc_failures: u64,
    /// DMA mapping failures.
    pub map_failures: u64,
}

/// A per-queue receive page pool.
///
/// Obtain pages with [`RxPagePool::allocate`], hand fragments to consumers
/// with [`RxPage::borrow`], and return pages with [`RxPagePool::release`].
/// Call [`RxPagePool::maybe_shrink`] opportunistically (once per completion
/// batch is the intended cadence) to let the capacity controller run without
/// a dedicated timer.
pub struct RxPagePool {
    allocator: Arc<dyn PageAllocator>,
    mapper: Arc<dyn DmaMapper>,
    scheduler: Arc<dyn TaskScheduler>,
    clock: Arc<dyn Clock>,
    params: PoolParams,
    cache: PageCache,
    pending: Arc<PendingShrink>,
    reduce_task: Arc<ReduceTask>,
    stats: PoolStats,
    shutdown: bool,
}

impl RxPagePool {
    /// Creates a pool over the given collaborators.
    pub fn new(
        params: PoolParams,
        allocator: Arc<dyn PageAllocator>,
        mapper: Arc<dyn DmaMapper>,
        scheduler: Arc<dyn TaskScheduler>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let params = params.validated();
        let pending = Arc::new(PendingShrink::new());
        let reduce_task = Arc::new(ReduceTask::new(
            pending.clone(),
            allocator.clone(),
            mapper.clone(),
        ));
        let cache = PageCache::new(&params, clock.now());
        Self {
            allocator,
            mapper,
            scheduler,
            clock,
            params,
            cache,
            pending,
            reduce_task,
            stats: PoolStats::default(),
            shutdown: false,
        }
    }

    /// Produces a page ready to post in a new descriptor.
    ///
    /// Tries the recycling cache first; a recycled page keeps its existing
    /// DMA mapping and only has device ownership re-asserted. On a miss, a
    /// fresh page is allocated, mapped, and elevated. [`OutOfMemory`] is the
    /// backpressure signal; the caller stops posting and retries later.
    pub fn allocate(&mut self) -> Result<RxPage, OutOfMemory> {
        if self.shutdown {
            return Err(OutOfMemory);
        }
        match self.cache.try_get() {
            Ok(page) => {
                self.stats.cache_reuse += 1;
                self.mapper.sync_for_device(page.backing(), page.dma_address());
                Ok(page)
            }
            Err(miss) => {
                match miss {
                    Miss::Empty => self.stats.cache_empty += 1,
                    Miss::Busy => self.stats.cache_busy += 1,
                }
                self.allocate_fresh()
            }
        }
    }

    fn allocate_fresh(&mut self) -> Result<RxPage, OutOfMemory> {
        let page = match self.allocator.alloc_page(self.params.numa_node) {
            Ok(page) => page,
            Err(err) => {
                self.stats.alloc_failures += 1;
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "rx page allocation failed"
                );
                return Err(OutOfMemory);
            }
        };
        let addr = match self.mapper.map(&page) {
            Ok(addr) => addr,
            Err(err) => {
                self.stats.map_failures += 1;
                tracing::warn!(
                    error = &err as &dyn std::error::Error,
                    pfn = page.pfn(),
                    "rx page mapping failed"
                );
                self.allocator.free_page(page);
                return Err(OutOfMemory);
            }
        };
        let mut page = RxPage::new(page, addr);
        page.elevate();
        Ok(page)
    }

    /// Returns a page from the completion path.
    ///
    /// With `recyclable`, the page is stashed for reuse when suitable; the
    /// cache grows here if it is full and still under its ceiling. Otherwise
    /// (and for pages the cache refuses) the page is unmapped and freed.
    pub fn release(&mut self, page: RxPage, recyclable: bool) {
        if !recyclable || self.shutdown {
            self.free_now(page);
            return;
        }
        let now = self.clock.now();
        let size_before = self.cache.size();
        match self.cache.put(page, now) {
            Ok(()) => {
                if self.cache.size() > size_before {
                    self.stats.cache_extend += 1;
                    self.reclaim_pending();
                }
            }
            Err(Rejected::Unsuitable(page)) => {
                self.stats.cache_waive += 1;
                self.free_now(page);
            }
            Err(Rejected::Full(page)) => {
                self.stats.cache_full += 1;
                self.free_now(page);
            }
        }
    }

    /// Lets the capacity controller evaluate the shrink condition. Intended
    /// to be called opportunistically after each completion batch.
    pub fn maybe_shrink(&mut self) {
        if self.shutdown || self.pending.is_reduce_pending() {
            return;
        }
        if let Some(excess) = self.cache.check_reduce(self.clock.now()) {
            self.stats.cache_reduce += 1;
            if !excess.is_empty() {
                self.pending.stash(excess);
                self.scheduler
                    .schedule(self.reduce_task.clone(), self.params.reduce_delay);
            }
        }
    }

    /// A snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        let mut stats = self.stats;
        stats.deferred_releases = self.reduce_task.released();
        stats
    }

    /// The cache's current capacity, in pages.
    pub fn cache_size(&self) -> usize {
        self.cache.size()
    }

    /// The number of pages currently parked in the cache.
    pub fn cached_pages(&self) -> usize {
        self.cache.len()
    }

    /// Takes the pool out of service.
    ///
    /// Cancels any scheduled drain, then unconditionally unmaps and frees
    /// every page the cache and the pending-release list still hold. The
    /// surrounding queue-shutdown protocol guarantees no descriptors are in
    /// flight by the time this runs. Subsequent [`RxPagePool::allocate`]
    /// calls fail.
    pub fn teardown(&mut self) {
        if self.shutdown {
            return;
        }
        self.shutdown = true;
        let task: Arc<dyn DeferredTask> = self.reduce_task.clone();
        self.scheduler.cancel(&task);
        for page in self.pending.take() {
            self.free_now(page);
        }
        self.pending.clear_flag();
        for page in self.cache.drain_all() {
            self.free_now(page);
        }
    }

    fn free_now(&self, page: RxPage) {
        release_page(self.mapper.as_ref(), self.allocator.as_ref(), page);
    }

    /// A grow while a drain is still queued means the pressure came back:
    /// cancel the drain and give the evicted pages to the enlarged cache.
    fn reclaim_pending(&mut self) {
        if !self.pending.is_reduce_pending() {
            return;
        }
        let task: Arc<dyn DeferredTask> = self.reduce_task.clone();
        self.scheduler.cancel(&task);
        let now = self.clock.now();
        for page in self.pending.take() {
            match self.cache.put(page, now) {
                Ok(()) => {}
                Err(Rejected::Unsuitable(page)) | Err(Rejected::Full(page)) => {
                    self.free_now(page);
                }
            }
        }
        self.pending.clear_flag();
    }
}

impl Drop for RxPagePool {
    fn drop(&mut self) {
        self.teardown();
    }
}
