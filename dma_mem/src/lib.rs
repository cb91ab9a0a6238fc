// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Traits and types for sharing host page memory with a receive datapath
//! device.
//!
//! A receive pool posts page-sized buffers to a device and recycles them as
//! completions drain. This crate defines the collaborator surface such a pool
//! consumes: a host page allocator, a DMA mapping service, a deferred task
//! scheduler, and a monotonic clock. The [`emulated`] module provides counting
//! implementations of all of them for driving pools in tests.

#![warn(missing_docs)]
#![forbid(unsafe_code)]

pub mod emulated;

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::AtomicU32;
use std::sync::atomic::Ordering;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// The 4KB page size used by receive pools.
pub const PAGE_SIZE: usize = 4096;
/// [`PAGE_SIZE`] as a u32.
pub const PAGE_SIZE32: u32 = 4096;
/// [`PAGE_SIZE`] as a u64.
pub const PAGE_SIZE64: u64 = PAGE_SIZE as u64;

/// A bus address produced by a [`DmaMapper`], used to refer to a page when
/// communicating with the device.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct DmaAddress(pub u64);

#[derive(Debug)]
struct PageInner {
    pfn: u64,
    node: u32,
    reserved: bool,
    refs: AtomicU32,
}

/// A handle to one host-allocated 4KB page.
///
/// The handle carries the page's real reference count. Consumers outside the
/// pool (the packet-processing stack) hold clones of this handle and drop
/// their reference with [`DmaPage::put_ref`]; the pool itself manipulates the
/// count in bulk via [`DmaPage::ref_add`] and [`DmaPage::ref_sub`]. The count
/// is the only state shared across contexts, so it is the only atomic here.
#[derive(Clone)]
pub struct DmaPage {
    inner: Arc<PageInner>,
}

impl DmaPage {
    /// Creates a page handle with a reference count of one, held by the
    /// caller. Only [`PageAllocator`] implementations should create pages.
    pub fn new(pfn: u64, node: u32, reserved: bool) -> Self {
        Self {
            inner: Arc::new(PageInner {
                pfn,
                node,
                reserved,
                refs: AtomicU32::new(1),
            }),
        }
    }

    /// The page frame number identifying this page to the host allocator.
    pub fn pfn(&self) -> u64 {
        self.inner.pfn
    }

    /// The NUMA node the page was allocated from.
    pub fn numa_node(&self) -> u32 {
        self.inner.node
    }

    /// True if the host flagged this page as reserved memory (allocated from
    /// emergency reserves under pressure). Such pages must not be recycled.
    pub fn is_reserved(&self) -> bool {
        self.inner.reserved
    }

    /// The current reference count.
    ///
    /// Concurrent speculative references can make this read stale the moment
    /// it returns; callers must only use it in ways where an overestimate is
    /// harmless.
    pub fn ref_count(&self) -> u32 {
        self.inner.refs.load(Ordering::Acquire)
    }

    /// Adds `n` references in a single atomic operation.
    pub fn ref_add(&self, n: u32) {
        self.inner.refs.fetch_add(n, Ordering::Relaxed);
    }

    /// Drops `n` references in a single atomic operation.
    pub fn ref_sub(&self, n: u32) {
        let prev = self.inner.refs.fetch_sub(n, Ordering::Release);
        debug_assert!(prev >= n, "page reference count underflow");
    }

    /// Drops a single reference. This is the consumer-side release, called by
    /// the packet-processing stack when it is done with a buffer it was
    /// handed.
    pub fn put_ref(&self) {
        self.ref_sub(1);
    }
}

impl Debug for DmaPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DmaPage")
            .field("pfn", &self.inner.pfn)
            .field("node", &self.inner.node)
            .field("reserved", &self.inner.reserved)
            .field("refs", &self.ref_count())
            .finish()
    }
}

/// Error returned when the host allocator has no pages available.
#[derive(Debug, Error)]
#[error("no pages available from the host allocator")]
pub struct OutOfPages;

/// Error returned when a page cannot be mapped for device access.
#[derive(Debug, Error)]
#[error("failed to create dma mapping")]
pub struct MapError(#[source] pub anyhow::Error);

/// A host page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocates one page, preferably on `numa_node`.
    fn alloc_page(&self, numa_node: u32) -> Result<DmaPage, OutOfPages>;

    /// Returns the caller's reference on `page` to the allocator. The backing
    /// storage is reclaimed once every outstanding consumer reference has
    /// also been dropped.
    fn free_page(&self, page: DmaPage);
}

/// A DMA mapping service for making pages visible to the device.
pub trait DmaMapper: Send + Sync {
    /// Maps `page` for device access.
    fn map(&self, page: &DmaPage) -> Result<DmaAddress, MapError>;

    /// Tears down the mapping previously returned for `page`.
    fn unmap(&self, page: &DmaPage, addr: DmaAddress);

    /// Re-asserts device ownership of a mapping that is being reused without
    /// a fresh [`DmaMapper::map`] call.
    fn sync_for_device(&self, page: &DmaPage, addr: DmaAddress);
}

/// A unit of deferred work.
pub trait DeferredTask: Send + Sync {
    /// Runs the task. Unlike the context that scheduled it, the task may
    /// block.
    fn run(&self);
}

/// A scheduler for deferred work.
///
/// `schedule` and `cancel` are called from completion-processing contexts and
/// must not block.
pub trait TaskScheduler: Send + Sync {
    /// Requests that `task` run after at least `delay` has elapsed.
    fn schedule(&self, task: Arc<dyn DeferredTask>, delay: Duration);

    /// Cancels any pending run of `task`. A task that has already started is
    /// not interrupted.
    fn cancel(&self, task: &Arc<dyn DeferredTask>);
}

/// A monotonic clock.
pub trait Clock: Send + Sync {
    /// The current instant.
    fn now(&self) -> Instant;
}

/// [`Clock`] backed by the OS monotonic clock.
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_ref_ops() {
        let page = DmaPage::new(3, 0, false);
        assert_eq!(page.ref_count(), 1);

        page.ref_add(100);
        assert_eq!(page.ref_count(), 101);

        let consumer = page.clone();
        consumer.put_ref();
        assert_eq!(page.ref_count(), 100);

        page.ref_sub(99);
        assert_eq!(page.ref_count(), 1);
    }

    #[test]
    fn test_page_flags() {
        let page = DmaPage::new(7, 2, true);
        assert_eq!(page.pfn(), 7);
        assert_eq!(page.numa_node(), 2);
        assert!(page.is_reserved());
    }
}
