// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Deferred release of pages evicted by a cache shrink.
//!
//! A shrink cannot free its evicted pages inline: the completion path that
//! triggered it must stay non-blocking, and an evicted page may still carry
//! in-flight references. Evictions are parked here and drained by a deferred
//! task. The list and the in-progress flag are the only state shared with
//! that task; everything else in the pool stays single-owner.

use crate::page::RxPage;
use dma_mem::DeferredTask;
use dma_mem::DmaMapper;
use dma_mem::PageAllocator;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

pub(crate) struct PendingShrink {
    pages: Mutex<Vec<RxPage>>,
    reduce_pending: AtomicBool,
}

impl PendingShrink {
    pub(crate) fn new() -> Self {
        Self {
            pages: Mutex::new(Vec::new()),
            reduce_pending: AtomicBool::new(false),
        }
    }

    pub(crate) fn is_reduce_pending(&self) -> bool {
        self.reduce_pending.load(Ordering::Acquire)
    }

    pub(crate) fn stash(&self, pages: Vec<RxPage>) {
        debug_assert!(!pages.is_empty());
        self.pages.lock().extend(pages);
        self.reduce_pending.store(true, Ordering::Release);
    }

    pub(crate) fn take(&self) -> Vec<RxPage> {
        std::mem::take(&mut *self.pages.lock())
    }

    pub(crate) fn clear_flag(&self) {
        self.reduce_pending.store(false, Ordering::Release);
    }
}

/// Unmaps a page, returns its pre-paid references, and gives it back to the
/// host allocator. The single authority for taking a page out of service.
pub(crate) fn release_page(
    mapper: &dyn DmaMapper,
    allocator: &dyn PageAllocator,
    mut page: RxPage,
) {
    let addr = page.dma_address();
    mapper.unmap(page.backing(), addr);
    page.drop_bias();
    allocator.free_page(page.into_backing());
}

/// The deferred drain. Runs in a worker context and may block on unmap; the
/// completion path never waits on it.
pub(crate) struct ReduceTask {
    pending: Arc<PendingShrink>,
    allocator: Arc<dyn PageAllocator>,
    mapper: Arc<dyn DmaMapper>,
    released: AtomicU64,
}

impl ReduceTask {
    pub(crate) fn new(
        pending: Arc<PendingShrink>,
        allocator: Arc<dyn PageAllocator>,
        mapper: Arc<dyn DmaMapper>,
    ) -> Self {
        Self {
            pending,
            allocator,
            mapper,
            released: AtomicU64::new(0),
        }
    }

    pub(crate) fn released(&self) -> u64 {
        self.released.load(Ordering::Relaxed)
    }
}

impl DeferredTask for ReduceTask {
    fn run(&self) {
        if !self.pending.is_reduce_pending() {
            // Cancelled: the cache re-grew and reclaimed the entries.
            return;
        }
        let pages = self.pending.take();
        let count = pages.len() as u64;
        for page in pages {
            release_page(self.mapper.as_ref(), self.allocator.as_ref(), page);
        }
        self.released.fetch_add(count, Ordering::Relaxed);
        self.pending.clear_flag();
    }
}
