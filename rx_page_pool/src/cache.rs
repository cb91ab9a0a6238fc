// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-queue recycling cache with adaptive capacity.
//!
//! The cache is a bounded stack of recently released pages. Strict LIFO reuse
//! would keep retrying the most recently released page, which is also the one
//! most likely to still have references in flight; instead a rotating index
//! is swapped with the top before every check, spreading the freshness probe
//! across the whole cache with O(1) work per call.

use crate::PoolParams;
use crate::page::RxPage;
use std::time::Duration;
use std::time::Instant;

/// Multiple of the grace period applied to the shrink watch deadline right
/// after a grow, so a cache under enough pressure to extend is not immediately
/// considered for reduction.
const GROW_SETTLE_MULT: u32 = 16;

/// Ceiling on the graceful period's exponential backoff between shrinks.
const GRACE_BACKOFF_LIMIT_MULT: u32 = 16;

#[derive(Debug)]
pub(crate) enum Miss {
    Empty,
    Busy,
}

pub(crate) enum Rejected {
    Unsuitable(RxPage),
    Full(RxPage),
}

pub(crate) struct PageCache {
    slots: Vec<RxPage>,
    /// Current capacity. Always a power of two within
    /// `min_size..=max_size`.
    size: usize,
    /// Rotating index of the entry whose in-flight references are most likely
    /// to have drained.
    lrs: usize,
    min_size: usize,
    max_size: usize,
    numa_node: u32,
    reduce_wait_until: Instant,
    graceful_period: Duration,
    base_grace: Duration,
    successive_idle: u32,
    debounce: u32,
}

impl PageCache {
    pub(crate) fn new(params: &PoolParams, now: Instant) -> Self {
        let min_size = params.initial_size;
        let max_size = min_size << params.max_log_mult;
        Self {
            slots: Vec::with_capacity(min_size),
            size: min_size,
            lrs: 0,
            min_size,
            max_size,
            numa_node: params.numa_node,
            reduce_wait_until: now + params.reduce_grace_period,
            graceful_period: params.reduce_grace_period,
            base_grace: params.reduce_grace_period,
            successive_idle: 0,
            debounce: params.reduce_debounce_count,
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    /// Pops a reusable page, preferring entries whose references have already
    /// drained.
    ///
    /// The entry at the rotating index is swapped with the top of the stack
    /// and the index advanced (wrapping below the top); the entry now on top
    /// is popped only if nothing else references it. A busy top is reported
    /// as a miss and left in place for a later call to rotate past.
    pub(crate) fn try_get(&mut self) -> Result<RxPage, Miss> {
        let top = match self.slots.len().checked_sub(1) {
            Some(top) => top,
            None => return Err(Miss::Empty),
        };
        if self.lrs > top {
            self.lrs = 0;
        }
        self.slots.swap(top, self.lrs);
        self.lrs = if self.lrs >= top { 0 } else { self.lrs + 1 };

        if !self.slots[top].is_exclusively_free() {
            return Err(Miss::Busy);
        }
        let mut page = self.slots.pop().unwrap();
        page.elevate_if_low();
        Ok(page)
    }

    /// Stashes a released page for reuse.
    ///
    /// Refuses pages that must not be recycled (host-reserved memory, pages
    /// from another node) and, when full, pages that a grow cannot make room
    /// for. Rejected pages are handed back for the caller to free.
    pub(crate) fn put(&mut self, page: RxPage, now: Instant) -> Result<(), Rejected> {
        let backing = page.backing();
        if backing.is_reserved() || backing.numa_node() != self.numa_node {
            return Err(Rejected::Unsuitable(page));
        }
        if self.slots.len() >= self.size && !self.try_extend(now) {
            return Err(Rejected::Full(page));
        }
        self.slots.push(page);
        Ok(())
    }

    fn try_extend(&mut self, now: Instant) -> bool {
        if self.size >= self.max_size {
            return false;
        }
        self.size *= 2;
        self.slots.reserve(self.size - self.slots.len());
        // Growth means sustained pressure; push the shrink watch well out and
        // restart its backoff.
        self.graceful_period = self.base_grace;
        self.reduce_wait_until = now + self.base_grace * GROW_SETTLE_MULT;
        self.successive_idle = 0;
        tracing::debug!(size = self.size, "extended rx page cache");
        true
    }

    /// Evaluates the shrink condition.
    ///
    /// Returns `Some` when a shrink happened, carrying the entries that no
    /// longer fit; these still belong to in-flight history and must be drained
    /// through the deferred release path, not freed inline.
    pub(crate) fn check_reduce(&mut self, now: Instant) -> Option<Vec<RxPage>> {
        if self.size <= self.min_size || now < self.reduce_wait_until {
            return None;
        }
        // A busy top means the queue is still actively churning pages.
        if let Some(top) = self.slots.last() {
            if !top.is_exclusively_free() {
                self.successive_idle = 0;
                return None;
            }
        }
        self.successive_idle += 1;
        if self.successive_idle < self.debounce {
            return None;
        }
        self.successive_idle = 0;

        self.size /= 2;
        let excess = if self.slots.len() > self.size {
            self.slots.split_off(self.size)
        } else {
            Vec::new()
        };
        if self.lrs >= self.size {
            self.lrs = 0;
        }
        self.reduce_wait_until = now + self.graceful_period;
        if self.graceful_period < self.base_grace * GRACE_BACKOFF_LIMIT_MULT {
            self.graceful_period *= 2;
        }
        tracing::debug!(
            size = self.size,
            evicted = excess.len(),
            "reduced rx page cache"
        );
        Some(excess)
    }

    /// Empties the cache for teardown.
    pub(crate) fn drain_all(&mut self) -> Vec<RxPage> {
        self.lrs = 0;
        std::mem::take(&mut self.slots)
    }
}
