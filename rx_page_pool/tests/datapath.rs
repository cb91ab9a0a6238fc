// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Exercises a receive pool the way a queue's completion loop does: keep the
//! ring full, hand completed buffers to consumers that release them late, and
//! let the capacity controller react to the pressure swings.

use dma_mem::DmaPage;
use dma_mem::emulated::EmulatedDmaMapper;
use dma_mem::emulated::EmulatedPageAllocator;
use dma_mem::emulated::ManualClock;
use dma_mem::emulated::ManualScheduler;
use rx_page_pool::PoolParams;
use rx_page_pool::RxPage;
use rx_page_pool::RxPagePool;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

const QUEUE_DEPTH: usize = 32;
const COMPLETION_BATCH: usize = 8;

struct Harness {
    pool: RxPagePool,
    allocator: Arc<EmulatedPageAllocator>,
    mapper: Arc<EmulatedDmaMapper>,
    scheduler: Arc<ManualScheduler>,
    clock: ManualClock,
}

fn harness() -> Harness {
    let allocator = Arc::new(EmulatedPageAllocator::new());
    let mapper = Arc::new(EmulatedDmaMapper::new());
    let scheduler = Arc::new(ManualScheduler::new());
    let clock = ManualClock::new();
    let params = PoolParams {
        reduce_grace_period: Duration::from_millis(100),
        reduce_debounce_count: 3,
        ..PoolParams::for_queue_depth(QUEUE_DEPTH)
    };
    let pool = RxPagePool::new(
        params,
        allocator.clone(),
        mapper.clone(),
        scheduler.clone(),
        Arc::new(clock.clone()),
    );
    Harness {
        pool,
        allocator,
        mapper,
        scheduler,
        clock,
    }
}

#[test]
fn test_descriptor_loop() {
    let mut h = harness();
    let mut posted: VecDeque<RxPage> = VecDeque::new();
    let mut consumers: VecDeque<DmaPage> = VecDeque::new();
    let mut outstanding: HashSet<u64> = HashSet::new();

    for cycle in 0..2000usize {
        // Keep the ring full. An allocation failure would just stop the loop
        // early; with the emulated allocator it never fires here.
        while posted.len() < QUEUE_DEPTH {
            let page = h.pool.allocate().unwrap();
            // A page handed out is never handed out again before release.
            assert!(
                outstanding.insert(page.backing().pfn()),
                "page owned twice at cycle {cycle}"
            );
            posted.push_back(page);
        }

        // Complete a batch: each buffer goes up the stack (one borrowed
        // reference) and its page goes back to the pool.
        for _ in 0..COMPLETION_BATCH {
            let mut page = posted.pop_front().unwrap();
            page.borrow();
            consumers.push_back(page.backing().clone());
            assert!(outstanding.remove(&page.backing().pfn()));
            let recyclable = cycle % 101 != 0;
            h.pool.release(page, recyclable);
        }

        // Consumers hold their buffers for a while before letting go, so the
        // cache regularly sees pages that are still in flight.
        while consumers.len() > 2 * COMPLETION_BATCH {
            consumers.pop_front().unwrap().put_ref();
        }

        h.pool.maybe_shrink();
        if cycle % 50 == 0 {
            h.clock.advance(Duration::from_millis(250));
            h.scheduler.run_all();
        }

        let size = h.pool.cache_size();
        assert!(size.is_power_of_two());
        assert!((QUEUE_DEPTH..=QUEUE_DEPTH << 2).contains(&size));
        assert!(h.pool.cached_pages() <= size);
    }

    let stats = h.pool.stats();
    assert!(stats.cache_reuse > 0, "recycling never happened");
    assert_eq!(stats.alloc_failures, 0);
    assert_eq!(stats.map_failures, 0);

    // Quiesce: the stack lets go of everything, the ring drains.
    for consumer in consumers.drain(..) {
        consumer.put_ref();
    }
    for page in posted.drain(..) {
        h.pool.release(page, true);
    }
    h.scheduler.run_all();
    h.pool.teardown();

    assert_eq!(h.allocator.live(), 0);
    assert_eq!(h.allocator.allocated(), h.allocator.freed());
    assert_eq!(h.mapper.maps(), h.mapper.unmaps());
    assert_eq!(h.mapper.active_mappings(), 0);
    assert_eq!(h.scheduler.pending(), 0);
}

#[test]
fn test_idle_queue_converges_down() {
    let mut h = harness();

    // A burst grows the cache to its ceiling.
    let pages: Vec<_> = (0..QUEUE_DEPTH * 4 + 1)
        .map(|_| h.pool.allocate().unwrap())
        .collect();
    for page in pages {
        h.pool.release(page, true);
    }
    assert_eq!(h.pool.cache_size(), QUEUE_DEPTH * 4);
    assert!(h.pool.stats().cache_full >= 1);

    // Then the queue goes idle and the controller walks the size back to the
    // minimum, one graceful period at a time.
    for _ in 0..200 {
        h.clock.advance(Duration::from_secs(60));
        h.pool.maybe_shrink();
        h.scheduler.run_all();
    }
    assert_eq!(h.pool.cache_size(), QUEUE_DEPTH);
    assert_eq!(h.pool.cached_pages(), QUEUE_DEPTH);

    let stats = h.pool.stats();
    assert!(stats.cache_reduce >= 2);
    assert!(stats.deferred_releases > 0);

    h.pool.teardown();
    assert_eq!(h.allocator.live(), 0);
    assert_eq!(h.mapper.maps(), h.mapper.unmaps());
}
