// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Ownership-biased handle to a DMA-mapped receive page.

use dma_mem::DmaAddress;
use dma_mem::DmaPage;

/// Ceiling for a page's bias: the number of references pre-added to the real
/// count so that descriptors can reference the page without touching the
/// atomic.
pub const PAGE_REF_ELEV: u32 = u16::MAX as u32;

/// Low-water mark on the real reference count below which a page is
/// re-elevated before being handed out again.
pub const PAGE_REF_THRESHOLD: u32 = (dma_mem::PAGE_SIZE / 64) as u32;

/// A DMA-mapped page owned by a receive pool.
///
/// Posting one descriptor per atomic reference-count operation is a measured
/// bottleneck at line rate, so the handle pre-pays a large block of references
/// ([`RxPage::elevate`]) and hands them out one at a time with a plain integer
/// decrement ([`RxPage::borrow`]). The consumer that took a buffer returns its
/// reference through [`DmaPage::put_ref`] on the backing page.
pub struct RxPage {
    page: DmaPage,
    dma_addr: DmaAddress,
    bias: u32,
}

impl RxPage {
    pub(crate) fn new(page: DmaPage, dma_addr: DmaAddress) -> Self {
        Self {
            page,
            dma_addr,
            bias: 0,
        }
    }

    /// The device-visible address of this page.
    pub fn dma_address(&self) -> DmaAddress {
        self.dma_addr
    }

    /// The backing host page.
    pub fn backing(&self) -> &DmaPage {
        &self.page
    }

    /// The number of pre-paid references not yet handed to a consumer.
    pub fn bias(&self) -> u32 {
        self.bias
    }

    /// Tops the bias up to [`PAGE_REF_ELEV`], adding the same amount to the
    /// real reference count in one atomic operation.
    pub fn elevate(&mut self) {
        let add = PAGE_REF_ELEV - self.bias;
        if add > 0 {
            self.page.ref_add(add);
            self.bias += add;
        }
    }

    /// Re-elevates if the real reference count has drained to the low-water
    /// mark, so a borrow can never find the bias empty.
    pub fn elevate_if_low(&mut self) {
        if self.page.ref_count() <= PAGE_REF_THRESHOLD {
            self.elevate();
        }
    }

    /// Transfers one pre-paid reference to a consumer: one more descriptor now
    /// points at this page. The consumer gives the reference back with
    /// [`DmaPage::put_ref`].
    pub fn borrow(&mut self) {
        debug_assert!(self.bias > 0, "page bias exhausted");
        if self.bias == 0 {
            // The elevate cadence should make this unreachable; take a real
            // reference so the consumer's release still balances.
            tracing::warn!(pfn = self.page.pfn(), "page bias exhausted");
            self.page.ref_add(1);
        } else {
            self.bias -= 1;
        }
    }

    /// True if no consumer currently references this page beyond the pool's
    /// own hold.
    ///
    /// The underlying count is read racily: a transient speculative reference
    /// makes a free page look busy (costing one reuse, which is harmless),
    /// never the reverse.
    pub fn is_exclusively_free(&self) -> bool {
        self.page.ref_count() == self.bias + 1
    }

    /// Drops every pre-paid reference. Called on the way to a real free.
    pub(crate) fn drop_bias(&mut self) {
        if self.bias > 0 {
            self.page.ref_sub(self.bias);
            self.bias = 0;
        }
    }

    pub(crate) fn into_backing(self) -> DmaPage {
        debug_assert_eq!(self.bias, 0, "freeing a page with live bias");
        self.page
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fresh_page(pfn: u64) -> RxPage {
        RxPage::new(DmaPage::new(pfn, 0, false), DmaAddress(pfn * 0x1000))
    }

    #[test]
    fn test_elevate_tops_up() {
        let mut page = fresh_page(1);
        assert_eq!(page.backing().ref_count(), 1);

        page.elevate();
        assert_eq!(page.bias(), PAGE_REF_ELEV);
        assert_eq!(page.backing().ref_count(), PAGE_REF_ELEV + 1);
        assert!(page.is_exclusively_free());
    }

    #[test]
    fn test_elevate_idempotent() {
        let mut page = fresh_page(1);
        page.elevate();
        let margin = page.backing().ref_count() - page.bias();
        page.elevate();
        assert_eq!(page.backing().ref_count() - page.bias(), margin);
        assert!(page.bias() <= PAGE_REF_ELEV);
    }

    #[test]
    fn test_borrow_and_consumer_release() {
        let mut page = fresh_page(1);
        page.elevate();

        let consumer = page.backing().clone();
        page.borrow();
        assert_eq!(page.bias(), PAGE_REF_ELEV - 1);
        assert!(!page.is_exclusively_free());

        consumer.put_ref();
        assert!(page.is_exclusively_free());

        // The true-free margin of one real reference always survives.
        assert!(page.backing().ref_count() >= page.bias() + 1);
    }

    #[test]
    fn test_elevate_if_low() {
        let mut page = fresh_page(1);
        page.elevate();

        // Drain borrows until the real count crosses the low-water mark.
        for _ in 0..(PAGE_REF_ELEV - PAGE_REF_THRESHOLD + 1) {
            let consumer = page.backing().clone();
            page.borrow();
            consumer.put_ref();
        }
        assert!(page.backing().ref_count() <= PAGE_REF_THRESHOLD);

        page.elevate_if_low();
        assert_eq!(page.bias(), PAGE_REF_ELEV);
        assert!(page.is_exclusively_free());
    }

    #[test]
    fn test_drop_bias() {
        let mut page = fresh_page(1);
        page.elevate();
        page.drop_bias();
        assert_eq!(page.bias(), 0);
        assert_eq!(page.backing().ref_count(), 1);
    }
}
