//! Thread-local pointer pools.
//!
//! A pool caches free slot addresses of exactly one open page, so the
//! allocation fast path is a plain `Vec` pop with no atomic traffic.

use std::sync::atomic::{Ordering, fence};

use crate::page::{Page, RESERVED, UNUSED};

/// Free-slot cache owned by one thread, bounded by one page's capacity.
pub struct PointerPool {
    slots: Vec<*mut u8>,
    page: *mut Page,
}

impl PointerPool {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            page: std::ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Pops one cached address. O(1).
    #[inline]
    pub fn pop(&mut self) -> Option<*mut u8> {
        self.slots.pop()
    }

    /// Claims every `Unused` slot of `page` into the pool. Claims race
    /// against the collector returning slots, so each one is a CAS.
    pub fn fill(&mut self, page: *mut Page) {
        debug_assert!(self.slots.is_empty());
        // SAFETY: page was popped from the shared buffer and is live
        let p = unsafe { &*page };
        self.slots.reserve(p.capacity);
        for index in 0..p.capacity {
            if p.states[index]
                .compare_exchange(UNUSED, RESERVED, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                // SAFETY: index < capacity
                self.slots.push(unsafe { p.slot(index) });
            }
        }
        self.page = page;
    }

    /// Takes the full capacity of a page nobody else has seen yet.
    pub fn fill_fresh(&mut self, page: *mut Page) {
        debug_assert!(self.slots.is_empty());
        // SAFETY: page is unpublished and exclusively ours
        let p = unsafe { &*page };
        self.slots.reserve(p.capacity);
        for index in 0..p.capacity {
            p.states[index].store(RESERVED, Ordering::Relaxed);
            // SAFETY: index < capacity
            self.slots.push(unsafe { p.slot(index) });
        }
        self.page = page;
    }
}

impl Drop for PointerPool {
    fn drop(&mut self) {
        if self.page.is_null() || self.slots.is_empty() {
            return;
        }
        // SAFETY: reserved slots keep the page alive
        let p = unsafe { &*self.page };
        for &ptr in &self.slots {
            let index = p.index_of(ptr);
            p.states[index].store(UNUSED, Ordering::Relaxed);
        }
        // The collector must observe these frees ordered before any state
        // it reads afterwards.
        fence(Ordering::Release);
    }
}
