//! Per-thread small-object allocation and page reclamation.
//!
//! Mutators allocate through thread-local pools, refill from the per-type
//! recyclable buffer under a short spinlock, and fall back to building a
//! fresh page over a new block. Fresh pages are published into the global
//! discovery list so the collector can find them; the list is append-only
//! for mutators and pruned only by the collector.

use std::{
    cell::RefCell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering, fence},
};

use log::trace;

use crate::{
    block::{BLOCKS, Block},
    metadata::Metadata,
    page::Page,
    pool::PointerPool,
};

pub use crate::block::AllocError;

/// Global discovery list: every live page, linked through `Page::next`.
static PAGES: AtomicPtr<Page> = AtomicPtr::new(ptr::null_mut());

thread_local! {
    static POOLS: RefCell<Vec<Option<PointerPool>>> = const { RefCell::new(Vec::new()) };
}

/// Head of the discovery list. Collector only.
pub(crate) fn pages_head() -> *mut Page {
    PAGES.load(Ordering::Acquire)
}

/// Returns one `Reserved` slot for `meta`. O(1) amortized.
pub(crate) fn alloc_slot(meta: &'static Metadata) -> Result<NonNull<u8>, AllocError> {
    POOLS.with(|cell| {
        let mut pools = cell.borrow_mut();
        let index = meta.id as usize;
        if pools.len() <= index {
            pools.resize_with(index + 1, || None);
        }
        let pool = pools[index].get_or_insert_with(PointerPool::new);
        loop {
            if let Some(ptr) = pool.pop() {
                // SAFETY: pools hold only non-null slot addresses
                return Ok(unsafe { NonNull::new_unchecked(ptr) });
            }
            refill(pool, meta)?;
        }
    })
}

fn refill(pool: &mut PointerPool, meta: &'static Metadata) -> Result<(), AllocError> {
    loop {
        let page = meta.empty_pages.pop();
        if page.is_null() {
            break;
        }
        // SAFETY: popped exclusively from the shared buffer
        unsafe { &*page }.on_empty_list.store(false, Ordering::Release);
        pool.fill(page);
        if !pool.is_empty() {
            return Ok(());
        }
    }

    let block = BLOCKS.alloc()?;
    let page = Page::new(block, meta);
    pool.fill_fresh(page);
    publish_page(page);
    // SAFETY: page was built above
    trace!(
        "published fresh page for {} ({} slots)",
        meta.name,
        unsafe { &*page }.capacity
    );
    Ok(())
}

/// Lock-free append to the discovery list head.
fn publish_page(page: *mut Page) {
    let mut head = PAGES.load(Ordering::Acquire);
    loop {
        // SAFETY: page is ours until the exchange succeeds
        unsafe { &*page }.next.store(head, Ordering::Relaxed);
        match PAGES.compare_exchange_weak(head, page, Ordering::Release, Ordering::Relaxed) {
            Ok(_) => return,
            Err(new_head) => head = new_head,
        }
    }
}

/// Unlinks `page` from the discovery list. Collector only: mutators push
/// at the head, so removal of interior nodes is plain, and head removal
/// retries against concurrent pushes.
fn unlink_page(page: *mut Page) -> bool {
    'restart: loop {
        let mut prev: *mut Page = ptr::null_mut();
        let mut cur = PAGES.load(Ordering::Acquire);
        while !cur.is_null() {
            // SAFETY: discovery-list pages are live
            let next = unsafe { &*cur }.next.load(Ordering::Acquire);
            if cur == page {
                if prev.is_null() {
                    if PAGES
                        .compare_exchange(cur, next, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return true;
                    }
                    continue 'restart;
                }
                // SAFETY: prev is live and only the collector rewrites links
                unsafe { &*prev }.next.store(next, Ordering::Release);
                return true;
            }
            prev = cur;
            cur = next;
        }
        return false;
    }
}

/// Partitions a `next_empty`-linked worklist into fully-unused pages and
/// the rest. Collector only.
fn remove_empty(list: *mut Page) -> (*mut Page, *mut Page) {
    let mut empty: *mut Page = ptr::null_mut();
    let mut rest: *mut Page = ptr::null_mut();
    let mut cur = list;
    while !cur.is_null() {
        // SAFETY: worklist pages are live and privately owned here
        let page = unsafe { &*cur };
        let next = page.next_empty.load(Ordering::Relaxed);
        let target = if page.is_empty() { &mut empty } else { &mut rest };
        page.next_empty.store(*target, Ordering::Relaxed);
        *target = cur;
        cur = next;
    }
    fence(Ordering::Release);
    (empty, rest)
}

/// Two-pass reclamation of `worklist` for one type.
///
/// Each pass pulls out the pages found fully unused, then exchanges the
/// remaining worklist with the shared recyclable buffer under its
/// spinlock. The round-trip through the buffer gives any mutator that was
/// mid-refill, or whose free stores were not yet visible, a full
/// synchronization edge before a page can be confirmed empty, bounding
/// that race to one extra pass instead of requiring a global barrier.
/// Confirmed pages leave the discovery list and their blocks return to the
/// block allocator as one chain; the rest go back on the buffer for reuse.
/// Returns the number of pages freed.
pub(crate) fn reclaim(mut worklist: *mut Page, meta: &'static Metadata) -> usize {
    let mut confirmed: *mut Page = ptr::null_mut();
    for _ in 0..2 {
        let (empty, rest) = remove_empty(worklist);
        confirmed = append_lists(empty, confirmed);
        worklist = meta.empty_pages.swap_with(rest);
    }
    if !worklist.is_null() {
        meta.empty_pages.append_chain(worklist);
    }

    let mut freed = 0;
    let mut chain: *mut Block = ptr::null_mut();
    let mut cur = confirmed;
    while !cur.is_null() {
        // SAFETY: confirmed pages are privately owned by the collector
        let next = unsafe { &*cur }.next_empty.load(Ordering::Relaxed);
        let unlinked = unlink_page(cur);
        debug_assert!(unlinked, "reclaimed page missing from discovery list");
        // SAFETY: no slot is in use and the page is unreachable now
        let block = unsafe { Box::from_raw(cur) }.block.as_ptr();
        // SAFETY: block header is live; we own the chain
        unsafe {
            (*block).page.store(ptr::null_mut(), Ordering::Relaxed);
            (*block).next.store(chain, Ordering::Relaxed);
        }
        chain = block;
        freed += 1;
        cur = next;
    }
    BLOCKS.free(chain);
    freed
}

fn append_lists(list: *mut Page, onto: *mut Page) -> *mut Page {
    if list.is_null() {
        return onto;
    }
    let mut tail = list;
    // SAFETY: both lists are privately owned by the collector
    unsafe {
        while !(*tail).next_empty.load(Ordering::Relaxed).is_null() {
            tail = (*tail).next_empty.load(Ordering::Relaxed);
        }
        (*tail).next_empty.store(onto, Ordering::Relaxed);
    }
    list
}
