//! Per-type metadata and the bounded, process-wide type registry.
//!
//! Destructor and trace dispatch go through data-driven function pointers
//! recorded here once at registration, never through dynamic dispatch on
//! the allocation hot path.

use std::{
    alloc::Layout,
    any::TypeId,
    cell::UnsafeCell,
    collections::HashMap,
    hint, mem, process, ptr,
    sync::{
        OnceLock,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{error, info};
use parking_lot::RwLock;

use crate::{
    config::{MAX_TYPE_COUNT, SLOT_DATA_OFFSET},
    deleter::DeletionPolicy,
    page::Page,
};

/// Object types managed by the collector.
///
/// `visit_edges` must call the visitor for every in-heap reference field;
/// the default is correct for leaf types. `describe` feeds diagnostic
/// logging at destruction time and may stay unimplemented.
pub trait Collectable: Send + Sync + 'static {
    fn visit_edges(&self, visitor: &mut dyn FnMut(*mut u8)) {
        let _ = visitor;
    }

    fn describe(&self) -> Option<String> {
        None
    }
}

/// Traces all reference edges of a type-erased object.
///
/// # Safety
/// `obj` must point to a live, constructed object of the registered type.
pub type TraceFn = unsafe fn(obj: *const u8, visitor: &mut dyn FnMut(*mut u8));

unsafe fn drop_erased<T: Collectable>(obj: *mut u8) {
    // SAFETY: caller passes a constructed T exactly once
    unsafe { ptr::drop_in_place(obj.cast::<T>()) }
}

unsafe fn trace_erased<T: Collectable>(obj: *const u8, visitor: &mut dyn FnMut(*mut u8)) {
    // SAFETY: caller passes a constructed T
    unsafe { (*obj.cast::<T>()).visit_edges(visitor) }
}

unsafe fn describe_erased<T: Collectable>(obj: *const u8) -> Option<String> {
    // SAFETY: caller passes a constructed T
    unsafe { (*obj.cast::<T>()).describe() }
}

/// Immutable descriptor of one registered type.
pub struct Metadata {
    pub id: u32,
    pub name: &'static str,
    pub layout: Layout,
    /// Slot stride: layout padded to alignment, never below a word.
    pub slot_size: usize,
    pub drop_fn: unsafe fn(*mut u8),
    pub trace_fn: TraceFn,
    pub describe_fn: unsafe fn(*const u8) -> Option<String>,
    /// Recyclable pages of this type, refilled by the collector.
    pub(crate) empty_pages: PageBuffer,
    deletion: OnceLock<Box<dyn DeletionPolicy>>,
}

impl Metadata {
    /// Returns the descriptor for `T`, registering it on first use.
    ///
    /// Idempotent: repeated calls yield the same handle and consume exactly
    /// one entry of the bounded table. Exceeding [`MAX_TYPE_COUNT`] aborts;
    /// a truncated table would corrupt slot-size assumptions for every
    /// allocator of the type.
    pub fn of<T: Collectable>() -> &'static Metadata {
        let key = TypeId::of::<T>();
        {
            let reg = registry().read();
            if let Some(meta) = reg.get(&key).copied() {
                return meta;
            }
        }

        let mut reg = registry().write();
        if let Some(meta) = reg.get(&key).copied() {
            return meta;
        }
        if reg.len() >= MAX_TYPE_COUNT {
            error!("type registry exhausted ({MAX_TYPE_COUNT} types)");
            process::abort();
        }

        let layout = Layout::new::<T>();
        assert!(
            layout.align() <= SLOT_DATA_OFFSET,
            "over-aligned collectable type: {}",
            std::any::type_name::<T>()
        );
        let slot_size = layout
            .pad_to_align()
            .size()
            .max(mem::size_of::<usize>())
            .next_multiple_of(layout.align());

        let meta: &'static Metadata = Box::leak(Box::new(Metadata {
            id: reg.len() as u32,
            name: std::any::type_name::<T>(),
            layout,
            slot_size,
            drop_fn: drop_erased::<T>,
            trace_fn: trace_erased::<T>,
            describe_fn: describe_erased::<T>,
            empty_pages: PageBuffer::new(),
            deletion: OnceLock::new(),
        }));
        reg.insert(key, meta);
        info!("registered type {} (id {}, {} byte slots)", meta.name, meta.id, meta.slot_size);
        meta
    }

    /// Attaches a deletion policy; at most one per type. Returns false when
    /// a policy was already attached.
    pub fn set_deletion_policy(&self, policy: Box<dyn DeletionPolicy>) -> bool {
        self.deletion.set(policy).is_ok()
    }

    /// Runs the attached policy, if any. Called exactly once per object,
    /// right before the destructor.
    pub(crate) fn run_deletion_policy(&self, obj: *mut u8) {
        if let Some(policy) = self.deletion.get() {
            policy.on_delete(obj);
        }
    }
}

fn registry() -> &'static RwLock<HashMap<TypeId, &'static Metadata>> {
    static REGISTRY: OnceLock<RwLock<HashMap<TypeId, &'static Metadata>>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(HashMap::new()))
}

/// Number of currently registered types.
pub fn registered_type_count() -> usize {
    registry().read().len()
}

/// Spinlock-guarded head of a `next_empty`-linked page list.
///
/// The lock is held only across single pointer swaps, never a scan.
pub(crate) struct PageBuffer {
    locked: AtomicBool,
    head: UnsafeCell<*mut Page>,
}

// SAFETY: head is only touched while the spinlock is held
unsafe impl Send for PageBuffer {}
// SAFETY: see above
unsafe impl Sync for PageBuffer {}

impl PageBuffer {
    pub(crate) fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
            head: UnsafeCell::new(ptr::null_mut()),
        }
    }

    #[inline]
    fn lock(&self) {
        while self
            .locked
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            hint::spin_loop();
        }
    }

    #[inline]
    fn unlock(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Pops the front page, or null.
    pub(crate) fn pop(&self) -> *mut Page {
        self.lock();
        // SAFETY: lock held
        let head = unsafe { *self.head.get() };
        if !head.is_null() {
            // SAFETY: pages on the buffer are live; link read is the only access
            let next = unsafe { &*head }.next_empty.load(Ordering::Relaxed);
            // SAFETY: lock held
            unsafe { *self.head.get() = next };
        }
        self.unlock();
        head
    }

    /// Exchanges the whole buffer for `list`, returning the old contents.
    pub(crate) fn swap_with(&self, list: *mut Page) -> *mut Page {
        self.lock();
        // SAFETY: lock held
        let old = unsafe { mem::replace(&mut *self.head.get(), list) };
        self.unlock();
        old
    }

    /// Splices a whole chain onto the front. The tail walk happens before
    /// the lock is taken.
    pub(crate) fn append_chain(&self, chain: *mut Page) {
        if chain.is_null() {
            return;
        }
        let mut tail = chain;
        // SAFETY: chain is a private list owned by the caller
        unsafe {
            while !(*tail).next_empty.load(Ordering::Relaxed).is_null() {
                tail = (*tail).next_empty.load(Ordering::Relaxed);
            }
        }
        self.lock();
        // SAFETY: lock held; tail belongs to the caller's chain
        unsafe {
            (*tail).next_empty.store(*self.head.get(), Ordering::Relaxed);
            *self.head.get() = chain;
        }
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BLOCKS;

    struct Alpha(#[allow(dead_code)] u64);
    impl Collectable for Alpha {}

    struct Beta {
        _a: u8,
    }
    impl Collectable for Beta {}

    #[test]
    fn registration_is_idempotent() {
        let first = Metadata::of::<Alpha>();
        let count_after_first = registered_type_count();
        let again = Metadata::of::<Alpha>();
        assert!(ptr::eq(first, again), "same type must yield the same handle");
        assert_eq!(first.id, again.id);
        assert!(
            registered_type_count() >= count_after_first,
            "re-registration must not shrink the table"
        );
    }

    #[test]
    fn distinct_types_get_distinct_ids() {
        let a = Metadata::of::<Alpha>();
        let b = Metadata::of::<Beta>();
        assert_ne!(a.id, b.id);
        assert!(!ptr::eq(a, b));
    }

    #[test]
    fn slot_size_is_padded_and_word_minimum() {
        let a = Metadata::of::<Alpha>();
        assert_eq!(a.slot_size, 8);
        let b = Metadata::of::<Beta>();
        assert!(b.slot_size >= mem::size_of::<usize>());
        assert!(b.slot_size.is_multiple_of(b.layout.align().max(1)));
    }

    #[test]
    fn page_buffer_pops_in_lifo_order() {
        let meta = Metadata::of::<Alpha>();
        let buffer = PageBuffer::new();
        assert!(buffer.pop().is_null());

        let b1 = BLOCKS.alloc().expect("block allocation failed");
        let b2 = BLOCKS.alloc().expect("block allocation failed");
        let p1 = Page::new(b1, meta);
        let p2 = Page::new(b2, meta);

        buffer.append_chain(p1);
        buffer.append_chain(p2);
        assert_eq!(buffer.pop(), p2);
        assert_eq!(buffer.pop(), p1);
        assert!(buffer.pop().is_null());

        // SAFETY: pages and blocks are exclusively ours
        unsafe {
            drop(Box::from_raw(p1));
            drop(Box::from_raw(p2));
        }
        BLOCKS.free(b1.as_ptr());
        BLOCKS.free(b2.as_ptr());
    }

    #[test]
    fn page_buffer_swap_exchanges_contents() {
        let meta = Metadata::of::<Beta>();
        let buffer = PageBuffer::new();

        let b1 = BLOCKS.alloc().expect("block allocation failed");
        let p1 = Page::new(b1, meta);
        buffer.append_chain(p1);

        let old = buffer.swap_with(ptr::null_mut());
        assert_eq!(old, p1);
        assert!(buffer.pop().is_null());

        // SAFETY: page and block are exclusively ours
        unsafe { drop(Box::from_raw(p1)) };
        BLOCKS.free(b1.as_ptr());
    }
}
