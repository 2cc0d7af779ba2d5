//! The three reference kinds: root, tracked, unsafe.
//!
//! Roots anchor object graphs from outside the heap, tracked references are
//! the in-heap edges the collector traces, and unsafe references are the
//! short-lived aliases algorithms pass around internally.

use std::{
    marker::PhantomData,
    ops::Deref,
    ptr,
    sync::{
        OnceLock,
        atomic::{AtomicPtr, Ordering},
    },
};

use parking_lot::Mutex;

use crate::{
    alloc::{self, AllocError},
    collector,
    metadata::{Collectable, Metadata},
    page::{self, ALLOCATED, MARKED, PENDING_FREE},
};

// ── Root registry ─────────────────────────────────────────────────────

/// One anchor cell. The cell address is stable for the process lifetime;
/// retargeting is a single atomic store with no lock.
pub(crate) struct RootCell {
    value: AtomicPtr<u8>,
}

struct RootRegistry {
    all: Vec<&'static RootCell>,
    free: Vec<&'static RootCell>,
}

fn registry() -> &'static Mutex<RootRegistry> {
    static ROOTS: OnceLock<Mutex<RootRegistry>> = OnceLock::new();
    ROOTS.get_or_init(|| {
        Mutex::new(RootRegistry {
            all: Vec::new(),
            free: Vec::new(),
        })
    })
}

fn register(value: *mut u8) -> &'static RootCell {
    let mut reg = registry().lock();
    let cell = match reg.free.pop() {
        Some(cell) => cell,
        None => {
            let cell: &'static RootCell = Box::leak(Box::new(RootCell {
                value: AtomicPtr::new(ptr::null_mut()),
            }));
            reg.all.push(cell);
            cell
        }
    };
    cell.value.store(value, Ordering::Release);
    cell
}

fn deregister(cell: &'static RootCell) {
    cell.value.store(ptr::null_mut(), Ordering::Release);
    registry().lock().free.push(cell);
}

/// Copies the current value of every anchor. Collector only.
pub(crate) fn roots_snapshot() -> Vec<*mut u8> {
    let reg = registry().lock();
    reg.all
        .iter()
        .map(|cell| cell.value.load(Ordering::Acquire))
        .filter(|ptr| !ptr.is_null())
        .collect()
}

// ── UnsafeRef ─────────────────────────────────────────────────────────

/// Non-owning, short-lived alias of a collected object.
///
/// Carries no anchorage: an object reachable only through unsafe
/// references is unreachable to the collector. Callers must not retain one
/// past the traversal that produced it; holding one across the deletion
/// grace window is undefined behavior by contract.
pub struct UnsafeRef<T: Collectable> {
    ptr: *mut T,
}

impl<T: Collectable> Clone for UnsafeRef<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T: Collectable> Copy for UnsafeRef<T> {}

impl<T: Collectable> PartialEq for UnsafeRef<T> {
    fn eq(&self, other: &Self) -> bool {
        self.ptr == other.ptr
    }
}
impl<T: Collectable> Eq for UnsafeRef<T> {}

impl<T: Collectable> core::fmt::Debug for UnsafeRef<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("UnsafeRef").field(&self.ptr).finish()
    }
}

impl<T: Collectable> UnsafeRef<T> {
    #[inline]
    pub fn null() -> Self {
        Self {
            ptr: ptr::null_mut(),
        }
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.is_null()
    }

    #[inline]
    pub(crate) fn from_raw(ptr: *mut u8) -> Self {
        Self { ptr: ptr.cast() }
    }

    #[inline]
    pub(crate) fn as_raw(&self) -> *mut u8 {
        self.ptr.cast()
    }
}

impl<T: Collectable> Deref for UnsafeRef<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        debug_assert!(!self.ptr.is_null(), "deref of null reference");
        // SAFETY: non-null references point to live slots by contract
        unsafe { &*self.ptr }
    }
}

// ── Tracked ───────────────────────────────────────────────────────────

/// In-heap reference field scanned during tracing.
///
/// Interior-mutable: a store updates the edge the collector will observe
/// on its next pass. Lives inside [`Collectable`] types, which must report
/// it from `visit_edges`.
#[repr(transparent)]
pub struct Tracked<T: Collectable> {
    ptr: AtomicPtr<u8>,
    _marker: PhantomData<*const T>,
}

// SAFETY: the only state is an atomic pointer
unsafe impl<T: Collectable> Send for Tracked<T> {}
// SAFETY: see above
unsafe impl<T: Collectable> Sync for Tracked<T> {}

impl<T: Collectable> Default for Tracked<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Collectable> Tracked<T> {
    #[inline]
    pub fn null() -> Self {
        Self {
            ptr: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    pub fn new(target: UnsafeRef<T>) -> Self {
        let tracked = Self::null();
        tracked.store(target);
        tracked
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.ptr.load(Ordering::Acquire).is_null()
    }

    /// Retargets the edge.
    #[inline]
    pub fn store(&self, target: UnsafeRef<T>) {
        self.ptr.store(target.as_raw(), Ordering::Release);
        collector::note_mutation();
    }

    /// Derives a temporary alias of the current target.
    #[inline]
    pub fn load(&self) -> UnsafeRef<T> {
        UnsafeRef::from_raw(self.ptr.load(Ordering::Acquire))
    }

    /// Reports this edge to a trace visitor.
    #[inline]
    pub fn visit(&self, visitor: &mut dyn FnMut(*mut u8)) {
        let ptr = self.ptr.load(Ordering::Acquire);
        if !ptr.is_null() {
            visitor(ptr);
        }
    }
}

// ── Root ──────────────────────────────────────────────────────────────

/// Strong external anchor keeping a graph alive.
///
/// Exclusive to its owning variable: cloning duplicates the anchorage,
/// moving transfers it, dropping removes it.
pub struct Root<T: Collectable> {
    cell: &'static RootCell,
    _marker: PhantomData<*const T>,
}

// SAFETY: the registry cell is process-global and atomically accessed
unsafe impl<T: Collectable> Send for Root<T> {}
// SAFETY: see above
unsafe impl<T: Collectable> Sync for Root<T> {}

impl<T: Collectable> Default for Root<T> {
    fn default() -> Self {
        Self::null()
    }
}

impl<T: Collectable> Root<T> {
    /// A root anchoring nothing.
    pub fn null() -> Self {
        Self {
            cell: register(ptr::null_mut()),
            _marker: PhantomData,
        }
    }

    /// Allocates a slot, constructs `value` in place and anchors it.
    /// Panics when backing memory is exhausted.
    pub fn new(value: T) -> Self {
        Self::try_new(value).expect("allocation failed")
    }

    /// Fallible variant of [`Root::new`].
    pub fn try_new(value: T) -> Result<Self, AllocError> {
        let meta = Metadata::of::<T>();
        let raw = alloc::alloc_slot(meta)?;
        // SAFETY: the slot is Reserved for us and large enough for T
        unsafe { ptr::write(raw.as_ptr().cast::<T>(), value) };

        let cell = register(raw.as_ptr());

        // SAFETY: the slot belongs to a live page
        let (page, index) = unsafe { page::locate(raw.as_ptr()) };
        // SAFETY: the page outlives its reserved slots
        let state = &unsafe { &*page }.states[index];
        state.store(ALLOCATED, Ordering::Release);
        if collector::tracing_active() {
            // A cycle is running: it may already have passed this slot, or
            // even swept it before the anchor became visible. Promote the
            // newborn so this cycle cannot destroy it.
            if state
                .compare_exchange(ALLOCATED, MARKED, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                let _ = state.compare_exchange(
                    PENDING_FREE,
                    MARKED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
        }
        collector::note_allocation();

        Ok(Self {
            cell,
            _marker: PhantomData,
        })
    }

    #[inline]
    pub fn is_null(&self) -> bool {
        self.cell.value.load(Ordering::Acquire).is_null()
    }

    /// Derives a temporary alias of the anchored object.
    #[inline]
    pub fn get(&self) -> UnsafeRef<T> {
        UnsafeRef::from_raw(self.cell.value.load(Ordering::Acquire))
    }

    /// Retargets the anchor.
    #[inline]
    pub fn set(&mut self, target: UnsafeRef<T>) {
        self.cell.value.store(target.as_raw(), Ordering::Release);
        collector::note_mutation();
    }

    /// Views this anchor as a tracked edge, for algorithms that write
    /// through either kind of destination.
    #[inline]
    pub fn edge(&self) -> &Tracked<T> {
        // SAFETY: Tracked is a transparent wrapper over AtomicPtr<u8> and
        // the registry cell lives for the process
        unsafe { &*(ptr::from_ref(&self.cell.value) as *const Tracked<T>) }
    }
}

impl<T: Collectable> Clone for Root<T> {
    fn clone(&self) -> Self {
        Self {
            cell: register(self.cell.value.load(Ordering::Acquire)),
            _marker: PhantomData,
        }
    }
}

impl<T: Collectable> Drop for Root<T> {
    fn drop(&mut self) {
        deregister(self.cell);
    }
}

impl<T: Collectable> Deref for Root<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        let ptr = self.cell.value.load(Ordering::Acquire);
        debug_assert!(!ptr.is_null(), "deref of null root");
        // SAFETY: anchored objects stay live
        unsafe { &*ptr.cast::<T>() }
    }
}

impl<T: Collectable> PartialEq<UnsafeRef<T>> for Root<T> {
    fn eq(&self, other: &UnsafeRef<T>) -> bool {
        self.cell.value.load(Ordering::Acquire) == other.as_raw()
    }
}
