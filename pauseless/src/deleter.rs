//! Pluggable deletion policies.
//!
//! A policy attached to a type observes every final reclamation of that
//! type's objects. The collector invokes it exactly once per object, at the
//! `PendingFree -> Unused` transition, before the destructor runs.

/// Callback observing final reclamation of objects of one type.
pub trait DeletionPolicy: Send + Sync + 'static {
    /// `object` points to the still-constructed object about to be dropped.
    fn on_delete(&self, object: *mut u8);
}

impl<F> DeletionPolicy for F
where
    F: Fn(*mut u8) + Send + Sync + 'static,
{
    fn on_delete(&self, object: *mut u8) {
        self(object)
    }
}
