//! Compile-time tunables.
//!
//! These are deliberately constants rather than runtime configuration: the
//! allocator sizes pages from them and the collector derives its wake policy
//! from them, so they must agree across every compilation unit.

use std::time::Duration;

/// Maximum time the collector thread sleeps between cycles.
pub const MAX_SLEEP: Duration = Duration::from_secs(30);

/// Percentage of the live-object count that, once exceeded by allocations
/// since the last cycle, wakes the collector early.
pub const TRIGGER_PERCENT: usize = 25;

/// Allocations below this count never wake the collector, regardless of the
/// live count. Keeps a cold process from cycling on its first handful of
/// objects.
pub const TRIGGER_MIN_ALLOCATIONS: usize = 256;

/// Upper bound on distinct registered object types. Exceeding it aborts.
pub const MAX_TYPE_COUNT: usize = 4096;

/// Grace window between an object being found unreachable and its
/// destruction. Must exceed the lifetime of any short-lived alias taken
/// from a root or tracked reference.
pub const DELETION_DELAY: Duration = Duration::from_millis(100);

/// Size and alignment of one backing block. Every block is mapped aligned
/// to this value so an interior pointer finds its block by masking.
pub const BLOCK_SIZE: usize = 64 * 1024;

/// Offset of the first slot inside a block; the block header lives below it.
pub const SLOT_DATA_OFFSET: usize = 64;
