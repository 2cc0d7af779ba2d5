//! Backing-memory blocks and their process-wide recycler.
//!
//! Every page is built over one block: a `BLOCK_SIZE`-aligned mapping whose
//! first bytes hold the [`Block`] header. The alignment is what lets an
//! interior slot pointer find its page again by masking.

use std::{
    fmt,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, Ordering},
};

use log::debug;

use crate::{
    config::{BLOCK_SIZE, SLOT_DATA_OFFSET},
    page::Page,
    system,
};

/// Backing memory could not be obtained from the operating environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocError;

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("backing memory exhausted")
    }
}

impl std::error::Error for AllocError {}

/// Header at offset 0 of every block.
#[repr(C)]
pub struct Block {
    /// Page currently built over this block, null while on the free-list.
    pub page: AtomicPtr<Page>,
    /// Intrusive link for the free-list and for batched release chains.
    pub next: AtomicPtr<Block>,
}

impl Block {
    /// First slot byte of this block.
    #[inline]
    pub fn data(&self) -> *mut u8 {
        (ptr::from_ref(self) as *mut u8).wrapping_add(SLOT_DATA_OFFSET)
    }

    /// Bytes available for slots.
    #[inline]
    pub const fn capacity_bytes() -> usize {
        BLOCK_SIZE - SLOT_DATA_OFFSET
    }

    /// Recovers the block header from any pointer into its slot area.
    ///
    /// # Safety
    /// `ptr` must point into the slot area of a live block.
    #[inline]
    pub unsafe fn from_interior(ptr: *const u8) -> *mut Block {
        ((ptr as usize) & !(BLOCK_SIZE - 1)) as *mut Block
    }
}

/// Process-wide block recycler. Freed blocks go onto a lock-free LIFO list
/// and are handed out again before the OS is asked for fresh memory.
pub struct BlockAllocator {
    free: AtomicPtr<Block>,
}

pub static BLOCKS: BlockAllocator = BlockAllocator {
    free: AtomicPtr::new(ptr::null_mut()),
};

impl BlockAllocator {
    /// Returns a block, recycled if possible. Thread-safe.
    pub fn alloc(&self) -> Result<NonNull<Block>, AllocError> {
        if let Some(block) = self.pop_free() {
            return Ok(block);
        }

        let raw = system::map_aligned(BLOCK_SIZE, BLOCK_SIZE).ok_or(AllocError)?;
        let block = raw.as_ptr() as *mut Block;
        // SAFETY: freshly mapped, BLOCK_SIZE bytes, aligned for Block
        unsafe {
            ptr::write(
                block,
                Block {
                    page: AtomicPtr::new(ptr::null_mut()),
                    next: AtomicPtr::new(ptr::null_mut()),
                },
            );
        }
        debug!("mapped fresh {}K block", BLOCK_SIZE / 1024);
        // SAFETY: derived from a non-null mapping
        Ok(unsafe { NonNull::new_unchecked(block) })
    }

    fn pop_free(&self) -> Option<NonNull<Block>> {
        let mut head = self.free.load(Ordering::Acquire);
        loop {
            if head.is_null() {
                return None;
            }
            // SAFETY: blocks on the free-list stay mapped
            let next = unsafe { &*head }.next.load(Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                head,
                next,
                Ordering::Acquire,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: we own head now
                    let block = unsafe { &*head };
                    block.next.store(ptr::null_mut(), Ordering::Relaxed);
                    block.page.store(ptr::null_mut(), Ordering::Relaxed);
                    // SAFETY: head was non-null
                    return Some(unsafe { NonNull::new_unchecked(head) });
                }
                Err(new_head) => head = new_head,
            }
        }
    }

    /// Releases a whole `next`-linked chain of blocks with a single splice.
    pub fn free(&self, chain: *mut Block) {
        if chain.is_null() {
            return;
        }
        let mut tail = chain;
        // SAFETY: chain is a private, well-formed list owned by the caller
        unsafe {
            while !(*tail).next.load(Ordering::Relaxed).is_null() {
                tail = (*tail).next.load(Ordering::Relaxed);
            }
        }

        let mut head = self.free.load(Ordering::Relaxed);
        loop {
            // SAFETY: tail belongs to the caller's chain
            unsafe { &*tail }.next.store(head, Ordering::Relaxed);
            match self.free.compare_exchange_weak(
                head,
                chain,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(new_head) => head = new_head,
            }
        }
    }

    /// Returns every cached block to the OS. Called at shutdown only.
    pub fn drain(&self) -> usize {
        let mut count = 0;
        while let Some(block) = self.pop_free() {
            // SAFETY: free-list blocks have no page over them
            system::unmap(block.cast(), BLOCK_SIZE);
            count += 1;
        }
        if count > 0 {
            debug!("returned {count} cached blocks to the OS");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_returns_aligned_block_with_null_page() {
        let block = BLOCKS.alloc().expect("block allocation failed");
        assert_eq!(block.as_ptr() as usize % BLOCK_SIZE, 0);
        // SAFETY: just allocated
        let header = unsafe { block.as_ref() };
        assert!(header.page.load(Ordering::Relaxed).is_null());
        assert!(header.next.load(Ordering::Relaxed).is_null());
        BLOCKS.free(block.as_ptr());
    }

    fn local_allocator() -> BlockAllocator {
        BlockAllocator {
            free: AtomicPtr::new(ptr::null_mut()),
        }
    }

    #[test]
    fn freed_block_is_recycled_before_fresh_mapping() {
        let blocks = local_allocator();
        let first = blocks.alloc().expect("block allocation failed");
        blocks.free(first.as_ptr());
        let second = blocks.alloc().expect("block allocation failed");
        // LIFO: the block we just released comes straight back
        assert_eq!(first.as_ptr(), second.as_ptr());
        blocks.free(second.as_ptr());
        blocks.drain();
    }

    #[test]
    fn chain_free_releases_every_link() {
        let blocks = local_allocator();
        let a = blocks.alloc().expect("block allocation failed");
        let b = blocks.alloc().expect("block allocation failed");
        // SAFETY: both blocks are exclusively ours
        unsafe {
            a.as_ref().next.store(b.as_ptr(), Ordering::Relaxed);
        }
        blocks.free(a.as_ptr());

        let x = blocks.alloc().expect("block allocation failed");
        let y = blocks.alloc().expect("block allocation failed");
        let got = [x.as_ptr(), y.as_ptr()];
        assert!(got.contains(&a.as_ptr()), "chain head must be reusable");
        assert!(got.contains(&b.as_ptr()), "chain tail must be reusable");
        blocks.free(x.as_ptr());
        blocks.free(y.as_ptr());
        assert_eq!(blocks.drain(), 2, "both blocks must return to the OS");
    }

    #[test]
    fn drain_empties_the_free_list() {
        let blocks = local_allocator();
        let a = blocks.alloc().expect("block allocation failed");
        blocks.free(a.as_ptr());
        assert_eq!(blocks.drain(), 1);
        assert_eq!(blocks.drain(), 0);
    }

    #[test]
    fn interior_pointer_masks_back_to_its_block() {
        let block = BLOCKS.alloc().expect("block allocation failed");
        // SAFETY: offset stays inside the block
        let inner = unsafe { block.as_ref().data().add(1234) };
        // SAFETY: inner points into the slot area
        let found = unsafe { Block::from_interior(inner) };
        assert_eq!(found, block.as_ptr());
        BLOCKS.free(block.as_ptr());
    }
}
