//! Binary buddy allocation.

use crate::{
    align::{is_power_of_two, next_power_of_two, MAX_SCALAR_ALIGN},
    page::PageRegion,
    Allocator,
};
use std::{cmp, mem, ptr::NonNull};

// Block sizes run from MIN_BLOCK at level 0 up by powers of two, one
// free-list per level. 20 levels cover 64 B through 32 MiB arenas.
const MIN_BLOCK: usize = 64;
const MAX_LEVELS: usize = 20;

// Prefixed to every handed-out block so deallocation can recover the level.
// Padded to the maximum scalar alignment so the payload after it stays
// suitably aligned.
#[repr(C, align(16))]
struct BlockHeader {
    size: usize,
}

const HEADER_SIZE: usize = mem::size_of::<BlockHeader>();

/// An allocator that serves mixed sizes by splitting and coalescing
/// power-of-two blocks.
///
/// # Algorithm
///
/// The region's capacity is rounded up to a power of two `C` and starts out
/// as a single free block. A request is rounded (header included) up to the
/// next power of two, no smaller than 64 bytes, which selects a *level*:
/// level 0 holds 64-byte blocks, each level above doubles the size. If the
/// level's free-list is empty, a block from the nearest non-empty level
/// above is split in halves, called *buddies*, repeatedly until one half has the
/// right size. Freeing walks the other way: a block whose buddy (the block
/// at `offset XOR size`) is also free merges with it into a block one level
/// up, repeating until the buddy is live or the top is reached. Allocation
/// and freeing are therefore both O(log C) in the number of levels.
///
/// Rounding to powers of two costs internal fragmentation, the price paid
/// for coalescing that keeps external fragmentation low. If your sizes
/// cluster, a [`PoolAllocator`] or [`SlabAllocator`] wastes less; the buddy
/// earns its keep on mixed, long-lived allocations.
///
/// Every handed-out block is prefixed with a 16-byte header recording the
/// rounded size, so [`deallocate`] needs only the pointer. Payloads are
/// aligned to 16 bytes; requests must not ask for more.
///
/// # Example
///
/// ```
/// use reservoir::BuddyAllocator;
///
/// let mut buddy = BuddyAllocator::new(1024 * 1024);
///
/// // 100 bytes rounds (with the header) to a 128-byte block.
/// let ptr = buddy.allocate(100, 8).unwrap();
/// assert_eq!(buddy.used(), 128);
///
/// buddy.deallocate(ptr);
/// assert_eq!(buddy.used(), 0);
/// ```
///
/// [`PoolAllocator`]: crate::PoolAllocator
/// [`SlabAllocator`]: crate::SlabAllocator
/// [`deallocate`]: Self::deallocate
#[derive(Debug)]
pub struct BuddyAllocator {
    region: PageRegion,
    capacity: usize,
    used: usize,
    top_level: usize,
    // Free block offsets per level, kept sorted so the buddy lookup during
    // coalescing is a binary search rather than a list walk.
    free_lists: [Vec<usize>; MAX_LEVELS],
}

impl BuddyAllocator {
    /// Creates an allocator whose capacity is `capacity` rounded up to the
    /// next power of two (at least one minimum block).
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero, exceeds what the level table covers
    /// (32 MiB), or the pages cannot be acquired.
    pub fn new(capacity: usize) -> BuddyAllocator {
        const EMPTY_FREE_LIST: Vec<usize> = Vec::new();

        assert!(capacity > 0, "capacity must be non-zero");

        let capacity = next_power_of_two(cmp::max(capacity, MIN_BLOCK));
        assert!(
            capacity <= MIN_BLOCK << (MAX_LEVELS - 1),
            "capacity exceeds the top buddy level",
        );

        let region = PageRegion::acquire(capacity);
        let top_level = Self::level_of(capacity);

        let mut free_lists = [EMPTY_FREE_LIST; MAX_LEVELS];
        // The whole region starts as one free block at the top level.
        free_lists[top_level].push(0);

        BuddyAllocator {
            region,
            capacity,
            used: 0,
            top_level,
            free_lists,
        }
    }

    // Level whose block size is `size`; `size` must be a power of two of at
    // least MIN_BLOCK.
    fn level_of(size: usize) -> usize {
        debug_assert!(size.is_power_of_two() && size >= MIN_BLOCK);

        (size / MIN_BLOCK).trailing_zeros() as usize
    }

    fn level_size(level: usize) -> usize {
        MIN_BLOCK << level
    }

    /// Allocates `size` bytes, rounded (with the block header) up to the
    /// next power of two of at least 64 bytes. Returns [`None`] when no
    /// block of the required level can be found or formed.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or exceeds
    /// [`MAX_SCALAR_ALIGN`]; block placement provides that much alignment
    /// on its own.
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(is_power_of_two(align), "alignment must be a power of two");
        assert!(
            align <= MAX_SCALAR_ALIGN,
            "buddy alignment is limited to the maximum scalar alignment",
        );

        let need = cmp::max(size.checked_add(HEADER_SIZE)?, MIN_BLOCK).checked_next_power_of_two()?;
        if need > self.capacity {
            return None;
        }

        let target = Self::level_of(need);

        // Nearest level at or above the target with a free block.
        let found = (target..=self.top_level).find(|&l| !self.free_lists[l].is_empty())?;
        let offset = self.free_lists[found].remove(0);

        // Split back down, returning the upper half of each split to its
        // level's free-list.
        let mut level = found;
        while level > target {
            level -= 1;

            let upper = offset + Self::level_size(level);
            let list = &mut self.free_lists[level];
            let (Ok(index) | Err(index)) = list.binary_search(&upper);
            list.insert(index, upper);
        }

        let block = unsafe { self.region.ptr().as_ptr().add(offset) };

        // SAFETY: `offset` is a multiple of MIN_BLOCK within the region, so
        // the header write is in bounds and aligned.
        unsafe { block.cast::<BlockHeader>().write(BlockHeader { size: need }) };

        self.used += need;

        // SAFETY: The payload starts HEADER_SIZE into a block of at least
        // MIN_BLOCK bytes.
        Some(unsafe { NonNull::new_unchecked(block.add(HEADER_SIZE)) })
    }

    /// Frees the block holding `ptr`, merging it with its buddy as many
    /// levels up as both halves are free.
    ///
    /// `ptr` must have been returned by [`allocate`] on this allocator and
    /// not freed since; the allocator cannot detect violations (caller
    /// contract), and a corrupted header is caught only by debug
    /// assertions.
    ///
    /// [`allocate`]: Self::allocate
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        let base = self.region.ptr().as_ptr();

        // SAFETY: Per the caller contract the header sits immediately
        // before the payload.
        let block = unsafe { ptr.as_ptr().sub(HEADER_SIZE) };
        let need = unsafe { block.cast::<BlockHeader>().read().size };

        debug_assert!(
            need.is_power_of_two() && (MIN_BLOCK..=self.capacity).contains(&need),
            "block header is corrupted",
        );
        debug_assert!(self.used >= need);

        let mut offset = block as usize - base as usize;
        let mut level = Self::level_of(need);

        self.used -= need;

        // Coalesce: if the buddy at this level is free, absorb it and
        // promote the merged block one level up.
        while level < self.top_level {
            let buddy = offset ^ Self::level_size(level);
            if buddy >= self.capacity {
                break;
            }

            match self.free_lists[level].binary_search(&buddy) {
                Ok(index) => {
                    self.free_lists[level].remove(index);
                    offset = cmp::min(offset, buddy);
                    level += 1;
                }
                Err(_) => break,
            }
        }

        let list = &mut self.free_lists[level];
        let (Ok(index) | Err(index)) = list.binary_search(&offset);
        list.insert(index, offset);
    }

    /// Bytes currently handed out, counted in rounded block sizes (headers
    /// included).
    #[inline]
    pub fn used(&self) -> usize {
        self.used
    }

    /// Total capacity in bytes, after power-of-two rounding.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Allocator for BuddyAllocator {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.allocate(size, align)
    }

    #[inline]
    fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.deallocate(ptr);
    }

    fn used(&self) -> usize {
        self.used()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }

    fn name(&self) -> &'static str {
        "buddy"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: usize = 1024 * 1024;

    // One free block at the top level and nothing anywhere else.
    fn assert_pristine(buddy: &BuddyAllocator) {
        assert_eq!(buddy.used(), 0);
        for (level, list) in buddy.free_lists.iter().enumerate() {
            if level == buddy.top_level {
                assert_eq!(list.as_slice(), &[0]);
            } else {
                assert!(list.is_empty());
            }
        }
    }

    #[test]
    fn capacity_rounds_up_to_a_power_of_two() {
        let buddy = BuddyAllocator::new(1000 * 1000);
        assert_eq!(buddy.capacity(), MIB);
        assert_pristine(&buddy);
    }

    #[test]
    fn smallest_request_consumes_one_min_block() {
        let mut buddy = BuddyAllocator::new(MIB);

        let ptr = buddy.allocate(MIN_BLOCK - HEADER_SIZE, 8).unwrap();
        assert_eq!(buddy.used(), MIN_BLOCK);

        buddy.deallocate(ptr);
        assert_pristine(&buddy);
    }

    #[test]
    fn whole_arena_in_one_block() {
        let mut buddy = BuddyAllocator::new(MIB);

        let ptr = buddy.allocate(MIB - HEADER_SIZE, 8).unwrap();
        assert_eq!(buddy.used(), MIB);
        assert!(buddy.allocate(1, 1).is_none());

        buddy.deallocate(ptr);
        assert_pristine(&buddy);
    }

    #[test]
    fn coalescing_restores_the_full_arena() {
        let mut buddy = BuddyAllocator::new(MIB);

        // Two blocks of the same level.
        let p1 = buddy.allocate(1000, 8).unwrap();
        let p2 = buddy.allocate(1000, 8).unwrap();
        assert_eq!(buddy.used(), 2 * 1024);

        buddy.deallocate(p1);
        buddy.deallocate(p2);
        assert_eq!(buddy.used(), 0);

        // Only possible if every split was merged back up to the top.
        let whole = buddy.allocate(MIB - HEADER_SIZE, 8).unwrap();
        buddy.deallocate(whole);
        assert_pristine(&buddy);
    }

    #[test]
    fn rounds_requests_to_the_next_power_of_two() {
        let mut buddy = BuddyAllocator::new(MIB);

        // 100 + 16 header rounds to 128.
        let ptr = buddy.allocate(100, 8).unwrap();
        assert_eq!(buddy.used(), 128);
        buddy.deallocate(ptr);

        // 200 + 16 rounds to 256.
        let ptr = buddy.allocate(200, 8).unwrap();
        assert_eq!(buddy.used(), 256);
        buddy.deallocate(ptr);

        assert_pristine(&buddy);
    }

    #[test]
    fn payloads_are_max_scalar_aligned() {
        let mut buddy = BuddyAllocator::new(64 * 1024);

        for size in [1, 7, 100, 1000] {
            let ptr = buddy.allocate(size, 16).unwrap();
            assert_eq!(ptr.as_ptr() as usize % 16, 0);
        }
    }

    #[test]
    fn exhaustion_by_min_blocks_and_full_recovery() {
        const CAPACITY: usize = 64 * 1024;
        let mut buddy = BuddyAllocator::new(CAPACITY);

        let mut live = Vec::new();
        for _ in 0..CAPACITY / MIN_BLOCK {
            live.push(buddy.allocate(MIN_BLOCK - HEADER_SIZE, 8).unwrap());
        }

        assert_eq!(buddy.used(), CAPACITY);
        assert!(buddy.allocate(1, 1).is_none());

        for ptr in live.drain(..) {
            buddy.deallocate(ptr);
        }
        assert_pristine(&buddy);

        let whole = buddy.allocate(CAPACITY - HEADER_SIZE, 8).unwrap();
        buddy.deallocate(whole);
    }

    #[test]
    fn mixed_levels_cycle_back_to_pristine() {
        let mut buddy = BuddyAllocator::new(MIB);

        for rotation in 0..4 {
            let mut live = Vec::new();
            for level in 0..8usize {
                let size = (MIN_BLOCK << ((level + rotation) % 8)) - HEADER_SIZE;
                live.push(buddy.allocate(size, 8).unwrap());
            }

            // Free in a different order each time.
            if rotation % 2 == 0 {
                live.reverse();
            }
            for ptr in live {
                buddy.deallocate(ptr);
            }

            assert_pristine(&buddy);
        }
    }

    #[test]
    fn allocations_do_not_overlap() {
        let mut buddy = BuddyAllocator::new(64 * 1024);

        let mut live = Vec::new();
        for i in 0..64u8 {
            let size = 100 + i as usize;
            let ptr = buddy.allocate(size, 8).unwrap();
            unsafe { ptr.as_ptr().write_bytes(i, size) };
            live.push((ptr, size, i));
        }

        for (ptr, size, fill) in &live {
            for offset in [0, size / 2, size - 1] {
                assert_eq!(unsafe { ptr.as_ptr().add(offset).read() }, *fill);
            }
        }

        for (ptr, ..) in live {
            buddy.deallocate(ptr);
        }
        assert_pristine(&buddy);
    }

    #[test]
    fn oversized_request_fails_cleanly() {
        let mut buddy = BuddyAllocator::new(64 * 1024);

        assert!(buddy.allocate(64 * 1024, 8).is_none());
        assert_pristine(&buddy);
    }

    #[test]
    #[should_panic]
    fn alignment_above_the_scalar_limit_is_refused() {
        let mut buddy = BuddyAllocator::new(64 * 1024);
        let _ = buddy.allocate(64, 32);
    }
}
