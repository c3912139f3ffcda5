//! Size-class routed slab allocation.

use crate::{
    align::{is_power_of_two, next_power_of_two, MAX_SCALAR_ALIGN},
    page::PageRegion,
    Allocator,
};
use smallvec::SmallVec;
use std::{mem, ptr, ptr::NonNull};

// One size class: a pool-style free-list over its own page region.
#[derive(Debug)]
struct Slab {
    region: PageRegion,
    head: *mut u8,
    class_size: usize,
    slot_count: usize,
    used_count: usize,
}

impl Slab {
    fn new(class_size: usize, slot_count: usize) -> Slab {
        let region = PageRegion::acquire(class_size * slot_count);

        let mut slab = Slab {
            region,
            head: ptr::null_mut(),
            class_size,
            slot_count,
            used_count: 0,
        };
        slab.rebuild_free_list();

        slab
    }

    fn rebuild_free_list(&mut self) {
        let base = self.region.ptr().as_ptr();

        // Class sizes are powers of two of at least pointer width, so every
        // slot address is aligned for the link.
        unsafe {
            for i in 0..self.slot_count - 1 {
                let slot = base.add(i * self.class_size);
                slot.cast::<*mut u8>()
                    .write(base.add((i + 1) * self.class_size));
            }

            base.add((self.slot_count - 1) * self.class_size)
                .cast::<*mut u8>()
                .write(ptr::null_mut());
        }

        self.head = base;
        self.used_count = 0;
    }

    fn allocate(&mut self) -> Option<NonNull<u8>> {
        let slot = NonNull::new(self.head)?;

        // SAFETY: A free slot's first word is the next-link.
        self.head = unsafe { slot.as_ptr().cast::<*mut u8>().read() };
        self.used_count += 1;

        Some(slot)
    }

    fn deallocate(&mut self, ptr: NonNull<u8>) {
        debug_assert!(self.used_count > 0);

        // SAFETY: The caller established ownership via `contains`.
        unsafe { ptr.as_ptr().cast::<*mut u8>().write(self.head) };
        self.head = ptr.as_ptr();
        self.used_count -= 1;
    }

    fn contains(&self, ptr: NonNull<u8>) -> bool {
        let start = self.region.ptr().as_ptr() as usize;
        let end = start + self.class_size * self.slot_count;
        let addr = ptr.as_ptr() as usize;

        addr >= start && addr < end
    }
}

/// A row of independent fixed-size pools, one per size class, with requests
/// routed to the smallest class that fits.
///
/// Size classes are given at construction, rounded up to the next power of
/// two, and must come out strictly increasing. A request of `s` bytes is
/// served from the first class `>= s`; if that class is exhausted the
/// allocation fails. There is deliberately no spill into a larger class,
/// because silently borrowing from a neighbor would make slab sizing
/// impossible to reason about. Size the classes for your distribution
/// instead.
///
/// Freeing locates the owning slab by pointer-range containment, a linear
/// scan over the (few, branch-predictable) classes. Freeing a pointer that
/// belongs to no slab is a fatal programming error.
///
/// # Example
///
/// ```
/// use reservoir::SlabAllocator;
///
/// let mut slabs = SlabAllocator::new(1000, &[32, 64, 128, 256, 512]);
///
/// // 60 bytes routes to the 64-byte class.
/// let ptr = slabs.allocate(60, 8).unwrap();
/// slabs.deallocate(ptr);
/// ```
#[derive(Debug)]
pub struct SlabAllocator {
    slabs: SmallVec<[Slab; 8]>,
}

// SAFETY: Each slab owns its region exclusively; `head` points into it.
unsafe impl Send for SlabAllocator {}

impl SlabAllocator {
    /// Creates one slab of `slots_per_class` objects for every size class.
    ///
    /// # Panics
    ///
    /// Panics if `size_classes` is empty, if `slots_per_class` is zero, if
    /// any class rounds below pointer width, or if the power-of-two-rounded
    /// classes are not strictly increasing.
    pub fn new(slots_per_class: usize, size_classes: &[usize]) -> SlabAllocator {
        assert!(!size_classes.is_empty(), "at least one size class required");
        assert!(slots_per_class > 0, "each class needs at least one slot");

        let mut slabs = SmallVec::new();
        let mut previous = 0;

        for &class in size_classes {
            let class = next_power_of_two(class);

            assert!(
                class >= mem::size_of::<*mut u8>(),
                "size class {class} is too small to hold a free-list link",
            );
            assert!(
                class > previous,
                "size classes must be strictly increasing after power-of-two rounding",
            );
            previous = class;

            slabs.push(Slab::new(class, slots_per_class));
        }

        SlabAllocator { slabs }
    }

    /// Allocates from the smallest class that fits `size`.
    ///
    /// Returns [`None`] if no class is large enough or the fitting class is
    /// exhausted.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or exceeds
    /// [`MAX_SCALAR_ALIGN`].
    #[inline]
    pub fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        assert!(is_power_of_two(align), "alignment must be a power of two");
        assert!(
            align <= MAX_SCALAR_ALIGN,
            "slab alignment is limited to the maximum scalar alignment",
        );

        self.slabs
            .iter_mut()
            .find(|slab| size <= slab.class_size)?
            .allocate()
    }

    /// Returns `ptr` to the slab that owns it.
    ///
    /// # Panics
    ///
    /// Panics if `ptr` was not allocated from this allocator.
    pub fn deallocate(&mut self, ptr: NonNull<u8>) {
        for slab in &mut self.slabs {
            if slab.contains(ptr) {
                slab.deallocate(ptr);
                return;
            }
        }

        panic!("pointer was not allocated from this slab allocator");
    }

    /// Marks every slot in every class free again.
    pub fn reset(&mut self) {
        for slab in &mut self.slabs {
            slab.rebuild_free_list();
        }
    }

    /// Whether `ptr` lies within any slab's slot range.
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.slabs.iter().any(|slab| slab.contains(ptr))
    }

    /// Number of size classes.
    #[inline]
    pub fn slab_count(&self) -> usize {
        self.slabs.len()
    }

    /// The rounded size classes, ascending.
    pub fn size_classes(&self) -> impl ExactSizeIterator<Item = usize> + '_ {
        self.slabs.iter().map(|slab| slab.class_size)
    }

    /// Live slot count of class `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn slab_used_count(&self, index: usize) -> usize {
        self.slabs[index].used_count
    }

    /// Free slot count of class `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn slab_free_count(&self, index: usize) -> usize {
        let slab = &self.slabs[index];

        slab.slot_count - slab.used_count
    }
}

impl Allocator for SlabAllocator {
    #[inline]
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>> {
        self.allocate(size, align)
    }

    #[inline]
    fn deallocate(&mut self, ptr: NonNull<u8>) {
        self.deallocate(ptr);
    }

    /// Bytes in live slots, counted at the full class size.
    fn used(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.used_count * slab.class_size)
            .sum()
    }

    fn capacity(&self) -> usize {
        self.slabs
            .iter()
            .map(|slab| slab.slot_count * slab.class_size)
            .sum()
    }

    fn name(&self) -> &'static str {
        "slab"
    }
}
