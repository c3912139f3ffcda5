//! Fixed-capacity, deterministic allocators for hot paths in real-time
//! runtimes.
//!
//! General-purpose heap allocation is a poor fit for frame loops: its cost is
//! unpredictable, it fragments over time, and it hides exhaustion behind
//! paging and overcommit until the worst possible moment. The allocators in
//! this crate trade generality for determinism. Every allocator owns a fixed
//! amount of memory, set at construction and never grown. When that memory
//! runs out, the allocator says so; there is no hidden fallback to the
//! system heap.
//!
//! # Choosing an allocator
//!
//! - [`LinearAllocator`] bumps a cursor and can only free everything at once.
//!   It is the fastest possible allocator and the right choice for
//!   frame-scoped scratch data that is thrown away wholesale.
//! - [`StackAllocator`] is a linear allocator whose cursor can be captured in
//!   a [marker] and restored later, giving scoped, LIFO bulk-frees for nested
//!   temporary allocations.
//! - [`PoolAllocator`] hands out fixed-size slots from a free-list and
//!   recycles them in O(1). Use it for objects of one type with a high
//!   create/destroy rate, such as entities or particles.
//! - [`SlabAllocator`] is a row of independent pools, one per power-of-two
//!   size class, with requests routed to the smallest class that fits.
//! - [`BuddyAllocator`] serves mixed sizes by splitting power-of-two blocks
//!   and coalescing freed buddies, keeping external fragmentation low for
//!   longer-lived allocations.
//! - [`DeviceAllocator`](device::DeviceAllocator) multiplexes a small number
//!   of large driver memory objects into many sub-allocations, because
//!   drivers typically cap the number of device memory objects at a few
//!   thousand. It is the only thread-safe allocator in the crate.
//!
//! # Failure model
//!
//! Exhaustion is reported, never papered over: the CPU allocators return
//! [`None`], the device allocator returns a typed error. Misuse (an
//! alignment that is not a power of two, a marker beyond the cursor, freeing
//! a pointer through the wrong allocator) is a programming error and
//! panics.
//!
//! # Thread safety
//!
//! The CPU allocators are single-threaded; wrap them in a mutex if you must
//! share one. Their operations never block and never touch the OS after
//! construction. The device allocator synchronizes internally with one lock
//! per memory class, so work against distinct classes never contends.
//!
//! [marker]: host::stack::Marker

pub mod align;
pub mod device;
pub mod host;
mod page;

pub use self::{
    host::{BuddyAllocator, LinearAllocator, PoolAllocator, SlabAllocator, StackAllocator},
    page::PageRegion,
};

use std::ptr::NonNull;

/// Sizes and offsets of device (GPU) memory, which may exceed the host's
/// address space on 32-bit targets.
pub type DeviceSize = u64;

/// The behavioral capability shared by every CPU-side allocator.
///
/// Consumers should prefer being generic over `A: Allocator` so the compiler
/// can monomorphize the hot path; `dyn Allocator` remains available where a
/// heterogeneous collection of allocators is genuinely required.
///
/// The receiver is `&mut self`: these allocators are single-threaded by
/// contract and sharing one across threads requires an external mutex.
pub trait Allocator {
    /// Allocates `size` bytes aligned to `align`, or returns [`None`] when
    /// the fixed capacity cannot satisfy the request.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two, or on allocator-specific
    /// contract violations (see the implementors).
    fn allocate(&mut self, size: usize, align: usize) -> Option<NonNull<u8>>;

    /// Returns an allocation to the allocator.
    ///
    /// What this does is allocator-specific: linear and stack allocators
    /// ignore it, pools and the buddy recycle the memory, and the slab
    /// panics if the pointer was not allocated from it.
    fn deallocate(&mut self, ptr: NonNull<u8>);

    /// Bytes currently handed out. The exact accounting varies per
    /// allocator; see the implementors.
    fn used(&self) -> usize;

    /// Total bytes owned by this allocator, fixed at construction.
    fn capacity(&self) -> usize;

    /// A short name for diagnostics.
    fn name(&self) -> &'static str;
}
