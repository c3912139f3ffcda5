//! The CPU-side allocator family.
//!
//! All five allocators share the same shape: a fixed [`PageRegion`] acquired
//! at construction, O(1) or near-O(1) operations against it, and a [`None`]
//! return (never a heap fallback) when the region is exhausted. They are
//! single-threaded; see the crate docs for the concurrency contract.
//!
//! [`PageRegion`]: crate::PageRegion

pub mod buddy;
pub mod linear;
pub mod pool;
pub mod slab;
pub mod stack;

pub use self::{
    buddy::BuddyAllocator, linear::LinearAllocator, pool::PoolAllocator, slab::SlabAllocator,
    stack::StackAllocator,
};
