//! Sub-allocation of device (GPU) memory.
//!
//! Drivers put a hard cap, typically a few thousand, on the number of live
//! device memory objects, and allocating one is expensive regardless. An
//! application that backed every texture and buffer with its own memory
//! object would exhaust the cap long before it exhausted VRAM. The
//! [`DeviceAllocator`] therefore allocates a small number of large *blocks*
//! (256 MiB by default) from the backend and hands out sub-ranges of them.
//!
//! # Memory classes
//!
//! Every allocation names a [`MemoryClass`], which routes it to one of three
//! pools:
//!
//! | Class | Backend properties | CPU mapping |
//! |---|---|---|
//! | [`DeviceLocal`] | device-local | never mapped |
//! | [`HostVisible`] | host-visible + coherent | persistently mapped |
//! | [`HostCached`] | host-visible + cached | persistently mapped |
//!
//! Host-visible blocks are mapped in full when they are created and stay
//! mapped until the allocator is dropped, so [`map`] never touches the
//! driver: the handle already carries its pointer.
//!
//! # Inside a block
//!
//! A block tracks its free space as a list of `(offset, size)` regions,
//! sorted by offset and always coalesced. Allocation is first-fit: the first
//! region that can fit the aligned request is trimmed in place. Alignment
//! padding is counted against the block's `used` and is *not* reclaimed when
//! the allocation is freed, a deliberate simplification whose cost shows up
//! in [`PoolStats::fragmentation_ratio`] rather than in bookkeeping
//! complexity.
//!
//! Blocks are never reclaimed individually; a pool only grows (up to its
//! block limit) and everything is released at allocator teardown.
//!
//! # Concurrency
//!
//! Each pool has its own lock, so allocations in distinct classes never
//! contend. Within one pool, every allocate/deallocate is linearizable.
//! Ordering of mapped-range maintenance against device work is the caller's
//! responsibility; the allocator provides none.
//!
//! [`DeviceLocal`]: MemoryClass::DeviceLocal
//! [`HostVisible`]: MemoryClass::HostVisible
//! [`HostCached`]: MemoryClass::HostCached
//! [`map`]: DeviceAllocator::map

pub mod backend;
#[cfg(test)]
pub(crate) mod mock;

pub use self::backend::{
    BackendError, DeviceBackend, MemoryPropertyFlags, MemoryRequirements, MemoryType,
};

use crate::DeviceSize;
use parking_lot::Mutex;
use smallvec::{smallvec, SmallVec};
use std::{
    cmp,
    error::Error,
    fmt::{self, Debug, Display},
    ptr::NonNull,
    sync::OnceLock,
};
use tracing::{debug, error, warn};

/// > **Note**: Returns `0` on overflow.
#[inline(always)]
const fn align_up(val: DeviceSize, alignment: DeviceSize) -> DeviceSize {
    val.wrapping_add(alignment - 1) & !(alignment - 1)
}

/// The semantic memory classes an allocation can be routed to.
///
/// The class decides which backend property flags are required and whether
/// blocks of the class are persistently mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemoryClass {
    /// Device-only memory (VRAM). Fastest for device access, never mapped.
    /// Textures, render targets, static vertex data.
    DeviceLocal,

    /// Host-writable, device-readable, coherent. Staging and per-frame
    /// dynamic data.
    HostVisible,

    /// Host-cached readback memory. Results written by the device and read
    /// back by the host.
    HostCached,
}

impl MemoryClass {
    const COUNT: usize = 3;

    /// The backend property flags an allocation of this class requires.
    pub const fn required_properties(self) -> MemoryPropertyFlags {
        match self {
            Self::DeviceLocal => MemoryPropertyFlags::DEVICE_LOCAL,
            Self::HostVisible => {
                MemoryPropertyFlags::HOST_VISIBLE.union(MemoryPropertyFlags::HOST_COHERENT)
            }
            Self::HostCached => {
                MemoryPropertyFlags::HOST_VISIBLE.union(MemoryPropertyFlags::HOST_CACHED)
            }
        }
    }

    /// Whether blocks of this class are persistently mapped at creation.
    pub const fn is_host_visible(self) -> bool {
        !matches!(self, Self::DeviceLocal)
    }

    const fn index(self) -> usize {
        self as usize
    }
}

impl Display for MemoryClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::DeviceLocal => "device-local",
            Self::HostVisible => "host-visible",
            Self::HostCached => "host-cached",
        };

        f.write_str(name)
    }
}

/// Parameters of a [`DeviceAllocator`].
#[derive(Clone, Copy, Debug)]
pub struct DeviceAllocatorCreateInfo {
    /// Nominal size of one pool block. A single allocation larger than this
    /// gets an oversized block of its own size.
    ///
    /// The default value is 256 MiB.
    pub block_size: DeviceSize,

    /// Upper bound on blocks per pool; reaching it makes further
    /// allocations fail with [`DeviceAllocatorError::OutOfBlocks`].
    ///
    /// The default value is `64`.
    pub max_blocks: u32,

    /// When `true`, [`PoolStats::allocation_count`] is an exact counter
    /// maintained on every allocate and deallocate. When `false` it falls
    /// back to the cheap `blocks − free regions` approximation, which can
    /// under-report.
    ///
    /// The default value is `true`.
    pub enable_tracking: bool,
}

impl Default for DeviceAllocatorCreateInfo {
    #[inline]
    fn default() -> Self {
        DeviceAllocatorCreateInfo {
            block_size: 256 * 1024 * 1024,
            max_blocks: 64,
            enable_tracking: true,
        }
    }
}

/// Memory usage of one class's pool.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PoolStats {
    /// Bytes handed out, alignment padding included.
    pub allocated_bytes: DeviceSize,

    /// Combined capacity of the pool's blocks.
    pub total_bytes: DeviceSize,

    /// Live allocations; exact or approximated depending on
    /// [`DeviceAllocatorCreateInfo::enable_tracking`].
    pub allocation_count: usize,

    /// Number of blocks the pool has created.
    pub block_count: usize,

    /// Mean over blocks of `1 − 1/max(1, free_regions)`; `0.0` is a single
    /// contiguous free range per block, approaching `1.0` means the free
    /// space is shattered.
    pub fragmentation_ratio: f32,
}

/// Error returned when the device allocator cannot satisfy a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceAllocatorError {
    /// No backend memory type satisfies the class's required properties
    /// (and the resource's type filter, where one applies).
    NoSuitableMemoryType,

    /// The pool already holds its configured maximum number of blocks.
    OutOfBlocks,

    /// The backend failed while creating or mapping a new block.
    Backend(BackendError),
}

impl Error for DeviceAllocatorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Backend(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for DeviceAllocatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoSuitableMemoryType => {
                f.write_str("no memory type satisfies the required properties")
            }
            Self::OutOfBlocks => f.write_str("the pool reached its block limit"),
            Self::Backend(err) => write!(f, "backend allocation failed: {err}"),
        }
    }
}

impl From<BackendError> for DeviceAllocatorError {
    fn from(err: BackendError) -> Self {
        Self::Backend(err)
    }
}

/// A sub-allocation of device memory.
///
/// The handle is a plain value: it owns nothing and is freely copyable. The
/// memory object and the mapping belong to the allocator's block; the
/// handle's pointers are borrows that must not be used after the allocation
/// is deallocated or the allocator is dropped.
///
/// [`DeviceAllocator::deallocate`] zeroes the handle it is given, so freeing
/// the same handle twice is a no-op rather than a corruption.
pub struct GpuAllocation<B: DeviceBackend> {
    /// The backend memory object the allocation lives in. Bind resources
    /// against this together with `offset`.
    pub memory: B::Memory,

    /// Byte offset of the allocation within the memory object.
    pub offset: DeviceSize,

    /// Requested size in bytes.
    pub size: DeviceSize,

    /// For host-visible classes, the persistently mapped address of this
    /// allocation; [`None`] for device-local memory.
    pub mapped_ptr: Option<NonNull<u8>>,

    /// Index of the owning block within its pool.
    pub block_index: u32,

    /// The backend memory-type index the owning pool allocates from.
    pub memory_type_index: u32,
}

impl<B: DeviceBackend> GpuAllocation<B> {
    /// The zeroed, invalid handle.
    pub fn null() -> Self {
        GpuAllocation {
            memory: B::Memory::default(),
            offset: 0,
            size: 0,
            mapped_ptr: None,
            block_index: 0,
            memory_type_index: 0,
        }
    }

    /// Whether the handle refers to a live allocation. Zeroed handles are
    /// invalid.
    #[inline]
    pub fn is_valid(&self) -> bool {
        self.size != 0
    }
}

impl<B: DeviceBackend> Clone for GpuAllocation<B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: DeviceBackend> Copy for GpuAllocation<B> {}

impl<B: DeviceBackend> Debug for GpuAllocation<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuAllocation")
            .field("memory", &self.memory)
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("mapped_ptr", &self.mapped_ptr)
            .field("block_index", &self.block_index)
            .field("memory_type_index", &self.memory_type_index)
            .finish()
    }
}

impl<B: DeviceBackend> PartialEq for GpuAllocation<B> {
    fn eq(&self, other: &Self) -> bool {
        self.memory == other.memory
            && self.offset == other.offset
            && self.size == other.size
            && self.mapped_ptr == other.mapped_ptr
            && self.block_index == other.block_index
            && self.memory_type_index == other.memory_type_index
    }
}

impl<B: DeviceBackend> Eq for GpuAllocation<B> {}

// SAFETY: The handle is a value; the mapped pointer inside it is a borrow
// of a mapping owned by the allocator, which callers may only dereference
// under the handle's liveness contract. `B::Memory` is `Send + Sync` by the
// trait bound.
unsafe impl<B: DeviceBackend> Send for GpuAllocation<B> {}
unsafe impl<B: DeviceBackend> Sync for GpuAllocation<B> {}

// A contiguous run of unused bytes within a block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FreeRegion {
    offset: DeviceSize,
    size: DeviceSize,
}

// One driver memory object, subdivided into allocations.
struct MemoryBlock<B: DeviceBackend> {
    memory: B::Memory,
    size: DeviceSize,
    // Bytes handed out plus alignment padding.
    used: DeviceSize,
    mapped_ptr: Option<NonNull<u8>>,
    allocation_count: usize,
    // Sorted by offset, non-overlapping, adjacent regions merged.
    free_regions: SmallVec<[FreeRegion; 8]>,
}

impl<B: DeviceBackend> MemoryBlock<B> {
    fn new(memory: B::Memory, size: DeviceSize, mapped_ptr: Option<NonNull<u8>>) -> Self {
        MemoryBlock {
            memory,
            size,
            used: 0,
            mapped_ptr,
            allocation_count: 0,
            free_regions: smallvec![FreeRegion { offset: 0, size }],
        }
    }

    // First-fit scan over the free regions. Returns the aligned offset, or
    // `None` if nothing in this block fits.
    fn suballocate(&mut self, size: DeviceSize, alignment: DeviceSize) -> Option<DeviceSize> {
        let mut found = None;

        for (index, region) in self.free_regions.iter().enumerate() {
            let aligned = align_up(region.offset, alignment);
            let padding = aligned - region.offset;

            if region.size >= size + padding {
                found = Some((index, aligned, padding));
                break;
            }
        }

        let (index, aligned, padding) = found?;

        let region = &mut self.free_regions[index];
        region.offset = aligned + size;
        region.size -= size + padding;

        if region.size == 0 {
            self.free_regions.remove(index);
        }

        self.used += size + padding;
        self.allocation_count += 1;

        Some(aligned)
    }

    // Returns `[offset, offset + size)` to the free list and merges
    // neighbors. Padding consumed by the original allocation is not
    // reclaimed.
    fn deallocate(&mut self, offset: DeviceSize, size: DeviceSize) {
        let index = match self
            .free_regions
            .binary_search_by_key(&offset, |region| region.offset)
        {
            // A region at this exact offset would mean the range is already
            // free.
            Ok(_) => {
                debug_assert!(false, "double free inside a device memory block");
                return;
            }
            Err(index) => index,
        };

        self.free_regions.insert(index, FreeRegion { offset, size });
        self.coalesce();

        debug_assert!(self.used >= size);
        self.used -= size;
        self.allocation_count = self.allocation_count.saturating_sub(1);
    }

    // Single pass; relies on the list being sorted by offset.
    fn coalesce(&mut self) {
        if self.free_regions.len() <= 1 {
            return;
        }

        let mut merged: SmallVec<[FreeRegion; 8]> = SmallVec::with_capacity(self.free_regions.len());
        let mut current = self.free_regions[0];

        for &next in &self.free_regions[1..] {
            if current.offset + current.size == next.offset {
                current.size += next.size;
            } else {
                merged.push(current);
                current = next;
            }
        }
        merged.push(current);

        self.free_regions = merged;
    }

    fn fragmentation(&self) -> f32 {
        if self.free_regions.is_empty() {
            0.0
        } else {
            1.0 - 1.0 / self.free_regions.len() as f32
        }
    }
}

// One memory class's collection of blocks.
struct MemoryPool<B: DeviceBackend> {
    class: MemoryClass,
    memory_type_index: u32,
    block_size: DeviceSize,
    blocks: Mutex<Vec<MemoryBlock<B>>>,
}

/// A thread-safe sub-allocator over a graphics backend's device memory.
///
/// See the [module documentation] for the allocation scheme. One pool per
/// [`MemoryClass`] is created lazily on that class's first allocation,
/// picking the first backend memory type that satisfies the class's
/// required property flags.
///
/// Dropping the allocator unmaps and frees every block. All handles and
/// mapped pointers obtained from it are invalid from that point on.
///
/// # Example
///
/// ```no_run
/// # fn example<B: reservoir::device::DeviceBackend>(backend: B) {
/// use reservoir::device::{DeviceAllocator, DeviceAllocatorCreateInfo, MemoryClass};
///
/// let allocator = DeviceAllocator::new(backend, DeviceAllocatorCreateInfo::default());
///
/// let mut staging = allocator
///     .allocate(1024 * 1024, 256, MemoryClass::HostVisible)
///     .unwrap();
///
/// // Host-visible allocations arrive persistently mapped.
/// let ptr = staging.mapped_ptr.unwrap();
/// # let _ = ptr;
///
/// allocator.deallocate(&mut staging);
/// # }
/// ```
///
/// [module documentation]: self
pub struct DeviceAllocator<B: DeviceBackend> {
    backend: B,
    memory_types: Vec<MemoryType>,
    create_info: DeviceAllocatorCreateInfo,
    // Lazily initialized, indexed by `MemoryClass::index`.
    pools: [OnceLock<MemoryPool<B>>; MemoryClass::COUNT],
}

// SAFETY: The raw mapped pointers stored in blocks are owned by the
// allocator and only handed out as borrows; all block state is behind the
// pool locks.
unsafe impl<B: DeviceBackend + Send> Send for DeviceAllocator<B> {}
unsafe impl<B: DeviceBackend + Sync> Sync for DeviceAllocator<B> {}

impl<B: DeviceBackend> DeviceAllocator<B> {
    /// Creates an allocator over `backend`.
    ///
    /// No device memory is allocated up front; blocks are created as the
    /// classes are first used.
    pub fn new(backend: B, create_info: DeviceAllocatorCreateInfo) -> Self {
        let memory_types = backend.memory_types();

        debug!(
            block_size = create_info.block_size,
            max_blocks = create_info.max_blocks,
            memory_types = memory_types.len(),
            "device allocator initialized",
        );

        DeviceAllocator {
            backend,
            memory_types,
            create_info,
            pools: std::array::from_fn(|_| OnceLock::new()),
        }
    }

    /// The backend this allocator allocates from.
    #[inline]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Finds the first memory type allowed by `type_filter` whose property
    /// flags contain `properties`, or [`None`] if the device has no such
    /// type.
    ///
    /// `type_filter` has one bit per memory-type index, as in
    /// [`MemoryRequirements::memory_type_bits`].
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: MemoryPropertyFlags,
    ) -> Option<u32> {
        self.memory_types
            .iter()
            .enumerate()
            .position(|(index, memory_type)| {
                type_filter & (1 << index) != 0
                    && memory_type.property_flags.contains(properties)
            })
            .map(|index| index as u32)
    }

    // Resolves the class's pool, creating it on first use.
    fn pool(&self, class: MemoryClass) -> Result<&MemoryPool<B>, DeviceAllocatorError> {
        let cell = &self.pools[class.index()];

        if let Some(pool) = cell.get() {
            return Ok(pool);
        }

        let memory_type_index = self
            .find_memory_type(u32::MAX, class.required_properties())
            .ok_or(DeviceAllocatorError::NoSuitableMemoryType)?;

        // Two racing initializers compute the same pool; the loser's value
        // is dropped.
        let _ = cell.set(MemoryPool {
            class,
            memory_type_index,
            block_size: self.create_info.block_size,
            blocks: Mutex::new(Vec::new()),
        });

        Ok(cell.get().unwrap())
    }

    #[cold]
    fn allocate_block(
        &self,
        pool: &MemoryPool<B>,
        size: DeviceSize,
    ) -> Result<MemoryBlock<B>, DeviceAllocatorError> {
        let memory = self.backend.allocate_memory(size, pool.memory_type_index)?;

        let mapped_ptr = if pool.class.is_host_visible() {
            match self.backend.map_memory(memory, size) {
                Ok(ptr) => Some(ptr),
                Err(err) => {
                    // Don't leak the fresh memory object on a failed map.
                    self.backend.free_memory(memory);
                    error!(class = %pool.class, size, "mapping a new block failed");
                    return Err(err.into());
                }
            }
        } else {
            None
        };

        debug!(class = %pool.class, size, "allocated new device memory block");

        Ok(MemoryBlock::new(memory, size, mapped_ptr))
    }

    fn make_allocation(
        pool: &MemoryPool<B>,
        block: &MemoryBlock<B>,
        block_index: usize,
        offset: DeviceSize,
        size: DeviceSize,
    ) -> GpuAllocation<B> {
        // SAFETY: `offset` lies within the mapped block.
        let mapped_ptr = block
            .mapped_ptr
            .map(|ptr| unsafe { NonNull::new_unchecked(ptr.as_ptr().add(offset as usize)) });

        GpuAllocation {
            memory: block.memory,
            offset,
            size,
            mapped_ptr,
            block_index: block_index as u32,
            memory_type_index: pool.memory_type_index,
        }
    }

    /// Allocates `size` bytes at `alignment` from the given class's pool.
    ///
    /// Existing blocks are tried in order; if none fits and the pool is
    /// under its block limit, a new block of
    /// `max(block_size, size + alignment)` is created, so a single allocation
    /// larger than the nominal block size therefore gets an oversized block
    /// of its own.
    ///
    /// # Errors
    ///
    /// - [`NoSuitableMemoryType`] if the device has no memory type with the
    ///   class's required properties.
    /// - [`OutOfBlocks`] if no block fits and the pool is at its limit.
    /// - [`Backend`] if the backend fails to allocate or map a new block.
    ///
    /// # Panics
    ///
    /// Panics if `size` is zero or `alignment` is not a power of two.
    ///
    /// [`NoSuitableMemoryType`]: DeviceAllocatorError::NoSuitableMemoryType
    /// [`OutOfBlocks`]: DeviceAllocatorError::OutOfBlocks
    /// [`Backend`]: DeviceAllocatorError::Backend
    pub fn allocate(
        &self,
        size: DeviceSize,
        alignment: DeviceSize,
        class: MemoryClass,
    ) -> Result<GpuAllocation<B>, DeviceAllocatorError> {
        assert!(size > 0, "cannot allocate zero bytes of device memory");
        assert!(
            alignment.is_power_of_two(),
            "alignment must be a power of two",
        );

        let pool = self.pool(class)?;
        let mut blocks = pool.blocks.lock();

        for (block_index, block) in blocks.iter_mut().enumerate() {
            if let Some(offset) = block.suballocate(size, alignment) {
                return Ok(Self::make_allocation(pool, block, block_index, offset, size));
            }
        }

        if blocks.len() as u32 >= self.create_info.max_blocks {
            error!(
                class = %pool.class,
                max_blocks = self.create_info.max_blocks,
                "pool reached its block limit",
            );
            return Err(DeviceAllocatorError::OutOfBlocks);
        }

        let block_size = cmp::max(pool.block_size, size + alignment);
        let mut block = self.allocate_block(pool, block_size)?;

        let offset = match block.suballocate(size, alignment) {
            Some(offset) => offset,
            // A fresh block was sized to fit this very request.
            None => unreachable!(),
        };

        blocks.push(block);
        let block_index = blocks.len() - 1;

        Ok(Self::make_allocation(
            pool,
            &blocks[block_index],
            block_index,
            offset,
            size,
        ))
    }

    /// Allocates memory satisfying `buffer`'s requirements from the given
    /// class.
    ///
    /// The buffer's memory-type filter is validated against the class up
    /// front, so an incompatible resource fails with
    /// [`NoSuitableMemoryType`] instead of binding to the wrong type later.
    ///
    /// [`NoSuitableMemoryType`]: DeviceAllocatorError::NoSuitableMemoryType
    pub fn allocate_for_buffer(
        &self,
        buffer: &B::Buffer,
        class: MemoryClass,
    ) -> Result<GpuAllocation<B>, DeviceAllocatorError> {
        let requirements = self.backend.buffer_memory_requirements(buffer);

        self.allocate_for_requirements(requirements, class)
    }

    /// Allocates memory satisfying `image`'s requirements from the given
    /// class. See [`allocate_for_buffer`].
    ///
    /// [`allocate_for_buffer`]: Self::allocate_for_buffer
    pub fn allocate_for_image(
        &self,
        image: &B::Image,
        class: MemoryClass,
    ) -> Result<GpuAllocation<B>, DeviceAllocatorError> {
        let requirements = self.backend.image_memory_requirements(image);

        self.allocate_for_requirements(requirements, class)
    }

    fn allocate_for_requirements(
        &self,
        requirements: MemoryRequirements,
        class: MemoryClass,
    ) -> Result<GpuAllocation<B>, DeviceAllocatorError> {
        self.find_memory_type(requirements.memory_type_bits, class.required_properties())
            .ok_or(DeviceAllocatorError::NoSuitableMemoryType)?;

        self.allocate(requirements.size, requirements.alignment, class)
    }

    /// Returns an allocation to its block and zeroes the handle.
    ///
    /// Freeing an already-zeroed handle is a no-op, which makes an
    /// accidental double free harmless. A handle that never came from this
    /// allocator is logged and ignored.
    pub fn deallocate(&self, allocation: &mut GpuAllocation<B>) {
        if !allocation.is_valid() {
            return;
        }

        // A block's class is its pool's class; recover it through the
        // memory-type index recorded in the handle.
        let pool = self
            .pools
            .iter()
            .filter_map(OnceLock::get)
            .find(|pool| pool.memory_type_index == allocation.memory_type_index);

        let Some(pool) = pool else {
            error!(
                memory_type_index = allocation.memory_type_index,
                "deallocated handle does not match any pool",
            );
            return;
        };

        let mut blocks = pool.blocks.lock();

        let Some(block) = blocks.get_mut(allocation.block_index as usize) else {
            error!(
                block_index = allocation.block_index,
                "deallocated handle names a block that does not exist",
            );
            return;
        };

        block.deallocate(allocation.offset, allocation.size);

        *allocation = GpuAllocation::null();
    }

    /// The persistently mapped address of the allocation.
    ///
    /// Host-visible blocks are mapped when created, so this is a lookup,
    /// not a driver call. Device-local memory is not mappable; asking for
    /// it logs a warning and returns [`None`].
    pub fn map(&self, allocation: &GpuAllocation<B>) -> Option<NonNull<u8>> {
        if !allocation.is_valid() {
            return None;
        }

        if allocation.mapped_ptr.is_none() {
            warn!("mapping device-local memory is not supported");
        }

        allocation.mapped_ptr
    }

    /// Does nothing: mappings are persistent and belong to the block.
    pub fn unmap(&self, _allocation: &GpuAllocation<B>) {}

    /// Makes host writes to the allocation's range visible to the device.
    /// No-op for unmapped (device-local) allocations.
    pub fn flush(&self, allocation: &GpuAllocation<B>) {
        if allocation.is_valid() && allocation.mapped_ptr.is_some() {
            self.backend
                .flush_mapped_range(allocation.memory, allocation.offset, allocation.size);
        }
    }

    /// Makes device writes to the allocation's range visible to the host.
    /// No-op for unmapped (device-local) allocations.
    pub fn invalidate(&self, allocation: &GpuAllocation<B>) {
        if allocation.is_valid() && allocation.mapped_ptr.is_some() {
            self.backend
                .invalidate_mapped_range(allocation.memory, allocation.offset, allocation.size);
        }
    }

    /// Bytes handed out from the class's pool, padding included.
    pub fn allocated_bytes(&self, class: MemoryClass) -> DeviceSize {
        self.stats(class).allocated_bytes
    }

    /// Combined capacity of the class's blocks.
    pub fn total_bytes(&self, class: MemoryClass) -> DeviceSize {
        self.stats(class).total_bytes
    }

    /// Usage statistics of the class's pool. All zeros if the class has
    /// never been allocated from.
    pub fn stats(&self, class: MemoryClass) -> PoolStats {
        let Some(pool) = self.pools[class.index()].get() else {
            return PoolStats::default();
        };

        let blocks = pool.blocks.lock();

        let mut stats = PoolStats {
            block_count: blocks.len(),
            ..PoolStats::default()
        };
        let mut free_region_count = 0;
        let mut exact_count = 0;

        for block in blocks.iter() {
            stats.allocated_bytes += block.used;
            stats.total_bytes += block.size;
            stats.fragmentation_ratio += block.fragmentation();
            free_region_count += block.free_regions.len();
            exact_count += block.allocation_count;
        }

        if !blocks.is_empty() {
            stats.fragmentation_ratio /= blocks.len() as f32;
        }

        stats.allocation_count = if self.create_info.enable_tracking {
            exact_count
        } else {
            blocks.len().saturating_sub(free_region_count)
        };

        stats
    }
}

impl<B: DeviceBackend> Drop for DeviceAllocator<B> {
    fn drop(&mut self) {
        for pool in self.pools.iter().filter_map(OnceLock::get) {
            let mut blocks = pool.blocks.lock();

            for block in blocks.drain(..) {
                if block.mapped_ptr.is_some() {
                    self.backend.unmap_memory(block.memory);
                }
                self.backend.free_memory(block.memory);
            }
        }

        debug!("device allocator shut down");
    }
}

impl<B: DeviceBackend> Debug for DeviceAllocator<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceAllocator")
            .field("create_info", &self.create_info)
            .field("memory_types", &self.memory_types)
            .finish_non_exhaustive()
    }
}
