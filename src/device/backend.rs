//! The contract a graphics backend must fulfil for the device allocator.
//!
//! The allocator does not bind to any concrete graphics API. Everything it
//! needs from the driver (memory-type enumeration, raw allocate/free of a
//! memory object, persistent mapping, and mapped-range maintenance) is
//! expressed by [`DeviceBackend`]. A Vulkan backend maps these operations
//! onto `vkAllocateMemory` and friends; other APIs fit the same shape. The
//! allocator is monomorphized over the backend; there is no runtime
//! dispatch.

use crate::DeviceSize;
use std::{
    error::Error,
    fmt::{self, Debug, Display},
    ops::BitOr,
    ptr::NonNull,
    sync::Arc,
};

/// Properties of a backend memory type, in the driver's own numbering.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryType {
    pub property_flags: MemoryPropertyFlags,
}

/// What a backend requires of the memory backing a resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryRequirements {
    /// Number of bytes required.
    pub size: DeviceSize,

    /// Required alignment of the allocation's offset, a power of two.
    pub alignment: DeviceSize,

    /// One bit per memory-type index the resource can live in.
    pub memory_type_bits: u32,
}

/// Property flags of a backend memory type.
///
/// These mirror the semantic classes the allocator routes on; a backend
/// translates its own flag bits into these.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct MemoryPropertyFlags(u32);

impl MemoryPropertyFlags {
    /// Memory local to the device; fastest for device access, not
    /// necessarily visible to the host.
    pub const DEVICE_LOCAL: Self = Self(1 << 0);

    /// Memory the host can map.
    pub const HOST_VISIBLE: Self = Self(1 << 1);

    /// Host writes become device-visible without explicit flushes and vice
    /// versa.
    pub const HOST_COHERENT: Self = Self(1 << 2);

    /// Memory cached on the host; faster host reads, may need invalidation.
    pub const HOST_CACHED: Self = Self(1 << 3);

    /// Memory the driver may commit lazily; unsuitable for suballocation.
    pub const LAZILY_ALLOCATED: Self = Self(1 << 4);

    /// No flags set.
    #[inline]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Whether every flag in `other` is also set in `self`.
    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Whether any flag is set in both.
    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }

    /// The flags set in either.
    #[inline]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

impl BitOr for MemoryPropertyFlags {
    type Output = Self;

    #[inline]
    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl Debug for MemoryPropertyFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut write = |name: &str| -> fmt::Result {
            if !first {
                f.write_str(" | ")?;
            }
            first = false;
            f.write_str(name)
        };

        if self.contains(Self::DEVICE_LOCAL) {
            write("DEVICE_LOCAL")?;
        }
        if self.contains(Self::HOST_VISIBLE) {
            write("HOST_VISIBLE")?;
        }
        if self.contains(Self::HOST_COHERENT) {
            write("HOST_COHERENT")?;
        }
        if self.contains(Self::HOST_CACHED) {
            write("HOST_CACHED")?;
        }
        if self.contains(Self::LAZILY_ALLOCATED) {
            write("LAZILY_ALLOCATED")?;
        }
        if first {
            f.write_str("(empty)")?;
        }

        Ok(())
    }
}

/// Error returned by a backend for driver-level failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackendError {
    /// The driver could not satisfy a device memory allocation.
    OutOfDeviceMemory,

    /// The driver could not satisfy a host-side allocation.
    OutOfHostMemory,

    /// Mapping a memory object into the host address space failed.
    MapFailed,
}

impl Error for BackendError {}

impl Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            Self::OutOfDeviceMemory => "out of device memory",
            Self::OutOfHostMemory => "out of host memory",
            Self::MapFailed => "memory mapping failed",
        };

        f.write_str(msg)
    }
}

/// The operations the device allocator requires from a graphics backend.
///
/// # Contract
///
/// - `memory_types` must be stable for the lifetime of the backend; the
///   allocator caches it once.
/// - A memory object returned by `allocate_memory` stays valid until passed
///   to `free_memory` exactly once.
/// - `map_memory` maps the whole object from offset zero and the returned
///   pointer stays valid until `unmap_memory`. The allocator maps a
///   host-visible object at most once (persistent mapping).
/// - `flush_mapped_range` / `invalidate_mapped_range` receive offsets
///   relative to the memory object. On coherent memory they may be no-ops.
pub trait DeviceBackend {
    /// The backend's handle to one driver memory object. `Default` must
    /// produce the backend's null handle.
    type Memory: Copy + Eq + Default + Debug + Send + Sync;

    /// The backend's buffer resource, queried for requirements only.
    type Buffer;

    /// The backend's image resource, queried for requirements only.
    type Image;

    /// The memory types the device exposes, indexed by position.
    fn memory_types(&self) -> Vec<MemoryType>;

    /// Allocates one memory object of `size` bytes from the given type.
    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self::Memory, BackendError>;

    /// Releases a memory object. Must not be mapped at this point.
    fn free_memory(&self, memory: Self::Memory);

    /// Maps the whole memory object into host address space.
    fn map_memory(&self, memory: Self::Memory, size: DeviceSize)
        -> Result<NonNull<u8>, BackendError>;

    /// Unmaps a previously mapped memory object.
    fn unmap_memory(&self, memory: Self::Memory);

    /// Makes host writes in the given range visible to the device.
    fn flush_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize);

    /// Makes device writes in the given range visible to the host.
    fn invalidate_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize);

    /// Memory requirements of a buffer resource.
    fn buffer_memory_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements;

    /// Memory requirements of an image resource.
    fn image_memory_requirements(&self, image: &Self::Image) -> MemoryRequirements;
}

impl<T: DeviceBackend> DeviceBackend for Arc<T> {
    type Memory = T::Memory;
    type Buffer = T::Buffer;
    type Image = T::Image;

    fn memory_types(&self) -> Vec<MemoryType> {
        (**self).memory_types()
    }

    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self::Memory, BackendError> {
        (**self).allocate_memory(size, memory_type_index)
    }

    fn free_memory(&self, memory: Self::Memory) {
        (**self).free_memory(memory)
    }

    fn map_memory(
        &self,
        memory: Self::Memory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, BackendError> {
        (**self).map_memory(memory, size)
    }

    fn unmap_memory(&self, memory: Self::Memory) {
        (**self).unmap_memory(memory)
    }

    fn flush_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize) {
        (**self).flush_mapped_range(memory, offset, size)
    }

    fn invalidate_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize) {
        (**self).invalidate_mapped_range(memory, offset, size)
    }

    fn buffer_memory_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements {
        (**self).buffer_memory_requirements(buffer)
    }

    fn image_memory_requirements(&self, image: &Self::Image) -> MemoryRequirements {
        (**self).image_memory_requirements(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_algebra() {
        let host = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_COHERENT;

        assert!(host.contains(MemoryPropertyFlags::HOST_VISIBLE));
        assert!(host.contains(host));
        assert!(!host.contains(MemoryPropertyFlags::DEVICE_LOCAL));
        assert!(host.intersects(MemoryPropertyFlags::HOST_COHERENT));
        assert!(!host.intersects(MemoryPropertyFlags::HOST_CACHED));
        assert!(MemoryPropertyFlags::empty().is_empty());
        assert!(host.contains(MemoryPropertyFlags::empty()));
    }

    #[test]
    fn flags_format_by_name() {
        let flags = MemoryPropertyFlags::HOST_VISIBLE | MemoryPropertyFlags::HOST_CACHED;
        assert_eq!(format!("{flags:?}"), "HOST_VISIBLE | HOST_CACHED");
        assert_eq!(format!("{:?}", MemoryPropertyFlags::empty()), "(empty)");
    }
}
