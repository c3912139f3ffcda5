//! A process-local backend double for the device allocator tests.
//!
//! Memory objects are plain ids; only mapped objects get real host storage,
//! so tests can use device-local blocks of hundreds of mebibytes without
//! committing a byte. The backend keeps leak accounting so tests can assert
//! that allocator teardown released everything.

use super::backend::{
    BackendError, DeviceBackend, MemoryPropertyFlags, MemoryRequirements, MemoryType,
};
use crate::DeviceSize;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    ptr::NonNull,
    sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
};

struct MockObject {
    size: DeviceSize,
    mapping: Option<Box<[u8]>>,
}

pub(crate) struct MockBackend {
    memory_types: Vec<MemoryType>,
    objects: Mutex<HashMap<u64, MockObject>>,
    next_handle: AtomicU64,
    fail_next_allocation: AtomicBool,
    fail_next_map: AtomicBool,
    pub(crate) flush_calls: AtomicUsize,
    pub(crate) invalidate_calls: AtomicUsize,
}

// A buffer-like resource described only by its requirements.
pub(crate) struct MockBuffer {
    pub(crate) requirements: MemoryRequirements,
}

impl MockBackend {
    // Memory types of a typical discrete GPU.
    pub(crate) fn new() -> MockBackend {
        Self::with_memory_types(vec![
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_CACHED,
            },
            MemoryType {
                property_flags: MemoryPropertyFlags::DEVICE_LOCAL
                    | MemoryPropertyFlags::HOST_VISIBLE
                    | MemoryPropertyFlags::HOST_COHERENT,
            },
        ])
    }

    pub(crate) fn with_memory_types(memory_types: Vec<MemoryType>) -> MockBackend {
        MockBackend {
            memory_types,
            objects: Mutex::new(HashMap::new()),
            next_handle: AtomicU64::new(1),
            fail_next_allocation: AtomicBool::new(false),
            fail_next_map: AtomicBool::new(false),
            flush_calls: AtomicUsize::new(0),
            invalidate_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn fail_next_allocation(&self) {
        self.fail_next_allocation.store(true, Ordering::SeqCst);
    }

    pub(crate) fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.objects.lock().len()
    }

    pub(crate) fn live_mappings(&self) -> usize {
        self.objects
            .lock()
            .values()
            .filter(|object| object.mapping.is_some())
            .count()
    }
}

impl DeviceBackend for MockBackend {
    type Memory = u64;
    type Buffer = MockBuffer;
    type Image = MockBuffer;

    fn memory_types(&self) -> Vec<MemoryType> {
        self.memory_types.clone()
    }

    fn allocate_memory(
        &self,
        size: DeviceSize,
        memory_type_index: u32,
    ) -> Result<Self::Memory, BackendError> {
        assert!((memory_type_index as usize) < self.memory_types.len());

        if self.fail_next_allocation.swap(false, Ordering::SeqCst) {
            return Err(BackendError::OutOfDeviceMemory);
        }

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.objects
            .lock()
            .insert(handle, MockObject { size, mapping: None });

        Ok(handle)
    }

    fn free_memory(&self, memory: Self::Memory) {
        let object = self.objects.lock().remove(&memory);

        let object = object.expect("freed an unknown memory object");
        assert!(object.mapping.is_none(), "freed a still-mapped object");
    }

    fn map_memory(
        &self,
        memory: Self::Memory,
        size: DeviceSize,
    ) -> Result<NonNull<u8>, BackendError> {
        if self.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(BackendError::MapFailed);
        }

        let mut objects = self.objects.lock();
        let object = objects.get_mut(&memory).expect("mapped an unknown object");

        assert!(object.mapping.is_none(), "object mapped twice");
        assert!(size <= object.size);

        // The box's storage is stable even as the map rehashes.
        let mapping = vec![0u8; size as usize].into_boxed_slice();
        let ptr = NonNull::new(object.mapping.insert(mapping).as_mut_ptr()).unwrap();

        Ok(ptr)
    }

    fn unmap_memory(&self, memory: Self::Memory) {
        let mut objects = self.objects.lock();
        let object = objects.get_mut(&memory).expect("unmapped an unknown object");

        assert!(object.mapping.take().is_some(), "object was not mapped");
    }

    fn flush_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize) {
        let objects = self.objects.lock();
        let object = &objects[&memory];

        assert!(object.mapping.is_some());
        assert!(offset + size <= object.size);

        self.flush_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn invalidate_mapped_range(&self, memory: Self::Memory, offset: DeviceSize, size: DeviceSize) {
        let objects = self.objects.lock();
        let object = &objects[&memory];

        assert!(object.mapping.is_some());
        assert!(offset + size <= object.size);

        self.invalidate_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn buffer_memory_requirements(&self, buffer: &Self::Buffer) -> MemoryRequirements {
        buffer.requirements
    }

    fn image_memory_requirements(&self, image: &Self::Image) -> MemoryRequirements {
        image.requirements
    }
}
