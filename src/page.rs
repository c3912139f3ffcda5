//! The page provider underlying every CPU-side allocator.
//!
//! Allocators in this crate reserve all of their memory up front as one
//! anonymous, page-aligned mapping and hand pieces of it out themselves. The
//! OS is involved exactly twice per allocator: once at construction and once
//! at destruction.

use std::ptr::NonNull;

/// An owned, page-aligned region of readable and writable memory.
///
/// The region is acquired from the OS at page granularity and released back
/// when dropped. It is never grown, shrunk, or made executable.
pub struct PageRegion {
    ptr: NonNull<u8>,
    len: usize,
}

// SAFETY: The region is exclusively owned; nothing aliases it until the
// owner hands out pointers, at which point the owner's own synchronization
// contract applies.
unsafe impl Send for PageRegion {}
unsafe impl Sync for PageRegion {}

impl PageRegion {
    /// Acquires a fresh region of at least `len` bytes from the OS.
    ///
    /// The memory is zero-filled on unix targets; elsewhere its contents are
    /// unspecified.
    ///
    /// # Panics
    ///
    /// Panics if `len` is zero or if the OS refuses the mapping. Running out
    /// of address space for a fixed-capacity arena is not a recoverable
    /// condition for the runtime that sized it.
    pub fn acquire(len: usize) -> PageRegion {
        assert!(len > 0, "cannot acquire an empty page region");

        let ptr = sys::map(len);

        PageRegion { ptr, len }
    }

    /// The first byte of the region.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// The byte count requested at acquisition.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the region is empty. It never is; this exists for clippy's
    /// `len`-without-`is_empty` convention.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Drop for PageRegion {
    fn drop(&mut self) {
        // SAFETY: `ptr` and `len` describe the mapping acquired in
        // `acquire` and are released exactly once.
        unsafe { sys::unmap(self.ptr, self.len) };
    }
}

impl std::fmt::Debug for PageRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageRegion")
            .field("ptr", &self.ptr)
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(unix)]
mod sys {
    use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};
    use std::ptr::NonNull;

    pub(super) fn map(len: usize) -> NonNull<u8> {
        // SAFETY: A null hint lets the kernel pick a page-aligned address;
        // the resulting mapping is private and owned by the caller.
        let ptr = unsafe {
            mmap_anonymous(
                std::ptr::null_mut(),
                len,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE,
            )
        };

        match ptr {
            Ok(ptr) => NonNull::new(ptr.cast()).unwrap(),
            Err(err) => panic!("failed to map {len} bytes of anonymous pages: {err}"),
        }
    }

    /// # Safety
    ///
    /// `ptr` and `len` must describe a live mapping produced by [`map`].
    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        // The kernel rounds `len` up to page granularity, matching what
        // `mmap` reserved.
        let _ = unsafe { munmap(ptr.as_ptr().cast(), len) };
    }
}

#[cfg(not(unix))]
mod sys {
    use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
    use std::ptr::NonNull;

    // A conservative page size for targets without an mmap-style API; the
    // global allocator satisfies the alignment either way.
    const PAGE_ALIGN: usize = 4096;

    fn layout(len: usize) -> Layout {
        Layout::from_size_align(len, PAGE_ALIGN).expect("page region length overflows a layout")
    }

    pub(super) fn map(len: usize) -> NonNull<u8> {
        let layout = layout(len);

        // SAFETY: `len` is non-zero, checked by the caller.
        let ptr = unsafe { alloc(layout) };

        match NonNull::new(ptr) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        }
    }

    /// # Safety
    ///
    /// `ptr` and `len` must describe a live allocation produced by [`map`].
    pub(super) unsafe fn unmap(ptr: NonNull<u8>, len: usize) {
        unsafe { dealloc(ptr.as_ptr(), layout(len)) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_write_release() {
        let region = PageRegion::acquire(4096);
        assert_eq!(region.len(), 4096);

        // The whole region must be writable and readable.
        unsafe {
            let ptr = region.ptr().as_ptr();
            ptr.write(0xa5);
            ptr.add(4095).write(0x5a);
            assert_eq!(ptr.read(), 0xa5);
            assert_eq!(ptr.add(4095).read(), 0x5a);
        }
    }

    #[test]
    fn odd_lengths_are_accepted() {
        let region = PageRegion::acquire(100);
        assert_eq!(region.len(), 100);
        unsafe { region.ptr().as_ptr().add(99).write(1) };
    }

    #[test]
    #[should_panic]
    fn zero_length_is_refused() {
        let _ = PageRegion::acquire(0);
    }
}
