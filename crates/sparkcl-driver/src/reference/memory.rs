//! Page-aligned zeroed host allocations backing reference memory objects.

use std::alloc::{self, Layout};
use std::ptr::NonNull;

use crate::error::{DriverError, Result, Status};

const PAGE: usize = 4096;

pub(crate) struct HostAllocation {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the allocation is uniquely owned. All driver-side access goes
// through the reference driver's state mutex; host access through a mapped
// pointer is the caller's responsibility, as with device memory.
unsafe impl Send for HostAllocation {}
unsafe impl Sync for HostAllocation {}

impl HostAllocation {
    pub(crate) fn zeroed(size_bytes: usize) -> Result<Self> {
        if size_bytes == 0 {
            return Err(DriverError::status("create buffer", Status::INVALID_BUFFER_SIZE));
        }
        let layout = Layout::from_size_align(size_bytes, PAGE)
            .map_err(|_| DriverError::status("create buffer", Status::INVALID_BUFFER_SIZE))?;
        // SAFETY: layout has a non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or_else(|| {
            DriverError::status("create buffer", Status::MEM_OBJECT_ALLOCATION_FAILURE)
        })?;
        Ok(Self { ptr, layout })
    }

    pub(crate) fn len(&self) -> usize {
        self.layout.size()
    }

    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// Whether `[offset, offset + size)` lies inside the allocation.
    pub(crate) fn contains_range(&self, offset: usize, size: usize) -> bool {
        offset.checked_add(size).is_some_and(|end| end <= self.len())
    }

    pub(crate) fn contains_ptr(&self, ptr: *mut u8) -> bool {
        let base = self.as_ptr() as usize;
        let p = ptr as usize;
        p >= base && p < base + self.len()
    }

    pub(crate) fn read(&self, offset: usize, dst: &mut [u8]) {
        debug_assert!(self.contains_range(offset, dst.len()));
        // SAFETY: range checked by the caller; dst is a distinct host slice.
        unsafe {
            std::ptr::copy_nonoverlapping(self.as_ptr().add(offset), dst.as_mut_ptr(), dst.len())
        }
    }

    pub(crate) fn write(&self, offset: usize, src: &[u8]) {
        debug_assert!(self.contains_range(offset, src.len()));
        // SAFETY: range checked by the caller; src is a distinct host slice.
        unsafe { std::ptr::copy_nonoverlapping(src.as_ptr(), self.as_ptr().add(offset), src.len()) }
    }
}

impl std::fmt::Debug for HostAllocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostAllocation")
            .field("ptr", &self.ptr)
            .field("len", &self.layout.size())
            .finish()
    }
}

impl Drop for HostAllocation {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// Copy between two (possibly identical) allocations; ranges may overlap.
pub(crate) fn copy_between(
    src: &HostAllocation,
    src_offset: usize,
    dst: &HostAllocation,
    dst_offset: usize,
    size: usize,
) {
    debug_assert!(src.contains_range(src_offset, size));
    debug_assert!(dst.contains_range(dst_offset, size));
    // SAFETY: both ranges checked by the caller; `copy` tolerates overlap.
    unsafe { std::ptr::copy(src.as_ptr().add(src_offset), dst.as_ptr().add(dst_offset), size) }
}
