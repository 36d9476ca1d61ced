//! Scoped mapped views over a buffer's host side.
//!
//! Indexing with `[]` is bounds-checked and panics out of range;
//! [`Accessor::get_unchecked`] and [`Accessor::set_unchecked`] skip the check.

use std::fmt;
use std::ops::{Index, IndexMut};
use std::ptr::NonNull;
use std::slice;

use sparkcl_driver::{Element, MapFlags, MemHandle, Status};
use tracing::{debug, warn};

use crate::buffer::{ComputeBuffer, MapState};
use crate::error::{AccessorId, Result, SparkError};
use crate::event::CommandClass;

/// Exclusive mapped view of a whole [`ComputeBuffer`].
///
/// While an accessor is alive every host-side operation on its buffer fails
/// with [`SparkError::BufferMapped`]. The view is unmapped by
/// [`unmap`](Accessor::unmap) or on drop.
pub struct Accessor<'a, T: Element> {
    buffer: &'a ComputeBuffer<T>,
    id: AccessorId,
    mem: MemHandle,
    ptr: NonNull<T>,
    len: usize,
    released: bool,
}

impl<'a, T: Element> Accessor<'a, T> {
    pub(crate) fn map(buffer: &'a ComputeBuffer<T>, flags: MapFlags) -> Result<Self> {
        buffer.ensure_unmapped()?;
        let mem = buffer.host_handle().ok_or_else(|| {
            SparkError::configuration(format!("{} has no host memory to map", buffer.id()))
        })?;
        let rt = buffer.runtime();
        let (raw, handle) =
            rt.driver().enqueue_map_buffer(mem, true, flags, 0, buffer.size_bytes(), &[])?;
        let event = rt.track(handle, CommandClass::Io);

        let Some(ptr) = NonNull::new(raw.cast::<T>()).filter(|p| p.as_ptr().is_aligned()) else {
            if !raw.is_null() {
                match rt.driver().enqueue_unmap(mem, raw, &[]) {
                    Ok(handle) => drop(rt.track(handle, CommandClass::Io)),
                    Err(e) => warn!(mem = ?mem, error = %e, "failed to unmap rejected mapping"),
                }
            }
            return Err(SparkError::Native(sparkcl_driver::DriverError::status(
                "map buffer: unusable host pointer",
                Status::MAP_FAILURE,
            )));
        };

        let id = AccessorId(rt.next_id());
        buffer.set_map_state(MapState::MappedBy(id));
        let accessor =
            Self { buffer, id, mem, ptr, len: buffer.len(), released: false };
        // On failure the accessor drops and unmaps.
        event.wait()?;
        debug!(buffer = %buffer.id(), accessor = %id, ?flags, "host side mapped");
        Ok(accessor)
    }

    pub fn id(&self) -> AccessorId {
        self.id
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the mapping covers `len` aligned elements and stays valid
        // until this accessor unmaps it.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: as in `as_slice`; `&mut self` makes the view exclusive.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// # Safety
    ///
    /// `index` must be less than [`len`](Self::len).
    pub unsafe fn get_unchecked(&self, index: usize) -> T {
        *self.ptr.as_ptr().add(index)
    }

    /// # Safety
    ///
    /// `index` must be less than [`len`](Self::len).
    pub unsafe fn set_unchecked(&mut self, index: usize, value: T) {
        *self.ptr.as_ptr().add(index) = value;
    }

    /// Unmap now, reporting a native failure. The buffer is usable again
    /// either way.
    pub fn unmap(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let rt = self.buffer.runtime();
        let outcome = rt.driver().enqueue_unmap(self.mem, self.ptr.as_ptr().cast(), &[]);
        self.buffer.set_map_state(MapState::Unmapped);
        let handle = outcome?;
        rt.track(handle, CommandClass::Io);
        debug!(buffer = %self.buffer.id(), accessor = %self.id, "host side unmapped");
        Ok(())
    }
}

impl<T: Element> Drop for Accessor<'_, T> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(buffer = %self.buffer.id(), accessor = %self.id, error = %e, "unmap failed");
        }
    }
}

impl<T: Element> Index<usize> for Accessor<'_, T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.as_slice()[index]
    }
}

impl<T: Element> IndexMut<usize> for Accessor<'_, T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<T: Element> fmt::Debug for Accessor<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Accessor")
            .field("id", &self.id)
            .field("buffer", &self.buffer.id())
            .field("len", &self.len)
            .finish()
    }
}
