//! Compute buffers: typed arrays placed on the host, the device, or both.
//!
//! Placement is decided once at construction from the requested
//! [`PlacementPolicy`] and the device's memory model:
//!
//! | device            | `HostOnly` | `DeviceOnly` | `HostAndDevice`     |
//! |-------------------|------------|--------------|---------------------|
//! | unified memory    | `Unified`  | `Unified`    | `Unified`           |
//! | discrete memory   | `HostOnly` | `DeviceOnly` | `Split`             |
//!
//! Host-side memory objects are always allocated with `ALLOC_HOST_PTR` so
//! that mapping them is zero-copy. On a unified device the host and device
//! sides are one memory object and transfers between them are skipped.

use std::cell::Cell;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use sparkcl_driver::{Driver, Element, MapFlags, MemFlags, MemHandle};
use tracing::{debug, warn};

use crate::accessor::Accessor;
use crate::error::{AccessorId, BufferId, Result, SparkError};
use crate::event::{self, CommandClass, Event};
use crate::runtime::RuntimeContext;

/// Where a buffer's data is requested to live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementPolicy {
    HostOnly,
    DeviceOnly,
    HostAndDevice,
}

impl PlacementPolicy {
    pub fn has_host(self) -> bool {
        matches!(self, Self::HostOnly | Self::HostAndDevice)
    }

    pub fn has_device(self) -> bool {
        matches!(self, Self::DeviceOnly | Self::HostAndDevice)
    }
}

/// Where a buffer's data actually lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlacementKind {
    HostOnly,
    DeviceOnly,
    /// Distinct host and device memory objects.
    Split,
    /// One memory object serving both sides.
    Unified,
}

/// Owned native memory object, released on drop.
pub(crate) struct MemObject {
    driver: Arc<dyn Driver>,
    handle: MemHandle,
}

impl MemObject {
    fn create(
        driver: &Arc<dyn Driver>,
        flags: MemFlags,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<Self> {
        let handle = driver.create_buffer(flags, size_bytes, init)?;
        Ok(Self { driver: driver.clone(), handle })
    }
}

impl Drop for MemObject {
    fn drop(&mut self) {
        if let Err(e) = self.driver.release_buffer(self.handle) {
            warn!(mem = ?self.handle, error = %e, "failed to release memory object");
        }
    }
}

enum Placement {
    HostOnly(MemObject),
    DeviceOnly(MemObject),
    Split { host: MemObject, device: MemObject },
    Unified(MemObject),
}

impl Placement {
    fn kind(&self) -> PlacementKind {
        match self {
            Placement::HostOnly(_) => PlacementKind::HostOnly,
            Placement::DeviceOnly(_) => PlacementKind::DeviceOnly,
            Placement::Split { .. } => PlacementKind::Split,
            Placement::Unified(_) => PlacementKind::Unified,
        }
    }

    fn host(&self) -> Option<MemHandle> {
        match self {
            Placement::HostOnly(mem) | Placement::Unified(mem) => Some(mem.handle),
            Placement::Split { host, .. } => Some(host.handle),
            Placement::DeviceOnly(_) => None,
        }
    }

    fn device(&self) -> Option<MemHandle> {
        match self {
            Placement::DeviceOnly(mem) | Placement::Unified(mem) => Some(mem.handle),
            Placement::Split { device, .. } => Some(device.handle),
            Placement::HostOnly(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MapState {
    Unmapped,
    MappedBy(AccessorId),
}

/// Mapping state of one buffer, shared with every kernel it is bound to so
/// a launch can refuse to run while the buffer is mapped.
#[doc(hidden)]
#[derive(Debug, Clone)]
pub struct MapWatch {
    buffer: BufferId,
    // 0 while unmapped, otherwise the id of the mapping accessor. Ids start at 1.
    state: Arc<AtomicU64>,
}

impl MapWatch {
    fn new(buffer: BufferId) -> Self {
        Self { buffer, state: Arc::new(AtomicU64::new(0)) }
    }

    fn get(&self) -> MapState {
        match self.state.load(Ordering::Acquire) {
            0 => MapState::Unmapped,
            id => MapState::MappedBy(AccessorId(id)),
        }
    }

    fn set(&self, state: MapState) {
        let raw = match state {
            MapState::Unmapped => 0,
            MapState::MappedBy(AccessorId(id)) => id,
        };
        self.state.store(raw, Ordering::Release);
    }

    pub(crate) fn ensure_unmapped(&self) -> Result<()> {
        match self.get() {
            MapState::Unmapped => Ok(()),
            MapState::MappedBy(accessor) => {
                Err(SparkError::BufferMapped { buffer: self.buffer, accessor })
            }
        }
    }
}

/// A homogeneous array of `T` bound to one runtime context.
///
/// Not `Sync`: mapping and host access are driven from one thread.
pub struct ComputeBuffer<T: Element> {
    rt: RuntimeContext,
    id: BufferId,
    len: usize,
    policy: PlacementPolicy,
    flags: MemFlags,
    placement: Placement,
    map_state: MapWatch,
    _element: PhantomData<T>,
    _not_sync: PhantomData<Cell<()>>,
}

impl<T: Element> ComputeBuffer<T> {
    // ── Construction ────────────────────────────────────────────

    /// Allocate `len` zeroed elements.
    pub fn new(
        rt: &RuntimeContext,
        len: usize,
        policy: PlacementPolicy,
        flags: MemFlags,
    ) -> Result<Self> {
        Self::allocate(rt, len, policy, flags, None)
    }

    /// Allocate and copy `data` into every allocated memory object.
    pub fn from_slice(
        rt: &RuntimeContext,
        data: &[T],
        policy: PlacementPolicy,
        flags: MemFlags,
    ) -> Result<Self> {
        Self::allocate(rt, data.len(), policy, flags, Some(bytemuck::cast_slice(data)))
    }

    /// Read the text format: element count on the first line, then one
    /// element per line. Blank lines after the count are ignored.
    pub fn from_reader<R: BufRead>(
        rt: &RuntimeContext,
        reader: R,
        policy: PlacementPolicy,
        flags: MemFlags,
    ) -> Result<Self> {
        let data = parse_elements::<T, R>(reader)?;
        Self::from_slice(rt, &data, policy, flags)
    }

    pub fn from_file(
        rt: &RuntimeContext,
        path: impl AsRef<Path>,
        policy: PlacementPolicy,
        flags: MemFlags,
    ) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)
            .map_err(|source| SparkError::Io { path: path.to_path_buf(), source })?;
        Self::from_reader(rt, BufReader::new(file), policy, flags)
    }

    fn allocate(
        rt: &RuntimeContext,
        len: usize,
        policy: PlacementPolicy,
        flags: MemFlags,
        init: Option<&[u8]>,
    ) -> Result<Self> {
        if flags.intersects(MemFlags::HOST_PTR_MASK) {
            return Err(SparkError::configuration(format!(
                "{flags:?}: host pointer flags are managed by the runtime"
            )));
        }
        if len == 0 {
            return Err(SparkError::configuration("buffer length must be non-zero"));
        }
        let size_bytes = len.checked_mul(T::KIND.size_bytes()).ok_or_else(|| {
            SparkError::configuration(format!("{len} elements of {} overflow usize", T::KIND))
        })?;

        let driver = rt.driver();
        let host_flags = flags | MemFlags::ALLOC_HOST_PTR;
        let placement = if rt.is_unified_memory() {
            Placement::Unified(MemObject::create(driver, host_flags, size_bytes, init)?)
        } else {
            match policy {
                PlacementPolicy::HostOnly => {
                    Placement::HostOnly(MemObject::create(driver, host_flags, size_bytes, init)?)
                }
                PlacementPolicy::DeviceOnly => {
                    Placement::DeviceOnly(MemObject::create(driver, flags, size_bytes, init)?)
                }
                PlacementPolicy::HostAndDevice => {
                    let host = MemObject::create(driver, host_flags, size_bytes, init)?;
                    let device = MemObject::create(driver, flags, size_bytes, init)?;
                    Placement::Split { host, device }
                }
            }
        };

        let id = BufferId(rt.next_id());
        debug!(
            buffer = %id,
            len,
            element = %T::KIND,
            ?policy,
            placement = ?placement.kind(),
            "compute buffer allocated"
        );
        Ok(Self {
            rt: rt.clone(),
            id,
            len,
            policy,
            flags,
            placement,
            map_state: MapWatch::new(id),
            _element: PhantomData,
            _not_sync: PhantomData,
        })
    }

    // ── Transfers ───────────────────────────────────────────────

    /// Copy the host side into the device side.
    ///
    /// Returns `None` when both sides are the same memory object.
    pub fn to_device(&self, blocking: bool, wait: &[&Event]) -> Result<Option<Event>> {
        self.transfer(true, blocking, wait)
    }

    /// Copy the device side into the host side.
    ///
    /// Returns `None` when both sides are the same memory object.
    pub fn to_host(&self, blocking: bool, wait: &[&Event]) -> Result<Option<Event>> {
        self.transfer(false, blocking, wait)
    }

    fn transfer(&self, to_device: bool, blocking: bool, wait: &[&Event]) -> Result<Option<Event>> {
        self.ensure_unmapped()?;
        if self.policy != PlacementPolicy::HostAndDevice {
            return Err(SparkError::configuration(format!(
                "{} was created {:?}; host/device transfers need HostAndDevice",
                self.id, self.policy
            )));
        }
        let (host, device) = match &self.placement {
            Placement::Unified(_) => return Ok(None),
            Placement::Split { host, device } => (host.handle, device.handle),
            _ => {
                return Err(SparkError::configuration(format!(
                    "{} has no separate host and device memory",
                    self.id
                )))
            }
        };
        let (src, dst) = if to_device { (host, device) } else { (device, host) };
        self.copy(src, dst, blocking, wait).map(Some)
    }

    /// Copy this buffer's host side into `dest`'s host side.
    pub fn copy_host_to(
        &self,
        dest: &ComputeBuffer<T>,
        blocking: bool,
        wait: &[&Event],
    ) -> Result<Event> {
        self.check_copy(dest, "host", PlacementPolicy::has_host)?;
        let (src, dst) = Self::pair(self.host_handle(), dest.host_handle(), "host")?;
        self.copy(src, dst, blocking, wait)
    }

    /// Copy this buffer's device side into `dest`'s device side.
    pub fn copy_device_to(
        &self,
        dest: &ComputeBuffer<T>,
        blocking: bool,
        wait: &[&Event],
    ) -> Result<Event> {
        self.check_copy(dest, "device", PlacementPolicy::has_device)?;
        let (src, dst) = Self::pair(self.device_handle(), dest.device_handle(), "device")?;
        self.copy(src, dst, blocking, wait)
    }

    fn check_copy(
        &self,
        dest: &ComputeBuffer<T>,
        side: &str,
        has_side: fn(PlacementPolicy) -> bool,
    ) -> Result<()> {
        self.ensure_unmapped()?;
        dest.ensure_unmapped()?;
        if !has_side(self.policy) || !has_side(dest.policy) {
            return Err(SparkError::configuration(format!(
                "both buffers need a {side} side ({} is {:?}, {} is {:?})",
                self.id, self.policy, dest.id, dest.policy
            )));
        }
        if self.len != dest.len {
            return Err(SparkError::configuration(format!(
                "length mismatch: {} has {} elements, {} has {}",
                self.id, self.len, dest.id, dest.len
            )));
        }
        Ok(())
    }

    fn pair(
        src: Option<MemHandle>,
        dst: Option<MemHandle>,
        side: &str,
    ) -> Result<(MemHandle, MemHandle)> {
        src.zip(dst).ok_or_else(|| SparkError::configuration(format!("missing {side} memory")))
    }

    fn copy(&self, src: MemHandle, dst: MemHandle, blocking: bool, wait: &[&Event]) -> Result<Event> {
        let handle = self.rt.driver().enqueue_copy_buffer(
            src,
            dst,
            0,
            0,
            self.size_bytes(),
            &event::handles(wait),
        )?;
        let event = self.rt.track(handle, CommandClass::Compute);
        debug!(buffer = %self.id, ?src, ?dst, bytes = self.size_bytes(), "copy enqueued");
        if blocking {
            event.wait()?;
        }
        Ok(event)
    }

    // ── Host access ─────────────────────────────────────────────

    /// Map the whole host side for reading and writing through an
    /// [`Accessor`].
    pub fn map_host(&self, flags: MapFlags) -> Result<Accessor<'_, T>> {
        if !self.policy.has_host() {
            return Err(SparkError::configuration(format!(
                "{} was created {:?}; mapping needs a host side",
                self.id, self.policy
            )));
        }
        Accessor::map(self, flags)
    }

    /// Blocking read of the first `dst.len()` elements of the host side.
    pub fn host_read_to(&self, dst: &mut [T]) -> Result<Event> {
        let mem = self.side(self.host_handle(), "host")?;
        self.read(mem, dst)
    }

    /// Blocking read of the first `dst.len()` elements of the device side.
    pub fn device_read_to(&self, dst: &mut [T]) -> Result<Event> {
        let mem = self.side(self.device_handle(), "device")?;
        self.read(mem, dst)
    }

    /// Blocking write of `src` into the start of the host side.
    pub fn host_write_from(&self, src: &[T]) -> Result<Event> {
        let mem = self.side(self.host_handle(), "host")?;
        self.write(mem, src)
    }

    /// Blocking write of `src` into the start of the device side.
    pub fn device_write_from(&self, src: &[T]) -> Result<Event> {
        let mem = self.side(self.device_handle(), "device")?;
        self.write(mem, src)
    }

    fn side(&self, handle: Option<MemHandle>, side: &str) -> Result<MemHandle> {
        self.ensure_unmapped()?;
        handle.ok_or_else(|| {
            SparkError::configuration(format!("{} has no {side} side ({:?})", self.id, self.policy))
        })
    }

    fn check_span(&self, requested: usize) -> Result<()> {
        if requested > self.len {
            return Err(SparkError::configuration(format!(
                "{requested} elements requested from {} of length {}",
                self.id, self.len
            )));
        }
        Ok(())
    }

    fn read(&self, mem: MemHandle, dst: &mut [T]) -> Result<Event> {
        self.check_span(dst.len())?;
        // SAFETY: the read is blocking, so `dst` outlives the transfer.
        let handle = unsafe {
            self.rt.driver().enqueue_read_buffer(mem, true, 0, bytemuck::cast_slice_mut(dst), &[])
        }?;
        Ok(self.rt.track(handle, CommandClass::Io))
    }

    fn write(&self, mem: MemHandle, src: &[T]) -> Result<Event> {
        self.check_span(src.len())?;
        // SAFETY: the write is blocking, so `src` outlives the transfer.
        let handle = unsafe {
            self.rt.driver().enqueue_write_buffer(mem, true, 0, bytemuck::cast_slice(src), &[])
        }?;
        Ok(self.rt.track(handle, CommandClass::Io))
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * T::KIND.size_bytes()
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    pub fn policy(&self) -> PlacementPolicy {
        self.policy
    }

    /// Caller flags the buffer was created with.
    pub fn flags(&self) -> MemFlags {
        self.flags
    }

    pub fn placement_kind(&self) -> PlacementKind {
        self.placement.kind()
    }

    /// Whether host and device sides are one memory object.
    pub fn is_aliased(&self) -> bool {
        matches!(self.placement, Placement::Unified(_))
    }

    pub fn host_handle(&self) -> Option<MemHandle> {
        self.placement.host()
    }

    pub fn device_handle(&self) -> Option<MemHandle> {
        self.placement.device()
    }

    pub fn is_mapped(&self) -> bool {
        self.map_state.get() != MapState::Unmapped
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.rt
    }

    // ── Mapping state ───────────────────────────────────────────

    pub(crate) fn ensure_unmapped(&self) -> Result<()> {
        self.map_state.ensure_unmapped()
    }

    pub(crate) fn set_map_state(&self, state: MapState) {
        self.map_state.set(state);
    }

    pub(crate) fn map_watch(&self) -> MapWatch {
        self.map_state.clone()
    }
}

impl<T: Element> fmt::Debug for ComputeBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputeBuffer")
            .field("id", &self.id)
            .field("element", &T::KIND)
            .field("len", &self.len)
            .field("policy", &self.policy)
            .field("placement", &self.placement.kind())
            .field("map_state", &self.map_state.get())
            .finish()
    }
}

fn parse_elements<T: Element, R: BufRead>(reader: R) -> Result<Vec<T>> {
    let parse_error = |line: usize, reason: String| SparkError::Parse { line, reason };

    let mut count: Option<usize> = None;
    let mut values = Vec::new();
    let mut last_line = 0;
    for (i, line) in reader.lines().enumerate() {
        let line_no = i + 1;
        last_line = line_no;
        let line = line.map_err(|e| parse_error(line_no, e.to_string()))?;
        let text = line.trim();
        match count {
            None => {
                let n = text.parse::<usize>().map_err(|e| {
                    parse_error(line_no, format!("invalid element count '{text}': {e}"))
                })?;
                values.reserve(n.min(1 << 20));
                count = Some(n);
            }
            Some(_) if text.is_empty() => {}
            Some(n) if values.len() == n => {
                return Err(parse_error(line_no, format!("more than {n} elements")));
            }
            Some(_) => {
                let value = text.parse::<T>().map_err(|e| {
                    parse_error(line_no, format!("invalid {} '{text}': {e}", T::KIND))
                })?;
                values.push(value);
            }
        }
    }
    let n = count.ok_or_else(|| parse_error(1, "missing element count".to_string()))?;
    if values.len() != n {
        return Err(parse_error(
            last_line + 1,
            format!("expected {n} elements, found {}", values.len()),
        ));
    }
    Ok(values)
}
