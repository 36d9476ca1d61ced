//! The native seam: one context with one in-order, profiling-enabled queue.

use std::fmt;
use std::sync::Arc;

use crate::error::Result;
use crate::flags::{MapFlags, MemFlags};
use crate::handle::{EventHandle, KernelHandle, MemHandle, ProgramHandle};
use crate::types::{
    AddressQualifier, DeviceInfo, DeviceType, PlatformInfo, ProfilingInfo, ScalarValue,
};

/// Value handed to the native kernel argument table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NativeArg {
    Scalar(ScalarValue),
    Mem(MemHandle),
    /// Work-group local scratch of the given size; no host data.
    Local { size_bytes: usize },
}

/// An open device context and its command queue.
///
/// Every `enqueue_*` call returns the event of the submitted command. Events
/// are owned by the caller and must be handed back through
/// [`release_event`](Driver::release_event).
pub trait Driver: Send + Sync + fmt::Debug {
    fn device_info(&self) -> &DeviceInfo;

    /// Allocate a memory object of `size_bytes`; `init` (when present) must
    /// be exactly `size_bytes` long and is copied in.
    fn create_buffer(
        &self,
        flags: MemFlags,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<MemHandle>;

    fn release_buffer(&self, mem: MemHandle) -> Result<()>;

    fn enqueue_copy_buffer(
        &self,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        size_bytes: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Read `dst.len()` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// When `blocking` is false, `dst` must stay valid and untouched until the
    /// returned event completes.
    unsafe fn enqueue_read_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Write `src.len()` bytes starting at `offset`.
    ///
    /// # Safety
    ///
    /// When `blocking` is false, `src` must stay valid until the returned
    /// event completes.
    unsafe fn enqueue_write_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Map a region into host memory. The pointer stays valid until the
    /// matching [`enqueue_unmap`](Driver::enqueue_unmap).
    fn enqueue_map_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        flags: MapFlags,
        offset: usize,
        size_bytes: usize,
        wait: &[EventHandle],
    ) -> Result<(*mut u8, EventHandle)>;

    fn enqueue_unmap(
        &self,
        mem: MemHandle,
        ptr: *mut u8,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    /// Compile `source`. Failure yields [`DriverError::Build`](crate::DriverError::Build)
    /// with the full compiler log.
    fn build_program(&self, source: &str, options: &str) -> Result<ProgramHandle>;

    fn release_program(&self, program: ProgramHandle) -> Result<()>;

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle>;

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()>;

    fn kernel_num_args(&self, kernel: KernelHandle) -> Result<u32>;

    /// Declared type of a parameter in native spelling (`float*`, `uint`).
    fn kernel_arg_type_name(&self, kernel: KernelHandle, index: u32) -> Result<String>;

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelHandle,
        index: u32,
    ) -> Result<AddressQualifier>;

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: &NativeArg) -> Result<()>;

    /// Launch over `global` work items. `global.len()` is the work dimension.
    fn enqueue_nd_range(
        &self,
        kernel: KernelHandle,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[EventHandle],
    ) -> Result<EventHandle>;

    fn wait_for_events(&self, events: &[EventHandle]) -> Result<()>;

    /// One profiling timestamp of a completed event, in device clock ticks.
    fn event_profiling_info(&self, event: EventHandle, info: ProfilingInfo) -> Result<u64>;

    fn release_event(&self, event: EventHandle) -> Result<()>;

    /// Block until every command on the queue has completed.
    fn finish(&self) -> Result<()>;
}

/// Enumerates platforms and devices and opens drivers.
pub trait Backend {
    fn platforms(&self) -> Result<Vec<PlatformInfo>>;

    fn devices(&self, platform: usize, device_type: DeviceType) -> Result<Vec<DeviceInfo>>;

    /// Open device `device` (an index into [`devices`](Backend::devices) for
    /// the same filter) with its own context and profiling queue.
    fn open(
        &self,
        platform: usize,
        device_type: DeviceType,
        device: usize,
    ) -> Result<Arc<dyn Driver>>;
}
