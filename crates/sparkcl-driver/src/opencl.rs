//! OpenCL driver built on `opencl3`.
//!
//! Native objects are held in their owned `opencl3` wrappers, keyed by the
//! raw native pointer. Releasing a handle drops the wrapper, which releases
//! the native object.

use std::collections::HashMap;
use std::ffi::c_void;
use std::mem::ManuallyDrop;
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ACCELERATOR, CL_DEVICE_TYPE_CPU, CL_DEVICE_TYPE_GPU,
};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::Kernel;
use opencl3::memory::{Buffer, ClMem, CL_MEM_COPY_HOST_PTR};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_event, cl_mem, CL_BLOCKING, CL_NON_BLOCKING};
use tracing::{debug, error, info};

use crate::driver::{Backend, Driver, NativeArg};
use crate::error::{DriverError, Result, Status};
use crate::flags::{MapFlags, MemFlags};
use crate::handle::{EventHandle, KernelHandle, MemHandle, ProgramHandle};
use crate::types::{
    AddressQualifier, DeviceInfo, DeviceType, PlatformInfo, ProfilingInfo, ScalarValue,
};

/// Kernel argument reflection needs this on most implementations.
const ARG_INFO_OPTION: &str = "-cl-kernel-arg-info";

fn native(operation: &'static str) -> impl FnOnce(ClError) -> DriverError {
    move |e| DriverError::status(operation, Status(e.0))
}

fn device_type_of(device: &Device) -> DeviceType {
    match device.dev_type().unwrap_or_default() {
        t if t & CL_DEVICE_TYPE_GPU != 0 => DeviceType::Gpu,
        t if t & CL_DEVICE_TYPE_CPU != 0 => DeviceType::Cpu,
        t if t & CL_DEVICE_TYPE_ACCELERATOR != 0 => DeviceType::Accelerator,
        _ => DeviceType::All,
    }
}

fn describe(device: &Device) -> DeviceInfo {
    DeviceInfo {
        name: device.name().unwrap_or_default(),
        vendor: device.vendor().unwrap_or_default(),
        device_type: device_type_of(device),
        host_unified_memory: device.host_unified_memory().unwrap_or(false),
        profiling_timer_resolution_ns: device.profiling_timer_resolution().unwrap_or(1) as u64,
        max_work_group_size: device.max_work_group_size().unwrap_or(1),
        max_compute_units: device.max_compute_units().unwrap_or(1),
        global_mem_bytes: device.global_mem_size().unwrap_or(0),
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// Enumerates the installed OpenCL platforms.
#[derive(Debug, Default)]
pub struct OpenClBackend;

impl OpenClBackend {
    pub fn new() -> Self {
        Self
    }

    fn platform(&self, index: usize) -> Result<Platform> {
        let platforms = get_platforms().map_err(native("get platforms"))?;
        platforms
            .get(index)
            .copied()
            .ok_or_else(|| DriverError::status("get platforms", Status::INVALID_PLATFORM))
    }

    fn device_ids(&self, platform: usize, device_type: DeviceType) -> Result<Vec<Device>> {
        match self.platform(platform)?.get_devices(device_type.bits()) {
            Ok(ids) => Ok(ids.into_iter().map(Device::new).collect()),
            Err(e) if e.0 == Status::DEVICE_NOT_FOUND.code() => Ok(Vec::new()),
            Err(e) => Err(native("get device ids")(e)),
        }
    }
}

impl Backend for OpenClBackend {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        let platforms = get_platforms().map_err(native("get platforms"))?;
        if platforms.is_empty() {
            return Err(DriverError::NoPlatform);
        }
        Ok(platforms
            .iter()
            .enumerate()
            .map(|(index, p)| PlatformInfo {
                index,
                name: p.name().unwrap_or_default(),
                vendor: p.vendor().unwrap_or_default(),
                version: p.version().unwrap_or_default(),
            })
            .collect())
    }

    fn devices(&self, platform: usize, device_type: DeviceType) -> Result<Vec<DeviceInfo>> {
        Ok(self.device_ids(platform, device_type)?.iter().map(describe).collect())
    }

    fn open(
        &self,
        platform: usize,
        device_type: DeviceType,
        device: usize,
    ) -> Result<Arc<dyn Driver>> {
        let devices = self.device_ids(platform, device_type)?;
        let count = devices.len();
        let device = devices.into_iter().nth(device).ok_or_else(|| DriverError::NoDevice {
            reason: format!(
                "platform {platform} has {count} {device_type} device(s), index {device} requested"
            ),
        })?;
        Ok(Arc::new(OpenClDriver::open(device)?))
    }
}

// ── Driver ───────────────────────────────────────────────────────────────

#[derive(Default)]
struct Objects {
    buffers: HashMap<MemHandle, Buffer<u8>>,
    events: HashMap<EventHandle, Event>,
    programs: HashMap<ProgramHandle, Program>,
    kernels: HashMap<KernelHandle, Kernel>,
}

/// One OpenCL context and an in-order, profiling-enabled queue on one device.
pub struct OpenClDriver {
    info: DeviceInfo,
    _device: Device,
    context: Context,
    queue: CommandQueue,
    objects: Mutex<Objects>,
}

// SAFETY: OpenCL objects are thread-safe in OpenCL 1.2
// (except kernels during argument setting). The object tables are guarded
// by a mutex, which also serializes `clSetKernelArg`.
unsafe impl Send for OpenClDriver {}
unsafe impl Sync for OpenClDriver {}

impl std::fmt::Debug for OpenClDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenClDriver").field("device", &self.info.name).finish()
    }
}

impl OpenClDriver {
    pub fn open(device: Device) -> Result<Self> {
        let info = describe(&device);
        let context = Context::from_device(&device).map_err(native("create context"))?;
        let queue =
            CommandQueue::create_default_with_properties(&context, CL_QUEUE_PROFILING_ENABLE, 0)
                .map_err(native("create command queue"))?;
        info!(device = %info.name, unified = info.host_unified_memory, "opencl: context opened");
        Ok(Self { info, _device: device, context, queue, objects: Mutex::new(Objects::default()) })
    }

    fn objects(&self) -> MutexGuard<'_, Objects> {
        self.objects.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn track(&self, objects: &mut Objects, event: Event) -> EventHandle {
        let handle = EventHandle::from_raw(event.get() as usize);
        objects.events.insert(handle, event);
        handle
    }

    fn wait_list(objects: &Objects, wait: &[EventHandle]) -> Result<Vec<cl_event>> {
        wait.iter()
            .map(|h| {
                objects.events.get(h).map(Event::get).ok_or_else(|| {
                    DriverError::status("check wait list", Status::INVALID_EVENT_WAIT_LIST)
                })
            })
            .collect()
    }

    fn mem(objects: &Objects, mem: MemHandle, operation: &'static str) -> Result<cl_mem> {
        objects
            .buffers
            .get(&mem)
            .map(ClMem::get)
            .ok_or_else(|| DriverError::status(operation, Status::INVALID_MEM_OBJECT))
    }

    fn kernel<'a>(
        objects: &'a Objects,
        kernel: KernelHandle,
        operation: &'static str,
    ) -> Result<&'a Kernel> {
        objects
            .kernels
            .get(&kernel)
            .ok_or_else(|| DriverError::status(operation, Status::INVALID_KERNEL))
    }
}

fn blocking_flag(blocking: bool) -> u32 {
    if blocking {
        CL_BLOCKING
    } else {
        CL_NON_BLOCKING
    }
}

impl Driver for OpenClDriver {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(
        &self,
        flags: MemFlags,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<MemHandle> {
        let (bits, host_ptr) = match init {
            Some(data) if data.len() != size_bytes => {
                return Err(DriverError::status("create buffer", Status::INVALID_VALUE));
            }
            Some(data) => (flags.bits() | CL_MEM_COPY_HOST_PTR, data.as_ptr() as *mut c_void),
            None => (flags.bits(), ptr::null_mut()),
        };
        // SAFETY: host_ptr is either null or points at `size_bytes` readable
        // bytes; COPY_HOST_PTR makes the runtime copy them before returning.
        let buffer = unsafe { Buffer::<u8>::create(&self.context, bits, size_bytes, host_ptr) }
            .map_err(native("create buffer"))?;
        let handle = MemHandle::from_raw(buffer.get() as usize);
        debug!(mem = ?handle, ?flags, size_bytes, "opencl: buffer created");
        self.objects().buffers.insert(handle, buffer);
        Ok(handle)
    }

    fn release_buffer(&self, mem: MemHandle) -> Result<()> {
        self.objects()
            .buffers
            .remove(&mem)
            .map(drop)
            .ok_or_else(|| DriverError::status("release buffer", Status::INVALID_MEM_OBJECT))
    }

    fn enqueue_copy_buffer(
        &self,
        src: MemHandle,
        dst: MemHandle,
        src_offset: usize,
        dst_offset: usize,
        size_bytes: usize,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue copy buffer";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let src_buf = objects
            .buffers
            .get(&src)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        // Non-owning alias so that source and destination may be one object.
        let mut dst_alias = ManuallyDrop::new(Buffer::<u8>::new(Self::mem(&objects, dst, OP)?));
        // SAFETY: both objects are alive while the table lock is held.
        let event = unsafe {
            self.queue.enqueue_copy_buffer(
                src_buf,
                &mut dst_alias,
                src_offset,
                dst_offset,
                size_bytes,
                &wait,
            )
        }
        .map_err(native(OP))?;
        Ok(self.track(&mut objects, event))
    }

    unsafe fn enqueue_read_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue read buffer";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let buffer = objects
            .buffers
            .get(&mem)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        let event = self
            .queue
            .enqueue_read_buffer(buffer, blocking_flag(blocking), offset, dst, &wait)
            .map_err(native(OP))?;
        Ok(self.track(&mut objects, event))
    }

    unsafe fn enqueue_write_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        offset: usize,
        src: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue write buffer";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let buffer = objects
            .buffers
            .get_mut(&mem)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        let event = self
            .queue
            .enqueue_write_buffer(buffer, blocking_flag(blocking), offset, src, &wait)
            .map_err(native(OP))?;
        Ok(self.track(&mut objects, event))
    }

    fn enqueue_map_buffer(
        &self,
        mem: MemHandle,
        blocking: bool,
        flags: MapFlags,
        offset: usize,
        size_bytes: usize,
        wait: &[EventHandle],
    ) -> Result<(*mut u8, EventHandle)> {
        const OP: &str = "enqueue map buffer";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let buffer = objects
            .buffers
            .get_mut(&mem)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        let mut mapped: cl_mem = ptr::null_mut();
        // SAFETY: the returned pointer is only dereferenced by the caller,
        // which pairs it with `enqueue_unmap`.
        let event = unsafe {
            self.queue.enqueue_map_buffer(
                buffer,
                blocking_flag(blocking),
                flags.bits(),
                offset,
                size_bytes,
                &mut mapped,
                &wait,
            )
        }
        .map_err(native(OP))?;
        Ok((mapped.cast::<u8>(), self.track(&mut objects, event)))
    }

    fn enqueue_unmap(
        &self,
        mem: MemHandle,
        ptr: *mut u8,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue unmap";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let raw = Self::mem(&objects, mem, OP)?;
        // SAFETY: `ptr` came from a map of `raw`.
        let event = unsafe { self.queue.enqueue_unmap_mem_object(raw, ptr.cast(), &wait) }
            .map_err(native(OP))?;
        Ok(self.track(&mut objects, event))
    }

    fn build_program(&self, source: &str, options: &str) -> Result<ProgramHandle> {
        let options = if options.contains(ARG_INFO_OPTION) {
            options.to_string()
        } else {
            format!("{options} {ARG_INFO_OPTION}").trim().to_string()
        };
        let program = Program::create_and_build_from_source(&self.context, source, &options)
            .map_err(|log| {
                error!(%options, "opencl: program build failed");
                DriverError::Build { log }
            })?;
        let handle = ProgramHandle::from_raw(program.get() as usize);
        debug!(program = ?handle, %options, "opencl: program built");
        self.objects().programs.insert(handle, program);
        Ok(handle)
    }

    fn release_program(&self, program: ProgramHandle) -> Result<()> {
        self.objects()
            .programs
            .remove(&program)
            .map(drop)
            .ok_or_else(|| DriverError::status("release program", Status::INVALID_PROGRAM))
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        let mut objects = self.objects();
        let program = objects
            .programs
            .get(&program)
            .ok_or_else(|| DriverError::status("create kernel", Status::INVALID_PROGRAM))?;
        let kernel = Kernel::create(program, name).map_err(native("create kernel"))?;
        let handle = KernelHandle::from_raw(kernel.get() as usize);
        objects.kernels.insert(handle, kernel);
        Ok(handle)
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        self.objects()
            .kernels
            .remove(&kernel)
            .map(drop)
            .ok_or_else(|| DriverError::status("release kernel", Status::INVALID_KERNEL))
    }

    fn kernel_num_args(&self, kernel: KernelHandle) -> Result<u32> {
        let objects = self.objects();
        Self::kernel(&objects, kernel, "kernel num args")?
            .num_args()
            .map_err(native("kernel num args"))
    }

    fn kernel_arg_type_name(&self, kernel: KernelHandle, index: u32) -> Result<String> {
        let objects = self.objects();
        Self::kernel(&objects, kernel, "kernel arg type name")?
            .get_arg_type_name(index)
            .map_err(native("kernel arg type name"))
    }

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelHandle,
        index: u32,
    ) -> Result<AddressQualifier> {
        const OP: &str = "kernel arg address qualifier";
        let objects = self.objects();
        let raw = Self::kernel(&objects, kernel, OP)?
            .get_arg_address_qualifier(index)
            .map_err(native(OP))?;
        AddressQualifier::from_raw(raw)
            .ok_or_else(|| DriverError::status(OP, Status::KERNEL_ARG_INFO_NOT_AVAILABLE))
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: &NativeArg) -> Result<()> {
        const OP: &str = "set kernel arg";
        let objects = self.objects();
        let k = Self::kernel(&objects, kernel, OP)?;
        // SAFETY: every value matches the byte size of its Rust type; the
        // native runtime validates sizes against the kernel signature.
        let outcome = unsafe {
            match *arg {
                NativeArg::Scalar(ScalarValue::F32(v)) => k.set_arg(index, &v),
                NativeArg::Scalar(ScalarValue::F64(v)) => k.set_arg(index, &v),
                NativeArg::Scalar(ScalarValue::I32(v)) => k.set_arg(index, &v),
                NativeArg::Scalar(ScalarValue::U32(v)) => k.set_arg(index, &v),
                NativeArg::Scalar(ScalarValue::U8(v)) => k.set_arg(index, &v),
                NativeArg::Scalar(ScalarValue::I64(v)) => k.set_arg(index, &v),
                NativeArg::Mem(mem) => {
                    let raw = Self::mem(&objects, mem, OP)?;
                    k.set_arg(index, &raw)
                }
                NativeArg::Local { size_bytes } => k.set_arg_local_buffer(index, size_bytes),
            }
        };
        outcome.map_err(native(OP))
    }

    fn enqueue_nd_range(
        &self,
        kernel: KernelHandle,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue nd range";
        let mut objects = self.objects();
        let wait = Self::wait_list(&objects, wait)?;
        let raw = Self::kernel(&objects, kernel, OP)?.get();
        let work_dim = u32::try_from(global.len())
            .map_err(|_| DriverError::status(OP, Status::INVALID_WORK_DIMENSION))?;
        // SAFETY: the size arrays outlive the call and hold `work_dim` entries.
        let event = unsafe {
            self.queue.enqueue_nd_range_kernel(
                raw,
                work_dim,
                offset.map_or(ptr::null(), <[usize]>::as_ptr),
                global.as_ptr(),
                local.map_or(ptr::null(), <[usize]>::as_ptr),
                &wait,
            )
        }
        .map_err(native(OP))?;
        Ok(self.track(&mut objects, event))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> Result<()> {
        const OP: &str = "wait for events";
        let objects = self.objects();
        for handle in events {
            let event = objects
                .events
                .get(handle)
                .ok_or_else(|| DriverError::status(OP, Status::INVALID_EVENT))?;
            event.wait().map_err(native(OP))?;
        }
        Ok(())
    }

    fn event_profiling_info(&self, event: EventHandle, info: ProfilingInfo) -> Result<u64> {
        const OP: &str = "event profiling info";
        let objects = self.objects();
        let event = objects
            .events
            .get(&event)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_EVENT))?;
        match info {
            ProfilingInfo::Queued => event.profiling_command_queued(),
            ProfilingInfo::Submitted => event.profiling_command_submit(),
            ProfilingInfo::Started => event.profiling_command_start(),
            ProfilingInfo::Ended => event.profiling_command_end(),
        }
        .map_err(native(OP))
    }

    fn release_event(&self, event: EventHandle) -> Result<()> {
        self.objects()
            .events
            .remove(&event)
            .map(drop)
            .ok_or_else(|| DriverError::status("release event", Status::INVALID_EVENT))
    }

    fn finish(&self) -> Result<()> {
        self.queue.finish().map_err(native("finish"))
    }
}
