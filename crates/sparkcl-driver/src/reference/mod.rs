//! Host-emulated reference device.
//!
//! A deterministic in-process implementation of [`Driver`] used when no
//! OpenCL runtime is installed and by the test suite. Memory objects are
//! page-aligned host allocations, commands execute synchronously at enqueue
//! time, and kernels are host closures registered by name.

mod kernel;
mod memory;
mod signature;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::{debug, info, warn};

use crate::driver::{Backend, Driver, NativeArg};
use crate::error::{DriverError, Result, Status};
use crate::flags::{MapFlags, MemFlags};
use crate::handle::{EventHandle, KernelHandle, MemHandle, ProgramHandle};
use crate::types::{AddressQualifier, DeviceInfo, DeviceType, PlatformInfo, ProfilingInfo};

pub use kernel::{HostKernel, KernelFault, KernelInvocation};
pub use signature::{parse_kernels, KernelSignature, ParamSignature};

use kernel::InvocationArg;
use memory::HostAllocation;

/// Platform name reported by [`ReferenceBackend::new`].
pub const REFERENCE_PLATFORM: &str = "SparkCL Reference";

/// Counters of the commands a [`ReferenceDriver`] has executed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReferenceStats {
    pub copies: u64,
    pub reads: u64,
    pub writes: u64,
    pub maps: u64,
    pub unmaps: u64,
    pub launches: u64,
    pub live_buffers: u64,
    pub released_buffers: u64,
    /// Releases of handles that were unknown or already released.
    pub invalid_releases: u64,
    pub live_events: u64,
    pub live_kernels: u64,
    pub live_programs: u64,
}

// ── Builder ──────────────────────────────────────────────────────────────

/// Configures a [`ReferenceDriver`].
#[derive(Debug, Clone)]
pub struct ReferenceDriverBuilder {
    info: DeviceInfo,
    kernels: Vec<HostKernel>,
}

impl Default for ReferenceDriverBuilder {
    fn default() -> Self {
        let units = std::thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            info: DeviceInfo {
                name: "SparkCL Reference Device".to_string(),
                vendor: "SparkCL".to_string(),
                device_type: DeviceType::Gpu,
                host_unified_memory: false,
                profiling_timer_resolution_ns: 1,
                max_work_group_size: 1024,
                max_compute_units: u32::try_from(units).unwrap_or(u32::MAX),
                global_mem_bytes: 1 << 30,
            },
            kernels: Vec::new(),
        }
    }
}

impl ReferenceDriverBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.info.name = name.into();
        self
    }

    pub fn device_type(mut self, device_type: DeviceType) -> Self {
        self.info.device_type = device_type;
        self
    }

    /// Report host and device as sharing one physical memory.
    pub fn unified_memory(mut self, unified: bool) -> Self {
        self.info.host_unified_memory = unified;
        self
    }

    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.info.max_work_group_size = size;
        self
    }

    /// Register the host body for kernels named `kernel.name()`.
    pub fn kernel(mut self, kernel: HostKernel) -> Self {
        self.kernels.push(kernel);
        self
    }

    pub fn kernels(mut self, kernels: impl IntoIterator<Item = HostKernel>) -> Self {
        self.kernels.extend(kernels);
        self
    }

    pub fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    pub fn build(self) -> ReferenceDriver {
        let host_kernels =
            self.kernels.into_iter().map(|k| (k.name().to_string(), k)).collect();
        ReferenceDriver {
            info: self.info,
            host_kernels,
            epoch: Instant::now(),
            state: Mutex::new(State::default()),
        }
    }
}

// ── Driver state ─────────────────────────────────────────────────────────

struct BufferRecord {
    alloc: HostAllocation,
    /// Addresses handed out by outstanding maps.
    mapped: Vec<usize>,
}

struct ProgramRecord {
    kernels: Vec<Arc<KernelSignature>>,
}

struct KernelRecord {
    signature: Arc<KernelSignature>,
    body: HostKernel,
    args: Vec<Option<NativeArg>>,
}

#[derive(Default)]
struct State {
    next_id: usize,
    buffers: HashMap<MemHandle, BufferRecord>,
    events: HashMap<EventHandle, [u64; 4]>,
    programs: HashMap<ProgramHandle, ProgramRecord>,
    kernels: HashMap<KernelHandle, KernelRecord>,
    stats: ReferenceStats,
}

impl State {
    fn next_raw(&mut self) -> usize {
        self.next_id += 1;
        0x1000 + self.next_id * 0x10
    }

    fn check_wait_list(&self, wait: &[EventHandle]) -> Result<()> {
        if wait.iter().all(|e| self.events.contains_key(e)) {
            Ok(())
        } else {
            Err(DriverError::status("check wait list", Status::INVALID_EVENT_WAIT_LIST))
        }
    }

    fn buffer(&self, mem: MemHandle, operation: &str) -> Result<&BufferRecord> {
        self.buffers
            .get(&mem)
            .ok_or_else(|| DriverError::status(operation, Status::INVALID_MEM_OBJECT))
    }

    fn kernel(&self, kernel: KernelHandle, operation: &str) -> Result<&KernelRecord> {
        self.kernels
            .get(&kernel)
            .ok_or_else(|| DriverError::status(operation, Status::INVALID_KERNEL))
    }
}

/// The reference device: one context, one in-order queue.
pub struct ReferenceDriver {
    info: DeviceInfo,
    host_kernels: HashMap<String, HostKernel>,
    epoch: Instant,
    state: Mutex<State>,
}

impl std::fmt::Debug for ReferenceDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceDriver")
            .field("device", &self.info.name)
            .field("unified_memory", &self.info.host_unified_memory)
            .field("host_kernels", &self.host_kernels.len())
            .finish()
    }
}

impl ReferenceDriver {
    pub fn builder() -> ReferenceDriverBuilder {
        ReferenceDriverBuilder::default()
    }

    /// Current reading of the device clock, in nanoseconds.
    pub fn now_ns(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_nanos()).unwrap_or(u64::MAX)
    }

    pub fn stats(&self) -> ReferenceStats {
        self.state().stats
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a completed command that was queued at `queued` and started at `start`.
    fn complete(&self, state: &mut State, queued: u64, start: u64) -> EventHandle {
        let end = self.now_ns();
        let event = EventHandle::from_raw(state.next_raw());
        state.events.insert(event, [queued, queued, start, end]);
        state.stats.live_events += 1;
        event
    }

    fn check_range(
        alloc: &HostAllocation,
        offset: usize,
        size: usize,
        operation: &str,
    ) -> Result<()> {
        if alloc.contains_range(offset, size) {
            Ok(())
        } else {
            Err(DriverError::status(operation, Status::INVALID_VALUE))
        }
    }

    fn check_arg(record: &KernelRecord, index: u32, arg: &NativeArg, state: &State) -> Result<()> {
        const OP: &str = "set kernel arg";
        let param = record
            .signature
            .params
            .get(index as usize)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_ARG_INDEX))?;
        match (param.pointer, param.address, arg) {
            (true, AddressQualifier::Local, NativeArg::Local { size_bytes }) => {
                if *size_bytes == 0 {
                    return Err(DriverError::status(OP, Status::INVALID_ARG_SIZE));
                }
            }
            (true, AddressQualifier::Local, _) => {
                return Err(DriverError::status(OP, Status::INVALID_ARG_VALUE));
            }
            (true, _, NativeArg::Mem(mem)) => {
                if !state.buffers.contains_key(mem) {
                    return Err(DriverError::status(OP, Status::INVALID_MEM_OBJECT));
                }
            }
            (true, _, _) => return Err(DriverError::status(OP, Status::INVALID_ARG_VALUE)),
            (false, _, NativeArg::Scalar(value)) => {
                // Only the byte size is known to a native runtime.
                if param.value_size().is_some_and(|size| size != value.kind().size_bytes()) {
                    return Err(DriverError::status(OP, Status::INVALID_ARG_SIZE));
                }
            }
            (false, _, NativeArg::Mem(_)) => {
                return Err(DriverError::status(OP, Status::INVALID_ARG_SIZE));
            }
            (false, _, NativeArg::Local { .. }) => {
                return Err(DriverError::status(OP, Status::INVALID_ARG_VALUE));
            }
        }
        Ok(())
    }

    fn check_work_sizes(
        &self,
        offset: Option<&[usize]>,
        global: &[usize],
        local: Option<&[usize]>,
    ) -> Result<()> {
        const OP: &str = "enqueue nd range";
        if global.is_empty() || global.len() > 3 {
            return Err(DriverError::status(OP, Status::INVALID_WORK_DIMENSION));
        }
        if global.contains(&0) {
            return Err(DriverError::status(OP, Status::INVALID_GLOBAL_WORK_SIZE));
        }
        if offset.is_some_and(|o| o.len() != global.len()) {
            return Err(DriverError::status(OP, Status::INVALID_GLOBAL_OFFSET));
        }
        if let Some(local) = local {
            let fits = local.len() == global.len()
                && local.iter().zip(global).all(|(&l, &g)| l != 0 && g % l == 0)
                && local.iter().product::<usize>() <= self.info.max_work_group_size;
            if !fits {
                return Err(DriverError::status(OP, Status::INVALID_WORK_GROUP_SIZE));
            }
        }
        Ok(())
    }
}

impl Driver for ReferenceDriver {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn create_buffer(
        &self,
        flags: MemFlags,
        size_bytes: usize,
        init: Option<&[u8]>,
    ) -> Result<MemHandle> {
        const OP: &str = "create buffer";
        let access = [MemFlags::READ_WRITE, MemFlags::WRITE_ONLY, MemFlags::READ_ONLY]
            .iter()
            .filter(|f| flags.contains(**f))
            .count();
        if access > 1
            || (flags.contains(MemFlags::USE_HOST_PTR)
                && flags.intersects(MemFlags::ALLOC_HOST_PTR | MemFlags::COPY_HOST_PTR))
        {
            return Err(DriverError::status(OP, Status::INVALID_VALUE));
        }
        if init.is_some_and(|data| data.len() != size_bytes) {
            return Err(DriverError::status(OP, Status::INVALID_VALUE));
        }
        let alloc = HostAllocation::zeroed(size_bytes)?;
        if let Some(data) = init {
            alloc.write(0, data);
        }
        let mut state = self.state();
        let mem = MemHandle::from_raw(state.next_raw());
        state.buffers.insert(mem, BufferRecord { alloc, mapped: Vec::new() });
        state.stats.live_buffers += 1;
        debug!(?mem, ?flags, size_bytes, "reference: buffer created");
        Ok(mem)
    }

    fn release_buffer(&self, mem: MemHandle) -> Result<()> {
        let mut state = self.state();
        if state.buffers.remove(&mem).is_none() {
            state.stats.invalid_releases += 1;
            return Err(DriverError::status("release buffer", Status::INVALID_MEM_OBJECT));
        }
        state.stats.live_buffers -= 1;
        state.stats.released_buffers += 1;
        debug!(?mem, "reference: buffer released");
        Ok(())
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
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let from = &state.buffer(src, OP)?.alloc;
        let to = &state.buffer(dst, OP)?.alloc;
        Self::check_range(from, src_offset, size_bytes, OP)?;
        Self::check_range(to, dst_offset, size_bytes, OP)?;
        if src == dst && src_offset.abs_diff(dst_offset) < size_bytes {
            return Err(DriverError::status(OP, Status::MEM_COPY_OVERLAP));
        }
        let start = self.now_ns();
        memory::copy_between(from, src_offset, to, dst_offset, size_bytes);
        state.stats.copies += 1;
        Ok(self.complete(&mut state, queued, start))
    }

    unsafe fn enqueue_read_buffer(
        &self,
        mem: MemHandle,
        _blocking: bool,
        offset: usize,
        dst: &mut [u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue read buffer";
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let alloc = &state.buffer(mem, OP)?.alloc;
        Self::check_range(alloc, offset, dst.len(), OP)?;
        let start = self.now_ns();
        alloc.read(offset, dst);
        state.stats.reads += 1;
        Ok(self.complete(&mut state, queued, start))
    }

    unsafe fn enqueue_write_buffer(
        &self,
        mem: MemHandle,
        _blocking: bool,
        offset: usize,
        src: &[u8],
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue write buffer";
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let alloc = &state.buffer(mem, OP)?.alloc;
        Self::check_range(alloc, offset, src.len(), OP)?;
        let start = self.now_ns();
        alloc.write(offset, src);
        state.stats.writes += 1;
        Ok(self.complete(&mut state, queued, start))
    }

    fn enqueue_map_buffer(
        &self,
        mem: MemHandle,
        _blocking: bool,
        flags: MapFlags,
        offset: usize,
        size_bytes: usize,
        wait: &[EventHandle],
    ) -> Result<(*mut u8, EventHandle)> {
        const OP: &str = "enqueue map buffer";
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let record = state
            .buffers
            .get_mut(&mem)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        Self::check_range(&record.alloc, offset, size_bytes, OP)?;
        let start = self.now_ns();
        // SAFETY: offset is inside the allocation.
        let ptr = unsafe { record.alloc.as_ptr().add(offset) };
        record.mapped.push(ptr as usize);
        state.stats.maps += 1;
        debug!(?mem, ?flags, offset, size_bytes, "reference: buffer mapped");
        Ok((ptr, self.complete(&mut state, queued, start)))
    }

    fn enqueue_unmap(
        &self,
        mem: MemHandle,
        ptr: *mut u8,
        wait: &[EventHandle],
    ) -> Result<EventHandle> {
        const OP: &str = "enqueue unmap";
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let record = state
            .buffers
            .get_mut(&mem)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_MEM_OBJECT))?;
        let position = record
            .mapped
            .iter()
            .position(|&addr| addr == ptr as usize && record.alloc.contains_ptr(ptr))
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_VALUE))?;
        let start = self.now_ns();
        record.mapped.swap_remove(position);
        state.stats.unmaps += 1;
        Ok(self.complete(&mut state, queued, start))
    }

    fn build_program(&self, source: &str, options: &str) -> Result<ProgramHandle> {
        let signatures = parse_kernels(source).map_err(|log| DriverError::Build { log })?;
        let missing: Vec<String> = signatures
            .iter()
            .filter(|sig| !self.host_kernels.contains_key(&sig.name))
            .map(|sig| {
                format!("error: kernel '{}' has no host implementation on this device", sig.name)
            })
            .collect();
        if !missing.is_empty() {
            return Err(DriverError::Build { log: missing.join("\n") });
        }
        let mut state = self.state();
        let program = ProgramHandle::from_raw(state.next_raw());
        let kernels: Vec<_> = signatures.into_iter().map(Arc::new).collect();
        debug!(?program, kernels = kernels.len(), options, "reference: program built");
        state.programs.insert(program, ProgramRecord { kernels });
        state.stats.live_programs += 1;
        Ok(program)
    }

    fn release_program(&self, program: ProgramHandle) -> Result<()> {
        let mut state = self.state();
        if state.programs.remove(&program).is_none() {
            state.stats.invalid_releases += 1;
            return Err(DriverError::status("release program", Status::INVALID_PROGRAM));
        }
        state.stats.live_programs -= 1;
        Ok(())
    }

    fn create_kernel(&self, program: ProgramHandle, name: &str) -> Result<KernelHandle> {
        const OP: &str = "create kernel";
        let mut state = self.state();
        let record = state
            .programs
            .get(&program)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_PROGRAM))?;
        let signature = record
            .kernels
            .iter()
            .find(|sig| sig.name == name)
            .cloned()
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_KERNEL_NAME))?;
        let body = self
            .host_kernels
            .get(name)
            .cloned()
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_KERNEL_NAME))?;
        let kernel = KernelHandle::from_raw(state.next_raw());
        let args = vec![None; signature.params.len()];
        state.kernels.insert(kernel, KernelRecord { signature, body, args });
        state.stats.live_kernels += 1;
        Ok(kernel)
    }

    fn release_kernel(&self, kernel: KernelHandle) -> Result<()> {
        let mut state = self.state();
        if state.kernels.remove(&kernel).is_none() {
            state.stats.invalid_releases += 1;
            return Err(DriverError::status("release kernel", Status::INVALID_KERNEL));
        }
        state.stats.live_kernels -= 1;
        Ok(())
    }

    fn kernel_num_args(&self, kernel: KernelHandle) -> Result<u32> {
        let state = self.state();
        let record = state.kernel(kernel, "kernel num args")?;
        Ok(u32::try_from(record.signature.params.len()).unwrap_or(u32::MAX))
    }

    fn kernel_arg_type_name(&self, kernel: KernelHandle, index: u32) -> Result<String> {
        const OP: &str = "kernel arg type name";
        let state = self.state();
        let record = state.kernel(kernel, OP)?;
        record
            .signature
            .params
            .get(index as usize)
            .map(|p| p.type_name.clone())
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_ARG_INDEX))
    }

    fn kernel_arg_address_qualifier(
        &self,
        kernel: KernelHandle,
        index: u32,
    ) -> Result<AddressQualifier> {
        const OP: &str = "kernel arg address qualifier";
        let state = self.state();
        let record = state.kernel(kernel, OP)?;
        record
            .signature
            .params
            .get(index as usize)
            .map(|p| p.address)
            .ok_or_else(|| DriverError::status(OP, Status::INVALID_ARG_INDEX))
    }

    fn set_kernel_arg(&self, kernel: KernelHandle, index: u32, arg: &NativeArg) -> Result<()> {
        let mut state = self.state();
        let record = state.kernel(kernel, "set kernel arg")?;
        Self::check_arg(record, index, arg, &state)?;
        if let Some(record) = state.kernels.get_mut(&kernel) {
            record.args[index as usize] = Some(*arg);
        }
        Ok(())
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
        let queued = self.now_ns();
        let mut state = self.state();
        state.check_wait_list(wait)?;
        let record = state.kernel(kernel, OP)?;
        self.check_work_sizes(offset, global, local)?;

        // Local scratch lives for the launch; inner buffers never move.
        let mut scratch: Vec<Vec<u8>> = Vec::new();
        let mut args = Vec::with_capacity(record.args.len());
        for arg in &record.args {
            match arg {
                None => return Err(DriverError::status(OP, Status::INVALID_KERNEL_ARGS)),
                Some(NativeArg::Scalar(value)) => args.push(InvocationArg::Scalar(*value)),
                Some(NativeArg::Mem(mem)) => {
                    let alloc = &state.buffer(*mem, OP)?.alloc;
                    args.push(InvocationArg::Memory { ptr: alloc.as_ptr(), len: alloc.len() });
                }
                Some(NativeArg::Local { size_bytes }) => {
                    let mut region = vec![0u8; *size_bytes];
                    let ptr = region.as_mut_ptr();
                    args.push(InvocationArg::Memory { ptr, len: region.len() });
                    scratch.push(region);
                }
            }
        }
        let body = record.body.clone();
        let name = record.signature.name.clone();

        let start = self.now_ns();
        // SAFETY: buffer allocations stay alive while the state lock is held,
        // and scratch regions outlive the invocation.
        let mut invocation = unsafe { KernelInvocation::new(global, local, offset, args) };
        let outcome = body.run(&mut invocation);
        drop(invocation);
        drop(scratch);
        if let Err(fault) = outcome {
            warn!(kernel = %name, %fault, "reference: kernel faulted");
            return Err(DriverError::status(
                format!("launch kernel '{name}': {fault}"),
                Status::OUT_OF_RESOURCES,
            ));
        }
        state.stats.launches += 1;
        debug!(kernel = %name, ?global, ?local, "reference: kernel launched");
        Ok(self.complete(&mut state, queued, start))
    }

    fn wait_for_events(&self, events: &[EventHandle]) -> Result<()> {
        if events.is_empty() {
            return Err(DriverError::status("wait for events", Status::INVALID_VALUE));
        }
        let state = self.state();
        if events.iter().all(|e| state.events.contains_key(e)) {
            Ok(())
        } else {
            Err(DriverError::status("wait for events", Status::INVALID_EVENT))
        }
    }

    fn event_profiling_info(&self, event: EventHandle, info: ProfilingInfo) -> Result<u64> {
        let state = self.state();
        let times = state
            .events
            .get(&event)
            .ok_or_else(|| DriverError::status("event profiling info", Status::INVALID_EVENT))?;
        Ok(match info {
            ProfilingInfo::Queued => times[0],
            ProfilingInfo::Submitted => times[1],
            ProfilingInfo::Started => times[2],
            ProfilingInfo::Ended => times[3],
        })
    }

    fn release_event(&self, event: EventHandle) -> Result<()> {
        let mut state = self.state();
        if state.events.remove(&event).is_none() {
            state.stats.invalid_releases += 1;
            return Err(DriverError::status("release event", Status::INVALID_EVENT));
        }
        state.stats.live_events -= 1;
        Ok(())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// Bootstrap for reference devices: a configurable list of platforms, each
/// exposing one device built from the same [`ReferenceDriverBuilder`].
#[derive(Debug)]
pub struct ReferenceBackend {
    platforms: Vec<PlatformInfo>,
    device: ReferenceDriverBuilder,
    opened: Mutex<Vec<(usize, Arc<ReferenceDriver>)>>,
}

impl Default for ReferenceBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl ReferenceBackend {
    pub fn new() -> Self {
        Self::with_platforms([REFERENCE_PLATFORM])
    }

    pub fn with_platforms<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let platforms = names
            .into_iter()
            .enumerate()
            .map(|(index, name)| PlatformInfo {
                index,
                name: name.into(),
                vendor: "SparkCL".to_string(),
                version: "OpenCL 1.2 reference".to_string(),
            })
            .collect();
        Self {
            platforms,
            device: ReferenceDriverBuilder::default(),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn with_device(mut self, device: ReferenceDriverBuilder) -> Self {
        self.device = device;
        self
    }

    /// Platform index and driver of the most recent [`Backend::open`].
    pub fn last_opened(&self) -> Option<(usize, Arc<ReferenceDriver>)> {
        self.opened.lock().unwrap_or_else(PoisonError::into_inner).last().cloned()
    }
}

impl Backend for ReferenceBackend {
    fn platforms(&self) -> Result<Vec<PlatformInfo>> {
        if self.platforms.is_empty() {
            return Err(DriverError::NoPlatform);
        }
        Ok(self.platforms.clone())
    }

    fn devices(&self, platform: usize, device_type: DeviceType) -> Result<Vec<DeviceInfo>> {
        if platform >= self.platforms.len() {
            return Err(DriverError::status("get device ids", Status::INVALID_PLATFORM));
        }
        let info = self.device.device_info();
        Ok(if device_type.matches(info.device_type) { vec![info.clone()] } else { Vec::new() })
    }

    fn open(
        &self,
        platform: usize,
        device_type: DeviceType,
        device: usize,
    ) -> Result<Arc<dyn Driver>> {
        let devices = self.devices(platform, device_type)?;
        if device >= devices.len() {
            return Err(DriverError::NoDevice {
                reason: format!(
                    "platform {platform} has {} {device_type} device(s), index {device} requested",
                    devices.len()
                ),
            });
        }
        let driver = Arc::new(self.device.clone().build());
        info!(platform, device = %driver.info.name, "reference: device opened");
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((platform, driver.clone()));
        Ok(driver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ScalarValue;

    fn scale_kernel() -> HostKernel {
        HostKernel::new("scale", |inv| {
            let factor: f32 = inv.scalar(1)?;
            for [i, _, _] in inv.global_ids() {
                let v: f32 = inv.load(0, i)?;
                inv.store(0, i, v * factor)?;
            }
            Ok(())
        })
    }

    const SCALE_SRC: &str = "__kernel void scale(__global float* data, float factor) {}";

    #[test]
    fn buffer_lifecycle_updates_stats() {
        let driver = ReferenceDriver::builder().build();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 64, None).unwrap();
        assert_eq!(driver.stats().live_buffers, 1);
        driver.release_buffer(mem).unwrap();
        assert!(driver.release_buffer(mem).is_err());
        let stats = driver.stats();
        assert_eq!(stats.live_buffers, 0);
        assert_eq!(stats.released_buffers, 1);
        assert_eq!(stats.invalid_releases, 1);
    }

    #[test]
    fn conflicting_access_flags_rejected() {
        let driver = ReferenceDriver::builder().build();
        let err = driver
            .create_buffer(MemFlags::READ_ONLY | MemFlags::WRITE_ONLY, 16, None)
            .unwrap_err();
        assert_eq!(err.native_status(), Some(Status::INVALID_VALUE));
    }

    #[test]
    fn event_timestamps_are_ordered() {
        let driver = ReferenceDriver::builder().build();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 16, Some(&[7u8; 16])).unwrap();
        let mut out = [0u8; 16];
        let event = unsafe { driver.enqueue_read_buffer(mem, true, 0, &mut out, &[]) }.unwrap();
        assert_eq!(out, [7u8; 16]);
        let times: Vec<u64> = ProfilingInfo::ALL
            .iter()
            .map(|&i| driver.event_profiling_info(event, i).unwrap())
            .collect();
        assert!(times.windows(2).all(|w| w[0] <= w[1]), "{times:?}");
        assert!(times[3] <= driver.now_ns());
    }

    #[test]
    fn unknown_wait_event_rejected() {
        let driver = ReferenceDriver::builder().build();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 4, None).unwrap();
        let bogus = EventHandle::from_raw(1);
        let err = driver.enqueue_copy_buffer(mem, mem, 0, 0, 0, &[bogus]).unwrap_err();
        assert_eq!(err.native_status(), Some(Status::INVALID_EVENT_WAIT_LIST));
    }

    #[test]
    fn map_unmap_pairs_by_pointer() {
        let driver = ReferenceDriver::builder().build();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 8, None).unwrap();
        let (ptr, _) = driver.enqueue_map_buffer(mem, true, MapFlags::WRITE, 0, 8, &[]).unwrap();
        unsafe { ptr.write(42) };
        driver.enqueue_unmap(mem, ptr, &[]).unwrap();
        assert!(driver.enqueue_unmap(mem, ptr, &[]).is_err());
        let mut out = [0u8; 1];
        unsafe { driver.enqueue_read_buffer(mem, true, 0, &mut out, &[]).unwrap() };
        assert_eq!(out[0], 42);
    }

    #[test]
    fn build_requires_host_implementation() {
        let driver = ReferenceDriver::builder().build();
        match driver.build_program(SCALE_SRC, "") {
            Err(DriverError::Build { log }) => assert!(log.contains("'scale'"), "{log}"),
            other => panic!("expected build failure, got {other:?}"),
        }
    }

    #[test]
    fn launch_runs_host_kernel() {
        let driver = ReferenceDriver::builder().kernel(scale_kernel()).build();
        let program = driver.build_program(SCALE_SRC, "").unwrap();
        let kernel = driver.create_kernel(program, "scale").unwrap();
        assert_eq!(driver.kernel_arg_type_name(kernel, 0).unwrap(), "float*");

        let data: Vec<u8> = [1.0f32, 2.0, 3.0].iter().flat_map(|v| v.to_ne_bytes()).collect();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, data.len(), Some(&data)).unwrap();

        let unset = driver.enqueue_nd_range(kernel, None, &[3], None, &[]).unwrap_err();
        assert_eq!(unset.native_status(), Some(Status::INVALID_KERNEL_ARGS));

        driver.set_kernel_arg(kernel, 0, &NativeArg::Mem(mem)).unwrap();
        driver.set_kernel_arg(kernel, 1, &NativeArg::Scalar(ScalarValue::F32(2.0))).unwrap();
        driver.enqueue_nd_range(kernel, None, &[3], None, &[]).unwrap();

        let mut out = [0u8; 12];
        unsafe { driver.enqueue_read_buffer(mem, true, 0, &mut out, &[]).unwrap() };
        let values: Vec<f32> = out
            .chunks_exact(4)
            .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, [2.0, 4.0, 6.0]);
        assert_eq!(driver.stats().launches, 1);
    }

    #[test]
    fn set_arg_checks_size_not_kind() {
        let driver = ReferenceDriver::builder().kernel(scale_kernel()).build();
        let program = driver.build_program(SCALE_SRC, "").unwrap();
        let kernel = driver.create_kernel(program, "scale").unwrap();
        // Same byte size as float: accepted, as a native runtime would.
        driver.set_kernel_arg(kernel, 1, &NativeArg::Scalar(ScalarValue::I32(5))).unwrap();
        let err = driver
            .set_kernel_arg(kernel, 1, &NativeArg::Scalar(ScalarValue::F64(5.0)))
            .unwrap_err();
        assert_eq!(err.native_status(), Some(Status::INVALID_ARG_SIZE));
        let err = driver.set_kernel_arg(kernel, 2, &NativeArg::Scalar(ScalarValue::F32(1.0)));
        assert_eq!(err.unwrap_err().native_status(), Some(Status::INVALID_ARG_INDEX));
    }

    #[test]
    fn out_of_bounds_store_fails_launch() {
        let driver = ReferenceDriver::builder().kernel(scale_kernel()).build();
        let program = driver.build_program(SCALE_SRC, "").unwrap();
        let kernel = driver.create_kernel(program, "scale").unwrap();
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 8, None).unwrap();
        driver.set_kernel_arg(kernel, 0, &NativeArg::Mem(mem)).unwrap();
        driver.set_kernel_arg(kernel, 1, &NativeArg::Scalar(ScalarValue::F32(1.0))).unwrap();
        let err = driver.enqueue_nd_range(kernel, None, &[4], None, &[]).unwrap_err();
        assert_eq!(err.native_status(), Some(Status::OUT_OF_RESOURCES));
        assert_eq!(driver.stats().live_events, 0);
    }

    #[test]
    fn work_group_must_divide_global() {
        let driver = ReferenceDriver::builder().build();
        assert!(driver.check_work_sizes(None, &[64], Some(&[16])).is_ok());
        let err = driver.check_work_sizes(None, &[60], Some(&[16])).unwrap_err();
        assert_eq!(err.native_status(), Some(Status::INVALID_WORK_GROUP_SIZE));
        let err = driver.check_work_sizes(None, &[1, 1, 1, 1], None).unwrap_err();
        assert_eq!(err.native_status(), Some(Status::INVALID_WORK_DIMENSION));
    }

    #[test]
    fn backend_filters_by_device_type() {
        let backend = ReferenceBackend::with_platforms(["A", "B"])
            .with_device(ReferenceDriver::builder().device_type(DeviceType::Cpu));
        assert_eq!(backend.platforms().unwrap().len(), 2);
        assert!(backend.devices(0, DeviceType::Gpu).unwrap().is_empty());
        assert_eq!(backend.devices(1, DeviceType::All).unwrap().len(), 1);
        assert!(matches!(
            backend.open(0, DeviceType::Gpu, 0),
            Err(DriverError::NoDevice { .. })
        ));
        backend.open(1, DeviceType::Cpu, 0).unwrap();
        assert_eq!(backend.last_opened().map(|(p, _)| p), Some(1));
    }
}
