//! Kernel argument binding and dispatch.
//!
//! Each slot's declared type is queried from the driver the first time the
//! slot is bound and cached as an [`ArgInfo`]. Every bind is checked against
//! that descriptor before the native argument table is touched, so a
//! rejected bind leaves the slot exactly as it was.

use std::fmt;

use sparkcl_driver::{Element, KernelHandle};
use tracing::{debug, warn};

use crate::arg::{ArgDescriptor, ArgInfo, KernelArg, LocalSize};
use crate::buffer::MapWatch;
use crate::error::{Result, SparkError};
use crate::event::{self, CommandClass, Event};
use crate::ndrange::NDRange;
use crate::program::Program;

/// A kernel of a built [`Program`] with its launch extents.
pub struct Kernel {
    program: Program,
    handle: KernelHandle,
    name: String,
    slots: Vec<Option<ArgInfo>>,
    bound: Vec<bool>,
    // Mapping state of the buffer bound to each slot, if any.
    buffers: Vec<Option<MapWatch>>,
    cursor: u32,
    global_work: NDRange,
    local_work: NDRange,
    global_offset: NDRange,
}

impl Kernel {
    pub(crate) fn new(
        program: Program,
        name: &str,
        global_work: NDRange,
        local_work: NDRange,
    ) -> Result<Self> {
        let driver = program.runtime().driver().clone();
        let handle = driver.create_kernel(program.handle(), name)?;
        let mut kernel = Self {
            program,
            handle,
            name: name.to_string(),
            slots: Vec::new(),
            bound: Vec::new(),
            buffers: Vec::new(),
            cursor: 0,
            global_work,
            local_work,
            global_offset: NDRange::none(),
        };
        let num_args = driver.kernel_num_args(handle)? as usize;
        kernel.slots = vec![None; num_args];
        kernel.bound = vec![false; num_args];
        kernel.buffers = vec![None; num_args];
        debug!(kernel = %kernel.name, num_args, "kernel created");
        Ok(kernel)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handle(&self) -> KernelHandle {
        self.handle
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn num_args(&self) -> u32 {
        u32::try_from(self.slots.len()).unwrap_or(u32::MAX)
    }

    // ── Binding ─────────────────────────────────────────────────

    /// Declared type of slot `index`, queried once and cached.
    pub fn arg_info(&mut self, index: u32) -> Result<ArgInfo> {
        let num_args = self.slots.len();
        let slot = self.slots.get_mut(index as usize).ok_or_else(|| {
            SparkError::configuration(format!(
                "kernel '{}' has {num_args} argument(s); index {index} is out of range",
                self.name
            ))
        })?;
        if let Some(info) = slot {
            return Ok(info.clone());
        }
        let driver = self.program.runtime().driver();
        let type_name = driver.kernel_arg_type_name(self.handle, index)?;
        let address = driver.kernel_arg_address_qualifier(self.handle, index)?;
        let descriptor = ArgDescriptor::parse(&type_name)?;
        let info = ArgInfo { type_name, address, descriptor };
        *slot = Some(info.clone());
        Ok(info)
    }

    /// Bind `arg` to slot `index` after checking it against the declared type.
    pub fn set_arg<A: KernelArg>(&mut self, index: u32, arg: A) -> Result<()> {
        let info = self.arg_info(index)?;
        let actual = arg.actual();
        if !info.descriptor.accepts(actual) {
            return Err(SparkError::TypeMismatch {
                kernel: self.name.clone(),
                index,
                expected: info.descriptor,
                actual,
            });
        }
        info.check_address(&self.name, index, actual)?;
        let native = arg.native()?;
        self.program.runtime().driver().set_kernel_arg(self.handle, index, &native)?;
        self.bound[index as usize] = true;
        self.buffers[index as usize] = arg.map_watch();
        debug!(kernel = %self.name, index, arg = %actual, "argument bound");
        Ok(())
    }

    /// Bind `arg` at the cursor and advance it. Returns the new cursor.
    ///
    /// The cursor only moves when the bind succeeds.
    pub fn push_arg<A: KernelArg>(&mut self, arg: A) -> Result<u32> {
        self.set_arg(self.cursor, arg)?;
        self.cursor += 1;
        Ok(self.cursor)
    }

    /// Reserve `len` elements of `T` of work-group local memory for slot
    /// `index`.
    pub fn set_size<T: Element>(&mut self, index: u32, len: usize) -> Result<()> {
        self.set_arg(index, LocalSize::<T>::new(len))
    }

    pub fn is_bound(&self, index: u32) -> bool {
        self.bound.get(index as usize).copied().unwrap_or(false)
    }

    pub fn cursor(&self) -> u32 {
        self.cursor
    }

    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    // ── Work sizes ──────────────────────────────────────────────

    pub fn global_work(&self) -> NDRange {
        self.global_work
    }

    pub fn set_global_work(&mut self, global: NDRange) {
        self.global_work = global;
    }

    pub fn local_work(&self) -> NDRange {
        self.local_work
    }

    /// [`NDRange::none`] lets the driver choose.
    pub fn set_local_work(&mut self, local: NDRange) {
        self.local_work = local;
    }

    pub fn global_offset(&self) -> NDRange {
        self.global_offset
    }

    pub fn set_global_offset(&mut self, offset: NDRange) {
        self.global_offset = offset;
    }

    // ── Dispatch ────────────────────────────────────────────────

    /// Enqueue one launch over the global work extent.
    ///
    /// With `blocking`, waits for this launch only. Fails with
    /// [`SparkError::BufferMapped`] if a bound buffer is mapped.
    pub fn execute(&self, blocking: bool, wait: &[&Event]) -> Result<Event> {
        if self.global_work.is_none() {
            return Err(SparkError::configuration(format!(
                "kernel '{}' has no global work size",
                self.name
            )));
        }
        for watch in self.buffers.iter().flatten() {
            watch.ensure_unmapped()?;
        }
        let offset = (!self.global_offset.is_none()).then(|| self.global_offset.sizes());
        let local = (!self.local_work.is_none()).then(|| self.local_work.sizes());
        let rt = self.program.runtime();
        let handle = rt.driver().enqueue_nd_range(
            self.handle,
            offset,
            self.global_work.sizes(),
            local,
            &event::handles(wait),
        )?;
        let event = rt.track(handle, CommandClass::Compute);
        debug!(
            kernel = %self.name,
            global = %self.global_work,
            local = %self.local_work,
            "kernel enqueued"
        );
        if blocking {
            event.wait()?;
        }
        Ok(event)
    }
}

impl Drop for Kernel {
    fn drop(&mut self) {
        if let Err(e) = self.program.runtime().driver().release_kernel(self.handle) {
            warn!(kernel = %self.name, error = %e, "failed to release kernel");
        }
    }
}

impl fmt::Debug for Kernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel")
            .field("name", &self.name)
            .field("num_args", &self.slots.len())
            .field("cursor", &self.cursor)
            .field("global_work", &self.global_work)
            .field("local_work", &self.local_work)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use sparkcl_driver::{HostKernel, MemFlags, ReferenceDriver, ScalarKind};

    use super::*;
    use crate::arg::ArgAccess;
    use crate::buffer::{ComputeBuffer, PlacementPolicy};
    use crate::config::RuntimeConfig;
    use crate::error::ActualArg;
    use crate::runtime::RuntimeContext;

    const SOURCE: &str = r#"
        __kernel void scale(__global float* data, float factor, __local float* scratch) {
        }
    "#;

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

    fn setup() -> (Arc<ReferenceDriver>, RuntimeContext, Program) {
        let driver = Arc::new(ReferenceDriver::builder().kernel(scale_kernel()).build());
        let rt = RuntimeContext::with_driver(driver.clone(), RuntimeConfig::default()).unwrap();
        let program = Program::from_source(&rt, SOURCE).unwrap();
        (driver, rt, program)
    }

    #[test]
    fn slot_info_is_parsed_from_signature() {
        let (_, _, program) = setup();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        assert_eq!(k.num_args(), 3);
        let info = k.arg_info(0).unwrap();
        assert_eq!(info.type_name, "float*");
        assert_eq!(info.descriptor.access, ArgAccess::Pointer);
        assert!(matches!(k.arg_info(3), Err(SparkError::Configuration { .. })));
    }

    #[test]
    fn mismatched_scalar_is_rejected_and_slot_stays_unbound() {
        let (_, _, program) = setup();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        let err = k.set_arg(1, 2i32).unwrap_err();
        match err {
            SparkError::TypeMismatch { index, expected, actual, .. } => {
                assert_eq!(index, 1);
                assert_eq!(expected.kind, ScalarKind::F32);
                assert_eq!(actual, ActualArg::Value(ScalarKind::I32));
            }
            other => panic!("expected type mismatch, got {other}"),
        }
        assert!(!k.is_bound(1));
        k.set_arg(1, 2.0f32).unwrap();
        assert!(k.is_bound(1));
    }

    #[test]
    fn push_arg_advances_only_on_success() {
        let (_, rt, program) = setup();
        let buf = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)
            .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        assert_eq!(k.push_arg(&buf).unwrap(), 1);
        assert!(k.push_arg(1u32).is_err());
        assert_eq!(k.cursor(), 1);
        assert_eq!(k.push_arg(0.5f32).unwrap(), 2);
        k.reset_cursor();
        assert_eq!(k.cursor(), 0);
    }

    #[test]
    fn local_slot_needs_local_size() {
        let (_, rt, program) = setup();
        let buf = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)
            .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        assert!(matches!(k.set_arg(2, &buf), Err(SparkError::Configuration { .. })));
        assert!(matches!(k.set_arg(0, LocalSize::<f32>::new(4)), Err(SparkError::Configuration { .. })));
        assert!(matches!(k.set_size::<f32>(1, 4), Err(SparkError::TypeMismatch { .. })));
        k.set_size::<f32>(2, 4).unwrap();
        assert!(k.is_bound(2));
        // Local memory is sized in bytes; the element kind need not match.
        k.set_size::<u8>(2, 16).unwrap();
        k.set_size::<i32>(2, 4).unwrap();
    }

    #[test]
    fn host_only_buffer_is_not_a_kernel_argument() {
        let (_, rt, program) = setup();
        let buf = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::HostOnly, MemFlags::READ_WRITE)
            .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        assert!(matches!(k.set_arg(0, &buf), Err(SparkError::Configuration { .. })));
    }

    #[test]
    fn execute_runs_the_kernel() {
        let (driver, rt, program) = setup();
        let buf = ComputeBuffer::from_slice(
            &rt,
            &[1.0f32, 2.0, 3.0, 4.0],
            PlacementPolicy::DeviceOnly,
            MemFlags::READ_WRITE,
        )
        .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::d1(2)).unwrap();
        k.push_arg(&buf).unwrap();
        k.push_arg(3.0f32).unwrap();
        k.set_size::<f32>(2, 2).unwrap();
        let event = k.execute(true, &[]).unwrap();
        assert_eq!(event.command(), CommandClass::Compute);

        let mut out = [0f32; 4];
        buf.device_read_to(&mut out).unwrap();
        assert_eq!(out, [3.0, 6.0, 9.0, 12.0]);
        assert_eq!(driver.stats().launches, 1);
    }

    #[test]
    fn buffer_mapped_after_binding_blocks_launch() {
        let (driver, rt, program) = setup();
        let buf = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)
            .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::d1(2)).unwrap();
        k.push_arg(&buf).unwrap();
        k.push_arg(2.0f32).unwrap();
        k.set_size::<f32>(2, 2).unwrap();

        let view = buf.map_host(sparkcl_driver::MapFlags::WRITE).unwrap();
        let err = k.execute(true, &[]).unwrap_err();
        assert!(matches!(err, SparkError::BufferMapped { buffer, .. } if buffer == buf.id()), "{err}");
        assert_eq!(driver.stats().launches, 0);

        view.unmap().unwrap();
        k.execute(true, &[]).unwrap();
        assert_eq!(driver.stats().launches, 1);
    }

    #[test]
    fn rebinding_a_slot_drops_its_mapping_check() {
        let (_, rt, program) = setup();
        let a = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::HostAndDevice, MemFlags::READ_WRITE)
            .unwrap();
        let b = ComputeBuffer::<f32>::new(&rt, 4, PlacementPolicy::DeviceOnly, MemFlags::READ_WRITE)
            .unwrap();
        let mut k = program.kernel("scale", NDRange::d1(4), NDRange::d1(2)).unwrap();
        k.set_arg(0, &a).unwrap();
        k.set_arg(1, 1.0f32).unwrap();
        k.set_size::<f32>(2, 2).unwrap();
        k.set_arg(0, &b).unwrap();

        let _view = a.map_host(sparkcl_driver::MapFlags::READ).unwrap();
        k.execute(true, &[]).unwrap();
    }

    #[test]
    fn unset_arguments_fail_natively() {
        let (_, _, program) = setup();
        let k = program.kernel("scale", NDRange::d1(4), NDRange::none()).unwrap();
        let err = k.execute(true, &[]).unwrap_err();
        assert_eq!(err.native_status(), Some(sparkcl_driver::Status::INVALID_KERNEL_ARGS));
    }
}
