//! Native compute driver seam for SparkCL.
//!
//! A [`Driver`] is one device context with one in-order, profiling-enabled
//! command queue; a [`Backend`] enumerates platforms and devices and opens
//! drivers. Two implementations are provided:
//!
//! - [`reference`]: a host-emulated device, always available.
//! - `opencl` (feature `opencl`): the installed OpenCL runtime via `opencl3`.

pub mod driver;
pub mod error;
pub mod flags;
pub mod handle;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod reference;
pub mod types;

pub use driver::{Backend, Driver, NativeArg};
pub use error::{check, DriverError, Result, Status};
pub use flags::{MapFlags, MemFlags};
pub use handle::{EventHandle, KernelHandle, MemHandle, ProgramHandle};
#[cfg(feature = "opencl")]
pub use opencl::{OpenClBackend, OpenClDriver};
pub use reference::{
    HostKernel, KernelFault, KernelInvocation, ReferenceBackend, ReferenceDriver,
    ReferenceDriverBuilder, ReferenceStats,
};
pub use types::{
    AddressQualifier, DeviceInfo, DeviceType, Element, PlatformInfo, ProfilingInfo, ScalarKind,
    ScalarValue,
};
