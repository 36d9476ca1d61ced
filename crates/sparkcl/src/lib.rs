//! SparkCL: host-side orchestration for one compute device.
//!
//! A [`RuntimeContext`] owns one device context and one in-order,
//! profiling-enabled command queue. On top of it:
//!
//! - [`ComputeBuffer`] places typed arrays on the host, the device, or both,
//!   and moves data between them. Unified-memory devices get a single
//!   aliased memory object.
//! - [`Accessor`] is a scoped, exclusive mapped view of a buffer's host side.
//! - [`Program`] and [`Kernel`] compile sources and bind type-checked
//!   arguments before dispatch.
//! - [`Event`] tracks completion and timing of every command; with profiling
//!   enabled the runtime aggregates them per [`CommandClass`].
//!
//! ```no_run
//! use sparkcl::{ComputeBuffer, MemFlags, NDRange, PlacementPolicy, Program, RuntimeContext};
//!
//! # fn main() -> sparkcl::Result<()> {
//! let rt = RuntimeContext::from_env()?;
//! let data = ComputeBuffer::from_slice(
//!     &rt,
//!     &[1.0f32, 2.0, 3.0, 4.0],
//!     PlacementPolicy::HostAndDevice,
//!     MemFlags::READ_WRITE,
//! )?;
//! data.to_device(true, &[])?;
//!
//! let program = Program::from_file(&rt, "kernels/scale.cl")?;
//! let mut kernel = program.kernel("scale", NDRange::d1(4), NDRange::none())?;
//! kernel.push_arg(&data)?;
//! kernel.push_arg(2.0f32)?;
//! kernel.execute(true, &[])?;
//!
//! data.to_host(true, &[])?;
//! # Ok(())
//! # }
//! ```

pub mod accessor;
pub mod arg;
pub mod buffer;
pub mod config;
pub mod error;
pub mod event;
pub mod kernel;
pub mod ndrange;
pub mod profiling;
pub mod program;
pub mod runtime;

pub use accessor::Accessor;
pub use arg::{ArgAccess, ArgDescriptor, ArgInfo, KernelArg, LocalSize};
pub use buffer::{ComputeBuffer, PlacementKind, PlacementPolicy};
pub use config::{ConfigError, RuntimeConfig};
pub use error::{AccessorId, ActualArg, BufferId, Result, SparkError};
pub use event::{CommandClass, Event, EventTimings};
pub use kernel::Kernel;
pub use ndrange::NDRange;
pub use profiling::{EventRegistry, ProfilingSummary};
pub use program::Program;
pub use runtime::{select_platform, RecordedEvents, RuntimeContext};

pub use sparkcl_driver as driver;
pub use sparkcl_driver::{
    AddressQualifier, DeviceInfo, DeviceType, Element, MapFlags, MemFlags, PlatformInfo,
    ProfilingInfo, ScalarKind,
};
