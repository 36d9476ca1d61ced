//! Native status codes mapped to Rust error types.

use std::fmt;

use thiserror::Error;

/// Raw status code returned by a native compute call.
///
/// Zero is success; negative values are the standard OpenCL error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub i32);

impl Status {
    pub const SUCCESS: Status = Status(0);
    pub const DEVICE_NOT_FOUND: Status = Status(-1);
    pub const MEM_OBJECT_ALLOCATION_FAILURE: Status = Status(-4);
    pub const OUT_OF_RESOURCES: Status = Status(-5);
    pub const OUT_OF_HOST_MEMORY: Status = Status(-6);
    pub const PROFILING_INFO_NOT_AVAILABLE: Status = Status(-7);
    pub const MEM_COPY_OVERLAP: Status = Status(-8);
    pub const BUILD_PROGRAM_FAILURE: Status = Status(-11);
    pub const MAP_FAILURE: Status = Status(-12);
    pub const KERNEL_ARG_INFO_NOT_AVAILABLE: Status = Status(-19);
    pub const INVALID_VALUE: Status = Status(-30);
    pub const INVALID_PLATFORM: Status = Status(-32);
    pub const INVALID_DEVICE: Status = Status(-33);
    pub const INVALID_MEM_OBJECT: Status = Status(-38);
    pub const INVALID_PROGRAM: Status = Status(-44);
    pub const INVALID_PROGRAM_EXECUTABLE: Status = Status(-45);
    pub const INVALID_KERNEL_NAME: Status = Status(-46);
    pub const INVALID_KERNEL: Status = Status(-48);
    pub const INVALID_ARG_INDEX: Status = Status(-49);
    pub const INVALID_ARG_VALUE: Status = Status(-50);
    pub const INVALID_ARG_SIZE: Status = Status(-51);
    pub const INVALID_KERNEL_ARGS: Status = Status(-52);
    pub const INVALID_WORK_DIMENSION: Status = Status(-53);
    pub const INVALID_WORK_GROUP_SIZE: Status = Status(-54);
    pub const INVALID_GLOBAL_OFFSET: Status = Status(-56);
    pub const INVALID_EVENT_WAIT_LIST: Status = Status(-57);
    pub const INVALID_EVENT: Status = Status(-58);
    pub const INVALID_OPERATION: Status = Status(-59);
    pub const INVALID_BUFFER_SIZE: Status = Status(-61);
    pub const INVALID_GLOBAL_WORK_SIZE: Status = Status(-63);

    /// Raw numeric code.
    pub fn code(self) -> i32 {
        self.0
    }

    pub fn is_success(self) -> bool {
        self.0 == 0
    }

    /// Symbolic name of the code, or `CL_UNKNOWN_ERROR` for codes outside
    /// the table.
    pub fn name(self) -> &'static str {
        match self.0 {
            0 => "CL_SUCCESS",
            -1 => "CL_DEVICE_NOT_FOUND",
            -2 => "CL_DEVICE_NOT_AVAILABLE",
            -3 => "CL_COMPILER_NOT_AVAILABLE",
            -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
            -5 => "CL_OUT_OF_RESOURCES",
            -6 => "CL_OUT_OF_HOST_MEMORY",
            -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
            -8 => "CL_MEM_COPY_OVERLAP",
            -11 => "CL_BUILD_PROGRAM_FAILURE",
            -12 => "CL_MAP_FAILURE",
            -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
            -30 => "CL_INVALID_VALUE",
            -32 => "CL_INVALID_PLATFORM",
            -33 => "CL_INVALID_DEVICE",
            -34 => "CL_INVALID_CONTEXT",
            -36 => "CL_INVALID_COMMAND_QUEUE",
            -38 => "CL_INVALID_MEM_OBJECT",
            -44 => "CL_INVALID_PROGRAM",
            -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
            -46 => "CL_INVALID_KERNEL_NAME",
            -48 => "CL_INVALID_KERNEL",
            -49 => "CL_INVALID_ARG_INDEX",
            -50 => "CL_INVALID_ARG_VALUE",
            -51 => "CL_INVALID_ARG_SIZE",
            -52 => "CL_INVALID_KERNEL_ARGS",
            -53 => "CL_INVALID_WORK_DIMENSION",
            -54 => "CL_INVALID_WORK_GROUP_SIZE",
            -55 => "CL_INVALID_WORK_ITEM_SIZE",
            -56 => "CL_INVALID_GLOBAL_OFFSET",
            -57 => "CL_INVALID_EVENT_WAIT_LIST",
            -58 => "CL_INVALID_EVENT",
            -59 => "CL_INVALID_OPERATION",
            -61 => "CL_INVALID_BUFFER_SIZE",
            -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
            _ => "CL_UNKNOWN_ERROR",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.0)
    }
}

/// Errors produced by a compute driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// A native call reported a non-success status.
    #[error("{operation} failed: {status}")]
    Status { operation: String, status: Status },

    /// Program compilation failed; `log` holds the full compiler output.
    #[error("program build failed:\n{log}")]
    Build { log: String },

    #[error("no compute platforms found")]
    NoPlatform,

    #[error("no compute device found: {reason}")]
    NoDevice { reason: String },
}

impl DriverError {
    pub fn status(operation: impl Into<String>, status: Status) -> Self {
        Self::Status { operation: operation.into(), status }
    }

    /// Native status carried by this error, if any.
    pub fn native_status(&self) -> Option<Status> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Build { .. } => Some(Status::BUILD_PROGRAM_FAILURE),
            Self::NoDevice { .. } => Some(Status::DEVICE_NOT_FOUND),
            Self::NoPlatform => None,
        }
    }
}

/// Convenience result alias.
pub type Result<T> = std::result::Result<T, DriverError>;

/// Check a raw status code and convert it to `Result<()>`.
pub fn check(code: i32, operation: &str) -> Result<()> {
    let status = Status(code);
    if status.is_success() {
        Ok(())
    } else {
        Err(DriverError::status(operation, status))
    }
}
