//! Error types for the runtime layer.

use std::path::PathBuf;

use sparkcl_driver::{DriverError, ScalarKind};
use thiserror::Error;

use crate::arg::ArgDescriptor;
use crate::config::ConfigError;

/// Identity of a mapped-view owner, unique within its runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AccessorId(pub(crate) u64);

impl std::fmt::Display for AccessorId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "accessor#{}", self.0)
    }
}

/// Identity of a compute buffer, unique within its runtime context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferId(pub(crate) u64);

impl std::fmt::Display for BufferId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "buffer#{}", self.0)
    }
}

/// The type a kernel argument was bound with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActualArg {
    Value(ScalarKind),
    Buffer(ScalarKind),
    Local(ScalarKind),
}

impl std::fmt::Display for ActualArg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActualArg::Value(kind) => write!(f, "{kind}"),
            ActualArg::Buffer(kind) => write!(f, "buffer of {kind}"),
            ActualArg::Local(kind) => write!(f, "local {kind}*"),
        }
    }
}

#[derive(Debug, Error)]
pub enum SparkError {
    /// A native call failed.
    #[error(transparent)]
    Native(DriverError),

    /// Program compilation failed; `log` holds the full diagnostics.
    #[error("program build failed:\n{log}")]
    Build { log: String },

    /// A kernel argument did not match the declared slot type.
    #[error("kernel '{kernel}' argument {index}: expected {expected}, got {actual}")]
    TypeMismatch { kernel: String, index: u32, expected: ArgDescriptor, actual: ActualArg },

    /// An operation was invalid for the object's placement, sizes or flags.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// A host-side operation was attempted while the buffer is mapped.
    #[error("{buffer} is mapped by {accessor}")]
    BufferMapped { buffer: BufferId, accessor: AccessorId },

    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Malformed text input; `line` is 1-based.
    #[error("parse error on line {line}: {reason}")]
    Parse { line: usize, reason: String },

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl SparkError {
    pub(crate) fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration { reason: reason.into() }
    }

    /// Native status of a failed driver call, if this is one.
    pub fn native_status(&self) -> Option<sparkcl_driver::Status> {
        match self {
            Self::Native(e) => e.native_status(),
            _ => None,
        }
    }
}

impl From<DriverError> for SparkError {
    fn from(e: DriverError) -> Self {
        match e {
            DriverError::Build { log } => Self::Build { log },
            other => Self::Native(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, SparkError>;
