//! Kernel argument descriptors and the closed set of bindable values.
//!
//! A kernel slot is described once, from the compiled signature, as an
//! [`ArgDescriptor`]: one of six scalar kinds passed either by value or as a
//! pointer. Values handed to [`Kernel::set_arg`](crate::Kernel::set_arg)
//! implement the sealed [`KernelArg`] trait, so the set of bindable types is
//! fixed and checked before anything reaches the native argument table.

use std::fmt;
use std::marker::PhantomData;

use sparkcl_driver::{AddressQualifier, Element, NativeArg, ScalarKind};

use crate::buffer::{ComputeBuffer, MapWatch};
use crate::error::{ActualArg, Result, SparkError};

/// How a kernel parameter receives its data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArgAccess {
    Value,
    Pointer,
}

/// Declared type of one kernel parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArgDescriptor {
    pub kind: ScalarKind,
    pub access: ArgAccess,
}

impl ArgDescriptor {
    /// Parse a native type name such as `float*`, `uint` or `unsigned char*`.
    pub fn parse(type_name: &str) -> Result<Self> {
        let trimmed = type_name.trim();
        let (base, access) = match trimmed.strip_suffix('*') {
            Some(base) => (base.trim_end(), ArgAccess::Pointer),
            None => (trimmed, ArgAccess::Value),
        };
        ScalarKind::from_c_name(base).map(|kind| Self { kind, access }).ok_or_else(|| {
            SparkError::configuration(format!("unsupported kernel argument type '{type_name}'"))
        })
    }

    /// Whether an argument of shape `actual` has this kind and access.
    ///
    /// Local memory is reserved in bytes, so a [`LocalSize`] of any element
    /// kind fits a pointer slot.
    pub fn accepts(&self, actual: ActualArg) -> bool {
        match actual {
            ActualArg::Value(kind) => self.access == ArgAccess::Value && self.kind == kind,
            ActualArg::Buffer(kind) => self.access == ArgAccess::Pointer && self.kind == kind,
            ActualArg::Local(_) => self.access == ArgAccess::Pointer,
        }
    }
}

impl fmt::Display for ArgDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.access {
            ArgAccess::Value => write!(f, "{}", self.kind.c_name()),
            ArgAccess::Pointer => write!(f, "{}*", self.kind.c_name()),
        }
    }
}

/// Cached description of one kernel slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArgInfo {
    /// Type name as reported by the driver.
    pub type_name: String,
    pub address: AddressQualifier,
    pub descriptor: ArgDescriptor,
}

impl ArgInfo {
    /// Reject arguments whose address space cannot serve this slot.
    pub(crate) fn check_address(&self, kernel: &str, index: u32, actual: ActualArg) -> Result<()> {
        let local_slot = self.address == AddressQualifier::Local;
        match actual {
            ActualArg::Buffer(_) if local_slot => Err(SparkError::configuration(format!(
                "kernel '{kernel}' argument {index} is __local; bind it with LocalSize"
            ))),
            ActualArg::Local(_) if !local_slot => Err(SparkError::configuration(format!(
                "kernel '{kernel}' argument {index} is {}; local memory cannot be bound to it",
                self.address
            ))),
            _ => Ok(()),
        }
    }
}

mod sealed {
    pub trait Sealed {}
}

/// A value that can be bound to a kernel slot.
///
/// Implemented for the six scalar element types, for `&ComputeBuffer<T>`
/// and for [`LocalSize<T>`].
pub trait KernelArg: sealed::Sealed {
    #[doc(hidden)]
    fn actual(&self) -> ActualArg;

    #[doc(hidden)]
    fn native(&self) -> Result<NativeArg>;

    #[doc(hidden)]
    fn map_watch(&self) -> Option<MapWatch> {
        None
    }
}

macro_rules! impl_scalar_arg {
    ($($ty:ty),* $(,)?) => {
        $(
            impl sealed::Sealed for $ty {}

            impl KernelArg for $ty {
                fn actual(&self) -> ActualArg {
                    ActualArg::Value(<$ty as Element>::KIND)
                }

                fn native(&self) -> Result<NativeArg> {
                    Ok(NativeArg::Scalar(self.into_scalar()))
                }
            }
        )*
    };
}

impl_scalar_arg!(f32, f64, i32, u32, u8, i64);

impl<T: Element> sealed::Sealed for &ComputeBuffer<T> {}

impl<T: Element> KernelArg for &ComputeBuffer<T> {
    fn actual(&self) -> ActualArg {
        ActualArg::Buffer(T::KIND)
    }

    fn native(&self) -> Result<NativeArg> {
        self.ensure_unmapped()?;
        let mem = self.device_handle().ok_or_else(|| {
            SparkError::configuration(format!(
                "{} has no device-side memory and cannot be a kernel argument",
                self.id()
            ))
        })?;
        Ok(NativeArg::Mem(mem))
    }

    fn map_watch(&self) -> Option<MapWatch> {
        Some(ComputeBuffer::map_watch(self))
    }
}

/// Work-group local scratch of `len` elements of `T`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalSize<T> {
    len: usize,
    _element: PhantomData<fn() -> T>,
}

impl<T: Element> LocalSize<T> {
    pub fn new(len: usize) -> Self {
        Self { len, _element: PhantomData }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn size_bytes(&self) -> usize {
        self.len * T::KIND.size_bytes()
    }
}

impl<T: Element> sealed::Sealed for LocalSize<T> {}

impl<T: Element> KernelArg for LocalSize<T> {
    fn actual(&self) -> ActualArg {
        ActualArg::Local(T::KIND)
    }

    fn native(&self) -> Result<NativeArg> {
        if self.is_empty() {
            return Err(SparkError::configuration("local memory size must be non-zero"));
        }
        Ok(NativeArg::Local { size_bytes: self.size_bytes() })
    }
}
