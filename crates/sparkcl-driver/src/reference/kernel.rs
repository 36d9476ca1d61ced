//! Host implementations of kernels for the reference device.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use thiserror::Error;

use crate::types::{Element, ScalarKind, ScalarValue};

/// Failure raised from inside a host kernel body.
#[derive(Debug, Error)]
pub enum KernelFault {
    #[error("argument {arg}: element {index} out of bounds for length {len}")]
    OutOfBounds { arg: u32, index: usize, len: usize },

    #[error("argument {arg}: expected {expected}")]
    ArgKind { arg: u32, expected: &'static str },

    #[error("argument {arg}: scalar is {actual}, read as {requested}")]
    ScalarMismatch { arg: u32, actual: ScalarKind, requested: ScalarKind },

    #[error("{0}")]
    Failed(String),
}

type KernelBody = dyn Fn(&mut KernelInvocation<'_>) -> Result<(), KernelFault> + Send + Sync;

/// A kernel body executed on the host when the reference device launches
/// the kernel of the same name.
///
/// The body runs once per launch and walks the work items itself, usually
/// through [`KernelInvocation::global_ids`]. Work items run sequentially.
#[derive(Clone)]
pub struct HostKernel {
    name: String,
    body: Arc<KernelBody>,
}

impl HostKernel {
    pub fn new<F>(name: impl Into<String>, body: F) -> Self
    where
        F: Fn(&mut KernelInvocation<'_>) -> Result<(), KernelFault> + Send + Sync + 'static,
    {
        Self { name: name.into(), body: Arc::new(body) }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn run(&self, invocation: &mut KernelInvocation<'_>) -> Result<(), KernelFault> {
        (self.body)(invocation)
    }
}

impl fmt::Debug for HostKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostKernel").field("name", &self.name).finish_non_exhaustive()
    }
}

pub(crate) enum InvocationArg {
    Scalar(ScalarValue),
    /// Buffer contents or local scratch, valid for the whole launch.
    Memory { ptr: *mut u8, len: usize },
}

/// View of one launch handed to a [`HostKernel`].
pub struct KernelInvocation<'a> {
    work_dim: usize,
    global: [usize; 3],
    local: [usize; 3],
    offset: [usize; 3],
    args: Vec<InvocationArg>,
    _memory: PhantomData<&'a mut [u8]>,
}

impl<'a> KernelInvocation<'a> {
    /// # Safety
    ///
    /// Every `Memory` pointer must be valid for reads and writes of `len`
    /// bytes for `'a`, and nothing else may access that memory meanwhile.
    pub(crate) unsafe fn new(
        global: &[usize],
        local: Option<&[usize]>,
        offset: Option<&[usize]>,
        args: Vec<InvocationArg>,
    ) -> Self {
        let expand = |dims: Option<&[usize]>, fill: usize| {
            let mut out = [fill; 3];
            if let Some(dims) = dims {
                out[..dims.len()].copy_from_slice(dims);
            }
            out
        };
        Self {
            work_dim: global.len(),
            // Unused dimensions contribute a single work item.
            global: expand(Some(global), 1),
            local: expand(local, 1),
            offset: expand(offset, 0),
            args,
            _memory: PhantomData,
        }
    }

    pub fn work_dim(&self) -> usize {
        self.work_dim
    }

    pub fn global_size(&self, dim: usize) -> usize {
        self.global.get(dim).copied().unwrap_or(1)
    }

    pub fn local_size(&self, dim: usize) -> usize {
        self.local.get(dim).copied().unwrap_or(1)
    }

    pub fn global_offset(&self, dim: usize) -> usize {
        self.offset.get(dim).copied().unwrap_or(0)
    }

    /// Every global id of the launch, offset applied, dimension 0 fastest.
    pub fn global_ids(&self) -> impl Iterator<Item = [usize; 3]> + 'static {
        let [gx, gy, gz] = self.global;
        let [ox, oy, oz] = self.offset;
        (0..gz).flat_map(move |z| {
            (0..gy).flat_map(move |y| (0..gx).map(move |x| [ox + x, oy + y, oz + z]))
        })
    }

    pub fn scalar<T: Element>(&self, arg: u32) -> Result<T, KernelFault> {
        match self.args.get(arg as usize) {
            Some(InvocationArg::Scalar(value)) => T::from_scalar(*value).ok_or(
                KernelFault::ScalarMismatch { arg, actual: value.kind(), requested: T::KIND },
            ),
            _ => Err(KernelFault::ArgKind { arg, expected: "a scalar value" }),
        }
    }

    fn memory(&self, arg: u32) -> Result<(*mut u8, usize), KernelFault> {
        match self.args.get(arg as usize) {
            Some(InvocationArg::Memory { ptr, len }) => Ok((*ptr, *len)),
            _ => Err(KernelFault::ArgKind { arg, expected: "a buffer or local memory" }),
        }
    }

    /// Number of whole `T` elements in a buffer or local argument.
    pub fn len<T: Element>(&self, arg: u32) -> Result<usize, KernelFault> {
        let (_, bytes) = self.memory(arg)?;
        Ok(bytes / std::mem::size_of::<T>())
    }

    pub fn load<T: Element>(&self, arg: u32, index: usize) -> Result<T, KernelFault> {
        let (ptr, _) = self.memory(arg)?;
        let len = self.len::<T>(arg)?;
        if index >= len {
            return Err(KernelFault::OutOfBounds { arg, index, len });
        }
        // SAFETY: index < len keeps the read inside the argument's memory,
        // which `new` guarantees is valid for the launch.
        Ok(unsafe { ptr.cast::<T>().add(index).read_unaligned() })
    }

    pub fn store<T: Element>(
        &mut self,
        arg: u32,
        index: usize,
        value: T,
    ) -> Result<(), KernelFault> {
        let (ptr, _) = self.memory(arg)?;
        let len = self.len::<T>(arg)?;
        if index >= len {
            return Err(KernelFault::OutOfBounds { arg, index, len });
        }
        // SAFETY: as in `load`; `&mut self` serializes writes.
        unsafe { ptr.cast::<T>().add(index).write_unaligned(value) };
        Ok(())
    }
}
