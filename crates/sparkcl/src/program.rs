//! Compiled programs.

use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use sparkcl_driver::{DriverError, ProgramHandle};
use tracing::{error, info, warn};

use crate::error::{Result, SparkError};
use crate::kernel::Kernel;
use crate::ndrange::NDRange;
use crate::runtime::RuntimeContext;

struct ProgramInner {
    rt: RuntimeContext,
    handle: ProgramHandle,
}

impl Drop for ProgramInner {
    fn drop(&mut self) {
        if let Err(e) = self.rt.driver().release_program(self.handle) {
            warn!(program = ?self.handle, error = %e, "failed to release program");
        }
    }
}

/// A program built for the runtime's device.
///
/// Clones and the kernels created from it share the native program, which
/// is released when the last of them is dropped.
#[derive(Clone)]
pub struct Program {
    inner: Arc<ProgramInner>,
}

impl Program {
    /// Read and build an OpenCL C source file.
    pub fn from_file(rt: &RuntimeContext, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = fs::read_to_string(path)
            .map_err(|source| SparkError::Io { path: path.to_path_buf(), source })?;
        info!(path = %path.display(), "building program from file");
        Self::from_source(rt, &source)
    }

    /// Build `source` with the configured build options.
    pub fn from_source(rt: &RuntimeContext, source: &str) -> Result<Self> {
        let options = &rt.config().build_options;
        let handle = match rt.driver().build_program(source, options) {
            Ok(handle) => handle,
            Err(DriverError::Build { log }) => {
                error!(%log, "program build failed");
                return Err(SparkError::Build { log });
            }
            Err(e) => return Err(e.into()),
        };
        info!(program = ?handle, options = %options, "program built");
        Ok(Self { inner: Arc::new(ProgramInner { rt: rt.clone(), handle }) })
    }

    /// Create kernel `name` with its launch extents.
    ///
    /// Pass [`NDRange::none`] as `local` to let the driver choose.
    pub fn kernel(&self, name: &str, global: NDRange, local: NDRange) -> Result<Kernel> {
        Kernel::new(self.clone(), name, global, local)
    }

    pub fn handle(&self) -> ProgramHandle {
        self.inner.handle
    }

    pub fn runtime(&self) -> &RuntimeContext {
        &self.inner.rt
    }
}

impl fmt::Debug for Program {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("handle", &self.inner.handle).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RuntimeConfig;
    use sparkcl_driver::{HostKernel, ReferenceDriver};

    const SOURCE: &str = "__kernel void noop(__global float* x) { }";

    fn runtime() -> (Arc<ReferenceDriver>, RuntimeContext) {
        let driver = Arc::new(
            ReferenceDriver::builder().kernel(HostKernel::new("noop", |_| Ok(()))).build(),
        );
        let rt = RuntimeContext::with_driver(driver.clone(), RuntimeConfig::default()).unwrap();
        (driver, rt)
    }

    #[test]
    fn build_failure_carries_log() {
        let (_, rt) = runtime();
        let err = Program::from_source(&rt, "__kernel void missing(int a) {}").unwrap_err();
        match err {
            SparkError::Build { log } => assert!(log.contains("missing"), "{log}"),
            other => panic!("expected build failure, got {other}"),
        }
    }

    #[test]
    fn program_lives_until_last_kernel_drops() {
        let (driver, rt) = runtime();
        let program = Program::from_source(&rt, SOURCE).unwrap();
        let kernel = program.kernel("noop", NDRange::d1(4), NDRange::none()).unwrap();
        drop(program);
        assert_eq!(driver.stats().live_programs, 1);
        drop(kernel);
        let stats = driver.stats();
        assert_eq!(stats.live_programs, 0);
        assert_eq!(stats.live_kernels, 0);
        assert_eq!(stats.invalid_releases, 0);
    }

    #[test]
    fn missing_file_reports_path() {
        let (_, rt) = runtime();
        let err = Program::from_file(&rt, "/nonexistent/kernels.cl").unwrap_err();
        assert!(matches!(err, SparkError::Io { .. }));
        assert!(err.to_string().contains("/nonexistent/kernels.cl"), "{err}");
    }

    #[test]
    fn unknown_kernel_name_is_native_error() {
        let (_, rt) = runtime();
        let program = Program::from_source(&rt, SOURCE).unwrap();
        let err = program.kernel("nope", NDRange::d1(1), NDRange::none()).unwrap_err();
        assert_eq!(err.native_status(), Some(sparkcl_driver::Status::INVALID_KERNEL_NAME));
    }
}
