//! The runtime context: one device, one context, one in-order queue.
//!
//! A [`RuntimeContext`] is created once, either by selecting a platform and
//! device through a [`Backend`] or by wrapping an already-open [`Driver`],
//! and is then passed by reference to every buffer, program and kernel
//! constructor. Cloning is cheap and shares the same queue and registry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use sparkcl_driver::{Backend, DeviceInfo, Driver, DriverError, EventHandle, PlatformInfo};
use tracing::{debug, info, warn};

use crate::config::RuntimeConfig;
use crate::error::{Result, SparkError};
use crate::event::{CommandClass, Event};
use crate::profiling::{EventRegistry, ProfilingSummary};

/// Snapshot of the registry contents.
#[derive(Debug, Clone, Default)]
pub struct RecordedEvents {
    pub io: Vec<Event>,
    pub compute: Vec<Event>,
}

struct Inner {
    driver: Arc<dyn Driver>,
    platform: Option<PlatformInfo>,
    config: RuntimeConfig,
    registry: Mutex<EventRegistry>,
    next_id: AtomicU64,
}

/// Shared handle to the selected device and its command queue.
#[derive(Clone)]
pub struct RuntimeContext {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for RuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeContext")
            .field("platform", &self.inner.platform.as_ref().map(|p| p.name.as_str()))
            .field("device", &self.inner.driver.device_info().name)
            .field("profiling", &self.inner.config.profiling)
            .finish()
    }
}

impl RuntimeContext {
    // ── Construction ────────────────────────────────────────────

    /// Select a platform and device through `backend` and open them.
    pub fn init(backend: &dyn Backend, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let platforms = backend.platforms()?;
        let index = select_platform(&platforms, &config)?;
        let platform = platforms[index].clone();
        info!(platform = %platform.name, version = %platform.version, "platform selected");

        let driver = backend.open(index, config.device_type, config.device_index)?;
        info!(
            device = %driver.device_info().name,
            device_type = %driver.device_info().device_type,
            unified_memory = driver.device_info().host_unified_memory,
            "device opened"
        );
        Ok(Self::from_parts(driver, Some(platform), config))
    }

    /// Wrap a driver that is already open.
    pub fn with_driver(driver: Arc<dyn Driver>, config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        debug!(device = %driver.device_info().name, "runtime wraps existing driver");
        Ok(Self::from_parts(driver, None, config))
    }

    /// Configuration from `SPARKCL_*` variables on the default backend.
    ///
    /// The default backend is the installed OpenCL runtime when the `opencl`
    /// feature is enabled and the reference device otherwise.
    pub fn from_env() -> Result<Self> {
        let config = RuntimeConfig::from_env()?;
        Self::init(default_backend().as_ref(), config)
    }

    fn from_parts(
        driver: Arc<dyn Driver>,
        platform: Option<PlatformInfo>,
        config: RuntimeConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                driver,
                platform,
                config,
                registry: Mutex::new(EventRegistry::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ── Queue ───────────────────────────────────────────────────

    /// Block until every command on the queue has completed.
    pub fn finish(&self) -> Result<()> {
        self.inner.driver.finish()?;
        Ok(())
    }

    pub fn wait_queue(&self) -> Result<()> {
        self.finish()
    }

    // ── Queries ─────────────────────────────────────────────────

    pub fn device(&self) -> &DeviceInfo {
        self.inner.driver.device_info()
    }

    /// The selected platform; `None` for contexts built with
    /// [`with_driver`](Self::with_driver).
    pub fn platform(&self) -> Option<&PlatformInfo> {
        self.inner.platform.as_ref()
    }

    pub fn is_unified_memory(&self) -> bool {
        self.device().host_unified_memory
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.inner.config
    }

    pub fn profiling_enabled(&self) -> bool {
        self.inner.config.profiling
    }

    pub fn driver(&self) -> &Arc<dyn Driver> {
        &self.inner.driver
    }

    // ── Profiling ───────────────────────────────────────────────

    /// Sum elapsed time per class over every recorded event, then clear.
    pub fn measure_time(&self) -> Result<ProfilingSummary> {
        let summary = self.registry().measure()?;
        debug!(%summary, "profiling registry drained");
        Ok(summary)
    }

    /// Drop every recorded event without reporting.
    pub fn reset_time(&self) {
        self.registry().reset();
    }

    pub fn recorded_events(&self) -> RecordedEvents {
        let registry = self.registry();
        RecordedEvents {
            io: registry.io_events().to_vec(),
            compute: registry.compute_events().to_vec(),
        }
    }

    // ── Crate internals ─────────────────────────────────────────

    /// Wrap a freshly enqueued command and record it when profiling.
    pub(crate) fn track(&self, handle: EventHandle, class: CommandClass) -> Event {
        let event = Event::new(self.inner.driver.clone(), handle, class);
        if self.inner.config.profiling {
            self.registry().record(event.clone());
        }
        event
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn registry(&self) -> MutexGuard<'_, EventRegistry> {
        self.inner.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Pick the platform index to open.
///
/// An explicit `platform_index` wins. Otherwise the first platform whose name
/// is not in `avoid_platforms` is taken; if every platform is avoided the
/// first one is used anyway.
pub fn select_platform(platforms: &[PlatformInfo], config: &RuntimeConfig) -> Result<usize> {
    if platforms.is_empty() {
        return Err(SparkError::Native(DriverError::NoPlatform));
    }
    if let Some(index) = config.platform_index {
        if index >= platforms.len() {
            return Err(SparkError::configuration(format!(
                "platform index {index} out of range ({} platform(s) available)",
                platforms.len()
            )));
        }
        return Ok(index);
    }
    let avoided = |p: &PlatformInfo| {
        config.avoid_platforms.iter().any(|a| a.trim().eq_ignore_ascii_case(p.name.trim()))
    };
    for (index, platform) in platforms.iter().enumerate() {
        if !avoided(platform) {
            return Ok(index);
        }
        warn!(platform = %platform.name, "skipping avoided platform");
    }
    warn!(platform = %platforms[0].name, "every platform is avoided; using the first");
    Ok(0)
}

#[cfg(feature = "opencl")]
fn default_backend() -> Box<dyn Backend> {
    Box::new(sparkcl_driver::OpenClBackend::new())
}

#[cfg(not(feature = "opencl"))]
fn default_backend() -> Box<dyn Backend> {
    Box::new(sparkcl_driver::ReferenceBackend::new())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkcl_driver::{DeviceType, ReferenceBackend, ReferenceDriver};

    fn platforms(names: &[&str]) -> Vec<PlatformInfo> {
        names
            .iter()
            .enumerate()
            .map(|(index, name)| PlatformInfo {
                index,
                name: (*name).to_string(),
                vendor: String::new(),
                version: String::new(),
            })
            .collect()
    }

    #[test]
    fn avoided_platform_is_skipped_when_alternative_exists() {
        let cfg = RuntimeConfig::default();
        assert_eq!(select_platform(&platforms(&["Clover", "rusticl"]), &cfg).unwrap(), 1);
        assert_eq!(select_platform(&platforms(&["rusticl", "Clover"]), &cfg).unwrap(), 0);
    }

    #[test]
    fn lone_avoided_platform_is_used() {
        let cfg = RuntimeConfig::default();
        assert_eq!(select_platform(&platforms(&["Clover"]), &cfg).unwrap(), 0);
    }

    #[test]
    fn explicit_index_wins_and_is_checked() {
        let cfg = RuntimeConfig::default().with_platform(0);
        assert_eq!(select_platform(&platforms(&["Clover", "x"]), &cfg).unwrap(), 0);
        let cfg = RuntimeConfig::default().with_platform(5);
        assert!(matches!(
            select_platform(&platforms(&["a"]), &cfg),
            Err(SparkError::Configuration { .. })
        ));
    }

    #[test]
    fn empty_platform_list_is_no_platform() {
        let err = select_platform(&[], &RuntimeConfig::default()).unwrap_err();
        assert!(matches!(err, SparkError::Native(DriverError::NoPlatform)));
    }

    #[test]
    fn init_opens_selected_platform() {
        let backend = ReferenceBackend::with_platforms(["Clover", "Reference"]);
        let rt = RuntimeContext::init(&backend, RuntimeConfig::default()).unwrap();
        assert_eq!(rt.platform().unwrap().name, "Reference");
        assert_eq!(backend.last_opened().unwrap().0, 1);
    }

    #[test]
    fn init_reports_missing_device_type() {
        let backend = ReferenceBackend::new();
        let cfg = RuntimeConfig::default().with_device_type(DeviceType::Accelerator);
        let err = RuntimeContext::init(&backend, cfg).unwrap_err();
        assert!(matches!(err, SparkError::Native(DriverError::NoDevice { .. })), "{err}");
    }

    #[test]
    fn ids_are_unique_per_context() {
        let driver: Arc<dyn Driver> = Arc::new(ReferenceDriver::builder().build());
        let rt = RuntimeContext::with_driver(driver, RuntimeConfig::default()).unwrap();
        let a = rt.next_id();
        let b = rt.clone().next_id();
        assert_ne!(a, b);
        assert!(rt.platform().is_none());
    }
}
