//! Completion events for commands submitted to the runtime's queue.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sparkcl_driver::{Driver, EventHandle, ProfilingInfo};
use tracing::warn;

use crate::error::{Result, SparkError};

/// Registry class an event is recorded under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandClass {
    /// Map, unmap and bulk reads or writes.
    Io,
    /// Kernel launches and buffer-to-buffer copies.
    Compute,
}

impl fmt::Display for CommandClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CommandClass::Io => f.write_str("io"),
            CommandClass::Compute => f.write_str("compute"),
        }
    }
}

/// The four profiling counters of one command, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventTimings {
    pub queued: u64,
    pub submitted: u64,
    pub started: u64,
    pub ended: u64,
}

impl EventTimings {
    /// Execution time; zero if the counters are out of order.
    pub fn elapsed(&self) -> u64 {
        self.ended.saturating_sub(self.started)
    }

    /// Queue-to-completion time.
    pub fn total(&self) -> u64 {
        self.ended.saturating_sub(self.queued)
    }
}

impl fmt::Display for EventTimings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "queue={:.3}ms submit={:.3}ms exec={:.3}ms",
            self.submitted.saturating_sub(self.queued) as f64 / 1e6,
            self.started.saturating_sub(self.submitted) as f64 / 1e6,
            self.elapsed() as f64 / 1e6,
        )
    }
}

struct EventInner {
    driver: Arc<dyn Driver>,
    handle: EventHandle,
    command: CommandClass,
    released: bool,
}

impl Drop for EventInner {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.driver.release_event(self.handle) {
            warn!(event = ?self.handle, error = %e, "failed to release event");
        }
    }
}

/// Handle to one submitted command.
///
/// Clones share the native event, which is released once when the last
/// clone goes away.
#[derive(Clone)]
pub struct Event {
    inner: Arc<EventInner>,
}

impl Event {
    pub(crate) fn new(driver: Arc<dyn Driver>, handle: EventHandle, command: CommandClass) -> Self {
        Self { inner: Arc::new(EventInner { driver, handle, command, released: false }) }
    }

    pub fn handle(&self) -> EventHandle {
        self.inner.handle
    }

    pub fn command(&self) -> CommandClass {
        self.inner.command
    }

    /// Block until the command has completed.
    pub fn wait(&self) -> Result<()> {
        self.inner.driver.wait_for_events(&[self.inner.handle])?;
        Ok(())
    }

    /// Block until every event in `events` has completed.
    pub fn wait_all(events: &[&Event]) -> Result<()> {
        let Some(first) = events.first() else {
            return Ok(());
        };
        let handles: Vec<EventHandle> = events.iter().map(|e| e.handle()).collect();
        first.inner.driver.wait_for_events(&handles)?;
        Ok(())
    }

    pub fn profiling(&self, info: ProfilingInfo) -> Result<u64> {
        Ok(self.inner.driver.event_profiling_info(self.inner.handle, info)?)
    }

    pub fn queued(&self) -> Result<u64> {
        self.profiling(ProfilingInfo::Queued)
    }

    pub fn submitted(&self) -> Result<u64> {
        self.profiling(ProfilingInfo::Submitted)
    }

    pub fn started(&self) -> Result<u64> {
        self.profiling(ProfilingInfo::Started)
    }

    pub fn ended(&self) -> Result<u64> {
        self.profiling(ProfilingInfo::Ended)
    }

    pub fn timings(&self) -> Result<EventTimings> {
        Ok(EventTimings {
            queued: self.queued()?,
            submitted: self.submitted()?,
            started: self.started()?,
            ended: self.ended()?,
        })
    }

    /// `end - start` in device clock units, never negative.
    pub fn elapsed(&self) -> Result<u64> {
        Ok(self.ended()?.saturating_sub(self.started()?))
    }

    pub fn elapsed_duration(&self) -> Result<Duration> {
        self.elapsed().map(Duration::from_nanos)
    }

    /// Granularity of the device's profiling counters.
    pub fn resolution(&self) -> Duration {
        Duration::from_nanos(self.inner.driver.device_info().profiling_timer_resolution_ns)
    }

    /// Release this reference now, reporting a native failure instead of
    /// logging it. Other clones keep the event alive.
    pub fn release(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.released = true;
                inner.driver.release_event(inner.handle).map_err(SparkError::from)
            }
            Err(_shared) => Ok(()),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("handle", &self.inner.handle)
            .field("command", &self.inner.command)
            .finish()
    }
}

/// Native handles of a wait list.
pub(crate) fn handles(wait: &[&Event]) -> Vec<EventHandle> {
    wait.iter().map(|e| e.handle()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use sparkcl_driver::{MemFlags, ReferenceDriver};

    fn write_event(driver: &Arc<ReferenceDriver>) -> Event {
        let mem = driver.create_buffer(MemFlags::READ_WRITE, 16, None).unwrap();
        let handle = unsafe { driver.enqueue_write_buffer(mem, true, 0, &[1u8; 16], &[]).unwrap() };
        let dyn_driver: Arc<dyn Driver> = driver.clone();
        Event::new(dyn_driver, handle, CommandClass::Io)
    }

    #[test]
    fn timestamps_are_ordered() {
        let driver = Arc::new(ReferenceDriver::builder().build());
        let event = write_event(&driver);
        event.wait().unwrap();
        let t = event.timings().unwrap();
        assert!(t.queued <= t.submitted && t.submitted <= t.started && t.started <= t.ended);
        assert_eq!(event.elapsed().unwrap(), t.elapsed());
        assert_eq!(event.command(), CommandClass::Io);
    }

    #[test]
    fn last_clone_releases_once() {
        let driver = Arc::new(ReferenceDriver::builder().build());
        let event = write_event(&driver);
        let clone = event.clone();
        assert_eq!(driver.stats().live_events, 1);
        drop(event);
        assert_eq!(driver.stats().live_events, 1);
        drop(clone);
        assert_eq!(driver.stats().live_events, 0);
        assert_eq!(driver.stats().invalid_releases, 0);
    }

    #[test]
    fn explicit_release_does_not_double_free() {
        let driver = Arc::new(ReferenceDriver::builder().build());
        let event = write_event(&driver);
        let clone = event.clone();
        clone.release().unwrap();
        assert_eq!(driver.stats().live_events, 1);
        event.release().unwrap();
        assert_eq!(driver.stats().live_events, 0);
        assert_eq!(driver.stats().invalid_releases, 0);
    }

    #[test]
    fn wait_all_on_empty_list_is_ok() {
        assert!(Event::wait_all(&[]).is_ok());
    }

    #[test]
    fn saturating_elapsed() {
        let t = EventTimings { queued: 5, submitted: 5, started: 9, ended: 7 };
        assert_eq!(t.elapsed(), 0);
        assert_eq!(t.total(), 2);
    }
}
