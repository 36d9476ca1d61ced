//! Event registries and elapsed-time aggregation.
//!
//! When profiling is enabled on the runtime, every successfully enqueued
//! command is recorded under its [`CommandClass`]. [`EventRegistry::measure`]
//! drains both classes into a [`ProfilingSummary`].

use std::fmt;
use std::time::Duration;

use crate::error::Result;
use crate::event::{CommandClass, Event};

/// Totals for one drain of the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProfilingSummary {
    /// Summed execution time of I/O commands (ns).
    pub io_ns: u64,
    /// Summed execution time of compute commands (ns).
    pub compute_ns: u64,
    pub io_events: usize,
    pub compute_events: usize,
}

impl ProfilingSummary {
    pub fn total_ns(&self) -> u64 {
        self.io_ns.saturating_add(self.compute_ns)
    }

    pub fn io(&self) -> Duration {
        Duration::from_nanos(self.io_ns)
    }

    pub fn compute(&self) -> Duration {
        Duration::from_nanos(self.compute_ns)
    }
}

impl fmt::Display for ProfilingSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "io={:.3}ms ({} events)  compute={:.3}ms ({} events)  total={:.3}ms",
            self.io_ns as f64 / 1e6,
            self.io_events,
            self.compute_ns as f64 / 1e6,
            self.compute_events,
            self.total_ns() as f64 / 1e6,
        )
    }
}

/// Recorded events split by class.
#[derive(Debug, Default)]
pub struct EventRegistry {
    io: Vec<Event>,
    compute: Vec<Event>,
}

impl EventRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: Event) {
        match event.command() {
            CommandClass::Io => self.io.push(event),
            CommandClass::Compute => self.compute.push(event),
        }
    }

    pub fn io_events(&self) -> &[Event] {
        &self.io
    }

    pub fn compute_events(&self) -> &[Event] {
        &self.compute
    }

    pub fn len(&self) -> usize {
        self.io.len() + self.compute.len()
    }

    pub fn is_empty(&self) -> bool {
        self.io.is_empty() && self.compute.is_empty()
    }

    /// Wait for every recorded event, sum elapsed time per class, then clear.
    ///
    /// On error the registry is left untouched.
    pub fn measure(&mut self) -> Result<ProfilingSummary> {
        let io_ns = Self::sum_elapsed(&self.io)?;
        let compute_ns = Self::sum_elapsed(&self.compute)?;
        let summary = ProfilingSummary {
            io_ns,
            compute_ns,
            io_events: self.io.len(),
            compute_events: self.compute.len(),
        };
        self.reset();
        Ok(summary)
    }

    pub fn reset(&mut self) {
        self.io.clear();
        self.compute.clear();
    }

    fn sum_elapsed(events: &[Event]) -> Result<u64> {
        if events.is_empty() {
            return Ok(0);
        }
        let refs: Vec<&Event> = events.iter().collect();
        Event::wait_all(&refs)?;
        events.iter().try_fold(0u64, |acc, e| Ok(acc.saturating_add(e.elapsed()?)))
    }
}
