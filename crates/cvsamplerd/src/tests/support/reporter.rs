//! Test double for [`HealthReporter`] that records structured events for assertions.

use std::sync::Mutex;

use cvsampler_config::Config;

use crate::favored::FilterFileError;
use crate::health::HealthReporter;
use crate::process::LaunchError;
use crate::supervisor::{CycleId, FailureKind};

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthEvent {
    BootstrapStarting,
    BootstrapSucceeded,
    BootstrapFailed(String),
    WhitelistLoaded(usize),
    WhitelistReloaded(usize),
    WhitelistReloadFailed,
    CycleLaunched(String),
    WorkerFinished(String),
    WorkerFailed(String),
    SchedulingHalted,
    ImmediateSampleRefused,
    Stopping,
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    /// Number of recorded events equal to `event`.
    #[must_use]
    pub fn count(&self, event: &HealthEvent) -> usize {
        self.events().iter().filter(|seen| *seen == event).count()
    }

    /// Number of cycles launched so far.
    #[must_use]
    pub fn launches(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, HealthEvent::CycleLaunched(_)))
            .count()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &LaunchError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn whitelist_loaded(&self, entries: usize) {
        self.record(HealthEvent::WhitelistLoaded(entries));
    }

    fn whitelist_reloaded(&self, entries: usize) {
        self.record(HealthEvent::WhitelistReloaded(entries));
    }

    fn whitelist_reload_failed(&self, _error: &FilterFileError) {
        self.record(HealthEvent::WhitelistReloadFailed);
    }

    fn cycle_launched(&self, cycle: CycleId) {
        self.record(HealthEvent::CycleLaunched(cycle.to_string()));
    }

    fn worker_finished(&self, cycle: CycleId) {
        self.record(HealthEvent::WorkerFinished(cycle.to_string()));
    }

    fn worker_failed(&self, cycle: Option<CycleId>, failure: FailureKind) {
        let cycle = cycle.map_or_else(|| "unknown".to_owned(), |id| id.to_string());
        self.record(HealthEvent::WorkerFailed(format!("{cycle}: {failure}")));
    }

    fn scheduling_halted(&self) {
        self.record(HealthEvent::SchedulingHalted);
    }

    fn immediate_sample_refused(&self) {
        self.record(HealthEvent::ImmediateSampleRefused);
    }

    fn stopping(&self) {
        self.record(HealthEvent::Stopping);
    }
}
