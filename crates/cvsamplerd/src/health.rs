//! Structured health reporting for daemon lifecycle and sampling events.

use std::sync::Arc;

use cvsampler_config::Config;

use crate::favored::FilterFileError;
use crate::process::LaunchError;
use crate::supervisor::{CycleId, FailureKind};

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked once configuration is loaded and validated.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when launch fails before sampling starts.
    fn bootstrap_failed(&self, error: &LaunchError);

    /// Invoked after the whitelist is first loaded.
    fn whitelist_loaded(&self, entries: usize);

    /// Invoked after a reload request swapped in a new whitelist.
    fn whitelist_reloaded(&self, entries: usize);

    /// Invoked when a reload request failed; the previous whitelist stays.
    fn whitelist_reload_failed(&self, error: &FilterFileError);

    /// Invoked when a worker is started for a cycle.
    fn cycle_launched(&self, cycle: CycleId);

    /// Invoked when a worker is reaped after a successful cycle.
    fn worker_finished(&self, cycle: CycleId);

    /// Invoked when a worker reports or exits with a failure.
    fn worker_failed(&self, cycle: Option<CycleId>, failure: FailureKind);

    /// Invoked once when scheduling stops after a failure.
    fn scheduling_halted(&self);

    /// Invoked when an immediate sample is refused.
    fn immediate_sample_refused(&self);

    /// Invoked when a stop request is being honoured.
    fn stopping(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &LaunchError) {
        (**self).bootstrap_failed(error);
    }

    fn whitelist_loaded(&self, entries: usize) {
        (**self).whitelist_loaded(entries);
    }

    fn whitelist_reloaded(&self, entries: usize) {
        (**self).whitelist_reloaded(entries);
    }

    fn whitelist_reload_failed(&self, error: &FilterFileError) {
        (**self).whitelist_reload_failed(error);
    }

    fn cycle_launched(&self, cycle: CycleId) {
        (**self).cycle_launched(cycle);
    }

    fn worker_finished(&self, cycle: CycleId) {
        (**self).worker_finished(cycle);
    }

    fn worker_failed(&self, cycle: Option<CycleId>, failure: FailureKind) {
        (**self).worker_failed(cycle, failure);
    }

    fn scheduling_halted(&self) {
        (**self).scheduling_halted();
    }

    fn immediate_sample_refused(&self) {
        (**self).immediate_sample_refused();
    }

    fn stopping(&self) {
        (**self).stopping();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting sampler bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            database = %config.database(),
            filter_file = %config.filter_file(),
            period_secs = config.period_secs(),
            iterations = ?config.iterations(),
            log_filter = %config.log_filter(),
            log_format = ?config.log_format(),
            "sampler bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &LaunchError) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "sampler bootstrap failed"
        );
    }

    fn whitelist_loaded(&self, entries: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "whitelist_loaded",
            entries,
            "whitelist loaded"
        );
    }

    fn whitelist_reloaded(&self, entries: usize) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "whitelist_reloaded",
            entries,
            "whitelist reloaded"
        );
    }

    fn whitelist_reload_failed(&self, error: &FilterFileError) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "whitelist_reload_failed",
            error = %error,
            "whitelist reload failed; keeping previous whitelist"
        );
    }

    fn cycle_launched(&self, cycle: CycleId) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "cycle_launched",
            cycle = %cycle,
            "worker launched"
        );
    }

    fn worker_finished(&self, cycle: CycleId) {
        tracing::debug!(
            target: HEALTH_TARGET,
            event = "worker_finished",
            cycle = %cycle,
            "worker finished"
        );
    }

    fn worker_failed(&self, cycle: Option<CycleId>, failure: FailureKind) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "worker_failed",
            cycle = ?cycle.map(|id| id.to_string()),
            failure = %failure,
            "worker failed"
        );
    }

    fn scheduling_halted(&self) {
        tracing::error!(
            target: HEALTH_TARGET,
            event = "scheduling_halted",
            "no further cycles will be scheduled until restart"
        );
    }

    fn immediate_sample_refused(&self) {
        tracing::warn!(
            target: HEALTH_TARGET,
            event = "immediate_sample_refused",
            "immediate sample refused while scheduling is halted"
        );
    }

    fn stopping(&self) {
        tracing::info!(
            target: HEALTH_TARGET,
            event = "stopping",
            "stop requested; closing store"
        );
    }
}

/// Coarse daemon state published in the health snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// Launch in progress.
    Starting,
    /// Cycles are being scheduled.
    Sampling,
    /// A cycle failed; no further cycles will be scheduled.
    Halted,
    /// Shutting down.
    Stopping,
}

impl HealthState {
    /// Snapshot label for the state.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Sampling => "sampling",
            Self::Halted => "halted",
            Self::Stopping => "stopping",
        }
    }
}

/// Destination for supervisor state changes.
pub trait StatusSink {
    /// Records `state` after `cycles` scheduled cycles.
    fn publish(&mut self, state: HealthState, cycles: u64);
}
