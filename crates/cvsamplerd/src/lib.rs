//! Telemetry sampling daemon for cluster hardware counters.
//!
//! `cvsamplerd` wakes on a jittered schedule, runs a vendor command that
//! prints a JSON snapshot of the counters, flattens the snapshot into
//! `(index, device, value)` rows, keeps only the rows whose index appears in
//! an operator-maintained whitelist, and appends them to a SQLite fact table
//! in a single transaction per cycle.
//!
//! The daemon is a small supervisor. It owns the schedule, the whitelist,
//! and the control state. Each cycle runs in a forked worker so a hung or
//! crashing collection never takes the supervisor down. A failed cycle halts
//! scheduling until the operator restarts the daemon, which keeps a broken
//! store from accumulating partial history.
//!
//! Operators steer the running daemon with signals:
//!
//! - `SIGHUP` re-reads the whitelist;
//! - `SIGUSR1` requests an immediate, uncounted sample;
//! - `SIGINT`, `SIGQUIT` and `SIGTERM` stop the daemon.
//!
//! A flock on the runtime lock file keeps a second instance from starting.
//! The companion `cvsampler-dict` binary rebuilds the data dictionary table
//! from the vendor's metric definitions.

pub mod bootstrap;
pub mod dictionary;
pub mod dither;
pub mod favored;
mod health;
pub mod pipeline;
mod process;
pub mod store;
pub mod supervisor;
mod telemetry;

pub use bootstrap::{
    ConfigLoader, SourceProvider, StaticConfigLoader, SystemConfigLoader, SystemSourceProvider,
    bootstrap_with,
};
pub use health::{HealthReporter, HealthState, StatusSink, StructuredHealthReporter};
pub use process::{DaemonizeError, LaunchError, LaunchMode, exit, run_daemon};
pub use supervisor::SupervisorExit;
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};

#[cfg(test)]
mod tests;
