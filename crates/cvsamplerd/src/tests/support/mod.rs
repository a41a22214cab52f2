//! Test harness utilities shared by the behavioural suites.

use std::sync::{Mutex, MutexGuard, PoisonError};

mod config_loader;
mod process_world;
mod reporter;
mod sources;

pub use config_loader::TestConfigLoader;
pub use process_world::{ProcessTestWorld, StepResult, world};
pub use reporter::{HealthEvent, RecordingHealthReporter};
pub use sources::ScriptedSourceProvider;

static SIGNAL_TESTS: Mutex<()> = Mutex::new(());

/// Serialises tests that raise process-wide signals.
pub(crate) fn serial_signals() -> MutexGuard<'static, ()> {
    SIGNAL_TESTS.lock().unwrap_or_else(PoisonError::into_inner)
}
