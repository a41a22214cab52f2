//! Daemon process lifecycle: launch sequencing, the singleton lock, pid and
//! health files, and daemonisation.

pub(crate) mod daemonizer;
mod errors;
pub mod exit;
mod files;
mod guard;
pub(crate) mod launch;

pub use daemonizer::DaemonizeError;
pub use errors::LaunchError;
pub use launch::{LaunchMode, run_daemon};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");
