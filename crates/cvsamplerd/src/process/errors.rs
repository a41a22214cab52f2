//! Defines the unified error surface for daemon launch and supervision.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTimeError;

use nix::errno::Errno;
use thiserror::Error;

use ortho_config::OrthoError;

use cvsampler_config::{ConfigValidationError, RuntimePathsError};

use crate::dither::DitherError;
use crate::favored::FilterFileError;
use crate::pipeline::CollectionError;
use crate::store::PersistenceError;
use crate::supervisor::ControlError;
use crate::telemetry::TelemetryError;

use super::daemonizer::DaemonizeError;
use super::exit;

/// Errors surfaced while launching or supervising the daemon process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Config {
        /// Underlying loader error.
        #[source]
        source: Arc<OrthoError>,
    },
    /// Configuration loaded but holds unusable values.
    #[error("invalid configuration: {source}")]
    Validation {
        /// Underlying validation error.
        #[source]
        source: ConfigValidationError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// A configured path could not be made absolute.
    #[error("failed to resolve path '{path}': {source}")]
    ResolvePath {
        /// Path as configured.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The runtime directory could not be prepared.
    #[error("failed to prepare runtime directory: {source}")]
    RuntimeDirectory {
        /// Underlying path error.
        #[source]
        source: RuntimePathsError,
    },
    /// Lock file creation failed.
    #[error("failed to open lock file '{path}': {source}")]
    LockCreate {
        /// Lock file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Taking the lock failed for a reason other than contention.
    #[error("failed to lock '{path}': {source}")]
    Lock {
        /// Lock file path.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: Errno,
    },
    /// A running daemon already holds the lock.
    #[error("daemon already running (lock: '{}', pid: {})", lock.display(), describe_pid(*pid))]
    AlreadyRunning {
        /// Lock file held by the running daemon.
        lock: PathBuf,
        /// PID recorded in the lock file, when readable.
        pid: Option<u32>,
    },
    /// Writing the PID file failed.
    #[error("failed to write pid file '{path}': {source}")]
    PidWrite {
        /// PID file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Serialising or writing the health snapshot failed.
    #[error("failed to write health snapshot '{path}': {source}")]
    HealthWrite {
        /// Health file path.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// Serialising the health snapshot failed.
    #[error("failed to serialise health snapshot: {source}")]
    HealthSerialise {
        /// Underlying serialisation error.
        #[from]
        source: serde_json::Error,
    },
    /// Obtaining the current timestamp failed.
    #[error("failed to read system time: {source}")]
    Clock {
        /// Underlying system time error.
        #[source]
        source: SystemTimeError,
    },
    /// Health updates were attempted before writing the PID file.
    #[error("pid must be written before updating health state")]
    MissingPid,
    /// The whitelist filter file could not be loaded.
    #[error("failed to load whitelist: {source}")]
    FilterFile {
        /// Underlying filter file error.
        #[source]
        source: FilterFileError,
    },
    /// The stats command could not be prepared.
    #[error("invalid stats command: {source}")]
    StatsCommand {
        /// Underlying collection error.
        #[source]
        source: CollectionError,
    },
    /// The sampling period could not drive a schedule.
    #[error("invalid sampling schedule: {source}")]
    Schedule {
        /// Underlying scheduling error.
        #[source]
        source: DitherError,
    },
    /// Daemonisation failed.
    #[error("failed to daemonise: {source}")]
    Daemonize {
        /// Underlying daemonisation error.
        #[source]
        source: DaemonizeError,
    },
    /// Installing the signal control plane failed.
    #[error("failed to install signal control: {source}")]
    Control {
        /// Underlying control error.
        #[source]
        source: ControlError,
    },
    /// The store could not be opened at launch.
    #[error("failed to open store: {source}")]
    Store {
        /// Underlying persistence error.
        #[source]
        source: PersistenceError,
    },
    /// The store could not be flushed and closed at shutdown.
    #[error("failed to close store: {source}")]
    Close {
        /// Underlying persistence error.
        #[source]
        source: PersistenceError,
    },
}

impl LaunchError {
    /// Process exit status reported for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::AlreadyRunning { .. } => exit::EX_TEMPFAIL,
            Self::Config { .. }
            | Self::Validation { .. }
            | Self::FilterFile { .. }
            | Self::StatsCommand { .. }
            | Self::Schedule { .. } => exit::EX_CONFIG,
            Self::Close { .. } => exit::EX_IOERR,
            _ => exit::EX_FAILURE,
        }
    }
}

fn describe_pid(pid: Option<u32>) -> String {
    pid.map_or_else(|| "unknown".to_owned(), |pid| pid.to_string())
}

impl From<Arc<OrthoError>> for LaunchError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config { source }
    }
}

impl From<ConfigValidationError> for LaunchError {
    fn from(source: ConfigValidationError) -> Self {
        Self::Validation { source }
    }
}

impl From<TelemetryError> for LaunchError {
    fn from(source: TelemetryError) -> Self {
        Self::Telemetry { source }
    }
}

impl From<RuntimePathsError> for LaunchError {
    fn from(source: RuntimePathsError) -> Self {
        Self::RuntimeDirectory { source }
    }
}

impl From<FilterFileError> for LaunchError {
    fn from(source: FilterFileError) -> Self {
        Self::FilterFile { source }
    }
}

impl From<CollectionError> for LaunchError {
    fn from(source: CollectionError) -> Self {
        Self::StatsCommand { source }
    }
}

impl From<DitherError> for LaunchError {
    fn from(source: DitherError) -> Self {
        Self::Schedule { source }
    }
}

impl From<DaemonizeError> for LaunchError {
    fn from(source: DaemonizeError) -> Self {
        Self::Daemonize { source }
    }
}

impl From<ControlError> for LaunchError {
    fn from(source: ControlError) -> Self {
        Self::Control { source }
    }
}
