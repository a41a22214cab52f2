//! Shared configuration for the cvsampler daemon and its dictionary builder.
//!
//! Values are layered by `ortho-config`: built-in defaults, an optional TOML
//! file (`--config-path` or `CVSAMPLER_CONFIG_PATH`), `CVSAMPLER_*`
//! environment variables, and finally command-line flags. Loading never
//! validates semantic ranges; callers run [`Config::validate`] once the layers
//! have been merged so the daemon can fail fast with a distinct exit code.

use std::sync::Arc;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod defaults;
mod logging;
mod runtime;

pub use defaults::{
    DEFAULT_COLLECT_TIMEOUT_SECS, DEFAULT_DATABASE, DEFAULT_DEFINITION_COMMAND,
    DEFAULT_FILTER_FILE, DEFAULT_LOG_FILTER, DEFAULT_LOOKUP_KEY, DEFAULT_MAX_PERIOD_MINUTES,
    DEFAULT_MIN_PERIOD_MINUTES, DEFAULT_PERIOD_MINUTES, DEFAULT_STATS_COMMAND,
    default_log_filter, default_log_format,
};
pub use logging::{LogFormat, LogFormatParseError};
pub use runtime::{RuntimePaths, RuntimePathsError};

/// Resolved configuration for the sampler binaries.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, OrthoConfig)]
#[ortho_config(prefix = "CVSAMPLER")]
pub struct Config {
    /// SQLite database receiving fact and dictionary rows.
    #[ortho_config(default = defaults::default_database())]
    pub database: Utf8PathBuf,
    /// Line-oriented whitelist of metric index identifiers.
    #[ortho_config(default = defaults::default_filter_file())]
    pub filter_file: Utf8PathBuf,
    /// Nominal sampling period in minutes.
    #[ortho_config(default = DEFAULT_PERIOD_MINUTES)]
    pub period_minutes: u64,
    /// Smallest period an operator may request.
    #[ortho_config(default = DEFAULT_MIN_PERIOD_MINUTES)]
    pub min_period_minutes: u64,
    /// Largest period an operator may request.
    #[ortho_config(default = DEFAULT_MAX_PERIOD_MINUTES)]
    pub max_period_minutes: u64,
    /// Optional cap on scheduled cycles, used for bounded debugging runs.
    pub iterations: Option<u64>,
    /// Stay attached to the terminal instead of daemonising.
    #[ortho_config(default = false)]
    pub foreground: bool,
    /// `tracing` filter expression.
    #[ortho_config(default = defaults::default_log_filter_string())]
    pub log_filter: String,
    /// Log line format.
    #[ortho_config(default = defaults::default_log_format())]
    pub log_format: LogFormat,
    /// File receiving daemon diagnostics once detached from the terminal.
    pub log_file: Option<Utf8PathBuf>,
    /// Directory holding the lock, pid, and health files.
    pub runtime_dir: Option<Utf8PathBuf>,
    /// Key naming the metric sub-object inside the vendor JSON document.
    #[ortho_config(default = defaults::default_lookup_key())]
    pub lookup_key: String,
    /// Command producing a JSON snapshot of the counters.
    #[ortho_config(default = defaults::default_stats_command())]
    pub stats_command: String,
    /// Command producing the JSON metric definitions.
    #[ortho_config(default = defaults::default_definition_command())]
    pub definition_command: String,
    /// Upper bound on a single external command invocation, in seconds.
    #[ortho_config(default = DEFAULT_COLLECT_TIMEOUT_SECS)]
    pub collect_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: defaults::default_database(),
            filter_file: defaults::default_filter_file(),
            period_minutes: DEFAULT_PERIOD_MINUTES,
            min_period_minutes: DEFAULT_MIN_PERIOD_MINUTES,
            max_period_minutes: DEFAULT_MAX_PERIOD_MINUTES,
            iterations: None,
            foreground: false,
            log_filter: defaults::default_log_filter_string(),
            log_format: default_log_format(),
            log_file: None,
            runtime_dir: None,
            lookup_key: defaults::default_lookup_key(),
            stats_command: defaults::default_stats_command(),
            definition_command: defaults::default_definition_command(),
            collect_timeout_secs: DEFAULT_COLLECT_TIMEOUT_SECS,
        }
    }
}

impl Config {
    /// Loads configuration from the process arguments and environment.
    pub fn load() -> Result<Self, Arc<OrthoError>> {
        <Self as OrthoConfig>::load()
    }

    /// Loads configuration from an explicit argument list.
    ///
    /// The first item is treated as the binary name, mirroring `std::env::args_os`.
    pub fn load_from_iter<I, T>(args: I) -> Result<Self, Arc<OrthoError>>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        <Self as OrthoConfig>::load_from_iter(args)
    }

    /// Path to the SQLite database.
    #[must_use]
    pub fn database(&self) -> &Utf8Path {
        self.database.as_path()
    }

    /// Path to the whitelist filter file.
    #[must_use]
    pub fn filter_file(&self) -> &Utf8Path {
        self.filter_file.as_path()
    }

    /// Nominal sampling period in seconds.
    #[must_use]
    pub const fn period_secs(&self) -> u64 {
        self.period_minutes.saturating_mul(60)
    }

    /// Optional cap on scheduled cycles.
    #[must_use]
    pub const fn iterations(&self) -> Option<u64> {
        self.iterations
    }

    /// Whether the daemon stays attached to the terminal.
    #[must_use]
    pub const fn foreground(&self) -> bool {
        self.foreground
    }

    /// Log filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub const fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Optional log file used in background mode.
    #[must_use]
    pub fn log_file(&self) -> Option<&Utf8Path> {
        self.log_file.as_deref()
    }

    /// Key naming the metric sub-object.
    #[must_use]
    pub fn lookup_key(&self) -> &str {
        self.lookup_key.as_str()
    }

    /// Command line producing counter snapshots.
    #[must_use]
    pub fn stats_command(&self) -> &str {
        self.stats_command.as_str()
    }

    /// Command line producing metric definitions.
    #[must_use]
    pub fn definition_command(&self) -> &str {
        self.definition_command.as_str()
    }

    /// Timeout applied to each external command invocation.
    #[must_use]
    pub const fn collect_timeout_secs(&self) -> u64 {
        self.collect_timeout_secs
    }

    /// Checks semantic constraints that the layered loader cannot express.
    pub fn validate(&self) -> Result<(), ConfigValidationError> {
        if self.min_period_minutes == 0 || self.min_period_minutes > self.max_period_minutes {
            return Err(ConfigValidationError::InvalidPeriodRange {
                min: self.min_period_minutes,
                max: self.max_period_minutes,
            });
        }
        if !(self.min_period_minutes..=self.max_period_minutes).contains(&self.period_minutes) {
            return Err(ConfigValidationError::PeriodOutOfRange {
                period: self.period_minutes,
                min: self.min_period_minutes,
                max: self.max_period_minutes,
            });
        }
        if self.stats_command.trim().is_empty() {
            return Err(ConfigValidationError::EmptyCommand {
                field: "stats_command",
            });
        }
        if self.definition_command.trim().is_empty() {
            return Err(ConfigValidationError::EmptyCommand {
                field: "definition_command",
            });
        }
        if self.collect_timeout_secs == 0 {
            return Err(ConfigValidationError::ZeroTimeout);
        }
        Ok(())
    }
}

/// Semantic configuration errors detected after loading.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConfigValidationError {
    /// The configured period lies outside the allowed range.
    #[error("sampling period {period} minutes is outside the allowed range {min}..={max}")]
    PeriodOutOfRange {
        /// Requested period in minutes.
        period: u64,
        /// Smallest allowed period.
        min: u64,
        /// Largest allowed period.
        max: u64,
    },
    /// The allowed range itself is empty or starts at zero.
    #[error("allowed period range {min}..={max} is invalid")]
    InvalidPeriodRange {
        /// Configured lower bound.
        min: u64,
        /// Configured upper bound.
        max: u64,
    },
    /// An external command was configured as an empty string.
    #[error("{field} must not be empty")]
    EmptyCommand {
        /// Name of the offending field.
        field: &'static str,
    },
    /// The external command timeout was zero.
    #[error("collect_timeout_secs must be greater than zero")]
    ZeroTimeout,
}
