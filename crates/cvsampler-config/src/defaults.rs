use camino::Utf8PathBuf;

/// Default SQLite database file name.
pub const DEFAULT_DATABASE: &str = "clusterdata.db";

/// Default whitelist file name.
pub const DEFAULT_FILTER_FILE: &str = "favored_indexes.txt";

/// Default sampling period in minutes.
pub const DEFAULT_PERIOD_MINUTES: u64 = 5;

/// Smallest sampling period accepted by default.
pub const DEFAULT_MIN_PERIOD_MINUTES: u64 = 1;

/// Largest sampling period accepted by default (one day).
pub const DEFAULT_MAX_PERIOD_MINUTES: u64 = 1440;

/// Default log filter expression used by the binaries.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Key under which the vendor tools nest their metric objects.
pub const DEFAULT_LOOKUP_KEY: &str = "lookup";

/// Vendor command producing a JSON snapshot of every counter.
pub const DEFAULT_STATS_COMMAND: &str = "sudo cv-stats -a --format=json";

/// Vendor command producing the JSON metric definitions.
pub const DEFAULT_DEFINITION_COMMAND: &str = "/usr/sbin/cv-cockpit-helper --stat-definition";

/// Default bound on one external command invocation.
pub const DEFAULT_COLLECT_TIMEOUT_SECS: u64 = 120;

/// Default log filter expression used by the binaries.
pub fn default_log_filter() -> &'static str {
    DEFAULT_LOG_FILTER
}

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter_string() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

/// Default logging format for the binaries.
pub fn default_log_format() -> crate::logging::LogFormat {
    crate::logging::LogFormat::Json
}

pub(crate) fn default_database() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_DATABASE)
}

pub(crate) fn default_filter_file() -> Utf8PathBuf {
    Utf8PathBuf::from(DEFAULT_FILTER_FILE)
}

pub(crate) fn default_lookup_key() -> String {
    DEFAULT_LOOKUP_KEY.to_owned()
}

pub(crate) fn default_stats_command() -> String {
    DEFAULT_STATS_COMMAND.to_owned()
}

pub(crate) fn default_definition_command() -> String {
    DEFAULT_DEFINITION_COMMAND.to_owned()
}
