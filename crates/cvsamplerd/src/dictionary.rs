//! One-shot rebuild of the `data_dictionary` table.
//!
//! Runs the configured definition command once, decodes the catalogue and
//! replaces the table contents in a single transaction. The daemon never
//! calls this; it backs the `cvsampler-dict` binary.

use std::sync::Arc;

use ortho_config::OrthoError;
use thiserror::Error;
use tracing::info;

use cvsampler_config::{Config, ConfigValidationError};

use crate::bootstrap::{ConfigLoader, SourceProvider, SystemConfigLoader, SystemSourceProvider};
use crate::pipeline::{Collected, CollectionError};
use crate::process::exit;
use crate::store::{DictionaryError, PersistenceError, Store, decode_definitions};
use crate::telemetry::{self, TelemetryError};

const DICTIONARY_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::dictionary");

/// Failures while rebuilding the data dictionary.
#[derive(Debug, Error)]
pub enum DictionaryBuildError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {0}")]
    Config(#[source] Arc<OrthoError>),
    /// Configuration loaded but holds unusable values.
    #[error("invalid configuration: {0}")]
    Validation(#[from] ConfigValidationError),
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {0}")]
    Telemetry(#[from] TelemetryError),
    /// The definition command produced nothing usable.
    #[error("failed to read metric definitions: {0}")]
    Definitions(#[from] CollectionError),
    /// The definition document had the wrong shape.
    #[error("failed to decode metric definitions: {0}")]
    Shape(#[from] DictionaryError),
    /// Writing the table failed; the previous contents remain.
    #[error("failed to write data dictionary: {0}")]
    Store(#[from] PersistenceError),
}

impl DictionaryBuildError {
    /// Process exit status reported for this error.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) | Self::Validation(_) => exit::EX_CONFIG,
            Self::Store(_) => exit::EX_IOERR,
            _ => exit::EX_FAILURE,
        }
    }
}

impl From<Arc<OrthoError>> for DictionaryBuildError {
    fn from(source: Arc<OrthoError>) -> Self {
        Self::Config(source)
    }
}

/// Rebuilds the dictionary using the production collaborators.
pub fn run_dictionary_build() -> Result<usize, DictionaryBuildError> {
    let config = SystemConfigLoader.load()?;
    config.validate()?;
    telemetry::initialise(&config)?;
    build_dictionary_with(&config, &SystemSourceProvider)
}

/// Rebuilds the dictionary described by `config` from `sources`.
///
/// Returns the number of entries written.
pub fn build_dictionary_with(
    config: &Config,
    sources: &dyn SourceProvider,
) -> Result<usize, DictionaryBuildError> {
    let source = sources.definition_source(config)?;
    let document = match source.collect() {
        Collected::Sample(document) => document,
        Collected::NoData(error) => return Err(error.into()),
    };
    let definitions = decode_definitions(&document, config.lookup_key())?;
    info!(
        target: DICTIONARY_TARGET,
        entries = definitions.entries.len(),
        skipped = definitions.skipped,
        "metric definitions decoded"
    );

    let mut store = Store::open(config.database().as_std_path())?;
    let written = store.build_dictionary(&definitions.entries)?;
    store.close()?;
    Ok(written)
}
