//! Daemon bootstrap orchestration.

use std::sync::Arc;
use std::time::Duration;

use ortho_config::OrthoError;

use cvsampler_config::Config;

use crate::health::HealthReporter;
use crate::pipeline::{CollectionError, CommandSource, StatsSource};
use crate::process::LaunchError;
use crate::telemetry;

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    fn load(&self) -> Result<Config, Arc<OrthoError>>;
}

/// Loader that delegates to [`Config::load`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Config::load()
    }
}

/// Loader that hands out a configuration resolved elsewhere.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps an already-resolved configuration.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(self.config.clone())
    }
}

/// Builds the sources the daemon and the dictionary builder read from.
pub trait SourceProvider: Send + Sync {
    /// Prepares the counter snapshot source each cycle collects from.
    fn stats_source(&self, config: &Config) -> Result<Arc<dyn StatsSource>, CollectionError>;

    /// Prepares the metric definition source.
    fn definition_source(&self, config: &Config)
    -> Result<Arc<dyn StatsSource>, CollectionError>;
}

/// Provider that runs the configured external commands.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemSourceProvider;

impl SystemSourceProvider {
    fn command(config: &Config, command_line: &str) -> Result<Arc<dyn StatsSource>, CollectionError> {
        let timeout = Duration::from_secs(config.collect_timeout_secs());
        let source = CommandSource::from_command_line(command_line, timeout)?;
        Ok(Arc::new(source))
    }
}

impl SourceProvider for SystemSourceProvider {
    fn stats_source(&self, config: &Config) -> Result<Arc<dyn StatsSource>, CollectionError> {
        Self::command(config, config.stats_command())
    }

    fn definition_source(
        &self,
        config: &Config,
    ) -> Result<Arc<dyn StatsSource>, CollectionError> {
        Self::command(config, config.definition_command())
    }
}

/// Loads and validates the configuration, then installs telemetry.
///
/// Every failure is reported through `reporter` before it is returned.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: &dyn HealthReporter,
) -> Result<Config, LaunchError> {
    reporter.bootstrap_starting();
    match load_validated(loader) {
        Ok(config) => {
            reporter.bootstrap_succeeded(&config);
            Ok(config)
        }
        Err(error) => {
            reporter.bootstrap_failed(&error);
            Err(error)
        }
    }
}

fn load_validated(loader: &dyn ConfigLoader) -> Result<Config, LaunchError> {
    let config = loader.load()?;
    config.validate()?;
    telemetry::initialise(&config)?;
    Ok(config)
}
