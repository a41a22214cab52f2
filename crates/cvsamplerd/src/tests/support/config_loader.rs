//! Configuration loader rooted in a scratch directory.

use std::path::Path;
use std::sync::Arc;

use camino::Utf8PathBuf;
use ortho_config::OrthoError;
use tempfile::TempDir;

use cvsampler_config::Config;

use crate::bootstrap::ConfigLoader;

/// Loader placing the database, filter file and runtime directory under one
/// temporary directory.
#[derive(Clone)]
pub struct TestConfigLoader {
    scratch: Arc<TempDir>,
    database: &'static str,
    iterations: Option<u64>,
}

impl TestConfigLoader {
    #[must_use]
    pub fn new(scratch: Arc<TempDir>) -> Self {
        Self {
            scratch,
            database: "clusterdata.db",
            iterations: None,
        }
    }

    /// Caps the run at `iterations` scheduled cycles.
    #[must_use]
    pub fn with_iterations(mut self, iterations: Option<u64>) -> Self {
        self.iterations = iterations;
        self
    }

    /// Points the daemon at a differently named database file.
    #[must_use]
    pub fn with_database(mut self, database: &'static str) -> Self {
        self.database = database;
        self
    }

    pub fn root(&self) -> &Path {
        self.scratch.path()
    }

    fn utf8(&self, name: &str) -> Utf8PathBuf {
        Utf8PathBuf::from_path_buf(self.root().join(name))
            .expect("temporary path was not valid UTF-8")
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, Arc<OrthoError>> {
        Ok(Config {
            database: self.utf8(self.database),
            filter_file: self.utf8("favored_indexes.txt"),
            runtime_dir: Some(self.utf8("run")),
            iterations: self.iterations,
            foreground: true,
            period_minutes: 1,
            ..Config::default()
        })
    }
}
