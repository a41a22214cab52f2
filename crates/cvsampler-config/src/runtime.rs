//! Derives runtime artefact paths for the sampling daemon.
//!
//! The runtime directory houses the singleton lock, the pid file, and the
//! health snapshot. Operators and init scripts read the same layout, so the
//! file names are fixed and only the directory is configurable.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::Config;

#[cfg(unix)]
use dirs::runtime_dir;
#[cfg(unix)]
use libc::geteuid;

const LOCK_FILE: &str = "cvsamplerd.lock";
const PID_FILE: &str = "cvsamplerd.pid";
const HEALTH_FILE: &str = "cvsamplerd.health";

/// Canonical paths for runtime artefacts written by the daemon.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    runtime_dir: PathBuf,
    lock_path: PathBuf,
    pid_path: PathBuf,
    health_path: PathBuf,
}

impl RuntimePaths {
    /// Derives runtime paths from the configuration, creating the directory.
    pub fn from_config(config: &Config) -> Result<Self, RuntimePathsError> {
        let runtime_dir = match config.runtime_dir.as_ref() {
            Some(dir) if dir.as_str().is_empty() => return Err(RuntimePathsError::EmptyDirectory),
            Some(dir) => dir.as_std_path().to_path_buf(),
            None => default_runtime_directory(),
        };
        Self::in_directory(runtime_dir)
    }

    /// Builds the layout rooted at an explicit directory.
    pub fn in_directory(runtime_dir: impl Into<PathBuf>) -> Result<Self, RuntimePathsError> {
        let runtime_dir = runtime_dir.into();
        fs::create_dir_all(&runtime_dir).map_err(|source| RuntimePathsError::RuntimeDirectory {
            path: runtime_dir.clone(),
            source,
        })?;
        Ok(Self {
            lock_path: runtime_dir.join(LOCK_FILE),
            pid_path: runtime_dir.join(PID_FILE),
            health_path: runtime_dir.join(HEALTH_FILE),
            runtime_dir,
        })
    }

    /// Directory holding runtime artefacts.
    pub fn runtime_dir(&self) -> &Path {
        self.runtime_dir.as_path()
    }

    /// Path to the lock file guarding singleton startup.
    pub fn lock_path(&self) -> &Path {
        self.lock_path.as_path()
    }

    /// Path to the PID file.
    pub fn pid_path(&self) -> &Path {
        self.pid_path.as_path()
    }

    /// Path to the health snapshot.
    pub fn health_path(&self) -> &Path {
        self.health_path.as_path()
    }
}

fn default_runtime_directory() -> PathBuf {
    #[cfg(unix)]
    {
        if let Some(mut dir) = runtime_dir() {
            dir.push("cvsampler");
            return dir;
        }
        let mut dir = env::temp_dir();
        dir.push("cvsampler");
        dir.push(format!("uid-{}", unsafe { geteuid() }));
        dir
    }

    #[cfg(not(unix))]
    {
        let mut dir = env::temp_dir();
        dir.push("cvsampler");
        dir
    }
}

/// Errors raised while deriving daemon runtime paths.
#[derive(Debug, Error)]
pub enum RuntimePathsError {
    /// The runtime directory was configured as an empty string.
    #[error("runtime_dir must not be empty")]
    EmptyDirectory,
    /// Creating the runtime directory failed.
    #[error("failed to prepare runtime directory '{path}': {source}")]
    RuntimeDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use camino::Utf8PathBuf;
    use tempfile::TempDir;

    use super::*;

    #[test]
    fn derives_default_layout() {
        let paths =
            RuntimePaths::from_config(&Config::default()).expect("default paths should derive");
        let tail = paths
            .runtime_dir()
            .file_name()
            .and_then(|name| name.to_str())
            .expect("runtime dir should have trailing component");
        assert!(
            tail == "cvsampler" || tail.starts_with("uid-"),
            "unexpected runtime tail: {tail}"
        );
        assert!(paths.lock_path().ends_with(LOCK_FILE));
        assert!(paths.pid_path().ends_with(PID_FILE));
        assert!(paths.health_path().ends_with(HEALTH_FILE));
    }

    #[test]
    fn honours_configured_directory() {
        let temp = TempDir::new().expect("temp dir");
        let nested = temp.path().join("run").join("cvsampler");
        let config = Config {
            runtime_dir: Some(
                Utf8PathBuf::from_path_buf(nested.clone()).expect("utf-8 temp path"),
            ),
            ..Config::default()
        };
        let paths = RuntimePaths::from_config(&config).expect("paths should derive");
        assert_eq!(paths.runtime_dir(), nested.as_path());
        assert!(nested.is_dir(), "runtime directory should be created");
    }

    #[test]
    fn rejects_empty_directory() {
        let config = Config {
            runtime_dir: Some(Utf8PathBuf::new()),
            ..Config::default()
        };
        let error = RuntimePaths::from_config(&config).expect_err("empty dir must fail");
        assert!(matches!(error, RuntimePathsError::EmptyDirectory));
    }
}
