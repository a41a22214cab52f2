//! One sampling cycle as executed inside a worker.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;
use tracing::info;

use crate::favored::FavoredIndexSet;
use crate::pipeline::{Pipeline, StatsSource};
use crate::store::{PersistenceError, Store};

use super::SUPERVISOR_TARGET;
use super::worker::CycleJob;

/// Identifies a cycle in logs and health events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleId {
    /// The n-th cycle on the jittered schedule.
    Scheduled(u64),
    /// The n-th cycle requested out of schedule.
    Immediate(u64),
}

impl fmt::Display for CycleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scheduled(n) => write!(f, "scheduled#{n}"),
            Self::Immediate(n) => write!(f, "immediate#{n}"),
        }
    }
}

/// What a successful cycle did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleReport {
    /// Rows committed; zero is a normal outcome.
    pub committed: usize,
    /// Sample time shared by every committed row.
    pub sampled_at: i64,
}

/// Why a cycle failed.
#[derive(Debug, Error)]
pub enum CycleError {
    /// The rows could not be persisted; nothing from this cycle was kept.
    #[error("failed to persist cycle: {0}")]
    Persistence(#[from] PersistenceError),
    /// The cycle panicked.
    #[error("cycle panicked: {message}")]
    Panicked {
        /// Panic payload rendered as text.
        message: String,
    },
}

/// Everything a worker needs to run a cycle on its own.
#[derive(Clone)]
pub struct CycleRunner {
    pipeline: Arc<Pipeline<Arc<dyn StatsSource>>>,
    database: PathBuf,
}

impl fmt::Debug for CycleRunner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CycleRunner")
            .field("database", &self.database)
            .finish_non_exhaustive()
    }
}

impl CycleRunner {
    /// Builds a runner sampling `source` into the database at `database`.
    pub fn new(
        source: Arc<dyn StatsSource>,
        lookup_key: impl Into<String>,
        database: impl Into<PathBuf>,
    ) -> Self {
        Self {
            pipeline: Arc::new(Pipeline::new(source, lookup_key)),
            database: database.into(),
        }
    }

    /// Database the runner writes to.
    #[must_use]
    pub fn database(&self) -> &Path {
        self.database.as_path()
    }

    /// Packages one cycle against a captured whitelist snapshot.
    #[must_use]
    pub fn job(&self, id: CycleId, favored: Arc<FavoredIndexSet>) -> CycleJob {
        let runner = self.clone();
        Box::new(move || runner.run(id, &favored))
    }

    /// Collects, filters and persists one sample.
    ///
    /// The worker opens its own connection; an empty row set commits nothing
    /// and leaves the database untouched.
    pub fn run(&self, id: CycleId, favored: &FavoredIndexSet) -> Result<CycleReport, CycleError> {
        let sampled_at = unix_now();
        let output = self.pipeline.run(favored);
        let committed = if output.rows.is_empty() {
            0
        } else {
            let mut store = Store::open(&self.database)?;
            let committed = store.insert_cycle(sampled_at, &output.rows)?;
            store.close()?;
            committed
        };
        info!(
            target: SUPERVISOR_TARGET,
            cycle = %id,
            committed,
            sampled_at,
            "cycle complete"
        );
        Ok(CycleReport {
            committed,
            sampled_at,
        })
    }
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| i64::try_from(elapsed.as_secs()).unwrap_or(i64::MAX))
}
