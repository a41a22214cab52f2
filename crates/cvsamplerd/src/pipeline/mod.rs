//! Collect, reshape and whitelist one sample.
//!
//! The pipeline never fails: a source that yields nothing, or a document
//! with the wrong structure, produces an empty row set and an outcome that
//! says why. Only persistence can fail a cycle.

mod collect;
mod reshape;

use tracing::{debug, error, warn};

pub use self::collect::{Collected, CollectionError, CommandSource, StatsSource};
#[cfg(test)]
pub use self::collect::MockStatsSource;
pub use self::reshape::{MetricRow, ReshapeError, Reshaped, SampleShape, reshape};

use crate::favored::FavoredIndexSet;

pub(crate) const PIPELINE_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pipeline");

/// How a pipeline run went.
#[derive(Debug)]
pub enum SampleOutcome {
    /// A sample was collected and reshaped.
    Collected {
        /// Rows produced by reshaping, before the whitelist.
        reshaped: usize,
        /// Leaves and entries skipped as non-numeric.
        skipped: usize,
    },
    /// The source produced nothing this cycle.
    NoData(CollectionError),
    /// The sample did not have the expected structure.
    Malformed(ReshapeError),
}

/// Whitelisted rows plus the outcome that produced them.
#[derive(Debug)]
pub struct PipelineOutput {
    /// Rows to persist, in document order.
    pub rows: Vec<MetricRow>,
    /// Why the rows look the way they do.
    pub outcome: SampleOutcome,
}

impl PipelineOutput {
    fn empty(outcome: SampleOutcome) -> Self {
        Self {
            rows: Vec::new(),
            outcome,
        }
    }
}

/// Keeps only rows whose index is whitelisted.
#[must_use]
pub fn whitelist(rows: Vec<MetricRow>, favored: &FavoredIndexSet) -> Vec<MetricRow> {
    rows.into_iter()
        .filter(|row| favored.contains(&row.index))
        .collect()
}

/// One configured pipeline: a source and the lookup key used to reshape it.
#[derive(Debug)]
pub struct Pipeline<S> {
    source: S,
    lookup_key: String,
}

impl<S: StatsSource> Pipeline<S> {
    /// Builds a pipeline over `source`.
    pub fn new(source: S, lookup_key: impl Into<String>) -> Self {
        Self {
            source,
            lookup_key: lookup_key.into(),
        }
    }

    /// Runs collect → reshape → whitelist against `favored`.
    pub fn run(&self, favored: &FavoredIndexSet) -> PipelineOutput {
        let sample = match self.source.collect() {
            Collected::Sample(sample) => sample,
            Collected::NoData(reason) => {
                error!(target: PIPELINE_TARGET, error = %reason, "no data collected this cycle");
                return PipelineOutput::empty(SampleOutcome::NoData(reason));
            }
        };
        let Reshaped { rows, skipped } = match reshape(&sample, &self.lookup_key) {
            Ok(reshaped) => reshaped,
            Err(reason) => {
                warn!(target: PIPELINE_TARGET, error = %reason, "sample has unexpected structure");
                return PipelineOutput::empty(SampleOutcome::Malformed(reason));
            }
        };
        let reshaped = rows.len();
        let rows = whitelist(rows, favored);
        debug!(
            target: PIPELINE_TARGET,
            reshaped,
            favored = rows.len(),
            skipped,
            "pipeline complete"
        );
        PipelineOutput {
            rows,
            outcome: SampleOutcome::Collected { reshaped, skipped },
        }
    }
}
