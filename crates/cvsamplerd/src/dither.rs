//! Jittered sampling intervals.
//!
//! Polling on a fixed period risks aliasing with periodic load on the cluster
//! (cron jobs, power capping cycles). The [`Ditherer`] spreads each wait
//! uniformly over ±5% of the nominal period instead.

use std::ops::RangeInclusive;
use std::time::Duration;

use rand::Rng;
use rand::rngs::ThreadRng;
use thiserror::Error;

/// Errors raised when constructing a [`Ditherer`].
#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum DitherError {
    /// The nominal period was zero seconds.
    #[error("nominal sampling period must be greater than zero")]
    ZeroPeriod,
}

/// Unbounded source of jittered wait intervals, in whole seconds.
///
/// Every value lies in `[⌊0.95·T⌋, ⌈1.05·T⌉]` for the nominal period `T`.
/// The sequence never ends and cannot be restarted.
#[derive(Debug)]
pub struct Ditherer {
    bounds: RangeInclusive<u64>,
    rng: ThreadRng,
}

impl Ditherer {
    /// Builds a ditherer around `period_secs`.
    pub fn new(period_secs: u64) -> Result<Self, DitherError> {
        if period_secs == 0 {
            return Err(DitherError::ZeroPeriod);
        }
        let lower = period_secs.saturating_mul(95).div_euclid(100);
        let upper = period_secs.saturating_mul(105).div_ceil(100);
        Ok(Self {
            bounds: lower..=upper,
            rng: rand::rng(),
        })
    }

    /// Inclusive range every drawn interval falls within.
    #[must_use]
    pub const fn bounds(&self) -> &RangeInclusive<u64> {
        &self.bounds
    }

    /// Adapts the sequence into wall-clock durations for the supervisor.
    pub fn intervals(self) -> impl Iterator<Item = Duration> {
        self.map(Duration::from_secs)
    }
}

impl Iterator for Ditherer {
    type Item = u64;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.rng.random_range(self.bounds.clone()))
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (usize::MAX, None)
    }
}
