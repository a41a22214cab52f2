//! Test suites for the sampling daemon.

pub(crate) mod support;
