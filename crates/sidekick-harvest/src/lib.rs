//! Turns raw benchmark logs into per-condition summary statistics.
//!
//! [`parser::LogParser`] extracts a [`condition::TrialMatrix`] from a log,
//! [`reconcile::TrialReconciler`] compares it with the expected trial
//! counts and backfills deficits through a [`reconcile::TrialExecutor`],
//! and [`stats::DataPoint`] summarises each condition's samples.

pub mod condition;
pub mod error;
pub mod grammar;
pub mod parser;
pub mod reconcile;
pub mod stats;
pub mod sweep;
pub mod window;

pub use error::{HarvestError, Result};
