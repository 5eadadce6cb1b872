use std::io;

use thiserror::Error;

use crate::condition::Condition;

#[derive(Debug, Error)]
pub enum HarvestError {
    #[error(transparent)]
    Io(#[from] io::Error),

    /// A summary was requested over an empty sample set.
    #[error("no samples for {0}")]
    NoSamples(String),

    /// A sample that cannot be normalized (zero or negative elapsed time).
    #[error("sample {0} cannot be normalized")]
    InvalidSample(f64),

    /// Backfilling a condition failed.
    #[error("executing {condition} failed: {reason}")]
    Execute { condition: Condition, reason: String },

    #[error("serializing output: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T, E = HarvestError> = std::result::Result<T, E>;
