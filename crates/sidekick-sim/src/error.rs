//! Error taxonomy for topology, shaping, supervision and counters.

use std::io;
use std::time::Duration;

use thiserror::Error;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration. Raised before any network state is mutated.
    #[error("configuration error: {0}")]
    Config(String),

    /// A host command (tc, ip, sysctl, ...) exited non-zero.
    #[error("command failed: {cmd}: {stderr}")]
    Command { cmd: String, stderr: String },

    /// A supervised process exited unexpectedly or never became ready.
    #[error("process {name} failed ({status}); log tail:\n{tail}")]
    Process {
        name: String,
        status: String,
        tail: String,
    },

    /// A trial did not finish within the caller-supplied bound.
    #[error("{name} did not finish within {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    /// Counter source unreadable or a counter went backwards.
    #[error("counter error: {0}")]
    Counter(String),

    /// Another experiment holds the run lock.
    #[error("emulated network busy: lock {0} is held")]
    Busy(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SimError {
    pub fn config(msg: impl Into<String>) -> Self {
        SimError::Config(msg.into())
    }
}

pub type Result<T, E = SimError> = std::result::Result<T, E>;
