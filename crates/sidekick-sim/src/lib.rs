//! Emulated two-segment path for transport benchmarks.
//!
//! Builds a server ↔ relay ↔ client topology out of Linux network
//! namespaces, shapes both links with `tc` queues sized from the
//! bandwidth-delay product, supervises the benchmark processes running on
//! it and measures per-hop interface counters around each trial window.

pub mod buffer;
pub mod config;
pub mod counters;
pub mod error;
pub mod exec;
pub mod experiment;
pub mod monitor;
pub mod protocol;
pub mod shaper;
pub mod supervisor;
#[cfg(any(test, feature = "test-util"))]
pub mod test_util;
pub mod topology;

pub use error::{Result, SimError};
