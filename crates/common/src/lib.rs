//! Common utilities for usbtv-capture
//!
//! This crate provides the pieces shared by the capture library and its
//! binary: error handling, logging setup, the bounded queue that hands
//! frames to the consumer thread, and capture counters. Packet and field
//! builders for tests sit in `test_utils` behind the `test-utils` feature.

pub mod channel;
pub mod error;
pub mod logging;
pub mod metrics;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use channel::{BoundedQueue, PushError};
pub use error::{Error, Result};
pub use logging::setup_logging;
pub use metrics::{CaptureStats, StatsSnapshot};
