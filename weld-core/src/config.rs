//! Plain, serde-derived configuration types for the public surface.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for [`crate::pipeline::Pipeline::tap`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TapConfig {
    /// Buffer size of the tap's own channel. `0` (the default) is a
    /// rendezvous: the fan-out task blocks until this tap's consumer is
    /// ready.
    pub max_buffer_size: usize,
    /// Per-attempt send timeout. `None` means unbounded (the default).
    pub timeout: Option<Duration>,
    /// Number of retries after an initial timed-out attempt. `0` (the
    /// default) means a single attempt.
    pub retries: u32,
    /// Whether registering this tap should also enable the pipeline's
    /// output driver.
    pub start: bool,
}

impl Default for TapConfig {
    fn default() -> Self {
        TapConfig {
            max_buffer_size: 0,
            timeout: None,
            retries: 0,
            start: true,
        }
    }
}

impl TapConfig {
    pub fn with_max_buffer_size(mut self, size: usize) -> Self {
        self.max_buffer_size = size;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_start(mut self, start: bool) -> Self {
        self.start = start;
        self
    }
}
