//! Fleet health supervision
//!
//! Connection error signals from every room are counted per window. When a
//! window closes with at least `threshold` errors the whole fleet is rebuilt;
//! there is no per-connection retry.

#[derive(Debug, Clone)]
pub struct HealthSupervisor {
    threshold: u64,
    error_count: u64,
    resets: u64,
}

/// Outcome of closing one evaluation window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthVerdict {
    Healthy { errors: u64 },
    /// Threshold reached; the caller must tear down and rebuild the fleet
    Rebuild { errors: u64, resets: u64 },
}

impl HealthSupervisor {
    pub fn new(threshold: u64) -> Self {
        Self {
            threshold: threshold.max(1),
            error_count: 0,
            resets: 0,
        }
    }

    pub fn record_error(&mut self) {
        self.record_errors(1);
    }

    /// Add a batch of errors collected off the engine task
    pub fn record_errors(&mut self, count: u64) {
        self.error_count = self.error_count.saturating_add(count);
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }

    /// Number of fleet rebuilds triggered so far
    pub fn resets(&self) -> u64 {
        self.resets
    }

    /// Close the current window; the counter restarts at zero either way
    pub fn evaluate(&mut self) -> HealthVerdict {
        let errors = std::mem::take(&mut self.error_count);
        if errors >= self.threshold {
            self.resets += 1;
            HealthVerdict::Rebuild {
                errors,
                resets: self.resets,
            }
        } else {
            HealthVerdict::Healthy { errors }
        }
    }

    /// Forget errors counted against the previous fleet
    pub fn reset_window(&mut self) {
        self.error_count = 0;
    }
}
