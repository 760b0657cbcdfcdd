//! Capped exponential backoff between automatic retries.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// `delay = min(base * 2^attempt, cap)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    /// Delay before the first retry, in seconds
    #[serde(default = "default_base_seconds")]
    pub base_seconds: u64,

    /// Upper bound on any single delay, in seconds
    #[serde(default = "default_cap_seconds")]
    pub cap_seconds: u64,
}

fn default_base_seconds() -> u64 {
    2
}
fn default_cap_seconds() -> u64 {
    300
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            base_seconds: default_base_seconds(),
            cap_seconds: default_cap_seconds(),
        }
    }
}

impl Backoff {
    pub fn new(base_seconds: u64, cap_seconds: u64) -> Self {
        Self {
            base_seconds,
            cap_seconds,
        }
    }

    /// Delay before retrying after `attempt` failures (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let secs = self.base_seconds.saturating_mul(factor).min(self.cap_seconds);
        Duration::from_secs(secs)
    }

    /// Same as `delay_for_attempt`, as a chrono duration for timestamp math
    pub fn chrono_delay(&self, attempt: u32) -> chrono::Duration {
        let secs = self.delay_for_attempt(attempt).as_secs();
        chrono::Duration::seconds(i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000))
    }
}
