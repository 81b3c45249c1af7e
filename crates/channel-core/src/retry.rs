use std::time::Duration;

use crate::error::ChannelError;

/// Exponential backoff with a ceiling and a bounded number of automatic attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay_ms: u64,
    max_delay_ms: u64,
}

impl RetryPolicy {
    pub fn new(
        max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    ) -> Result<Self, ChannelError> {
        if base_delay_ms == 0 {
            return Err(ChannelError::invalid_config(
                "base_delay_ms",
                "must be greater than 0",
            ));
        }
        if max_delay_ms == 0 {
            return Err(ChannelError::invalid_config(
                "max_delay_ms",
                "must be greater than 0",
            ));
        }
        if base_delay_ms > max_delay_ms {
            return Err(ChannelError::invalid_config(
                "base_delay_ms",
                format!("{base_delay_ms} exceeds max_delay_ms {max_delay_ms}"),
            ));
        }

        Ok(Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        })
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let calculated = self.base_delay_ms.saturating_mul(multiplier);
        Duration::from_millis(calculated.min(self.max_delay_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }
}
