//! Pure reconnection backoff logic
//!
//! Exponential delay growth with a ceiling and additive jitter, plus the
//! decision of whether another attempt is allowed at all. Kept free of I/O
//! so the schedule can be tested exactly.

use crate::config::ReconnectSection;
use std::time::Duration;

/// Decision result for reconnection attempts
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconnectDecision {
    /// Proceed with the next attempt after the given delay
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - configured attempt limit reached
    AbortAttemptsExhausted,
}

/// Backoff state for one outage
///
/// `attempt` counts failed attempts in the current outage and resets to
/// zero on a successful connect, so every fresh outage starts back at the
/// base delay.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    ceiling_ms: u64,
    limit: Option<u32>,
    attempt: u32,
}

impl Backoff {
    pub fn new(config: &ReconnectSection) -> Self {
        Self {
            base_ms: config.base_delay_ms,
            ceiling_ms: config.max_delay_ms,
            limit: config.attempt_limit(),
            attempt: 0,
        }
    }

    /// Attempts completed in the current outage
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Attempt ceiling, if one is configured
    pub fn limit(&self) -> Option<u32> {
        self.limit
    }

    /// Forget the current outage after a successful connect
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Decide whether to try again, advancing the attempt counter
    pub fn next_decision(&mut self, shutdown_requested: bool) -> ReconnectDecision {
        if shutdown_requested {
            return ReconnectDecision::AbortShutdownRequested;
        }

        if let Some(limit) = self.limit {
            if self.attempt >= limit {
                return ReconnectDecision::AbortAttemptsExhausted;
            }
        }

        self.attempt += 1;
        ReconnectDecision::Proceed {
            attempt: self.attempt,
            delay: jittered(delay_for(self.attempt, self.base_ms, self.ceiling_ms)),
        }
    }
}

/// Raw delay for the given attempt (pure function)
///
/// Doubles from the base each attempt and clamps at the ceiling:
/// base, 2x, 4x, ... ceiling, ceiling, ...
pub fn delay_for(attempt: u32, base_ms: u64, ceiling_ms: u64) -> Duration {
    debug_assert!(attempt >= 1);
    // Cap the exponent; anything past 2^32 is beyond any sane ceiling
    let exponent = attempt.saturating_sub(1).min(32);
    let delay_ms = base_ms.saturating_mul(1u64 << exponent).min(ceiling_ms);
    Duration::from_millis(delay_ms)
}

/// Add jitter in [0, delay/10] so a fleet of consumers does not retry in
/// lockstep after a shared broker outage
fn jittered(delay: Duration) -> Duration {
    let delay_ms = delay.as_millis() as u64;
    let jitter_ms = rand::random::<u64>() % (delay_ms / 10 + 1);
    Duration::from_millis(delay_ms + jitter_ms)
}
