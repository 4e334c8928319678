//! Exponential backoff with full jitter
//!
//! Each retry draws a delay uniformly from `[0, min(base * 2^attempts, max)]`.
//! The retry budget is fixed: once `max_attempts` delays have been handed out
//! the policy reports exhaustion instead of a delay.

use rand::rngs::OsRng;
use rand::RngCore;
use std::time::Duration;
use thiserror::Error;

/// Source of random numbers for jitter
pub trait JitterSource: Send {
    fn next_u64(&mut self) -> Result<u64, rand::Error>;
}

/// OS-seeded jitter. Failures of the OS generator are reported, never papered over.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsJitter;

impl JitterSource for OsJitter {
    fn next_u64(&mut self) -> Result<u64, rand::Error> {
        let mut buf = [0u8; 8];
        OsRng.try_fill_bytes(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }
}

#[derive(Debug, Error)]
pub enum BackoffError {
    #[error("Retries exhausted after {attempts} attempts")]
    Exhausted { attempts: u32 },
    #[error("Random number generation failed")]
    Randomness(#[source] rand::Error),
}

/// Immutable retry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

/// Progress through one retry sequence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffState {
    attempts_done: u32,
}

impl BackoffState {
    pub fn attempts_done(&self) -> u32 {
        self.attempts_done
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_delay,
            max_attempts,
        }
    }

    /// Begin a fresh retry sequence
    pub fn start(&self) -> BackoffState {
        BackoffState { attempts_done: 0 }
    }

    /// Upper bound of the delay for the given number of completed attempts
    pub fn ceiling(&self, attempts_done: u32) -> Duration {
        let base_ms = duration_ms(self.base_delay);
        let max_ms = duration_ms(self.max_delay);
        let scaled = 1u64
            .checked_shl(attempts_done)
            .and_then(|factor| base_ms.checked_mul(factor))
            .unwrap_or(u64::MAX);
        Duration::from_millis(scaled.min(max_ms))
    }

    /// Draw the next delay, or report that the budget is spent.
    ///
    /// Exhaustion does not advance the state; a randomness failure ends the
    /// sequence the same way exhaustion does.
    pub fn next_delay(
        &self,
        state: &mut BackoffState,
        jitter: &mut dyn JitterSource,
    ) -> Result<Duration, BackoffError> {
        if state.attempts_done >= self.max_attempts {
            return Err(BackoffError::Exhausted {
                attempts: state.attempts_done,
            });
        }

        let ceiling_ms = duration_ms(self.ceiling(state.attempts_done));
        let random = jitter.next_u64().map_err(BackoffError::Randomness)?;
        let delay_ms = random % ceiling_ms.saturating_add(1);

        state.attempts_done += 1;
        Ok(Duration::from_millis(delay_ms))
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
