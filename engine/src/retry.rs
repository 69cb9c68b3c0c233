//! Retry policy and backoff.
//!
//! Every remote operation that can fail transiently (opening a session,
//! downloading one file, uploading one artifact) runs through [`run`], which
//! drives a [`RetryMachine`] over the states
//! Attempting -> Backoff -> Attempting ... -> Succeeded | Exhausted.
//!
//! Decisions are deterministic: no jitter, doubling delays from a base.

use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Default number of attempts per operation (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Default delay before the second attempt.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(2);

/// Attempt limits and backoff shape.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts allowed, first try included
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    pub base_delay: Duration,

    /// Factor applied to the delay after each further failure
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            multiplier: 2,
        }
    }
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    /// Wait before the next attempt (zero when not retrying)
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay,
            ..Default::default()
        }
    }

    /// Delay to wait after attempt `failed_attempt` (1-based) has failed.
    ///
    /// With the defaults: 2s after attempt 1, 4s after 2, 8s after 3.
    pub fn backoff_after(&self, failed_attempt: u32) -> Duration {
        let exponent = failed_attempt.saturating_sub(1);
        let factor = self.multiplier.saturating_pow(exponent);
        self.base_delay.checked_mul(factor).unwrap_or(Duration::MAX)
    }

    /// Decide whether attempt number `attempt` (1-based, the one about to be
    /// made) should happen after `error`.
    ///
    /// Returns `retry == false` when `attempt` exceeds `max_attempts` or the
    /// error is not transient.
    pub fn should_retry(&self, attempt: u32, error: &EngineError) -> RetryDecision {
        if attempt > self.max_attempts || !error.is_retryable() {
            return RetryDecision {
                retry: false,
                delay: Duration::ZERO,
            };
        }
        RetryDecision {
            retry: true,
            delay: self.backoff_after(attempt.saturating_sub(1)),
        }
    }
}

/// State of one logical operation under retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryState {
    /// Attempt `attempt` is (about to be) running
    Attempting { attempt: u32 },
    /// Waiting `delay` before attempt `next_attempt`
    Backoff { next_attempt: u32, delay: Duration },
    /// Gave up after `attempts` attempts
    Exhausted { attempts: u32 },
    /// Completed on attempt `attempts`
    Succeeded { attempts: u32 },
}

/// Explicit state machine for one operation.
#[derive(Debug)]
pub struct RetryMachine<'a> {
    policy: &'a RetryPolicy,
    state: RetryState,
}

impl<'a> RetryMachine<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        RetryMachine {
            policy,
            state: RetryState::Attempting { attempt: 1 },
        }
    }

    pub fn state(&self) -> RetryState {
        self.state
    }

    /// Number of the running attempt, or of the last one made.
    pub fn attempt(&self) -> u32 {
        match self.state {
            RetryState::Attempting { attempt } => attempt,
            RetryState::Backoff { next_attempt, .. } => next_attempt - 1,
            RetryState::Exhausted { attempts } | RetryState::Succeeded { attempts } => attempts,
        }
    }

    /// Attempting -> Succeeded.
    pub fn succeed(&mut self) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            self.state = RetryState::Succeeded { attempts: attempt };
        }
        self.state
    }

    /// Attempting -> Backoff | Exhausted.
    pub fn fail(&mut self, error: &EngineError) -> RetryState {
        if let RetryState::Attempting { attempt } = self.state {
            let decision = self.policy.should_retry(attempt + 1, error);
            self.state = if decision.retry {
                RetryState::Backoff {
                    next_attempt: attempt + 1,
                    delay: decision.delay,
                }
            } else {
                RetryState::Exhausted { attempts: attempt }
            };
        }
        self.state
    }

    /// Backoff -> Attempting, once the delay has elapsed.
    pub fn resume(&mut self) -> RetryState {
        if let RetryState::Backoff { next_attempt, .. } = self.state {
            self.state = RetryState::Attempting {
                attempt: next_attempt,
            };
        }
        self.state
    }
}

/// Blocks the calling flow for a backoff delay.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, delay: Duration);
}

/// Sleeps the current thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, delay: Duration) {
        std::thread::sleep(delay);
    }
}

/// Run `op` under `policy`, sleeping between attempts.
///
/// `op` receives the 1-based attempt number. Returns the first success, or
/// the error of the last attempt once the policy gives up. Non-retryable
/// errors are returned immediately.
pub fn run<T, F>(
    policy: &RetryPolicy,
    sleeper: &dyn Sleeper,
    operation: &str,
    mut op: F,
) -> Result<T, EngineError>
where
    F: FnMut(u32) -> Result<T, EngineError>,
{
    let mut machine = RetryMachine::new(policy);
    loop {
        let attempt = machine.attempt();
        match op(attempt) {
            Ok(value) => {
                machine.succeed();
                if attempt > 1 {
                    info!("{} succeeded on attempt {}", operation, attempt);
                }
                return Ok(value);
            }
            Err(err) => match machine.fail(&err) {
                RetryState::Backoff {
                    next_attempt,
                    delay,
                } => {
                    warn!(
                        "{} failed (attempt {}/{}): {}; retrying in {:?}",
                        operation, attempt, policy.max_attempts, err, delay
                    );
                    sleeper.sleep(delay);
                    machine.resume();
                    debug!("{}: starting attempt {}", operation, next_attempt);
                }
                _ => {
                    if err.is_retryable() {
                        warn!("{} failed after {} attempts: {}", operation, attempt, err);
                    }
                    return Err(err);
                }
            },
        }
    }
}
