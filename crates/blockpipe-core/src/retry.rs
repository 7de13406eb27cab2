//! Retry Logic with Exponential Backoff
//!
//! Retries are driven by an explicit state machine, [`RetryState`], fed with
//! the [`ErrorKind`] of each failed attempt. The state machine answers with a
//! [`RetryDecision`]: either wait `delay` and try again, or give up.
//!
//! ## Schedule
//!
//! ```text
//! Attempt 1: immediate
//! Attempt 2: initial_backoff            (+ rate_limit_cooldown if attempt 1 was throttled)
//! Attempt 3: initial_backoff * mult
//! Attempt 4: initial_backoff * mult^2
//! ...        capped at max_backoff, each delay jittered by ±jitter
//! ```
//!
//! ## Decisions
//!
//! - Non-retryable kinds (`PermanentRequest`, `StorageConflictUnresolvable`,
//!   `BreakerOpen`) give up immediately.
//! - Retryable kinds retry until `max_attempts` attempts have been made.
//! - The first `RateLimited` failure of a sequence adds the fixed
//!   `rate_limit_cooldown` on top of the backoff.
//!
//! ## Example
//!
//! ```ignore
//! use blockpipe_core::retry::{RetryPolicy, retry_with_backoff};
//!
//! let policy = RetryPolicy::default();
//! let rows = retry_with_backoff(&policy, "upsert", || store.upsert(&kind, &records)).await?;
//! ```

use crate::error::{Classified, Error, ErrorKind, Result};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Upper bound for `max_backoff_ms` and `rate_limit_cooldown_ms` (one day).
pub const MAX_DELAY_MS: u64 = 86_400_000;

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    150
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> f64 {
    0.25
}

fn default_rate_limit_cooldown_ms() -> u64 {
    10_000
}

/// Retry policy configuration.
///
/// # Fields
///
/// * `max_attempts` - Total attempts including the first (default: 5)
/// * `initial_backoff_ms` - Delay before the first retry (default: 150ms)
/// * `max_backoff_ms` - Upper bound on any single delay (default: 30s)
/// * `backoff_multiplier` - Exponential growth factor (default: 2.0)
/// * `jitter` - Relative jitter applied to each delay, 0.25 means ±25% (default: 0.25)
/// * `rate_limit_cooldown_ms` - Extra wait after the first throttled attempt (default: 10s)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_jitter")]
    pub jitter: f64,

    #[serde(default = "default_rate_limit_cooldown_ms")]
    pub rate_limit_cooldown_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            rate_limit_cooldown_ms: default_rate_limit_cooldown_ms(),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::InvalidPolicy("max_attempts must be at least 1".to_string()));
        }
        if self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidPolicy(
                "backoff_multiplier must be >= 1.0".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(Error::InvalidPolicy("jitter must be in [0.0, 1.0)".to_string()));
        }
        if self.max_backoff_ms > MAX_DELAY_MS {
            return Err(Error::InvalidPolicy(format!(
                "max_backoff_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }
        if self.rate_limit_cooldown_ms > MAX_DELAY_MS {
            return Err(Error::InvalidPolicy(format!(
                "rate_limit_cooldown_ms must be at most {}",
                MAX_DELAY_MS
            )));
        }
        Ok(())
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rate_limit_cooldown(&self) -> Duration {
        Duration::from_millis(self.rate_limit_cooldown_ms)
    }

    /// Un-jittered delay before retry number `retry` (0-indexed).
    ///
    /// `min(initial_backoff * multiplier^retry, max_backoff)`
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.min(i32::MAX as u32) as i32;
        let backoff_ms = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(exponent);
        if !backoff_ms.is_finite() || backoff_ms >= self.max_backoff_ms as f64 {
            return self.max_backoff();
        }
        Duration::from_millis(backoff_ms as u64)
    }

    /// [`backoff`](Self::backoff) scaled by a random factor in `[1 - jitter, 1 + jitter)`,
    /// still capped at `max_backoff`.
    pub fn jittered_backoff(&self, retry: u32) -> Duration {
        let base = self.backoff(retry);
        if self.jitter <= 0.0 {
            return base;
        }
        let factor = 1.0 - self.jitter + rand::random::<f64>() * 2.0 * self.jitter;
        Duration::try_from_secs_f64(base.as_secs_f64() * factor)
            .unwrap_or(base)
            .min(self.max_backoff())
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Wait `delay`, then make attempt number `next_attempt` (1-indexed).
    Retry { next_attempt: u32, delay: Duration },
    /// Surface the failure.
    GiveUp,
}

/// Retry bookkeeping for one logical operation.
///
/// Attempts within one sequence are strictly sequential: call
/// [`begin_attempt`](Self::begin_attempt) before each try and
/// [`on_failure`](Self::on_failure) after each failed one.
#[derive(Debug)]
pub struct RetryState<'a> {
    policy: &'a RetryPolicy,
    attempts: u32,
    rate_limit_cooled: bool,
}

impl<'a> RetryState<'a> {
    pub fn new(policy: &'a RetryPolicy) -> Self {
        Self {
            policy,
            attempts: 0,
            rate_limit_cooled: false,
        }
    }

    /// Mark the start of an attempt, returning its 1-indexed number.
    pub fn begin_attempt(&mut self) -> u32 {
        self.attempts += 1;
        self.attempts
    }

    /// Attempts made so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn on_failure(&mut self, kind: ErrorKind) -> RetryDecision {
        if !kind.is_retryable() || self.attempts >= self.policy.max_attempts {
            return RetryDecision::GiveUp;
        }

        let mut delay = self
            .policy
            .jittered_backoff(self.attempts.saturating_sub(1));
        if kind == ErrorKind::RateLimited && !self.rate_limit_cooled {
            self.rate_limit_cooled = true;
            delay = delay.saturating_add(self.policy.rate_limit_cooldown());
        }

        RetryDecision::Retry {
            next_attempt: self.attempts + 1,
            delay,
        }
    }
}

/// Retry `operation` per `policy`, classifying failures by their [`ErrorKind`].
///
/// Returns the first success, or the last error once the policy gives up.
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    operation_name: &str,
    mut operation: F,
) -> std::result::Result<T, (E, u32)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: Classified + std::fmt::Display,
{
    let mut state = RetryState::new(policy);

    loop {
        let attempt = state.begin_attempt();
        match operation().await {
            Ok(value) => {
                if attempt > 1 {
                    debug!(operation = operation_name, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) => match state.on_failure(err.kind()) {
                RetryDecision::Retry { next_attempt, delay } => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        next_attempt,
                        backoff_ms = delay.as_millis() as u64,
                        kind = %err.kind(),
                        error = %err,
                        "Retryable error, backing off"
                    );
                    sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        operation = operation_name,
                        attempt,
                        kind = %err.kind(),
                        error = %err,
                        "Giving up"
                    );
                    return Err((err, attempt));
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CallError, StoreError};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 4,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            jitter: 0.0,
            rate_limit_cooldown_ms: 5_000,
        }
    }

    // ---------------------------------------------------------------
    // Backoff arithmetic
    // ---------------------------------------------------------------

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = no_jitter();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
        assert_eq!(policy.backoff(4), Duration::from_millis(1_000));
        assert_eq!(policy.backoff(200), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jittered_backoff_stays_in_bounds() {
        let policy = RetryPolicy {
            jitter: 0.25,
            ..no_jitter()
        };
        for _ in 0..200 {
            let d = policy.jittered_backoff(1);
            assert!(d >= Duration::from_millis(150), "{:?}", d);
            assert!(d <= Duration::from_millis(250), "{:?}", d);
        }
    }

    #[test]
    fn test_validate() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy {
            max_attempts: 0,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            jitter: 1.5,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_validate_bounds_delays() {
        assert!(RetryPolicy {
            max_backoff_ms: MAX_DELAY_MS,
            rate_limit_cooldown_ms: MAX_DELAY_MS,
            ..RetryPolicy::default()
        }
        .validate()
        .is_ok());
        assert!(RetryPolicy {
            max_backoff_ms: u64::MAX,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
        assert!(RetryPolicy {
            rate_limit_cooldown_ms: u64::MAX,
            ..RetryPolicy::default()
        }
        .validate()
        .is_err());
    }

    #[test]
    fn test_extreme_delays_saturate_instead_of_panicking() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff_ms: u64::MAX,
            max_backoff_ms: u64::MAX,
            backoff_multiplier: f64::MAX,
            jitter: 0.9,
            rate_limit_cooldown_ms: u64::MAX,
        };
        for retry in [0, 1, 64, u32::MAX] {
            assert!(policy.jittered_backoff(retry) <= policy.max_backoff());
        }

        let mut state = RetryState::new(&policy);
        state.begin_attempt();
        match state.on_failure(ErrorKind::RateLimited) {
            RetryDecision::Retry { delay, .. } => assert!(delay >= policy.rate_limit_cooldown()),
            RetryDecision::GiveUp => panic!("rate limit should be retried"),
        }
    }

    #[test]
    fn test_serde_defaults() {
        let policy: RetryPolicy = serde_json::from_str("{}").unwrap();
        assert_eq!(policy, RetryPolicy::default());
    }

    // ---------------------------------------------------------------
    // State machine
    // ---------------------------------------------------------------

    #[test]
    fn test_state_gives_up_after_max_attempts() {
        let policy = no_jitter();
        let mut state = RetryState::new(&policy);

        for expected_next in 2..=4 {
            state.begin_attempt();
            match state.on_failure(ErrorKind::Timeout) {
                RetryDecision::Retry { next_attempt, .. } => assert_eq!(next_attempt, expected_next),
                RetryDecision::GiveUp => panic!("gave up too early"),
            }
        }
        state.begin_attempt();
        assert_eq!(state.on_failure(ErrorKind::Timeout), RetryDecision::GiveUp);
        assert_eq!(state.attempts(), 4);
    }

    #[test]
    fn test_state_never_retries_permanent_kinds() {
        let policy = no_jitter();
        for kind in [
            ErrorKind::PermanentRequest,
            ErrorKind::StorageConflictUnresolvable,
            ErrorKind::BreakerOpen,
        ] {
            let mut state = RetryState::new(&policy);
            state.begin_attempt();
            assert_eq!(state.on_failure(kind), RetryDecision::GiveUp);
        }
    }

    #[test]
    fn test_rate_limit_cooldown_applied_once() {
        let policy = no_jitter();
        let mut state = RetryState::new(&policy);

        state.begin_attempt();
        let first = state.on_failure(ErrorKind::RateLimited);
        assert_eq!(
            first,
            RetryDecision::Retry {
                next_attempt: 2,
                delay: Duration::from_millis(5_100)
            }
        );

        state.begin_attempt();
        let second = state.on_failure(ErrorKind::RateLimited);
        assert_eq!(
            second,
            RetryDecision::Retry {
                next_attempt: 3,
                delay: Duration::from_millis(200)
            }
        );
    }

    // ---------------------------------------------------------------
    // retry_with_backoff
    // ---------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_recovers() {
        let policy = no_jitter();
        let calls = AtomicU32::new(0);

        let result = retry_with_backoff(&policy, "flaky", || async {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < 2 {
                Err(StoreError::transient("connection reset"))
            } else {
                Ok(42u64)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_with_backoff_stops_on_permanent() {
        let policy = no_jitter();
        let calls = AtomicU32::new(0);

        let result: std::result::Result<(), _> = retry_with_backoff(&policy, "bad", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(CallError::permanent("invalid params"))
        })
        .await;

        let (err, attempts) = result.unwrap_err();
        assert_eq!(err.kind, ErrorKind::PermanentRequest);
        assert_eq!(attempts, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
