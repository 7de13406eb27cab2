//! Adaptive Concurrency Governor
//!
//! Bounds the number of upstream calls in flight and moves that bound with
//! observed outcomes (AIMD):
//!
//! ```text
//! rate-limit burst in window      → limit = max(limit / 2, min_limit)
//! window of all successes         → limit = min(limit + increase_step, max_limit)
//! anything else                   → unchanged
//! ```
//!
//! The decision itself is the pure [`GovernorConfig::next_limit`]; the
//! governor only decides *when* to evaluate it (at most once per
//! `adjust_cooldown`, over samples recorded since the previous adjustment).
//!
//! Limit changes apply to newly acquired slots. Permits already handed out
//! stay valid until dropped, so in-flight may briefly exceed a freshly
//! lowered limit.

use blockpipe_core::{CallError, ErrorKind, PerformanceRecorder, WindowStats};
use blockpipe_observability::metrics::{GOVERNOR_IN_FLIGHT, GOVERNOR_LIMIT};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::info;

fn default_initial_limit() -> u32 {
    8
}

fn default_min_limit() -> u32 {
    1
}

fn default_max_limit() -> u32 {
    8
}

fn default_rate_limit_burst() -> u64 {
    3
}

fn default_success_window() -> u64 {
    50
}

fn default_increase_step() -> u32 {
    1
}

fn default_adjust_cooldown_ms() -> u64 {
    5_000
}

/// Governor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Limit at startup (default: 8)
    #[serde(default = "default_initial_limit")]
    pub initial_limit: u32,

    /// Floor (default: 1)
    #[serde(default = "default_min_limit")]
    pub min_limit: u32,

    /// Ceiling (default: 8)
    #[serde(default = "default_max_limit")]
    pub max_limit: u32,

    /// Rate-limited samples in one window that count as a burst (default: 3)
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u64,

    /// Consecutive-window successes needed before raising the limit (default: 50)
    #[serde(default = "default_success_window")]
    pub success_window: u64,

    /// Additive increase (default: 1)
    #[serde(default = "default_increase_step")]
    pub increase_step: u32,

    /// Minimum time between two adjustments (default: 5s)
    #[serde(default = "default_adjust_cooldown_ms")]
    pub adjust_cooldown_ms: u64,
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            initial_limit: default_initial_limit(),
            min_limit: default_min_limit(),
            max_limit: default_max_limit(),
            rate_limit_burst: default_rate_limit_burst(),
            success_window: default_success_window(),
            increase_step: default_increase_step(),
            adjust_cooldown_ms: default_adjust_cooldown_ms(),
        }
    }
}

impl GovernorConfig {
    pub fn adjust_cooldown(&self) -> Duration {
        Duration::from_millis(self.adjust_cooldown_ms)
    }

    fn clamp(&self, limit: u32) -> u32 {
        limit.clamp(self.min_limit, self.max_limit.max(self.min_limit))
    }

    /// Pure adaptation step: the limit to use given `stats` observed at `current`.
    ///
    /// The result is always within `[min_limit, max_limit]`.
    pub fn next_limit(&self, stats: &WindowStats, current: u32) -> u32 {
        let rate_limited = stats.count(ErrorKind::RateLimited);
        if rate_limited > 0 && rate_limited >= self.rate_limit_burst {
            return self.clamp(current / 2);
        }
        if stats.failures == 0 && stats.successes >= self.success_window.max(1) {
            return self.clamp(current.saturating_add(self.increase_step));
        }
        self.clamp(current)
    }
}

/// Direction of a limit change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitChange {
    Decreased { from: u32, to: u32 },
    Increased { from: u32, to: u32 },
}

/// Governor state for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GovernorSnapshot {
    pub limit: u32,
    pub in_flight: u32,
    pub min_limit: u32,
    pub max_limit: u32,
    pub increases: u64,
    pub decreases: u64,
}

#[derive(Debug)]
struct GovernorState {
    limit: u32,
    in_flight: u32,
    last_adjust: Option<Instant>,
    window_start: u64,
    increases: u64,
    decreases: u64,
}

#[derive(Debug)]
struct Shared {
    config: GovernorConfig,
    state: Mutex<GovernorState>,
    released: Notify,
}

/// One upstream concurrency slot. Released on drop.
#[derive(Debug)]
pub struct GovernorPermit {
    shared: Arc<Shared>,
}

impl Drop for GovernorPermit {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        GOVERNOR_IN_FLIGHT.set(state.in_flight as i64);
        let free = state.in_flight < state.limit;
        drop(state);
        if free {
            self.shared.released.notify_one();
        }
    }
}

#[derive(Debug, Clone)]
pub struct ConcurrencyGovernor {
    shared: Arc<Shared>,
}

impl ConcurrencyGovernor {
    pub fn new(config: GovernorConfig) -> Self {
        let limit = config.clamp(config.initial_limit);
        GOVERNOR_LIMIT.set(limit as i64);
        Self {
            shared: Arc::new(Shared {
                config,
                state: Mutex::new(GovernorState {
                    limit,
                    in_flight: 0,
                    last_adjust: None,
                    window_start: 0,
                    increases: 0,
                    decreases: 0,
                }),
                released: Notify::new(),
            }),
        }
    }

    pub fn config(&self) -> &GovernorConfig {
        &self.shared.config
    }

    /// Wait for a slot.
    ///
    /// With a deadline, fails with a `Timeout` classification once it passes.
    pub async fn acquire(&self, deadline: Option<Instant>) -> Result<GovernorPermit, CallError> {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(CallError::timeout("deadline elapsed before requesting a concurrency slot"));
        }
        loop {
            let released = self.shared.released.notified();
            tokio::pin!(released);
            released.as_mut().enable();

            if let Some(permit) = self.try_acquire() {
                return Ok(permit);
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Err(CallError::timeout("deadline elapsed waiting for a concurrency slot"));
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, released).await.is_err() {
                        return Err(CallError::timeout(
                            "deadline elapsed waiting for a concurrency slot",
                        ));
                    }
                }
                None => released.await,
            }
        }
    }

    /// Take a slot if one is free right now.
    pub fn try_acquire(&self) -> Option<GovernorPermit> {
        let mut state = self.shared.state.lock();
        if state.in_flight >= state.limit {
            return None;
        }
        state.in_flight += 1;
        GOVERNOR_IN_FLIGHT.set(state.in_flight as i64);
        Some(GovernorPermit {
            shared: Arc::clone(&self.shared),
        })
    }

    pub fn limit(&self) -> u32 {
        self.shared.state.lock().limit
    }

    pub fn in_flight(&self) -> u32 {
        self.shared.state.lock().in_flight
    }

    /// Apply [`GovernorConfig::next_limit`] to `stats` unconditionally.
    pub fn adapt(&self, stats: &WindowStats) -> Option<LimitChange> {
        let mut state = self.shared.state.lock();
        let next = self.shared.config.next_limit(stats, state.limit);
        let change = self.apply(&mut state, next);
        if stats.latest_sequence > state.window_start && change.is_some() {
            state.window_start = stats.latest_sequence;
        }
        drop(state);
        self.wake_if_increased(change);
        change
    }

    /// Evaluate the samples recorded since the last adjustment, unless the
    /// adjustment cooldown is still running.
    pub fn maybe_adapt(&self, recorder: &PerformanceRecorder) -> Option<LimitChange> {
        let now = Instant::now();
        let mut state = self.shared.state.lock();
        if state
            .last_adjust
            .is_some_and(|at| now.duration_since(at) < self.shared.config.adjust_cooldown())
        {
            return None;
        }

        let stats = recorder.window_since(state.window_start);
        let next = self.shared.config.next_limit(&stats, state.limit);
        let change = self.apply(&mut state, next);

        // Start a fresh window after a change, or once a full window has
        // been judged without one.
        if change.is_some() || stats.samples >= self.shared.config.success_window.max(1) {
            state.window_start = stats.latest_sequence.max(state.window_start);
        }
        drop(state);
        self.wake_if_increased(change);
        change
    }

    /// Halve the limit immediately (used when the breaker trips).
    pub fn shrink(&self) -> Option<LimitChange> {
        let mut state = self.shared.state.lock();
        let next = self.shared.config.clamp(state.limit / 2);
        self.apply(&mut state, next)
    }

    fn apply(&self, state: &mut GovernorState, next: u32) -> Option<LimitChange> {
        let from = state.limit;
        if next == from {
            return None;
        }
        state.limit = next;
        state.last_adjust = Some(Instant::now());
        GOVERNOR_LIMIT.set(next as i64);

        let change = if next < from {
            state.decreases += 1;
            LimitChange::Decreased { from, to: next }
        } else {
            state.increases += 1;
            LimitChange::Increased { from, to: next }
        };
        info!(from, to = next, in_flight = state.in_flight, "Concurrency limit adjusted");
        Some(change)
    }

    fn wake_if_increased(&self, change: Option<LimitChange>) {
        if matches!(change, Some(LimitChange::Increased { .. })) {
            self.shared.released.notify_waiters();
        }
    }

    pub fn snapshot(&self) -> GovernorSnapshot {
        let state = self.shared.state.lock();
        GovernorSnapshot {
            limit: state.limit,
            in_flight: state.in_flight,
            min_limit: self.shared.config.min_limit,
            max_limit: self.shared.config.max_limit,
            increases: state.increases,
            decreases: state.decreases,
        }
    }
}
