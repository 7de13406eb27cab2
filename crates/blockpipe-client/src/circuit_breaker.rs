//! Circuit Breaker for Upstream Calls
//!
//! Sheds load while upstream is unhealthy. Three states:
//!
//! - **Closed**: calls pass through
//! - **Open**: calls fail fast with `BreakerOpen` without contacting upstream
//! - **HalfOpen**: a single probe call is let through
//!
//! ## State Transitions
//!
//! ```text
//! ┌────────┐  consecutive faults >= threshold  ┌──────┐
//! │ Closed │ ────────────────────────────────> │ Open │ <──┐
//! └───┬────┘                                   └───┬──┘    │
//!     ▲                                            │       │ probe fails
//!     │ probe succeeds                   cooldown  │       │ (cooldown restarts)
//!     │                                  elapsed   ▼       │
//!     │                                   ┌──────────┐     │
//!     └────────────────────────────────── │ HalfOpen │ ────┘
//!                                         └──────────┘
//! ```
//!
//! ## What Counts as a Fault
//!
//! Only outcomes that reflect upstream health: `RateLimited`, `Timeout` and
//! `TransientUpstream`. A `PermanentRequest` proves upstream answered and
//! counts as healthy. A `BreakerOpen` rejection never reaches upstream and is
//! not reported at all, so rejections never extend the cooldown.
//!
//! ## Probes
//!
//! Admission hands out a [`BreakerPermit`]. In HalfOpen exactly one permit is
//! a probe; until it is resolved every other caller is rejected. Dropping an
//! unresolved probe permit (caller cancelled) frees the probe slot again.

use blockpipe_core::{CallError, ErrorKind};
use blockpipe_observability::metrics::{BREAKER_STATE, BREAKER_TRIPS_TOTAL};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

fn default_failure_threshold() -> u32 {
    10
}

fn default_cooldown_ms() -> u64 {
    60_000
}

/// Configuration for the circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive upstream faults before opening (default: 10)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Time spent open before a probe is allowed (default: 60s)
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_ms: default_cooldown_ms(),
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

#[derive(Debug)]
struct Shared {
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    trips: AtomicU64,
}

/// Breaker state for monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub trips: u64,
}

/// Admission ticket for one upstream attempt.
#[derive(Debug)]
pub struct BreakerPermit {
    shared: Arc<Shared>,
    probe: bool,
    resolved: bool,
}

impl BreakerPermit {
    pub fn is_probe(&self) -> bool {
        self.probe
    }
}

impl Drop for BreakerPermit {
    fn drop(&mut self) {
        if self.probe && !self.resolved {
            let mut inner = self.shared.inner.lock();
            if inner.state == CircuitState::HalfOpen {
                inner.probe_in_flight = false;
            }
        }
    }
}

/// Circuit breaker shared by every caller of one upstream.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    shared: Arc<Shared>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                inner: Mutex::new(BreakerInner {
                    state: CircuitState::Closed,
                    consecutive_failures: 0,
                    opened_at: None,
                    probe_in_flight: false,
                }),
                trips: AtomicU64::new(0),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(BreakerConfig::default())
    }

    /// Ask to contact upstream.
    ///
    /// Fails with `BreakerOpen` while open (cooldown running) or while a
    /// half-open probe is already in flight.
    pub fn try_acquire(&self) -> Result<BreakerPermit, CallError> {
        let mut inner = self.shared.inner.lock();
        let probe = match inner.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let cooled = inner
                    .opened_at
                    .map_or(true, |at| at.elapsed() >= self.shared.config.cooldown());
                if !cooled {
                    return Err(CallError::breaker_open());
                }
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = true;
                BREAKER_STATE.set(CircuitState::HalfOpen as i64);
                info!("Circuit breaker half-open, sending probe");
                true
            }
            CircuitState::HalfOpen => {
                if inner.probe_in_flight {
                    return Err(CallError::breaker_open());
                }
                inner.probe_in_flight = true;
                true
            }
        };

        Ok(BreakerPermit {
            shared: Arc::clone(&self.shared),
            probe,
            resolved: false,
        })
    }

    /// Report the outcome of an admitted attempt.
    ///
    /// Returns `true` if this outcome opened the breaker.
    pub fn record(&self, mut permit: BreakerPermit, outcome: Result<(), ErrorKind>) -> bool {
        permit.resolved = true;
        let fault = matches!(outcome, Err(kind) if kind.is_upstream_fault());
        let mut inner = self.shared.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                if !fault {
                    inner.consecutive_failures = 0;
                    return false;
                }
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.shared.config.failure_threshold {
                    let failures = inner.consecutive_failures;
                    self.trip(&mut inner);
                    warn!(
                        consecutive_failures = failures,
                        cooldown_ms = self.shared.config.cooldown_ms,
                        "Circuit breaker opened"
                    );
                    return true;
                }
                false
            }
            CircuitState::HalfOpen if permit.probe => {
                inner.probe_in_flight = false;
                if fault {
                    self.trip(&mut inner);
                    warn!(kind = ?outcome.err(), "Probe failed, circuit breaker re-opened");
                    true
                } else {
                    inner.state = CircuitState::Closed;
                    inner.consecutive_failures = 0;
                    inner.opened_at = None;
                    BREAKER_STATE.set(CircuitState::Closed as i64);
                    info!("Probe succeeded, circuit breaker closed");
                    false
                }
            }
            // Late results from calls admitted before the trip.
            CircuitState::HalfOpen | CircuitState::Open => false,
        }
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(Instant::now());
        inner.consecutive_failures = 0;
        inner.probe_in_flight = false;
        self.shared.trips.fetch_add(1, Ordering::Relaxed);
        BREAKER_TRIPS_TOTAL.inc();
        BREAKER_STATE.set(CircuitState::Open as i64);
    }

    pub fn state(&self) -> CircuitState {
        self.shared.inner.lock().state
    }

    pub fn failure_count(&self) -> u32 {
        self.shared.inner.lock().consecutive_failures
    }

    /// Times the breaker has opened, including re-opens after a failed probe.
    pub fn trips(&self) -> u64 {
        self.shared.trips.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.shared.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            trips: self.trips(),
        }
    }

    /// Force the breaker closed.
    pub fn reset(&self) {
        let mut inner = self.shared.inner.lock();
        inner.state = CircuitState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
        BREAKER_STATE.set(CircuitState::Closed as i64);
    }
}
