//! Batch Caller
//!
//! Executes one logical batch of upstream calls through the cache, the
//! concurrency governor, the circuit breaker and the retry policy.
//!
//! ## Per-request flow
//!
//! ```text
//! cache hit? ──YES──→ return cached result
//!     │
//!     NO
//!     ▼
//! ┌─→ acquire governor slot ──(deadline)──→ Timeout
//! │       ▼
//! │   breaker admits? ──NO──→ BreakerOpen (no attempt consumed)
//! │       ▼
//! │   invoke upstream (per-attempt timeout)
//! │       ▼
//! │   record outcome, report to breaker, release slot, maybe adapt limit
//! │       ▼
//! │   success ──→ cache put, return
//! │       │
//! │   failure ──→ retryable and attempts left? ──NO──→ terminal failure
//! │       │
//! └── wait jittered backoff (+ cooldown on first rate limit)
//! ```
//!
//! ## Batches
//!
//! Duplicate fingerprints in one batch are executed once. Unique requests are
//! split into sub-batches of at most `max_batch_size`, run one after another
//! with `sub_batch_pause` in between; within a sub-batch every request runs
//! concurrently, bounded only by the governor. A failed request never affects
//! its siblings: the batch always resolves every fingerprint, to a success or
//! a classified failure.

use crate::cache::{CacheStats, ResultCache};
use crate::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::config::CallerConfig;
use crate::error::Result;
use crate::governor::{ConcurrencyGovernor, GovernorSnapshot};
use crate::upstream::Upstream;
use blockpipe_core::{
    CallError, CallRequest, CallResult, ErrorKind, Fingerprint, PerformanceRecorder,
    RecorderSnapshot, RetryDecision, RetryState,
};
use blockpipe_observability::metrics::{RPC_CALLS_TOTAL, RPC_LATENCY, RPC_RETRIES_TOTAL};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, sleep_until, timeout_at, Instant};
use tracing::{debug, info, warn};

/// Results of one logical batch, keyed by fingerprint.
#[derive(Debug, Default)]
pub struct BatchResults {
    results: HashMap<Fingerprint, CallResult>,
    duplicates: usize,
}

impl BatchResults {
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<&CallResult> {
        self.results.get(fingerprint)
    }

    /// Result for `request`.
    pub fn for_request(&self, request: &CallRequest) -> Option<&CallResult> {
        self.results.get(&request.fingerprint())
    }

    /// Distinct fingerprints resolved.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Requests that shared a fingerprint with an earlier one in the batch.
    pub fn duplicates(&self) -> usize {
        self.duplicates
    }

    pub fn success_count(&self) -> usize {
        self.results.values().filter(|r| r.is_success()).count()
    }

    pub fn failures(&self) -> impl Iterator<Item = &CallResult> {
        self.results.values().filter(|r| !r.is_success())
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.values().all(CallResult::is_success)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Fingerprint, &CallResult)> {
        self.results.iter()
    }

    pub fn into_map(self) -> HashMap<Fingerprint, CallResult> {
        self.results
    }
}

/// Point-in-time view of the whole batching layer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub calls: RecorderSnapshot,
    pub governor: GovernorSnapshot,
    pub breaker: BreakerSnapshot,
    pub cache: CacheStats,
}

pub struct BatchCaller {
    upstream: Arc<dyn Upstream>,
    config: CallerConfig,
    cache: ResultCache,
    breaker: CircuitBreaker,
    governor: ConcurrencyGovernor,
    recorder: Arc<PerformanceRecorder>,
}

impl BatchCaller {
    pub fn new(upstream: Arc<dyn Upstream>, config: CallerConfig) -> Result<Self> {
        let recorder = Arc::new(config.recorder());
        Self::with_recorder(upstream, config, recorder)
    }

    /// Build a caller that shares `recorder` with other components.
    pub fn with_recorder(
        upstream: Arc<dyn Upstream>,
        config: CallerConfig,
        recorder: Arc<PerformanceRecorder>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            upstream,
            cache: ResultCache::new(config.cache.clone()),
            breaker: CircuitBreaker::new(config.breaker.clone()),
            governor: ConcurrencyGovernor::new(config.governor.clone()),
            recorder,
            config,
        })
    }

    pub fn config(&self) -> &CallerConfig {
        &self.config
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn governor(&self) -> &ConcurrencyGovernor {
        &self.governor
    }

    pub fn recorder(&self) -> &Arc<PerformanceRecorder> {
        &self.recorder
    }

    /// Execute a single request with no deadline.
    pub async fn call(&self, request: &CallRequest) -> CallResult {
        self.execute(request, None).await
    }

    pub async fn call_with_deadline(&self, request: &CallRequest, deadline: Instant) -> CallResult {
        self.execute(request, Some(deadline)).await
    }

    pub async fn call_batch(&self, requests: &[CallRequest]) -> BatchResults {
        self.run_batch(requests, None).await
    }

    /// Like [`call_batch`](Self::call_batch), but every wait (slot, backoff,
    /// in-flight attempt) is cut short at `deadline` with a `Timeout`.
    pub async fn call_batch_with_deadline(
        &self,
        requests: &[CallRequest],
        deadline: Instant,
    ) -> BatchResults {
        self.run_batch(requests, Some(deadline)).await
    }

    async fn run_batch(&self, requests: &[CallRequest], deadline: Option<Instant>) -> BatchResults {
        let mut seen = HashSet::with_capacity(requests.len());
        let unique: Vec<&CallRequest> = requests
            .iter()
            .filter(|r| seen.insert(r.fingerprint()))
            .collect();
        let duplicates = requests.len() - unique.len();
        if duplicates > 0 {
            debug!(requested = requests.len(), unique = unique.len(), "Deduplicated batch");
        }

        let mut results = HashMap::with_capacity(unique.len());
        let pause = self.config.sub_batch_pause();
        for (index, chunk) in unique.chunks(self.config.max_batch_size).enumerate() {
            if index > 0 && !pause.is_zero() {
                let wake = Instant::now() + pause;
                sleep_until(deadline.map_or(wake, |d| wake.min(d))).await;
            }
            let outcomes = join_all(chunk.iter().map(|request| self.execute(request, deadline))).await;
            for result in outcomes {
                results.insert(result.fingerprint(), result);
            }
        }

        let batch = BatchResults {
            results,
            duplicates,
        };
        let failed = batch.len() - batch.success_count();
        if failed > 0 {
            warn!(
                total = batch.len(),
                failed,
                "Batch completed with failures"
            );
        } else {
            debug!(total = batch.len(), "Batch completed");
        }
        batch
    }

    async fn execute(&self, request: &CallRequest, deadline: Option<Instant>) -> CallResult {
        let fingerprint = request.fingerprint();
        if let Some(hit) = self.cache.get(&fingerprint) {
            return hit;
        }

        let method = request.method();
        let mut retry = RetryState::new(&self.config.retry);

        loop {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let err = CallError::timeout("deadline elapsed before the call was sent");
                return self.reject(request, err, retry.attempts());
            }
            let slot = match self.governor.acquire(deadline).await {
                Ok(slot) => slot,
                Err(err) => return self.reject(request, err, retry.attempts()),
            };
            let admission = match self.breaker.try_acquire() {
                Ok(admission) => admission,
                Err(err) => {
                    drop(slot);
                    return self.reject(request, err, retry.attempts());
                }
            };

            let attempt = retry.begin_attempt();
            let started = Instant::now();
            let request_limit = started + self.config.request_timeout();
            let attempt_deadline = deadline.map_or(request_limit, |d| request_limit.min(d));
            let outcome = match timeout_at(
                attempt_deadline,
                self.upstream.invoke(method, request.params()),
            )
            .await
            {
                Ok(outcome) => outcome,
                // Cut short by the caller's deadline: the upstream was not
                // judged, so neither the breaker nor the window sees it.
                Err(_) if attempt_deadline < request_limit => {
                    drop(admission);
                    drop(slot);
                    let err = CallError::timeout(format!(
                        "deadline elapsed after {}ms in flight",
                        started.elapsed().as_millis()
                    ));
                    return self.reject(request, err, attempt);
                }
                Err(_) => Err(CallError::timeout(format!(
                    "no response within {}ms",
                    attempt_deadline.duration_since(started).as_millis()
                ))),
            };
            let latency = started.elapsed();

            let health = outcome.as_ref().map(|_| ()).map_err(|e| e.kind);
            let sequence = self.recorder.record_call(health, latency);
            let tripped = self.breaker.record(admission, health);
            drop(slot);
            self.observe(method, health, latency);

            if tripped && self.config.shrink_governor_on_trip {
                self.governor.shrink();
            }
            if health == Err(ErrorKind::RateLimited)
                || sequence % self.config.adapt_every.max(1) == 0
            {
                self.governor.maybe_adapt(&self.recorder);
            }

            let err = match outcome {
                Ok(payload) => {
                    if attempt > 1 {
                        debug!(fingerprint = %fingerprint, method, attempt, "Call succeeded after retry");
                    }
                    let result = CallResult::success(fingerprint, payload, latency, sequence, attempt);
                    self.cache.put(fingerprint, &result, self.cache.default_ttl());
                    return result;
                }
                Err(err) => err,
            };

            match retry.on_failure(err.kind) {
                RetryDecision::Retry {
                    next_attempt,
                    delay,
                } => {
                    let wake = Instant::now().checked_add(delay);
                    if deadline.is_some_and(|d| !wake.is_some_and(|wake| wake < d)) {
                        debug!(fingerprint = %fingerprint, method, attempt, "Deadline leaves no room for retry");
                        return CallResult::failure(
                            fingerprint,
                            CallError::timeout(format!("deadline reached before retry ({})", err)),
                            latency,
                            sequence,
                            attempt,
                        );
                    }
                    RPC_RETRIES_TOTAL
                        .with_label_values(&[err.kind.as_str()])
                        .inc();
                    warn!(
                        fingerprint = %fingerprint,
                        method,
                        attempt,
                        next_attempt,
                        backoff_ms = delay.as_millis() as u64,
                        kind = %err.kind,
                        "Retryable error, backing off"
                    );
                    sleep(delay).await;
                }
                RetryDecision::GiveUp => {
                    warn!(
                        fingerprint = %fingerprint,
                        method,
                        attempts = attempt,
                        kind = %err.kind,
                        error = %err.message,
                        "Call failed"
                    );
                    return CallResult::failure(fingerprint, err, latency, sequence, attempt);
                }
            }
        }
    }

    /// Resolve a request that was stopped locally (deadline, slot timeout,
    /// breaker open).
    fn reject(&self, request: &CallRequest, err: CallError, attempts: u32) -> CallResult {
        let sequence = self.recorder.record_rejection(err.kind);
        RPC_CALLS_TOTAL
            .with_label_values(&[request.method(), err.kind.as_str()])
            .inc();
        debug!(
            fingerprint = %request.fingerprint(),
            method = request.method(),
            kind = %err.kind,
            "Call rejected locally"
        );
        CallResult::failure(request.fingerprint(), err, Duration::ZERO, sequence, attempts)
    }

    fn observe(&self, method: &str, health: std::result::Result<(), ErrorKind>, latency: Duration) {
        let outcome = match health {
            Ok(()) => "ok",
            Err(kind) => kind.as_str(),
        };
        RPC_CALLS_TOTAL.with_label_values(&[method, outcome]).inc();
        RPC_LATENCY
            .with_label_values(&[method])
            .observe(latency.as_secs_f64());
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            calls: self.recorder.snapshot(),
            governor: self.governor.snapshot(),
            breaker: self.breaker.snapshot(),
            cache: self.cache.stats(),
        }
    }

    /// Log a one-line performance report.
    pub fn log_snapshot(&self) {
        let s = self.snapshot();
        info!(
            calls = s.calls.lifetime.calls,
            success_rate = s.calls.window.success_rate,
            mean_latency_ms = s.calls.window.mean_latency.as_millis() as u64,
            p95_latency_ms = s.calls.window.p95_latency.as_millis() as u64,
            rate_limited = s.calls.window.count(ErrorKind::RateLimited),
            limit = s.governor.limit,
            in_flight = s.governor.in_flight,
            breaker = ?s.breaker.state,
            breaker_trips = s.breaker.trips,
            cache_hit_rate = s.cache.hit_rate,
            "RPC performance"
        );
    }
}
