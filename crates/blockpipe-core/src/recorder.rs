//! Rolling performance statistics.
//!
//! [`PerformanceRecorder`] keeps the last `capacity` call outcomes in a ring of
//! atomic slots plus lifetime counters. Recording never takes a lock; all
//! aggregation (success rate, latency percentiles, per-kind counts) happens
//! when a reader asks for a [`WindowStats`] or [`RecorderSnapshot`].
//!
//! Each slot packs the outcome code and the latency into one `u64` and is
//! tagged with the sequence number that wrote it. A reader only accepts a slot
//! whose tag is unchanged across the read, so a slot being overwritten
//! concurrently is skipped rather than misread.

use crate::error::ErrorKind;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const SUCCESS_CODE: u64 = 0;
const LATENCY_BITS: u32 = 56;
const LATENCY_MASK: u64 = (1 << LATENCY_BITS) - 1;
const KIND_SLOTS: usize = ErrorKind::ALL.len();

fn outcome_code(outcome: Result<(), ErrorKind>) -> u64 {
    match outcome {
        Ok(()) => SUCCESS_CODE,
        Err(kind) => kind.index() as u64 + 1,
    }
}

fn pack(code: u64, latency: Duration) -> u64 {
    let micros = (latency.as_micros() as u64).min(LATENCY_MASK);
    (code << LATENCY_BITS) | micros
}

fn unpack(packed: u64) -> (u64, Duration) {
    (packed >> LATENCY_BITS, Duration::from_micros(packed & LATENCY_MASK))
}

struct Slot {
    seq: AtomicU64,
    packed: AtomicU64,
}

/// Aggregates over the samples of one window.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub samples: u64,
    pub successes: u64,
    pub failures: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    pub success_rate: f64,
    pub mean_latency: Duration,
    pub p50_latency: Duration,
    pub p95_latency: Duration,
    pub p99_latency: Duration,
    /// Highest sequence number included in the window.
    pub latest_sequence: u64,
}

impl WindowStats {
    pub fn count(&self, kind: ErrorKind) -> u64 {
        self.by_kind.get(&kind).copied().unwrap_or(0)
    }
}

/// Lifetime totals since the recorder was created.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LifetimeStats {
    pub calls: u64,
    pub successes: u64,
    pub by_kind: BTreeMap<ErrorKind, u64>,
    /// Local rejections (breaker open, slot wait timeouts); never reached upstream.
    pub rejections: BTreeMap<ErrorKind, u64>,
    pub mean_latency: Duration,
}

/// Totals for export flushes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FlushStats {
    pub flushes: u64,
    pub committed_rows: u64,
    pub committed_partitions: u64,
    pub failed_partitions: u64,
    pub total_flush_time: Duration,
}

impl FlushStats {
    pub fn mean_flush_time(&self) -> Duration {
        if self.flushes == 0 {
            Duration::ZERO
        } else {
            self.total_flush_time / self.flushes as u32
        }
    }
}

/// Point-in-time view for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RecorderSnapshot {
    pub window: WindowStats,
    pub lifetime: LifetimeStats,
    pub flushes: FlushStats,
}

pub struct PerformanceRecorder {
    slots: Box<[Slot]>,
    next_seq: AtomicU64,
    calls: AtomicU64,
    successes: AtomicU64,
    failures_by_kind: [AtomicU64; KIND_SLOTS],
    rejections_by_kind: [AtomicU64; KIND_SLOTS],
    total_latency_micros: AtomicU64,
    flushes: AtomicU64,
    committed_rows: AtomicU64,
    committed_partitions: AtomicU64,
    failed_partitions: AtomicU64,
    flush_micros: AtomicU64,
}

impl std::fmt::Debug for PerformanceRecorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerformanceRecorder")
            .field("capacity", &self.slots.len())
            .field("latest_sequence", &self.latest_sequence())
            .finish()
    }
}

impl Default for PerformanceRecorder {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl PerformanceRecorder {
    /// Create a recorder keeping the last `capacity` samples (at least 1).
    pub fn new(capacity: usize) -> Self {
        let slots = (0..capacity.max(1))
            .map(|_| Slot {
                seq: AtomicU64::new(0),
                packed: AtomicU64::new(0),
            })
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self {
            slots,
            next_seq: AtomicU64::new(0),
            calls: AtomicU64::new(0),
            successes: AtomicU64::new(0),
            failures_by_kind: Default::default(),
            rejections_by_kind: Default::default(),
            total_latency_micros: AtomicU64::new(0),
            flushes: AtomicU64::new(0),
            committed_rows: AtomicU64::new(0),
            committed_partitions: AtomicU64::new(0),
            failed_partitions: AtomicU64::new(0),
            flush_micros: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Highest sequence number handed out so far.
    pub fn latest_sequence(&self) -> u64 {
        self.next_seq.load(Ordering::Acquire)
    }

    /// Record one upstream call outcome. Returns its sequence number.
    pub fn record_call(&self, outcome: Result<(), ErrorKind>, latency: Duration) -> u64 {
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel) + 1;
        let slot = &self.slots[((seq - 1) % self.slots.len() as u64) as usize];

        slot.seq.store(0, Ordering::Release);
        slot.packed
            .store(pack(outcome_code(outcome), latency), Ordering::Release);
        slot.seq.store(seq, Ordering::Release);

        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_latency_micros
            .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
        match outcome {
            Ok(()) => {
                self.successes.fetch_add(1, Ordering::Relaxed);
            }
            Err(kind) => {
                self.failures_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
            }
        }
        seq
    }

    /// Record a call rejected locally without contacting upstream.
    ///
    /// Consumes a sequence number but stays out of the rolling window, so
    /// local decisions never skew upstream latency or success rate.
    pub fn record_rejection(&self, kind: ErrorKind) -> u64 {
        self.rejections_by_kind[kind.index()].fetch_add(1, Ordering::Relaxed);
        self.next_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn record_flush(
        &self,
        committed_partitions: u64,
        committed_rows: u64,
        failed_partitions: u64,
        elapsed: Duration,
    ) {
        self.flushes.fetch_add(1, Ordering::Relaxed);
        self.committed_partitions
            .fetch_add(committed_partitions, Ordering::Relaxed);
        self.committed_rows.fetch_add(committed_rows, Ordering::Relaxed);
        self.failed_partitions
            .fetch_add(failed_partitions, Ordering::Relaxed);
        self.flush_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Aggregate all retained samples with a sequence number above `since`.
    pub fn window_since(&self, since: u64) -> WindowStats {
        let latest = self.latest_sequence();
        let oldest_retained = latest.saturating_sub(self.slots.len() as u64);
        let floor = since.max(oldest_retained);

        let mut stats = WindowStats::default();
        let mut latencies = Vec::with_capacity(self.slots.len());
        let mut total_micros: u128 = 0;

        for slot in self.slots.iter() {
            let before = slot.seq.load(Ordering::Acquire);
            if before == 0 || before <= floor || before > latest {
                continue;
            }
            let packed = slot.packed.load(Ordering::Acquire);
            if slot.seq.load(Ordering::Acquire) != before {
                continue;
            }

            let (code, latency) = unpack(packed);
            stats.samples += 1;
            stats.latest_sequence = stats.latest_sequence.max(before);
            if code == SUCCESS_CODE {
                stats.successes += 1;
            } else if let Some(kind) = ErrorKind::ALL.get((code - 1) as usize) {
                stats.failures += 1;
                *stats.by_kind.entry(*kind).or_insert(0) += 1;
            }
            total_micros += latency.as_micros();
            latencies.push(latency);
        }

        if stats.samples > 0 {
            stats.success_rate = stats.successes as f64 / stats.samples as f64;
            stats.mean_latency = Duration::from_micros((total_micros / stats.samples as u128) as u64);
            latencies.sort_unstable();
            stats.p50_latency = percentile(&latencies, 0.50);
            stats.p95_latency = percentile(&latencies, 0.95);
            stats.p99_latency = percentile(&latencies, 0.99);
        }
        stats
    }

    pub fn lifetime(&self) -> LifetimeStats {
        let calls = self.calls.load(Ordering::Relaxed);
        let collect = |counters: &[AtomicU64; KIND_SLOTS]| {
            ErrorKind::ALL
                .iter()
                .filter_map(|kind| {
                    let n = counters[kind.index()].load(Ordering::Relaxed);
                    (n > 0).then_some((*kind, n))
                })
                .collect::<BTreeMap<_, _>>()
        };
        let mean_latency = if calls == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(self.total_latency_micros.load(Ordering::Relaxed) / calls)
        };
        LifetimeStats {
            calls,
            successes: self.successes.load(Ordering::Relaxed),
            by_kind: collect(&self.failures_by_kind),
            rejections: collect(&self.rejections_by_kind),
            mean_latency,
        }
    }

    pub fn flush_stats(&self) -> FlushStats {
        FlushStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            committed_rows: self.committed_rows.load(Ordering::Relaxed),
            committed_partitions: self.committed_partitions.load(Ordering::Relaxed),
            failed_partitions: self.failed_partitions.load(Ordering::Relaxed),
            total_flush_time: Duration::from_micros(self.flush_micros.load(Ordering::Relaxed)),
        }
    }

    pub fn snapshot(&self) -> RecorderSnapshot {
        RecorderSnapshot {
            window: self.window_since(0),
            lifetime: self.lifetime(),
            flushes: self.flush_stats(),
        }
    }
}

fn percentile(sorted: &[Duration], q: f64) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = ((sorted.len() as f64 * q).ceil() as usize).clamp(1, sorted.len());
    sorted[rank - 1]
}
