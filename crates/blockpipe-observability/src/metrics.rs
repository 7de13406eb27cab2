use lazy_static::lazy_static;
use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
};
use std::sync::Once;

static INIT: Once = Once::new();

lazy_static! {
    /// Global Prometheus metrics registry
    pub static ref REGISTRY: Registry = Registry::new();

    // ============================================================================
    // RPC Call Metrics
    // ============================================================================

    /// Upstream call attempts by method and outcome (`ok` or an error kind)
    pub static ref RPC_CALLS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockpipe_rpc_calls_total", "Total upstream call attempts"),
        &["method", "outcome"]
    ).expect("metric can be created");

    /// Upstream call latency
    pub static ref RPC_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("blockpipe_rpc_latency_seconds", "Upstream call latency in seconds")
            .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["method"]
    ).expect("metric can be created");

    /// Retries scheduled, by the error kind that caused them
    pub static ref RPC_RETRIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockpipe_rpc_retries_total", "Total retries scheduled"),
        &["kind"]
    ).expect("metric can be created");

    /// Cache hits
    pub static ref CACHE_HITS_TOTAL: IntCounter = IntCounter::new(
        "blockpipe_cache_hits_total",
        "Total result cache hits"
    ).expect("metric can be created");

    /// Cache misses
    pub static ref CACHE_MISSES_TOTAL: IntCounter = IntCounter::new(
        "blockpipe_cache_misses_total",
        "Total result cache misses"
    ).expect("metric can be created");

    /// Entries currently resident in the result cache
    pub static ref CACHE_ENTRIES: IntGauge = IntGauge::new(
        "blockpipe_cache_entries",
        "Entries resident in the result cache"
    ).expect("metric can be created");

    // ============================================================================
    // Governor / Breaker Metrics
    // ============================================================================

    /// Current concurrency limit
    pub static ref GOVERNOR_LIMIT: IntGauge = IntGauge::new(
        "blockpipe_governor_limit",
        "Current upstream concurrency limit"
    ).expect("metric can be created");

    /// Calls currently holding a governor slot
    pub static ref GOVERNOR_IN_FLIGHT: IntGauge = IntGauge::new(
        "blockpipe_governor_in_flight",
        "Upstream calls currently in flight"
    ).expect("metric can be created");

    /// Breaker state (0=closed, 1=open, 2=half_open)
    pub static ref BREAKER_STATE: IntGauge = IntGauge::new(
        "blockpipe_breaker_state",
        "Circuit breaker state (0=closed, 1=open, 2=half_open)"
    ).expect("metric can be created");

    /// Breaker trips
    pub static ref BREAKER_TRIPS_TOTAL: IntCounter = IntCounter::new(
        "blockpipe_breaker_trips_total",
        "Total circuit breaker trips"
    ).expect("metric can be created");

    // ============================================================================
    // Export Metrics
    // ============================================================================

    /// Records currently buffered
    pub static ref EXPORT_BUFFERED_RECORDS: IntGauge = IntGauge::new(
        "blockpipe_export_buffered_records",
        "Records buffered awaiting flush"
    ).expect("metric can be created");

    /// Estimated bytes currently buffered
    pub static ref EXPORT_BUFFERED_BYTES: IntGauge = IntGauge::new(
        "blockpipe_export_buffered_bytes",
        "Estimated bytes buffered awaiting flush"
    ).expect("metric can be created");

    /// Flushes by status (complete, partial)
    pub static ref EXPORT_FLUSHES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockpipe_export_flushes_total", "Total export flushes"),
        &["status"]
    ).expect("metric can be created");

    /// Rows committed by record kind
    pub static ref EXPORT_ROWS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockpipe_export_rows_total", "Total rows committed"),
        &["kind"]
    ).expect("metric can be created");

    /// Failed partition writes
    pub static ref EXPORT_FAILED_PARTITIONS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("blockpipe_export_failed_partitions_total", "Total failed partition writes"),
        &["kind", "error_type"]
    ).expect("metric can be created");

    /// Flush duration
    pub static ref EXPORT_FLUSH_LATENCY: HistogramVec = HistogramVec::new(
        HistogramOpts::new("blockpipe_export_flush_seconds", "Flush duration in seconds")
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
        &["status"]
    ).expect("metric can be created");
}

/// Register every metric with [`REGISTRY`]. Safe to call more than once.
pub fn init() {
    INIT.call_once(|| {
        // RPC call metrics
        REGISTRY
            .register(Box::new(RPC_CALLS_TOTAL.clone()))
            .expect("rpc_calls_total can be registered");
        REGISTRY
            .register(Box::new(RPC_LATENCY.clone()))
            .expect("rpc_latency can be registered");
        REGISTRY
            .register(Box::new(RPC_RETRIES_TOTAL.clone()))
            .expect("rpc_retries_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_HITS_TOTAL.clone()))
            .expect("cache_hits_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_MISSES_TOTAL.clone()))
            .expect("cache_misses_total can be registered");
        REGISTRY
            .register(Box::new(CACHE_ENTRIES.clone()))
            .expect("cache_entries can be registered");

        // Governor / breaker metrics
        REGISTRY
            .register(Box::new(GOVERNOR_LIMIT.clone()))
            .expect("governor_limit can be registered");
        REGISTRY
            .register(Box::new(GOVERNOR_IN_FLIGHT.clone()))
            .expect("governor_in_flight can be registered");
        REGISTRY
            .register(Box::new(BREAKER_STATE.clone()))
            .expect("breaker_state can be registered");
        REGISTRY
            .register(Box::new(BREAKER_TRIPS_TOTAL.clone()))
            .expect("breaker_trips_total can be registered");

        // Export metrics
        REGISTRY
            .register(Box::new(EXPORT_BUFFERED_RECORDS.clone()))
            .expect("export_buffered_records can be registered");
        REGISTRY
            .register(Box::new(EXPORT_BUFFERED_BYTES.clone()))
            .expect("export_buffered_bytes can be registered");
        REGISTRY
            .register(Box::new(EXPORT_FLUSHES_TOTAL.clone()))
            .expect("export_flushes_total can be registered");
        REGISTRY
            .register(Box::new(EXPORT_ROWS_TOTAL.clone()))
            .expect("export_rows_total can be registered");
        REGISTRY
            .register(Box::new(EXPORT_FAILED_PARTITIONS_TOTAL.clone()))
            .expect("export_failed_partitions_total can be registered");
        REGISTRY
            .register(Box::new(EXPORT_FLUSH_LATENCY.clone()))
            .expect("export_flush_latency can be registered");
    });
}
