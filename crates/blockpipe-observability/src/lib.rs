//! blockpipe observability
//!
//! Prometheus metrics for the call-batching layer and the export pipeline,
//! plus an axum router exposing them alongside health and readiness probes.
//!
//! # Usage
//!
//! ```no_run
//! use blockpipe_observability::{exporter, metrics};
//!
//! metrics::init();
//! let router = exporter::create_metrics_router(None);
//! ```

pub mod exporter;
pub mod metrics;

pub use exporter::{create_metrics_router, ReadinessCheck};
pub use metrics::{init as init_metrics, REGISTRY};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_accessible_after_init() {
        init_metrics();
        let _registry = &*REGISTRY;
    }
}
