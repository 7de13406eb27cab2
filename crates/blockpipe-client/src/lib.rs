//! blockpipe client
//!
//! Resilient batched calls against a rate-limited, latency-variable node.
//!
//! ## Components
//!
//! - [`ResultCache`]: TTL + LRU memo of successful idempotent reads
//! - [`CircuitBreaker`]: fail-fast while upstream is unhealthy, single-probe recovery
//! - [`ConcurrencyGovernor`]: adaptive bound on in-flight calls
//! - [`BatchCaller`]: composes the above with retries and deadlines
//! - [`JsonRpcUpstream`]: JSON-RPC 2.0 over HTTP
//!
//! ## Example
//!
//! ```ignore
//! use blockpipe_client::{BatchCaller, CallerConfig, JsonRpcUpstream};
//! use blockpipe_core::CallRequest;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let config = CallerConfig::default();
//! let upstream = Arc::new(JsonRpcUpstream::new("http://localhost:8545", config.request_timeout())?);
//! let caller = BatchCaller::new(upstream, config)?;
//!
//! let requests: Vec<_> = (0..1000u64)
//!     .map(|n| CallRequest::new("eth_getBlockByNumber", vec![json!(format!("0x{:x}", n)), json!(true)]))
//!     .collect();
//! let results = caller.call_batch(&requests).await;
//! for request in &requests {
//!     match results.for_request(request).map(|r| r.outcome()) {
//!         Some(Ok(block)) => { /* decode */ }
//!         Some(Err(err)) => tracing::warn!(%err, "block fetch failed"),
//!         None => unreachable!(),
//!     }
//! }
//! ```

pub mod cache;
pub mod caller;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod governor;
pub mod upstream;

pub use cache::{CacheConfig, CacheStats, ResultCache};
pub use caller::{BatchCaller, BatchResults, HealthSnapshot};
pub use circuit_breaker::{BreakerConfig, BreakerPermit, BreakerSnapshot, CircuitBreaker, CircuitState};
pub use config::CallerConfig;
pub use error::{ClientError, Result};
pub use governor::{ConcurrencyGovernor, GovernorConfig, GovernorPermit, GovernorSnapshot, LimitChange};
pub use upstream::{JsonRpcUpstream, Upstream};
