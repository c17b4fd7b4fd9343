//! Metrics collection for the wicket gateway.
//!
//! One [`MetricsRegistry`] per engine instance owns every metric family the
//! gateway exposes: the request counters and latency histograms recorded by
//! the server frontend, the per-upstream counters recorded by the proxy
//! pipeline, and the circuit-breaker state gauge driven by breaker
//! transition events. [`snapshot`] carries the serializable report types
//! backing the detailed `/health` endpoint.

mod registry;
pub mod snapshot;

pub use registry::MetricsRegistry;
pub use snapshot::{HealthReport, MemoryReport, ProcessReport, UpstreamReport};
