//! Shared model and leaf engines for the wicket API gateway.
//!
//! This crate holds everything the data plane and the binary both need but
//! that carries no proxying logic of its own:
//!
//! - [`config`]: the route-table file store and validated env settings
//! - [`error`]: the gateway error taxonomy and transport classification
//! - [`retry`]: the exponential-backoff retry driver
//! - [`rate_limit`]: the fixed-window limiter with shared-store fallback
//! - [`correlation`]: correlation-id extraction and propagation rules
//!
//! The proxy pipeline, circuit breakers, health monitoring, and the HTTP
//! frontend live in `wicket-gateway`.

pub mod config;
pub mod correlation;
pub mod error;
pub mod rate_limit;
pub mod retry;

pub use config::{LbStrategy, PluginSpec, Route, RouteDefaults, RuntimeMode, Settings};
pub use error::{GatewayError, Result, TransportCode};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
pub use retry::RetryPolicy;
