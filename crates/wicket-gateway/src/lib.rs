//! The wicket gateway engine.
//!
//! This crate is both planes of the gateway. The data plane accepts client
//! HTTP requests, matches them against the published routing table, runs the
//! route's plugin chain, selects a live upstream, and forwards with retries
//! under per-upstream circuit breakers. The control plane reloads the route
//! table when the config file changes, probes upstream health on its own
//! clock, and exposes the observability surface.
//!
//! # Architecture
//!
//! - [`engine::Gateway`] owns every long-lived component; there are no
//!   process-wide globals.
//! - [`supervisor::RouterSupervisor`] is the single writer of the routing
//!   table, published by atomic pointer swap; request tasks read it without
//!   locking and keep the table they started with across reloads.
//! - [`breaker::BreakerRegistry`] and [`health::HealthMonitor`] track
//!   per-upstream state independently of request traffic.
//! - [`proxy`] composes plugins → breaker gate → selection → forward with
//!   retry/failover, streaming response bodies.
//! - [`server`] is the axum frontend: global middleware plus the probe and
//!   metrics endpoints.

pub mod balancer;
pub mod breaker;
pub mod engine;
pub mod health;
pub mod observability;
pub mod plugins;
pub mod proxy;
pub mod responses;
pub mod server;
pub mod supervisor;
pub mod table;
pub mod watcher;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerState};
pub use engine::Gateway;
pub use health::{HealthConfig, HealthMonitor};
pub use server::{build_router, serve};
pub use supervisor::RouterSupervisor;
pub use table::{RouteEntry, RoutingTable};
pub use watcher::ConfigWatcher;
