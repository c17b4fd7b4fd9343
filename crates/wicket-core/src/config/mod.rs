//! Configuration: the route-table file store and process-level env settings.

pub mod env;
pub mod file;

pub use env::{RuntimeMode, Settings};
pub use file::{
    load_routes, parse_routes, LbStrategy, PluginSpec, Route, RouteDefaults, RouteSpec,
};
