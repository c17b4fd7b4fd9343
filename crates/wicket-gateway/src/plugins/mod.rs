//! Per-route middleware plugins.
//!
//! Plugins are produced by factories held in a compile-time table, looked up
//! by name from the route config. Loaded instances are cached by
//! `(name, params)` so repeated table rebuilds reuse them; the router
//! supervisor calls [`PluginRegistry::reset`] before every rebuild, which is
//! the moral equivalent of clearing a module cache.
//!
//! Name validation runs before any lookup: empty names and names containing
//! `..`, `/` or `\` are rejected outright, preserving the path-traversal
//! guard of the dynamically-loading ancestor even though nothing here
//! touches the filesystem.

pub mod auth;

use async_trait::async_trait;
use axum::response::Response;
use http::{HeaderMap, Method};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use wicket_core::error::{GatewayError, Result};

/// Mutable request view handed to each plugin in the chain.
///
/// Header mutations flow through to the upstream forward; the method and
/// original URI are read-only context.
pub struct RequestContext {
    pub method: Method,
    /// The original client path + query, as received.
    pub uri: String,
    pub headers: HeaderMap,
    pub correlation_id: String,
}

/// What a plugin decided about the request.
pub enum PluginOutcome {
    /// Pass control to the next plugin (or to the forwarder).
    Continue,
    /// Short-circuit: this response goes to the client, nothing is forwarded.
    Respond(Response),
}

/// A per-route middleware instance.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;
    async fn apply(&self, ctx: &mut RequestContext) -> Result<PluginOutcome>;
}

/// A factory turns the route's plugin params into an instance.
pub type PluginFactory = fn(&serde_json::Value) -> Result<Arc<dyn Plugin>>;

/// Registry of factories plus the instance cache.
pub struct PluginRegistry {
    factories: HashMap<&'static str, PluginFactory>,
    cache: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginRegistry {
    /// Registry holding every plugin shipped with the gateway.
    pub fn builtin() -> Self {
        let mut factories: HashMap<&'static str, PluginFactory> = HashMap::new();
        factories.insert(auth::PLUGIN_NAME, auth::factory);
        Self {
            factories,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Rejects empty names and path-traversal shapes.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(GatewayError::PluginLoad {
                name: name.to_string(),
                reason: "plugin name must be a non-empty string".to_string(),
            });
        }
        if name.contains("..") || name.contains('/') || name.contains('\\') {
            return Err(GatewayError::PluginLoad {
                name: name.to_string(),
                reason: "plugin name must not contain path separators".to_string(),
            });
        }
        Ok(())
    }

    /// Loads (or returns the cached) instance for `name` with `params`.
    pub fn load(&self, name: &str, params: &serde_json::Value) -> Result<Arc<dyn Plugin>> {
        Self::validate_name(name)?;

        let key = format!("{name}:{params}");
        if let Some(cached) = self.cache.read().unwrap().get(&key) {
            return Ok(cached.clone());
        }

        let factory = self.factories.get(name).ok_or_else(|| GatewayError::PluginLoad {
            name: name.to_string(),
            reason: "unknown plugin".to_string(),
        })?;
        let instance = factory(params)?;

        self.cache
            .write()
            .unwrap()
            .insert(key, instance.clone());
        Ok(instance)
    }

    /// Drops every cached instance. Called before each table rebuild.
    pub fn reset(&self) {
        self.cache.write().unwrap().clear();
    }

    #[cfg(test)]
    fn cached_len(&self) -> usize {
        self.cache.read().unwrap().len()
    }
}
