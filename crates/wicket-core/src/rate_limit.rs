//! Fixed-window rate limiting keyed by client identity.
//!
//! Two backends share one interface: a process-local map of per-key window
//! counters, and an optional shared store (redis) so several gateway replicas
//! count against the same windows. The backend is chosen once at startup: if
//! the shared store cannot be reached within a short timeout the limiter
//! falls back to the in-process map for the life of the process. A shared
//! store error at request time fails open rather than failing the request.
//!
//! Observability paths are exempt unconditionally so probes are never
//! throttled.

use crate::error::Result;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Paths never counted against any window.
pub const EXEMPT_PATHS: [&str; 5] = ["/health", "/metrics", "/livez", "/readyz", "/startupz"];

/// Key prefix in the shared store, so replicas converge on the same counters.
const STORE_KEY_PREFIX: &str = "wicket:rl:";

/// Startup budget for reaching the shared store.
const STORE_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Forwarded-for values longer than this are rejected for key derivation.
const MAX_KEY_HEADER_LEN: usize = 128;

/// Returns whether `path` is exempt from rate limiting.
pub fn is_exempt_path(path: &str) -> bool {
    EXEMPT_PATHS.contains(&path)
}

/// Fixed-window parameters.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub window: Duration,
    pub max_requests: u64,
}

impl RateLimitConfig {
    pub fn new(window: Duration, max_requests: u64) -> Self {
        Self {
            window,
            max_requests,
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            max_requests: 100,
        }
    }
}

/// Outcome of a limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RateLimitDecision::Allowed => None,
            RateLimitDecision::Limited { retry_after } => Some(*retry_after),
        }
    }
}

/// One key's counter within the current window.
#[derive(Debug)]
struct WindowCounter {
    window_start: Instant,
    count: u64,
}

enum Backend {
    Memory {
        buckets: RwLock<HashMap<String, WindowCounter>>,
        last_cleanup: RwLock<Instant>,
    },
    Shared {
        manager: redis::aio::ConnectionManager,
    },
}

/// Fixed-window limiter over one of the two backends.
pub struct RateLimiter {
    config: RateLimitConfig,
    backend: Backend,
}

impl RateLimiter {
    /// Creates a limiter over the in-process map.
    pub fn in_memory(config: RateLimitConfig) -> Self {
        Self {
            config,
            backend: Backend::Memory {
                buckets: RwLock::new(HashMap::new()),
                last_cleanup: RwLock::new(Instant::now()),
            },
        }
    }

    /// Resolves the backend at startup.
    ///
    /// With a store URL configured, a connection is attempted under
    /// [`STORE_CONNECT_TIMEOUT`]; on failure the limiter logs a warning and
    /// falls back to the in-process map permanently (no background
    /// reconnection).
    pub async fn connect(config: RateLimitConfig, store_url: Option<&str>) -> Self {
        let Some(url) = store_url else {
            return Self::in_memory(config);
        };

        let connect = async {
            let client = redis::Client::open(url)
                .map_err(|e| format!("invalid store url: {e}"))?;
            client
                .get_connection_manager()
                .await
                .map_err(|e| format!("connect: {e}"))
        };

        match tokio::time::timeout(STORE_CONNECT_TIMEOUT, connect).await {
            Ok(Ok(manager)) => {
                info!("rate limiter using shared store");
                Self {
                    config,
                    backend: Backend::Shared { manager },
                }
            }
            Ok(Err(reason)) => {
                warn!(%reason, "shared rate-limit store unavailable, falling back to in-memory counters");
                Self::in_memory(config)
            }
            Err(_) => {
                warn!(
                    timeout_ms = STORE_CONNECT_TIMEOUT.as_millis() as u64,
                    "shared rate-limit store connect timed out, falling back to in-memory counters"
                );
                Self::in_memory(config)
            }
        }
    }

    /// Whether the shared backend is in use.
    pub fn is_shared(&self) -> bool {
        matches!(self.backend, Backend::Shared { .. })
    }

    /// Builds a limiter with different window parameters on this limiter's
    /// backend, so a strict profile reuses the shared-store connection
    /// instead of opening a second one. Callers keep profiles distinct by
    /// prefixing their keys.
    pub fn sibling(&self, config: RateLimitConfig) -> RateLimiter {
        match &self.backend {
            Backend::Shared { manager } => RateLimiter {
                config,
                backend: Backend::Shared {
                    manager: manager.clone(),
                },
            },
            Backend::Memory { .. } => RateLimiter::in_memory(config),
        }
    }

    /// The configured window, used for the `Retry-After` response header.
    pub fn window(&self) -> Duration {
        self.config.window
    }

    /// Counts one request for `key` and returns the decision.
    pub async fn check(&self, key: &str) -> RateLimitDecision {
        match &self.backend {
            Backend::Memory {
                buckets,
                last_cleanup,
            } => self.check_memory(buckets, last_cleanup, key).await,
            Backend::Shared { manager } => match self.check_shared(manager.clone(), key).await {
                Ok(decision) => decision,
                Err(err) => {
                    // Fail open: a store hiccup must not reject traffic.
                    warn!(error = %err, "shared rate-limit store error, allowing request");
                    RateLimitDecision::Allowed
                }
            },
        }
    }

    async fn check_memory(
        &self,
        buckets: &RwLock<HashMap<String, WindowCounter>>,
        last_cleanup: &RwLock<Instant>,
        key: &str,
    ) -> RateLimitDecision {
        let now = Instant::now();
        let window = self.config.window;

        // Drop expired windows once per window length so idle keys cannot
        // grow the map without bound.
        {
            let mut cleanup = last_cleanup.write().await;
            if now.duration_since(*cleanup) >= window {
                buckets
                    .write()
                    .await
                    .retain(|_, c| now.duration_since(c.window_start) < window);
                *cleanup = now;
            }
        }

        let mut buckets = buckets.write().await;
        let counter = buckets.entry(key.to_string()).or_insert(WindowCounter {
            window_start: now,
            count: 0,
        });

        if now.duration_since(counter.window_start) >= window {
            counter.window_start = now;
            counter.count = 0;
        }

        counter.count += 1;
        if counter.count > self.config.max_requests {
            let elapsed = now.duration_since(counter.window_start);
            RateLimitDecision::Limited {
                retry_after: window.saturating_sub(elapsed),
            }
        } else {
            RateLimitDecision::Allowed
        }
    }

    async fn check_shared(
        &self,
        mut conn: redis::aio::ConnectionManager,
        key: &str,
    ) -> std::result::Result<RateLimitDecision, redis::RedisError> {
        let store_key = format!("{STORE_KEY_PREFIX}{key}");
        let window_secs = self.config.window.as_secs().max(1);

        let count: u64 = conn.incr(&store_key, 1u64).await?;
        if count == 1 {
            let _: () = conn.expire(&store_key, window_secs as i64).await?;
        }

        if count > self.config.max_requests {
            let ttl: i64 = conn.ttl(&store_key).await?;
            let retry_after = if ttl > 0 {
                Duration::from_secs(ttl as u64)
            } else {
                self.config.window
            };
            Ok(RateLimitDecision::Limited { retry_after })
        } else {
            Ok(RateLimitDecision::Allowed)
        }
    }

    /// Releases the shared-store connection during graceful shutdown.
    pub async fn shutdown(&self) -> Result<()> {
        if self.is_shared() {
            info!("closing shared rate-limit store connection");
        }
        // Connections close when the manager handles are dropped with the
        // engine; nothing else to flush for the in-memory backend.
        Ok(())
    }
}

/// Derives the client identity used as the rate-limit key.
///
/// When `trust_proxy` is set and a forwarded-for value is present, the first
/// entry wins; values that are empty or longer than 128 bytes are rejected in
/// favor of the socket peer address.
pub fn client_key(forwarded_for: Option<&str>, peer: &SocketAddr, trust_proxy: bool) -> String {
    if trust_proxy {
        if let Some(raw) = forwarded_for {
            if raw.len() <= MAX_KEY_HEADER_LEN {
                if let Some(first) = raw.split(',').next() {
                    let first = first.trim();
                    if !first.is_empty() {
                        return first.to_string();
                    }
                }
            }
        }
    }
    peer.ip().to_string()
}
