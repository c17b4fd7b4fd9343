//! Gateway error taxonomy.
//!
//! Every failure surfaced by the engine maps to one of these kinds, which in
//! turn decides the client-facing status code and whether the proxy pipeline
//! may retry. Transport errors keep the legacy code names (`ECONNREFUSED`,
//! `ETIMEDOUT`, ...) because the retry predicate and the circuit breaker both
//! classify on them, including by substring match against foreign error
//! messages.

use thiserror::Error;

/// Transport-level error codes in the retryable set.
///
/// The circuit breaker classifies on the same set: any of these observed
/// while talking to an upstream counts as an upstream fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportCode {
    ConnReset,
    TimedOut,
    ConnRefused,
    NotFound,
    ConnAborted,
}

impl TransportCode {
    /// All retryable codes, in a fixed order.
    pub const ALL: [TransportCode; 5] = [
        TransportCode::ConnReset,
        TransportCode::TimedOut,
        TransportCode::ConnRefused,
        TransportCode::NotFound,
        TransportCode::ConnAborted,
    ];

    /// The legacy wire name of the code.
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportCode::ConnReset => "ECONNRESET",
            TransportCode::TimedOut => "ETIMEDOUT",
            TransportCode::ConnRefused => "ECONNREFUSED",
            TransportCode::NotFound => "ENOTFOUND",
            TransportCode::ConnAborted => "ECONNABORTED",
        }
    }
}

impl std::fmt::Display for TransportCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors produced by the gateway engine.
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Request body exceeds the configured limit of {0} bytes")]
    BodyTooLarge(usize),

    #[error("Rate limit exceeded, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("Gateway not configured")]
    NotConfigured,

    #[error("No upstream available for route {route}")]
    NoUpstreamAvailable { route: String },

    #[error("circuit breaker open for upstream {upstream}")]
    CircuitOpen { upstream: String },

    #[error("{code}: {message}")]
    UpstreamTransport { code: TransportCode, message: String },

    #[error("Upstream request timed out after {0}ms")]
    UpstreamTimeout(u64),

    #[error("Request canceled by client")]
    Canceled,

    #[error("Plugin {name} failed to load: {reason}")]
    PluginLoad { name: String, reason: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Classifies a `reqwest` failure into the gateway taxonomy.
    ///
    /// Connect-level failures map onto the legacy transport codes; client
    /// timeouts map to `ETIMEDOUT` so both the retry predicate and the
    /// breaker treat them as upstream faults.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        let message = err.to_string();
        if err.is_timeout() {
            return GatewayError::UpstreamTransport {
                code: TransportCode::TimedOut,
                message,
            };
        }
        if err.is_connect() {
            // reqwest collapses refused/unreachable/DNS failures into one
            // connect kind; recover the finer-grained legacy code from the
            // source chain when it names one.
            let code = if message.contains("dns") || message.contains("resolve") {
                TransportCode::NotFound
            } else {
                TransportCode::ConnRefused
            };
            return GatewayError::UpstreamTransport { code, message };
        }
        if err.is_request() || err.is_body() || err.is_decode() {
            return GatewayError::UpstreamTransport {
                code: TransportCode::ConnReset,
                message,
            };
        }
        GatewayError::Internal(message)
    }

    /// Whether this error is in the retryable transport set.
    ///
    /// Matches the explicit `UpstreamTransport` codes, and additionally any
    /// error whose rendered message contains one of the code names (legacy
    /// compatibility: some callers wrap transport failures in plain strings).
    pub fn is_retryable_transport(&self) -> bool {
        match self {
            GatewayError::UpstreamTransport { .. } => true,
            GatewayError::Canceled => false,
            other => {
                let message = other.to_string();
                TransportCode::ALL.iter().any(|c| message.contains(c.as_str()))
            }
        }
    }

    /// Whether the circuit breaker counts this error as a failure.
    ///
    /// Everything is a failure except a client-initiated cancellation.
    pub fn is_breaker_failure(&self) -> bool {
        !matches!(self, GatewayError::Canceled)
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
