//! Process settings sourced from environment variables.
//!
//! Every variable is validated at startup; an invalid or out-of-range value
//! logs a warning and falls back to the default (non-fatal), so a typo in a
//! deployment manifest degrades the config instead of killing the process.

use std::time::Duration;
use tracing::warn;

/// Runtime mode tag; affects error-body verbosity and the default log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeMode {
    Development,
    Production,
    Test,
}

impl RuntimeMode {
    pub fn is_production(&self) -> bool {
        matches!(self, RuntimeMode::Production)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeMode::Development => "development",
            RuntimeMode::Production => "production",
            RuntimeMode::Test => "test",
        }
    }
}

/// All tunables read from the environment, with validated fallbacks.
#[derive(Debug, Clone)]
pub struct Settings {
    pub port: u16,
    pub mode: RuntimeMode,
    pub trust_proxy: bool,
    pub cors_origins: Vec<String>,
    pub cors_credentials: bool,
    pub request_body_limit: usize,

    pub rate_limit_window: Duration,
    pub rate_limit_max: u64,
    pub rate_limit_strict_max: u64,
    pub rate_limit_store_url: Option<String>,

    pub request_timeout: Duration,
    pub upstream_timeout: Duration,
    pub shutdown_timeout: Duration,

    pub max_retries: u32,
    pub retry_initial_delay: Duration,
    pub retry_max_delay: Duration,
    pub retry_factor: f64,

    pub breaker_window: Duration,
    pub breaker_error_threshold_pct: f64,
    pub breaker_reset_timeout: Duration,

    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,

    pub max_sockets: usize,
    pub max_free_sockets: usize,

    pub log_level: String,
    pub config_path: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: 3000,
            mode: RuntimeMode::Development,
            trust_proxy: false,
            cors_origins: vec!["*".to_string()],
            cors_credentials: false,
            request_body_limit: 10 * 1024 * 1024,

            rate_limit_window: Duration::from_secs(60),
            rate_limit_max: 100,
            rate_limit_strict_max: 10,
            rate_limit_store_url: None,

            request_timeout: Duration::from_secs(30),
            upstream_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(10),

            max_retries: 3,
            retry_initial_delay: Duration::from_millis(100),
            retry_max_delay: Duration::from_secs(10),
            retry_factor: 2.0,

            breaker_window: Duration::from_secs(60),
            breaker_error_threshold_pct: 50.0,
            breaker_reset_timeout: Duration::from_secs(30),

            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,

            max_sockets: 100,
            max_free_sockets: 10,

            log_level: "info".to_string(),
            config_path: "gateway.yaml".to_string(),
        }
    }
}

impl Settings {
    /// Builds settings from the process environment.
    pub fn from_env() -> Self {
        let d = Settings::default();
        let get = |name: &str| std::env::var(name).ok();

        Settings {
            port: parse_int("PORT", get("PORT"), d.port as u64, 1, 65535) as u16,
            mode: parse_mode("GATEWAY_ENV", get("GATEWAY_ENV")),
            trust_proxy: parse_bool("TRUST_PROXY", get("TRUST_PROXY"), d.trust_proxy),
            cors_origins: parse_origins(get("CORS_ORIGIN")),
            cors_credentials: parse_bool(
                "CORS_CREDENTIALS",
                get("CORS_CREDENTIALS"),
                d.cors_credentials,
            ),
            request_body_limit: parse_size(
                "REQUEST_BODY_LIMIT",
                get("REQUEST_BODY_LIMIT"),
                d.request_body_limit,
            ),

            rate_limit_window: millis(
                "RATE_LIMIT_WINDOW_MS",
                get("RATE_LIMIT_WINDOW_MS"),
                d.rate_limit_window,
            ),
            rate_limit_max: parse_int("RATE_LIMIT_MAX", get("RATE_LIMIT_MAX"), d.rate_limit_max, 1, u64::MAX),
            rate_limit_strict_max: parse_int(
                "RATE_LIMIT_STRICT_MAX",
                get("RATE_LIMIT_STRICT_MAX"),
                d.rate_limit_strict_max,
                1,
                u64::MAX,
            ),
            rate_limit_store_url: get("RATE_LIMIT_STORE_URL").filter(|s| !s.trim().is_empty()),

            request_timeout: millis(
                "REQUEST_TIMEOUT_MS",
                get("REQUEST_TIMEOUT_MS"),
                d.request_timeout,
            ),
            upstream_timeout: millis(
                "UPSTREAM_TIMEOUT_MS",
                get("UPSTREAM_TIMEOUT_MS"),
                d.upstream_timeout,
            ),
            shutdown_timeout: millis(
                "SHUTDOWN_TIMEOUT_MS",
                get("SHUTDOWN_TIMEOUT_MS"),
                d.shutdown_timeout,
            ),

            max_retries: parse_int("MAX_RETRIES", get("MAX_RETRIES"), d.max_retries as u64, 0, 100)
                as u32,
            retry_initial_delay: millis(
                "RETRY_INITIAL_DELAY_MS",
                get("RETRY_INITIAL_DELAY_MS"),
                d.retry_initial_delay,
            ),
            retry_max_delay: millis(
                "RETRY_MAX_DELAY_MS",
                get("RETRY_MAX_DELAY_MS"),
                d.retry_max_delay,
            ),
            retry_factor: parse_f64("RETRY_FACTOR", get("RETRY_FACTOR"), d.retry_factor, 1.0, 100.0),

            breaker_window: millis(
                "CIRCUIT_BREAKER_TIMEOUT_MS",
                get("CIRCUIT_BREAKER_TIMEOUT_MS"),
                d.breaker_window,
            ),
            breaker_error_threshold_pct: parse_f64(
                "CIRCUIT_BREAKER_ERROR_THRESHOLD",
                get("CIRCUIT_BREAKER_ERROR_THRESHOLD"),
                d.breaker_error_threshold_pct,
                1.0,
                100.0,
            ),
            breaker_reset_timeout: millis(
                "CIRCUIT_BREAKER_RESET_TIMEOUT_MS",
                get("CIRCUIT_BREAKER_RESET_TIMEOUT_MS"),
                d.breaker_reset_timeout,
            ),

            health_check_interval: millis(
                "HEALTH_CHECK_INTERVAL_MS",
                get("HEALTH_CHECK_INTERVAL_MS"),
                d.health_check_interval,
            ),
            health_check_timeout: millis(
                "HEALTH_CHECK_TIMEOUT_MS",
                get("HEALTH_CHECK_TIMEOUT_MS"),
                d.health_check_timeout,
            ),
            unhealthy_threshold: parse_int(
                "HEALTH_CHECK_UNHEALTHY_THRESHOLD",
                get("HEALTH_CHECK_UNHEALTHY_THRESHOLD"),
                d.unhealthy_threshold as u64,
                1,
                1000,
            ) as u32,
            healthy_threshold: parse_int(
                "HEALTH_CHECK_HEALTHY_THRESHOLD",
                get("HEALTH_CHECK_HEALTHY_THRESHOLD"),
                d.healthy_threshold as u64,
                1,
                1000,
            ) as u32,

            max_sockets: parse_int("MAX_SOCKETS", get("MAX_SOCKETS"), d.max_sockets as u64, 1, 65535)
                as usize,
            max_free_sockets: parse_int(
                "MAX_FREE_SOCKETS",
                get("MAX_FREE_SOCKETS"),
                d.max_free_sockets as u64,
                0,
                65535,
            ) as usize,

            log_level: get("LOG_LEVEL").unwrap_or(d.log_level),
            config_path: get("GATEWAY_CONFIG_PATH").unwrap_or(d.config_path),
        }
    }

    /// Route-level defaults derived from the global settings.
    pub fn route_defaults(&self) -> crate::config::RouteDefaults {
        crate::config::RouteDefaults {
            request_timeout: self.upstream_timeout,
            max_retries: self.max_retries,
        }
    }

    /// The engine-wide backoff policy from the `RETRY_*` variables.
    pub fn retry_policy(&self) -> crate::retry::RetryPolicy {
        crate::retry::RetryPolicy {
            initial: self.retry_initial_delay,
            factor: self.retry_factor,
            max_delay: self.retry_max_delay,
            max_retries: self.max_retries,
        }
    }
}

fn parse_int(name: &str, raw: Option<String>, default: u64, min: u64, max: u64) -> u64 {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(value) if (min..=max).contains(&value) => value,
            Ok(value) => {
                warn!(%name, %value, min, max, "env value out of range, using default {}", default);
                default
            }
            Err(_) => {
                warn!(%name, %raw, "env value is not an integer, using default {}", default);
                default
            }
        },
    }
}

fn parse_f64(name: &str, raw: Option<String>, default: f64, min: f64, max: f64) -> f64 {
    match raw {
        None => default,
        Some(raw) => match raw.trim().parse::<f64>() {
            Ok(value) if value >= min && value <= max => value,
            _ => {
                warn!(%name, %raw, "invalid env value, using default {}", default);
                default
            }
        },
    }
}

fn parse_bool(name: &str, raw: Option<String>, default: bool) -> bool {
    match raw.as_deref().map(str::trim) {
        None => default,
        Some("true") | Some("1") | Some("yes") => true,
        Some("false") | Some("0") | Some("no") => false,
        Some(raw) => {
            warn!(%name, %raw, "env value is not a boolean, using default {}", default);
            default
        }
    }
}

fn parse_mode(name: &str, raw: Option<String>) -> RuntimeMode {
    match raw.as_deref().map(str::trim) {
        None => RuntimeMode::Development,
        Some("development") => RuntimeMode::Development,
        Some("production") => RuntimeMode::Production,
        Some("test") => RuntimeMode::Test,
        Some(raw) => {
            warn!(%name, %raw, "unknown runtime mode, using development");
            RuntimeMode::Development
        }
    }
}

fn millis(name: &str, raw: Option<String>, default: Duration) -> Duration {
    Duration::from_millis(parse_int(
        name,
        raw,
        default.as_millis() as u64,
        1,
        u64::MAX,
    ))
}

/// Parses a size string such as `10mb`, `512kb`, or a plain byte count.
fn parse_size(name: &str, raw: Option<String>, default: usize) -> usize {
    let Some(raw) = raw else { return default };
    let trimmed = raw.trim().to_ascii_lowercase();
    let (digits, multiplier) = if let Some(v) = trimmed.strip_suffix("gb") {
        (v, 1024 * 1024 * 1024)
    } else if let Some(v) = trimmed.strip_suffix("mb") {
        (v, 1024 * 1024)
    } else if let Some(v) = trimmed.strip_suffix("kb") {
        (v, 1024)
    } else if let Some(v) = trimmed.strip_suffix('b') {
        (v, 1)
    } else {
        (trimmed.as_str(), 1)
    };
    match digits.trim().parse::<usize>() {
        Ok(value) if value > 0 => value.saturating_mul(multiplier),
        _ => {
            warn!(%name, %raw, "invalid size string, using default {}", default);
            default
        }
    }
}

fn parse_origins(raw: Option<String>) -> Vec<String> {
    match raw {
        None => vec!["*".to_string()],
        Some(raw) => {
            let origins: Vec<String> = raw
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
            if origins.is_empty() {
                vec!["*".to_string()]
            } else {
                origins
            }
        }
    }
}
