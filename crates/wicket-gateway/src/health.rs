//! Upstream health monitoring.
//!
//! Each distinct upstream origin in the routing table gets its own periodic
//! probe task issuing `GET origin + health_probe_path`. A 2xx/3xx/4xx answer
//! means the peer is alive; 5xx or any transport error is a probe failure.
//! Transitions are debounced: an upstream goes unhealthy only after
//! `unhealthy_threshold` consecutive failures and recovers only after
//! `healthy_threshold` consecutive successes. Upstreams start optimistically
//! healthy.
//!
//! The probe loop also drives [`BreakerRegistry::tick`] so open breakers
//! move to half-open on schedule rather than on the next unlucky request.
//!
//! [`BreakerRegistry::tick`]: crate::breaker::BreakerRegistry::tick

use crate::breaker::BreakerRegistry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Probe loop tuning.
#[derive(Debug, Clone)]
pub struct HealthConfig {
    pub interval: Duration,
    pub timeout: Duration,
    pub unhealthy_threshold: u32,
    pub healthy_threshold: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: 3,
            healthy_threshold: 2,
        }
    }
}

/// Monitor view of one upstream.
#[derive(Debug, Clone)]
pub struct UpstreamHealth {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_check_at: Option<Instant>,
}

impl Default for UpstreamHealth {
    fn default() -> Self {
        Self {
            // Optimistic: traffic flows until probes prove otherwise.
            healthy: true,
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_check_at: None,
        }
    }
}

/// Applies one probe result, returning the transition if one occurred.
fn apply_probe(state: &mut UpstreamHealth, success: bool, config: &HealthConfig) -> Option<bool> {
    state.last_check_at = Some(Instant::now());
    if success {
        state.consecutive_successes += 1;
        state.consecutive_failures = 0;
        if !state.healthy && state.consecutive_successes >= config.healthy_threshold {
            state.healthy = true;
            return Some(true);
        }
    } else {
        state.consecutive_failures += 1;
        state.consecutive_successes = 0;
        if state.healthy && state.consecutive_failures >= config.unhealthy_threshold {
            state.healthy = false;
            return Some(false);
        }
    }
    None
}

/// Owns one probe task per monitored upstream.
pub struct HealthMonitor {
    config: HealthConfig,
    client: reqwest::Client,
    states: Arc<RwLock<HashMap<String, UpstreamHealth>>>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    breakers: Arc<BreakerRegistry>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, breakers: Arc<BreakerRegistry>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            states: Arc::new(RwLock::new(HashMap::new())),
            tasks: Mutex::new(HashMap::new()),
            breakers,
        }
    }

    /// Starts monitoring `origin`. Idempotent: a second call is a no-op.
    pub fn watch(&self, origin: &str, probe_path: &str) {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(origin) {
            return;
        }

        self.states
            .write()
            .unwrap()
            .insert(origin.to_string(), UpstreamHealth::default());

        let url = format!(
            "{}{}",
            origin.trim_end_matches('/'),
            if probe_path.starts_with('/') {
                probe_path.to_string()
            } else {
                format!("/{probe_path}")
            }
        );
        let handle = tokio::spawn(probe_loop(
            self.client.clone(),
            url,
            origin.to_string(),
            self.config.clone(),
            self.states.clone(),
            self.breakers.clone(),
        ));
        tasks.insert(origin.to_string(), handle);
        debug!(%origin, "health monitoring started");
    }

    /// Stops monitoring `origin` and forgets its state.
    pub fn unwatch(&self, origin: &str) {
        if let Some(handle) = self.tasks.lock().unwrap().remove(origin) {
            handle.abort();
        }
        self.states.write().unwrap().remove(origin);
        debug!(%origin, "health monitoring stopped");
    }

    /// Stops and forgets every upstream not in `keep`; returns the removed.
    pub fn retain(&self, keep: &HashSet<String>) -> Vec<String> {
        let removed: Vec<String> = {
            let tasks = self.tasks.lock().unwrap();
            tasks.keys().filter(|k| !keep.contains(*k)).cloned().collect()
        };
        for origin in &removed {
            self.unwatch(origin);
        }
        removed
    }

    /// Whether `origin` is currently considered healthy.
    ///
    /// Unknown upstreams are healthy (optimistic default).
    pub fn is_healthy(&self, origin: &str) -> bool {
        self.states
            .read()
            .unwrap()
            .get(origin)
            .map(|s| s.healthy)
            .unwrap_or(true)
    }

    /// Non-blocking snapshot of every monitored upstream.
    pub fn snapshot(&self) -> HashMap<String, UpstreamHealth> {
        self.states.read().unwrap().clone()
    }

    pub fn monitored_count(&self) -> usize {
        self.states.read().unwrap().len()
    }

    pub fn any_healthy(&self) -> bool {
        self.states.read().unwrap().values().any(|s| s.healthy)
    }

    /// Aborts every probe task (shutdown path).
    pub fn stop_all(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        for (_, handle) in tasks.drain() {
            handle.abort();
        }
    }
}

async fn probe_loop(
    client: reqwest::Client,
    url: String,
    origin: String,
    config: HealthConfig,
    states: Arc<RwLock<HashMap<String, UpstreamHealth>>>,
    breakers: Arc<BreakerRegistry>,
) {
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        interval.tick().await;

        breakers.tick();

        let success = probe(&client, &url).await;
        let transition = {
            let mut states = states.write().unwrap();
            match states.get_mut(&origin) {
                Some(state) => apply_probe(state, success, &config),
                // Unwatched while the probe was in flight.
                None => break,
            }
        };
        match transition {
            Some(true) => info!(%origin, "upstream recovered"),
            Some(false) => warn!(%origin, "upstream marked unhealthy"),
            None => {}
        }
    }
}

/// One probe round-trip. Alive means any response below 500.
async fn probe(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().as_u16() < 500,
        Err(err) => {
            debug!(%url, error = %err, "health probe failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerConfig;

    fn config(unhealthy: u32, healthy: u32) -> HealthConfig {
        HealthConfig {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(5),
            unhealthy_threshold: unhealthy,
            healthy_threshold: healthy,
        }
    }

    fn monitor(cfg: HealthConfig) -> HealthMonitor {
        HealthMonitor::new(cfg, Arc::new(BreakerRegistry::new(BreakerConfig::default())))
    }

    #[test]
    fn test_apply_probe_debounces_unhealthy() {
        let cfg = config(3, 2);
        let mut state = UpstreamHealth::default();

        assert_eq!(apply_probe(&mut state, false, &cfg), None);
        assert_eq!(apply_probe(&mut state, false, &cfg), None);
        assert!(state.healthy);
        assert_eq!(apply_probe(&mut state, false, &cfg), Some(false));
        assert!(!state.healthy);
        assert_eq!(state.consecutive_failures, 3);
    }

    #[test]
    fn test_apply_probe_debounces_recovery() {
        let cfg = config(1, 2);
        let mut state = UpstreamHealth::default();
        apply_probe(&mut state, false, &cfg);
        assert!(!state.healthy);

        assert_eq!(apply_probe(&mut state, true, &cfg), None);
        assert!(!state.healthy);
        assert_eq!(apply_probe(&mut state, true, &cfg), Some(true));
        assert!(state.healthy);
        assert_eq!(state.consecutive_failures, 0);
    }

    #[test]
    fn test_apply_probe_success_resets_failure_streak() {
        let cfg = config(3, 1);
        let mut state = UpstreamHealth::default();
        apply_probe(&mut state, false, &cfg);
        apply_probe(&mut state, false, &cfg);
        apply_probe(&mut state, true, &cfg);
        apply_probe(&mut state, false, &cfg);
        apply_probe(&mut state, false, &cfg);
        // Streak was broken; still healthy.
        assert!(state.healthy);
    }

    #[tokio::test]
    async fn test_watch_is_idempotent() {
        let monitor = monitor(config(3, 2));
        monitor.watch("http://u:1", "/health");
        monitor.watch("http://u:1", "/health");
        assert_eq!(monitor.tasks.lock().unwrap().len(), 1);
        assert_eq!(monitor.monitored_count(), 1);
        monitor.stop_all();
    }

    #[tokio::test]
    async fn test_unknown_upstream_is_optimistically_healthy() {
        let monitor = monitor(config(3, 2));
        assert!(monitor.is_healthy("http://never-seen:1"));
    }

    #[tokio::test]
    async fn test_retain_stops_removed_upstreams() {
        let monitor = monitor(config(3, 2));
        monitor.watch("http://a:1", "/health");
        monitor.watch("http://b:1", "/health");

        let keep: HashSet<String> = ["http://a:1".to_string()].into();
        let removed = monitor.retain(&keep);
        assert_eq!(removed, vec!["http://b:1".to_string()]);
        assert_eq!(monitor.monitored_count(), 1);
        assert!(monitor.snapshot().contains_key("http://a:1"));
        monitor.stop_all();
    }

    #[tokio::test]
    async fn test_any_healthy_reflects_state() {
        let monitor = monitor(config(1, 1));
        assert!(!monitor.any_healthy());
        monitor.watch("http://a:1", "/health");
        assert!(monitor.any_healthy());

        monitor
            .states
            .write()
            .unwrap()
            .get_mut("http://a:1")
            .map(|s| s.healthy = false);
        assert!(!monitor.any_healthy());
        monitor.stop_all();
    }
}
