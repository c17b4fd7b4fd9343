//! Per-upstream circuit breakers.
//!
//! Each upstream gets a three-state breaker (closed, open, half-open) over a
//! rolling, time-bucketed error window. The registry is the only mutation
//! path; per-upstream state sits behind its own mutex so breakers never
//! contend with each other. State transitions fan out to observer callbacks
//! registered at engine wiring time (logging, the metrics gauge).
//!
//! Open breakers recover lazily on the next acquire once the reset timeout
//! has elapsed, and eagerly via [`BreakerRegistry::tick`], which the health
//! monitor's periodic loop drives so a transition is observable between
//! requests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tracing::warn;
use wicket_core::error::{GatewayError, Result};

/// Breaker state machine states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    /// Normal operation, calls flow through.
    Closed,
    /// Tripped; calls fail fast with `CircuitOpen` until the reset timeout.
    Open,
    /// One trial call allowed; success closes, failure re-opens.
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }

    /// Gauge encoding: `0=closed, 1=open, 2=half_open`.
    pub fn metric_code(&self) -> i64 {
        match self {
            BreakerState::Closed => 0,
            BreakerState::Open => 1,
            BreakerState::HalfOpen => 2,
        }
    }
}

/// Breaker tuning shared by every upstream.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Length of the rolling error window.
    pub window: Duration,
    /// Number of sub-buckets the window is split into.
    pub buckets: usize,
    /// Failure percentage within the window required to trip.
    pub error_threshold_pct: f64,
    /// Minimum fires in the window before the breaker may trip; one
    /// bucket's worth of traffic so a single early failure cannot open the
    /// circuit.
    pub min_fires_in_window: u64,
    /// Time spent open before a trial is allowed.
    pub reset_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            buckets: 10,
            error_threshold_pct: 50.0,
            min_fires_in_window: 10,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct Bucket {
    fires: u64,
    failures: u64,
}

/// Time-bucketed counters over the rolling window.
#[derive(Debug)]
struct RollingWindow {
    buckets: Vec<Bucket>,
    bucket_len: Duration,
    cursor: usize,
    cursor_start: Instant,
}

impl RollingWindow {
    fn new(window: Duration, buckets: usize) -> Self {
        let buckets = buckets.max(1);
        Self {
            buckets: vec![Bucket::default(); buckets],
            bucket_len: window / buckets as u32,
            cursor: 0,
            cursor_start: Instant::now(),
        }
    }

    /// Rotates expired buckets forward to `now`.
    fn advance(&mut self, now: Instant) {
        let window = self.bucket_len * self.buckets.len() as u32;
        if now.duration_since(self.cursor_start) >= window {
            // Idle longer than the whole window: everything is stale.
            self.buckets.fill(Bucket::default());
            self.cursor_start = now;
            return;
        }
        while now.duration_since(self.cursor_start) >= self.bucket_len {
            self.cursor = (self.cursor + 1) % self.buckets.len();
            self.buckets[self.cursor] = Bucket::default();
            self.cursor_start += self.bucket_len;
        }
    }

    fn record(&mut self, now: Instant, failure: bool) {
        self.advance(now);
        let bucket = &mut self.buckets[self.cursor];
        bucket.fires += 1;
        if failure {
            bucket.failures += 1;
        }
    }

    fn totals(&mut self, now: Instant) -> (u64, u64) {
        self.advance(now);
        self.buckets
            .iter()
            .fold((0, 0), |(f, e), b| (f + b.fires, e + b.failures))
    }

    fn reset(&mut self) {
        self.buckets.fill(Bucket::default());
        self.cursor_start = Instant::now();
    }
}

/// One upstream's breaker. All access goes through its mutex.
struct Breaker {
    state: BreakerState,
    window: RollingWindow,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
}

impl Breaker {
    fn new(config: &BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            window: RollingWindow::new(config.window, config.buckets),
            opened_at: None,
            trial_in_flight: false,
        }
    }

    fn open(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.opened_at = Some(now);
        self.trial_in_flight = false;
    }

    fn close(&mut self) {
        self.state = BreakerState::Closed;
        self.opened_at = None;
        self.trial_in_flight = false;
        self.window.reset();
    }

    fn reset_elapsed(&self, now: Instant, config: &BreakerConfig) -> bool {
        self.opened_at
            .map(|t| now.duration_since(t) >= config.reset_timeout)
            .unwrap_or(true)
    }
}

/// Callback invoked on every breaker state transition.
pub type TransitionObserver = Arc<dyn Fn(&str, BreakerState) + Send + Sync>;

/// Registry of breakers, one per upstream origin.
pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: RwLock<HashMap<String, Arc<Mutex<Breaker>>>>,
    observers: RwLock<Vec<TransitionObserver>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: RwLock::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Registers a transition observer. Wiring-time only.
    pub fn on_transition(&self, observer: TransitionObserver) {
        self.observers.write().unwrap().push(observer);
    }

    fn notify(&self, upstream: &str, state: BreakerState) {
        for observer in self.observers.read().unwrap().iter() {
            observer(upstream, state);
        }
    }

    fn breaker(&self, upstream: &str) -> Arc<Mutex<Breaker>> {
        if let Some(existing) = self.breakers.read().unwrap().get(upstream) {
            return existing.clone();
        }
        let mut map = self.breakers.write().unwrap();
        map.entry(upstream.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(Breaker::new(&self.config))))
            .clone()
    }

    /// Claims permission to issue one call to `upstream`.
    ///
    /// Closed always admits. Open admits a single trial once the reset
    /// timeout has elapsed (transitioning to half-open), otherwise fails with
    /// `CircuitOpen`. Half-open admits only while no trial is in flight.
    pub fn try_acquire(&self, upstream: &str) -> Result<()> {
        self.acquire_internal(upstream).map(|_| ())
    }

    /// As [`try_acquire`](Self::try_acquire); the boolean reports whether
    /// this call claimed the half-open trial slot.
    fn acquire_internal(&self, upstream: &str) -> Result<bool> {
        let breaker = self.breaker(upstream);
        let mut guard = breaker.lock().unwrap();
        let now = Instant::now();
        match guard.state {
            BreakerState::Closed => Ok(false),
            BreakerState::Open => {
                if guard.reset_elapsed(now, &self.config) {
                    guard.state = BreakerState::HalfOpen;
                    guard.trial_in_flight = true;
                    drop(guard);
                    self.notify(upstream, BreakerState::HalfOpen);
                    Ok(true)
                } else {
                    Err(GatewayError::CircuitOpen {
                        upstream: upstream.to_string(),
                    })
                }
            }
            BreakerState::HalfOpen => {
                if guard.trial_in_flight {
                    Err(GatewayError::CircuitOpen {
                        upstream: upstream.to_string(),
                    })
                } else {
                    guard.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    /// Fire-and-forget success signal.
    pub fn record_success(&self, upstream: &str) {
        let breaker = self.breaker(upstream);
        let mut guard = breaker.lock().unwrap();
        match guard.state {
            BreakerState::HalfOpen => {
                guard.close();
                drop(guard);
                self.notify(upstream, BreakerState::Closed);
            }
            BreakerState::Closed => guard.window.record(Instant::now(), false),
            // A stale success from before the trip changes nothing.
            BreakerState::Open => {}
        }
    }

    /// Fire-and-forget failure signal; may trip the breaker.
    pub fn record_failure(&self, upstream: &str) {
        let breaker = self.breaker(upstream);
        let mut guard = breaker.lock().unwrap();
        let now = Instant::now();
        match guard.state {
            BreakerState::HalfOpen => {
                guard.open(now);
                drop(guard);
                self.notify(upstream, BreakerState::Open);
            }
            BreakerState::Closed => {
                guard.window.record(now, true);
                let (fires, failures) = guard.window.totals(now);
                if fires >= self.config.min_fires_in_window {
                    let pct = failures as f64 * 100.0 / fires as f64;
                    if pct >= self.config.error_threshold_pct {
                        guard.open(now);
                        drop(guard);
                        self.notify(upstream, BreakerState::Open);
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    /// Releases a half-open trial slot without recording an outcome.
    ///
    /// Used when the trial call was canceled by the client; a cancellation
    /// is neither a success nor a failure but must not wedge the breaker.
    fn release_trial(&self, upstream: &str) {
        let breaker = self.breaker(upstream);
        let mut guard = breaker.lock().unwrap();
        if guard.state == BreakerState::HalfOpen {
            guard.trial_in_flight = false;
        }
    }

    /// Runs `op` under the breaker for `upstream`.
    ///
    /// Returns `CircuitOpen` without constructing the call when the breaker
    /// rejects. A successful future is classified by `is_failure` (the
    /// status-based rule: 5xx counts against the upstream, 4xx does not);
    /// an error outcome counts as a failure unless it is a cancellation.
    pub async fn execute<T, Fut>(
        &self,
        upstream: &str,
        op: impl FnOnce() -> Fut,
        is_failure: impl FnOnce(&T) -> bool,
    ) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let took_trial = self.acquire_internal(upstream)?;

        // If the caller is dropped mid-call (client disconnect), the trial
        // slot must be released or a half-open breaker would reject forever.
        let guard = TrialGuard {
            registry: self,
            upstream,
            armed: took_trial,
        };

        let result = op().await;
        match &result {
            Ok(value) => {
                if is_failure(value) {
                    self.record_failure(upstream);
                } else {
                    self.record_success(upstream);
                }
            }
            Err(err) => {
                if err.is_breaker_failure() {
                    self.record_failure(upstream);
                } else {
                    self.release_trial(upstream);
                }
            }
        }
        guard.disarm();
        result
    }

    /// The stored state for `upstream`; `Closed` when untracked.
    pub fn state(&self, upstream: &str) -> BreakerState {
        self.breakers
            .read()
            .unwrap()
            .get(upstream)
            .map(|b| b.lock().unwrap().state)
            .unwrap_or(BreakerState::Closed)
    }

    /// Whether forwards to `upstream` should be suppressed.
    ///
    /// Half-open is not "open": it permits the trial request.
    pub fn is_open(&self, upstream: &str) -> bool {
        self.state(upstream) == BreakerState::Open
    }

    /// Snapshot of every tracked breaker.
    pub fn states(&self) -> BTreeMap<String, BreakerState> {
        self.breakers
            .read()
            .unwrap()
            .iter()
            .map(|(k, b)| (k.clone(), b.lock().unwrap().state))
            .collect()
    }

    pub fn any_open(&self) -> bool {
        self.breakers
            .read()
            .unwrap()
            .values()
            .any(|b| b.lock().unwrap().state == BreakerState::Open)
    }

    /// Moves elapsed open breakers to half-open.
    ///
    /// Called from the health monitor's periodic loop so recovery does not
    /// depend on request traffic arriving first.
    pub fn tick(&self) {
        let breakers: Vec<(String, Arc<Mutex<Breaker>>)> = self
            .breakers
            .read()
            .unwrap()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let now = Instant::now();
        for (upstream, breaker) in breakers {
            let mut guard = breaker.lock().unwrap();
            if guard.state == BreakerState::Open && guard.reset_elapsed(now, &self.config) {
                guard.state = BreakerState::HalfOpen;
                guard.trial_in_flight = false;
                drop(guard);
                self.notify(&upstream, BreakerState::HalfOpen);
            }
        }
    }

    /// Drops breakers for upstreams no longer in the routing table.
    ///
    /// Returns the removed origins. A re-added upstream starts fresh
    /// (closed, empty window).
    pub fn retain(&self, keep: &HashSet<String>) -> Vec<String> {
        let mut map = self.breakers.write().unwrap();
        let removed: Vec<String> = map
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        map.retain(|k, _| keep.contains(k));
        if !removed.is_empty() {
            warn!(count = removed.len(), "dropped breakers for removed upstreams");
        }
        removed
    }
}

struct TrialGuard<'a> {
    registry: &'a BreakerRegistry,
    upstream: &'a str,
    armed: bool,
}

impl TrialGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.registry.release_trial(self.upstream);
        }
    }
}
