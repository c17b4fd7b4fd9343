//! Exponential-backoff retry driver.
//!
//! [`execute`] invokes an async operation up to `max_retries + 1` times,
//! sleeping `min(initial * factor^n, max_delay)` with ±20 % uniform jitter
//! between attempts. The caller supplies the retryable predicate and an
//! optional observer; the proxy pipeline reuses this driver with its own
//! short per-request policy while everything else uses the env-configured
//! defaults.

use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Jitter applied to every computed delay: ±20 %.
const JITTER_FRACTION: f64 = 0.2;

/// Backoff policy for [`execute`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub max_delay: Duration,
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Per-attempt delay cap inside the proxy pipeline. The engine-wide
    /// policy may back off up to `max_delay`, but between forward attempts
    /// of a single request a wait longer than this just burns the request's
    /// own deadline.
    pub const PER_REQUEST_DELAY_CAP: Duration = Duration::from_secs(1);

    /// Derives the pipeline profile for one request: same curve, delay
    /// capped to the per-request budget (with defaults:
    /// `min(100ms * 2^n, 1s)`), retries from the route.
    pub fn clamped_for_request(&self, max_retries: u32) -> Self {
        Self {
            initial: self.initial,
            factor: self.factor,
            max_delay: self.max_delay.min(Self::PER_REQUEST_DELAY_CAP),
            max_retries,
        }
    }
}

/// Computes the jittered delay before retry number `attempt` (0-based).
pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let base_ms = policy.initial.as_millis() as f64 * policy.factor.powi(attempt as i32);
    let capped_ms = base_ms.min(policy.max_delay.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(-JITTER_FRACTION..=JITTER_FRACTION);
    let with_jitter = (capped_ms * (1.0 + jitter)).max(0.0);
    Duration::from_millis(with_jitter as u64)
}

/// Runs `op` under the policy, retrying failures that satisfy `is_retryable`.
///
/// `op` receives the 0-based attempt number. `on_retry` is called before each
/// sleep with the upcoming attempt number, the error that triggered it, and
/// the computed delay. The final error is returned unchanged when attempts
/// are exhausted or the predicate rejects it.
pub async fn execute<T, E, F, Fut>(
    policy: &RetryPolicy,
    mut op: F,
    is_retryable: impl Fn(&E) -> bool,
    mut on_retry: impl FnMut(u32, &E, Duration),
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if attempt >= policy.max_retries || !is_retryable(&err) {
                    return Err(err);
                }
                let delay = backoff_delay(policy, attempt);
                on_retry(attempt + 1, &err, delay);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn instant_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            initial: Duration::ZERO,
            factor: 2.0,
            max_delay: Duration::ZERO,
            max_retries,
        }
    }

    #[tokio::test]
    async fn test_success_on_first_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, &str> = execute(
            &instant_policy(3),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert_eq!(result, Ok(42));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhausts_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = execute(
            &instant_policy(2),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("ECONNREFUSED".to_string())
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        // max_retries = 2 means up to 3 invocations
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), String> = execute(
            &instant_policy(5),
            move |_| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err("bad request".to_string())
                }
            },
            |e: &String| e.contains("ECONNREFUSED"),
            |_, _, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<u32, String> = execute(
            &instant_policy(3),
            move |attempt| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("ETIMEDOUT".to_string())
                    } else {
                        Ok(attempt)
                    }
                }
            },
            |_| true,
            |_, _, _| {},
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_on_retry_observer_sees_each_retry() {
        let observed = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = observed.clone();
        let _: Result<(), String> = execute(
            &instant_policy(2),
            |_| async { Err("ECONNRESET".to_string()) },
            |_| true,
            move |attempt, err, delay| {
                sink.lock().unwrap().push((attempt, err.clone(), delay));
            },
        )
        .await;
        let observed = observed.lock().unwrap();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].0, 1);
        assert_eq!(observed[1].0, 2);
    }

    #[test]
    fn test_backoff_delay_within_jitter_bounds() {
        let policy = RetryPolicy::default();
        for attempt in 0..4 {
            let base = 100.0 * 2f64.powi(attempt as i32);
            let delay = backoff_delay(&policy, attempt).as_millis() as f64;
            assert!(delay >= base * 0.8 - 1.0, "attempt {attempt}: {delay} < {}", base * 0.8);
            assert!(delay <= base * 1.2 + 1.0, "attempt {attempt}: {delay} > {}", base * 1.2);
        }
    }

    #[test]
    fn test_backoff_delay_caps_at_max() {
        let policy = RetryPolicy {
            initial: Duration::from_millis(100),
            factor: 2.0,
            max_delay: Duration::from_secs(1),
            max_retries: 10,
        };
        // 100 * 2^10 would be far past the cap.
        let delay = backoff_delay(&policy, 10);
        assert!(delay <= Duration::from_millis(1200));
    }

    #[test]
    fn test_per_request_profile_caps_delay() {
        let policy = RetryPolicy::default().clamped_for_request(2);
        assert_eq!(policy.initial, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(1));
        assert_eq!(policy.max_retries, 2);

        // A policy already below the cap keeps its own ceiling.
        let short = RetryPolicy {
            max_delay: Duration::from_millis(300),
            ..RetryPolicy::default()
        };
        assert_eq!(
            short.clamped_for_request(1).max_delay,
            Duration::from_millis(300)
        );
    }
}
