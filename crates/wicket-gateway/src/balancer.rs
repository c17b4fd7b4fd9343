//! Upstream selection strategies.
//!
//! Selection is a pure function over the candidate list plus a per-route
//! cursor record. The cursor is the only mutable piece and uses atomic
//! increments, so the routing table itself stays immutable and lock-free.

use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tracing::{info, warn};
use wicket_core::LbStrategy;

/// Per-route selection state: the round-robin counter and the one-shot
/// degraded flag used to log health-aware failover once per transition.
#[derive(Debug, Default)]
pub struct LbCursor {
    next: AtomicUsize,
    degraded: AtomicBool,
}

impl LbCursor {
    pub fn new() -> Self {
        Self::default()
    }

    fn advance(&self) -> usize {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

/// Picks an upstream from `candidates` using the route's strategy.
///
/// `health_aware` round-robins over the healthy sublist; with no healthy
/// candidate it fails over to the full list, logging a warning once per
/// degradation and an info line on recovery. Returns `None` only for an
/// empty candidate list.
pub fn select<'a>(
    strategy: LbStrategy,
    candidates: &'a [String],
    cursor: &LbCursor,
    is_healthy: impl Fn(&str) -> bool,
) -> Option<&'a str> {
    if candidates.is_empty() {
        return None;
    }
    match strategy {
        LbStrategy::RoundRobin => {
            Some(candidates[cursor.advance() % candidates.len()].as_str())
        }
        LbStrategy::Random => {
            let index = rand::thread_rng().gen_range(0..candidates.len());
            Some(candidates[index].as_str())
        }
        LbStrategy::HealthAware => {
            let healthy: Vec<&str> = candidates
                .iter()
                .map(String::as_str)
                .filter(|c| is_healthy(c))
                .collect();
            if healthy.is_empty() {
                if !cursor.degraded.swap(true, Ordering::Relaxed) {
                    warn!("no healthy upstreams, failing over to full candidate set");
                }
                Some(candidates[cursor.advance() % candidates.len()].as_str())
            } else {
                if cursor.degraded.swap(false, Ordering::Relaxed) {
                    info!("healthy upstreams available again");
                }
                Some(healthy[cursor.advance() % healthy.len()])
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidates(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_round_robin_cycles_in_order() {
        let cands = candidates(&["a", "b", "c"]);
        let cursor = LbCursor::new();
        let picks: Vec<&str> = (0..6)
            .map(|_| select(LbStrategy::RoundRobin, &cands, &cursor, |_| true).unwrap())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_distributes_evenly() {
        let cands = candidates(&["a", "b", "c"]);
        let cursor = LbCursor::new();
        let mut counts = std::collections::HashMap::new();
        for _ in 0..300 {
            let pick = select(LbStrategy::RoundRobin, &cands, &cursor, |_| true).unwrap();
            *counts.entry(pick).or_insert(0) += 1;
        }
        assert_eq!(counts["a"], 100);
        assert_eq!(counts["b"], 100);
        assert_eq!(counts["c"], 100);
    }

    #[test]
    fn test_random_only_picks_candidates() {
        let cands = candidates(&["a", "b"]);
        let cursor = LbCursor::new();
        for _ in 0..50 {
            let pick = select(LbStrategy::Random, &cands, &cursor, |_| true).unwrap();
            assert!(pick == "a" || pick == "b");
        }
    }

    #[test]
    fn test_empty_candidates_yield_none() {
        let cursor = LbCursor::new();
        assert!(select(LbStrategy::RoundRobin, &[], &cursor, |_| true).is_none());
        assert!(select(LbStrategy::Random, &[], &cursor, |_| true).is_none());
        assert!(select(LbStrategy::HealthAware, &[], &cursor, |_| true).is_none());
    }

    #[test]
    fn test_health_aware_skips_unhealthy() {
        let cands = candidates(&["a", "b", "c"]);
        let cursor = LbCursor::new();
        let picks: Vec<&str> = (0..4)
            .map(|_| {
                select(LbStrategy::HealthAware, &cands, &cursor, |c| c != "b").unwrap()
            })
            .collect();
        assert_eq!(picks, vec!["a", "c", "a", "c"]);
    }

    #[test]
    fn test_health_aware_falls_back_to_full_set() {
        let cands = candidates(&["a", "b"]);
        let cursor = LbCursor::new();
        let pick = select(LbStrategy::HealthAware, &cands, &cursor, |_| false).unwrap();
        assert!(pick == "a" || pick == "b");
        // Degraded flag set exactly once.
        assert!(cursor.degraded.load(Ordering::Relaxed));
        select(LbStrategy::HealthAware, &cands, &cursor, |_| false).unwrap();
        assert!(cursor.degraded.load(Ordering::Relaxed));
    }

    #[test]
    fn test_health_aware_recovers_from_degraded() {
        let cands = candidates(&["a", "b"]);
        let cursor = LbCursor::new();
        select(LbStrategy::HealthAware, &cands, &cursor, |_| false).unwrap();
        assert!(cursor.degraded.load(Ordering::Relaxed));
        let pick = select(LbStrategy::HealthAware, &cands, &cursor, |c| c == "a").unwrap();
        assert_eq!(pick, "a");
        assert!(!cursor.degraded.load(Ordering::Relaxed));
    }

    #[test]
    fn test_cursor_advances_across_health_aware_picks() {
        // The same cursor drives both the healthy sublist and the full set,
        // so rotation continues across failover boundaries.
        let cands = candidates(&["a", "b", "c"]);
        let cursor = LbCursor::new();
        let first = select(LbStrategy::HealthAware, &cands, &cursor, |_| true).unwrap();
        let second = select(LbStrategy::HealthAware, &cands, &cursor, |_| true).unwrap();
        assert_ne!(first, second);
    }
}
