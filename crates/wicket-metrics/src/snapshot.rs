//! Serializable report types behind the detailed `/health` endpoint.

use serde::Serialize;
use std::collections::BTreeMap;

/// Full health report: overall status plus per-subsystem detail.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthReport {
    pub status: String,
    pub timestamp: String,
    pub memory: MemoryReport,
    pub circuit_breakers: BTreeMap<String, String>,
    pub upstreams: BTreeMap<String, UpstreamReport>,
    pub process: ProcessReport,
}

/// Resident memory of this process, when the platform exposes it.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryReport {
    pub rss_bytes: Option<u64>,
}

impl MemoryReport {
    /// Reads the resident set from `/proc/self/statm`; `None` elsewhere.
    pub fn sample() -> Self {
        Self {
            rss_bytes: rss_bytes(),
        }
    }
}

/// Health-monitor view of one upstream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamReport {
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

/// Identity of the running process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    pub pid: u32,
    pub uptime_seconds: u64,
    pub version: String,
}

#[cfg(target_os = "linux")]
fn rss_bytes() -> Option<u64> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    let resident_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096)
}

#[cfg(not(target_os = "linux"))]
fn rss_bytes() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_report_serializes_camel_case() {
        let mut breakers = BTreeMap::new();
        breakers.insert("http://u:1".to_string(), "closed".to_string());
        let mut upstreams = BTreeMap::new();
        upstreams.insert(
            "http://u:1".to_string(),
            UpstreamReport {
                healthy: true,
                consecutive_failures: 0,
                consecutive_successes: 4,
            },
        );

        let report = HealthReport {
            status: "healthy".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            memory: MemoryReport { rss_bytes: Some(1) },
            circuit_breakers: breakers,
            upstreams,
            process: ProcessReport {
                pid: 1,
                uptime_seconds: 10,
                version: "0.0.0".to_string(),
            },
        };

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["status"], "healthy");
        assert!(value.get("circuitBreakers").is_some());
        assert_eq!(value["upstreams"]["http://u:1"]["consecutiveSuccesses"], 4);
        assert_eq!(value["process"]["uptimeSeconds"], 10);
        assert_eq!(value["memory"]["rssBytes"], 1);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_rss_sample_on_linux() {
        assert!(MemoryReport::sample().rss_bytes.unwrap() > 0);
    }
}
