//! Config file watcher.
//!
//! A periodic task polls the config file's metadata and asks the supervisor
//! to rebuild when it settles after a change. Successive writes are
//! coalesced: a rebuild fires only once the file has been stable for the
//! debounce window, so editors that write in several steps (and the initial
//! deploy sync) trigger a single rebuild. Watcher errors are logged and
//! never propagate.

use crate::supervisor::RouterSupervisor;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);
const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(500);

/// Change fingerprint: mtime plus length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Fingerprint {
    modified: Option<SystemTime>,
    len: u64,
}

fn fingerprint(path: &PathBuf) -> Option<Fingerprint> {
    let metadata = std::fs::metadata(path).ok()?;
    Some(Fingerprint {
        modified: metadata.modified().ok(),
        len: metadata.len(),
    })
}

pub struct ConfigWatcher {
    path: PathBuf,
    poll_interval: Duration,
    debounce: Duration,
}

impl ConfigWatcher {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            poll_interval: DEFAULT_POLL_INTERVAL,
            debounce: DEFAULT_DEBOUNCE,
        }
    }

    /// Shorter windows for tests.
    pub fn with_timing(path: PathBuf, poll_interval: Duration, debounce: Duration) -> Self {
        Self {
            path,
            poll_interval,
            debounce,
        }
    }

    /// Starts the watcher task. Abort the handle to stop watching (the
    /// shutdown path does, so late rebuilds are ignored).
    pub fn spawn(self, supervisor: Arc<RouterSupervisor>) -> JoinHandle<()> {
        tokio::spawn(self.run(supervisor))
    }

    async fn run(self, supervisor: Arc<RouterSupervisor>) {
        let mut seen = fingerprint(&self.path);
        let mut pending_since: Option<Instant> = None;
        let mut missing_logged = false;

        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(config = %self.path.display(), "watching configuration file");

        loop {
            ticker.tick().await;

            let current = fingerprint(&self.path);
            if current.is_none() {
                if !missing_logged {
                    warn!(config = %self.path.display(), "configuration file is not readable");
                    missing_logged = true;
                }
            } else {
                missing_logged = false;
            }

            if current != seen {
                debug!(config = %self.path.display(), "configuration change detected");
                seen = current;
                pending_since = Some(Instant::now());
                continue;
            }

            // Stable since the last change long enough: rebuild once.
            if let Some(since) = pending_since {
                if since.elapsed() >= self.debounce {
                    pending_since = None;
                    if let Err(err) = supervisor.rebuild().await {
                        warn!(error = %err, "watcher-triggered rebuild failed");
                    }
                }
            }
        }
    }
}
