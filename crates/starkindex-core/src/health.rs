//! Liveness tracking for the indexer's external dependencies.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Snapshot of dependency liveness, as reported by `health_check()`.
///
/// A dependency is healthy when it completed an interaction within the
/// observation window (30 seconds by default).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Health {
    pub ws: bool,
    pub rpc: bool,
    pub database: bool,
}

#[derive(Default)]
struct LastSeen {
    ws: Option<Instant>,
    rpc: Option<Instant>,
    database: Option<Instant>,
}

/// Records the last successful interaction with each dependency.
///
/// Shared across the transports and the processor; all marks are cheap.
#[derive(Default)]
pub struct HealthTracker {
    last_seen: Mutex<LastSeen>,
}

impl HealthTracker {
    pub const WINDOW: Duration = Duration::from_secs(30);

    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_ws(&self) {
        self.last_seen.lock().unwrap().ws = Some(Instant::now());
    }

    pub fn mark_rpc(&self) {
        self.last_seen.lock().unwrap().rpc = Some(Instant::now());
    }

    pub fn mark_database(&self) {
        self.last_seen.lock().unwrap().database = Some(Instant::now());
    }

    /// Liveness within the default 30-second window.
    pub fn snapshot(&self) -> Health {
        self.snapshot_within(Self::WINDOW)
    }

    pub fn snapshot_within(&self, window: Duration) -> Health {
        let last_seen = self.last_seen.lock().unwrap();
        let fresh = |t: Option<Instant>| t.is_some_and(|t| t.elapsed() <= window);
        Health {
            ws: fresh(last_seen.ws),
            rpc: fresh(last_seen.rpc),
            database: fresh(last_seen.database),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmarked_dependencies_are_down() {
        let tracker = HealthTracker::new();
        let health = tracker.snapshot();
        assert!(!health.ws && !health.rpc && !health.database);
    }

    #[test]
    fn marks_show_up_within_window() {
        let tracker = HealthTracker::new();
        tracker.mark_rpc();
        tracker.mark_database();
        let health = tracker.snapshot();
        assert!(health.rpc);
        assert!(health.database);
        assert!(!health.ws);
    }

    #[test]
    fn marks_expire_outside_window() {
        let tracker = HealthTracker::new();
        tracker.mark_ws();
        let health = tracker.snapshot_within(Duration::ZERO);
        assert!(!health.ws);
    }
}
