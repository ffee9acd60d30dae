use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::context::TimeProvider;

/// Age of a snapshot in seconds: the timestamp embedded in its payload when there is
/// one, otherwise the file's modification time. `None` when neither is known.
pub fn heartbeat_age(now: i64, embedded: Option<i64>, mtime: Option<i64>) -> Option<i64> {
    embedded
        .filter(|ts| *ts > 0)
        .or(mtime)
        .map(|ts| now - ts)
}

/// Connected iff the heartbeat is known and no older than the timeout.
pub fn is_fresh(now: i64, embedded: Option<i64>, mtime: Option<i64>, timeout_secs: u64) -> bool {
    let timeout = i64::try_from(timeout_secs).unwrap_or(i64::MAX);
    heartbeat_age(now, embedded, mtime)
        .map(|age| age <= timeout)
        .unwrap_or(false)
}

/// Last-update clock per key (state file name on the agent, entity on the controller).
#[derive(Clone)]
pub struct FreshnessMonitor {
    last_updates: Arc<RwLock<HashMap<String, i64>>>,
    time: Arc<dyn TimeProvider>,
}

impl FreshnessMonitor {
    pub fn new(time: Arc<dyn TimeProvider>) -> Self {
        Self {
            last_updates: Arc::new(RwLock::new(HashMap::new())),
            time,
        }
    }

    pub fn update(&self, key: &str) {
        let now = self.time.now_secs();
        self.update_at(key, now);
    }

    pub fn update_at(&self, key: &str, ts_secs: i64) {
        self.last_updates.write().insert(key.to_string(), ts_secs);
    }

    pub fn last_update(&self, key: &str) -> Option<i64> {
        self.last_updates.read().get(key).copied()
    }

    pub fn age(&self, key: &str) -> Option<i64> {
        let now = self.time.now_secs();
        self.last_update(key).map(|ts| now - ts)
    }

    pub fn is_stale(&self, key: &str, threshold_secs: i64) -> bool {
        match self.age(key) {
            Some(age) => age > threshold_secs,
            // Never seen counts as stale
            None => true,
        }
    }

    pub fn ages(&self) -> BTreeMap<String, i64> {
        let now = self.time.now_secs();
        self.last_updates
            .read()
            .iter()
            .map(|(k, ts)| (k.clone(), now - ts))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LastCommand {
    pub action: String,
    pub outcome: String,
    pub trade_id: String,
    pub at: i64,
}

/// Agent liveness as reported by the ops API.
#[derive(Debug, Clone, Serialize, Default)]
pub struct AgentStatus {
    pub started_at: i64,
    pub last_tick: i64,
    pub ticks: u64,
    pub commands_processed: u64,
    pub last_command: Option<LastCommand>,
}

pub type SharedStatus = Arc<RwLock<AgentStatus>>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SimulatedTimeProvider;

    #[test]
    fn test_heartbeat_past_timeout_is_disconnected() {
        assert!(!is_fresh(1723200045, Some(1723200000), None, 30));
        assert!(is_fresh(1723200030, Some(1723200000), None, 30));
        // mtime is only a fallback for a missing embedded timestamp
        assert!(!is_fresh(1723200045, Some(1723200000), Some(1723200044), 30));
        assert!(is_fresh(1723200045, None, Some(1723200044), 30));
        assert!(!is_fresh(1723200045, None, None, 30));
    }

    #[test]
    fn test_monitor_ages_follow_clock() {
        let clock = Arc::new(SimulatedTimeProvider::new(1_000_000));
        let monitor = FreshnessMonitor::new(clock.clone());

        assert!(monitor.is_stale("positions.json", 5));
        monitor.update("positions.json");
        assert!(!monitor.is_stale("positions.json", 5));

        clock.advance(6_000);
        assert_eq!(monitor.age("positions.json"), Some(6));
        assert!(monitor.is_stale("positions.json", 5));
        assert_eq!(monitor.ages().get("positions.json"), Some(&6));
    }
}
