//! Introspection snapshots

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::config::Algorithm;
use super::quota::CounterKey;
use super::store::CounterEntry;
use super::users::UserTokenInfo;
use super::window::WindowEntry;

/// A sliding window together with its key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowSnapshot {
    pub key: CounterKey,
    #[serde(flatten)]
    pub window: WindowEntry,
}

/// Point-in-time view of an engine's state
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStats {
    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,

    /// Engine that produced the snapshot
    pub algorithm: Algorithm,

    /// Fixed-second counters, pools first
    pub counters: Vec<CounterEntry>,

    /// Sliding windows, pools first
    pub windows: Vec<WindowSnapshot>,

    /// Users and their tokens
    pub users: Vec<UserTokenInfo>,

    /// Tokens with an in-flight quota lookup
    pub pending_fetches: Vec<String>,
}

impl ThrottleStats {
    /// Requests still admissible in the current bucket of each key
    pub fn remaining(&self) -> Vec<(CounterKey, i64)> {
        self.counters
            .iter()
            .map(|c| (c.key.clone(), c.remaining_rps))
            .chain(self.windows.iter().map(|w| (w.key.clone(), w.window.remaining_rps)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::throttle::quota::{PoolKey, Quota};

    #[test]
    fn test_serializes_to_json() {
        let key = CounterKey::from(PoolKey::GuestPool);
        let stats = ThrottleStats {
            timestamp: Utc::now(),
            algorithm: Algorithm::SlidingWindow,
            counters: vec![CounterEntry::new(key.clone(), Quota::guest(20), 1)],
            windows: vec![WindowSnapshot {
                key,
                window: WindowEntry::open(1000, 20),
            }],
            users: Vec::new(),
            pending_fetches: vec!["t1".to_string()],
        };

        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["algorithm"], "sliding-window");
        assert_eq!(json["windows"][0]["end_millis"], 2000);
        assert_eq!(json["pending_fetches"][0], "t1");
        assert_eq!(stats.remaining().len(), 2);
    }
}
