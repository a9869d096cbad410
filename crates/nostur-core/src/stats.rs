use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::backlog::BacklogStats;

/// Counters for traffic received from relays and for backlog outcomes
#[derive(Debug, Default, Clone)]
pub struct RelayStats {
    /// Counts by kind -> relay url -> count
    pub by_kind_relay: HashMap<u16, HashMap<String, u64>>,
    /// Total count by kind
    pub by_kind_total: HashMap<u16, u64>,
    /// Total events received
    pub total: u64,
    /// Latest backlog totals reported by the worker
    pub backlog: BacklogStats,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, relay_url: &str, kind: u16) {
        self.total += 1;
        *self.by_kind_total.entry(kind).or_insert(0) += 1;
        *self
            .by_kind_relay
            .entry(kind)
            .or_default()
            .entry(relay_url.to_string())
            .or_insert(0) += 1;
    }

    /// Get summary organized by relay
    pub fn by_relay(&self) -> HashMap<String, HashMap<u16, u64>> {
        let mut result: HashMap<String, HashMap<u16, u64>> = HashMap::new();
        for (kind, relays) in &self.by_kind_relay {
            for (relay, count) in relays {
                result.entry(relay.clone()).or_default().insert(*kind, *count);
            }
        }
        result
    }

    /// Get list of kinds sorted by total count (descending)
    pub fn kinds_by_count(&self) -> Vec<(u16, u64)> {
        let mut kinds: Vec<_> = self.by_kind_total.iter().map(|(&k, &c)| (k, c)).collect();
        kinds.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        kinds
    }
}

/// Thread-safe wrapper for relay stats
#[derive(Debug, Clone, Default)]
pub struct SharedRelayStats {
    inner: Arc<RwLock<RelayStats>>,
}

impl SharedRelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&self, relay_url: &str, kind: u16) {
        if let Ok(mut stats) = self.inner.write() {
            stats.record_event(relay_url, kind);
        }
    }

    pub fn set_backlog(&self, backlog: BacklogStats) {
        if let Ok(mut stats) = self.inner.write() {
            stats.backlog = backlog;
        }
    }

    pub fn snapshot(&self) -> RelayStats {
        self.inner.read().map(|s| s.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_summaries() {
        let stats = SharedRelayStats::new();
        stats.record_event("wss://a", 1);
        stats.record_event("wss://a", 1);
        stats.record_event("wss://b", 3);
        stats.set_backlog(BacklogStats {
            timed_out: 1,
            ..BacklogStats::default()
        });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.kinds_by_count(), vec![(1, 2), (3, 1)]);
        assert_eq!(snapshot.by_relay()["wss://a"][&1], 2);
        assert_eq!(snapshot.backlog.timed_out, 1);
    }
}
