//! Worker-private counters, read by the stats thread without synchronization.
//!
//! Fields are `AtomicU64` purely to stay inside Rust's aliasing rules for
//! cross-thread reads; every update uses `Relaxed` ordering, so the values
//! the stats thread observes can be mildly stale, by design (`spec.md` §5).
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Default)]
pub struct WorkerStats {
    pub pkts_in: AtomicU64,
    pub pkts_parsed: AtomicU64,
    pub pkts_matched: AtomicU64,
    pub pkts_forwarded: AtomicU64,
    pub pkts_dropped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct WorkerStatsSnapshot {
    pub pkts_in: u64,
    pub pkts_parsed: u64,
    pub pkts_matched: u64,
    pub pkts_forwarded: u64,
    pub pkts_dropped: u64,
}

impl WorkerStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn inc_in(&self) {
        self.pkts_in.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_parsed(&self) {
        self.pkts_parsed.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_matched(&self) {
        self.pkts_matched.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_forwarded(&self, n: u64) {
        self.pkts_forwarded.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_dropped(&self, n: u64) {
        self.pkts_dropped.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn snapshot(&self) -> WorkerStatsSnapshot {
        WorkerStatsSnapshot {
            pkts_in: self.pkts_in.load(Ordering::Relaxed),
            pkts_parsed: self.pkts_parsed.load(Ordering::Relaxed),
            pkts_matched: self.pkts_matched.load(Ordering::Relaxed),
            pkts_forwarded: self.pkts_forwarded.load(Ordering::Relaxed),
            pkts_dropped: self.pkts_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Per-rule packet/byte counters, indexed by `rule_id`.
#[derive(Default)]
struct RuleStat {
    packets: AtomicU64,
    bytes: AtomicU64,
}

pub struct RuleStatsTable {
    stats: Vec<RuleStat>,
}

impl RuleStatsTable {
    #[must_use]
    pub fn new(rule_count: usize) -> Self {
        let mut stats = Vec::with_capacity(rule_count);
        stats.resize_with(rule_count, RuleStat::default);
        Self { stats }
    }

    pub fn record(&self, rule_id: u32, bytes: u64) {
        if let Some(stat) = self.stats.get(rule_id as usize) {
            stat.packets.fetch_add(1, Ordering::Relaxed);
            stat.bytes.fetch_add(bytes, Ordering::Relaxed);
        }
    }

    #[must_use]
    pub fn snapshot(&self, rule_id: u32) -> (u64, u64) {
        self.stats.get(rule_id as usize).map_or((0, 0), |s| {
            (s.packets.load(Ordering::Relaxed), s.bytes.load(Ordering::Relaxed))
        })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.stats.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_stats_snapshot_reflects_updates() {
        let stats = WorkerStats::new();
        stats.inc_in();
        stats.inc_in();
        stats.inc_parsed();
        stats.add_dropped(3);
        let snap = stats.snapshot();
        assert_eq!(snap.pkts_in, 2);
        assert_eq!(snap.pkts_parsed, 1);
        assert_eq!(snap.pkts_dropped, 3);
    }

    #[test]
    fn rule_stats_indexed_by_rule_id() {
        let table = RuleStatsTable::new(3);
        table.record(1, 100);
        table.record(1, 50);
        assert_eq!(table.snapshot(1), (2, 150));
        assert_eq!(table.snapshot(0), (0, 0));
    }
}
