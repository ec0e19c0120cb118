//! Engine statistics - lock-free counters shared by all engines

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Cumulative counters, updated with relaxed atomics
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Positions created by placement
    pub placements: AtomicU64,
    /// Slot claims lost to a concurrent writer (each one is a rescan)
    pub placement_conflicts: AtomicU64,
    /// Placements rejected (no slot, conflict budget exhausted)
    pub placement_failures: AtomicU64,
    pub enrollments: AtomicU64,
    /// Volume events applied
    pub volume_events: AtomicU64,
    /// Sum of applied volume deltas
    pub volume_total: AtomicU64,
    pub cycles_completed: AtomicU64,
    pub commission_amount: AtomicU64,
    /// Evaluations that found their cycle already in the ledger
    pub qualification_replays: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_placement(&self) {
        self.placements.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placement_conflict(&self) {
        self.placement_conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_placement_failure(&self) {
        self.placement_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enrollment(&self) {
        self.enrollments.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_volume(&self, delta: u64) {
        self.volume_events.fetch_add(1, Ordering::Relaxed);
        self.volume_total.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn record_cycle(&self, amount: u64) {
        self.cycles_completed.fetch_add(1, Ordering::Relaxed);
        self.commission_amount.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn record_replay(&self) {
        self.qualification_replays.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStatsSnapshot {
        EngineStatsSnapshot {
            placements: self.placements.load(Ordering::Relaxed),
            placement_conflicts: self.placement_conflicts.load(Ordering::Relaxed),
            placement_failures: self.placement_failures.load(Ordering::Relaxed),
            enrollments: self.enrollments.load(Ordering::Relaxed),
            volume_events: self.volume_events.load(Ordering::Relaxed),
            volume_total: self.volume_total.load(Ordering::Relaxed),
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            commission_amount: self.commission_amount.load(Ordering::Relaxed),
            qualification_replays: self.qualification_replays.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStatsSnapshot {
    pub placements: u64,
    pub placement_conflicts: u64,
    pub placement_failures: u64,
    pub enrollments: u64,
    pub volume_events: u64,
    pub volume_total: u64,
    pub cycles_completed: u64,
    pub commission_amount: u64,
    pub qualification_replays: u64,
}

impl std::fmt::Display for EngineStatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "PowerLine Stats: placements={} (conflicts={}, failed={}), enrollments={}, volume_events={} (total={}), cycles={} (amount={}), replays={}",
            self.placements,
            self.placement_conflicts,
            self.placement_failures,
            self.enrollments,
            self.volume_events,
            self.volume_total,
            self.cycles_completed,
            self.commission_amount,
            self.qualification_replays
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let stats = EngineStats::new();
        stats.record_placement();
        stats.record_placement_conflict();
        stats.record_volume(250);
        stats.record_volume(100);
        stats.record_cycle(50);

        let snap = stats.snapshot();
        assert_eq!(snap.placements, 1);
        assert_eq!(snap.placement_conflicts, 1);
        assert_eq!(snap.volume_events, 2);
        assert_eq!(snap.volume_total, 350);
        assert_eq!(snap.commission_amount, 50);
        assert!(snap.to_string().starts_with("PowerLine Stats: placements=1"));
    }
}
