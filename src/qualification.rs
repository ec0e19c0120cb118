//! Qualification Engine - binary cycle detection and consumption
//!
//! A cycle is `C` units of matched volume on both legs. For each granted
//! cycle the engine deducts `C` from both legs, bumps the counters and emits
//! one commission of `R` to the occupant.
//!
//! The whole read-compute-deduct-emit sequence runs inside the node's
//! exclusive section (`TreeStore::update`). Within it, each cycle is
//! appended to the ledger and journaled before the next one is computed; a
//! failure keeps the cycles already recorded and reports the error.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::config::QualificationConfig;
use crate::core_types::{Amount, NodeId, Volume};
use crate::error::PowerLineError;
use crate::journal::Journal;
use crate::ledger::CommissionLedger;
use crate::models::{
    CommissionEvent, CommissionId, CommissionType, Position, QualificationWindow, Side,
};
use crate::stats::EngineStats;
use crate::store::TreeStore;

/// Read-only qualification view of one position
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualificationSummary {
    pub node_id: NodeId,
    pub left_leg_volume: Volume,
    pub right_leg_volume: Volume,
    pub lesser_leg_volume: Volume,
    /// `floor(lesser / C)` ignoring the window cap
    pub cycles_available: u64,
    /// Volume the lesser leg still needs for its next cycle
    pub next_cycle_gap_amount: Volume,
    pub cycles_completed: u64,
    pub cycles_in_window: u32,
}

/// Earnings projection derived from the qualification summary
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PotentialEarnings {
    pub node_id: NodeId,
    /// Commission the currently matched volume would pay
    pub next_cycle: Amount,
    pub next_30_days: Decimal,
    pub next_90_days: Decimal,
    pub focus_leg: Side,
    pub next_cycle_gap_amount: Volume,
}

pub struct QualificationEngine {
    store: Arc<dyn TreeStore>,
    ledger: Arc<CommissionLedger>,
    journal: Option<Arc<Journal>>,
    stats: Arc<EngineStats>,
    config: QualificationConfig,
}

impl QualificationEngine {
    pub fn new(
        store: Arc<dyn TreeStore>,
        ledger: Arc<CommissionLedger>,
        journal: Option<Arc<Journal>>,
        stats: Arc<EngineStats>,
        config: QualificationConfig,
    ) -> Result<Self, PowerLineError> {
        config.validate()?;
        Ok(Self {
            store,
            ledger,
            journal,
            stats,
            config,
        })
    }

    pub fn config(&self) -> &QualificationConfig {
        &self.config
    }

    pub fn evaluate(&self, node_id: &NodeId) -> Result<Vec<CommissionEvent>, PowerLineError> {
        self.evaluate_at(node_id, Utc::now())
    }

    /// Detect, consume and emit every cycle the node currently qualifies for.
    ///
    /// Vacant positions never qualify; their matched volume stays in the legs.
    pub fn evaluate_at(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommissionEvent>, PowerLineError> {
        let cycle_volume = self.config.cycle_volume;
        let mut emitted = Vec::new();
        let mut failure = None;

        self.store.update(
            node_id,
            &mut |position: &mut Position| -> Result<(), PowerLineError> {
                let Some(recipient) = position.occupant.as_ref().map(|o| o.promoter_id) else {
                    return Ok(());
                };
                let available = position.lesser_leg_volume() / cycle_volume;
                if available == 0 {
                    return Ok(());
                }

                let position_number = position.position_number;
                let mut window = self.current_window(position.window, now);
                let granted = match self.config.max_cycles_per_window {
                    Some(cap) => available.min(u64::from(cap.saturating_sub(window.cycles_in_window))),
                    None => available,
                };
                if granted < available {
                    debug!(
                        node_id = %position.node_id,
                        available,
                        granted,
                        "Cycle cap reached, matched volume stays banked"
                    );
                }

                for _ in 0..granted {
                    let cycle_number = position.cycles_completed + 1;
                    window.cycles_in_window += 1;
                    let event = CommissionEvent {
                        id: CommissionId {
                            node_id: position.node_id.clone(),
                            cycle_number,
                        },
                        recipient,
                        amount: self.config.commission_per_cycle,
                        commission_type: CommissionType::BinaryCycle,
                        created_at: now,
                        seq: 0,
                    };

                    let appended = self.ledger.append_with(
                        event,
                        &mut |event: &CommissionEvent| -> Result<(), PowerLineError> {
                            match &self.journal {
                                Some(journal) => journal
                                    .cycle_completed(event, position_number, cycle_volume, Some(window))
                                    .map(|_| ()),
                                None => Ok(()),
                            }
                        },
                    );
                    match appended {
                        Ok(event) => {
                            self.stats.record_cycle(event.amount);
                            emitted.push(event);
                        }
                        Err(PowerLineError::QualificationReplay(id)) => {
                            // Already paid and journaled: the ledger only holds
                            // events whose CycleCompleted record was written, so
                            // recovery deducts this cycle too. Only the node
                            // state catches up here.
                            debug!(commission_id = %id, "Cycle already in ledger");
                            self.stats.record_replay();
                        }
                        Err(e) => {
                            failure = Some(e);
                            break;
                        }
                    }

                    position.left_leg_volume -= cycle_volume;
                    position.right_leg_volume -= cycle_volume;
                    position.cycles_completed = cycle_number;
                    position.window = Some(window);
                }
                Ok(())
            },
        )?;

        if let Some(e) = failure {
            error!(
                node_id = %node_id,
                recorded = emitted.len(),
                error = %e,
                "Cycle emission failed"
            );
            return Err(e);
        }

        if let Some(last) = emitted.last() {
            info!(
                node_id = %node_id,
                cycles = emitted.len(),
                amount = self.config.commission_per_cycle * emitted.len() as u64,
                cycles_completed = last.id.cycle_number,
                "Binary cycles completed"
            );
        }
        Ok(emitted)
    }

    /// Window in force at `now`; a new one starts once the old one expired
    fn current_window(
        &self,
        window: Option<QualificationWindow>,
        now: DateTime<Utc>,
    ) -> QualificationWindow {
        let length = i64::try_from(self.config.window_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .unwrap_or(Duration::MAX);
        match window {
            Some(w) if w.window_start.checked_add_signed(length).is_some_and(|end| now < end) => w,
            _ => QualificationWindow {
                window_start: now,
                cycles_in_window: 0,
            },
        }
    }

    pub fn summary(&self, node_id: &NodeId) -> Result<QualificationSummary, PowerLineError> {
        let position = self
            .store
            .get(node_id)
            .ok_or_else(|| PowerLineError::PositionNotFound(node_id.clone()))?;
        Ok(self.summarize(&position))
    }

    pub fn summarize(&self, position: &Position) -> QualificationSummary {
        let cycle_volume = self.config.cycle_volume;
        let lesser = position.lesser_leg_volume();
        QualificationSummary {
            node_id: position.node_id.clone(),
            left_leg_volume: position.left_leg_volume,
            right_leg_volume: position.right_leg_volume,
            lesser_leg_volume: lesser,
            cycles_available: lesser / cycle_volume,
            next_cycle_gap_amount: cycle_volume - lesser % cycle_volume,
            cycles_completed: position.cycles_completed,
            cycles_in_window: position.window.map(|w| w.cycles_in_window).unwrap_or(0),
        }
    }

    pub fn potential_earnings(&self, node_id: &NodeId) -> Result<PotentialEarnings, PowerLineError> {
        let position = self
            .store
            .get(node_id)
            .ok_or_else(|| PowerLineError::PositionNotFound(node_id.clone()))?;
        let summary = self.summarize(&position);

        let next_cycle = summary
            .cycles_available
            .saturating_mul(self.config.commission_per_cycle);
        let per_cycle = Decimal::from(next_cycle);
        Ok(PotentialEarnings {
            node_id: summary.node_id,
            next_cycle,
            next_30_days: per_cycle * Decimal::new(43, 1),
            next_90_days: per_cycle * Decimal::from(13),
            focus_leg: position.weaker_leg(),
            next_cycle_gap_amount: summary.next_cycle_gap_amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Occupant, PlacementMethod};
    use crate::store::MemoryTreeStore;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, 9, 0, 0).unwrap()
    }

    fn setup(config: QualificationConfig) -> (Arc<MemoryTreeStore>, Arc<CommissionLedger>, QualificationEngine) {
        let store = Arc::new(MemoryTreeStore::new());
        store.init_root(NodeId::from("ROOT"), t0()).unwrap();
        let ledger = Arc::new(CommissionLedger::new());
        let engine = QualificationEngine::new(
            store.clone(),
            ledger.clone(),
            None,
            Arc::new(EngineStats::new()),
            config,
        )
        .unwrap();
        (store, ledger, engine)
    }

    fn set_legs(store: &MemoryTreeStore, left: Volume, right: Volume, occupied: bool) {
        store
            .update(
                &NodeId::from("ROOT"),
                &mut |p: &mut Position| -> Result<(), PowerLineError> {
                    p.left_leg_volume = left;
                    p.right_leg_volume = right;
                    if occupied {
                        p.occupant = Some(Occupant {
                            promoter_id: 7,
                            placed_at: t0(),
                            is_active: true,
                            placement_method: PlacementMethod::Direct,
                        });
                    }
                    Ok(())
                },
            )
            .unwrap();
    }

    #[test]
    fn test_single_cycle_deducts_both_legs() {
        let (store, ledger, engine) = setup(QualificationConfig::default());
        set_legs(&store, 1200, 900, true);

        let events = engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].amount, 50);
        assert_eq!(events[0].recipient, 7);
        assert_eq!(events[0].id.to_string(), "ROOT#1");

        let root = store.root().unwrap();
        assert_eq!(root.left_leg_volume, 700);
        assert_eq!(root.right_leg_volume, 400);
        assert_eq!(root.cycles_completed, 1);
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_second_evaluate_emits_nothing() {
        let (store, ledger, engine) = setup(QualificationConfig::default());
        set_legs(&store, 1200, 900, true);

        engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap();
        let again = engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap();
        assert!(again.is_empty());
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_vacant_position_keeps_volume_banked() {
        let (store, ledger, engine) = setup(QualificationConfig::default());
        set_legs(&store, 1500, 1500, false);

        assert!(engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap().is_empty());
        assert_eq!(store.root().unwrap().lesser_leg_volume(), 1500);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_window_cap_banks_remainder() {
        let config = QualificationConfig {
            max_cycles_per_window: Some(2),
            window_secs: 3600,
            ..Default::default()
        };
        let (store, _ledger, engine) = setup(config);
        set_legs(&store, 2600, 2600, true);
        let root_id = NodeId::from("ROOT");

        assert_eq!(engine.evaluate_at(&root_id, t0()).unwrap().len(), 2);
        let root = store.root().unwrap();
        assert_eq!(root.left_leg_volume, 1600);
        assert_eq!(root.window.map(|w| w.cycles_in_window), Some(2));

        // Same window: capped
        let later = t0() + Duration::minutes(30);
        assert!(engine.evaluate_at(&root_id, later).unwrap().is_empty());

        // Next window: two more, one cycle stays banked
        let next = t0() + Duration::hours(1);
        let events = engine.evaluate_at(&root_id, next).unwrap();
        let cycles: Vec<u64> = events.iter().map(|e| e.id.cycle_number).collect();
        assert_eq!(cycles, vec![3, 4]);
        let root = store.root().unwrap();
        assert_eq!(root.lesser_leg_volume(), 600);
        assert_eq!(root.cycles_completed, 4);
    }

    #[test]
    fn test_replayed_cycle_is_not_emitted_twice() {
        let (store, ledger, engine) = setup(QualificationConfig::default());
        set_legs(&store, 600, 600, true);
        ledger
            .append(CommissionEvent {
                id: CommissionId {
                    node_id: NodeId::from("ROOT"),
                    cycle_number: 1,
                },
                recipient: 7,
                amount: 50,
                commission_type: CommissionType::BinaryCycle,
                created_at: t0(),
                seq: 0,
            })
            .unwrap();

        let events = engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap();
        assert!(events.is_empty());
        assert_eq!(ledger.len(), 1);
        let root = store.root().unwrap();
        assert_eq!(root.cycles_completed, 1);
        assert_eq!(root.left_leg_volume, 100);
    }

    #[test]
    fn test_summary_and_projection() {
        let (store, _ledger, engine) = setup(QualificationConfig::default());
        set_legs(&store, 1200, 900, true);

        let summary = engine.summary(&NodeId::from("ROOT")).unwrap();
        assert_eq!(summary.lesser_leg_volume, 900);
        assert_eq!(summary.cycles_available, 1);
        assert_eq!(summary.next_cycle_gap_amount, 100);

        let earnings = engine.potential_earnings(&NodeId::from("ROOT")).unwrap();
        assert_eq!(earnings.next_cycle, 50);
        assert_eq!(earnings.next_30_days, Decimal::from(215));
        assert_eq!(earnings.next_90_days, Decimal::from(650));
        assert_eq!(earnings.focus_leg, Side::Right);
    }

    #[test]
    fn test_zero_cycle_volume_rejected() {
        let store: Arc<dyn TreeStore> = Arc::new(MemoryTreeStore::new());
        let config = QualificationConfig {
            cycle_volume: 0,
            ..Default::default()
        };
        let result = QualificationEngine::new(
            store,
            Arc::new(CommissionLedger::new()),
            None,
            Arc::new(EngineStats::new()),
            config,
        );
        assert!(matches!(result, Err(PowerLineError::InvalidConfig(_))));
    }

    #[test]
    fn test_replayed_cycle_matches_recovered_state() {
        use crate::journal::JournalRecovery;

        let dir = format!("target/test_qualification_replay_{}", std::process::id());
        let _ = std::fs::remove_dir_all(&dir);
        let journal = Arc::new(Journal::open(&dir, 1, 1, 0).unwrap());

        let root = Position::root(NodeId::from("ROOT"), 1, t0());
        let mut left = Position::child_of(&root, Side::Left, t0());
        left.position_number = 2;
        let mut right = Position::child_of(&root, Side::Right, t0());
        right.position_number = 3;
        journal.position_created(&root, None).unwrap();
        journal.position_created(&left, Some(1)).unwrap();
        journal.position_created(&right, Some(1)).unwrap();
        journal
            .occupant_assigned(
                1,
                &Occupant {
                    promoter_id: 7,
                    placed_at: t0(),
                    is_active: true,
                    placement_method: PlacementMethod::Direct,
                },
            )
            .unwrap();
        journal.volume_applied(2, 600).unwrap();
        journal.volume_applied(3, 600).unwrap();
        let event = CommissionEvent {
            id: CommissionId {
                node_id: NodeId::from("ROOT"),
                cycle_number: 1,
            },
            recipient: 7,
            amount: 50,
            commission_type: CommissionType::BinaryCycle,
            created_at: t0(),
            seq: 1,
        };
        let window = QualificationWindow {
            window_start: t0(),
            cycles_in_window: 1,
        };
        journal.cycle_completed(&event, 1, 500, Some(window)).unwrap();
        let journaled = journal.next_seq();

        // Ledger already holds the cycle, the node has not caught up yet
        let store = Arc::new(MemoryTreeStore::new());
        store.init_root(NodeId::from("ROOT"), t0()).unwrap();
        set_legs(&store, 600, 600, true);
        let ledger = Arc::new(CommissionLedger::new());
        ledger.restore(vec![event]).unwrap();
        let engine = QualificationEngine::new(
            store.clone(),
            ledger.clone(),
            Some(journal.clone()),
            Arc::new(EngineStats::new()),
            QualificationConfig::default(),
        )
        .unwrap();

        assert!(engine.evaluate_at(&NodeId::from("ROOT"), t0()).unwrap().is_empty());
        assert_eq!(journal.next_seq(), journaled);
        assert_eq!(ledger.len(), 1);

        let live = store.root().unwrap();
        assert_eq!((live.left_leg_volume, live.right_leg_volume), (100, 100));
        assert_eq!(live.cycles_completed, 1);

        drop(engine);
        drop(journal);
        let state = JournalRecovery::new(&dir).recover().unwrap();
        let recovered = &state.positions[0];
        assert_eq!(recovered.left_leg_volume, live.left_leg_volume);
        assert_eq!(recovered.right_leg_volume, live.right_leg_volume);
        assert_eq!(recovered.cycles_completed, live.cycles_completed);
        assert_eq!(recovered.window, live.window);
        assert_eq!(state.commissions.len(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
