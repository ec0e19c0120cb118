//! PowerLine - in-process facade over the tree engines
//!
//! ```text
//! place_prospect ──► PlacementEngine ──► TreeStore.claim_child
//! record_volume  ──► VolumeAggregator ──► QualificationEngine ──► CommissionLedger
//! enroll / set_active ─────────────────► TreeStore.update
//! ```
//!
//! Every mutation enters the shared side of the [`MutationGate`]; reads that
//! must not observe a half-propagated volume event (subtrees, summaries,
//! audits) freeze it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use rust_decimal::Decimal;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::config::AppConfig;
use crate::core_types::{NodeId, PositionNumber, PromoterId, ProspectId, Volume};
use crate::error::PowerLineError;
use crate::journal::{Journal, JournalRecovery};
use crate::ledger::{CommissionFilter, CommissionLedger, CommissionPage, CommissionSummary};
use crate::models::{CommissionEvent, Occupant, PlacementMethod, Position, Side, TreePath};
use crate::placement::{PlacementEngine, PlacementRequest};
use crate::qualification::{PotentialEarnings, QualificationEngine, QualificationSummary};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::store::{MutationGate, TreeStore};
use crate::volume::VolumeAggregator;

// ============================================================
// RESPONSE TYPES
// ============================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlacementReceipt {
    pub node_id: NodeId,
    pub level: u32,
    pub side: Side,
    pub parent_node_id: NodeId,
    pub position_number: PositionNumber,
    pub reserved_for: Option<ProspectId>,
}

/// Bounded subtree, children in Left, Right order
#[derive(Debug, Clone, Serialize)]
pub struct TreeFragment {
    pub node: Position,
    pub children: Vec<TreeFragment>,
}

impl TreeFragment {
    /// Number of nodes in the fragment
    pub fn node_count(&self) -> usize {
        1 + self.children.iter().map(TreeFragment::node_count).sum::<usize>()
    }

    pub fn depth(&self) -> u32 {
        self.children.iter().map(|c| c.depth() + 1).max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LegSummary {
    pub node_id: NodeId,
    pub personal_volume: Volume,
    pub left_leg_volume: Volume,
    pub right_leg_volume: Volume,
    pub lesser_leg_volume: Volume,
    pub total_group_volume: Volume,
}

impl From<&Position> for LegSummary {
    fn from(p: &Position) -> Self {
        Self {
            node_id: p.node_id.clone(),
            personal_volume: p.personal_volume,
            left_leg_volume: p.left_leg_volume,
            right_leg_volume: p.right_leg_volume,
            lesser_leg_volume: p.lesser_leg_volume(),
            total_group_volume: p.total_group_volume(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeReceipt {
    pub node_id: NodeId,
    pub amount: Volume,
    /// Target first, then ancestors root-ward
    pub updated: Vec<LegSummary>,
    pub commissions: Vec<CommissionEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TeamSide {
    /// Occupied positions on this side
    pub count: u64,
    /// Sum of personal volume on this side
    pub volume: Volume,
    pub active_count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TeamStats {
    pub node_id: NodeId,
    pub level: u32,
    pub left: TeamSide,
    pub right: TeamSide,
    /// lesser leg / greater leg, 4 decimal places; 0 when both legs are empty
    pub balance_ratio: Decimal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OpenSlots {
    pub left: bool,
    pub right: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SpilloverOpportunity {
    pub node_id: NodeId,
    pub level: u32,
    pub side: Option<Side>,
    pub total_group_volume: Volume,
    pub needs_balancing: bool,
    pub open_slots: OpenSlots,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvariantReport {
    pub positions: u64,
    pub occupied: u64,
    pub total_personal_volume: u128,
    pub commissions: usize,
}

// ============================================================
// FACADE
// ============================================================

pub struct PowerLine {
    config: AppConfig,
    store: Arc<dyn TreeStore>,
    gate: MutationGate,
    ledger: Arc<CommissionLedger>,
    journal: Option<Arc<Journal>>,
    stats: Arc<EngineStats>,
    promoters: DashMap<PromoterId, NodeId>,
    placement: PlacementEngine,
    volume: VolumeAggregator,
    qualification: Arc<QualificationEngine>,
}

impl PowerLine {
    /// In-memory engine; the journal section of `config` is ignored
    pub fn new(config: AppConfig, store: Arc<dyn TreeStore>) -> Result<Self, PowerLineError> {
        let engine = Self::assemble(config, store, None)?;
        engine.index_promoters()?;
        engine.ensure_root(Utc::now())?;
        Ok(engine)
    }

    /// Engine backed by the journal when `journal.enabled`, recovering any
    /// state it already holds.
    pub fn open(config: AppConfig, store: Arc<dyn TreeStore>) -> Result<Self, PowerLineError> {
        if !config.journal.enabled {
            return Self::new(config, store);
        }

        let data_dir = config.journal.data_dir.clone();
        let recovered = JournalRecovery::new(&data_dir).recover()?;
        let journal = Arc::new(Journal::open(
            &data_dir,
            recovered.last_epoch + 1,
            recovered.next_seq,
            recovered.valid_len,
        )?);
        store.restore(recovered.positions, recovered.next_position_number)?;

        let engine = Self::assemble(config, store, Some(journal))?;
        engine.ledger.restore(recovered.commissions)?;
        engine.index_promoters()?;
        engine.ensure_root(Utc::now())?;

        info!(
            data_dir = %data_dir,
            positions = engine.store.len(),
            commissions = engine.ledger.len(),
            epoch = recovered.last_epoch + 1,
            "PowerLine opened from journal"
        );
        Ok(engine)
    }

    fn assemble(
        config: AppConfig,
        store: Arc<dyn TreeStore>,
        journal: Option<Arc<Journal>>,
    ) -> Result<Self, PowerLineError> {
        let ledger = Arc::new(CommissionLedger::new());
        let stats = Arc::new(EngineStats::new());
        let qualification = Arc::new(QualificationEngine::new(
            store.clone(),
            ledger.clone(),
            journal.clone(),
            stats.clone(),
            config.qualification.clone(),
        )?);
        let placement = PlacementEngine::new(
            store.clone(),
            journal.clone(),
            stats.clone(),
            config.placement.clone(),
        );
        let volume = VolumeAggregator::new(
            store.clone(),
            qualification.clone(),
            journal.clone(),
            stats.clone(),
        );

        Ok(Self {
            config,
            store,
            gate: MutationGate::new(),
            ledger,
            journal,
            stats,
            promoters: DashMap::new(),
            placement,
            volume,
            qualification,
        })
    }

    fn ensure_root(&self, now: DateTime<Utc>) -> Result<(), PowerLineError> {
        if let Some(root) = self.store.root() {
            if root.node_id.as_str() != self.config.root_node_id {
                warn!(
                    existing = %root.node_id,
                    configured = %self.config.root_node_id,
                    "Configured root id differs from recovered tree, keeping recovered root"
                );
            }
            return Ok(());
        }

        let root = self
            .store
            .init_root(NodeId::new(self.config.root_node_id.clone()), now)?;
        if let Some(journal) = &self.journal {
            journal.position_created(&root, None)?;
        }
        info!(root = %root.node_id, store = self.store.name(), "Tree initialized");
        Ok(())
    }

    fn index_promoters(&self) -> Result<(), PowerLineError> {
        self.promoters.clear();
        for position in self.store.all() {
            if let Some(occupant) = &position.occupant
                && let Some(existing) = self
                    .promoters
                    .insert(occupant.promoter_id, position.node_id.clone())
            {
                return Err(consistency_failure(format!(
                    "promoter {} holds both {} and {}",
                    occupant.promoter_id, existing, position.node_id
                )));
            }
        }
        Ok(())
    }

    fn position(&self, node_id: &NodeId) -> Result<Position, PowerLineError> {
        self.store
            .get(node_id)
            .ok_or_else(|| PowerLineError::PositionNotFound(node_id.clone()))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn root(&self) -> Result<Position, PowerLineError> {
        self.store
            .root()
            .ok_or_else(|| PowerLineError::InternalConsistency("tree has no root".into()))
    }

    pub fn get_position(&self, node_id: &NodeId) -> Result<Position, PowerLineError> {
        self.position(node_id)
    }

    pub fn len(&self) -> u64 {
        self.store.len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    // ---------------------------------------------------------
    // Placement & enrollment
    // ---------------------------------------------------------

    pub fn place_prospect(
        &self,
        anchor: &NodeId,
        preferred_side: Option<Side>,
        prospect: Option<ProspectId>,
    ) -> Result<PlacementReceipt, PowerLineError> {
        self.place_prospect_at(anchor, preferred_side, prospect, Utc::now())
    }

    pub fn place_prospect_at(
        &self,
        anchor: &NodeId,
        preferred_side: Option<Side>,
        prospect: Option<ProspectId>,
        now: DateTime<Utc>,
    ) -> Result<PlacementReceipt, PowerLineError> {
        let _gate = self.gate.enter();
        let request = PlacementRequest {
            preferred_side,
            reserved_for: prospect,
        };
        let position = self.placement.place_at(anchor, request, now)?;

        let (Some(side), Some(parent_node_id)) = (position.side, position.parent.clone()) else {
            return Err(consistency_failure(format!(
                "placed node {} has no parent link",
                position.node_id
            )));
        };
        Ok(PlacementReceipt {
            level: position.level(),
            side,
            parent_node_id,
            position_number: position.position_number,
            reserved_for: position.reserved_for,
            node_id: position.node_id,
        })
    }

    pub fn enroll(
        &self,
        node_id: &NodeId,
        promoter_id: PromoterId,
        method: PlacementMethod,
    ) -> Result<Position, PowerLineError> {
        self.enroll_at(node_id, promoter_id, method, Utc::now())
    }

    /// Fill a vacant position and count it in every ancestor's subtree size.
    pub fn enroll_at(
        &self,
        node_id: &NodeId,
        promoter_id: PromoterId,
        method: PlacementMethod,
        now: DateTime<Utc>,
    ) -> Result<Position, PowerLineError> {
        let _gate = self.gate.enter();

        match self.promoters.entry(promoter_id) {
            Entry::Occupied(held) => {
                return Err(PowerLineError::PromoterAlreadyPlaced {
                    promoter_id,
                    node_id: held.get().clone(),
                });
            }
            Entry::Vacant(slot) => {
                slot.insert(node_id.clone());
            }
        }

        let occupant = Occupant {
            promoter_id,
            placed_at: now,
            is_active: true,
            placement_method: method,
        };
        let result = self.store.update(
            node_id,
            &mut |position: &mut Position| -> Result<(), PowerLineError> {
                if position.occupant.is_some() {
                    return Err(PowerLineError::AlreadyOccupied(position.node_id.clone()));
                }
                if let Some(journal) = &self.journal {
                    journal.occupant_assigned(position.position_number, &occupant)?;
                }
                position.occupant = Some(occupant.clone());
                Ok(())
            },
        );
        let position = match result {
            Ok(position) => position,
            Err(e) => {
                self.promoters.remove(&promoter_id);
                return Err(e);
            }
        };

        let mut parent = position.parent.clone();
        while let Some(ancestor_id) = parent {
            let ancestor = self.store.update(
                &ancestor_id,
                &mut |p: &mut Position| -> Result<(), PowerLineError> {
                    p.subtree_size += 1;
                    Ok(())
                },
            )?;
            parent = ancestor.parent;
        }

        self.stats.record_enrollment();
        info!(node_id = %node_id, promoter_id, method = ?method, "Promoter enrolled");
        Ok(position)
    }

    pub fn set_active(&self, node_id: &NodeId, is_active: bool) -> Result<Position, PowerLineError> {
        let _gate = self.gate.enter();
        self.store.update(
            node_id,
            &mut |position: &mut Position| -> Result<(), PowerLineError> {
                let node_id = position.node_id.clone();
                let position_number = position.position_number;
                let Some(occupant) = position.occupant.as_mut() else {
                    return Err(PowerLineError::VacantPosition(node_id));
                };
                if occupant.is_active == is_active {
                    return Ok(());
                }
                if let Some(journal) = &self.journal {
                    journal.active_changed(position_number, is_active)?;
                }
                occupant.is_active = is_active;
                Ok(())
            },
        )
    }

    pub fn find_by_promoter(&self, promoter_id: PromoterId) -> Option<Position> {
        let node_id = self.promoters.get(&promoter_id)?.value().clone();
        self.store.get(&node_id)
    }

    // ---------------------------------------------------------
    // Volume & qualification
    // ---------------------------------------------------------

    pub fn record_volume_event(&self, node_id: &NodeId, amount: i64) -> Result<VolumeReceipt, PowerLineError> {
        self.record_volume_event_at(node_id, amount, Utc::now())
    }

    pub fn record_volume_event_at(
        &self,
        node_id: &NodeId,
        amount: i64,
        now: DateTime<Utc>,
    ) -> Result<VolumeReceipt, PowerLineError> {
        let _gate = self.gate.enter();
        let propagation = self.volume.apply_volume_at(node_id, amount, now)?;
        let updated = propagation
            .updated
            .iter()
            .filter_map(|id| self.store.get(id))
            .map(|p| LegSummary::from(&p))
            .collect();

        Ok(VolumeReceipt {
            node_id: node_id.clone(),
            amount: amount.unsigned_abs(),
            updated,
            commissions: propagation.commissions,
        })
    }

    /// Re-run qualification on one node (e.g. after enrolling into a
    /// position that already holds matched volume).
    pub fn evaluate(&self, node_id: &NodeId) -> Result<Vec<CommissionEvent>, PowerLineError> {
        self.evaluate_at(node_id, Utc::now())
    }

    pub fn evaluate_at(
        &self,
        node_id: &NodeId,
        now: DateTime<Utc>,
    ) -> Result<Vec<CommissionEvent>, PowerLineError> {
        let _gate = self.gate.enter();
        self.qualification.evaluate_at(node_id, now)
    }

    pub fn get_qualification_summary(&self, node_id: &NodeId) -> Result<QualificationSummary, PowerLineError> {
        let _frozen = self.gate.freeze();
        self.qualification.summary(node_id)
    }

    pub fn potential_earnings(&self, node_id: &NodeId) -> Result<PotentialEarnings, PowerLineError> {
        let _frozen = self.gate.freeze();
        self.qualification.potential_earnings(node_id)
    }

    // ---------------------------------------------------------
    // Tree queries
    // ---------------------------------------------------------

    /// Breadth-bounded fragment; `max_depth` defaults to the reporting depth
    pub fn get_subtree(&self, node_id: &NodeId, max_depth: Option<u32>) -> Result<TreeFragment, PowerLineError> {
        let depth = max_depth.unwrap_or(self.config.reporting.default_tree_depth);
        let _frozen = self.gate.freeze();
        let anchor = self.position(node_id)?;

        let mut by_path: FxHashMap<TreePath, Position> = self
            .store
            .descendants(&anchor.path, Some(depth))
            .into_iter()
            .map(|p| (p.path.clone(), p))
            .collect();
        Ok(build_fragment(anchor, &mut by_path))
    }

    /// Ancestors nearest first, at most `levels` of them
    pub fn upline(&self, node_id: &NodeId, levels: Option<u32>) -> Result<Vec<Position>, PowerLineError> {
        let _frozen = self.gate.freeze();
        let mut current = self.position(node_id)?;
        let mut ancestors = Vec::new();

        while levels.is_none_or(|max| ancestors.len() < max as usize) {
            let Some(parent_id) = current.parent.clone() else {
                break;
            };
            let parent = self.store.get(&parent_id).ok_or_else(|| {
                consistency_failure(format!("{} points to missing parent {parent_id}", current.node_id))
            })?;
            ancestors.push(parent.clone());
            current = parent;
        }
        Ok(ancestors)
    }

    /// Descendants within `levels`, ordered by level then position number
    pub fn downline(&self, node_id: &NodeId, levels: Option<u32>) -> Result<Vec<Position>, PowerLineError> {
        let _frozen = self.gate.freeze();
        let anchor = self.position(node_id)?;
        let mut positions = self.store.descendants(&anchor.path, levels);
        positions.sort_by_key(|p| (p.level(), p.position_number));
        Ok(positions)
    }

    pub fn team_stats(&self, node_id: &NodeId) -> Result<TeamStats, PowerLineError> {
        let _frozen = self.gate.freeze();
        let anchor = self.position(node_id)?;
        let mut left = TeamSide::default();
        let mut right = TeamSide::default();

        for member in self.store.descendants(&anchor.path, None) {
            let team = match member.path.side_under(&anchor.path) {
                Some(Side::Left) => &mut left,
                Some(Side::Right) => &mut right,
                None => continue,
            };
            team.volume = team.volume.saturating_add(member.personal_volume);
            if let Some(occupant) = &member.occupant {
                team.count += 1;
                if occupant.is_active {
                    team.active_count += 1;
                }
            }
        }

        let greater = anchor.left_leg_volume.max(anchor.right_leg_volume);
        let balance_ratio = if greater == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(anchor.lesser_leg_volume()) / Decimal::from(greater)).round_dp(4)
        };

        Ok(TeamStats {
            node_id: anchor.node_id.clone(),
            level: anchor.level(),
            left,
            right,
            balance_ratio,
        })
    }

    /// Positions with an open slot, earliest first
    pub fn spillover_opportunities(&self, limit: usize) -> Result<Vec<SpilloverOpportunity>, PowerLineError> {
        let _frozen = self.gate.freeze();
        let root = self.root()?;
        let threshold = self.config.reporting.balancing_threshold;

        Ok(self
            .store
            .open_slots(&root.path, self.config.placement.max_depth, limit)
            .into_iter()
            .map(|p| SpilloverOpportunity {
                level: p.level(),
                side: p.side,
                total_group_volume: p.total_group_volume(),
                needs_balancing: p.left_leg_volume.abs_diff(p.right_leg_volume) > threshold,
                open_slots: OpenSlots {
                    left: p.is_open(Side::Left),
                    right: p.is_open(Side::Right),
                },
                node_id: p.node_id,
            })
            .collect())
    }

    // ---------------------------------------------------------
    // Commissions
    // ---------------------------------------------------------

    pub fn commission_feed(&self, limit: usize) -> Vec<CommissionEvent> {
        self.ledger.recent_feed(limit)
    }

    pub fn commission_history(&self, filter: &CommissionFilter, page: usize, limit: usize) -> CommissionPage {
        self.ledger.history(filter, page, limit)
    }

    pub fn commission_summary(&self, filter: &CommissionFilter) -> CommissionSummary {
        self.ledger.summary(filter, Utc::now())
    }

    pub fn commission_summary_at(&self, filter: &CommissionFilter, now: DateTime<Utc>) -> CommissionSummary {
        self.ledger.summary(filter, now)
    }

    /// Every commission in ledger order
    pub fn commissions(&self) -> Vec<CommissionEvent> {
        self.ledger.all()
    }

    pub fn commissions_for(&self, node_id: &NodeId) -> Vec<CommissionEvent> {
        self.ledger.for_node(node_id)
    }

    // ---------------------------------------------------------
    // Audit & snapshots
    // ---------------------------------------------------------

    /// Every position ascending by position number, taken at a quiet point
    pub fn snapshot(&self) -> Vec<Position> {
        let _frozen = self.gate.freeze();
        self.store.all()
    }

    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Recompute legs, subtree sizes and links from scratch and compare.
    ///
    /// Each leg must equal the personal volume below it minus
    /// `cycles_completed × C`.
    pub fn verify_invariants(&self) -> Result<InvariantReport, PowerLineError> {
        let _frozen = self.gate.freeze();
        let positions = self.store.all();
        let cycle_volume = u128::from(self.qualification.config().cycle_volume);

        let by_path: FxHashMap<&TreePath, &Position> =
            positions.iter().map(|p| (&p.path, p)).collect();
        if by_path.len() != positions.len() {
            return Err(consistency_failure("two positions share a path".into()));
        }

        // node id → (left sum, right sum, occupied descendants)
        let mut expected: FxHashMap<&NodeId, (u128, u128, u64)> = FxHashMap::default();
        let mut occupied = 0u64;
        let mut total_personal_volume = 0u128;
        let mut last_number: Option<PositionNumber> = None;

        for position in &positions {
            if last_number.is_some_and(|n| n >= position.position_number) {
                return Err(consistency_failure(format!(
                    "position number {} is not unique",
                    position.position_number
                )));
            }
            last_number = Some(position.position_number);

            if position.path.is_root() != position.parent.is_none() {
                return Err(consistency_failure(format!(
                    "{} has a parent link that disagrees with its path",
                    position.node_id
                )));
            }
            for side in [Side::Left, Side::Right] {
                let child = by_path.get(&position.path.child(side)).map(|c| &c.node_id);
                if child != position.child(side) {
                    return Err(consistency_failure(format!(
                        "{} {} child pointer disagrees with the tree",
                        position.node_id, side
                    )));
                }
            }

            total_personal_volume += u128::from(position.personal_volume);
            if position.occupant.is_some() {
                occupied += 1;
            }

            let mut cursor = position.path.clone();
            while let Some((parent_path, side)) = cursor.split_last() {
                let ancestor = by_path.get(&parent_path).ok_or_else(|| {
                    consistency_failure(format!("{} has no ancestor at \"{parent_path}\"", position.node_id))
                })?;
                let entry = expected.entry(&ancestor.node_id).or_default();
                match side {
                    Side::Left => entry.0 += u128::from(position.personal_volume),
                    Side::Right => entry.1 += u128::from(position.personal_volume),
                }
                if position.occupant.is_some() {
                    entry.2 += 1;
                }
                cursor = parent_path;
            }
        }

        for position in &positions {
            let (left, right, subtree) = expected.get(&position.node_id).copied().unwrap_or_default();
            let consumed = u128::from(position.cycles_completed) * cycle_volume;
            if u128::from(position.left_leg_volume) + consumed != left
                || u128::from(position.right_leg_volume) + consumed != right
            {
                return Err(consistency_failure(format!(
                    "{} legs {}/{} do not match descendants {}/{} after {} cycles",
                    position.node_id,
                    position.left_leg_volume,
                    position.right_leg_volume,
                    left,
                    right,
                    position.cycles_completed
                )));
            }
            if position.subtree_size != subtree {
                return Err(consistency_failure(format!(
                    "{} subtree size {} but {} occupied descendants",
                    position.node_id, position.subtree_size, subtree
                )));
            }
        }

        Ok(InvariantReport {
            positions: positions.len() as u64,
            occupied,
            total_personal_volume,
            commissions: self.ledger.len(),
        })
    }
}

fn build_fragment(node: Position, by_path: &mut FxHashMap<TreePath, Position>) -> TreeFragment {
    let mut children = Vec::with_capacity(2);
    for side in [Side::Left, Side::Right] {
        if let Some(child) = by_path.remove(&node.path.child(side)) {
            children.push(build_fragment(child, by_path));
        }
    }
    TreeFragment { node, children }
}

fn consistency_failure(detail: String) -> PowerLineError {
    error!(detail = %detail, "Tree consistency violation");
    PowerLineError::InternalConsistency(detail)
}
