//! Volume Aggregator - upward propagation of volume deltas
//!
//! `apply_volume(n, d)` adds `d` to `n.personal_volume`, then walks the
//! ancestor chain derived from `n.path` one marker at a time, adding `d` to
//! the leg the walk came from. Once every leg holds the delta the
//! QualificationEngine evaluates each ancestor; the first failure is
//! returned after all of them were tried.
//!
//! Each node update is its own exclusive section, so concurrent propagations
//! commute. The journal record is written before the first node changes.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error};

use crate::core_types::{NodeId, Volume};
use crate::error::PowerLineError;
use crate::journal::Journal;
use crate::logging::TRACE_TARGET;
use crate::models::{CommissionEvent, Position, Side};
use crate::qualification::QualificationEngine;
use crate::stats::EngineStats;
use crate::store::TreeStore;

/// Result of one propagation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct VolumePropagation {
    /// Target first, then ancestors root-ward; empty for a zero delta
    pub updated: Vec<NodeId>,
    pub commissions: Vec<CommissionEvent>,
}

pub struct VolumeAggregator {
    store: Arc<dyn TreeStore>,
    qualification: Arc<QualificationEngine>,
    journal: Option<Arc<Journal>>,
    stats: Arc<EngineStats>,
}

impl VolumeAggregator {
    pub fn new(
        store: Arc<dyn TreeStore>,
        qualification: Arc<QualificationEngine>,
        journal: Option<Arc<Journal>>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            store,
            qualification,
            journal,
            stats,
        }
    }

    pub fn apply_volume(&self, node_id: &NodeId, delta: i64) -> Result<VolumePropagation, PowerLineError> {
        self.apply_volume_at(node_id, delta, Utc::now())
    }

    pub fn apply_volume_at(
        &self,
        node_id: &NodeId,
        delta: i64,
        now: DateTime<Utc>,
    ) -> Result<VolumePropagation, PowerLineError> {
        let target = self
            .store
            .get(node_id)
            .ok_or_else(|| PowerLineError::PositionNotFound(node_id.clone()))?;
        let delta: Volume = u64::try_from(delta).map_err(|_| PowerLineError::NegativeVolume(delta))?;
        if delta == 0 {
            return Ok(VolumePropagation::default());
        }

        let chain = self.ancestor_chain(&target)?;
        self.check_overflow(&target, &chain, delta)?;

        if let Some(journal) = &self.journal {
            journal.volume_applied(target.position_number, delta)?;
        }

        let mut propagation = VolumePropagation {
            updated: Vec::with_capacity(chain.len() + 1),
            commissions: Vec::new(),
        };

        self.store.update(
            node_id,
            &mut |position: &mut Position| -> Result<(), PowerLineError> {
                position.personal_volume = position
                    .personal_volume
                    .checked_add(delta)
                    .ok_or_else(|| PowerLineError::VolumeOverflow(position.node_id.clone()))?;
                Ok(())
            },
        )?;
        propagation.updated.push(node_id.clone());

        // Every leg holds the delta before any ancestor is evaluated
        for (ancestor_id, side) in &chain {
            let updated = self.store.update(
                ancestor_id,
                &mut |position: &mut Position| -> Result<(), PowerLineError> {
                    let id = position.node_id.clone();
                    let leg = position.leg_volume_mut(*side);
                    *leg = leg
                        .checked_add(delta)
                        .ok_or(PowerLineError::VolumeOverflow(id))?;
                    Ok(())
                },
            )?;
            debug!(
                target: TRACE_TARGET,
                node_id = %ancestor_id,
                side = %side,
                left = updated.left_leg_volume,
                right = updated.right_leg_volume,
                "leg updated"
            );
            propagation.updated.push(ancestor_id.clone());
        }

        let mut failure = None;
        for (ancestor_id, _) in &chain {
            match self.qualification.evaluate_at(ancestor_id, now) {
                Ok(events) => propagation.commissions.extend(events),
                Err(e) => {
                    error!(node_id = %ancestor_id, error = %e, "Qualification failed during propagation");
                    if failure.is_none() {
                        failure = Some(e);
                    }
                }
            }
        }

        self.stats.record_volume(delta);
        if let Some(e) = failure {
            return Err(e);
        }
        debug!(
            node_id = %node_id,
            delta,
            ancestors = chain.len(),
            commissions = propagation.commissions.len(),
            "Volume propagated"
        );
        Ok(propagation)
    }

    /// Ancestors root-ward, each with the side the walk arrives from.
    ///
    /// The parent is looked up by path (`path` minus its last marker) and
    /// must agree with the child's parent pointer and the parent's child slot.
    fn ancestor_chain(&self, target: &Position) -> Result<Vec<(NodeId, Side)>, PowerLineError> {
        let mut chain = Vec::with_capacity(target.level() as usize);
        let mut child = target.clone();

        while let Some((parent_path, side)) = child.path.split_last() {
            let parent = self.store.get_by_path(&parent_path).ok_or_else(|| {
                consistency_failure(format!(
                    "no position at path \"{parent_path}\" above {}",
                    child.node_id
                ))
            })?;
            if child.parent.as_ref() != Some(&parent.node_id)
                || parent.child(side) != Some(&child.node_id)
            {
                return Err(consistency_failure(format!(
                    "{} at \"{}\" does not link to {} as its {} child",
                    parent.node_id, parent_path, child.node_id, side
                )));
            }
            chain.push((parent.node_id.clone(), side));
            child = parent;
        }
        Ok(chain)
    }

    fn check_overflow(
        &self,
        target: &Position,
        chain: &[(NodeId, Side)],
        delta: Volume,
    ) -> Result<(), PowerLineError> {
        if target.personal_volume.checked_add(delta).is_none() {
            return Err(PowerLineError::VolumeOverflow(target.node_id.clone()));
        }
        for (ancestor_id, side) in chain {
            let ancestor = self
                .store
                .get(ancestor_id)
                .ok_or_else(|| PowerLineError::PositionNotFound(ancestor_id.clone()))?;
            if ancestor.leg_volume(*side).checked_add(delta).is_none() {
                return Err(PowerLineError::VolumeOverflow(ancestor_id.clone()));
            }
        }
        Ok(())
    }
}

fn consistency_failure(detail: String) -> PowerLineError {
    error!(detail = %detail, "Tree consistency violation");
    PowerLineError::InternalConsistency(detail)
}
