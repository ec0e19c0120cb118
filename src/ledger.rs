//! Commission Ledger - append-only record of emitted commissions
//!
//! Every cycle emitted by the QualificationEngine lands here exactly once.
//! The event id `(node_id, cycle_number)` is the idempotency key; appending
//! an id twice fails with `QualificationReplay`.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use rustc_hash::FxHashSet;
use serde::Serialize;
use std::sync::{PoisonError, RwLock};

use crate::core_types::{Amount, NodeId, PromoterId, SeqNum};
use crate::error::PowerLineError;
use crate::models::{CommissionEvent, CommissionId, CommissionType};

/// Hook run under the ledger lock after the sequence is assigned and before
/// the event becomes visible; an error aborts the append.
pub type AppendHook<'a> = &'a mut dyn FnMut(&CommissionEvent) -> Result<(), PowerLineError>;

/// Query filter; every set field must match, time bounds are inclusive
#[derive(Debug, Clone, Default)]
pub struct CommissionFilter {
    pub recipient: Option<PromoterId>,
    pub commission_type: Option<CommissionType>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl CommissionFilter {
    pub fn for_recipient(recipient: PromoterId) -> Self {
        Self {
            recipient: Some(recipient),
            ..Default::default()
        }
    }

    pub fn matches(&self, event: &CommissionEvent) -> bool {
        self.recipient.is_none_or(|r| r == event.recipient)
            && self.commission_type.is_none_or(|t| t == event.commission_type)
            && self.start.is_none_or(|s| event.created_at >= s)
            && self.end.is_none_or(|e| event.created_at <= e)
    }
}

/// One page of history, newest first
#[derive(Debug, Clone, Serialize)]
pub struct CommissionPage {
    pub events: Vec<CommissionEvent>,
    pub current_page: usize,
    pub total_pages: usize,
    pub total_commissions: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommissionSummary {
    pub total_amount: Amount,
    pub total_count: u64,
    /// Mean amount, 2 decimal places; zero when there are no events
    pub average_amount: Decimal,
    /// Sum over the 7 days ending at `now`
    pub this_week_amount: Amount,
}

#[derive(Default)]
struct LedgerInner {
    /// Append order == ascending seq
    events: Vec<CommissionEvent>,
    ids: FxHashSet<CommissionId>,
    next_seq: SeqNum,
}

pub struct CommissionLedger {
    inner: RwLock<LedgerInner>,
}

impl CommissionLedger {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(LedgerInner {
                next_seq: 1,
                ..Default::default()
            }),
        }
    }

    pub fn append(&self, event: CommissionEvent) -> Result<CommissionEvent, PowerLineError> {
        self.append_with(event, &mut |_: &CommissionEvent| -> Result<(), PowerLineError> {
            Ok(())
        })
    }

    /// Append `event`, assigning its sequence number.
    pub fn append_with(
        &self,
        mut event: CommissionEvent,
        on_commit: AppendHook<'_>,
    ) -> Result<CommissionEvent, PowerLineError> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if inner.ids.contains(&event.id) {
            return Err(PowerLineError::QualificationReplay(event.id.to_string()));
        }

        event.seq = inner.next_seq;
        on_commit(&event)?;

        inner.next_seq += 1;
        inner.ids.insert(event.id.clone());
        inner.events.push(event.clone());
        Ok(event)
    }

    pub fn contains(&self, id: &CommissionId) -> bool {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .ids
            .contains(id)
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Latest `limit` events, newest first
    pub fn recent_feed(&self, limit: usize) -> Vec<CommissionEvent> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner.events.iter().rev().take(limit).cloned().collect()
    }

    /// Events emitted for one position, in append order
    pub fn for_node(&self, node_id: &NodeId) -> Vec<CommissionEvent> {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        inner
            .events
            .iter()
            .filter(|e| e.node_id() == node_id)
            .cloned()
            .collect()
    }

    /// Paged history, newest first. `page` is 1-based; `limit` 0 is treated as 1.
    pub fn history(&self, filter: &CommissionFilter, page: usize, limit: usize) -> CommissionPage {
        let limit = limit.max(1);
        let page = page.max(1);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let matching: Vec<&CommissionEvent> =
            inner.events.iter().rev().filter(|e| filter.matches(e)).collect();
        let total_commissions = matching.len();

        CommissionPage {
            events: matching
                .into_iter()
                .skip((page - 1).saturating_mul(limit))
                .take(limit)
                .cloned()
                .collect(),
            current_page: page,
            total_pages: total_commissions.div_ceil(limit),
            total_commissions,
        }
    }

    pub fn summary(&self, filter: &CommissionFilter, now: DateTime<Utc>) -> CommissionSummary {
        let week_start = now - Duration::days(7);
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);

        let mut total_amount: Amount = 0;
        let mut total_count = 0u64;
        let mut this_week_amount: Amount = 0;
        for event in inner.events.iter().filter(|e| filter.matches(e)) {
            total_amount = total_amount.saturating_add(event.amount);
            total_count += 1;
            if event.created_at >= week_start && event.created_at <= now {
                this_week_amount = this_week_amount.saturating_add(event.amount);
            }
        }

        let average_amount = if total_count == 0 {
            Decimal::ZERO
        } else {
            (Decimal::from(total_amount) / Decimal::from(total_count)).round_dp(2)
        };

        CommissionSummary {
            total_amount,
            total_count,
            average_amount,
            this_week_amount,
        }
    }

    /// Every event in append order
    pub fn all(&self) -> Vec<CommissionEvent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .clone()
    }

    /// Replace contents with recovered events
    pub fn restore(&self, mut events: Vec<CommissionEvent>) -> Result<(), PowerLineError> {
        events.sort_by_key(|e| e.seq);
        let mut ids = FxHashSet::default();
        for event in &events {
            if !ids.insert(event.id.clone()) {
                return Err(PowerLineError::InternalConsistency(format!(
                    "commission {} recovered twice",
                    event.id
                )));
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.next_seq = events.last().map(|e| e.seq + 1).unwrap_or(1);
        inner.ids = ids;
        inner.events = events;
        Ok(())
    }
}

impl Default for CommissionLedger {
    fn default() -> Self {
        Self::new()
    }
}
