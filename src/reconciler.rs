//! Merges optimistic point-of-sale adjustments with authoritative feed snapshots.
//!
//! The feed is the only durable store and push outcomes are never observed,
//! so the next authoritative snapshot always wins: every pending delta is
//! dropped when one lands, whether or not its push reached the sink. A sale
//! whose push silently failed therefore disappears from the display once the
//! next pull succeeds.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::snapshot::MetricsSnapshot;

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct OptimisticDelta {
    pub sales_delta: f64,
    pub profit_delta: f64,
}

impl OptimisticDelta {
    pub fn new(sales_delta: f64, profit_delta: f64) -> Self {
        Self {
            sales_delta: finite_or_zero(sales_delta),
            profit_delta: finite_or_zero(profit_delta),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Uninitialized,
    Authoritative,
    Optimistic,
}

impl SyncPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncPhase::Uninitialized => "uninitialized",
            SyncPhase::Authoritative => "authoritative",
            SyncPhase::Optimistic => "optimistic",
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncState {
    last_authoritative: Option<MetricsSnapshot>,
    pending_deltas: Vec<OptimisticDelta>,
    published: MetricsSnapshot,
}

impl SyncState {
    pub fn last_authoritative(&self) -> Option<&MetricsSnapshot> {
        self.last_authoritative.as_ref()
    }

    pub fn pending_deltas(&self) -> &[OptimisticDelta] {
        &self.pending_deltas
    }

    pub fn published(&self) -> &MetricsSnapshot {
        &self.published
    }

    pub fn phase(&self) -> SyncPhase {
        if !self.pending_deltas.is_empty() {
            SyncPhase::Optimistic
        } else if self.last_authoritative.is_some() {
            SyncPhase::Authoritative
        } else {
            SyncPhase::Uninitialized
        }
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    state: SyncState,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn phase(&self) -> SyncPhase {
        self.state.phase()
    }

    pub fn published(&self) -> MetricsSnapshot {
        self.state.published
    }

    /// Full replace. Pending deltas are discarded regardless of push outcome.
    pub fn apply_authoritative(&mut self, snapshot: MetricsSnapshot) -> MetricsSnapshot {
        let discarded = self.state.pending_deltas.len();
        if discarded > 0 {
            debug!(
                target: "engine",
                discarded, "authoritative snapshot superseded pending deltas"
            );
        }
        self.state.pending_deltas.clear();
        self.state.last_authoritative = Some(snapshot);
        self.state.published = snapshot;
        snapshot
    }

    /// Before the first pull the base is an all-zero snapshot.
    pub fn apply_optimistic(&mut self, delta: OptimisticDelta) -> MetricsSnapshot {
        self.state.pending_deltas.push(delta);
        self.recompute();
        self.state.published
    }

    pub fn pull_failed(&self) -> MetricsSnapshot {
        self.state.published
    }

    fn recompute(&mut self) {
        let base = self.state.last_authoritative.unwrap_or_default();
        let (sales, profit) = self
            .state
            .pending_deltas
            .iter()
            .fold((0.0, 0.0), |(sales, profit), delta| {
                (sales + delta.sales_delta, profit + delta.profit_delta)
            });
        self.state.published = MetricsSnapshot {
            sales: base.sales + sales,
            profit: base.profit + profit,
            ..base
        };
    }
}

fn finite_or_zero(value: f64) -> f64 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}
