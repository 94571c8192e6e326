use std::{
    sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering},
    time::Duration,
};

use atomic_float::AtomicF64;
use serde::Serialize;

use super::{NodeId, NodeState};
use crate::gradient::Segment;

/// Whether a node dispatches work or computes gradients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Control,
    Worker,
}

/// Lock free counters updated by a node's thread and read by anyone.
///
/// The `epoch_*` and `adopted_*` counters are reset by every reduction.
#[derive(Debug, Default)]
pub struct NodeCounters {
    processed: AtomicU64,
    skipped: AtomicU64,
    dispatched: AtomicU64,
    steals: AtomicU64,
    items_stolen: AtomicU64,
    stolen_from: AtomicU64,
    spawned: AtomicU64,
    retired: AtomicU64,
    busy_ns: AtomicU64,
    idle_ns: AtomicU64,
    loss_sum: AtomicF64,
    idle_cycles: AtomicU32,
    epoch_items: AtomicU64,
    epoch_loss: AtomicF64,
    adopted_items: AtomicU64,
    adopted_loss: AtomicF64,
    adopted_contributors: AtomicUsize,
}

/// What a node contributed since the last reduction.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct EpochShare {
    pub items: u64,
    pub loss: f64,
    pub contributors: usize,
}

impl NodeCounters {
    pub fn record_processed(&self, loss: f32, elapsed: Duration) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        self.epoch_items.fetch_add(1, Ordering::Relaxed);
        self.loss_sum.fetch_add(f64::from(loss), Ordering::Relaxed);
        self.epoch_loss.fetch_add(f64::from(loss), Ordering::Relaxed);
        self.add_busy(elapsed);
    }

    pub fn record_skipped(&self, elapsed: Duration) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.add_busy(elapsed);
    }

    pub fn record_dispatch(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_steal(&self, items: usize) {
        self.steals.fetch_add(1, Ordering::Relaxed);
        self.items_stolen.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_stolen_from(&self, items: usize) {
        self.stolen_from.fetch_add(items as u64, Ordering::Relaxed);
    }

    pub fn record_spawn(&self) {
        self.spawned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_retire(&self) {
        self.retired.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_busy(&self, elapsed: Duration) {
        self.busy_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn add_idle(&self, elapsed: Duration) {
        self.idle_ns.fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }

    /// Counts one idle wait that ended without any work showing up.
    pub fn idle_cycle(&self) -> u32 {
        self.idle_cycles.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn idle_cycles(&self) -> u32 {
        self.idle_cycles.load(Ordering::Relaxed)
    }

    pub fn reset_idle_cycles(&self) {
        self.idle_cycles.store(0, Ordering::Relaxed);
    }

    /// Returns what this node did itself since the last reduction.
    pub fn own_share(&self) -> EpochShare {
        let items = self.epoch_items.load(Ordering::Relaxed);
        EpochShare {
            items,
            loss: self.epoch_loss.load(Ordering::Relaxed),
            contributors: usize::from(items > 0),
        }
    }

    /// Returns what this node inherited from retired children since the last reduction.
    pub fn adopted_share(&self) -> EpochShare {
        EpochShare {
            items: self.adopted_items.load(Ordering::Relaxed),
            loss: self.adopted_loss.load(Ordering::Relaxed),
            contributors: self.adopted_contributors.load(Ordering::Relaxed),
        }
    }

    /// Inherits the epoch share of a retired child.
    pub fn adopt(&self, share: EpochShare) {
        self.adopted_items.fetch_add(share.items, Ordering::Relaxed);
        self.adopted_loss.fetch_add(share.loss, Ordering::Relaxed);
        self.adopted_contributors
            .fetch_add(share.contributors, Ordering::Relaxed);
    }

    /// Returns the full epoch share, own and adopted.
    pub fn epoch_share(&self) -> EpochShare {
        let own = self.own_share();
        let adopted = self.adopted_share();

        EpochShare {
            items: own.items + adopted.items,
            loss: own.loss + adopted.loss,
            contributors: own.contributors + adopted.contributors,
        }
    }

    pub fn reset_epoch(&self) {
        self.epoch_items.store(0, Ordering::Relaxed);
        self.epoch_loss.store(0., Ordering::Relaxed);
        self.adopted_items.store(0, Ordering::Relaxed);
        self.adopted_loss.store(0., Ordering::Relaxed);
        self.adopted_contributors.store(0, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }
}

/// A point in time snapshot of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeStats {
    pub id: NodeId,
    pub level: usize,
    pub index: usize,
    pub group: u8,
    pub parent: Option<NodeId>,
    pub role: Role,
    pub state: NodeState,
    pub children: usize,
    pub queue_depth: usize,
    pub processed: u64,
    pub skipped: u64,
    pub dispatched: u64,
    pub steals: u64,
    pub items_stolen: u64,
    pub stolen_from: u64,
    pub spawned: u64,
    pub retired: u64,
    pub busy_secs: f64,
    pub idle_secs: f64,
    pub loss_sum: f64,
    pub segment: Option<Segment>,
}

impl NodeStats {
    pub(super) fn fill_counters(&mut self, counters: &NodeCounters) {
        self.processed = counters.processed();
        self.skipped = counters.skipped();
        self.dispatched = counters.dispatched.load(Ordering::Relaxed);
        self.steals = counters.steals.load(Ordering::Relaxed);
        self.items_stolen = counters.items_stolen.load(Ordering::Relaxed);
        self.stolen_from = counters.stolen_from.load(Ordering::Relaxed);
        self.spawned = counters.spawned.load(Ordering::Relaxed);
        self.retired = counters.retired.load(Ordering::Relaxed);
        self.busy_secs = counters.busy_ns.load(Ordering::Relaxed) as f64 * 1e-9;
        self.idle_secs = counters.idle_ns.load(Ordering::Relaxed) as f64 * 1e-9;
        self.loss_sum = counters.loss_sum.load(Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn epoch_share_includes_adopted() {
        let counters = NodeCounters::default();
        counters.record_processed(0.5, Duration::from_millis(1));
        counters.record_processed(1.5, Duration::from_millis(1));
        counters.adopt(EpochShare {
            items: 3,
            loss: 1.,
            contributors: 1,
        });

        let share = counters.epoch_share();
        assert_eq!(share.items, 5);
        assert_eq!(share.contributors, 2);
        assert!((share.loss - 3.).abs() < 1e-9);

        counters.reset_epoch();
        assert_eq!(counters.epoch_share(), EpochShare::default());
        assert_eq!(counters.processed(), 2);
    }

    #[test]
    fn idle_cycles_count_up_and_reset() {
        let counters = NodeCounters::default();

        assert_eq!(counters.idle_cycle(), 1);
        assert_eq!(counters.idle_cycle(), 2);
        counters.reset_idle_cycles();
        assert_eq!(counters.idle_cycles(), 0);
    }
}
