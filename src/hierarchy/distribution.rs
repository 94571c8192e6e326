//! Moving work items between queues.
//!
//! Every push into another node's queue happens under the arena's read lock with the
//! target still in the arena. A retired node is removed under the write lock before
//! it hands its queue back, so nothing can land in its queue afterwards.

use std::sync::{Arc, atomic::Ordering};

use log::debug;

use super::Shared;
use crate::{
    error::{HierarchyErr, Result},
    node::{Node, NodeId},
    training::Trainer,
};

/// Splits `items` into contiguous, evenly sized runs, one per worker.
///
/// # Returns
/// The amount of distributed items.
pub(super) fn distribute<T: Trainer>(shared: &Shared<T>, items: Vec<T::Item>) -> usize {
    let total = items.len();
    if total == 0 {
        return 0;
    }

    shared.pending.fetch_add(total, Ordering::AcqRel);

    let arena = shared.arena.read();
    let workers = arena.workers();
    let base = total / workers.len();
    let extra = total % workers.len();
    let mut items = items.into_iter();

    for (i, worker) in workers.iter().enumerate() {
        let share = base + usize::from(i < extra);
        if share == 0 {
            break;
        }

        worker.queue().push_many(items.by_ref().take(share));
        worker.wake();
    }

    debug!(items = total, workers = workers.len(); "distributed work");
    total
}

/// Pushes `items` into one node's queue, a control node fans them out.
///
/// # Returns
/// The amount of submitted items or an `UnknownNode` error.
pub(super) fn submit<T: Trainer>(
    shared: &Shared<T>,
    target: NodeId,
    items: Vec<T::Item>,
) -> Result<usize> {
    let arena = shared.arena.read();
    let node = arena.get(target).ok_or(HierarchyErr::UnknownNode(target))?;

    let total = items.len();
    shared.pending.fetch_add(total, Ordering::AcqRel);
    node.queue().push_many(items);
    node.wake();

    Ok(total)
}

/// Hands one item from a control node to its next child in round robin order.
///
/// # Returns
/// Whether a child took the item, otherwise it's back at the head of `node`'s queue.
pub(super) fn dispatch<T: Trainer>(
    shared: &Shared<T>,
    node: &Node<T::Item>,
    item: T::Item,
) -> bool {
    let Some(child_id) = node.next_child() else {
        node.queue().push_front(item);
        return false;
    };

    let arena = shared.arena.read();
    let Some(child) = arena.get(child_id) else {
        node.queue().push_front(item);
        return false;
    };

    child.queue().push(item);
    child.wake();
    node.counters().record_dispatch();
    true
}

/// Moves a small batch from the first sibling with queued work into `thief`'s queue.
///
/// # Returns
/// The amount of stolen items.
pub(super) fn steal<T: Trainer>(shared: &Shared<T>, thief: &Node<T::Item>) -> usize {
    let siblings = thief.siblings();
    if siblings.is_empty() {
        return 0;
    }

    let batch = shared.tuning().steal_batch();
    let arena = shared.arena.read();

    for &id in siblings.iter().filter(|&&id| id != thief.id()) {
        let Some(victim) = arena.get(id).map(Arc::as_ref) else {
            continue;
        };

        if victim.queue().is_empty() {
            continue;
        }

        let stolen = victim.queue().steal(batch);
        if stolen.is_empty() {
            continue;
        }

        let count = thief.queue().push_many(stolen);
        thief.counters().record_steal(count);
        victim.counters().record_stolen_from(count);

        debug!(thief = thief.id(), victim = id, items = count; "stole work");
        return count;
    }

    0
}
