use std::{
    sync::{Arc, atomic::Ordering},
    time::Duration,
};

use log::{debug, error, info, warn};

use super::Shared;
use crate::{
    config::{FANOUT, MAX_LEVELS},
    error::{HierarchyErr, Result},
    gradient::simd,
    node::{Node, NodeId, NodeState},
    training::Trainer,
};

/// Rounds a wanted amount of children down to a symmetric group size.
fn symmetric_batch(wanted: usize) -> usize {
    [12, 6, 3, 1]
        .into_iter()
        .find(|&size| size <= wanted)
        .unwrap_or(0)
}

/// Spawns children under a control node whose queue is backing up.
pub(super) fn maybe_grow<T: Trainer>(shared: &Arc<Shared<T>>, node: &Node<T::Item>) {
    let tuning = shared.tuning();
    let depth = node.queue().len();
    if depth <= tuning.spawn_queue_threshold {
        return;
    }

    let children = node.child_count();
    if children >= FANOUT {
        return;
    }

    let wanted = (depth / tuning.spawn_per_pending.max(1)).min(FANOUT - children);
    let batch = symmetric_batch(wanted);
    debug!(node = node.id(), queue = depth, spawning = batch; "queue over threshold");

    for _ in 0..batch {
        match spawn_child(shared, node.id()) {
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                error!(node = node.id(); "failed to grow: {e}");
                break;
            }
        }
    }
}

/// Retires the spawned children of `node` that stayed idle for long enough.
///
/// Nothing happens unless more than half of the children are idle. The node keeps
/// at least one child and never drops below the children it was built with.
pub(super) fn maybe_shrink<T: Trainer>(shared: &Shared<T>, node: &Node<T::Item>) {
    if !node.queue().is_empty() {
        return;
    }

    let (children, baseline) = {
        let links = node.links();
        (links.children.clone(), links.baseline)
    };

    let keep = baseline.max(1);
    if children.len() <= keep {
        return;
    }

    let threshold = shared.tuning().idle_cycles_before_retire;
    let reclaimable: Vec<NodeId> = {
        let arena = shared.arena.read();
        children
            .iter()
            .filter_map(|&id| arena.get(id))
            .filter(|child| {
                child.queue().is_empty()
                    && child.counters().idle_cycles() >= threshold
                    && matches!(child.state(), NodeState::Idle | NodeState::Ready)
            })
            .map(|child| child.id())
            .collect()
    };

    if reclaimable.len() * 2 <= children.len() {
        return;
    }

    for id in children[keep..].iter().filter(|id| reclaimable.contains(id)) {
        match retire_child(shared, node.id(), *id) {
            Ok(_) => {}
            Err(e) => warn!(node = node.id(), child = *id; "failed to retire child: {e}"),
        }
    }
}

/// Attaches a new worker to `parent_id`, starting its thread if the hierarchy runs.
///
/// # Returns
/// The new child's id, `None` if the parent is full, terminating or at the deepest
/// level, or the construction or spawn error. A failed spawn leaves the tree as it
/// was.
pub(super) fn spawn_child<T: Trainer>(
    shared: &Arc<Shared<T>>,
    parent_id: NodeId,
) -> Result<Option<NodeId>> {
    let mut arena = shared.arena.write();
    let parent = arena
        .get(parent_id)
        .cloned()
        .ok_or(HierarchyErr::UnknownNode(parent_id))?;

    let level = parent.level() + 1;
    if parent.state().is_terminal() || level >= MAX_LEVELS {
        return Ok(None);
    }

    let mut links = parent.links();
    if links.children.len() >= FANOUT {
        return Ok(None);
    }

    let id = shared.next_id.fetch_add(1, Ordering::Relaxed);
    let group = (links.children.len() % FANOUT) as u8;
    let index = arena.next_index(level);
    let child = Arc::new(Node::new(
        id,
        level,
        index,
        group,
        Some(parent_id),
        shared.gradient_size(),
    )?);

    arena.insert(Arc::clone(&child));
    links.children.push(id);
    arena.rewire_siblings(&links.children);

    if shared.is_running() {
        match shared.spawn_thread(&child) {
            Ok(handle) => shared.threads.lock().push((id, handle)),
            Err(e) => {
                links.children.pop();
                arena.rewire_siblings(&links.children);
                arena.remove(id);
                return Err(e);
            }
        }
    }

    drop(links);
    shared.reap_finished();
    parent.counters().record_spawn();

    info!(parent = parent_id, child = id, level = level; "spawned child");
    Ok(Some(id))
}

/// Detaches a dynamically spawned worker from its parent and stops it.
///
/// The child finishes its in-flight item, then its queued items and partial gradient
/// go back to the parent.
///
/// # Returns
/// Whether the child was retired, `false` for children the parent was built with
/// and for children that have children of their own.
pub(super) fn retire_child<T: Trainer>(
    shared: &Shared<T>,
    parent_id: NodeId,
    child_id: NodeId,
) -> Result<bool> {
    let child = {
        let mut arena = shared.arena.write();
        let parent = arena
            .get(parent_id)
            .cloned()
            .ok_or(HierarchyErr::UnknownNode(parent_id))?;

        let mut links = parent.links();
        let pos = links
            .children
            .iter()
            .position(|&c| c == child_id)
            .ok_or(HierarchyErr::UnknownNode(child_id))?;

        let child = arena
            .get(child_id)
            .cloned()
            .ok_or(HierarchyErr::UnknownNode(child_id))?;

        if pos < links.baseline || child.child_count() > 0 {
            return Ok(false);
        }

        links.children.remove(pos);
        if links.next_child > pos {
            links.next_child -= 1;
        }

        arena.rewire_siblings(&links.children);
        child.links().siblings = Arc::from([]);
        arena.remove(child_id);

        shared.retiring.fetch_add(1, Ordering::AcqRel);
        parent.counters().record_retire();
        child
    };

    child.mark_retired();
    child.request_termination();

    if !child.is_live() && child.take_retired() {
        hand_back(shared, &child);
    }

    info!(parent = parent_id, child = child_id; "retired child");
    Ok(true)
}

/// Returns a retired node's queued items, partial gradient and epoch share to its
/// parent.
///
/// A parent retired in the meantime is gone from the arena, the root takes the work
/// instead.
pub(super) fn hand_back<T: Trainer>(shared: &Shared<T>, node: &Node<T::Item>) {
    let leftovers = node.queue().drain();
    let returned = leftovers.len();

    let partial = {
        let mut partial = node.partial();
        let copy = partial.to_vec();
        simd::zero(&mut partial);
        copy
    };

    let share = node.counters().epoch_share();
    node.counters().reset_epoch();

    {
        let arena = shared.arena.read();
        let target = node.parent().and_then(|id| arena.get(id)).or_else(|| arena.root());

        match target {
            Some(target) => {
                if Some(target.id()) != node.parent() {
                    debug!(
                        node = node.id(), target = target.id();
                        "parent is gone, handing back to root"
                    );
                }

                simd::accumulate(&mut target.partial(), &partial);
                target.counters().adopt(share);
                target.queue().push_many(leftovers);
                target.wake();
            }
            None => {
                error!(node = node.id(); "no node left to hand back to, skipping {returned} items");
                for _ in 0..returned {
                    node.counters().record_skipped(Duration::ZERO);
                }
                shared.complete(returned);
            }
        }
    }

    shared.retired.lock().push(node.snapshot(None));
    shared.retiring.fetch_sub(1, Ordering::AcqRel);
    shared.notify_quiet();

    debug!(node = node.id(), returned = returned; "handed work back");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batches_are_symmetric() {
        assert_eq!(symmetric_batch(0), 0);
        assert_eq!(symmetric_batch(1), 1);
        assert_eq!(symmetric_batch(2), 1);
        assert_eq!(symmetric_batch(5), 3);
        assert_eq!(symmetric_batch(11), 6);
        assert_eq!(symmetric_batch(40), 12);
    }
}
