mod queue;
mod state;
mod stats;

use std::{
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use parking_lot::{Condvar, Mutex, MutexGuard};

pub use queue::WorkQueue;
pub use state::{NodeState, StateCell};
pub use stats::{EpochShare, NodeCounters, NodeStats, Role};

use crate::{
    error::{HierarchyErr, Result},
    gradient::{Segment, simd},
};

/// Identifies a node for the whole life of its hierarchy.
pub type NodeId = usize;

/// The mutable wiring of a node, guarded by the node's state mutex.
#[derive(Debug, Default)]
pub struct Links {
    pub children: Vec<NodeId>,
    pub siblings: Arc<[NodeId]>,
    pub next_child: usize,
    /// Children created with the hierarchy, these are never retired.
    pub baseline: usize,
}

/// One vertex of the sphere hierarchy, driven by exactly one OS thread.
#[derive(Debug)]
pub struct Node<W> {
    id: NodeId,
    level: usize,
    index: usize,
    group: u8,
    parent: Option<NodeId>,
    state: StateCell,
    links: Mutex<Links>,
    wakeup: Condvar,
    queue: WorkQueue<W>,
    partial: Mutex<Box<[f32]>>,
    counters: NodeCounters,
    ticket: Mutex<Option<Arc<Barrier>>>,
    retired: AtomicBool,
    live: AtomicBool,
}

impl<W> Node<W> {
    /// Creates a new `Node` in the `Ready` state.
    ///
    /// # Arguments
    /// * `id` - The hierarchy wide id.
    /// * `level` - Depth in the tree, the root is level 0.
    /// * `index` - Position among the nodes of its level.
    /// * `group` - Symmetry group, the position among its siblings modulo 12.
    /// * `parent` - The parent's id, `None` for the root.
    /// * `gradient_size` - Length of the node's partial gradient.
    ///
    /// # Returns
    /// An `Allocation` error if the partial gradient can't be reserved.
    pub fn new(
        id: NodeId,
        level: usize,
        index: usize,
        group: u8,
        parent: Option<NodeId>,
        gradient_size: usize,
    ) -> Result<Self> {
        let mut partial = Vec::new();
        partial
            .try_reserve_exact(gradient_size)
            .map_err(|_| HierarchyErr::Allocation {
                bytes: gradient_size * size_of::<f32>(),
            })?;
        partial.resize(gradient_size, 0.);

        Ok(Self {
            id,
            level,
            index,
            group,
            parent,
            state: StateCell::new(NodeState::Ready),
            links: Mutex::new(Links::default()),
            wakeup: Condvar::new(),
            queue: WorkQueue::new(),
            partial: Mutex::new(partial.into_boxed_slice()),
            counters: NodeCounters::default(),
            ticket: Mutex::new(None),
            retired: AtomicBool::new(false),
            live: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn level(&self) -> usize {
        self.level
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn state(&self) -> NodeState {
        self.state.load()
    }

    pub fn transition(&self, from: NodeState, to: NodeState) -> bool {
        self.state.transition(from, to)
    }

    pub fn queue(&self) -> &WorkQueue<W> {
        &self.queue
    }

    pub fn counters(&self) -> &NodeCounters {
        &self.counters
    }

    /// Locks the node's wiring, always lock a parent before its children.
    pub fn links(&self) -> MutexGuard<'_, Links> {
        self.links.lock()
    }

    /// Locks the node's partial gradient.
    pub fn partial(&self) -> MutexGuard<'_, Box<[f32]>> {
        self.partial.lock()
    }

    pub fn children(&self) -> Vec<NodeId> {
        self.links.lock().children.clone()
    }

    pub fn child_count(&self) -> usize {
        self.links.lock().children.len()
    }

    pub fn siblings(&self) -> Arc<[NodeId]> {
        Arc::clone(&self.links.lock().siblings)
    }

    pub fn role(&self) -> Role {
        if self.child_count() > 0 {
            Role::Control
        } else {
            Role::Worker
        }
    }

    /// Picks the next child in round robin order.
    pub fn next_child(&self) -> Option<NodeId> {
        let mut links = self.links.lock();
        if links.children.is_empty() {
            return None;
        }

        let pos = links.next_child % links.children.len();
        links.next_child = pos + 1;
        Some(links.children[pos])
    }

    /// Adds `values` to the node's partial gradient.
    pub fn accumulate(&self, values: &[f32]) {
        simd::accumulate(&mut self.partial.lock(), values);
    }

    /// Moves an idle node back to `Ready` and wakes its thread.
    pub fn wake(&self) {
        let _links = self.links.lock();
        self.state.transition(NodeState::Idle, NodeState::Ready);
        self.wakeup.notify_all();
    }

    /// Wakes the node's thread whatever its state is.
    pub fn notify(&self) {
        let _links = self.links.lock();
        self.wakeup.notify_all();
    }

    /// Sleeps while the node is `Idle`, for at most `timeout`.
    ///
    /// A node with queued work is moved back to `Ready` without sleeping, the check
    /// happens under the state mutex so a concurrent `wake` can't be missed.
    ///
    /// # Returns
    /// Whether the wait ran out without anyone waking the node.
    pub fn wait_for_work(&self, timeout: Duration) -> bool {
        let mut links = self.links.lock();

        if !self.queue.is_empty() {
            self.state.transition(NodeState::Idle, NodeState::Ready);
            return false;
        }

        if self.state() != NodeState::Idle {
            return false;
        }

        self.wakeup.wait_for(&mut links, timeout).timed_out()
    }

    /// Sleeps while the node is parked by a reduction, for at most `timeout`.
    pub fn wait_parked(&self, timeout: Duration) {
        let mut links = self.links.lock();

        if self.state() == NodeState::Accumulating {
            self.wakeup.wait_for(&mut links, timeout);
        }
    }

    /// Asks the node's thread to leave its loop.
    pub fn request_termination(&self) -> bool {
        let requested = self.state.request_termination();
        self.notify();
        requested
    }

    /// Marks the node's thread as exited.
    pub fn mark_terminated(&self) {
        self.state.mark_terminated();
    }

    /// Makes a stopped node startable again, a node still driven by a thread is left
    /// alone.
    pub fn rearm(&self) -> bool {
        !self.is_live() && self.state.rearm()
    }

    /// Hands the node its place in a pending barrier.
    pub fn give_ticket(&self, barrier: Arc<Barrier>) {
        *self.ticket.lock() = Some(barrier);
    }

    pub fn take_ticket(&self) -> Option<Arc<Barrier>> {
        self.ticket.lock().take()
    }

    /// Flags the node as detached from its parent, its work and gradient still
    /// have to be handed back.
    pub fn mark_retired(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Claims the pending hand back of a retired node.
    ///
    /// # Returns
    /// `true` for exactly one caller after `mark_retired`.
    pub fn take_retired(&self) -> bool {
        self.retired.swap(false, Ordering::SeqCst)
    }

    /// Records whether an OS thread currently drives this node.
    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Takes a snapshot of the node.
    ///
    /// # Arguments
    /// * `segment` - The node's gradient segment, if it's a worker.
    pub fn snapshot(&self, segment: Option<Segment>) -> NodeStats {
        let children = self.child_count();
        let mut stats = NodeStats {
            id: self.id,
            level: self.level,
            index: self.index,
            group: self.group,
            parent: self.parent,
            role: if children > 0 { Role::Control } else { Role::Worker },
            state: self.state(),
            children,
            queue_depth: self.queue.len(),
            processed: 0,
            skipped: 0,
            dispatched: 0,
            steals: 0,
            items_stolen: 0,
            stolen_from: 0,
            spawned: 0,
            retired: 0,
            busy_secs: 0.,
            idle_secs: 0.,
            loss_sum: 0.,
            segment,
        };

        stats.fill_counters(&self.counters);
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node() -> Node<u32> {
        Node::new(0, 0, 0, 0, None, 4).unwrap()
    }

    #[test]
    fn round_robin_over_children() {
        let node = node();
        node.links().children.extend([4, 5, 6]);

        let picked: Vec<_> = (0..5).filter_map(|_| node.next_child()).collect();
        assert_eq!(picked, [4, 5, 6, 4, 5]);
        assert_eq!(node.role(), Role::Control);
    }

    #[test]
    fn worker_has_no_next_child() {
        let node = node();
        assert_eq!(node.next_child(), None);
        assert_eq!(node.role(), Role::Worker);
    }

    #[test]
    fn wake_moves_idle_to_ready() {
        let node = node();
        assert!(node.transition(NodeState::Ready, NodeState::Idle));

        node.wake();
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[test]
    fn queued_work_skips_the_idle_wait() {
        let node = node();
        node.queue().push(1);
        assert!(node.transition(NodeState::Ready, NodeState::Idle));

        assert!(!node.wait_for_work(Duration::from_secs(10)));
        assert_eq!(node.state(), NodeState::Ready);
    }

    #[test]
    fn empty_idle_wait_times_out() {
        let node = node();
        assert!(node.transition(NodeState::Ready, NodeState::Idle));

        assert!(node.wait_for_work(Duration::from_millis(1)));
        assert_eq!(node.state(), NodeState::Idle);
    }

    #[test]
    fn retired_hand_back_is_claimed_once() {
        let node = node();
        assert!(!node.take_retired());

        node.mark_retired();
        assert!(node.take_retired());
        assert!(!node.take_retired());
    }

    #[test]
    fn partial_accumulates() {
        let node = node();
        node.accumulate(&[1., 2., 3., 4.]);
        node.accumulate(&[1., 1., 1., 1.]);

        assert_eq!(&node.partial()[..], &[2., 3., 4., 5.]);
    }

    #[test]
    fn snapshot_reports_queue_and_role() {
        let node = node();
        node.queue().push_many([1, 2]);

        let stats = node.snapshot(Some(Segment::new(0, 4)));
        assert_eq!(stats.queue_depth, 2);
        assert_eq!(stats.role, Role::Worker);
        assert_eq!(stats.state, NodeState::Ready);
    }
}
