mod distribution;
mod reduction;
mod resize;
mod runtime;
mod topology;

use std::{
    collections::HashMap,
    mem,
    sync::{
        Arc, Barrier,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use log::{debug, error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use serde::Serialize;

pub use reduction::ReductionSummary;
pub use topology::{ROOT, plan_levels};

use topology::Arena;

use crate::{
    config::{HierarchySpec, Tuning},
    error::{HierarchyErr, Result},
    gradient::{GradientBuffer, Segment},
    node::{Node, NodeId, NodeStats},
    training::Trainer,
};

/// State shared by the hierarchy handle and every node thread.
pub(crate) struct Shared<T: Trainer> {
    spec: HierarchySpec,
    trainer: T,
    arena: RwLock<Arena<T::Item>>,
    next_id: AtomicUsize,
    running: AtomicBool,
    /// Items distributed but not yet processed or skipped.
    pending: AtomicUsize,
    /// Retired nodes that haven't handed their work back yet.
    retiring: AtomicUsize,
    quiet_lock: Mutex<()>,
    quiet: Condvar,
    threads: Mutex<Vec<(NodeId, JoinHandle<()>)>>,
    retired: Mutex<Vec<NodeStats>>,
}

impl<T: Trainer> Shared<T> {
    fn tuning(&self) -> &Tuning {
        &self.spec.tuning
    }

    fn gradient_size(&self) -> usize {
        self.spec.gradient_size
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn node(&self, id: NodeId) -> Option<Arc<Node<T::Item>>> {
        self.arena.read().get(id).cloned()
    }

    /// Marks `items` work items as done.
    fn complete(&self, items: usize) {
        if items > 0 && self.pending.fetch_sub(items, Ordering::AcqRel) == items {
            self.notify_quiet();
        }
    }

    fn is_quiet(&self) -> bool {
        self.pending.load(Ordering::Acquire) == 0 && self.retiring.load(Ordering::Acquire) == 0
    }

    fn notify_quiet(&self) {
        let _guard = self.quiet_lock.lock();
        self.quiet.notify_all();
    }

    /// Blocks until no work is pending and no retired node is handing work back.
    ///
    /// # Returns
    /// Whether the hierarchy went quiet before `timeout`.
    fn wait_quiet(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let poll = self.tuning().idle_timeout();
        let mut guard = self.quiet_lock.lock();

        while !self.is_quiet() {
            let wait = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    poll.min(deadline - now)
                }
                None => poll,
            };

            self.quiet.wait_for(&mut guard, wait);
        }

        true
    }

    fn spawn_thread(self: &Arc<Self>, node: &Arc<Node<T::Item>>) -> Result<JoinHandle<()>> {
        let shared = Arc::clone(self);
        let worker = Arc::clone(node);

        node.set_live(true);
        thread::Builder::new()
            .name(format!("sphere-{}", node.id()))
            .spawn(move || runtime::run(shared, worker))
            .map_err(|source| {
                node.set_live(false);
                error!(node = node.id(); "failed to spawn node thread: {source}");
                HierarchyErr::ThreadSpawn {
                    node: node.id(),
                    source,
                }
            })
    }

    /// Joins the threads of retired nodes that already exited.
    fn reap_finished(&self) {
        let finished: Vec<_> = {
            let mut threads = self.threads.lock();
            let (finished, live) = mem::take(&mut *threads)
                .into_iter()
                .partition(|(_, handle)| handle.is_finished());
            *threads = live;
            finished
        };

        for (id, handle) in finished {
            if handle.join().is_err() {
                error!(node = id; "node thread panicked");
            }
        }
    }

    /// Moves every node to `Terminating` and joins every thread.
    fn terminate_all(&self) {
        self.running.store(false, Ordering::SeqCst);

        for node in self.arena.read().nodes() {
            node.request_termination();
        }

        loop {
            let threads = mem::take(&mut *self.threads.lock());
            if threads.is_empty() {
                break;
            }

            for (id, handle) in threads {
                if handle.join().is_err() {
                    error!(node = id; "node thread panicked");
                }
            }
        }
    }
}

/// Per node and aggregated statistics of a hierarchy.
#[derive(Debug, Clone, Serialize)]
pub struct HierarchyStats {
    pub nodes_per_level: Vec<usize>,
    pub total_nodes: usize,
    pub total_processed: u64,
    pub total_skipped: u64,
    pub total_dispatched: u64,
    pub total_steals: u64,
    pub total_spawned: u64,
    pub total_retired: u64,
    pub pending: usize,
    pub nodes: Vec<NodeStats>,
    /// Nodes that were retired, as they were when they handed their work back.
    pub retired: Vec<NodeStats>,
}

impl HierarchyStats {
    fn new(
        nodes: Vec<NodeStats>,
        retired: Vec<NodeStats>,
        nodes_per_level: Vec<usize>,
        pending: usize,
    ) -> Self {
        let all = || nodes.iter().chain(&retired);

        Self {
            total_nodes: nodes.len(),
            total_processed: all().map(|n| n.processed).sum(),
            total_skipped: all().map(|n| n.skipped).sum(),
            total_dispatched: all().map(|n| n.dispatched).sum(),
            total_steals: all().map(|n| n.steals).sum(),
            total_spawned: all().map(|n| n.spawned).sum(),
            total_retired: all().map(|n| n.retired).sum(),
            nodes_per_level,
            pending,
            nodes,
            retired,
        }
    }
}

/// A fixed fanout tree of threads that runs training work and reduces its gradients.
///
/// Control nodes, the ones with children, only hand work down. Worker nodes run the
/// `Trainer` on every item they get and accumulate the result into a private partial
/// gradient, `reduce` folds those partials into a single `GradientBuffer`.
pub struct Hierarchy<T: Trainer> {
    shared: Arc<Shared<T>>,
    gradient: GradientBuffer,
    last: ReductionSummary,
}

impl<T: Trainer> Hierarchy<T> {
    /// Builds every node of a hierarchy, no thread is started.
    ///
    /// # Arguments
    /// * `spec` - The shape of the tree and the size of the gradient.
    /// * `trainer` - The work run by worker nodes.
    ///
    /// # Returns
    /// A new hierarchy, or an `InvalidTopology` or `Allocation` error with nothing
    /// left allocated.
    pub fn create(spec: HierarchySpec, trainer: T) -> Result<Self> {
        let (arena, next_id) = topology::build(&spec)?;

        info!(
            "created hierarchy of {} nodes, levels {:?}, gradient of {}",
            arena.len(),
            arena.nodes_per_level(),
            spec.gradient_size
        );

        let gradient = GradientBuffer::new(spec.gradient_size);
        let shared = Shared {
            spec,
            trainer,
            arena: RwLock::new(arena),
            next_id: AtomicUsize::new(next_id),
            running: AtomicBool::new(false),
            pending: AtomicUsize::new(0),
            retiring: AtomicUsize::new(0),
            quiet_lock: Mutex::new(()),
            quiet: Condvar::new(),
            threads: Mutex::new(Vec::new()),
            retired: Mutex::new(Vec::new()),
        };

        Ok(Self {
            shared: Arc::new(shared),
            gradient,
            last: ReductionSummary::default(),
        })
    }

    /// Starts one thread per node.
    ///
    /// # Returns
    /// `AlreadyRunning`, or a `ThreadSpawn` error after every thread started so far
    /// was terminated and joined.
    pub fn start(&mut self) -> Result<()> {
        if self.shared.is_running() {
            return Err(HierarchyErr::AlreadyRunning);
        }

        let nodes: Vec<_> = self.shared.arena.read().nodes().cloned().collect();
        self.shared.running.store(true, Ordering::SeqCst);

        for node in &nodes {
            node.rearm();

            match self.shared.spawn_thread(node) {
                Ok(handle) => self.shared.threads.lock().push((node.id(), handle)),
                Err(e) => {
                    self.shared.terminate_all();
                    return Err(e);
                }
            }
        }

        info!("started {} node threads", nodes.len());
        Ok(())
    }

    /// Waits for the distributed work, then terminates and joins every thread.
    ///
    /// The wait is bounded by the tuning's drain timeout, work still queued after it
    /// stays queued for the next `start`.
    pub fn stop(&mut self) -> Result<()> {
        if !self.shared.is_running() {
            return Err(HierarchyErr::NotRunning);
        }

        if !self.shared.wait_quiet(self.shared.tuning().drain_timeout()) {
            warn!(
                "drain timed out with {} items pending",
                self.shared.pending.load(Ordering::Acquire)
            );
        }

        self.shared.terminate_all();
        info!("stopped hierarchy");
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        self.shared.is_running()
    }

    /// Splits `items` evenly over the worker nodes, in contiguous runs.
    ///
    /// # Returns
    /// The amount of distributed items.
    pub fn distribute<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T::Item>,
    {
        Ok(distribution::distribute(&self.shared, items.into_iter().collect()))
    }

    /// Pushes `items` into the root's queue, control nodes fan them out.
    pub fn submit<I>(&self, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T::Item>,
    {
        self.submit_to(ROOT, items)
    }

    /// Pushes `items` into the queue of node `target`.
    ///
    /// # Returns
    /// The amount of submitted items, or `UnknownNode` if `target` isn't live.
    pub fn submit_to<I>(&self, target: NodeId, items: I) -> Result<usize>
    where
        I: IntoIterator<Item = T::Item>,
    {
        distribution::submit(&self.shared, target, items.into_iter().collect())
    }

    /// Blocks until every distributed item was processed or skipped.
    ///
    /// # Arguments
    /// * `timeout` - Upper bound of the wait, `None` waits as long as it takes.
    ///
    /// # Returns
    /// Whether the hierarchy drained. A hierarchy that isn't running never drains.
    pub fn wait_idle(&self, timeout: Option<Duration>) -> bool {
        if !self.shared.is_running() {
            return self.shared.is_quiet();
        }

        self.shared.wait_quiet(timeout)
    }

    /// Blocks until every live node reached the barrier.
    ///
    /// Nodes reach it between two work items, the call returns once all of them got
    /// there and were released.
    pub fn barrier(&self) -> Result<()> {
        if !self.shared.is_running() {
            return Err(HierarchyErr::NotRunning);
        }

        let (barrier, nodes) = {
            let arena = self.shared.arena.write();
            let nodes: Vec<_> = arena
                .nodes()
                .filter(|n| !n.state().is_terminal())
                .cloned()
                .collect();

            let barrier = Arc::new(Barrier::new(nodes.len() + 1));
            for node in &nodes {
                node.give_ticket(Arc::clone(&barrier));
            }

            (barrier, nodes)
        };

        for node in &nodes {
            node.wake();
        }

        debug!(parties = nodes.len() + 1; "waiting at barrier");
        barrier.wait();
        Ok(())
    }

    /// Folds every partial gradient into the global buffer.
    ///
    /// A running hierarchy is first drained so that no work is in flight.
    pub fn reduce(&mut self) -> &GradientBuffer {
        let running = self.shared.is_running();

        let arena = loop {
            if running {
                self.shared.wait_quiet(None);
            }

            // A retire can slip in before the read lock, its hand back needs the lock too.
            let arena = self.shared.arena.read();
            if self.shared.retiring.load(Ordering::Acquire) == 0 {
                break arena;
            }

            drop(arena);
            thread::yield_now();
        };

        self.last = reduction::reduce(&arena, &self.gradient, self.shared.tuning().averaging);
        &self.gradient
    }

    /// Returns the reduced gradient of the last `reduce`.
    pub fn gradient(&self) -> &GradientBuffer {
        &self.gradient
    }

    pub fn last_reduction(&self) -> &ReductionSummary {
        &self.last
    }

    pub fn stats(&self) -> HierarchyStats {
        let arena = self.shared.arena.read();
        let segments: HashMap<NodeId, Segment> = arena
            .worker_segments(self.shared.gradient_size())
            .into_iter()
            .collect();

        let nodes = arena
            .nodes()
            .map(|node| node.snapshot(segments.get(&node.id()).copied()))
            .collect();

        HierarchyStats::new(
            nodes,
            self.shared.retired.lock().clone(),
            arena.nodes_per_level(),
            self.shared.pending.load(Ordering::Acquire),
        )
    }

    /// Logs a summary of `stats`, one line per level and per node at debug.
    pub fn log_stats(&self) {
        let stats = self.stats();

        info!(
            "hierarchy: {} nodes {:?}, {} processed, {} skipped, {} steals, {} spawned, \
             {} retired, {} pending",
            stats.total_nodes,
            stats.nodes_per_level,
            stats.total_processed,
            stats.total_skipped,
            stats.total_steals,
            stats.total_spawned,
            stats.total_retired,
            stats.pending
        );

        for node in &stats.nodes {
            debug!(
                node = node.id, level = node.level;
                "{:?} {} queue={} processed={} skipped={} dispatched={} steals={} \
                 busy={:.3}s idle={:.3}s",
                node.role,
                node.state.name(),
                node.queue_depth,
                node.processed,
                node.skipped,
                node.dispatched,
                node.steals,
                node.busy_secs,
                node.idle_secs
            );
        }
    }

    /// Returns every worker with its slice of the gradient, in depth first order.
    pub fn segments(&self) -> Vec<(NodeId, Segment)> {
        self.shared
            .arena
            .read()
            .worker_segments(self.shared.gradient_size())
    }

    pub fn nodes_per_level(&self) -> Vec<usize> {
        self.shared.arena.read().nodes_per_level()
    }

    pub fn total_nodes(&self) -> usize {
        self.shared.arena.read().len()
    }

    /// Returns the ids of the live children of `node`.
    pub fn children(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let arena = self.shared.arena.read();
        let node = arena.get(node).ok_or(HierarchyErr::UnknownNode(node))?;
        Ok(node.children())
    }

    /// Returns the ids of the nodes sharing `node`'s parent.
    pub fn siblings(&self, node: NodeId) -> Result<Vec<NodeId>> {
        let arena = self.shared.arena.read();
        let node = arena.get(node).ok_or(HierarchyErr::UnknownNode(node))?;
        Ok(node.siblings().to_vec())
    }

    /// Attaches a new worker under `parent`.
    ///
    /// # Returns
    /// The new node's id, `None` if `parent` can't take more children.
    pub fn spawn_child(&self, parent: NodeId) -> Result<Option<NodeId>> {
        resize::spawn_child(&self.shared, parent)
    }

    /// Retires a dynamically spawned worker, its work goes back to `parent`.
    ///
    /// # Returns
    /// Whether the child was retired, nodes built with the hierarchy are kept.
    pub fn retire_child(&self, parent: NodeId, child: NodeId) -> Result<bool> {
        resize::retire_child(&self.shared, parent, child)
    }

    pub fn spec(&self) -> &HierarchySpec {
        &self.shared.spec
    }

    pub fn trainer(&self) -> &T {
        &self.shared.trainer
    }
}

impl<T: Trainer> Drop for Hierarchy<T> {
    fn drop(&mut self) {
        if self.shared.is_running() {
            self.shared.terminate_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{node::NodeState, training::FnTrainer};

    #[test]
    fn failed_start_leaves_a_restartable_hierarchy() -> Result<()> {
        let trainer = FnTrainer::new(|_: &usize, grads: &mut [f32]| {
            grads[0] += 1.;
            Ok(0.)
        });
        let mut hierarchy = Hierarchy::create(HierarchySpec::new(5, 2, 1), trainer)?;

        // Only the root got a thread before the failure, `start` then cleans up.
        let shared = Arc::clone(&hierarchy.shared);
        shared.running.store(true, Ordering::SeqCst);
        let root = shared.node(ROOT).expect("root exists");
        let handle = shared.spawn_thread(&root)?;
        shared.threads.lock().push((ROOT, handle));
        shared.terminate_all();

        assert!(!hierarchy.is_running());
        assert!(hierarchy.stats().nodes.iter().all(|n| n.state.is_terminal()));

        hierarchy.start()?;
        hierarchy.distribute(0..8)?;
        assert!(hierarchy.wait_idle(Some(Duration::from_secs(10))));
        hierarchy.stop()?;

        let stats = hierarchy.stats();
        assert_eq!(stats.total_processed, 8);
        assert_eq!(stats.pending, 0);
        assert!(stats.nodes.iter().all(|n| n.state == NodeState::Terminated));
        Ok(())
    }
}
