use std::{
    panic::{self, AssertUnwindSafe},
    sync::Arc,
    time::Instant,
};

use log::{debug, warn};

use super::{Shared, distribution, resize};
use crate::{
    gradient::simd,
    node::{Node, NodeState},
    training::Trainer,
};

/// The body of a node's thread, runs the state machine until termination.
pub(super) fn run<T: Trainer>(shared: Arc<Shared<T>>, node: Arc<Node<T::Item>>) {
    debug!(node = node.id(), level = node.level(); "node thread started");

    let mut scratch = vec![0.; shared.gradient_size()];
    let mut dispatches = 0;

    loop {
        match node.state() {
            NodeState::Ready => ready(&shared, &node),
            NodeState::Processing => process(&shared, &node, &mut scratch),
            NodeState::Controlling => control(&shared, &node, &mut dispatches),
            NodeState::Idle => idle(&shared, &node),
            NodeState::Waiting => {
                node.transition(NodeState::Waiting, NodeState::Ready);
            }
            NodeState::Accumulating => node.wait_parked(shared.tuning().idle_timeout()),
            NodeState::Terminating | NodeState::Terminated => break,
        }
    }

    if let Some(barrier) = node.take_ticket() {
        barrier.wait();
    }

    node.mark_terminated();
    node.set_live(false);

    if node.take_retired() {
        resize::hand_back(&shared, &node);
    }

    debug!(node = node.id(); "node thread terminated");
}

fn ready<T: Trainer>(shared: &Shared<T>, node: &Node<T::Item>) {
    if let Some(barrier) = node.take_ticket() {
        let waiting = node.transition(NodeState::Ready, NodeState::Waiting);
        debug!(node = node.id(); "waiting at barrier");
        barrier.wait();

        if waiting {
            node.transition(NodeState::Waiting, NodeState::Ready);
        }
        return;
    }

    if !node.queue().is_empty() {
        node.counters().reset_idle_cycles();

        let next = if node.child_count() > 0 {
            NodeState::Controlling
        } else {
            NodeState::Processing
        };

        node.transition(NodeState::Ready, next);
        return;
    }

    if shared.tuning().work_stealing && distribution::steal(shared, node) > 0 {
        node.counters().reset_idle_cycles();
        return;
    }

    node.transition(NodeState::Ready, NodeState::Idle);
}

fn process<T: Trainer>(shared: &Shared<T>, node: &Node<T::Item>, scratch: &mut [f32]) {
    let Some(item) = node.queue().pop() else {
        node.transition(NodeState::Processing, NodeState::Ready);
        return;
    };

    simd::zero(scratch);
    let start = Instant::now();
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| shared.trainer.process(&item, scratch)));
    let elapsed = start.elapsed();

    match outcome {
        Ok(Ok(loss)) => {
            node.accumulate(scratch);
            node.counters().record_processed(loss, elapsed);
        }
        Ok(Err(e)) => {
            warn!(node = node.id(); "skipping work item: {e}");
            node.counters().record_skipped(elapsed);
        }
        Err(_) => {
            warn!(node = node.id(); "skipping work item: trainer panicked");
            node.counters().record_skipped(elapsed);
        }
    }

    drop(item);
    shared.complete(1);
    node.transition(NodeState::Processing, NodeState::Ready);
}

fn control<T: Trainer>(shared: &Arc<Shared<T>>, node: &Node<T::Item>, dispatches: &mut usize) {
    let Some(item) = node.queue().pop() else {
        node.transition(NodeState::Controlling, NodeState::Ready);
        return;
    };

    if distribution::dispatch(shared, node, item) {
        *dispatches += 1;

        let tuning = shared.tuning();
        if tuning.dynamic_resize && *dispatches % tuning.resize_check_interval.max(1) == 0 {
            resize::maybe_grow(shared, node);
        }
    }

    node.transition(NodeState::Controlling, NodeState::Ready);
}

fn idle<T: Trainer>(shared: &Shared<T>, node: &Node<T::Item>) {
    let tuning = shared.tuning();
    let start = Instant::now();
    let timed_out = node.wait_for_work(tuning.idle_timeout());
    node.counters().add_idle(start.elapsed());

    if node.state() != NodeState::Idle {
        return;
    }

    if timed_out {
        node.counters().idle_cycle();

        if tuning.dynamic_resize && node.child_count() > 0 {
            resize::maybe_shrink(shared, node);
        }
    }

    // Back to ready so that stealing and barrier tickets are looked at again.
    node.transition(NodeState::Idle, NodeState::Ready);
}
