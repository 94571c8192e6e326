use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// The lifecycle of a node's thread.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    Ready = 0,
    Idle = 1,
    Controlling = 2,
    Processing = 3,
    Waiting = 4,
    Accumulating = 5,
    Terminating = 6,
    Terminated = 7,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Ready,
            1 => Self::Idle,
            2 => Self::Controlling,
            3 => Self::Processing,
            4 => Self::Waiting,
            5 => Self::Accumulating,
            6 => Self::Terminating,
            _ => Self::Terminated,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Ready => "ready",
            Self::Idle => "idle",
            Self::Controlling => "controlling",
            Self::Processing => "processing",
            Self::Waiting => "waiting",
            Self::Accumulating => "accumulating",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        }
    }

    /// Returns whether the thread is leaving or has left its loop.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Terminating | Self::Terminated)
    }

    /// Returns whether `self -> to` is an edge of the state machine.
    pub fn allows(self, to: NodeState) -> bool {
        use NodeState::*;

        match (self, to) {
            (Terminated, _) => false,
            (Terminating, Terminated) => true,
            (Terminating, _) => false,
            (_, Terminating) => true,
            (_, Waiting | Accumulating) => true,
            (Waiting | Accumulating, Ready) => true,
            (Ready, Controlling | Processing | Idle) => true,
            (Controlling | Processing | Idle, Ready) => true,
            _ => false,
        }
    }
}

/// An atomically updated `NodeState`.
///
/// The owning thread only moves the state with compare-and-swap, so an external
/// `Terminating` request can never be overwritten by a late transition.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: NodeState) -> Self {
        Self(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> NodeState {
        NodeState::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves the state from `from` to `to`.
    ///
    /// # Returns
    /// Whether the transition happened, `false` if the current state isn't `from`
    /// or the edge doesn't exist.
    pub fn transition(&self, from: NodeState, to: NodeState) -> bool {
        if !from.allows(to) {
            debug_assert!(false, "illegal transition {} -> {}", from.name(), to.name());
            return false;
        }

        self.0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Requests termination from any non terminal state.
    ///
    /// # Returns
    /// Whether this call performed the request.
    pub fn request_termination(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                let current = NodeState::from_u8(current);
                (!current.is_terminal()).then_some(NodeState::Terminating as u8)
            })
            .is_ok()
    }

    /// Marks the thread as gone, only called by the thread itself on exit.
    pub fn mark_terminated(&self) {
        self.0.store(NodeState::Terminated as u8, Ordering::Release);
    }

    /// Rearms a stopped node so that its thread can be started again.
    ///
    /// A node asked to terminate before its thread ever ran stays in `Terminating`,
    /// it is rearmed as well. The caller makes sure no thread drives the node.
    pub fn rearm(&self) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                NodeState::from_u8(current)
                    .is_terminal()
                    .then_some(NodeState::Ready as u8)
            })
            .is_ok()
    }
}
