use std::{error::Error, fmt, io};

use crate::node::NodeId;

/// The hierarchy module's result type.
pub type Result<T> = std::result::Result<T, HierarchyErr>;

/// Failures surfaced synchronously by the scheduler's public API.
#[derive(Debug)]
pub enum HierarchyErr {
    /// The requested thread budget or depth can't produce a valid tree.
    InvalidTopology { threads: usize, max_depth: usize },
    /// A node's partial gradient buffer couldn't be reserved.
    Allocation { bytes: usize },
    /// The OS refused to start a node's thread.
    ThreadSpawn { node: NodeId, source: io::Error },
    /// `start` was called on a hierarchy whose threads are already running.
    AlreadyRunning,
    /// The operation requires running threads.
    NotRunning,
    /// An external buffer doesn't match the model's gradient size.
    GradientSize { got: usize, expected: usize },
    /// No live node has this id.
    UnknownNode(NodeId),
}

impl fmt::Display for HierarchyErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HierarchyErr::InvalidTopology { threads, max_depth } => write!(
                f,
                "invalid topology: threads={threads} max_depth={max_depth} \
                 (need threads >= 1, 1 <= max_depth <= 4)"
            ),
            HierarchyErr::Allocation { bytes } => {
                write!(f, "failed to allocate {bytes} bytes for a gradient partial")
            }
            HierarchyErr::ThreadSpawn { node, source } => {
                write!(f, "failed to spawn thread for node {node}: {source}")
            }
            HierarchyErr::AlreadyRunning => f.write_str("hierarchy threads are already running"),
            HierarchyErr::NotRunning => f.write_str("hierarchy threads are not running"),
            HierarchyErr::GradientSize { got, expected } => {
                write!(f, "gradient size mismatch: got {got}, expected {expected}")
            }
            HierarchyErr::UnknownNode(id) => write!(f, "no live node with id {id}"),
        }
    }
}

impl Error for HierarchyErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            HierarchyErr::ThreadSpawn { source, .. } => Some(source),
            _ => None,
        }
    }
}

/// Boundary conversion for binaries / I/O APIs.
impl From<HierarchyErr> for io::Error {
    fn from(value: HierarchyErr) -> Self {
        match value {
            HierarchyErr::ThreadSpawn { source, .. } => source,
            other => io::Error::other(other),
        }
    }
}

/// Error returned by a `Trainer` for a single work item.
///
/// The scheduler never propagates it, the offending item is logged and skipped.
#[derive(Debug)]
pub struct ProcessErr(Box<dyn Error + Send + Sync>);

impl ProcessErr {
    /// Creates a new `ProcessErr` from any error or message.
    ///
    /// # Arguments
    /// * `err` - The underlying cause.
    pub fn new<E>(err: E) -> Self
    where
        E: Into<Box<dyn Error + Send + Sync>>,
    {
        Self(err.into())
    }
}

impl fmt::Display for ProcessErr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "work item failed: {}", self.0)
    }
}

impl Error for ProcessErr {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        Some(self.0.as_ref())
    }
}
