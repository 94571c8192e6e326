//! A hierarchical scheduler for data parallel training.
//!
//! A `Hierarchy` is a tree of OS threads with up to 12 children per node. Control
//! nodes hand work items down the tree, worker nodes run a `Trainer` on them and keep
//! a private partial gradient. Idle nodes steal work from their siblings, control
//! nodes grow and shrink their set of children with queue pressure, and `reduce`
//! folds every partial into a single `GradientBuffer`.

pub mod config;
pub mod error;
pub mod gradient;
pub mod hierarchy;
pub mod node;
pub mod training;

pub use config::{Averaging, HierarchySpec, Tuning};
pub use error::{HierarchyErr, ProcessErr, Result};
pub use gradient::{GradientBuffer, Segment};
pub use hierarchy::{Hierarchy, HierarchyStats, ReductionSummary};
pub use node::{NodeId, NodeState, NodeStats, Role};
pub use training::{BatchSource, EpochDriver, EpochReport, FnTrainer, Optimizer, Trainer};
