//! The collaborators a hierarchy trains with, and a driver running whole epochs.

mod driver;
mod optimizer;
mod source;
mod trainer;

pub use driver::{EpochDriver, EpochReport, clip_norm};
pub use optimizer::Optimizer;
pub use source::{BatchSource, IndexSource, VecBatchSource};
pub use trainer::{FnTrainer, Trainer};
