mod buffer;
mod partition;
pub mod simd;

pub use buffer::{GradientBuffer, Segment, SegmentWriter};
pub use partition::even_segments;
