use std::{ops::Range, sync::atomic::Ordering};

use atomic_float::AtomicF32;
use rayon::prelude::*;
use serde::Serialize;

use super::simd;
use crate::error::{HierarchyErr, Result};

/// A contiguous `[offset, offset + len)` slice of the global gradient buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Segment {
    offset: usize,
    len: usize,
}

impl Segment {
    /// Creates a new `Segment`.
    pub fn new(offset: usize, len: usize) -> Self {
        Self { offset, len }
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The first index past this segment.
    pub fn end(&self) -> usize {
        self.offset + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn contains(&self, idx: usize) -> bool {
        self.range().contains(&idx)
    }

    /// Returns whether both segments share at least one index.
    pub fn overlaps(&self, other: &Segment) -> bool {
        self.offset < other.end() && other.offset < self.end()
    }
}

/// The flat, shared gradient buffer every worker segment is carved from.
///
/// Cells are `AtomicF32` so that the owner of a segment can write its slice with
/// plain relaxed stores while writes that spill past a segment boundary use atomic adds.
#[derive(Debug)]
pub struct GradientBuffer {
    cells: Box<[AtomicF32]>,
}

impl GradientBuffer {
    /// Creates a new zeroed `GradientBuffer`.
    ///
    /// # Arguments
    /// * `len` - The amount of model parameters.
    pub fn new(len: usize) -> Self {
        Self {
            cells: (0..len).map(|_| AtomicF32::new(0.)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Returns the value at `idx`, if any.
    pub fn get(&self, idx: usize) -> Option<f32> {
        self.cells.get(idx).map(|c| c.load(Ordering::Relaxed))
    }

    /// Returns a writer for `segment`.
    ///
    /// Values inside the segment are written with plain stores, the caller must not
    /// hold two writers over overlapping segments at the same time. Values past the
    /// segment's end are added atomically.
    ///
    /// # Panics
    /// If `segment` doesn't fit in the buffer.
    pub(crate) fn writer(&self, segment: Segment) -> SegmentWriter<'_> {
        assert!(
            segment.end() <= self.len(),
            "segment [{}, {}) exceeds gradient buffer of {}",
            segment.offset(),
            segment.end(),
            self.len()
        );

        SegmentWriter {
            cells: &self.cells,
            segment,
        }
    }

    /// Sets every cell to zero.
    pub fn clear(&self) {
        self.cells
            .par_iter()
            .for_each(|c| c.store(0., Ordering::Relaxed));
    }

    /// Copies the buffer into `out`.
    ///
    /// # Returns
    /// A `GradientSize` error if `out` isn't the same size as this buffer.
    pub fn copy_to(&self, out: &mut [f32]) -> Result<()> {
        if out.len() != self.len() {
            return Err(HierarchyErr::GradientSize {
                got: out.len(),
                expected: self.len(),
            });
        }

        out.par_iter_mut()
            .zip(self.cells.par_iter())
            .for_each(|(o, c)| *o = c.load(Ordering::Relaxed));

        Ok(())
    }

    /// Returns a copy of the buffer.
    pub fn to_vec(&self) -> Vec<f32> {
        self.cells.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Computes the L2 norm of the buffer.
    pub fn l2_norm(&self) -> f32 {
        simd::l2_norm(&self.to_vec())
    }
}

/// Write access to one segment of a `GradientBuffer`.
///
/// The owner may write ranges starting inside its segment. The part of a range that
/// runs past the segment end is added atomically, a range starting outside of it is
/// an invariant violation.
#[derive(Debug)]
pub struct SegmentWriter<'a> {
    cells: &'a [AtomicF32],
    segment: Segment,
}

impl SegmentWriter<'_> {
    pub fn segment(&self) -> Segment {
        self.segment
    }

    /// Adds `values` to the buffer starting at `offset`.
    ///
    /// # Arguments
    /// * `offset` - Global index of the first value, must lie inside this segment.
    /// * `values` - The values to add.
    ///
    /// # Returns
    /// The amount of values that straddled the segment boundary.
    ///
    /// # Panics
    /// On a segment overrun, silently corrupting another node's gradient is worse.
    pub fn accumulate(&self, offset: usize, values: &[f32]) -> usize {
        if values.is_empty() {
            return 0;
        }

        let end = offset + values.len();
        assert!(
            self.segment.contains(offset) && end <= self.cells.len(),
            "segment overrun: write [{offset}, {end}) from segment [{}, {})",
            self.segment.offset(),
            self.segment.end()
        );

        let owned = end.min(self.segment.end()) - offset;
        let (inside, outside) = values.split_at(owned);

        self.cells[offset..offset + owned]
            .iter()
            .zip(inside)
            .for_each(|(c, v)| c.store(c.load(Ordering::Relaxed) + v, Ordering::Relaxed));

        self.cells[offset + owned..end]
            .iter()
            .zip(outside)
            .for_each(|(c, v)| simd::atomic_add(c, *v));

        outside.len()
    }
}
