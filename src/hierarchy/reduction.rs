use log::{info, warn};
use rayon::prelude::*;
use serde::Serialize;

use super::topology::Arena;
use crate::{
    config::Averaging,
    gradient::{GradientBuffer, Segment, simd},
    node::NodeState,
};

/// Width of the blocks the root sum is written out in.
const BLOCK: usize = 64;

/// What went into the last reduced gradient.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReductionSummary {
    /// Nodes whose partial gradient made it into the sum, retired ones included.
    pub contributors: usize,
    /// Items whose gradient made it into the sum.
    pub items: u64,
    /// Partials dropped for holding non-finite values.
    pub dropped: usize,
    pub mean_loss: f64,
    /// Values written through the atomic boundary path.
    pub straddled: usize,
    pub norm: f32,
}

/// Reduces every partial gradient of `arena` into `gradient`.
///
/// Partials are validated, merged bottom-up level by level, then the root's sum is
/// written out segment by segment in parallel and normalized according to
/// `averaging`. Every partial and epoch counter is reset afterwards.
///
/// The caller must hold the arena lock and make sure no work is in flight.
pub(super) fn reduce<W: Send>(
    arena: &Arena<W>,
    gradient: &GradientBuffer,
    averaging: Averaging,
) -> ReductionSummary {
    let mut summary = ReductionSummary::default();
    let mut total_items = 0;
    let mut loss = 0.;

    for node in arena.nodes() {
        let share = node.counters().epoch_share();
        total_items += share.items;
        loss += share.loss;

        let mut partial = node.partial();
        if simd::all_finite(&partial) {
            summary.contributors += share.contributors;
            summary.items += share.items;
        } else {
            warn!(
                node = node.id();
                "dropping non-finite partial gradient of {} items",
                share.items
            );
            simd::zero(&mut partial);
            summary.dropped += 1;
        }
    }

    for level in arena.by_level().iter().rev() {
        level.par_iter().for_each(|node| {
            let children = node.children();
            if children.is_empty() {
                return;
            }

            let parked = node.transition(NodeState::Idle, NodeState::Accumulating);

            {
                let mut sum = node.partial();
                for child in children.iter().filter_map(|&id| arena.get(id)) {
                    simd::accumulate(&mut sum, &child.partial());
                }
            }

            if parked {
                node.transition(NodeState::Accumulating, NodeState::Ready);
                node.notify();
            }
        });
    }

    let factor = match averaging {
        Averaging::Workers if summary.contributors > 0 => 1. / summary.contributors as f32,
        Averaging::Items if summary.items > 0 => 1. / summary.items as f32,
        _ => 1.,
    };

    gradient.clear();

    if let Some(root) = arena.root() {
        let sum = root.partial();
        let values: &[f32] = &sum;

        summary.straddled = arena
            .worker_segments(gradient.len())
            .par_iter()
            .map(|(_, segment)| write_segment(gradient, *segment, values, factor))
            .sum();
    }

    let nodes: Vec<_> = arena.nodes().collect();
    nodes.par_iter().for_each(|node| {
        simd::zero(&mut node.partial());
        node.counters().reset_epoch();
    });

    if total_items > 0 {
        summary.mean_loss = loss / total_items as f64;
    }
    summary.norm = gradient.l2_norm();

    info!(
        "reduced {} items from {} contributors, norm {:.6}",
        summary.items, summary.contributors, summary.norm
    );

    summary
}

/// Writes the slice of `sum` owned by `segment` into `gradient`, scaled by `factor`.
///
/// Blocks are aligned to `BLOCK`, a segment writes every block that starts inside it,
/// so the tail of its last block may spill into the next segment.
///
/// # Returns
/// The amount of values that spilled.
fn write_segment(gradient: &GradientBuffer, segment: Segment, sum: &[f32], factor: f32) -> usize {
    if segment.is_empty() {
        return 0;
    }

    let writer = gradient.writer(segment);
    let first = segment.offset().div_ceil(BLOCK) * BLOCK;
    let mut block = [0.; BLOCK];
    let mut spilled = 0;

    for start in (first..segment.end()).step_by(BLOCK) {
        let end = (start + BLOCK).min(sum.len());
        let values = &mut block[..end - start];

        values.copy_from_slice(&sum[start..end]);
        simd::scale(values, factor);
        spilled += writer.accumulate(start, values);
    }

    spilled
}
