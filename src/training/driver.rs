use std::{iter, time::Instant};

use log::info;
use serde::Serialize;

use super::{BatchSource, Optimizer, Trainer};
use crate::{
    error::{HierarchyErr, Result},
    gradient::simd,
    hierarchy::Hierarchy,
};

/// The outcome of one epoch.
#[derive(Debug, Clone, Serialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub batches: usize,
    /// Items whose gradient reached the optimizer.
    pub items: u64,
    pub skipped: u64,
    pub mean_loss: f64,
    /// Norm of the reduced gradient before clipping.
    pub grad_norm: f32,
    pub clipped: bool,
    pub elapsed_secs: f64,
}

/// Scales `grads` down so that its L2 norm doesn't exceed `max_norm`.
///
/// # Returns
/// Whether the gradient was scaled.
pub fn clip_norm(grads: &mut [f32], max_norm: f32) -> bool {
    let norm = simd::l2_norm(grads);
    if norm <= max_norm || norm == 0. {
        return false;
    }

    simd::scale(grads, max_norm / norm);
    true
}

/// Runs epochs through a hierarchy: feed, drain, reduce and step.
pub struct EpochDriver<S, O> {
    source: S,
    optimizer: O,
    max_norm: Option<f32>,
    epoch: usize,
    grads: Vec<f32>,
}

impl<S, O> EpochDriver<S, O>
where
    S: BatchSource,
    O: Optimizer,
{
    pub fn new(source: S, optimizer: O) -> Self {
        Self {
            source,
            optimizer,
            max_norm: None,
            epoch: 0,
            grads: Vec::new(),
        }
    }

    /// Clips every reduced gradient to `max_norm` before the optimizer step.
    pub fn with_clip_norm(mut self, max_norm: f32) -> Self {
        self.max_norm = Some(max_norm);
        self
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Runs one epoch.
    ///
    /// Drains the rewound source into the hierarchy, waits for every batch, reduces
    /// the gradient, clips it if configured and hands it to the optimizer.
    ///
    /// # Arguments
    /// * `hierarchy` - A running hierarchy whose trainer consumes this source's batches.
    ///
    /// # Returns
    /// The epoch's report, or `NotRunning` if the hierarchy's threads aren't started.
    pub fn run_epoch<T>(&mut self, hierarchy: &mut Hierarchy<T>) -> Result<EpochReport>
    where
        T: Trainer<Item = S::Batch>,
    {
        if !hierarchy.is_running() {
            return Err(HierarchyErr::NotRunning);
        }

        let start = Instant::now();
        let skipped_before = hierarchy.stats().total_skipped;

        self.source.reset();
        let batches: Vec<_> = iter::from_fn(|| self.source.next()).collect();
        let count = hierarchy.distribute(batches)?;
        hierarchy.wait_idle(None);
        hierarchy.reduce();

        let summary = hierarchy.last_reduction().clone();
        self.grads.resize(hierarchy.gradient().len(), 0.);
        hierarchy.gradient().copy_to(&mut self.grads)?;

        let clipped = self
            .max_norm
            .is_some_and(|max_norm| clip_norm(&mut self.grads, max_norm));
        self.optimizer.step(&self.grads);

        let report = EpochReport {
            epoch: self.epoch,
            batches: count,
            items: summary.items,
            skipped: hierarchy.stats().total_skipped - skipped_before,
            mean_loss: summary.mean_loss,
            grad_norm: summary.norm,
            clipped,
            elapsed_secs: start.elapsed().as_secs_f64(),
        };

        info!(
            epoch = report.epoch;
            "{} batches, {} skipped, mean loss {:.6}, grad norm {:.6}{} in {:.3}s",
            report.batches,
            report.skipped,
            report.mean_loss,
            report.grad_norm,
            if clipped { " (clipped)" } else { "" },
            report.elapsed_secs
        );

        self.epoch += 1;
        Ok(report)
    }
}
