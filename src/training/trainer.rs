use std::marker::PhantomData;

use crate::error::ProcessErr;

/// The forward and backward pass run by worker nodes.
///
/// A `Trainer` is shared by every node thread, it must not rely on which node calls
/// it nor on the order items arrive in.
pub trait Trainer: Send + Sync + 'static {
    /// One unit of work, usually a batch or a batch index.
    type Item: Send + 'static;

    /// Runs one work item.
    ///
    /// Implementations must add to `grads` rather than overwrite it. The buffer is
    /// zeroed before every call and discarded if the call fails.
    ///
    /// # Arguments
    /// * `item` - The work item.
    /// * `grads` - Gradient accumulator, as long as the model's parameter count.
    ///
    /// # Returns
    /// The item's loss, or a `ProcessErr` that makes the node skip the item.
    fn process(&self, item: &Self::Item, grads: &mut [f32]) -> Result<f32, ProcessErr>;
}

/// Adapts a closure into a `Trainer`.
pub struct FnTrainer<F, I> {
    f: F,
    _item: PhantomData<fn(&I)>,
}

impl<F, I> FnTrainer<F, I>
where
    F: Fn(&I, &mut [f32]) -> Result<f32, ProcessErr> + Send + Sync + 'static,
    I: Send + 'static,
{
    pub fn new(f: F) -> Self {
        Self {
            f,
            _item: PhantomData,
        }
    }
}

impl<F, I> Trainer for FnTrainer<F, I>
where
    F: Fn(&I, &mut [f32]) -> Result<f32, ProcessErr> + Send + Sync + 'static,
    I: Send + 'static,
{
    type Item = I;

    fn process(&self, item: &I, grads: &mut [f32]) -> Result<f32, ProcessErr> {
        (self.f)(item, grads)
    }
}
