/// Applies a reduced gradient to the model's parameters.
pub trait Optimizer {
    /// Performs one update step.
    ///
    /// # Arguments
    /// * `grads` - The reduced gradient, as long as the model's parameter count.
    fn step(&mut self, grads: &[f32]);
}

impl<O: Optimizer + ?Sized> Optimizer for &mut O {
    fn step(&mut self, grads: &[f32]) {
        (**self).step(grads);
    }
}

impl<O: Optimizer + ?Sized> Optimizer for Box<O> {
    fn step(&mut self, grads: &[f32]) {
        (**self).step(grads);
    }
}
