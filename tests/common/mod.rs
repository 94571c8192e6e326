#![allow(dead_code)]

use std::{
    sync::atomic::{AtomicUsize, Ordering},
    thread,
    time::{Duration, Instant},
};

use rand::{Rng, SeedableRng, rngs::StdRng};
use sphere_hierarchy::{ProcessErr, Trainer};

/// Does nothing with its items.
pub struct Noop;

impl Trainer for Noop {
    type Item = usize;

    fn process(&self, _: &usize, _: &mut [f32]) -> Result<f32, ProcessErr> {
        Ok(0.)
    }
}

/// Counts how often every item is processed and adds 1 to every gradient entry.
pub struct Counting {
    seen: Vec<AtomicUsize>,
    delay: Duration,
}

impl Counting {
    pub fn new(items: usize) -> Self {
        Self::slow(items, Duration::ZERO)
    }

    pub fn slow(items: usize, delay: Duration) -> Self {
        Self {
            seen: (0..items).map(|_| AtomicUsize::new(0)).collect(),
            delay,
        }
    }

    pub fn calls(&self) -> usize {
        self.seen.iter().map(|s| s.load(Ordering::SeqCst)).sum()
    }

    /// Asserts that every item was processed exactly once.
    pub fn assert_exactly_once(&self) {
        for (item, seen) in self.seen.iter().enumerate() {
            let seen = seen.load(Ordering::SeqCst);
            assert_eq!(seen, 1, "item {item} processed {seen} times");
        }
    }
}

impl Trainer for Counting {
    type Item = usize;

    fn process(&self, item: &usize, grads: &mut [f32]) -> Result<f32, ProcessErr> {
        if !self.delay.is_zero() {
            thread::sleep(self.delay);
        }

        self.seen[*item].fetch_add(1, Ordering::SeqCst);
        grads.iter_mut().for_each(|g| *g += 1.);
        Ok(1.)
    }
}

/// Produces a pseudo random gradient seeded by the item.
pub struct Seeded;

pub fn seeded_gradient(item: u64, grads: &mut [f32]) {
    let mut rng = StdRng::seed_from_u64(item);
    grads.iter_mut().for_each(|g| *g += rng.random_range(-1.0..1.0));
}

impl Trainer for Seeded {
    type Item = u64;

    fn process(&self, item: &u64, grads: &mut [f32]) -> Result<f32, ProcessErr> {
        seeded_gradient(*item, grads);
        Ok(*item as f32)
    }
}

/// Sums the gradients of `items` on the calling thread.
pub fn reference_sum(items: impl IntoIterator<Item = u64>, size: usize) -> Vec<f32> {
    let mut sum = vec![0.; size];
    for item in items {
        seeded_gradient(item, &mut sum);
    }
    sum
}

/// Asserts `got` and `expected` match within a 1e-4 relative tolerance.
pub fn assert_close(got: &[f32], expected: &[f32]) {
    assert_eq!(got.len(), expected.len());

    for (i, (g, e)) in got.iter().zip(expected).enumerate() {
        let tolerance = 1e-4 * e.abs().max(1.);
        assert!((g - e).abs() <= tolerance, "mismatch at {i}: got {g}, expected {e}");
    }
}

/// Polls `condition` until it holds or `timeout` runs out.
pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;

    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }

    condition()
}
