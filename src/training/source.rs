use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

/// A stream of batches shared by every thread that feeds the hierarchy.
pub trait BatchSource: Send + Sync {
    type Batch: Send + 'static;

    /// Returns the next batch, `None` marks the end of the epoch.
    fn next(&self) -> Option<Self::Batch>;

    /// Rewinds the source to the beginning of an epoch.
    fn reset(&self);

    fn total_batches(&self) -> usize;
}

/// Serves clones of an in-memory list of batches.
#[derive(Debug)]
pub struct VecBatchSource<B> {
    batches: Vec<B>,
    cursor: Mutex<usize>,
}

impl<B> VecBatchSource<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self {
            batches,
            cursor: Mutex::new(0),
        }
    }
}

impl<B> BatchSource for VecBatchSource<B>
where
    B: Clone + Send + Sync + 'static,
{
    type Batch = B;

    fn next(&self) -> Option<B> {
        let mut cursor = self.cursor.lock();
        let batch = self.batches.get(*cursor)?.clone();
        *cursor += 1;
        Some(batch)
    }

    fn reset(&self) {
        *self.cursor.lock() = 0;
    }

    fn total_batches(&self) -> usize {
        self.batches.len()
    }
}

/// Serves the batch indices `0..total`, for trainers that own their dataset.
#[derive(Debug)]
pub struct IndexSource {
    total: usize,
    cursor: AtomicUsize,
}

impl IndexSource {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl BatchSource for IndexSource {
    type Batch = usize;

    fn next(&self) -> Option<usize> {
        self.cursor
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |i| {
                (i < self.total).then_some(i + 1)
            })
            .ok()
    }

    fn reset(&self) {
        self.cursor.store(0, Ordering::Release);
    }

    fn total_batches(&self) -> usize {
        self.total
    }
}
