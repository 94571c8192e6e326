use std::{
    collections::VecDeque,
    sync::atomic::{AtomicUsize, Ordering},
};

use parking_lot::Mutex;

/// A node's pending work.
///
/// The owner pops from the front while thieves take from the back, the cached
/// length lets other threads peek at the depth without taking the lock.
#[derive(Debug)]
pub struct WorkQueue<W> {
    items: Mutex<VecDeque<W>>,
    len: AtomicUsize,
}

impl<W> Default for WorkQueue<W> {
    fn default() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            len: AtomicUsize::new(0),
        }
    }
}

impl<W> WorkQueue<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push(&self, item: W) {
        let mut items = self.items.lock();
        items.push_back(item);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Puts an item back at the head of the queue.
    pub fn push_front(&self, item: W) {
        let mut items = self.items.lock();
        items.push_front(item);
        self.len.store(items.len(), Ordering::Release);
    }

    /// Appends every item of `iter` under a single lock.
    ///
    /// # Returns
    /// The amount of pushed items.
    pub fn push_many<I>(&self, iter: I) -> usize
    where
        I: IntoIterator<Item = W>,
    {
        let mut items = self.items.lock();
        let before = items.len();
        items.extend(iter);
        self.len.store(items.len(), Ordering::Release);
        items.len() - before
    }

    /// Takes the oldest item.
    pub fn pop(&self) -> Option<W> {
        let mut items = self.items.lock();
        let item = items.pop_front();
        self.len.store(items.len(), Ordering::Release);
        item
    }

    /// Takes up to `max` items from the tail, keeping their relative order.
    pub fn steal(&self, max: usize) -> Vec<W> {
        let mut items = self.items.lock();
        let take = max.min(items.len());
        let at = items.len() - take;
        let stolen = items.split_off(at).into();
        self.len.store(items.len(), Ordering::Release);
        stolen
    }

    /// Empties the queue.
    pub fn drain(&self) -> Vec<W> {
        let mut items = self.items.lock();
        let drained = items.drain(..).collect();
        self.len.store(0, Ordering::Release);
        drained
    }
}
