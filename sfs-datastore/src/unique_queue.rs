//! FIFO that silently drops re-insertions of elements already queued.
//! Used for the asynchronous chunk re-test queue, where a burst of failed
//! client reads must not test the same chunk more than once.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use parking_lot::Mutex;

pub struct UniqueQueue<T> {
    inner: Mutex<Inner<T>>,
}

struct Inner<T> {
    queue: VecDeque<T>,
    members: HashSet<T>,
}

impl<T: Eq + Hash + Clone> UniqueQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                members: HashSet::new(),
            }),
        }
    }

    pub fn put(&self, value: T) {
        let mut inner = self.inner.lock();
        if inner.members.insert(value.clone()) {
            inner.queue.push_back(value);
        }
    }

    pub fn get(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let value = inner.queue.pop_front()?;
        inner.members.remove(&value);
        Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl<T: Eq + Hash + Clone> Default for UniqueQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn deduplicates_pending_entries() {
        let queue = UniqueQueue::new();
        queue.put(1);
        queue.put(2);
        queue.put(1);
        assert_eq!(queue.get(), Some(1));
        assert_eq!(queue.get(), Some(2));
        assert_eq!(queue.get(), None);

        // Once drained the value may be queued again.
        queue.put(1);
        assert_eq!(queue.get(), Some(1));
    }
}
