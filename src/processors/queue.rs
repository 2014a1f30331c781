use std::collections::VecDeque;

use parking_lot::Mutex;

/// A FIFO buffer a processor drains into its subscribers.
pub trait Queue<T>: Send + Sync {
    /// Append `value`, or hand it back if the queue is full.
    fn offer(&self, value: T) -> Result<(), T>;

    /// Remove the oldest value.
    fn poll(&self) -> Option<T>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of values held, `None` if unbounded.
    fn capacity(&self) -> Option<usize>;

    /// Remove and drop every value.
    fn clear(&self);
}

/// Queue without a size limit. The default for [`super::UnicastProcessor`].
#[derive(Debug)]
pub struct UnboundedQueue<T> {
    items: Mutex<VecDeque<T>>,
}

impl<T> UnboundedQueue<T> {
    pub fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
        }
    }
}

impl<T> Default for UnboundedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> Queue<T> for UnboundedQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        self.items.lock().push_back(value);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        None
    }

    fn clear(&self) {
        let drained = std::mem::take(&mut *self.items.lock());
        drop(drained);
    }
}

/// Queue that rejects values beyond a fixed capacity.
#[derive(Debug)]
pub struct BoundedQueue<T> {
    items: Mutex<VecDeque<T>>,
    capacity: usize,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }
}

impl<T: Send> Queue<T> for BoundedQueue<T> {
    fn offer(&self, value: T) -> Result<(), T> {
        let mut items = self.items.lock();
        if items.len() >= self.capacity {
            return Err(value);
        }
        items.push_back(value);
        Ok(())
    }

    fn poll(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    fn len(&self) -> usize {
        self.items.lock().len()
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.capacity)
    }

    fn clear(&self) {
        let drained = std::mem::take(&mut *self.items.lock());
        drop(drained);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounded_rejects_when_full() {
        let queue = BoundedQueue::new(2);
        assert!(queue.offer(1).is_ok());
        assert!(queue.offer(2).is_ok());
        assert_eq!(queue.offer(3), Err(3));
        assert_eq!(queue.poll(), Some(1));
        assert!(queue.offer(3).is_ok());
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unbounded_keeps_order() {
        let queue = UnboundedQueue::new();
        for i in 0..100 {
            assert!(queue.offer(i).is_ok());
        }
        assert_eq!(queue.capacity(), None);
        assert_eq!((0..100).map(|_| queue.poll().unwrap()).sum::<i32>(), 4950);
    }
}
