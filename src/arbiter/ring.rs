//! Bounded rings and fixed-size record pools for inter-core traffic.
//!
//! Every arbiter core boundary is one of these rings; elements are owned
//! records, a full ring is an ordinary `Err`, and nothing ever blocks.

use crossbeam::queue::ArrayQueue;

pub struct Ring<T> {
    inner: ArrayQueue<T>,
}

impl<T> Ring<T> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity.is_power_of_two(), "ring capacity must be a power of two");

        Self {
            inner: ArrayQueue::new(capacity),
        }
    }

    /// Hands the element back on a full ring.
    pub fn enqueue(&self, value: T) -> Result<(), T> {
        self.inner.push(value)
    }

    pub fn dequeue(&self) -> Option<T> {
        self.inner.pop()
    }

    /// Pops up to `max` elements into `out`; returns how many.
    pub fn dequeue_burst(&self, out: &mut Vec<T>, max: usize) -> usize {
        let mut n = 0;
        while n < max {
            match self.inner.pop() {
                Some(value) => {
                    out.push(value);
                    n += 1;
                }
                None => break,
            }
        }
        n
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }
}

/// A fixed-size pool of boxed records: a ring used as a free list.
/// Exhaustion is counted by the caller, never waited on.
pub struct Pool<T> {
    free: ArrayQueue<Box<T>>,
}

impl<T: Default> Pool<T> {
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two(), "pool size must be a power of two");

        let free = ArrayQueue::new(size);
        for _ in 0..size {
            free.push(Box::default()).ok().expect("pool seeding overflow");
        }

        Self { free }
    }

    pub fn get(&self) -> Option<Box<T>> {
        self.free.pop()
    }

    pub fn put(&self, record: Box<T>) {
        // Dropping an over-returned record is harmless; the pool can only
        // have been seeded with `size` of them.
        let _ = self.free.push(record);
    }

    pub fn available(&self) -> usize {
        self.free.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ring_full_is_an_error() {
        let ring: Ring<u32> = Ring::new(4);

        for i in 0..4 {
            assert_eq!(ring.enqueue(i), Ok(()));
        }
        assert_eq!(ring.enqueue(99), Err(99));

        assert_eq!(ring.dequeue(), Some(0));
        assert_eq!(ring.enqueue(99), Ok(()));
    }

    #[test]
    fn burst_dequeue() {
        let ring: Ring<u32> = Ring::new(8);
        for i in 0..5 {
            ring.enqueue(i).unwrap();
        }

        let mut out = Vec::new();
        assert_eq!(ring.dequeue_burst(&mut out, 3), 3);
        assert_eq!(out, vec![0, 1, 2]);
        assert_eq!(ring.dequeue_burst(&mut out, 10), 2);
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn pool_exhaustion_and_reuse() {
        let pool: Pool<Vec<u8>> = Pool::new(2);

        let a = pool.get().unwrap();
        let b = pool.get().unwrap();
        assert!(pool.get().is_none());

        pool.put(a);
        assert_eq!(pool.available(), 1);
        drop(b);
        assert!(pool.get().is_some());
    }
}
