//! Bounded single-producer / single-consumer byte FIFO.
//!
//! The producer is the network stack's callback context, which must never
//! block, so the queue is lock free: slots are atomics and the two cursors are
//! only ever advanced by their owning side.

use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};

/// Lock free bounded byte queue
#[derive(Debug)]
pub struct ByteQueue {
    slots: Box<[AtomicU8]>,
    /// Read cursor, only advanced by the consumer
    head: AtomicUsize,
    /// Write cursor, only advanced by the producer
    tail: AtomicUsize,
}

impl ByteQueue {
    /// Creates a queue able to hold `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        // One slot stays empty to tell a full ring from an empty one
        let slots = (0..capacity + 1).map(|_| AtomicU8::new(0)).collect();
        Self {
            slots,
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
        }
    }

    /// Maximum number of bytes the queue can hold
    pub fn capacity(&self) -> usize {
        self.slots.len() - 1
    }

    /// Number of bytes currently queued
    pub fn len(&self) -> usize {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        (tail + self.slots.len() - head) % self.slots.len()
    }

    /// True if no bytes are queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Producer side. Pushes all of `data`, or nothing if it does not fit.
    pub fn push_all(&self, data: &[u8]) -> bool {
        let size = self.slots.len();
        let tail = self.tail.load(Ordering::Relaxed);
        let head = self.head.load(Ordering::Acquire);
        let free = (head + size - tail - 1) % size;
        if data.len() > free {
            return false;
        }
        let mut pos = tail;
        for b in data {
            self.slots[pos].store(*b, Ordering::Relaxed);
            pos = (pos + 1) % size;
        }
        self.tail.store(pos, Ordering::Release);
        true
    }

    /// Consumer side. Pops up to `out.len()` bytes, returning how many were copied
    pub fn pop_into(&self, out: &mut [u8]) -> usize {
        let size = self.slots.len();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        let available = (tail + size - head) % size;
        let count = std::cmp::min(available, out.len());
        let mut pos = head;
        for b in out.iter_mut().take(count) {
            *b = self.slots[pos].load(Ordering::Relaxed);
            pos = (pos + 1) % size;
        }
        self.head.store(pos, Ordering::Release);
        count
    }

    /// Consumer side. Discards everything queued so far
    pub fn clear(&self) -> usize {
        let size = self.slots.len();
        let head = self.head.load(Ordering::Relaxed);
        let tail = self.tail.load(Ordering::Acquire);
        self.head.store(tail, Ordering::Release);
        (tail + size - head) % size
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_fifo_order_and_wrap() {
        let q = ByteQueue::new(8);
        assert_eq!(q.capacity(), 8);
        assert!(q.push_all(&[1, 2, 3, 4, 5, 6]));
        let mut out = [0u8; 4];
        assert_eq!(q.pop_into(&mut out), 4);
        assert_eq!(out, [1, 2, 3, 4]);
        // Wraps around the end of the ring
        assert!(q.push_all(&[7, 8, 9, 10, 11, 12]));
        assert_eq!(q.len(), 8);
        let mut out = [0u8; 10];
        assert_eq!(q.pop_into(&mut out), 8);
        assert_eq!(&out[..8], &[5, 6, 7, 8, 9, 10, 11, 12]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_push_is_all_or_nothing() {
        let q = ByteQueue::new(4);
        assert!(q.push_all(&[1, 2, 3]));
        assert!(!q.push_all(&[4, 5]));
        assert_eq!(q.len(), 3);
        assert!(q.push_all(&[4]));
        assert!(!q.push_all(&[5]));
        assert_eq!(q.clear(), 4);
        assert!(q.is_empty());
        assert!(q.push_all(&[9, 9, 9, 9]));
    }

    #[test]
    fn test_cross_thread() {
        let q = Arc::new(ByteQueue::new(16));
        let producer = q.clone();
        let handle = std::thread::spawn(move || {
            let mut next = 0u8;
            while next < 200 {
                if producer.push_all(&[next]) {
                    next += 1;
                } else {
                    std::thread::yield_now();
                }
            }
        });
        let mut expected = 0u8;
        let mut out = [0u8; 5];
        while expected < 200 {
            let n = q.pop_into(&mut out);
            for b in &out[..n] {
                assert_eq!(*b, expected);
                expected += 1;
            }
        }
        handle.join().unwrap();
    }
}
