//! Bounded typed FIFO queues connecting pipeline stages.
//!
//! Many-producer/many-consumer with wake-up on push. A full queue never
//! stalls the producer: the oldest element is dropped to make room, since
//! source-side backpressure would stall every subscriber of a tag.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};

/// How many drops accumulate between warning log lines.
const DROP_LOG_INTERVAL: u64 = 256;

/// Bounded MPMC FIFO with drop-oldest overflow behavior.
pub struct PacketQueue<T> {
    label: String,
    tx: Sender<T>,
    rx: Receiver<T>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl<T> Clone for PacketQueue<T> {
    fn clone(&self) -> Self {
        Self {
            label: self.label.clone(),
            tx: self.tx.clone(),
            rx: self.rx.clone(),
            capacity: self.capacity,
            dropped: Arc::clone(&self.dropped),
        }
    }
}

impl<T> PacketQueue<T> {
    pub fn new(label: impl Into<String>, capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self {
            label: label.into(),
            tx,
            rx,
            capacity,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Push an element, evicting the oldest one when full.
    ///
    /// Returns false when an eviction happened.
    pub fn push(&self, item: T) -> bool {
        let mut item = item;
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return true,
                Err(TrySendError::Full(back)) => {
                    item = back;
                    if self.rx.try_recv().is_ok() {
                        let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                        if total % DROP_LOG_INTERVAL == 1 {
                            log::warn!(
                                "queue '{}' full, dropped oldest ({} total)",
                                self.label,
                                total
                            );
                        }
                    }
                    // Retry; another consumer may have raced the slot away.
                }
                Err(TrySendError::Disconnected(_)) => return false,
            }
        }
    }

    /// Pop, blocking up to `timeout`.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        self.rx.recv_timeout(timeout).ok()
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rx.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total elements evicted by overflowing pushes.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Fill level in percent.
    pub fn fill_percentage(&self) -> f32 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.len() as f32 * 100.0 / self.capacity as f32
    }

    pub fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = PacketQueue::new("t", 8);
        for i in 0..5 {
            assert!(q.push(i));
        }
        for i in 0..5 {
            assert_eq!(q.try_pop(), Some(i));
        }
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn overflow_drops_oldest() {
        let q = PacketQueue::new("t", 3);
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(!q.push(4));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.try_pop(), Some(2));
        assert_eq!(q.try_pop(), Some(3));
        assert_eq!(q.try_pop(), Some(4));
    }

    #[test]
    fn pop_timeout_wakes_on_push() {
        let q = PacketQueue::new("t", 4);
        let q2 = q.clone();
        let handle = std::thread::spawn(move || q2.pop_timeout(Duration::from_secs(2)));
        std::thread::sleep(Duration::from_millis(20));
        q.push(42);
        assert_eq!(handle.join().unwrap(), Some(42));
    }

    #[test]
    fn fill_percentage() {
        let q = PacketQueue::new("t", 4);
        q.push(1);
        q.push(2);
        assert!((q.fill_percentage() - 50.0).abs() < 1e-6);
    }
}
