//! Bounded packet rings with blocking hand-off.
//!
//! A ring moves `PktBuf` ownership between threads: multiple producers
//! enqueue under the ring lock, a single consumer (by convention; the
//! structure does not enforce it) drains in strict FIFO order. A
//! consumer that finds the ring empty parks itself on the ring's wait
//! channel and is woken by the next producer; wakeups may be spurious,
//! so emptiness is re-checked in a loop after every wake.
//!
//! Capacity is fixed at construction (rounded up to a power of two).
//! Enqueue on a full ring hands the buffer back to the caller, which
//! decides between drop-and-count and block-and-retry.

use std::sync::Arc;

use crate::pkt::PktBuf;
use crate::sleep::{SleepQueue, WaitChannel};
use crate::sync::{LockFlags, Mutex};

// ============================================================================
// Errors
// ============================================================================

/// Enqueue failure; the buffer is handed back to the caller.
#[derive(Debug)]
pub enum RingError {
    /// Capacity exhausted.
    Full(PktBuf),
    /// Ring closed; no further traffic will be accepted.
    Closed(PktBuf),
}

// ============================================================================
// Ring
// ============================================================================

struct RingInner {
    slots: Box<[Option<PktBuf>]>,
    mask: u64,
    /// Sequence number of the next enqueue.
    prod: u64,
    /// Sequence number of the next dequeue. Never passes `prod`.
    cons: u64,
    /// Consumer is parked on the ring's wait channel.
    sleeper: bool,
    closed: bool,
}

impl RingInner {
    #[inline]
    fn len(&self) -> u64 {
        self.prod - self.cons
    }

    fn take(&mut self) -> Option<PktBuf> {
        if self.cons == self.prod {
            return None;
        }
        let idx = (self.cons & self.mask) as usize;
        let buf = self.slots[idx].take().expect("occupied ring slot");
        self.cons += 1;
        Some(buf)
    }
}

/// Bounded FIFO queue of packet buffers.
pub struct PktRing {
    name: String,
    inner: Mutex<RingInner>,
    sleepq: Arc<SleepQueue>,
}

impl PktRing {
    /// Create a ring with at least `capacity` slots (rounded up to a
    /// power of two).
    pub fn new(name: impl Into<String>, capacity: usize, sleepq: Arc<SleepQueue>) -> Arc<Self> {
        let cap = capacity.max(2).next_power_of_two();
        let slots = (0..cap).map(|_| None).collect();
        Arc::new(PktRing {
            name: name.into(),
            inner: Mutex::new("pkt_ring", LockFlags::QUIET, RingInner {
                slots,
                mask: (cap - 1) as u64,
                prod: 0,
                cons: 0,
                sleeper: false,
                closed: false,
            }),
            sleepq,
        })
    }

    #[inline]
    fn chan(&self) -> WaitChannel {
        WaitChannel::of(self)
    }

    /// Insert `buf` at the tail.
    ///
    /// Ownership transfers to the ring on success; on failure the
    /// buffer comes back in the error. A parked consumer is woken
    /// after the ring lock is released.
    pub fn enqueue(&self, buf: PktBuf) -> Result<(), RingError> {
        let mut g = self.inner.lock();
        if g.closed {
            return Err(RingError::Closed(buf));
        }
        if g.len() > g.mask {
            return Err(RingError::Full(buf));
        }
        let idx = (g.prod & g.mask) as usize;
        debug_assert!(g.slots[idx].is_none());
        g.slots[idx] = Some(buf);
        g.prod += 1;
        let wake = g.sleeper;
        if wake {
            g.sleeper = false;
        }
        drop(g);
        if wake {
            self.sleepq.wakeup_one(self.chan());
        }
        Ok(())
    }

    /// Remove and return the oldest buffer, or `None` when the ring is
    /// empty. Never blocks.
    pub fn dequeue(&self) -> Option<PktBuf> {
        self.inner.lock().take()
    }

    /// Remove the oldest buffer, sleeping on the ring's wait channel
    /// while the ring is empty.
    ///
    /// Returns `None` only once the ring is closed and drained, which
    /// is the consumer thread's signal to exit.
    pub fn dequeue_wait(&self) -> Option<PktBuf> {
        let mut g = self.inner.lock();
        loop {
            if let Some(buf) = g.take() {
                return Some(buf);
            }
            if g.closed {
                return None;
            }
            g.sleeper = true;
            g = self.sleepq.sleep_on(self.chan(), g);
        }
    }

    /// Close the ring. Buffers already queued can still be drained;
    /// further enqueues fail and a parked consumer is woken.
    pub fn close(&self) {
        let mut g = self.inner.lock();
        g.closed = true;
        let wake = g.sleeper;
        if wake {
            g.sleeper = false;
        }
        drop(g);
        if wake {
            self.sleepq.wakeup(self.chan());
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Buffers currently queued.
    pub fn len(&self) -> usize {
        self.inner.lock().len() as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slot capacity.
    pub fn capacity(&self) -> usize {
        self.inner.lock().slots.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tagged(tag: u8) -> PktBuf {
        PktBuf::from_frame(&[tag])
    }

    fn tag_of(buf: &PktBuf) -> u8 {
        buf.data()[0]
    }

    #[test]
    fn fifo_order_preserved() {
        let ring = PktRing::new("fifo", 8, SleepQueue::new());
        for tag in [10u8, 20, 30] {
            ring.enqueue(tagged(tag)).unwrap();
        }
        let order: Vec<u8> = std::iter::from_fn(|| ring.dequeue()).map(|b| tag_of(&b)).collect();
        assert_eq!(order, vec![10, 20, 30]);
        assert!(ring.dequeue().is_none());
    }

    // Scenario: capacity-4 ring takes exactly 4 buffers; the 5th is
    // refused; after one dequeue the 5th fits and order is the original
    // insertion order minus the first element.
    #[test]
    fn backpressure_at_capacity() {
        let ring = PktRing::new("bp", 4, SleepQueue::new());
        assert_eq!(ring.capacity(), 4);
        for tag in 1..=4u8 {
            ring.enqueue(tagged(tag)).unwrap();
        }

        let fifth = tagged(5);
        let fifth = match ring.enqueue(fifth) {
            Err(RingError::Full(b)) => b,
            other => panic!("expected Full, got {:?}", other.map(|_| ())),
        };
        assert_eq!(ring.len(), 4);

        assert_eq!(tag_of(&ring.dequeue().unwrap()), 1);
        ring.enqueue(fifth).unwrap();

        let order: Vec<u8> = std::iter::from_fn(|| ring.dequeue()).map(|b| tag_of(&b)).collect();
        assert_eq!(order, vec![2, 3, 4, 5]);
    }

    #[test]
    fn dequeue_wait_blocks_until_enqueue() {
        let sleepq = SleepQueue::new();
        let ring = PktRing::new("blocking", 8, sleepq);
        let ring2 = ring.clone();

        let consumer = std::thread::spawn(move || {
            let buf = ring2.dequeue_wait().expect("woken with a buffer");
            tag_of(&buf)
        });

        // Let the consumer park, then feed it.
        std::thread::sleep(Duration::from_millis(10));
        ring.enqueue(tagged(42)).unwrap();
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn close_wakes_blocked_consumer() {
        let ring = PktRing::new("close", 8, SleepQueue::new());
        let ring2 = ring.clone();
        let consumer = std::thread::spawn(move || ring2.dequeue_wait());
        std::thread::sleep(Duration::from_millis(10));
        ring.close();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn closed_ring_drains_then_refuses() {
        let ring = PktRing::new("drain", 8, SleepQueue::new());
        ring.enqueue(tagged(1)).unwrap();
        ring.close();

        assert!(matches!(ring.enqueue(tagged(2)), Err(RingError::Closed(_))));
        assert_eq!(tag_of(&ring.dequeue_wait().unwrap()), 1);
        assert!(ring.dequeue_wait().is_none());
    }

    #[test]
    fn multiple_producers_single_consumer() {
        let ring = PktRing::new("mpsc", 64, SleepQueue::new());
        let nproducers = 4;
        let per_producer = 50u8;

        let mut producers = Vec::new();
        for p in 0..nproducers {
            let ring = ring.clone();
            producers.push(std::thread::spawn(move || {
                for i in 0..per_producer {
                    let mut buf = tagged(p);
                    buf.push_tail(1).unwrap()[0] = i;
                    // Block-and-retry on a full ring.
                    let mut item = buf;
                    loop {
                        match ring.enqueue(item) {
                            Ok(()) => break,
                            Err(RingError::Full(b)) => {
                                item = b;
                                std::thread::yield_now();
                            }
                            Err(RingError::Closed(_)) => panic!("ring closed"),
                        }
                    }
                }
            }));
        }

        let ring2 = ring.clone();
        let consumer = std::thread::spawn(move || {
            let mut counts = vec![0u32; 4];
            let total = 4 * per_producer as usize;
            for _ in 0..total {
                let buf = ring2.dequeue_wait().unwrap();
                counts[buf.data()[0] as usize] += 1;
            }
            counts
        });

        for p in producers {
            p.join().unwrap();
        }
        let counts = consumer.join().unwrap();
        assert_eq!(counts, vec![50, 50, 50, 50]);
    }
}
