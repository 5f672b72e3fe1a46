//! Host interface driver: the thread/ring composition.
//!
//! ```text
//!                 +--------------+
//!   link -------> |   rx-link    | --- flow hash / round robin ---+
//!                 +--------------+                                |
//!                                          +-----------+     +-----------+
//!                                          | rx_ring 0 | ... | rx_ring N |
//!                                          +-----------+     +-----------+
//!                                                |                 |
//!                                          +-----------+     +-----------+
//!                                          | rx-proto 0| ... | rx-proto N| --> deliver()
//!                                          +-----------+     +-----------+
//!
//!   transmit() --> +---------+     +--------------+
//!                  | tx_ring | --> |   tx-link    | --> link
//!                  +---------+     +--------------+
//! ```
//!
//! One receive-link thread reads raw frames and distributes them to
//! per-core rx rings, by a keyed hash of the IPv4 flow tuple when the
//! frame parses as IPv4 (per-flow ordering), round-robin otherwise.
//! One processing thread per ring drains it into the protocol dispatch
//! upcall. Protocol output enqueues on the tx ring; the transmit-link
//! thread drains it to the transport, re-enqueueing a frame at most
//! once on transient failure.

use std::hash::{Hash, Hasher};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use siphasher::sip::SipHasher13;

use crate::config::StackConfig;
use crate::ethernet::{parse_ethernet, ETHERTYPE_IPV4, ETH_HEADER_LEN};
use crate::ipv4::flow_key;
use crate::link::{LinkTransport, RxError, TxError};
use crate::pkt::{PktBuf, PktPool};
use crate::ring::{PktRing, RingError};
use crate::sleep::SleepQueue;
use crate::thread::{self, spawn, ThreadRegistry, ThreadRole};

/// Protocol dispatch upcall, invoked from each rx-processing thread.
/// Ownership of the buffer passes to the callee.
pub type DeliverFn = Box<dyn Fn(PktBuf) + Send + Sync>;

// Fixed keys: steering must be stable across the driver's lifetime,
// not unpredictable to peers.
const STEER_KEY0: u64 = 0x756e_6574_2d68_6966;
const STEER_KEY1: u64 = 0x7278_2d73_7465_6572;

// ============================================================================
// Statistics
// ============================================================================

/// Link driver statistics.
#[derive(Debug, Default)]
pub struct LinkStats {
    /// Frames read from the link.
    pub rx_frames: AtomicU64,
    /// Bytes read from the link.
    pub rx_bytes: AtomicU64,
    /// Frames dropped: no pool buffer available.
    pub rx_nobufs: AtomicU64,
    /// Frames dropped: rx ring full.
    pub rx_ring_full: AtomicU64,
    /// Receive errors from the transport.
    pub rx_errors: AtomicU64,
    /// Frames steered by flow hash.
    pub rx_steer_hash: AtomicU64,
    /// Frames steered round-robin.
    pub rx_steer_rr: AtomicU64,
    /// Frames written to the link.
    pub tx_frames: AtomicU64,
    /// Bytes written to the link.
    pub tx_bytes: AtomicU64,
    /// Frames re-enqueued after a transient transmit failure.
    pub tx_retries: AtomicU64,
    /// Frames dropped after retry (or on permanent failure).
    pub tx_dropped: AtomicU64,
}

macro_rules! inc {
    ($field:expr) => {
        $field.fetch_add(1, Ordering::Relaxed)
    };
}

impl LinkStats {
    #[inline]
    fn add_rx(&self, bytes: usize) {
        inc!(self.rx_frames);
        self.rx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    fn add_tx(&self, bytes: usize) {
        inc!(self.tx_frames);
        self.tx_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }
}

// ============================================================================
// Link Driver
// ============================================================================

struct HifShared {
    transport: Arc<dyn LinkTransport>,
    rx_rings: Vec<Arc<PktRing>>,
    tx_ring: Arc<PktRing>,
    pool: Arc<PktPool>,
    stats: LinkStats,
    deliver: DeliverFn,
    running: AtomicBool,
    rr_next: AtomicUsize,
    frame_capacity: usize,
}

/// A virtual network interface: link transport + rings + threads.
pub struct LinkDriver {
    shared: Arc<HifShared>,
    threads: Vec<JoinHandle<()>>,
}

impl LinkDriver {
    /// Construct the driver and spawn its threads.
    pub fn new(
        cfg: &StackConfig,
        transport: Arc<dyn LinkTransport>,
        registry: &Arc<ThreadRegistry>,
        sleepq: Arc<SleepQueue>,
        deliver: DeliverFn,
    ) -> io::Result<LinkDriver> {
        let nworkers = cfg.nworkers.max(1);
        let frame_capacity = cfg.mtu + ETH_HEADER_LEN;
        let pool = Arc::new(PktPool::with_layout(
            cfg.pool_size,
            frame_capacity,
            cfg.headroom,
            cfg.tailroom,
        ));

        let rx_rings: Vec<Arc<PktRing>> = (0..nworkers)
            .map(|i| {
                PktRing::new(
                    format!("{}-rx{}", transport.name(), i),
                    cfg.ring_capacity,
                    sleepq.clone(),
                )
            })
            .collect();
        let tx_ring = PktRing::new(
            format!("{}-tx", transport.name()),
            cfg.ring_capacity,
            sleepq.clone(),
        );

        let shared = Arc::new(HifShared {
            transport,
            rx_rings,
            tx_ring,
            pool,
            stats: LinkStats::default(),
            deliver,
            running: AtomicBool::new(true),
            rr_next: AtomicUsize::new(0),
            frame_capacity,
        });

        let mut threads = Vec::with_capacity(nworkers + 2);
        let name = shared.transport.name().to_owned();

        let s = shared.clone();
        threads.push(spawn(registry, ThreadRole::RxLink, &format!("{name}-rx-link"), move || {
            rx_link_loop(&s)
        })?);

        for i in 0..nworkers {
            let s = shared.clone();
            threads.push(spawn(
                registry,
                ThreadRole::RxProto,
                &format!("{name}-rx-proto{i}"),
                move || rx_proto_loop(&s, i),
            )?);
        }

        let s = shared.clone();
        threads.push(spawn(registry, ThreadRole::TxLink, &format!("{name}-tx-link"), move || {
            tx_link_loop(&s)
        })?);

        log::info!("link driver up on {} ({} workers)", name, nworkers);
        Ok(LinkDriver { shared, threads })
    }

    /// Queue a frame for transmission.
    ///
    /// A full tx ring hands the buffer back with
    /// [`TxError::QueueFull`]; the protocol layer decides whether to
    /// block and retry.
    pub fn transmit(&self, buf: PktBuf) -> Result<(), (TxError, PktBuf)> {
        if !self.shared.running.load(Ordering::Acquire) {
            return Err((TxError::LinkDown, buf));
        }
        match self.shared.tx_ring.enqueue(buf) {
            Ok(()) => Ok(()),
            Err(RingError::Full(b)) => Err((TxError::QueueFull, b)),
            Err(RingError::Closed(b)) => Err((TxError::LinkDown, b)),
        }
    }

    /// Copy `frame` into a pool buffer and queue it for transmission.
    pub fn transmit_bytes(&self, frame: &[u8]) -> Result<(), TxError> {
        if frame.is_empty() || frame.len() > self.shared.frame_capacity {
            return Err(TxError::InvalidBuffer);
        }
        let Some(mut buf) = self.shared.pool.alloc() else {
            return Err(TxError::QueueFull);
        };
        buf.push_tail(frame.len())
            .expect("pool buffer sized for a full frame")
            .copy_from_slice(frame);
        self.transmit(buf).map_err(|(e, b)| {
            self.shared.pool.free(b);
            e
        })
    }

    /// Stop the threads and drain the rings. Idempotent; also run by
    /// `Drop`.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        for ring in &self.shared.rx_rings {
            ring.close();
        }
        self.shared.tx_ring.close();
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        log::info!("link driver on {} stopped", self.shared.transport.name());
    }

    pub fn stats(&self) -> &LinkStats {
        &self.shared.stats
    }

    pub fn pool(&self) -> &Arc<PktPool> {
        &self.shared.pool
    }

    pub fn nworkers(&self) -> usize {
        self.shared.rx_rings.len()
    }

    pub fn name(&self) -> &str {
        self.shared.transport.name()
    }

    pub fn mac_address(&self) -> crate::ethernet::EthAddr {
        self.shared.transport.mac_address()
    }

    pub fn mtu(&self) -> usize {
        self.shared.transport.mtu()
    }
}

impl Drop for LinkDriver {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ============================================================================
// Steering
// ============================================================================

/// Pick the rx ring for an inbound frame.
fn steer(shared: &HifShared, frame: &[u8]) -> usize {
    let n = shared.rx_rings.len();
    if n == 1 {
        return 0;
    }
    if let Ok((hdr, payload)) = parse_ethernet(frame) {
        if hdr.ethertype == ETHERTYPE_IPV4 {
            if let Some(key) = flow_key(payload) {
                let mut h = SipHasher13::new_with_keys(STEER_KEY0, STEER_KEY1);
                key.hash(&mut h);
                inc!(shared.stats.rx_steer_hash);
                return (h.finish() % n as u64) as usize;
            }
        }
    }
    inc!(shared.stats.rx_steer_rr);
    shared.rr_next.fetch_add(1, Ordering::Relaxed) % n
}

// ============================================================================
// Driver Threads
// ============================================================================

fn rx_link_loop(shared: &HifShared) {
    let mut scratch = vec![0u8; shared.frame_capacity];
    while shared.running.load(Ordering::Acquire) {
        match shared.transport.recv(&mut scratch) {
            Ok(n) => {
                shared.stats.add_rx(n);
                let Some(mut buf) = shared.pool.alloc() else {
                    inc!(shared.stats.rx_nobufs);
                    continue;
                };
                match buf.push_tail(n) {
                    Some(dst) => dst.copy_from_slice(&scratch[..n]),
                    None => {
                        inc!(shared.stats.rx_errors);
                        shared.pool.free(buf);
                        continue;
                    }
                }
                let idx = steer(shared, &scratch[..n]);
                match shared.rx_rings[idx].enqueue(buf) {
                    Ok(()) => {}
                    Err(RingError::Full(b)) => {
                        // Inbound overflow: drop and count.
                        inc!(shared.stats.rx_ring_full);
                        shared.pool.free(b);
                    }
                    Err(RingError::Closed(b)) => {
                        shared.pool.free(b);
                        break;
                    }
                }
            }
            Err(RxError::TimedOut) => {}
            Err(e) => {
                inc!(shared.stats.rx_errors);
                log::warn!("{}: rx error {:?}", shared.transport.name(), e);
                // Keep the thread alive; persistent errors would
                // otherwise spin.
                std::thread::sleep(Duration::from_millis(1));
            }
        }
    }
}

fn rx_proto_loop(shared: &HifShared, idx: usize) {
    while let Some(buf) = shared.rx_rings[idx].dequeue_wait() {
        let _active = thread::time_active();
        (shared.deliver)(buf);
    }
    log::debug!("{}: rx-proto{} exiting", shared.transport.name(), idx);
}

fn tx_link_loop(shared: &HifShared) {
    while let Some(mut buf) = shared.tx_ring.dequeue_wait() {
        let len = buf.len();
        match shared.transport.send(buf.data()) {
            Ok(()) => {
                shared.stats.add_tx(len);
                shared.pool.free(buf);
            }
            Err(e @ (TxError::QueueFull | TxError::IoError)) => {
                // Transient: one retry via re-enqueue, then the frame
                // is lost.
                if !buf.tx_retried() {
                    buf.mark_tx_retried();
                    inc!(shared.stats.tx_retries);
                    log::debug!("{}: tx retry after {:?}", shared.transport.name(), e);
                    match shared.tx_ring.enqueue(buf) {
                        Ok(()) => {}
                        Err(RingError::Full(b)) | Err(RingError::Closed(b)) => {
                            inc!(shared.stats.tx_dropped);
                            shared.pool.free(b);
                        }
                    }
                } else {
                    inc!(shared.stats.tx_dropped);
                    log::warn!("{}: frame dropped after retry", shared.transport.name());
                    shared.pool.free(buf);
                }
            }
            Err(e) => {
                inc!(shared.stats.tx_dropped);
                log::warn!("{}: tx dropped: {:?}", shared.transport.name(), e);
                shared.pool.free(buf);
            }
        }
    }
    log::debug!("{}: tx-link exiting", shared.transport.name());
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SpinPolicy;
    use crate::ethernet::{build_ethernet_frame, EthAddr, ETHERTYPE_ARP};
    use crate::link::MemLink;
    use std::sync::mpsc;
    use std::sync::Mutex as StdMutex;

    fn test_cfg(nworkers: usize) -> StackConfig {
        StackConfig {
            nworkers,
            ring_capacity: 64,
            pool_size: 128,
            recv_timeout: Duration::from_millis(5),
            ..StackConfig::default()
        }
    }

    fn mem_pair() -> (MemLink, MemLink) {
        MemLink::pair(
            1 << 16,
            1500,
            SpinPolicy::default(),
            Duration::from_millis(5),
        )
    }

    fn ipv4_frame(dst: EthAddr, src: EthAddr, src_port: u16, tag: u8) -> Vec<u8> {
        let mut payload = vec![0u8; 24];
        payload[0] = 0x45;
        payload[9] = 17; // UDP
        payload[12..16].copy_from_slice(&[10, 0, 0, 1]);
        payload[16..20].copy_from_slice(&[10, 0, 0, 2]);
        payload[20..22].copy_from_slice(&src_port.to_be_bytes());
        payload[22..24].copy_from_slice(&53u16.to_be_bytes());
        payload.push(tag);
        build_ethernet_frame(dst, src, ETHERTYPE_IPV4, &payload)
    }

    fn driver_with_channel(
        nworkers: usize,
    ) -> (LinkDriver, MemLink, mpsc::Receiver<Vec<u8>>) {
        let (a, b) = mem_pair();
        let registry = ThreadRegistry::new();
        let sleepq = SleepQueue::new();
        let (tx, rx) = mpsc::channel::<Vec<u8>>();
        let tx = StdMutex::new(tx);
        let driver = LinkDriver::new(
            &test_cfg(nworkers),
            Arc::new(a),
            &registry,
            sleepq,
            Box::new(move |buf| {
                let _ = tx.lock().unwrap().send(buf.data().to_vec());
            }),
        )
        .unwrap();
        (driver, b, rx)
    }

    #[test]
    fn inbound_frames_reach_deliver() {
        let (driver, peer, rx) = driver_with_channel(2);
        let frame = ipv4_frame(driver.mac_address(), peer.mac_address(), 1111, 7);
        peer.send(&frame).unwrap();

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, frame);
        assert_eq!(driver.stats().rx_frames.load(Ordering::Relaxed), 1);
        assert_eq!(driver.stats().rx_steer_hash.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn non_ipv4_frames_steer_round_robin() {
        let (driver, peer, rx) = driver_with_channel(2);
        let frame = build_ethernet_frame(
            driver.mac_address(),
            peer.mac_address(),
            ETHERTYPE_ARP,
            &[0u8; 28],
        );
        peer.send(&frame).unwrap();
        let _ = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(driver.stats().rx_steer_rr.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn one_flow_is_delivered_in_order() {
        let (driver, peer, rx) = driver_with_channel(4);
        // Same flow tuple throughout: all frames hash to one ring, so
        // FIFO order survives the parallel workers.
        for tag in 0..32u8 {
            let frame = ipv4_frame(driver.mac_address(), peer.mac_address(), 9999, tag);
            peer.send(&frame).unwrap();
        }
        let mut tags = Vec::new();
        for _ in 0..32 {
            let frame = rx.recv_timeout(Duration::from_secs(2)).unwrap();
            tags.push(*frame.last().unwrap());
        }
        assert_eq!(tags, (0..32).collect::<Vec<u8>>());
    }

    #[test]
    fn transmit_reaches_the_peer() {
        let (driver, peer, _rx) = driver_with_channel(1);
        let frame = ipv4_frame(peer.mac_address(), driver.mac_address(), 2222, 9);
        driver.transmit_bytes(&frame).unwrap();

        let mut buf = [0u8; 2048];
        let n = loop {
            match peer.recv(&mut buf) {
                Ok(n) => break n,
                Err(RxError::TimedOut) => continue,
                Err(e) => panic!("recv failed: {:?}", e),
            }
        };
        assert_eq!(&buf[..n], frame.as_slice());
        assert_eq!(driver.stats().tx_frames.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn owned_transmit_hands_buffer_back_when_down() {
        let (mut driver, _peer, _rx) = driver_with_channel(1);
        driver.shutdown();
        let buf = PktBuf::from_frame(&[1, 2, 3]);
        match driver.transmit(buf) {
            Err((TxError::LinkDown, b)) => assert_eq!(b.data(), &[1, 2, 3]),
            other => panic!("expected LinkDown, got {:?}", other.map(|_| ())),
        }
    }

    /// Transport that fails a configurable number of sends, then
    /// delegates.
    struct FlakyLink {
        inner: MemLink,
        failures: AtomicUsize,
        error: TxError,
    }

    impl LinkTransport for FlakyLink {
        fn name(&self) -> &str {
            self.inner.name()
        }
        fn mac_address(&self) -> EthAddr {
            self.inner.mac_address()
        }
        fn mtu(&self) -> usize {
            self.inner.mtu()
        }
        fn send(&self, frame: &[u8]) -> Result<(), TxError> {
            let left = self.failures.load(Ordering::Relaxed);
            if left > 0 {
                self.failures.store(left - 1, Ordering::Relaxed);
                return Err(self.error);
            }
            self.inner.send(frame)
        }
        fn recv(&self, buf: &mut [u8]) -> Result<usize, RxError> {
            self.inner.recv(buf)
        }
    }

    fn flaky_driver(failures: usize, error: TxError) -> (LinkDriver, MemLink) {
        let (a, b) = mem_pair();
        let registry = ThreadRegistry::new();
        let driver = LinkDriver::new(
            &test_cfg(1),
            Arc::new(FlakyLink {
                inner: a,
                failures: AtomicUsize::new(failures),
                error,
            }),
            &registry,
            SleepQueue::new(),
            Box::new(drop),
        )
        .unwrap();
        (driver, b)
    }

    #[test]
    fn transient_tx_failure_retries_once_and_delivers() {
        let (driver, peer) = flaky_driver(1, TxError::IoError);
        driver.transmit_bytes(&[0xabu8; 60]).unwrap();

        let mut buf = [0u8; 2048];
        let n = loop {
            match peer.recv(&mut buf) {
                Ok(n) => break n,
                Err(RxError::TimedOut) => continue,
                Err(e) => panic!("recv failed: {:?}", e),
            }
        };
        assert_eq!(n, 60);
        assert_eq!(driver.stats().tx_retries.load(Ordering::Relaxed), 1);
        assert_eq!(driver.stats().tx_dropped.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn second_transient_failure_drops_the_frame() {
        let (driver, peer) = flaky_driver(2, TxError::IoError);
        driver.transmit_bytes(&[0xcdu8; 60]).unwrap();

        // The frame must never arrive.
        let mut buf = [0u8; 2048];
        assert_eq!(peer.recv(&mut buf), Err(RxError::TimedOut));

        // One retry, then the drop.
        while driver.stats().tx_dropped.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(driver.stats().tx_retries.load(Ordering::Relaxed), 1);
        assert_eq!(driver.stats().tx_dropped.load(Ordering::Relaxed), 1);
        // The pool got its buffer back.
        assert_eq!(driver.pool().in_use(), 0);
    }

    #[test]
    fn permanent_tx_failure_drops_without_retry() {
        let (driver, _peer) = flaky_driver(1, TxError::LinkDown);
        driver.transmit_bytes(&[0xefu8; 60]).unwrap();

        while driver.stats().tx_dropped.load(Ordering::Relaxed) == 0 {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(driver.stats().tx_retries.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn shutdown_is_idempotent_and_joins() {
        let (mut driver, _peer, _rx) = driver_with_channel(2);
        driver.shutdown();
        driver.shutdown();
        assert!(driver.threads.is_empty());
    }
}
