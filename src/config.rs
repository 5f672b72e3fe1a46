//! Fixed configuration inputs for stack construction.
//!
//! Everything here is decided once, at process start, by whatever
//! bootstraps the stack. None of these values change at runtime; the
//! driver threads copy what they need when they are spawned.

use std::thread;
use std::time::Duration;

use crate::arp::ArpConfig;
use crate::{DEFAULT_HEADROOM, DEFAULT_MTU, DEFAULT_TAILROOM};

// ============================================================================
// Spin Policy
// ============================================================================

/// Two-tier polling policy for busy-wait paths (shared-memory rings).
///
/// A poller first spins `spin_iters` times, then yields the CPU
/// `yield_iters` times, then parks for `park` per round until its
/// caller's timeout expires. The tiers are explicit configuration, not
/// hard-coded iteration counts, so deployments can trade latency for
/// CPU burn.
#[derive(Debug, Clone, Copy)]
pub struct SpinPolicy {
    /// Busy-spin iterations (`spin_loop` hint) before yielding.
    pub spin_iters: u32,
    /// `yield_now` iterations before parking.
    pub yield_iters: u32,
    /// Park duration per round once spinning and yielding are exhausted.
    pub park: Duration,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        SpinPolicy {
            spin_iters: 64,
            yield_iters: 16,
            park: Duration::from_micros(50),
        }
    }
}

// ============================================================================
// Stack Configuration
// ============================================================================

/// Configuration for a `LinkDriver` instance and its helpers.
#[derive(Debug, Clone)]
pub struct StackConfig {
    /// Number of rx-processing threads (and rx rings). Defaults to the
    /// number of CPUs the host reports.
    pub nworkers: usize,
    /// Interface MTU (payload capacity of packet buffers).
    pub mtu: usize,
    /// Headroom reserved in each packet buffer.
    pub headroom: usize,
    /// Tailroom reserved in each packet buffer.
    pub tailroom: usize,
    /// Capacity of each rx ring and of the tx ring (rounded up to a
    /// power of two).
    pub ring_capacity: usize,
    /// Number of preallocated packet buffers in the pool.
    pub pool_size: usize,
    /// How long a link receive call may block before re-checking for
    /// shutdown.
    pub recv_timeout: Duration,
    /// Polling policy for busy-wait transports.
    pub spin: SpinPolicy,
    /// Clock tick period in milliseconds.
    pub tick_ms: u64,
    /// ARP engine tunables.
    pub arp: ArpConfig,
}

impl Default for StackConfig {
    fn default() -> Self {
        let ncpu = thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        StackConfig {
            nworkers: ncpu,
            mtu: DEFAULT_MTU,
            headroom: DEFAULT_HEADROOM,
            tailroom: DEFAULT_TAILROOM,
            ring_capacity: 512,
            pool_size: 1024,
            recv_timeout: Duration::from_millis(20),
            spin: SpinPolicy::default(),
            tick_ms: 1,
            arp: ArpConfig::default(),
        }
    }
}
