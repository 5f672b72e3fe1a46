//! Address-keyed sleep/wakeup.
//!
//! A wait channel is an arbitrary address used as a rendezvous key,
//! decoupling sleepers from any particular condition-variable
//! instance. This is the primitive under ring-empty waits and the
//! socket layer's "wait for data/space".
//!
//! Protocol: the sleeper checks its predicate while holding a
//! sleep-class [`Mutex`], then calls [`SleepQueue::sleep_on`] with the
//! guard; the lock is released only after the channel is claimed, and
//! a waker must flip the predicate under that same lock before calling
//! [`SleepQueue::wakeup`], so no wakeup can be lost. Spurious wakeups
//! are permitted; sleepers re-check their predicate in a loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Condvar;

use crate::sync::MutexGuard;
use crate::thread;

// ============================================================================
// Wait Channels
// ============================================================================

/// Rendezvous key for sleep/wakeup, derived from an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WaitChannel(usize);

impl WaitChannel {
    /// Channel keyed by the address of `r`.
    ///
    /// The referent must be address-stable for as long as the channel
    /// is in use (heap- or `Arc`-backed in practice).
    pub fn of<T: ?Sized>(r: &T) -> Self {
        WaitChannel(r as *const T as *const () as usize)
    }

    /// Channel keyed by an arbitrary token.
    pub fn token(t: usize) -> Self {
        WaitChannel(t)
    }
}

/// Why a sleep returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SleepOutcome {
    /// A wakeup was delivered (or the wakeup was spurious; callers
    /// re-check their predicate either way).
    Woken,
    /// The timeout elapsed first.
    TimedOut,
}

// ============================================================================
// Sleep Queue
// ============================================================================

struct ChanState {
    m: parking_lot::Mutex<()>,
    cv: Condvar,
}

struct ChanEntry {
    state: Arc<ChanState>,
    sleepers: usize,
}

/// Table of active wait channels.
///
/// Channels come into existence when the first sleeper arrives and are
/// reclaimed when the last one leaves; waking a channel nobody sleeps
/// on is a no-op.
#[derive(Default)]
pub struct SleepQueue {
    channels: parking_lot::Mutex<HashMap<usize, ChanEntry>>,
}

impl SleepQueue {
    pub fn new() -> Arc<Self> {
        Arc::new(SleepQueue::default())
    }

    /// Release `guard` and sleep on `chan` until woken.
    ///
    /// Reacquires the same lock before returning. Must be called with
    /// the predicate already checked under `guard`; sleeping on a
    /// spin-class mutex is fatal.
    pub fn sleep_on<'a, T: ?Sized>(
        &self,
        chan: WaitChannel,
        guard: MutexGuard<'a, T>,
    ) -> MutexGuard<'a, T> {
        self.sleep_inner(chan, guard, None).0
    }

    /// [`sleep_on`](Self::sleep_on) with an upper bound on the wait.
    pub fn sleep_on_timeout<'a, T: ?Sized>(
        &self,
        chan: WaitChannel,
        guard: MutexGuard<'a, T>,
        timeout: Duration,
    ) -> (MutexGuard<'a, T>, SleepOutcome) {
        self.sleep_inner(chan, guard, Some(timeout))
    }

    fn sleep_inner<'a, T: ?Sized>(
        &self,
        chan: WaitChannel,
        guard: MutexGuard<'a, T>,
        timeout: Option<Duration>,
    ) -> (MutexGuard<'a, T>, SleepOutcome) {
        if guard.mutex().is_spin_class() {
            panic!(
                "sleeping on a spin-class mutex '{}'",
                guard.mutex().name()
            );
        }
        let state = self.claim(chan);

        // Order matters: the channel mutex is taken before the
        // caller's lock is released, and wakeup takes the same mutex,
        // so a wakeup racing with this entry cannot be lost.
        let mut chan_guard = state.m.lock();
        let lock = guard.release();

        let start = Instant::now();
        let outcome = match timeout {
            None => {
                state.cv.wait(&mut chan_guard);
                SleepOutcome::Woken
            }
            Some(t) => {
                if state.cv.wait_for(&mut chan_guard, t).timed_out() {
                    SleepOutcome::TimedOut
                } else {
                    SleepOutcome::Woken
                }
            }
        };
        drop(chan_guard);
        self.release(chan);
        thread::charge_wait_current(start.elapsed());

        (lock.lock(), outcome)
    }

    /// Wake every sleeper on `chan`.
    pub fn wakeup(&self, chan: WaitChannel) {
        if let Some(state) = self.lookup(chan) {
            let _g = state.m.lock();
            state.cv.notify_all();
        }
    }

    /// Wake at most one sleeper on `chan`.
    pub fn wakeup_one(&self, chan: WaitChannel) {
        if let Some(state) = self.lookup(chan) {
            let _g = state.m.lock();
            state.cv.notify_one();
        }
    }

    /// Number of sleepers currently on `chan` (diagnostic).
    pub fn sleepers(&self, chan: WaitChannel) -> usize {
        self.channels
            .lock()
            .get(&chan.0)
            .map(|e| e.sleepers)
            .unwrap_or(0)
    }

    /// Number of channels with at least one sleeper (diagnostic).
    pub fn active_channels(&self) -> usize {
        self.channels.lock().len()
    }

    fn claim(&self, chan: WaitChannel) -> Arc<ChanState> {
        let mut channels = self.channels.lock();
        let entry = channels.entry(chan.0).or_insert_with(|| ChanEntry {
            state: Arc::new(ChanState {
                m: parking_lot::Mutex::new(()),
                cv: Condvar::new(),
            }),
            sleepers: 0,
        });
        entry.sleepers += 1;
        entry.state.clone()
    }

    fn release(&self, chan: WaitChannel) {
        let mut channels = self.channels.lock();
        if let Some(entry) = channels.get_mut(&chan.0) {
            entry.sleepers -= 1;
            if entry.sleepers == 0 {
                channels.remove(&chan.0);
            }
        }
    }

    fn lookup(&self, chan: WaitChannel) -> Option<Arc<ChanState>> {
        self.channels.lock().get(&chan.0).map(|e| e.state.clone())
    }
}

// ============================================================================
// Tests
// ============================================================================
