//! Periodic tick source and timer callouts.
//!
//! A dedicated sleeping thread wakes at a fixed period (reference
//! 1 ms), advances the tick counter, runs due one-shot callouts, and
//! invokes the registered per-tick callbacks. Callouts are the
//! amortized per-entry timers the ARP engine hangs expiry and retry
//! on: one scheduled deadline per cache entry instead of a full-table
//! scan on every tick.
//!
//! Tests do not start the thread; they drive [`Clock::fire_due`] with
//! synthetic timestamps instead.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use crate::sync::{LockFlags, Mutex};
use crate::thread::{spawn, ThreadRegistry, ThreadRole};

/// One-shot callout body; receives the clock's current milliseconds.
pub type CalloutFn = Box<dyn FnMut(u64) + Send>;

/// Per-tick callback body; receives the tick number.
pub type TickFn = Box<dyn FnMut(u64) + Send>;

/// Handle for cancelling a scheduled callout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalloutId(u64);

struct Callout {
    id: u64,
    due_ms: u64,
    f: CalloutFn,
}

#[derive(Default)]
struct ClockInner {
    callouts: Vec<Callout>,
    periodic: Vec<TickFn>,
    next_id: u64,
}

/// Periodic tick source.
pub struct Clock {
    period: Duration,
    started: Instant,
    ticks: AtomicU64,
    stop: AtomicBool,
    inner: Mutex<ClockInner>,
    thread: parking_lot::Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Clock {
    /// Create a clock with the given tick period; the tick thread is
    /// not started until [`start`](Self::start).
    pub fn new(period_ms: u64) -> Arc<Self> {
        Arc::new(Clock {
            period: Duration::from_millis(period_ms.max(1)),
            started: Instant::now(),
            ticks: AtomicU64::new(0),
            stop: AtomicBool::new(false),
            inner: Mutex::new("clock", LockFlags::QUIET, ClockInner::default()),
            thread: parking_lot::Mutex::new(None),
        })
    }

    /// Milliseconds since the clock was created (monotonic).
    pub fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }

    /// Ticks elapsed so far.
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Schedule `f` to run once, `after_ms` from now, on the tick
    /// thread.
    pub fn schedule_ms(&self, after_ms: u64, f: CalloutFn) -> CalloutId {
        let due_ms = self.now_ms() + after_ms;
        let mut inner = self.inner.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.callouts.push(Callout { id, due_ms, f });
        CalloutId(id)
    }

    /// Cancel a pending callout. Returns `false` if it already fired
    /// (or was cancelled before).
    pub fn cancel(&self, id: CalloutId) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.callouts.len();
        inner.callouts.retain(|c| c.id != id.0);
        inner.callouts.len() != before
    }

    /// Register a callback invoked on every tick.
    pub fn register_periodic(&self, f: TickFn) {
        self.inner.lock().periodic.push(f);
    }

    /// Pending callouts (diagnostic).
    pub fn pending_callouts(&self) -> usize {
        self.inner.lock().callouts.len()
    }

    /// Run every callout whose deadline is at or before `now_ms`.
    ///
    /// Bodies run outside the callout lock, so a callout may schedule
    /// or cancel others. Returns the number fired. Public so tests can
    /// drive timer behavior deterministically.
    pub fn fire_due(&self, now_ms: u64) -> usize {
        let mut due = Vec::new();
        {
            let mut inner = self.inner.lock();
            let mut i = 0;
            while i < inner.callouts.len() {
                if inner.callouts[i].due_ms <= now_ms {
                    due.push(inner.callouts.swap_remove(i));
                } else {
                    i += 1;
                }
            }
        }
        // Earlier deadlines first; swap_remove scrambled the order.
        due.sort_by_key(|c| c.due_ms);
        let fired = due.len();
        for mut c in due {
            (c.f)(now_ms);
        }
        fired
    }

    fn run_periodic(&self, tick: u64) {
        // Swap out so bodies run without the lock held; periodic
        // registration mid-tick lands on the next tick.
        let mut periodic = std::mem::take(&mut self.inner.lock().periodic);
        for f in periodic.iter_mut() {
            f(tick);
        }
        self.inner.lock().periodic.append(&mut periodic);
    }

    /// Start the tick thread. No-op if already running.
    pub fn start(self: &Arc<Self>, registry: &Arc<ThreadRegistry>) -> std::io::Result<()> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }

        fn one_tick(clock: &Arc<Clock>) {
            let tick = clock.ticks.fetch_add(1, Ordering::Relaxed) + 1;
            let now = clock.now_ms();
            clock.fire_due(now);
            clock.run_periodic(tick);
        }

        let weak: Weak<Clock> = Arc::downgrade(self);
        let handle = spawn(registry, ThreadRole::Timer, "clock-tick", move || loop {
            let Some(clock) = weak.upgrade() else { break };
            if clock.stop.load(Ordering::Acquire) {
                break;
            }
            let period = clock.period;
            one_tick(&clock);
            drop(clock);
            std::thread::sleep(period);
        })?;
        *slot = Some(handle);
        Ok(())
    }

    /// Stop and join the tick thread. Idempotent.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.lock().take() {
            // The last clock reference can be dropped from a callout
            // running on the tick thread itself; joining would then
            // deadlock. The stop flag alone ends the loop in that case.
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for Clock {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn callouts_fire_in_deadline_order() {
        let clock = Clock::new(1);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for (after, tag) in [(30_000u64, 'c'), (10_000, 'a'), (20_000, 'b')] {
            let order = order.clone();
            clock.schedule_ms(after, Box::new(move |_| order.lock().push(tag)));
        }

        // Nothing due yet.
        assert_eq!(clock.fire_due(clock.now_ms()), 0);
        // All three due; must run earliest-deadline first.
        assert_eq!(clock.fire_due(clock.now_ms() + 100_000), 3);
        assert_eq!(*order.lock(), vec!['a', 'b', 'c']);
        assert_eq!(clock.pending_callouts(), 0);
    }

    #[test]
    fn cancel_prevents_firing() {
        let clock = Clock::new(1);
        let fired = Arc::new(AtomicUsize::new(0));
        let fired2 = fired.clone();
        let id = clock.schedule_ms(5, Box::new(move |_| {
            fired2.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(clock.cancel(id));
        assert!(!clock.cancel(id));
        assert_eq!(clock.fire_due(clock.now_ms() + 100), 0);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn callout_may_reschedule_itself_pattern() {
        // A fired callout scheduling a successor, as the ARP retry
        // timer does.
        let clock = Clock::new(1);
        let count = Arc::new(AtomicUsize::new(0));

        let clock2 = clock.clone();
        let count2 = count.clone();
        clock.schedule_ms(1, Box::new(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
            let count3 = count2.clone();
            clock2.schedule_ms(1, Box::new(move |_| {
                count3.fetch_add(1, Ordering::SeqCst);
            }));
        }));

        let t = clock.now_ms();
        assert_eq!(clock.fire_due(t + 10), 1);
        assert_eq!(clock.fire_due(t + 20), 1);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn tick_thread_advances_and_runs_periodic() {
        let registry = ThreadRegistry::new();
        let clock = Clock::new(1);
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        clock.register_periodic(Box::new(move |_| {
            hits2.fetch_add(1, Ordering::SeqCst);
        }));

        clock.start(&registry).unwrap();
        std::thread::sleep(Duration::from_millis(50));
        clock.stop();

        assert!(clock.ticks() >= 1);
        assert!(hits.load(Ordering::SeqCst) >= 1);
        // Timer thread registered itself.
        assert!(registry
            .snapshot()
            .iter()
            .any(|r| r.role() == ThreadRole::Timer));
    }
}
