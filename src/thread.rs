//! Thread identity, roles, and time accounting.
//!
//! The stack spawns a fixed set of long-lived threads per interface
//! (link receive, link transmit, per-core protocol processing, timer).
//! Each of them registers here so diagnostics can attribute blocked
//! time and protocol-processing time to a role. Records are created
//! when the stack spawns a thread and live for the rest of the
//! process; they are never removed.
//!
//! The registry is an explicitly constructed object shared by `Arc`,
//! not ambient global state. The only process-wide pieces are the tid
//! counter (thread identity) and the thread-local pointer to the
//! current thread's record, which exists so that lock slow paths can
//! charge wait time without carrying a registry reference.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::io;
use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

// ============================================================================
// Thread Identity
// ============================================================================

/// Process-unique thread id.
///
/// Assigned lazily from a monotonic counter the first time a thread
/// asks for its own id. Host thread ids are not used directly because
/// lock owner words need a stable `u64` representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Tid(NonZeroU64);

impl Tid {
    /// Raw integer value (never zero; zero means "unowned" in lock
    /// owner words).
    #[inline]
    pub fn raw(self) -> u64 {
        self.0.get()
    }
}

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_TID: Cell<u64> = const { Cell::new(0) };
    static CURRENT_RECORD: RefCell<Option<Arc<ThreadRecord>>> = const { RefCell::new(None) };
}

/// The calling thread's tid, assigning one on first use.
pub fn current_tid() -> Tid {
    CURRENT_TID.with(|c| {
        let mut raw = c.get();
        if raw == 0 {
            raw = NEXT_TID.fetch_add(1, Ordering::Relaxed);
            c.set(raw);
        }
        Tid(NonZeroU64::new(raw).expect("tid counter wrapped"))
    })
}

// ============================================================================
// Thread Roles
// ============================================================================

/// Logical role of a thread known to the stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadRole {
    /// Application-level thread (created by the surrounding socket layer).
    App,
    /// Socket/byte-queue service thread.
    Socket,
    /// Per-core protocol-processing thread draining an rx ring.
    RxProto,
    /// Link-facing transmit thread draining the tx ring.
    TxLink,
    /// Link-facing receive thread feeding the rx rings.
    RxLink,
    /// Periodic tick thread.
    Timer,
}

// ============================================================================
// Thread Record
// ============================================================================

/// Per-thread accounting record.
#[derive(Debug)]
pub struct ThreadRecord {
    tid: Tid,
    role: ThreadRole,
    name: String,
    /// Nanoseconds spent blocked (lock waits, ring sleeps).
    wait_ns: AtomicU64,
    /// Nanoseconds spent in protocol-processing regions.
    active_ns: AtomicU64,
}

impl ThreadRecord {
    fn new(tid: Tid, role: ThreadRole, name: String) -> Self {
        ThreadRecord {
            tid,
            role,
            name,
            wait_ns: AtomicU64::new(0),
            active_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn role(&self) -> ThreadRole {
        self.role
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Total blocked time accumulated so far.
    pub fn wait_time(&self) -> Duration {
        Duration::from_nanos(self.wait_ns.load(Ordering::Relaxed))
    }

    /// Total protocol-processing time accumulated so far.
    pub fn active_time(&self) -> Duration {
        Duration::from_nanos(self.active_ns.load(Ordering::Relaxed))
    }

    #[inline]
    pub fn charge_wait(&self, d: Duration) {
        self.wait_ns
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn charge_active(&self, d: Duration) {
        self.active_ns
            .fetch_add(d.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Charge blocked time to the calling thread's record, if it has one.
///
/// Threads the stack did not spawn simply have nothing charged.
pub(crate) fn charge_wait_current(d: Duration) {
    CURRENT_RECORD.with(|r| {
        if let Some(rec) = r.borrow().as_ref() {
            rec.charge_wait(d);
        }
    });
}

/// Scoped timer for protocol-processing regions.
///
/// Created by [`time_active`]; charges the elapsed time to the calling
/// thread's record when dropped.
pub struct ActiveTimer {
    record: Option<Arc<ThreadRecord>>,
    start: Instant,
}

impl Drop for ActiveTimer {
    fn drop(&mut self) {
        if let Some(rec) = self.record.take() {
            rec.charge_active(self.start.elapsed());
        }
    }
}

/// Start timing a protocol-processing region on the calling thread.
pub fn time_active() -> ActiveTimer {
    ActiveTimer {
        record: CURRENT_RECORD.with(|r| r.borrow().clone()),
        start: Instant::now(),
    }
}

// ============================================================================
// Thread Registry
// ============================================================================

/// Process-wide table of threads the stack has spawned.
///
/// A concurrent map keyed by tid. Lookup of the calling thread's own
/// record goes through a thread-local and does not touch the map.
#[derive(Debug, Default)]
pub struct ThreadRegistry {
    threads: RwLock<HashMap<u64, Arc<ThreadRecord>>>,
}

impl ThreadRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(ThreadRegistry::default())
    }

    /// Register the calling thread under `role`.
    ///
    /// Installs the record as the thread's current record so that wait
    /// and active time get charged to it. Registering twice replaces
    /// the previous record in the thread-local but keeps both in the
    /// table (records are process-lifetime).
    pub fn register(&self, role: ThreadRole, name: &str) -> Arc<ThreadRecord> {
        let tid = current_tid();
        let rec = Arc::new(ThreadRecord::new(tid, role, name.to_owned()));
        self.threads.write().insert(tid.raw(), rec.clone());
        CURRENT_RECORD.with(|r| *r.borrow_mut() = Some(rec.clone()));
        log::debug!("thread {} registered as {:?} ({})", tid.raw(), role, name);
        rec
    }

    /// The calling thread's record, if it registered.
    pub fn current(&self) -> Option<Arc<ThreadRecord>> {
        CURRENT_RECORD.with(|r| r.borrow().clone())
    }

    /// Look up a record by tid.
    pub fn get(&self, tid: Tid) -> Option<Arc<ThreadRecord>> {
        self.threads.read().get(&tid.raw()).cloned()
    }

    /// Number of registered threads.
    pub fn len(&self) -> usize {
        self.threads.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.threads.read().is_empty()
    }

    /// All records, for diagnostics.
    pub fn snapshot(&self) -> Vec<Arc<ThreadRecord>> {
        self.threads.read().values().cloned().collect()
    }
}

/// Spawn an OS thread that registers itself before running `f`.
///
/// The OS thread name is set to `name` (truncated by the host if too
/// long) so the role shows up in external tooling as well.
pub fn spawn<F, T>(
    registry: &Arc<ThreadRegistry>,
    role: ThreadRole,
    name: &str,
    f: F,
) -> io::Result<std::thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let registry = registry.clone();
    let thread_name = name.to_owned();
    std::thread::Builder::new()
        .name(thread_name.clone())
        .spawn(move || {
            registry.register(role, &thread_name);
            f()
        })
}
