//! Lock abstraction layer.
//!
//! Reproduces kernel mutex and read-write-lock semantics on top of
//! host threading primitives: sleep-vs-spin class selection, recursion
//! (on the reentrant type), owner tracking, and destroyed-lock
//! detection. Misusing a lock (recursing on a non-recursive mutex,
//! touching a destroyed lock, destroying an owned lock) is a
//! programming error in the caller, not a runtime condition, and is
//! fatal: the process panics and is expected to abort.
//!
//! Unlike the kernel original, release is tied to a guard value whose
//! existence proves the calling thread holds the lock, so
//! "unlock-not-owned" cannot be expressed at all. Owner and depth
//! words survive only where the type system cannot carry them: owner
//! identity for self-deadlock detection and diagnostics, and explicit
//! depth on [`ReentrantMutex`], whose guards hand out shared access
//! precisely because N of them coexist on one thread.
//!
//! Blocked time on any slow path is charged to the calling thread's
//! registry record.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Instant;

use bitflags::bitflags;
use parking_lot::lock_api::RawMutex as _;
use parking_lot::{Condvar, RawMutex};

use crate::thread::{self, Tid};

// ============================================================================
// Lock Options
// ============================================================================

bitflags! {
    /// Options accepted at lock initialization.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LockFlags: u32 {
        /// Recursion by the owner is allowed. Only meaningful on
        /// [`ReentrantMutex`]; fatal on [`Mutex`] and [`RwLock`].
        const RECURSE = 1 << 0;
        /// Spin-class mutex: waiters busy-wait instead of sleeping.
        /// For very short critical sections only; sleeping on a
        /// spin-class lock's wait channel is fatal.
        const SPIN = 1 << 1;
        /// Suppress debug-level lock diagnostics.
        const QUIET = 1 << 2;
    }
}

// ============================================================================
// Lifecycle Sentinel
// ============================================================================

const LIFE_ACTIVE: u32 = 0xa110_cafe;
const LIFE_DESTROYED: u32 = 0xdead_10cc;

/// Diagnostic metadata shared by all lock kinds.
struct LockMeta {
    name: &'static str,
    flags: LockFlags,
    life: AtomicU32,
    /// Raw tid of the exclusive owner; 0 when unowned.
    owner: AtomicU64,
    /// Recursion depth. 0 or 1 except on `ReentrantMutex`.
    depth: AtomicU32,
}

impl LockMeta {
    fn new(name: &'static str, flags: LockFlags) -> Self {
        LockMeta {
            name,
            flags,
            life: AtomicU32::new(LIFE_ACTIVE),
            owner: AtomicU64::new(0),
            depth: AtomicU32::new(0),
        }
    }

    /// Destroyed-lock sentinel check, performed on every entry point.
    #[inline]
    fn check_alive(&self, op: &str) {
        if self.life.load(Ordering::Acquire) != LIFE_ACTIVE {
            panic!("lock '{}': {} on destroyed lock", self.name, op);
        }
    }

    #[inline]
    fn owned_by_current(&self) -> bool {
        self.owner.load(Ordering::Acquire) == thread::current_tid().raw()
    }

    #[inline]
    fn quiet(&self) -> bool {
        self.flags.contains(LockFlags::QUIET)
    }
}

// ============================================================================
// Raw Backend
// ============================================================================

/// Host primitive underneath a mutex: descheduling (sleep class) or
/// busy-waiting (spin class).
enum RawLock {
    Sleep(RawMutex),
    Spin(spin::Mutex<()>),
}

impl RawLock {
    fn new(flags: LockFlags) -> Self {
        if flags.contains(LockFlags::SPIN) {
            RawLock::Spin(spin::Mutex::new(()))
        } else {
            RawLock::Sleep(RawMutex::INIT)
        }
    }

    fn lock(&self) {
        match self {
            RawLock::Sleep(m) => m.lock(),
            RawLock::Spin(s) => mem::forget(s.lock()),
        }
    }

    fn try_lock(&self) -> bool {
        match self {
            RawLock::Sleep(m) => m.try_lock(),
            RawLock::Spin(s) => match s.try_lock() {
                Some(g) => {
                    mem::forget(g);
                    true
                }
                None => false,
            },
        }
    }

    /// # Safety
    ///
    /// The calling thread must hold the lock.
    unsafe fn unlock(&self) {
        match self {
            RawLock::Sleep(m) => m.unlock(),
            RawLock::Spin(s) => s.force_unlock(),
        }
    }
}

// ============================================================================
// Mutex
// ============================================================================

/// Non-recursive mutual-exclusion lock, sleep class by default.
///
/// `lock()` by the current owner is a fatal deadlock-by-self error.
/// The guard releases on drop; while it lives, the type system proves
/// the calling thread owns the lock.
pub struct Mutex<T: ?Sized> {
    meta: LockMeta,
    raw: RawLock,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for Mutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Initialize a mutex named `name`.
    ///
    /// `RECURSE` is fatal here: a guard hands out `&mut T`, so a
    /// recursive acquisition cannot be expressed soundly. Use
    /// [`ReentrantMutex`] for recursive semantics.
    pub fn new(name: &'static str, flags: LockFlags, value: T) -> Self {
        if flags.contains(LockFlags::RECURSE) {
            panic!("lock '{}': RECURSE on a Mutex; use ReentrantMutex", name);
        }
        Mutex {
            meta: LockMeta::new(name, flags),
            raw: RawLock::new(flags),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> Mutex<T> {
    /// Acquire the lock, blocking (or spinning, for the spin class)
    /// until it is available.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        self.meta.check_alive("lock");
        let tid = thread::current_tid();
        if self.meta.owner.load(Ordering::Acquire) == tid.raw() {
            panic!(
                "lock '{}': recursing on non-recursive mutex",
                self.meta.name
            );
        }
        if !self.raw.try_lock() {
            if !self.meta.quiet() {
                log::trace!("lock '{}': contended", self.meta.name);
            }
            let start = Instant::now();
            self.raw.lock();
            thread::charge_wait_current(start.elapsed());
        }
        // A destroy that raced with our wait must not go unnoticed.
        self.meta.check_alive("lock");
        self.meta.owner.store(tid.raw(), Ordering::Release);
        self.meta.depth.store(1, Ordering::Relaxed);
        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking acquire. Never blocks; `None` means the lock is
    /// held elsewhere.
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        self.meta.check_alive("try_lock");
        let tid = thread::current_tid();
        if self.meta.owner.load(Ordering::Acquire) == tid.raw() {
            panic!(
                "lock '{}': try_lock while already owned by caller",
                self.meta.name
            );
        }
        if !self.raw.try_lock() {
            return None;
        }
        self.meta.check_alive("try_lock");
        self.meta.owner.store(tid.raw(), Ordering::Release);
        self.meta.depth.store(1, Ordering::Relaxed);
        Some(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// True if the calling thread owns the lock.
    pub fn is_owned(&self) -> bool {
        self.meta.owned_by_current()
    }

    /// Fatal unless the calling thread owns the lock.
    pub fn assert_owned(&self) {
        if !self.meta.owned_by_current() {
            panic!("lock '{}': not owned by caller", self.meta.name);
        }
    }

    /// Mark the lock destroyed. Requires the lock to be unowned; every
    /// later use is fatal.
    pub fn destroy(&self) {
        self.meta.check_alive("destroy");
        if !self.raw.try_lock() {
            panic!("lock '{}': destroying an owned lock", self.meta.name);
        }
        self.meta.life.store(LIFE_DESTROYED, Ordering::Release);
        // SAFETY: acquired just above.
        unsafe { self.raw.unlock() };
        if !self.meta.quiet() {
            log::debug!("lock '{}' destroyed", self.meta.name);
        }
    }

    pub fn name(&self) -> &'static str {
        self.meta.name
    }

    pub(crate) fn is_spin_class(&self) -> bool {
        self.meta.flags.contains(LockFlags::SPIN)
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("name", &self.meta.name)
            .field("owner", &self.meta.owner.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scoped proof of `Mutex` ownership; releases on drop.
pub struct MutexGuard<'a, T: ?Sized> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> MutexGuard<'a, T> {
    /// The mutex this guard holds.
    pub(crate) fn mutex(&self) -> &'a Mutex<T> {
        self.lock
    }

    /// Release the lock and hand back the mutex reference. Used by the
    /// sleep/wakeup path to drop the lock after the wait channel is
    /// claimed.
    pub(crate) fn release(self) -> &'a Mutex<T> {
        let lock = self.lock;
        drop(self);
        lock
    }
}

impl<T: ?Sized> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.meta.depth.store(0, Ordering::Relaxed);
        self.lock.meta.owner.store(0, Ordering::Release);
        // SAFETY: the guard proves the calling thread holds the raw lock.
        unsafe { self.lock.raw.unlock() };
    }
}

// ============================================================================
// Reentrant Mutex
// ============================================================================

/// Recursive mutual-exclusion lock (sleep class).
///
/// The owner may acquire again; depth is tracked explicitly and N
/// nested acquisitions need N guard drops before another thread can
/// take the lock. Guards hand out shared references only, since N of
/// them coexist on the owning thread; mutation under a reentrant lock
/// goes through interior mutability.
pub struct ReentrantMutex<T: ?Sized> {
    meta: LockMeta,
    raw: RawMutex,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for ReentrantMutex<T> {}
unsafe impl<T: ?Sized + Send> Sync for ReentrantMutex<T> {}

impl<T> ReentrantMutex<T> {
    pub fn new(name: &'static str, flags: LockFlags, value: T) -> Self {
        if flags.contains(LockFlags::SPIN) {
            panic!(
                "lock '{}': spin-class reentrant mutex is not supported",
                name
            );
        }
        ReentrantMutex {
            meta: LockMeta::new(name, flags | LockFlags::RECURSE),
            raw: RawMutex::INIT,
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> ReentrantMutex<T> {
    /// Acquire the lock, recursing if the caller already owns it.
    pub fn lock(&self) -> ReentrantMutexGuard<'_, T> {
        self.meta.check_alive("lock");
        let tid = thread::current_tid();
        if self.meta.owner.load(Ordering::Acquire) == tid.raw() {
            // Depth is only touched by the owner.
            self.meta.depth.fetch_add(1, Ordering::Relaxed);
            return ReentrantMutexGuard {
                lock: self,
                _not_send: PhantomData,
            };
        }
        if !self.raw.try_lock() {
            if !self.meta.quiet() {
                log::trace!("lock '{}': contended", self.meta.name);
            }
            let start = Instant::now();
            self.raw.lock();
            thread::charge_wait_current(start.elapsed());
        }
        self.meta.check_alive("lock");
        self.meta.owner.store(tid.raw(), Ordering::Release);
        self.meta.depth.store(1, Ordering::Relaxed);
        ReentrantMutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking acquire. Succeeds (and increments depth) when the
    /// caller already owns the lock.
    pub fn try_lock(&self) -> Option<ReentrantMutexGuard<'_, T>> {
        self.meta.check_alive("try_lock");
        let tid = thread::current_tid();
        if self.meta.owner.load(Ordering::Acquire) == tid.raw() {
            self.meta.depth.fetch_add(1, Ordering::Relaxed);
            return Some(ReentrantMutexGuard {
                lock: self,
                _not_send: PhantomData,
            });
        }
        if !self.raw.try_lock() {
            return None;
        }
        self.meta.check_alive("try_lock");
        self.meta.owner.store(tid.raw(), Ordering::Release);
        self.meta.depth.store(1, Ordering::Relaxed);
        Some(ReentrantMutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Current recursion depth. Meaningful only on the owning thread;
    /// elsewhere it is a racy diagnostic.
    pub fn depth(&self) -> u32 {
        self.meta.depth.load(Ordering::Relaxed)
    }

    /// True if the calling thread owns the lock.
    pub fn is_owned(&self) -> bool {
        self.meta.owned_by_current()
    }

    /// Mark the lock destroyed; see [`Mutex::destroy`].
    pub fn destroy(&self) {
        self.meta.check_alive("destroy");
        if self.meta.owned_by_current() || !self.raw.try_lock() {
            panic!("lock '{}': destroying an owned lock", self.meta.name);
        }
        self.meta.life.store(LIFE_DESTROYED, Ordering::Release);
        // SAFETY: acquired just above.
        unsafe { self.raw.unlock() };
    }

    pub fn name(&self) -> &'static str {
        self.meta.name
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for ReentrantMutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReentrantMutex")
            .field("name", &self.meta.name)
            .field("depth", &self.meta.depth.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

/// Scoped proof of `ReentrantMutex` ownership. Shared access only.
pub struct ReentrantMutexGuard<'a, T: ?Sized> {
    lock: &'a ReentrantMutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T: ?Sized> Deref for ReentrantMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves the owning thread holds the lock;
        // all coexisting guards live on that one thread.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for ReentrantMutexGuard<'_, T> {
    fn drop(&mut self) {
        let depth = self.lock.meta.depth.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(depth >= 1);
        if depth == 1 {
            self.lock.meta.owner.store(0, Ordering::Release);
            // SAFETY: depth reached zero; this thread holds the raw lock.
            unsafe { self.lock.raw.unlock() };
        }
    }
}

// ============================================================================
// Read-Write Lock
// ============================================================================

struct RwState {
    readers: u32,
    /// Raw tid of the writer; 0 when none.
    writer: u64,
    waiting_writers: u32,
}

/// Read-write lock with atomic upgrade support.
///
/// Built over a host mutex and condition variables rather than a host
/// rwlock so that `try_upgrade` can atomically claim the write role
/// when the caller is the sole reader. Writers are preferred once
/// waiting, which keeps a stream of readers from starving them.
///
/// The writer role is non-recursive: `write()` or `read()` by the
/// current writer is fatal, like the mutex case. Reader depth is the
/// reader count, exposed for diagnostics only.
pub struct RwLock<T: ?Sized> {
    name: &'static str,
    flags: LockFlags,
    life: AtomicU32,
    state: parking_lot::Mutex<RwState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: ?Sized + Send> Send for RwLock<T> {}
unsafe impl<T: ?Sized + Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(name: &'static str, flags: LockFlags, value: T) -> Self {
        if flags.intersects(LockFlags::RECURSE | LockFlags::SPIN) {
            panic!("lock '{}': unsupported rwlock flags {:?}", name, flags);
        }
        RwLock {
            name,
            flags,
            life: AtomicU32::new(LIFE_ACTIVE),
            state: parking_lot::Mutex::new(RwState {
                readers: 0,
                writer: 0,
                waiting_writers: 0,
            }),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }
}

impl<T: ?Sized> RwLock<T> {
    #[inline]
    fn check_alive(&self, op: &str) {
        if self.life.load(Ordering::Acquire) != LIFE_ACTIVE {
            panic!("lock '{}': {} on destroyed lock", self.name, op);
        }
    }

    /// Acquire shared (read) ownership.
    pub fn read(&self) -> RwReadGuard<'_, T> {
        self.check_alive("read");
        let tid = thread::current_tid().raw();
        let mut s = self.state.lock();
        if s.writer == tid {
            panic!("lock '{}': read while holding write", self.name);
        }
        if s.writer != 0 || s.waiting_writers > 0 {
            let start = Instant::now();
            while s.writer != 0 || s.waiting_writers > 0 {
                self.readers_cv.wait(&mut s);
                self.check_alive("read");
            }
            thread::charge_wait_current(start.elapsed());
        }
        s.readers += 1;
        drop(s);
        RwReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking shared acquire.
    pub fn try_read(&self) -> Option<RwReadGuard<'_, T>> {
        self.check_alive("try_read");
        let tid = thread::current_tid().raw();
        let mut s = self.state.lock();
        if s.writer == tid {
            panic!("lock '{}': try_read while holding write", self.name);
        }
        if s.writer != 0 || s.waiting_writers > 0 {
            return None;
        }
        s.readers += 1;
        drop(s);
        Some(RwReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Acquire exclusive (write) ownership.
    pub fn write(&self) -> RwWriteGuard<'_, T> {
        self.check_alive("write");
        let tid = thread::current_tid().raw();
        let mut s = self.state.lock();
        if s.writer == tid {
            panic!("lock '{}': recursing on rwlock writer", self.name);
        }
        if s.writer != 0 || s.readers > 0 {
            s.waiting_writers += 1;
            let start = Instant::now();
            while s.writer != 0 || s.readers > 0 {
                self.writers_cv.wait(&mut s);
                self.check_alive("write");
            }
            s.waiting_writers -= 1;
            thread::charge_wait_current(start.elapsed());
        }
        s.writer = tid;
        drop(s);
        RwWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Non-blocking exclusive acquire.
    pub fn try_write(&self) -> Option<RwWriteGuard<'_, T>> {
        self.check_alive("try_write");
        let tid = thread::current_tid().raw();
        let mut s = self.state.lock();
        if s.writer == tid {
            panic!("lock '{}': try_write while holding write", self.name);
        }
        if s.writer != 0 || s.readers > 0 {
            return None;
        }
        s.writer = tid;
        drop(s);
        Some(RwWriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Reader count, for diagnostics only.
    pub fn reader_count(&self) -> u32 {
        self.state.lock().readers
    }

    /// Mark the lock destroyed. Requires no readers and no writer.
    pub fn destroy(&self) {
        self.check_alive("destroy");
        let s = self.state.lock();
        if s.readers > 0 || s.writer != 0 {
            panic!("lock '{}': destroying an owned lock", self.name);
        }
        self.life.store(LIFE_DESTROYED, Ordering::Release);
        if !self.flags.contains(LockFlags::QUIET) {
            log::debug!("lock '{}' destroyed", self.name);
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    fn release_read(&self) {
        let mut s = self.state.lock();
        debug_assert!(s.readers >= 1);
        s.readers -= 1;
        if s.readers == 0 && s.waiting_writers > 0 {
            self.writers_cv.notify_one();
        }
    }

    fn release_write(&self) {
        let mut s = self.state.lock();
        debug_assert_ne!(s.writer, 0);
        s.writer = 0;
        if s.waiting_writers > 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
    }
}

impl<T: ?Sized + fmt::Debug> fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = self.state.lock();
        f.debug_struct("RwLock")
            .field("name", &self.name)
            .field("readers", &s.readers)
            .field("writer", &s.writer)
            .finish_non_exhaustive()
    }
}

/// Shared-ownership guard for [`RwLock`].
pub struct RwReadGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> fmt::Debug for RwReadGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RwReadGuard")
            .field("name", &self.lock.name)
            .finish_non_exhaustive()
    }
}

impl<'a, T: ?Sized> RwReadGuard<'a, T> {
    /// Atomically upgrade to write ownership.
    ///
    /// Succeeds only when the caller is the sole reader; otherwise the
    /// read guard is handed back unchanged. Never blocks.
    pub fn try_upgrade(self) -> Result<RwWriteGuard<'a, T>, RwReadGuard<'a, T>> {
        let lock = self.lock;
        lock.check_alive("try_upgrade");
        let mut s = lock.state.lock();
        if s.readers != 1 {
            drop(s);
            return Err(self);
        }
        s.readers = 0;
        s.writer = thread::current_tid().raw();
        drop(s);
        mem::forget(self);
        Ok(RwWriteGuard {
            lock,
            _not_send: PhantomData,
        })
    }
}

impl<T: ?Sized> Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: shared ownership excludes writers.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_read();
    }
}

/// Exclusive-ownership guard for [`RwLock`].
pub struct RwWriteGuard<'a, T: ?Sized> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T: ?Sized> RwWriteGuard<'a, T> {
    /// Downgrade to read ownership. Always succeeds and never blocks;
    /// other readers may join immediately.
    pub fn downgrade(self) -> RwReadGuard<'a, T> {
        let lock = self.lock;
        let mut s = lock.state.lock();
        s.writer = 0;
        s.readers = 1;
        lock.readers_cv.notify_all();
        drop(s);
        mem::forget(self);
        RwReadGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T: ?Sized> Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T: ?Sized> DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: the guard proves exclusive ownership.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T: ?Sized> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn mutex_excludes_concurrent_writers() {
        let lock = Arc::new(Mutex::new("mx-excl", LockFlags::empty(), 0u64));
        let in_section = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            let in_section = in_section.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..200 {
                    let mut g = lock.lock();
                    assert_eq!(in_section.fetch_add(1, Ordering::SeqCst), 0);
                    *g += 1;
                    in_section.fetch_sub(1, Ordering::SeqCst);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 8 * 200);
    }

    #[test]
    fn mutex_try_lock_fails_when_held() {
        let lock = Arc::new(Mutex::new("mx-try", LockFlags::empty(), ()));
        let g = lock.lock();
        let lock2 = lock.clone();
        let other = std::thread::spawn(move || lock2.try_lock().is_none())
            .join()
            .unwrap();
        assert!(other);
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn spin_class_mutex_works() {
        let lock = Arc::new(Mutex::new("mx-spin", LockFlags::SPIN, 0u32));
        let l2 = lock.clone();
        let h = std::thread::spawn(move || {
            for _ in 0..1000 {
                *l2.lock() += 1;
            }
        });
        for _ in 0..1000 {
            *lock.lock() += 1;
        }
        h.join().unwrap();
        assert_eq!(*lock.lock(), 2000);
    }

    #[test]
    #[should_panic(expected = "recursing on non-recursive mutex")]
    fn mutex_self_recursion_is_fatal() {
        let lock = Mutex::new("mx-rec", LockFlags::empty(), ());
        let _g = lock.lock();
        let _g2 = lock.lock();
    }

    #[test]
    #[should_panic(expected = "RECURSE on a Mutex")]
    fn mutex_recurse_flag_is_fatal() {
        let _ = Mutex::new("mx-flag", LockFlags::RECURSE, ());
    }

    #[test]
    #[should_panic(expected = "on destroyed lock")]
    fn destroyed_mutex_use_is_fatal() {
        let lock = Mutex::new("mx-dead", LockFlags::empty(), ());
        lock.destroy();
        let _ = lock.lock();
    }

    #[test]
    #[should_panic(expected = "destroying an owned lock")]
    fn destroy_of_owned_mutex_is_fatal() {
        let lock = Mutex::new("mx-dead2", LockFlags::empty(), ());
        let _g = lock.lock();
        lock.destroy();
    }

    // Scenario: recursive lock "L", two acquisitions by A; B's try_lock
    // must fail until A has dropped both guards.
    #[test]
    fn reentrant_depth_symmetry() {
        let lock = Arc::new(ReentrantMutex::new("L", LockFlags::RECURSE, ()));
        let g1 = lock.lock();
        let g2 = lock.lock();
        assert_eq!(lock.depth(), 2);

        let l2 = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let b = std::thread::spawn(move || {
            // With depth 2 held by A.
            assert!(l2.try_lock().is_none());
            tx.send(()).unwrap();
            // With depth 1 held by A.
            rx_probe(&l2);
            done_rx.recv().unwrap();
            // A released; must succeed now.
            assert!(l2.try_lock().is_some());
        });

        fn rx_probe(l: &ReentrantMutex<()>) {
            assert!(l.try_lock().is_none());
        }

        rx.recv().unwrap();
        drop(g2);
        assert_eq!(lock.depth(), 1);
        assert!(lock.is_owned());
        drop(g1);
        done_tx.send(()).unwrap();
        b.join().unwrap();
    }

    #[test]
    fn reentrant_try_lock_recurses_for_owner() {
        let lock = ReentrantMutex::new("rm-try", LockFlags::RECURSE, ());
        let _g1 = lock.lock();
        let g2 = lock.try_lock().expect("owner try_lock recurses");
        assert_eq!(lock.depth(), 2);
        drop(g2);
        assert_eq!(lock.depth(), 1);
    }

    #[test]
    fn rwlock_allows_concurrent_readers() {
        let lock = Arc::new(RwLock::new("rw-readers", LockFlags::empty(), 5u32));
        let r1 = lock.read();
        let l2 = lock.clone();
        let got = std::thread::spawn(move || *l2.read()).join().unwrap();
        assert_eq!(got, 5);
        assert_eq!(*r1, 5);
    }

    #[test]
    fn rwlock_excludes_writer_from_readers() {
        let lock = Arc::new(RwLock::new("rw-excl", LockFlags::empty(), 0u32));
        let r = lock.read();
        let l2 = lock.clone();
        let writer_blocked = std::thread::spawn(move || l2.try_write().is_none())
            .join()
            .unwrap();
        assert!(writer_blocked);
        drop(r);

        let w = lock.write();
        let l3 = lock.clone();
        let reader_blocked = std::thread::spawn(move || l3.try_read().is_none())
            .join()
            .unwrap();
        assert!(reader_blocked);
        drop(w);
    }

    #[test]
    fn rwlock_writer_sees_reader_updates() {
        let lock = Arc::new(RwLock::new("rw-data", LockFlags::empty(), 0u64));
        let mut handles = Vec::new();
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    *lock.write() += 1;
                    let _ = *lock.read();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.read(), 400);
    }

    #[test]
    fn rwlock_upgrade_sole_reader() {
        let lock = RwLock::new("rw-up", LockFlags::empty(), 1u32);
        let r = lock.read();
        let mut w = r.try_upgrade().expect("sole reader upgrades");
        *w += 1;
        drop(w);
        assert_eq!(*lock.read(), 2);
    }

    #[test]
    fn rwlock_upgrade_fails_with_other_readers() {
        let lock = Arc::new(RwLock::new("rw-up2", LockFlags::empty(), ()));
        let r1 = lock.read();
        let l2 = lock.clone();
        let (tx, rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let h = std::thread::spawn(move || {
            let _r2 = l2.read();
            tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        rx.recv().unwrap();

        let r1 = match r1.try_upgrade() {
            Ok(_) => panic!("upgrade must fail with a second reader"),
            Err(r) => r,
        };
        release_tx.send(()).unwrap();
        h.join().unwrap();
        // Back to sole reader; upgrade succeeds now.
        assert!(r1.try_upgrade().is_ok());
    }

    #[test]
    fn rwlock_downgrade_never_blocks() {
        let lock = Arc::new(RwLock::new("rw-down", LockFlags::empty(), 7u32));
        let w = lock.write();
        let r = w.downgrade();
        assert_eq!(*r, 7);
        // Another reader can join immediately.
        let l2 = lock.clone();
        let ok = std::thread::spawn(move || l2.try_read().is_some())
            .join()
            .unwrap();
        assert!(ok);
    }

    #[test]
    #[should_panic(expected = "recursing on rwlock writer")]
    fn rwlock_writer_recursion_is_fatal() {
        let lock = RwLock::new("rw-rec", LockFlags::empty(), ());
        let _w = lock.write();
        let _w2 = lock.write();
    }

    #[test]
    #[should_panic(expected = "on destroyed lock")]
    fn destroyed_rwlock_use_is_fatal() {
        let lock = RwLock::new("rw-dead", LockFlags::empty(), ());
        lock.destroy();
        let _ = lock.read();
    }

    #[test]
    fn contended_lock_charges_wait_time() {
        let reg = crate::thread::ThreadRegistry::new();
        let lock = Arc::new(Mutex::new("mx-wait", LockFlags::empty(), ()));
        let g = lock.lock();
        let l2 = lock.clone();
        let handle = crate::thread::spawn(&reg, crate::thread::ThreadRole::App, "waiter", move || {
            let _g = l2.lock();
        })
        .unwrap();
        std::thread::sleep(Duration::from_millis(10));
        drop(g);
        handle.join().unwrap();
        let waited: Duration = reg
            .snapshot()
            .iter()
            .map(|r| r.wait_time())
            .sum();
        assert!(waited >= Duration::from_millis(5));
    }
}
