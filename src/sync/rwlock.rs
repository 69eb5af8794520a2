//! Fair reader-writer lock.
//!
//! This lock allows a number of readers or at most one writer at any point
//! in time. Unlike a plain reader preference or writer preference lock, it
//! is *fair*: admission adapts so that neither side can starve the other.
//! At most 5 consecutive readers are admitted while a writer waits, and at
//! most 10 consecutive writers are admitted while a reader waits, so
//! progress alternates between the two sides under contention.
//!
//! The lock is built from a [`Mutex`] over its counters and a
//! [`ConditionVariable`]; every admission decision is a predicate evaluated
//! in the loop guarding the condition wait.
//!
//! The RAII guards returned from the locking methods implement [`Deref`]
//! (and [`DerefMut`] for [`write`]) to allow access to the content of the
//! lock. A shared hold can be atomically turned into an exclusive one with
//! [`RwLockReadGuard::upgrade`], and an exclusive hold relaxed with
//! [`RwLockWriteGuard::downgrade`].
//!
//! [`write`]: RwLock::write

use super::{ConditionVariable, Mutex, spinlock::WouldBlock};
use crate::thread::{Current, Tid};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};

/// Reader admissions in a row tolerated while a writer waits.
const MAX_CONSEC_READERS: usize = 5;
/// Writer admissions in a row tolerated while a reader waits.
const MAX_CONSEC_WRITERS: usize = 10;

#[derive(Default)]
struct RwState {
    active_readers: usize,
    waiting_readers: usize,
    waiting_writers: usize,
    consec_readers: usize,
    consec_writers: usize,
    writer: Option<Tid>,
}

/// A fair reader-writer lock.
///
/// The type parameter `T` represents the data that this lock protects. The
/// shared count and the fairness counters live behind an internal mutex;
/// the payload is only reachable through the guards.
pub struct RwLock<T> {
    state: Mutex<RwState>,
    cond: ConditionVariable,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    /// Creates a new instance of an `RwLock<T>` which is unlocked.
    pub const fn new(data: T) -> RwLock<T> {
        RwLock {
            state: Mutex::new(RwState {
                active_readers: 0,
                waiting_readers: 0,
                waiting_writers: 0,
                consec_readers: 0,
                consec_writers: 0,
                writer: None,
            }),
            cond: ConditionVariable::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Consumes this `RwLock`, returning the underlying data.
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }

    /// Locks this rwlock with shared read access, parking the current
    /// thread until it can be acquired.
    ///
    /// Admission blocks while a writer holds the lock, or while writers are
    /// waiting and 5 or more consecutive readers have already been admitted
    /// since the last writer.
    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        {
            let mut g = self.state.lock();
            g.waiting_readers += 1;
            g.unlock();
        }
        let mut g = self.cond.wait_while(&self.state, |s| {
            s.writer.is_some()
                || (s.waiting_writers > 0 && s.consec_readers >= MAX_CONSEC_READERS)
        });
        if g.consec_writers > 0 {
            g.consec_writers = 0;
        }
        g.consec_readers += 1;
        g.waiting_readers -= 1;
        g.active_readers += 1;
        g.unlock();
        RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this rwlock with shared read access.
    ///
    /// Fails if a writer holds the lock or any writer is waiting for it.
    /// This function does not block.
    pub fn try_read(&self) -> Result<RwLockReadGuard<'_, T>, WouldBlock> {
        let mut g = self.state.lock();
        if g.writer.is_some() || g.waiting_writers > 0 {
            g.unlock();
            return Err(WouldBlock);
        }
        g.active_readers += 1;
        g.unlock();
        Ok(RwLockReadGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Locks this rwlock with exclusive write access, parking the current
    /// thread until it can be acquired.
    ///
    /// Admission blocks while the lock is held in any mode, or while
    /// readers are waiting and 10 or more consecutive writers have already
    /// been admitted since the last reader.
    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        {
            let mut g = self.state.lock();
            g.waiting_writers += 1;
            g.unlock();
        }
        let mut g = self.cond.wait_while(&self.state, |s| {
            s.writer.is_some()
                || s.active_readers > 0
                || (s.consec_writers >= MAX_CONSEC_WRITERS && s.waiting_readers > 0)
        });
        if g.consec_readers > 0 {
            g.consec_readers = 0;
        }
        g.consec_writers += 1;
        g.waiting_writers -= 1;
        g.writer = Some(Current::get_tid());
        g.unlock();
        RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to lock this rwlock with exclusive write access.
    ///
    /// This function does not block.
    pub fn try_write(&self) -> Result<RwLockWriteGuard<'_, T>, WouldBlock> {
        let mut g = self.state.lock();
        if g.writer.is_some() || g.active_readers > 0 {
            g.unlock();
            return Err(WouldBlock);
        }
        g.writer = Some(Current::get_tid());
        g.unlock();
        Ok(RwLockWriteGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    fn release_shared(&self) {
        let mut g = self.state.lock();
        debug_assert!(g.active_readers > 0, "shared count underflow");
        g.active_readers -= 1;
        if g.active_readers == 0 {
            self.cond.broadcast(g);
        } else {
            g.unlock();
        }
    }

    fn release_exclusive(&self) {
        let mut g = self.state.lock();
        debug_assert_eq!(g.writer, Some(Current::get_tid()));
        g.writer = None;
        self.cond.broadcast(g);
    }
}

/// RAII structure used to release the shared read access of a lock when
/// dropped.
///
/// This structure is created by the [`read`] and [`try_read`] methods on
/// [`RwLock`].
///
/// [`read`]: RwLock::read
/// [`try_read`]: RwLock::try_read
pub struct RwLockReadGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

/// RAII structure used to release the exclusive write access of a lock when
/// dropped.
///
/// This structure is created by the [`write`] and [`try_write`] methods on
/// [`RwLock`].
///
/// [`write`]: RwLock::write
/// [`try_write`]: RwLock::try_write
pub struct RwLockWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
    _not_send: PhantomData<*const ()>,
}

impl<'a, T> RwLockReadGuard<'a, T> {
    /// Atomically converts this shared hold into an exclusive one.
    ///
    /// The shared count is given up first; the calling thread then waits
    /// until no reader or writer remains and claims the lock as writer.
    /// Two simultaneous upgrades of the same lock deadlock, so upgrades
    /// must be serialized by the caller (in this crate, by the cache-map
    /// lock).
    pub fn upgrade(self) -> RwLockWriteGuard<'a, T> {
        let this = core::mem::ManuallyDrop::new(self);
        let lock = this.lock;
        {
            let mut g = lock.state.lock();
            debug_assert!(g.active_readers > 0);
            g.active_readers -= 1;
            g.waiting_writers += 1;
            g.unlock();
        }
        let mut g = lock
            .cond
            .wait_while(&lock.state, |s| s.active_readers > 0 || s.writer.is_some());
        g.waiting_writers -= 1;
        g.writer = Some(Current::get_tid());
        g.unlock();
        RwLockWriteGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<'a, T> RwLockWriteGuard<'a, T> {
    /// Atomically converts this exclusive hold into a shared one.
    ///
    /// Waiting readers are not woken here; they are admitted when the
    /// resulting shared hold is released.
    pub fn downgrade(self) -> RwLockReadGuard<'a, T> {
        let this = core::mem::ManuallyDrop::new(self);
        let lock = this.lock;
        let mut g = lock.state.lock();
        debug_assert_eq!(g.writer, Some(Current::get_tid()));
        g.writer = None;
        g.active_readers += 1;
        g.unlock();
        RwLockReadGuard {
            lock,
            _not_send: PhantomData,
        }
    }
}

impl<T> Deref for RwLockReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> Deref for RwLockWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for RwLockWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for RwLockReadGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_shared();
    }
}

impl<T> Drop for RwLockWriteGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.release_exclusive();
    }
}
