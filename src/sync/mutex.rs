//! Sleeping mutex with priority donation.
//!
//! The mutex is a binary semaphore that remembers its holder. When a thread
//! blocks on a held mutex under the round-robin scheduler, it donates its
//! priority to the holder, walking the chain of `desired_lock` references so
//! that nested donations propagate: if the holder is itself blocked on some
//! other lock, that lock's holder is raised as well, and so on until a
//! holder that is not blocked is reached.
//!
//! On release, the holder gives back the donation carried by this lock. If
//! other held locks still carry donations, the holder's priority falls back
//! to the donation of the most recently donated of them; otherwise it
//! returns to the owned priority.
//!
//! All of this bookkeeping runs under the shared scheduling state, which
//! stands in for disabling interrupts; see [`crate::thread::scheduler`].
//! Donation is disabled entirely when the MLFQS scheduler is selected.

use super::{Semaphore, spinlock::WouldBlock};
use crate::thread::{
    Current, Tid,
    scheduler::{self, LockId, SchedulerMode, planner},
};
use core::{
    cell::UnsafeCell,
    marker::PhantomData,
    ops::{Deref, DerefMut},
};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_LOCK_ID: AtomicU64 = AtomicU64::new(1);

/// A mutual exclusion primitive useful for protecting shared data.
///
/// This mutex will park threads waiting for the lock to become available,
/// unlike a spinlock, which makes it the right tool for critical sections
/// that are long or that perform I/O. Each mutex has a type parameter which
/// represents the data that it is protecting. The data can only be accessed
/// through the guards returned from [`lock`] and [`try_lock`].
///
/// The guard must be released with an explicit [`MutexGuard::unlock`];
/// dropping a live guard panics.
///
/// [`lock`]: Self::lock
/// [`try_lock`]: Self::try_lock
pub struct Mutex<T> {
    data: UnsafeCell<T>,
    sema: Semaphore,
    id: OnceLock<LockId>,
}

unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Creates a new mutex in an unlocked state ready for use.
    #[inline]
    pub const fn new(data: T) -> Mutex<T> {
        Mutex {
            data: UnsafeCell::new(data),
            sema: Semaphore::new(1),
            id: OnceLock::new(),
        }
    }

    /// Consumes this mutex, returning the underlying data.
    pub fn into_inner(self) -> T {
        let data = unsafe { core::ptr::read(self.data.get()) };
        if let Some(&id) = self.id.get() {
            let mut pl = planner();
            pl.unregister_lock(id);
            pl.unlock();
        }
        core::mem::forget(self);
        data
    }

    fn lock_id(&self) -> LockId {
        *self.id.get_or_init(|| {
            let id = NEXT_LOCK_ID.fetch_add(1, Ordering::SeqCst);
            let mut pl = planner();
            pl.register_lock(id);
            pl.unlock();
            id
        })
    }

    /// Acquires the mutex, parking the current thread until it is able to
    /// do so.
    ///
    /// If the mutex is held, the acquirer publishes it as its desired lock
    /// and, under the round-robin scheduler, performs the nested priority
    /// donation walk before blocking. Acquiring a mutex the current thread
    /// already holds deadlocks.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let tid = Current::get_tid();
        let id = self.lock_id();

        {
            let mut pl = planner();
            let holder = pl.lock_ctl(id).and_then(|l| l.holder);
            debug_assert_ne!(holder, Some(tid), "recursive mutex acquisition");
            if let Some(holder) = holder {
                if let Some(me) = pl.thread_mut(tid) {
                    me.desired_lock = Some(id);
                }
                if scheduler::mode() == SchedulerMode::RoundRobin {
                    donate_chain(&mut pl, tid, id, holder);
                }
            }
            pl.unlock();
        }

        self.sema.wait();

        let mut pl = planner();
        if let Some(l) = pl.lock_ctl_mut(id) {
            l.holder = Some(tid);
        }
        if let Some(me) = pl.thread_mut(tid) {
            me.desired_lock = None;
            me.held_locks.push_back(id);
        }
        pl.unlock();

        MutexGuard {
            lock: self,
            _not_send: PhantomData,
        }
    }

    /// Attempts to acquire this lock.
    ///
    /// If the lock could not be acquired at this time, then [`Err`] is
    /// returned. Otherwise, a guard is returned.
    ///
    /// This function does not block and never donates.
    pub fn try_lock(&self) -> Result<MutexGuard<'_, T>, WouldBlock> {
        self.sema.try_wait()?;
        let tid = Current::get_tid();
        let id = self.lock_id();
        let mut pl = planner();
        if let Some(l) = pl.lock_ctl_mut(id) {
            l.holder = Some(tid);
        }
        if let Some(me) = pl.thread_mut(tid) {
            me.held_locks.push_back(id);
        }
        pl.unlock();
        Ok(MutexGuard {
            lock: self,
            _not_send: PhantomData,
        })
    }

    /// Returns true if the current thread holds this mutex.
    pub fn held_by_current_thread(&self) -> bool {
        let tid = Current::get_tid();
        let pl = planner();
        let held = pl.lock_ctl(self.lock_id()).and_then(|l| l.holder) == Some(tid);
        pl.unlock();
        held
    }

    fn do_unlock(&self) {
        let tid = Current::get_tid();
        let id = self.lock_id();

        let mut pl = planner();
        debug_assert_eq!(
            pl.lock_ctl(id).and_then(|l| l.holder),
            Some(tid),
            "mutex released by a thread that does not hold it"
        );
        if let Some(me) = pl.thread_mut(tid) {
            me.held_locks.retain(|l| *l != id);
        }

        // Give back the donation carried by this lock, if any. Disabled for
        // the multi-level feedback queue scheduler.
        if scheduler::mode() == SchedulerMode::RoundRobin {
            let carried = pl.lock_ctl(id).and_then(|l| l.donated_priority);
            let inherited = {
                let me = pl.thread(tid);
                me.and_then(|m| m.held_locks.front().copied())
            }
            .and_then(|next| pl.lock_ctl(next).and_then(|l| l.donated_priority));
            if let Some(me) = pl.thread_mut(tid) {
                if me.num_donations > 0 && carried.is_some() {
                    me.num_donations -= 1;
                    me.current_priority = if me.num_donations == 0 {
                        me.owned_priority
                    } else {
                        inherited.unwrap_or(me.owned_priority)
                    };
                }
            }
        }

        if let Some(l) = pl.lock_ctl_mut(id) {
            l.holder = None;
            l.donated_priority = None;
        }
        pl.unlock();

        self.sema.signal();
    }
}

/// Walks the chain `lock -> holder.desired_lock -> ...`, raising each
/// holder's current priority to the acquirer's and recording the donation
/// on each lock along the way. The walk terminates at the first lock whose
/// holder is not itself blocked.
fn donate_chain(
    pl: &mut crate::sync::SpinLockGuard<'static, scheduler::Planner>,
    acquirer: Tid,
    first: LockId,
    first_holder: Tid,
) {
    let donated = pl.priority(acquirer);
    if donated <= pl.priority(first_holder) {
        return;
    }

    let mut lock = first;
    // The chain length is bounded by the number of live locks; a longer
    // walk would mean a cycle, which is a deadlock in its own right.
    for _ in 0..=pl.lock_count() {
        let Some(holder) = pl.lock_ctl(lock).and_then(|l| l.holder) else {
            break;
        };

        if let Some(th) = pl.thread_mut(holder) {
            if th.current_priority < donated {
                th.current_priority = donated;
            }
            // The donated lock moves to the front of the holder's held
            // list: the front is always the most recently donated lock.
            th.held_locks.retain(|l| *l != lock);
            th.held_locks.push_front(lock);
        }
        // A lock whose donation record transitions from none to a value
        // counts once against its holder.
        let first_donation = pl
            .lock_ctl(lock)
            .map(|l| l.donated_priority.is_none())
            .unwrap_or(false);
        if first_donation {
            if let Some(th) = pl.thread_mut(holder) {
                th.num_donations += 1;
            }
        }
        if let Some(lc) = pl.lock_ctl_mut(lock) {
            lc.donated_priority = Some(donated);
        }

        match pl.thread(holder).and_then(|t| t.desired_lock) {
            Some(next) => lock = next,
            None => break,
        }
    }
}

impl<T: Default> Default for Mutex<T> {
    /// Creates a `Mutex<T>`, with the `Default` value for T.
    fn default() -> Mutex<T> {
        Mutex::new(Default::default())
    }
}

impl<T> Drop for Mutex<T> {
    fn drop(&mut self) {
        if let Some(&id) = self.id.get() {
            let mut pl = planner();
            pl.unregister_lock(id);
            pl.unlock();
        }
    }
}

/// An implementation of a "scoped lock" of a mutex. When this structure is
/// dropped (falls out of scope) without unlocking, a panic occurs.
///
/// The lock must be explicitly unlocked by the [`unlock`] method.
///
/// The data protected by the mutex can be accessed through this guard.
///
/// [`unlock`]: MutexGuard::unlock
pub struct MutexGuard<'a, T: 'a> {
    lock: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

unsafe impl<T: Sync> Sync for MutexGuard<'_, T> {}

impl<T> MutexGuard<'_, T> {
    /// Releases the underlying [`Mutex`].
    ///
    /// As the guard does **not** automatically release the lock on drop,
    /// the caller must explicitly invoke [`unlock`] to mark the lock as
    /// available again.
    ///
    /// [`unlock`]: MutexGuard::unlock
    pub fn unlock(self) {
        let this = core::mem::ManuallyDrop::new(self);
        this.lock.do_unlock();
    }
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            panic!("`.unlock()` must be explicitly called for MutexGuard.");
        }
        self.lock.do_unlock();
    }
}
