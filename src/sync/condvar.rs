//! Mesa-style condition variable.
//!
//! A condition variable allows a thread to block until some predicate over
//! shared state becomes true, without consuming CPU cycles while it waits.
//! It is always used together with the [`Mutex`] that guards the shared
//! state.
//!
//! The monitor implemented here is "Mesa" style, not "Hoare" style: sending
//! and receiving a signal are not an atomic operation, so a woken waiter
//! re-checks its predicate before proceeding. [`wait_while`] folds the
//! whole lock/check/sleep/recheck loop into one call.
//!
//! Waiters are `(thread, semaphore)` pairs; each signal re-sorts the waiter
//! list by the threads' *current* priorities, so priority changes that
//! happened while a waiter was blocked are honored when choosing whom to
//! wake.
//!
//! [`wait_while`]: ConditionVariable::wait_while

use super::{Mutex, MutexGuard, Semaphore, SpinLock};
use crate::thread::{Current, Tid, scheduler::planner};
use std::sync::Arc;

struct CondWaiter {
    tid: Tid,
    sema: Arc<Semaphore>,
}

/// A condition variable.
///
/// Condition variables represent the ability to block a thread such that it
/// consumes no CPU time while waiting for an event to occur. Condition
/// variables are typically associated with a boolean predicate (a
/// condition) and a mutex. The predicate is always verified under the mutex
/// before determining that a thread must block.
#[derive(Default)]
pub struct ConditionVariable {
    waiters: SpinLock<Vec<CondWaiter>>,
}

impl ConditionVariable {
    /// Creates a new condition variable which is ready to be waited on and
    /// signaled.
    pub const fn new() -> Self {
        Self {
            waiters: SpinLock::new(Vec::new()),
        }
    }

    /// Blocks the current thread while `predicate` returns `true`.
    ///
    /// This function locks the [`Mutex`] and checks the predicate. If it
    /// returns `true`, the thread enqueues itself, releases the mutex, and
    /// blocks. When signaled, it reacquires the mutex and re-evaluates the
    /// predicate; this loop continues until the predicate returns `false`,
    /// at which point the still-held guard is returned.
    ///
    /// There is no need to check the predicate before calling `wait_while`;
    /// it performs the entire check-and-sleep logic internally.
    pub fn wait_while<'a, T>(
        &self,
        mutex: &'a Mutex<T>,
        predicate: impl Fn(&mut T) -> bool,
    ) -> MutexGuard<'a, T> {
        let mut guard = mutex.lock();
        loop {
            if !predicate(&mut guard) {
                return guard;
            }
            let sema = Arc::new(Semaphore::new(0));
            {
                let mut ws = self.waiters.lock();
                ws.push(CondWaiter {
                    tid: Current::get_tid(),
                    sema: sema.clone(),
                });
                ws.unlock();
            }
            guard.unlock();
            sema.wait();
            guard = mutex.lock();
        }
    }

    /// Wakes up one thread blocked on this condition variable, releasing
    /// the given guard.
    ///
    /// If threads are blocked, the one whose current priority is highest is
    /// woken from its call to [`wait_while`]. Signals are not buffered: a
    /// signal with no waiters is lost.
    ///
    /// To wake up all threads, see [`broadcast`].
    ///
    /// [`broadcast`]: ConditionVariable::broadcast
    /// [`wait_while`]: ConditionVariable::wait_while
    pub fn signal<T>(&self, guard: MutexGuard<'_, T>) {
        let winner = self.pop_highest();
        guard.unlock();
        if let Some(w) = winner {
            w.sema.signal();
        }
    }

    /// Wakes up all threads blocked on this condition variable, releasing
    /// the given guard.
    ///
    /// To wake up only one thread, see [`signal`].
    ///
    /// [`signal`]: ConditionVariable::signal
    pub fn broadcast<T>(&self, guard: MutexGuard<'_, T>) {
        let mut ws = self.waiters.lock();
        let all = std::mem::take(&mut *ws);
        ws.unlock();
        guard.unlock();
        for w in all {
            w.sema.signal();
        }
    }

    fn pop_highest(&self) -> Option<CondWaiter> {
        let mut ws = self.waiters.lock();
        if ws.is_empty() {
            ws.unlock();
            return None;
        }
        {
            let pl = planner();
            ws.sort_by(|a, b| pl.priority(b.tid).cmp(&pl.priority(a.tid)));
            pl.unlock();
        }
        let winner = ws.remove(0);
        ws.unlock();
        Some(winner)
    }
}
