//! Counting semaphore with a priority-ordered wait set.
//!
//! A semaphore is a nonnegative counter along with two atomic operators for
//! manipulating it:
//!
//! - [`wait`], or "down": wait for the value to become positive, then
//!   decrement it.
//! - [`signal`], or "up": increment the value and wake up the
//!   highest-priority waiting thread, if any.
//!
//! The wait set is kept ordered by thread priority, and is re-sorted at
//! wakeup time: a waiter's priority can change while it is blocked (through
//! priority donation), and the stale insertion order must not decide who
//! runs next.
//!
//! [`wait`]: Semaphore::wait
//! [`signal`]: Semaphore::signal

use super::spinlock::{SpinLock, WouldBlock};
use crate::thread::{Current, ParkHandle, scheduler::planner};

struct SemaState {
    value: usize,
    waiters: Vec<ParkHandle>,
}

/// A counting semaphore.
///
/// A semaphore maintains a set of permits. Permits are used to synchronize
/// access to a shared resource. A semaphore differs from a mutex in that it
/// can allow more than one concurrent caller to access the shared resource
/// at a time, and that the thread performing [`signal`] need not be the one
/// that performed [`wait`].
///
/// [`wait`]: Semaphore::wait
/// [`signal`]: Semaphore::signal
pub struct Semaphore {
    state: SpinLock<SemaState>,
}

impl Semaphore {
    /// Creates a new semaphore initialized with `permits` available permits.
    pub const fn new(permits: usize) -> Self {
        Self {
            state: SpinLock::new(SemaState {
                value: permits,
                waiters: Vec::new(),
            }),
        }
    }

    /// Waits until a permit becomes available and then acquires it.
    ///
    /// If no permits are available, the calling thread parks until another
    /// thread calls [`signal`]. A woken thread re-checks the count before
    /// claiming a permit, so a permit consumed in the meantime simply sends
    /// it back to sleep.
    ///
    /// [`signal`]: Semaphore::signal
    pub fn wait(&self) {
        loop {
            let mut st = self.state.lock();
            if st.value > 0 {
                st.value -= 1;
                st.unlock();
                return;
            }
            Current::park_with(|handle| {
                st.waiters.push(handle);
                st.unlock();
            });
        }
    }

    /// Acquires a permit if one is immediately available.
    ///
    /// This function does not block.
    pub fn try_wait(&self) -> Result<(), WouldBlock> {
        let mut st = self.state.lock();
        if st.value > 0 {
            st.value -= 1;
            st.unlock();
            Ok(())
        } else {
            st.unlock();
            Err(WouldBlock)
        }
    }

    /// Releases a permit back to the semaphore.
    ///
    /// Increments the permit count by one and, if any threads are blocked in
    /// [`wait`], wakes the one whose *current* priority is highest. The wait
    /// set is re-sorted here because priorities shift while threads block.
    ///
    /// [`wait`]: Semaphore::wait
    pub fn signal(&self) {
        let mut st = self.state.lock();
        st.value += 1;
        if st.waiters.is_empty() {
            st.unlock();
            return;
        }
        {
            let pl = planner();
            st.waiters
                .sort_by(|a, b| pl.priority(b.tid()).cmp(&pl.priority(a.tid())));
            pl.unlock();
        }
        let winner = st.waiters.remove(0);
        st.unlock();
        winner.unpark();
    }
}
