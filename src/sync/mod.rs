//! Synchronization primitives.
//!
//! From the bottom up: a spinning [`SpinLock`] for short critical sections,
//! a counting [`Semaphore`] whose wait set is ordered by thread priority,
//! a sleeping [`Mutex`] with nested priority donation, a Mesa-style
//! [`ConditionVariable`], and the fair [`RwLock`] built from the latter
//! two.

pub mod condvar;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;
pub mod spinlock;

pub use condvar::ConditionVariable;
pub use mutex::{Mutex, MutexGuard};
pub use rwlock::{RwLock, RwLockReadGuard, RwLockWriteGuard};
pub use semaphore::Semaphore;
pub use spinlock::{SpinLock, SpinLockGuard, WouldBlock};
