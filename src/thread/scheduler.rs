//! Scheduler mode and the shared scheduling state.
//!
//! The embedding kernel runs one CPU with interrupt-based preemption, and
//! makes priority transitions atomic by disabling interrupts around them.
//! Hosted, the same serialization is obtained from a single global spinlock
//! over the scheduling state: thread priorities, donation counters, and the
//! holder/donation records of every sleeping mutex. Any code path that in
//! the original would run with interrupts off takes [`planner`] instead.
//!
//! Two scheduling modes exist. The default round-robin mode performs
//! priority donation on lock acquisition; the multi-level feedback queue
//! mode recomputes priorities on its own schedule and disables donation
//! entirely.

use crate::sync::SpinLock;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU8, Ordering};

use super::Tid;

/// Lowest priority.
pub const PRI_MIN: i32 = 0;
/// Default priority of a newly spawned thread.
pub const PRI_DEFAULT: i32 = 31;
/// Highest priority.
pub const PRI_MAX: i32 = 63;

/// The system-wide scheduling policy.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SchedulerMode {
    /// Preemptive priority scheduling with priority donation on locks.
    RoundRobin,
    /// Multi-level feedback queue with a 1-tick quantum. Priorities are
    /// recomputed periodically; donation is disabled.
    Mlfqs,
}

static MODE: AtomicU8 = AtomicU8::new(0);

/// Selects the system-wide scheduler mode.
pub fn set_mode(mode: SchedulerMode) {
    MODE.store(
        match mode {
            SchedulerMode::RoundRobin => 0,
            SchedulerMode::Mlfqs => 1,
        },
        Ordering::SeqCst,
    );
}

/// Returns the current scheduler mode.
pub fn mode() -> SchedulerMode {
    match MODE.load(Ordering::SeqCst) {
        0 => SchedulerMode::RoundRobin,
        _ => SchedulerMode::Mlfqs,
    }
}

/// Identifier of a sleeping mutex inside the scheduling state.
pub(crate) type LockId = u64;

/// Per-thread scheduling state.
pub(crate) struct SchedState {
    /// The priority the thread was created with (or last set itself).
    pub owned_priority: i32,
    /// The effective priority, including any donations.
    pub current_priority: i32,
    /// Number of held locks that carry a donation.
    pub num_donations: usize,
    /// The lock this thread is currently blocked on, if any.
    pub desired_lock: Option<LockId>,
    /// Locks held by this thread, most recently donated first.
    pub held_locks: VecDeque<LockId>,
}

impl SchedState {
    pub fn new(priority: i32) -> Self {
        Self {
            owned_priority: priority,
            current_priority: priority,
            num_donations: 0,
            desired_lock: None,
            held_locks: VecDeque::new(),
        }
    }
}

/// Per-lock scheduling state.
#[derive(Default)]
pub(crate) struct LockCtl {
    /// Thread holding the lock, if any.
    pub holder: Option<Tid>,
    /// Highest priority donated through this lock; `None` if no donation.
    pub donated_priority: Option<i32>,
}

/// The shared scheduling state. See the module documentation.
pub(crate) struct Planner {
    threads: BTreeMap<Tid, SchedState>,
    locks: BTreeMap<LockId, LockCtl>,
}

impl Planner {
    const fn new() -> Self {
        Self {
            threads: BTreeMap::new(),
            locks: BTreeMap::new(),
        }
    }

    pub fn register_thread(&mut self, tid: Tid, priority: i32) {
        self.threads.entry(tid).or_insert_with(|| SchedState::new(priority));
    }

    pub fn unregister_thread(&mut self, tid: Tid) {
        self.threads.remove(&tid);
    }

    pub fn register_lock(&mut self, id: LockId) {
        self.locks.insert(id, LockCtl::default());
    }

    pub fn unregister_lock(&mut self, id: LockId) {
        self.locks.remove(&id);
    }

    pub fn thread(&self, tid: Tid) -> Option<&SchedState> {
        self.threads.get(&tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut SchedState> {
        self.threads.get_mut(&tid)
    }

    pub fn lock_ctl(&self, id: LockId) -> Option<&LockCtl> {
        self.locks.get(&id)
    }

    pub fn lock_ctl_mut(&mut self, id: LockId) -> Option<&mut LockCtl> {
        self.locks.get_mut(&id)
    }

    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Current (possibly donated) priority of a thread; exited threads
    /// decay to the default.
    pub fn priority(&self, tid: Tid) -> i32 {
        self.threads
            .get(&tid)
            .map(|t| t.current_priority)
            .unwrap_or(PRI_DEFAULT)
    }
}

static PLANNER: SpinLock<Planner> = SpinLock::new(Planner::new());

/// Acquires the shared scheduling state.
///
/// This is the moral equivalent of `intr_disable()`: while the returned
/// guard is held, no other thread can observe or change priorities,
/// donation records, or lock holders. Holders must not park.
pub(crate) fn planner() -> crate::sync::SpinLockGuard<'static, Planner> {
    PLANNER.lock()
}
