//! Thread abstraction, an abstraction of a cpu core.
//!
//! ## The threading model
//!
//! An executing kernel consists of a collection of threads, each with their
//! own stack and local state. Threads can be named, carry a scheduling
//! priority, and provide built-in support for low-level synchronization:
//! a thread parks itself through [`Current::park_with`], handing out a
//! [`ParkHandle`] that another thread later consumes to wake it.
//!
//! Hosted, every kernel thread is backed by an OS thread. The scheduler
//! itself is an external collaborator; what this module keeps is the part
//! the locking discipline depends on: the registry of live threads, their
//! states, and their priorities (owned and donated) inside the shared
//! scheduling state of [`scheduler`].

pub mod scheduler;

use crate::sync::SpinLock;
use scheduler::{PRI_DEFAULT, PRI_MAX, PRI_MIN, planner};
use std::{
    cell::RefCell,
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use crate::KernelError;

/// A thread identifier.
pub type Tid = u64;

/// A possible state of a thread.
#[derive(Clone, Copy, Eq, PartialEq, Debug)]
pub enum ThreadState {
    /// Thread is runnable.
    Runnable,
    /// Thread is running.
    Running,
    /// Thread is parked.
    Parked,
    /// Thread has exited with an exit code.
    Exited(i32),
}

pub(crate) struct ThreadCtl {
    pub tid: Tid,
    #[allow(dead_code)]
    pub name: String,
    pub state: SpinLock<ThreadState>,
}

static THREADS: SpinLock<BTreeMap<Tid, Arc<ThreadCtl>>> = SpinLock::new(BTreeMap::new());
static NEXT_TID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT: RefCell<Option<Arc<ThreadCtl>>> = const { RefCell::new(None) };
}

fn register(name: String, priority: i32) -> Arc<ThreadCtl> {
    let tid = NEXT_TID.fetch_add(1, Ordering::SeqCst);
    let ctl = Arc::new(ThreadCtl {
        tid,
        name,
        state: SpinLock::new(ThreadState::Runnable),
    });
    let mut ths = THREADS.lock();
    ths.insert(tid, ctl.clone());
    ths.unlock();

    let mut pl = planner();
    pl.register_thread(tid, priority);
    pl.unlock();
    ctl
}

fn unregister(tid: Tid) {
    let mut ths = THREADS.lock();
    ths.remove(&tid);
    ths.unlock();

    let mut pl = planner();
    pl.unregister_thread(tid);
    pl.unlock();
}

pub(crate) fn current_ctl() -> Arc<ThreadCtl> {
    CURRENT.with(|c| {
        let mut c = c.borrow_mut();
        match &*c {
            Some(ctl) => ctl.clone(),
            None => {
                // A thread that was not spawned through ThreadBuilder (the
                // boot thread, or a test harness thread) joins the registry
                // on first contact with a synchronization primitive.
                let ctl = register(
                    std::thread::current().name().unwrap_or("external").into(),
                    PRI_DEFAULT,
                );
                *c = Some(ctl.clone());
                ctl
            }
        }
    })
}

fn set_state(ctl: &ThreadCtl, state: ThreadState) {
    let mut st = ctl.state.lock();
    *st = state;
    st.unlock();
}

/// Get the specified thread's [`ThreadState`] by TID.
pub fn get_state_by_tid(tid: Tid) -> Result<ThreadState, KernelError> {
    let ths = THREADS.lock();
    let Some(ctl) = ths.get(&tid).cloned() else {
        ths.unlock();
        return Err(KernelError::InvalidArgument);
    };
    ths.unlock();

    let st = ctl.state.lock();
    let state = *st;
    st.unlock();
    Ok(state)
}

/// Get the specified thread's current (possibly donated) priority by TID.
pub fn get_priority_by_tid(tid: Tid) -> Result<i32, KernelError> {
    let pl = planner();
    let pri = pl.thread(tid).map(|t| t.current_priority);
    pl.unlock();
    pri.ok_or(KernelError::InvalidArgument)
}

struct Parker {
    woken: AtomicBool,
    thread: std::thread::Thread,
}

/// A handle that represents a parked thread.
///
/// Consuming the handle with [`ParkHandle::unpark`] makes the thread
/// runnable again.
pub struct ParkHandle {
    ctl: Arc<ThreadCtl>,
    parker: Arc<Parker>,
}

impl ParkHandle {
    /// Thread id of the parked thread.
    pub fn tid(&self) -> Tid {
        self.ctl.tid
    }

    /// Consume the handle and unpark the underlying thread.
    pub fn unpark(self) {
        set_state(&self.ctl, ThreadState::Runnable);
        self.parker.woken.store(true, Ordering::Release);
        self.parker.thread.unpark();
    }
}

/// The opaque structure indicating the running thread on the current cpu.
pub struct Current {
    _p: (),
}

impl Current {
    /// Run a function `f` with a [`ParkHandle`] for the current thread, and
    /// then park the current thread.
    ///
    /// `f` typically publishes the handle on some wait list and releases
    /// the locks protecting that list; the parking itself happens after `f`
    /// returns, and a wakeup that races ahead of it is not lost.
    pub fn park_with(f: impl FnOnce(ParkHandle)) {
        let ctl = current_ctl();
        let parker = Arc::new(Parker {
            woken: AtomicBool::new(false),
            thread: std::thread::current(),
        });
        set_state(&ctl, ThreadState::Parked);
        f(ParkHandle {
            ctl: ctl.clone(),
            parker: parker.clone(),
        });
        while !parker.woken.load(Ordering::Acquire) {
            std::thread::park();
        }
        set_state(&ctl, ThreadState::Running);
    }

    /// Get the current thread's id.
    pub fn get_tid() -> Tid {
        current_ctl().tid
    }
}

/// A handle to join a thread.
pub struct JoinHandle {
    /// Thread id of this handle.
    pub tid: Tid,
    inner: std::thread::JoinHandle<()>,
}

impl JoinHandle {
    /// Join this handle and return the exit code.
    pub fn join(self) -> i32 {
        match self.inner.join() {
            Ok(()) => 0,
            Err(_) => -1,
        }
    }
}

/// A struct to build a new thread.
pub struct ThreadBuilder {
    name: String,
    priority: i32,
}

impl ThreadBuilder {
    /// Create a new thread builder for thread `name`.
    pub fn new<I>(name: I) -> Self
    where
        String: From<I>,
    {
        Self {
            name: String::from(name),
            priority: PRI_DEFAULT,
        }
    }

    /// Set the owned priority of the thread.
    pub fn priority(mut self, priority: i32) -> Self {
        assert!((PRI_MIN..=PRI_MAX).contains(&priority));
        self.priority = priority;
        self
    }

    /// Spawn the thread.
    pub fn spawn<F: FnOnce() + Send + 'static>(self, thread_fn: F) -> JoinHandle {
        let Self { name, priority } = self;
        let ctl = register(name.clone(), priority);
        let tid = ctl.tid;
        let inner = std::thread::Builder::new()
            .name(name)
            .spawn(move || {
                CURRENT.with(|c| *c.borrow_mut() = Some(ctl.clone()));
                set_state(&ctl, ThreadState::Running);
                thread_fn();
                set_state(&ctl, ThreadState::Exited(0));
                unregister(ctl.tid);
            })
            .expect("failed to spawn thread");
        JoinHandle { tid, inner }
    }
}

/// Run a function `f` with the current thread's id as an argument.
#[inline]
pub fn with_current_tid<R>(f: impl FnOnce(Tid) -> R) -> R {
    f(Current::get_tid())
}
