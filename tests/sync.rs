use minos::sync::{ConditionVariable, Mutex, Semaphore};
use minos::thread::scheduler::{self, SchedulerMode};
use minos::thread::{ThreadBuilder, ThreadState, get_priority_by_tid, get_state_by_tid};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let start = Instant::now();
    while !cond() {
        assert!(
            start.elapsed() < Duration::from_secs(10),
            "timed out waiting for {what}"
        );
        std::thread::yield_now();
    }
}

#[test]
fn mutex_smoke() {
    const LENGTH: usize = 64;
    let output = Arc::new(Mutex::new(Vec::new()));
    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::new(AtomicUsize::new(0));

    for i in 0..LENGTH {
        let counter = counter.clone();
        let counter2 = counter2.clone();
        let output = output.clone();
        ThreadBuilder::new("smoker").spawn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut d = output.lock();
            while counter.load(Ordering::SeqCst) != LENGTH {
                std::thread::yield_now();
            }
            d.push(i);
            counter2.fetch_add(1, Ordering::SeqCst);
            d.unlock();
        });
    }

    wait_until("all smokers done", || {
        counter2.load(Ordering::SeqCst) == LENGTH
    });

    let mut output = output.lock();
    output.sort();
    assert_eq!(&*output, &(0..LENGTH).collect::<Vec<_>>());
    output.unlock();
}

#[test]
fn mutex_parks_blocked_thread() {
    let mutex = Arc::new(Mutex::new(()));
    let guard = mutex.lock();
    let thread_spawned = Arc::new(AtomicBool::new(false));

    let be_parked = {
        let (thread_spawned, mutex) = (thread_spawned.clone(), mutex.clone());
        ThreadBuilder::new("blockee").spawn(move || {
            thread_spawned.store(true, Ordering::SeqCst);
            let guard = mutex.lock();
            guard.unlock();
        })
    };

    wait_until("blockee spawned", || thread_spawned.load(Ordering::SeqCst));
    wait_until("blockee parked", || {
        get_state_by_tid(be_parked.tid) == Ok(ThreadState::Parked)
    });

    guard.unlock();
    be_parked.join();
}

#[test]
fn semaphore_exec_order() {
    const COUNT: usize = 3;

    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::new(AtomicUsize::new(0));
    let sema = Arc::new(Semaphore::new(0));

    let handles: Vec<_> = (0..COUNT)
        .map(|i| {
            let counter = counter.clone();
            let counter2 = counter2.clone();
            let sema = sema.clone();
            ThreadBuilder::new(format!("support_{i}")).spawn(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
                sema.wait();
                counter.fetch_add(1, Ordering::SeqCst);
            })
        })
        .collect();

    wait_until("all waiters arrived", || {
        counter2.load(Ordering::SeqCst) == COUNT
    });
    assert_eq!(counter.load(Ordering::SeqCst), 0);

    for _ in 0..COUNT {
        sema.signal();
    }
    for handle in handles {
        handle.join();
    }
    assert_eq!(counter.load(Ordering::SeqCst), COUNT);
}

#[test]
fn semaphore_n_permits() {
    const COUNT: usize = 5;
    const PERMITS: usize = 3;

    let counter = Arc::new(AtomicUsize::new(0));
    let counter2 = Arc::new(AtomicUsize::new(0));
    let sema = Arc::new(Semaphore::new(PERMITS));
    let gate = Arc::new(Mutex::new(0));

    let guard = gate.lock();

    let handles: Vec<_> = (0..COUNT)
        .map(|i| {
            let counter = counter.clone();
            let counter2 = counter2.clone();
            let sema = sema.clone();
            let gate = gate.clone();
            ThreadBuilder::new(format!("support_{i}")).spawn(move || {
                counter2.fetch_add(1, Ordering::SeqCst);
                sema.wait();
                counter.fetch_add(1, Ordering::SeqCst);
                let inner = gate.lock();
                inner.unlock();
                sema.signal();
            })
        })
        .collect();

    wait_until("all contenders arrived", || {
        counter2.load(Ordering::SeqCst) == COUNT
    });
    wait_until("permit holders counted", || {
        counter.load(Ordering::SeqCst) == PERMITS
    });
    assert_eq!(counter.load(Ordering::SeqCst), PERMITS);

    guard.unlock();
    for handle in handles {
        handle.join();
    }
    assert_eq!(counter.load(Ordering::SeqCst), COUNT);
}

#[test]
fn semaphore_wakes_highest_priority_waiter() {
    let sema = Arc::new(Semaphore::new(0));
    let low_woken = Arc::new(AtomicBool::new(false));
    let high_woken = Arc::new(AtomicBool::new(false));

    let low = {
        let (sema, low_woken) = (sema.clone(), low_woken.clone());
        ThreadBuilder::new("low").priority(10).spawn(move || {
            sema.wait();
            low_woken.store(true, Ordering::SeqCst);
        })
    };
    let high = {
        let (sema, high_woken) = (sema.clone(), high_woken.clone());
        ThreadBuilder::new("high").priority(40).spawn(move || {
            sema.wait();
            high_woken.store(true, Ordering::SeqCst);
        })
    };

    wait_until("both waiters parked", || {
        get_state_by_tid(low.tid) == Ok(ThreadState::Parked)
            && get_state_by_tid(high.tid) == Ok(ThreadState::Parked)
    });

    sema.signal();
    wait_until("some waiter woken", || {
        low_woken.load(Ordering::SeqCst) || high_woken.load(Ordering::SeqCst)
    });
    assert!(high_woken.load(Ordering::SeqCst));
    assert!(!low_woken.load(Ordering::SeqCst));

    sema.signal();
    low.join();
    high.join();
}

mod condition_variable {
    use super::*;

    const MAX: usize = 2;

    struct BufferInner {
        item: [usize; MAX],
        front: usize,
        tail: usize,
    }

    impl BufferInner {
        fn is_full(&self) -> bool {
            self.tail.overflowing_sub(self.front).0 % MAX == MAX - 1
        }
        fn is_empty(&self) -> bool {
            self.front == self.tail
        }
    }

    struct Buffer {
        inner: Mutex<BufferInner>,
        full: ConditionVariable,
        empty: ConditionVariable,
    }

    impl Buffer {
        fn new() -> Self {
            Self {
                inner: Mutex::new(BufferInner {
                    item: [0; MAX],
                    front: 0,
                    tail: 0,
                }),
                full: ConditionVariable::new(),
                empty: ConditionVariable::new(),
            }
        }

        fn put(&self, val: usize) {
            let mut guard = self.full.wait_while(&self.inner, |b| b.is_full());
            let tail = (guard.tail + 1) % MAX;
            guard.tail = tail;
            guard.item[tail] = val;
            self.empty.signal(guard);
        }

        fn get(&self) -> usize {
            let mut guard = self.empty.wait_while(&self.inner, |b| b.is_empty());
            let front = (guard.front + 1) % MAX;
            let item = guard.item[front];
            guard.front = front;
            self.full.signal(guard);
            item
        }
    }

    #[test]
    fn bounded_buffer() {
        const ITEMS: usize = 10;
        let buffer = Arc::new(Buffer::new());
        let output = Arc::new(Mutex::new(Vec::new()));

        let consumers: Vec<_> = (0..ITEMS)
            .map(|_| {
                let (buffer, output) = (buffer.clone(), output.clone());
                ThreadBuilder::new("consumer").spawn(move || {
                    let d = buffer.get();
                    let mut guard = output.lock();
                    guard.push(d);
                    guard.unlock();
                })
            })
            .collect();

        let producer = {
            let buffer = buffer.clone();
            ThreadBuilder::new("producer").spawn(move || {
                for i in 0..ITEMS {
                    buffer.put(i);
                }
            })
        };

        for consumer in consumers {
            consumer.join();
        }
        producer.join();

        let mut output = output.lock();
        output.sort();
        assert_eq!(&*output, &(0..ITEMS).collect::<Vec<_>>());
        output.unlock();
    }

    #[test]
    fn broadcast_wakes_everyone() {
        const WAITERS: usize = 6;
        let state = Arc::new(Mutex::new(false));
        let cond = Arc::new(ConditionVariable::new());
        let arrived = Arc::new(AtomicUsize::new(0));
        let woken = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..WAITERS)
            .map(|_| {
                let (state, cond, arrived, woken) = (
                    state.clone(),
                    cond.clone(),
                    arrived.clone(),
                    woken.clone(),
                );
                ThreadBuilder::new("waiter").spawn(move || {
                    arrived.fetch_add(1, Ordering::SeqCst);
                    let guard = cond.wait_while(&state, |go| !*go);
                    guard.unlock();
                    woken.fetch_add(1, Ordering::SeqCst);
                })
            })
            .collect();

        wait_until("waiters arrived", || {
            arrived.load(Ordering::SeqCst) == WAITERS
        });
        // Let the stragglers actually enter the wait.
        std::thread::sleep(Duration::from_millis(50));

        let mut guard = state.lock();
        *guard = true;
        cond.broadcast(guard);

        for handle in handles {
            handle.join();
        }
        assert_eq!(woken.load(Ordering::SeqCst), WAITERS);
    }
}

/// The donation scenarios share the global scheduler mode, so they run as
/// one sequential test.
#[test]
fn priority_donation_scenarios() {
    scheduler::set_mode(SchedulerMode::RoundRobin);
    nested_donation_chain();
    donation_disabled_under_mlfqs();
    scheduler::set_mode(SchedulerMode::RoundRobin);
}

/// A low-priority thread holds A; a medium one holds B and wants A; a
/// high one wants B. The high priority must flow down the chain to the
/// low thread, and drain again lock by lock as the chain unwinds.
fn nested_donation_chain() {
    let a = Arc::new(Mutex::new(()));
    let b = Arc::new(Mutex::new(()));

    let l_holding = Arc::new(AtomicBool::new(false));
    let l_release = Arc::new(AtomicBool::new(false));
    let l_exit = Arc::new(AtomicBool::new(false));
    let m_holding = Arc::new(AtomicBool::new(false));
    let m_done = Arc::new(AtomicBool::new(false));
    let m_exit = Arc::new(AtomicBool::new(false));
    let h_done = Arc::new(AtomicBool::new(false));

    let low = {
        let (a, l_holding, l_release, l_exit) = (
            a.clone(),
            l_holding.clone(),
            l_release.clone(),
            l_exit.clone(),
        );
        ThreadBuilder::new("low").priority(10).spawn(move || {
            let guard = a.lock();
            l_holding.store(true, Ordering::SeqCst);
            while !l_release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            guard.unlock();
            while !l_exit.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        })
    };
    wait_until("low holds A", || l_holding.load(Ordering::SeqCst));

    let medium = {
        let (a, b, m_holding, m_done, m_exit) = (
            a.clone(),
            b.clone(),
            m_holding.clone(),
            m_done.clone(),
            m_exit.clone(),
        );
        ThreadBuilder::new("medium").priority(20).spawn(move || {
            let guard_b = b.lock();
            m_holding.store(true, Ordering::SeqCst);
            let guard_a = a.lock();
            guard_a.unlock();
            guard_b.unlock();
            m_done.store(true, Ordering::SeqCst);
            while !m_exit.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
        })
    };
    wait_until("medium holds B", || m_holding.load(Ordering::SeqCst));
    // Medium's donation to low proves it is blocked on A.
    wait_until("medium donated to low", || {
        get_priority_by_tid(low.tid) == Ok(20)
    });

    let high = {
        let (b, h_done) = (b.clone(), h_done.clone());
        ThreadBuilder::new("high").priority(30).spawn(move || {
            let guard = b.lock();
            guard.unlock();
            h_done.store(true, Ordering::SeqCst);
        })
    };

    // High's priority propagates through B's holder to A's holder.
    wait_until("donation reached low", || {
        get_priority_by_tid(low.tid) == Ok(30)
    });
    assert_eq!(get_priority_by_tid(medium.tid), Ok(30));

    l_release.store(true, Ordering::SeqCst);
    wait_until("low returned to owned priority", || {
        get_priority_by_tid(low.tid) == Ok(10)
    });

    wait_until("medium finished", || m_done.load(Ordering::SeqCst));
    assert_eq!(get_priority_by_tid(medium.tid), Ok(20));
    wait_until("high finished", || h_done.load(Ordering::SeqCst));

    l_exit.store(true, Ordering::SeqCst);
    m_exit.store(true, Ordering::SeqCst);
    low.join();
    medium.join();
    high.join();
}

/// Under the MLFQS scheduler, blocking on a held lock must not change the
/// holder's priority.
fn donation_disabled_under_mlfqs() {
    scheduler::set_mode(SchedulerMode::Mlfqs);

    let c = Arc::new(Mutex::new(()));
    let holding = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));

    let holder = {
        let (c, holding, release) = (c.clone(), holding.clone(), release.clone());
        ThreadBuilder::new("mlfqs-holder").priority(10).spawn(move || {
            let guard = c.lock();
            holding.store(true, Ordering::SeqCst);
            while !release.load(Ordering::SeqCst) {
                std::thread::yield_now();
            }
            guard.unlock();
        })
    };
    wait_until("holder holds C", || holding.load(Ordering::SeqCst));

    let contender = {
        let c = c.clone();
        ThreadBuilder::new("mlfqs-contender")
            .priority(40)
            .spawn(move || {
                let guard = c.lock();
                guard.unlock();
            })
    };
    wait_until("contender parked", || {
        get_state_by_tid(contender.tid) == Ok(ThreadState::Parked)
    });
    assert_eq!(get_priority_by_tid(holder.tid), Ok(10));

    release.store(true, Ordering::SeqCst);
    holder.join();
    contender.join();

    scheduler::set_mode(SchedulerMode::RoundRobin);
}
