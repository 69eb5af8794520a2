//! A bounded multi-producer, single-consumer channel.
//!
//! The channel is a FIFO queue paired with two semaphores: `items` counts
//! queued elements and parks the consumer while the queue is empty; `slots`
//! counts remaining capacity and parks (or, for [`Sender::try_send`],
//! refuses) producers while the queue is full. Background workers such as
//! the buffer cache's read-ahead thread drain a channel until every sender
//! is gone.

use crate::sync::{Semaphore, WouldBlock};
use crossbeam_queue::SegQueue;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

/// The receiving half of the channel was dropped.
#[derive(Debug, Eq, PartialEq)]
pub struct SendError<T>(pub T);

/// Every sending half of the channel was dropped and the queue is empty.
#[derive(Debug, Eq, PartialEq)]
pub struct RecvError;

struct Chan<T> {
    queue: SegQueue<T>,
    items: Semaphore,
    slots: Semaphore,
    senders: AtomicUsize,
    receiver_alive: AtomicBool,
}

/// The sending half of a channel.
pub struct Sender<T> {
    chan: Arc<Chan<T>>,
}

/// The receiving half of a channel.
pub struct Receiver<T> {
    chan: Arc<Chan<T>>,
}

/// Creates a bounded channel with room for `capacity` in-flight elements.
pub fn channel<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let chan = Arc::new(Chan {
        queue: SegQueue::new(),
        items: Semaphore::new(0),
        slots: Semaphore::new(capacity),
        senders: AtomicUsize::new(1),
        receiver_alive: AtomicBool::new(true),
    });
    (
        Sender { chan: chan.clone() },
        Receiver { chan },
    )
}

impl<T> Sender<T> {
    /// Sends a value, parking while the channel is full.
    pub fn send(&self, value: T) -> Result<(), SendError<T>> {
        if !self.chan.receiver_alive.load(Ordering::Acquire) {
            return Err(SendError(value));
        }
        self.chan.slots.wait();
        self.chan.queue.push(value);
        self.chan.items.signal();
        Ok(())
    }

    /// Sends a value if the channel has room, without blocking.
    pub fn try_send(&self, value: T) -> Result<(), SendError<T>> {
        if !self.chan.receiver_alive.load(Ordering::Acquire)
            || self.chan.slots.try_wait() == Err(WouldBlock)
        {
            return Err(SendError(value));
        }
        self.chan.queue.push(value);
        self.chan.items.signal();
        Ok(())
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        self.chan.senders.fetch_add(1, Ordering::AcqRel);
        Self {
            chan: self.chan.clone(),
        }
    }
}

impl<T> Drop for Sender<T> {
    fn drop(&mut self) {
        if self.chan.senders.fetch_sub(1, Ordering::AcqRel) == 1 {
            // Wake the receiver so that it can observe disconnection.
            self.chan.items.signal();
        }
    }
}

impl<T> Receiver<T> {
    /// Receives the next value, parking while the channel is empty.
    ///
    /// Returns `Err(RecvError)` once every sender is gone and the queue has
    /// drained.
    pub fn recv(&self) -> Result<T, RecvError> {
        loop {
            self.chan.items.wait();
            if let Some(value) = self.chan.queue.pop() {
                self.chan.slots.signal();
                return Ok(value);
            }
            if self.chan.senders.load(Ordering::Acquire) == 0 {
                // Re-post the disconnect token for any further recv calls.
                self.chan.items.signal();
                return Err(RecvError);
            }
        }
    }
}

impl<T> Drop for Receiver<T> {
    fn drop(&mut self) {
        self.chan.receiver_alive.store(false, Ordering::Release);
    }
}
