//! Non-blocking fan-out primitives for state snapshots and event streams.
//!
//! Publishers never block: each subscriber gets a bounded channel, a full
//! channel drops the update for that subscriber only, and a disconnected
//! receiver unsubscribes itself on the next publish.

use std::sync::Mutex;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

const SUBSCRIBER_CAPACITY: usize = 64;

/// A broadcast cell holding the latest snapshot of some state.
#[derive(Debug)]
pub struct StateCell<T: Clone> {
    inner: Mutex<CellInner<T>>,
}

#[derive(Debug)]
struct CellInner<T> {
    value: T,
    subscribers: Vec<Sender<T>>,
}

impl<T: Clone> StateCell<T> {
    pub fn new(initial: T) -> Self {
        Self {
            inner: Mutex::new(CellInner {
                value: initial,
                subscribers: Vec::new(),
            }),
        }
    }

    pub fn get(&self) -> T {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).value.clone()
    }

    /// Replace the snapshot and fan it out. The cell's lock linearizes
    /// concurrent writers.
    pub fn set(&self, value: T) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.value = value.clone();
        fan_out(&mut inner.subscribers, &value);
    }

    /// Subscribe to snapshot changes. The current snapshot is delivered
    /// immediately so observers never start blind.
    pub fn subscribe(&self) -> Receiver<T> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        let _ = tx.try_send(inner.value.clone());
        inner.subscribers.push(tx);
        rx
    }
}

/// Broadcast without a retained snapshot, for sample/event streams.
#[derive(Debug)]
pub struct EventBus<T: Clone> {
    subscribers: Mutex<Vec<Sender<T>>>,
}

impl<T: Clone> EventBus<T> {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    pub fn publish(&self, value: T) {
        let mut subs = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        fan_out(&mut subs, &value);
    }

    pub fn subscribe(&self) -> Receiver<T> {
        let (tx, rx) = bounded(SUBSCRIBER_CAPACITY);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }
}

impl<T: Clone> Default for EventBus<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn fan_out<T: Clone>(subscribers: &mut Vec<Sender<T>>, value: &T) {
    subscribers.retain(|sub| match sub.try_send(value.clone()) {
        Ok(()) => true,
        // A slow consumer loses this update but stays subscribed.
        Err(TrySendError::Full(_)) => true,
        Err(TrySendError::Disconnected(_)) => false,
    });
}
