//! Addressed Multi-Producer Broadcast.
//!
//! An [`MPB`] connects any number of producers to a set of subscribers, each registered under an address. A message can
//! go to one address, to every subscriber, or to the subscribers whose address matches a filter. Every subscriber owns
//! an unbounded [`crossbeam_channel`] receiver, so sending never blocks.

use std::collections::BTreeMap;
use std::error::Error;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A many-to-many bus delivering `X` messages to subscribers addressed by `A`.
///
/// Clones share the same set of subscribers.
pub struct MPB<A, X>
where
    A: Ord + Clone,
    X: Send + 'static,
{
    subscribers: Arc<Mutex<BTreeMap<A, Sender<X>>>>,
}

/// An error returned by [`MPB::send`].
#[derive(Debug, Eq, PartialEq)]
pub enum SendError<A> {
    /// Nobody subscribed under the address.
    UnknownAddress(A),
    /// The subscriber dropped its receiver.
    Disconnected(A),
}

impl<A, X> MPB<A, X>
where
    A: Ord + Clone,
    X: Send + 'static,
{
    pub fn new() -> Self {
        MPB {
            subscribers: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    /// Registers `address` and returns the receiving end of its mailbox. A previous subscriber under the same address
    /// is replaced and sees its channel disconnect.
    pub fn subscribe(&self, address: A) -> Receiver<X> {
        let (tx, rx) = unbounded();
        self.subscribers().insert(address, tx);
        rx
    }

    pub fn unsubscribe(&self, address: &A) -> bool {
        self.subscribers().remove(address).is_some()
    }

    pub fn is_subscribed(&self, address: &A) -> bool {
        self.subscribers().contains_key(address)
    }

    /// The addresses currently subscribed, in order.
    pub fn addresses(&self) -> Vec<A> {
        self.subscribers().keys().cloned().collect()
    }

    /// Delivers `msg` to the subscriber at `address`.
    pub fn send(&self, address: &A, msg: X) -> Result<(), SendError<A>> {
        let mut subscribers = self.subscribers();
        let sender = match subscribers.get(address) {
            Some(sender) => sender,
            None => return Err(SendError::UnknownAddress(address.clone())),
        };
        if sender.send(msg).is_err() {
            subscribers.remove(address);
            return Err(SendError::Disconnected(address.clone()));
        }
        Ok(())
    }

    /// Delivers a copy of `msg` to every subscriber. Returns the number of subscribers reached.
    pub fn broadcast(&self, msg: X) -> usize
    where
        X: Clone,
    {
        self.multicast(|_| true, msg)
    }

    /// Delivers a copy of `msg` to every subscriber whose address matches `filter`. Returns the number of subscribers
    /// reached. Subscribers found disconnected are dropped from the bus.
    pub fn multicast<F>(&self, filter: F, msg: X) -> usize
    where
        F: Fn(&A) -> bool,
        X: Clone,
    {
        let mut subscribers = self.subscribers();
        let mut reached = 0;
        subscribers.retain(|address, sender| {
            if !filter(address) {
                return true;
            }
            match sender.send(msg.clone()) {
                Ok(()) => {
                    reached += 1;
                    true
                }
                Err(_) => false,
            }
        });
        reached
    }

    fn subscribers(&self) -> MutexGuard<'_, BTreeMap<A, Sender<X>>> {
        match self.subscribers.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<A, X> Clone for MPB<A, X>
where
    A: Ord + Clone,
    X: Send + 'static,
{
    fn clone(&self) -> Self {
        MPB {
            subscribers: self.subscribers.clone(),
        }
    }
}

impl<A, X> Default for MPB<A, X>
where
    A: Ord + Clone,
    X: Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<A: fmt::Debug> fmt::Display for SendError<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAddress(address) => write!(f, "no subscriber at {:?}", address),
            Self::Disconnected(address) => write!(f, "subscriber at {:?} disconnected", address),
        }
    }
}

impl<A: fmt::Debug> Error for SendError<A> {}
