use std::time::Instant;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use rand::rngs::OsRng;

use mpb::MPB;
use paxos::message::{Action, Key, Message, Reply, Request, SendableMessage};
use paxos::{ClientId, Config, InMemoryStore, NodeId, Replica, TimerQueue};

/// Where an [`Envelope`] can be delivered on the bus.
#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum Address {
    Node(NodeId),
    Client(ClientId),
}

/// Everything travelling over the bus.
#[derive(Clone, Debug)]
pub enum Envelope {
    Message { from: NodeId, message: Message },
    Request(Request),
    Reply(Reply),
    Stop,
}

pub type Bus = MPB<Address, Envelope>;

pub type NodeReplica = Replica<InMemoryStore, OsRng>;

/// The event loop owning one replica.
pub struct Node {
    replica: NodeReplica,
    bus: Bus,
    inbox: Receiver<Envelope>,
    timers: TimerQueue<Key>,
}

impl Node {
    /// Subscribes the replica `id` to `bus`. Messages sent from now on are queued until [`run`](Self::run) picks
    /// them up.
    pub fn new(id: NodeId, config: Config, bus: Bus) -> Self {
        let inbox = bus.subscribe(Address::Node(id));
        Node {
            replica: Replica::new(id, config, InMemoryStore::new(), OsRng),
            bus,
            inbox,
            timers: TimerQueue::new(),
        }
    }

    /// Serves envelopes and timers until told to stop, then returns the replica's store.
    pub fn run(mut self) -> InMemoryStore {
        let id = self.replica.id();
        info!("node {} started", id);

        loop {
            let received = match self.timers.next_deadline() {
                Some(deadline) => self
                    .inbox
                    .recv_timeout(deadline.saturating_duration_since(Instant::now())),
                None => self.inbox.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match received {
                Ok(Envelope::Stop) | Err(RecvTimeoutError::Disconnected) => break,
                Ok(envelope) => self.handle(envelope),
                Err(RecvTimeoutError::Timeout) => {}
            }
            self.fire_due_timers();
        }

        info!("node {} stopped, leading {} keys", id, self.replica.active_keys());
        self.replica.into_store()
    }

    fn handle(&mut self, envelope: Envelope) {
        let now = Instant::now();
        let actions = match envelope {
            Envelope::Message { from, message } => {
                debug!("{} <- {} {}", self.replica.id(), from, message);
                self.replica.receive(message, now)
            }
            Envelope::Request(request) => {
                debug!("{} <- {}", self.replica.id(), request);
                self.replica.handle_request(request, now)
            }
            Envelope::Reply(reply) => {
                warn!("{} dropping reply to request {} for {}", self.replica.id(), reply.request, reply.client);
                return;
            }
            Envelope::Stop => return,
        };
        self.perform(actions, now);
    }

    fn fire_due_timers(&mut self) {
        let now = Instant::now();
        while let Some((timer, key)) = self.timers.pop_due(now) {
            let actions = self.replica.timeout(key, timer, now);
            self.perform(actions, now);
        }
    }

    fn perform(&mut self, actions: Vec<Action>, now: Instant) {
        let id = self.replica.id();
        for action in actions {
            match action {
                Action::Send(SendableMessage { message, dest }) => {
                    let reached = self.bus.multicast(
                        |address| match address {
                            Address::Node(to) => dest.includes(id, *to),
                            Address::Client(_) => false,
                        },
                        Envelope::Message { from: id, message },
                    );
                    if reached == 0 {
                        debug!("{} message to {:?} reached nobody", id, dest);
                    }
                }
                Action::Forward { to, request } => self.deliver(Address::Node(to), Envelope::Request(request)),
                Action::Reply(reply) => self.deliver(Address::Client(reply.client), Envelope::Reply(reply)),
                Action::Schedule { key, timer, delay } => match now.checked_add(delay) {
                    Some(deadline) => self.timers.schedule(timer, deadline, key),
                    None => warn!("{} dropping {} scheduled past the clock's range", id, timer),
                },
                Action::Cancel(timer) => {
                    let _ = self.timers.cancel(timer);
                }
            }
        }
    }

    fn deliver(&self, to: Address, envelope: Envelope) {
        if let Err(err) = self.bus.send(&to, envelope) {
            debug!("{} delivery failed: {}", self.replica.id(), err);
        }
    }
}
