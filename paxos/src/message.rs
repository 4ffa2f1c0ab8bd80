//! Protocol messages, client requests and replica outputs.
//!
//! Replicas exchange [`Message`]s, each scoped to a single key and carrying one [`Rpc`]. Clients submit
//! [`Request`]s and receive [`Reply`]s. The sans-IO [`Replica`](crate::replica::Replica) never performs I/O itself: it
//! returns [`Action`]s for the embedding runtime to carry out.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;

use crate::ballot::Ballot;
use crate::id::{ClientId, NodeId};
use crate::timer::TimerHandle;

/// The identifier of a replicated object. Each key runs its own independent Paxos instance.
pub type Key = u64;

/// A 1-based position in a key's command log. Zero denotes "no slot".
pub type Slot = u64;

/// A client-assigned request number, unique per client.
pub type RequestId = u64;

/// An operation on a key's value.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Op {
    Get,
    Put(Bytes),
    Delete,
    /// Fills a log slot without effect.
    Noop,
}

/// An operation bound to the key it applies to.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Command {
    pub key: Key,
    pub op: Op,
}

/// A client request for a command to be ordered and executed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Request {
    /// The request number, echoed in the [`Reply`].
    pub id: RequestId,

    /// The client which issued the request and receives the reply.
    pub client: ClientId,

    pub command: Command,

    /// The number of times the request has been forwarded between replicas.
    pub forwards: u8,
}

/// The answer to a [`Request`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Reply {
    pub request: RequestId,
    pub client: ClientId,

    /// Whether the command was ordered. A negative reply carries a hint in [`leader`](Self::leader) instead.
    pub ok: bool,

    /// The command as submitted.
    pub command: Command,

    /// The value read by a [`Op::Get`], or replaced by a [`Op::Put`] or [`Op::Delete`].
    pub value: Option<Bytes>,

    /// The replica which ordered the command, or the believed leader for a negative reply.
    pub leader: Option<NodeId>,

    /// The log slot the command was committed at, zero for a negative reply.
    pub slot: Slot,

    pub ballot: Ballot,
}

/// A message between replicas concerning one key.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub key: Key,
    pub rpc: Rpc,
}

/// A Remote Procedure Call between replicas.
#[derive(Clone, Debug, PartialEq)]
pub enum Rpc {
    /// Phase 1a: a candidate asks for promises at a ballot.
    Prepare(Prepare),

    /// Phase 1b: a replica's answer to a [`Prepare`].
    Promise(Promise),

    /// Phase 2a: the leader asks replicas to accept a command at a slot.
    Accept(Accept),

    /// Phase 2b: a replica's answer to an [`Accept`].
    Accepted(Accepted),

    /// Phase 3: the leader announces that a slot is decided.
    Commit(Commit),

    /// The leader asks another replica to take over the key.
    LeaderChange(LeaderChange),
}

#[derive(Clone, Debug, PartialEq)]
pub struct Prepare {
    pub ballot: Ballot,

    /// The candidate's execution cursor. Promises report log entries from this slot onward.
    pub execute: Slot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Promise {
    pub from: NodeId,

    /// The responder's ballot after handling the [`Prepare`]. Higher than the prepared ballot if it was refused.
    pub ballot: Ballot,

    /// The highest slot known to the responder.
    pub slot: Slot,

    /// The responder's log entries from the candidate's execution cursor onward.
    pub log: Vec<PromiseEntry>,
}

/// A log entry reported in a [`Promise`].
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PromiseEntry {
    pub slot: Slot,
    pub ballot: Ballot,
    pub command: Command,
    pub committed: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Accept {
    pub ballot: Ballot,
    pub slot: Slot,
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Accepted {
    pub from: NodeId,

    /// The responder's ballot. Higher than the [`Accept`]'s ballot if the proposal was refused.
    pub ballot: Ballot,

    pub slot: Slot,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Commit {
    pub ballot: Ballot,
    pub slot: Slot,
    pub command: Command,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LeaderChange {
    pub from: NodeId,
    pub to: NodeId,
    pub ballot: Ballot,
}

/// A [`Message`] to be sent to a destination.
#[derive(Clone, Debug, PartialEq)]
pub struct SendableMessage {
    /// The message to be sent.
    pub message: Message,

    /// The destination for the message.
    pub dest: MessageDestination,
}

/// The destination for a [`SendableMessage`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MessageDestination {
    /// The associated message should be sent to every other replica.
    Broadcast,
    /// The associated message should be sent to every other replica of a zone.
    ///
    /// Replicas never produce this destination themselves. It lets a transport relay a message into one zone with
    /// the same delivery rules as the other destinations.
    Zone(u16),
    /// The associated message should be sent to one particular replica.
    To(NodeId),
}

/// An effect requested by a replica from the runtime embedding it.
#[derive(Clone, Debug, PartialEq)]
pub enum Action {
    /// Deliver a protocol message.
    Send(SendableMessage),

    /// Hand a client request to another replica.
    Forward { to: NodeId, request: Request },

    /// Answer a client.
    Reply(Reply),

    /// Call [`Replica::timeout`](crate::replica::Replica::timeout) with `key` and `timer` after `delay`.
    Schedule {
        key: Key,
        timer: TimerHandle,
        delay: Duration,
    },

    /// A previously scheduled timer is no longer wanted.
    Cancel(TimerHandle),
}

//
// Command impls
//

impl Command {
    pub fn get(key: Key) -> Self {
        Self { key, op: Op::Get }
    }

    pub fn put<V: Into<Bytes>>(key: Key, value: V) -> Self {
        Self {
            key,
            op: Op::Put(value.into()),
        }
    }

    pub fn delete(key: Key) -> Self {
        Self { key, op: Op::Delete }
    }

    pub fn noop(key: Key) -> Self {
        Self { key, op: Op::Noop }
    }

    pub fn is_noop(&self) -> bool {
        self.op == Op::Noop
    }

    /// Whether executing the command may change the key's value.
    pub fn is_write(&self) -> bool {
        matches!(self.op, Op::Put(_) | Op::Delete)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.op {
            Op::Get => write!(fmt, "get {}", self.key),
            Op::Put(value) => write!(fmt, "put {} ({} bytes)", self.key, value.len()),
            Op::Delete => write!(fmt, "delete {}", self.key),
            Op::Noop => write!(fmt, "noop {}", self.key),
        }
    }
}

//
// Request impls
//

impl Request {
    pub fn new(id: RequestId, client: ClientId, command: Command) -> Self {
        Self {
            id,
            client,
            command,
            forwards: 0,
        }
    }

    /// A positive reply for this request, ordered by `leader` at `slot`.
    pub fn reply(&self, value: Option<Bytes>, leader: NodeId, slot: Slot, ballot: Ballot) -> Reply {
        Reply {
            request: self.id,
            client: self.client,
            ok: true,
            command: self.command.clone(),
            value,
            leader: Some(leader),
            slot,
            ballot,
        }
    }

    /// A negative reply pointing the client at the believed leader.
    pub fn redirect(&self, leader: Option<NodeId>, ballot: Ballot) -> Reply {
        Reply {
            request: self.id,
            client: self.client,
            ok: false,
            command: self.command.clone(),
            value: None,
            leader,
            slot: 0,
            ballot,
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            id,
            client,
            command,
            forwards,
        } = self;
        fmt.debug_struct("Request")
            .field("id", id)
            .field("client", &format_args!("{}", client))
            .field("command", &format_args!("{}", command))
            .field("forwards", forwards)
            .finish()
    }
}

//
// Message impls
//

impl fmt::Display for Message {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { key, rpc } = self;
        fmt.debug_tuple("")
            .field(&format_args!("key {}", key))
            .field(&format_args!("{}", rpc))
            .finish()
    }
}

//
// Rpc impls
//

impl fmt::Display for Rpc {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self {
            Rpc::Prepare(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Promise(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Accept(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Accepted(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::Commit(msg) => fmt::Display::fmt(msg, fmt),
            Rpc::LeaderChange(msg) => fmt::Display::fmt(msg, fmt),
        }
    }
}

impl fmt::Display for Prepare {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { ballot, execute } = self;
        fmt.debug_struct("Prepare")
            .field("ballot", &format_args!("{}", ballot))
            .field("execute", execute)
            .finish()
    }
}

impl fmt::Display for Promise {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            from,
            ballot,
            slot,
            log,
        } = self;
        fmt.debug_struct("Promise")
            .field("from", &format_args!("{}", from))
            .field("ballot", &format_args!("{}", ballot))
            .field("slot", slot)
            .field("entries", &log.len())
            .finish()
    }
}

impl fmt::Display for Accept {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            ballot,
            slot,
            command,
        } = self;
        fmt.debug_struct("Accept")
            .field("ballot", &format_args!("{}", ballot))
            .field("slot", slot)
            .field("command", &format_args!("{}", command))
            .finish()
    }
}

impl fmt::Display for Accepted {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { from, ballot, slot } = self;
        fmt.debug_struct("Accepted")
            .field("from", &format_args!("{}", from))
            .field("ballot", &format_args!("{}", ballot))
            .field("slot", slot)
            .finish()
    }
}

impl fmt::Display for Commit {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self {
            ballot,
            slot,
            command,
        } = self;
        fmt.debug_struct("Commit")
            .field("ballot", &format_args!("{}", ballot))
            .field("slot", slot)
            .field("command", &format_args!("{}", command))
            .finish()
    }
}

impl fmt::Display for LeaderChange {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let Self { from, to, ballot } = self;
        fmt.debug_struct("LeaderChange")
            .field("from", &format_args!("{}", from))
            .field("to", &format_args!("{}", to))
            .field("ballot", &format_args!("{}", ballot))
            .finish()
    }
}

//
// SendableMessage impls
//

impl SendableMessage {
    pub fn new(key: Key, rpc: Rpc, dest: MessageDestination) -> Self {
        Self {
            message: Message { key, rpc },
            dest,
        }
    }
}

impl fmt::Display for SendableMessage {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.dest {
            MessageDestination::Broadcast => write!(fmt, "{} -> all", self.message),
            MessageDestination::Zone(zone) => write!(fmt, "{} -> zone {}", self.message, zone),
            MessageDestination::To(id) => write!(fmt, "{} -> {}", self.message, id),
        }
    }
}

//
// MessageDestination impls
//

impl MessageDestination {
    /// Whether a message sent by `from` to this destination reaches `to`.
    pub fn includes(&self, from: NodeId, to: NodeId) -> bool {
        match *self {
            MessageDestination::Broadcast => to != from,
            MessageDestination::Zone(zone) => to.zone == zone && to != from,
            MessageDestination::To(id) => to == id,
        }
    }
}
