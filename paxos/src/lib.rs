//! Partitioned multi-leader Paxos.
//!
//! Every key runs its own Paxos instance with its own leader, so different keys can be led from different zones. A
//! key's leader is elected with a phase-1 quorum and commits commands with a phase-2 quorum. Both may be flexible grid
//! quorums which keep the group safe and live while up to `F` whole zones are unreachable. Leaders watch where each
//! key's requests come from and hand the key over to the zone generating most of its traffic.
//!
//! The crate is sans-IO. A [`Replica`] is driven by three kinds of input:
//!
//! * client [`Request`]s, through [`Replica::handle_request`],
//! * [`Message`]s from other replicas, through [`Replica::receive`],
//! * timers it asked for earlier, through [`Replica::timeout`].
//!
//! Each call returns the [`Action`]s the embedding runtime must perform: send messages, forward requests, answer
//! clients, and schedule or cancel timers.
//!
//! [`Replica`]: replica::Replica
//! [`Replica::handle_request`]: replica::Replica::handle_request
//! [`Replica::receive`]: replica::Replica::receive
//! [`Replica::timeout`]: replica::Replica::timeout
//! [`Request`]: message::Request
//! [`Message`]: message::Message
//! [`Action`]: message::Action

pub mod ballot;
pub mod config;
pub mod id;
pub mod instance;
pub mod message;
pub mod policy;
pub mod quorum;
pub mod replica;
pub mod store;
pub mod timer;

pub use ballot::Ballot;
pub use config::{Config, ConfigError, PolicyConfig};
pub use id::{ClientId, NodeId};
pub use message::{Action, Command, Key, Message, Op, Reply, Request};
pub use quorum::{QuorumCertificate, Topology};
pub use replica::Replica;
pub use store::{InMemoryStore, StateMachine};
pub use timer::{TimerHandle, TimerQueue};
