//! An embedded key-value store replicated across zones.
//!
//! Every key is ordered by its own Paxos instance (see the [`paxos`] crate) and led from the zone that uses it most.
//! [`Cluster::start`] runs a whole replica group inside the process, one event loop per replica, wired together
//! by an in-process bus. [`Client`]s submit commands from a zone and wait for the replies.

pub use paxos;

pub use client::Client;
pub use cluster::Cluster;
pub use config::ClusterConfig;
pub use error::{ClientError, StartError};
pub use history::{Anomaly, History, Operation};

mod client;
mod cluster;
mod config;
mod error;
pub mod history;
mod node;
