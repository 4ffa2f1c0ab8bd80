use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::Duration;

use rayon::ThreadPoolBuildError;

use paxos::message::RequestId;
use paxos::{ConfigError, NodeId};

/// Why a [`Cluster`](crate::Cluster) could not start.
#[derive(Debug)]
pub enum StartError {
    Config(ConfigError),
    ThreadPool(ThreadPoolBuildError),
}

/// Why a [`Client`](crate::Client) operation failed.
#[derive(Debug, PartialEq)]
pub enum ClientError {
    // No reply to the last attempt within the request timeout
    Timeout { request: RequestId, after: Duration },
    // The cluster has shut down
    Disconnected,
    // Every attempt was redirected, holds the last leader hint
    Rejected { leader: Option<NodeId> },
    // The cluster hosts no replica in the client's zone
    UnknownZone(u16),
}

impl Display for StartError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(err) => write!(f, "invalid configuration: {}", err),
            Self::ThreadPool(err) => write!(f, "cannot build thread pool: {}", err),
        }
    }
}

impl Error for StartError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::ThreadPool(err) => Some(err),
        }
    }
}

impl From<ConfigError> for StartError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err)
    }
}

impl From<ThreadPoolBuildError> for StartError {
    fn from(err: ThreadPoolBuildError) -> Self {
        Self::ThreadPool(err)
    }
}

impl Display for ClientError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { request, after } => write!(f, "request {} timed out after {:?}", request, after),
            Self::Disconnected => write!(f, "cluster is shut down"),
            Self::Rejected { leader: Some(leader) } => write!(f, "request rejected, leader is {}", leader),
            Self::Rejected { leader: None } => write!(f, "request rejected, leader unknown"),
            Self::UnknownZone(zone) => write!(f, "no replica in zone {}", zone),
        }
    }
}

impl Error for ClientError {}
