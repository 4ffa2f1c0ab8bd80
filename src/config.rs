use std::time::Duration;

use paxos::{Config, ConfigError, Topology};

/// Settings for an in-process [`Cluster`](crate::Cluster): the replicas' protocol settings plus client behaviour.
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub paxos: Config,

    /// How long a client waits for the answer to one attempt.
    pub request_timeout: Duration,

    /// How many times a client resends a request after a timeout or a redirect.
    pub retries: usize,
}

impl ClusterConfig {
    pub fn new(paxos: Config) -> Self {
        ClusterConfig {
            paxos,
            request_timeout: Duration::from_secs(2),
            retries: 3,
        }
    }

    /// A cluster of `zones` zones with `nodes_per_zone` replicas each and default settings.
    pub fn uniform(zones: u16, nodes_per_zone: u16) -> Self {
        Self::new(Config::new(Topology::uniform(zones, nodes_per_zone)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.paxos.validate()
    }
}
