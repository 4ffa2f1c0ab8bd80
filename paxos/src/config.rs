//! Replica group configuration.

use std::error::Error;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::quorum::{QuorumCertificate, Topology};

/// Settings shared by every replica of a group.
#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    /// The zones of the group and their replica counts.
    pub topology: Topology,

    /// The number of zone failures quorums tolerate. Zero selects plain majorities.
    pub fz: usize,

    /// The leader migration policy run by a key's leader on every request it serves.
    pub policy: PolicyConfig,

    /// The upper bound of the random delay before a preempted candidate retries its election.
    pub backoff: Duration,

    /// How long after last hearing from a key's leader requests are still forwarded to it rather than triggering an
    /// election.
    pub leader_timeout: Duration,

    /// Reply to clients when a command commits rather than when it executes.
    pub reply_when_commit: bool,

    /// How many times a request may be forwarded between replicas before it is answered with a leader hint.
    pub max_forwards: u8,
}

/// Selects a leader migration policy.
#[derive(Clone, Debug, PartialEq)]
pub enum PolicyConfig {
    /// Never migrate.
    Null,

    /// Migrate after `threshold` consecutive requests from the same remote zone.
    Consecutive { threshold: usize },

    /// Migrate to a zone issuing a strict majority of the requests seen within `window`.
    Majority { window: Duration },

    /// Migrate when the exponential moving average of request zones, weighted by `alpha`, settles on a new zone.
    Ema { alpha: f64 },
}

/// An invalid [`Config`] or [`PolicyConfig`].
#[derive(Debug, PartialEq)]
pub enum ConfigError {
    EmptyTopology,
    /// More zone failures tolerated than the topology has zones.
    ZoneFailures { fz: usize, zones: usize },
    InvalidPolicy(String),
}

//
// Config impls
//

impl Config {
    /// A configuration for `topology` with majority quorums, no migration and default timings.
    pub fn new(topology: Topology) -> Self {
        Self {
            topology,
            fz: 0,
            policy: PolicyConfig::Null,
            backoff: Duration::from_millis(100),
            leader_timeout: Duration::from_secs(1),
            reply_when_commit: false,
            max_forwards: 3,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let zones = self.topology.z();
        if zones == 0 {
            return Err(ConfigError::EmptyTopology);
        }
        if self.fz > 0 && self.fz >= zones {
            return Err(ConfigError::ZoneFailures { fz: self.fz, zones });
        }
        self.policy.validate()
    }

    pub fn q1(&self, quorum: &QuorumCertificate) -> bool {
        quorum.q1(&self.topology, self.fz)
    }

    pub fn q2(&self, quorum: &QuorumCertificate) -> bool {
        quorum.q2(&self.topology, self.fz)
    }
}

//
// PolicyConfig impls
//

impl PolicyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            PolicyConfig::Null => Ok(()),
            PolicyConfig::Consecutive { threshold } if threshold > 0 => Ok(()),
            PolicyConfig::Majority { window } if window > Duration::from_secs(0) => Ok(()),
            PolicyConfig::Ema { alpha } if alpha > 0.0 && alpha <= 1.0 => Ok(()),
            _ => Err(ConfigError::InvalidPolicy(self.to_string())),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        PolicyConfig::Null
    }
}

impl fmt::Display for PolicyConfig {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyConfig::Null => write!(fmt, "null"),
            PolicyConfig::Consecutive { threshold } => write!(fmt, "consecutive:{}", threshold),
            PolicyConfig::Majority { window } => write!(fmt, "majority:{}", window.as_millis()),
            PolicyConfig::Ema { alpha } => write!(fmt, "ema:{}", alpha),
        }
    }
}

/// Parses `null`, `consecutive:<requests>`, `majority:<window millis>` or `ema:<alpha>`.
impl FromStr for PolicyConfig {
    type Err = ConfigError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidPolicy(text.to_string());
        let mut parts = text.trim().splitn(2, ':');
        let name = parts.next().unwrap_or_default();
        let arg = parts.next();
        let policy = match (name, arg) {
            ("null", None) => PolicyConfig::Null,
            ("consecutive", Some(arg)) => PolicyConfig::Consecutive {
                threshold: arg.parse().map_err(|_| invalid())?,
            },
            ("majority", Some(arg)) => PolicyConfig::Majority {
                window: Duration::from_millis(arg.parse().map_err(|_| invalid())?),
            },
            ("ema", Some(arg)) => PolicyConfig::Ema {
                alpha: arg.parse().map_err(|_| invalid())?,
            },
            _ => return Err(invalid()),
        };
        policy.validate()?;
        Ok(policy)
    }
}

//
// ConfigError impls
//

impl fmt::Display for ConfigError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::EmptyTopology => write!(fmt, "topology has no replicas"),
            ConfigError::ZoneFailures { fz, zones } => write!(
                fmt,
                "cannot tolerate {} zone failures with {} zones",
                fz, zones
            ),
            ConfigError::InvalidPolicy(text) => write!(fmt, "invalid migration policy `{}`", text),
        }
    }
}

impl Error for ConfigError {}
