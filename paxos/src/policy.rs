//! Leader migration policies.
//!
//! A key's leader feeds the zone of every client request it serves into a [`Policy`]. When the policy decides that
//! another zone dominates the key's traffic it names a replica of that zone, and the leader hands the key over with a
//! [`LeaderChange`](crate::message::LeaderChange).

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::PolicyConfig;
use crate::id::NodeId;

/// Observes request origins and decides when a key's leadership should move.
pub trait Policy: Send {
    /// Records a request from `zone` at `now`, returning the replica leadership should move to, if any.
    fn observe(&mut self, zone: u16, now: Instant) -> Option<NodeId>;
}

/// Builds the policy selected by `config`, starting its clock at `now`.
pub fn new_policy(config: &PolicyConfig, now: Instant) -> Box<dyn Policy> {
    match *config {
        PolicyConfig::Null => Box::new(Null),
        PolicyConfig::Consecutive { threshold } => Box::new(Consecutive::new(threshold)),
        PolicyConfig::Majority { window } => Box::new(Majority::new(window, now)),
        PolicyConfig::Ema { alpha } => Box::new(MovingAverage::new(alpha)),
    }
}

/// The replica a key migrates to when its traffic settles in `zone`.
fn target(zone: u16) -> NodeId {
    NodeId::new(zone, 1)
}

/// Never migrates.
#[derive(Debug, Default)]
pub struct Null;

impl Policy for Null {
    fn observe(&mut self, _zone: u16, _now: Instant) -> Option<NodeId> {
        None
    }
}

/// Migrates after a run of `threshold` consecutive requests from one zone.
#[derive(Debug)]
pub struct Consecutive {
    threshold: usize,
    last: Option<u16>,
    run: usize,
}

impl Consecutive {
    pub fn new(threshold: usize) -> Self {
        Self {
            threshold,
            last: None,
            run: 0,
        }
    }
}

impl Policy for Consecutive {
    fn observe(&mut self, zone: u16, _now: Instant) -> Option<NodeId> {
        if self.last == Some(zone) {
            self.run += 1;
        } else {
            self.last = Some(zone);
            self.run = 1;
        }
        if self.run < self.threshold {
            return None;
        }
        self.last = None;
        self.run = 0;
        Some(target(zone))
    }
}

/// Migrates to a zone issuing strictly more than half of the requests seen in a window.
///
/// The window is checked lazily, on the observation following its expiry, and the histogram restarts with every
/// window whether or not it fired.
#[derive(Debug)]
pub struct Majority {
    window: Duration,
    start: Instant,
    hits: BTreeMap<u16, usize>,
    sum: usize,
}

impl Majority {
    pub fn new(window: Duration, now: Instant) -> Self {
        Self {
            window,
            start: now,
            hits: BTreeMap::new(),
            sum: 0,
        }
    }

    fn reset(&mut self, now: Instant) {
        self.hits.clear();
        self.sum = 0;
        self.start = now;
    }
}

impl Policy for Majority {
    fn observe(&mut self, zone: u16, now: Instant) -> Option<NodeId> {
        *self.hits.entry(zone).or_insert(0) += 1;
        self.sum += 1;
        if self.sum <= 1 || now.saturating_duration_since(self.start) < self.window {
            return None;
        }
        let sum = self.sum;
        let winner = self
            .hits
            .iter()
            .find(|&(_, &hits)| hits > sum / 2)
            .map(|(&zone, _)| zone);
        self.reset(now);
        winner.map(target)
    }
}

/// Migrates when the exponential moving average of request zones settles near a new zone number.
#[derive(Debug)]
pub struct MovingAverage {
    alpha: f64,
    average: Option<f64>,
    zone: u16,
}

impl MovingAverage {
    /// How close to an integer the average must be for that zone to count as settled.
    const EPSILON: f64 = 0.1;

    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            average: None,
            zone: 0,
        }
    }
}

impl Policy for MovingAverage {
    fn observe(&mut self, zone: u16, _now: Instant) -> Option<NodeId> {
        let sample = f64::from(zone);
        let average = match self.average {
            None => {
                self.average = Some(sample);
                self.zone = zone;
                return None;
            }
            Some(average) => self.alpha * sample + (1.0 - self.alpha) * average,
        };
        self.average = Some(average);
        let rounded = average.round();
        if (average - rounded).abs() > Self::EPSILON {
            return None;
        }
        let settled = rounded as u16;
        if settled == self.zone {
            return None;
        }
        self.zone = settled;
        Some(target(settled))
    }
}
