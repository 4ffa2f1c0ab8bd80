//! Client-side operation histories.
//!
//! Every completed operation is recorded with its invocation and completion times and the slot it was ordered at. A
//! [`History`] can then be checked for anomalies: within one key, slots give the order the replicas agreed on, so
//! real-time order must not contradict slot order, and every read must see the latest write ordered before it.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};

use paxos::message::{Key, Op, Slot};
use paxos::{Command, NodeId};

/// One completed client operation.
#[derive(Clone, Debug, PartialEq)]
pub struct Operation {
    pub command: Command,
    /// The value read, replaced or removed.
    pub value: Option<Bytes>,
    pub slot: Slot,
    pub leader: Option<NodeId>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Operations grouped by key, in completion order.
#[derive(Clone, Debug, Default)]
pub struct History {
    shards: BTreeMap<Key, Vec<Operation>>,
}

/// An inconsistency found in a [`History`].
#[derive(Clone, Debug, PartialEq)]
pub enum Anomaly {
    /// `first` completed before `second` started, yet was ordered after it.
    Reordered { first: Operation, second: Operation },
    /// The operation observed a value other than the one left by the writes ordered before it.
    StaleValue { operation: Operation, expected: Option<Bytes> },
}

impl Operation {
    pub fn happens_before(&self, other: &Operation) -> bool {
        self.end < other.start
    }

    pub fn concurrent(&self, other: &Operation) -> bool {
        !self.happens_before(other) && !other.happens_before(self)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{} at slot {}, value={:?}, start={}, end={}}}",
            self.command,
            self.slot,
            self.value,
            self.start.to_rfc3339(),
            self.end.to_rfc3339()
        )
    }
}

impl History {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, operation: Operation) {
        self.shards
            .entry(operation.command.key)
            .or_insert_with(Vec::new)
            .push(operation);
    }

    /// Appends every operation of `other`.
    pub fn merge(&mut self, other: History) {
        for (key, operations) in other.shards {
            self.shards.entry(key).or_insert_with(Vec::new).extend(operations);
        }
    }

    pub fn operations(&self, key: Key) -> &[Operation] {
        self.shards.get(&key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn keys(&self) -> impl Iterator<Item = Key> + '_ {
        self.shards.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.shards.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Checks every key independently. Commands executed more than once, as a retried request can be, leave gaps
    /// in what the history knows and may be reported as stale values.
    pub fn anomalies(&self) -> Vec<Anomaly> {
        let mut anomalies = Vec::new();
        for operations in self.shards.values() {
            let mut ordered: Vec<&Operation> = operations.iter().collect();
            ordered.sort_by_key(|operation| operation.slot);

            for (position, later) in ordered.iter().enumerate() {
                for earlier in &ordered[..position] {
                    if later.happens_before(earlier) {
                        anomalies.push(Anomaly::Reordered {
                            first: (*later).clone(),
                            second: (*earlier).clone(),
                        });
                    }
                }
            }

            let mut current: Option<Bytes> = None;
            for operation in ordered {
                if operation.value != current {
                    anomalies.push(Anomaly::StaleValue {
                        operation: operation.clone(),
                        expected: current.clone(),
                    });
                }
                match &operation.command.op {
                    Op::Put(value) => current = Some(value.clone()),
                    Op::Delete => current = None,
                    Op::Get | Op::Noop => {}
                }
            }
        }
        anomalies
    }
}
