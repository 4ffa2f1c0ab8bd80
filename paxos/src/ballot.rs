//! Ballot numbers.
//!
//! A [`Ballot`] packs a 32-bit round counter above the 32-bit identity of the replica which issued it, so that
//! ballots compare first by counter and then by issuer, and two replicas never issue equal ballots.

use std::error::Error;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

use crate::id::NodeId;

/// A totally ordered, globally unique ballot number.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct Ballot(u64);

/// An error returned when parsing a [`Ballot`] from its `counter.zone.node` text form.
#[derive(Debug, PartialEq)]
pub enum BallotParseError {
    Format(String),
    Int(ParseIntError),
}

impl Ballot {
    /// The ballot no replica has issued yet.
    pub const ZERO: Ballot = Ballot(0);

    pub fn new(counter: u32, id: NodeId) -> Self {
        Ballot((counter as u64) << 32 | id.to_bits() as u64)
    }

    pub fn counter(self) -> u32 {
        (self.0 >> 32) as u32
    }

    /// The replica which issued this ballot, and thus the leader it elects.
    pub fn id(self) -> NodeId {
        NodeId::from_bits(self.0 as u32)
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Returns the ballot following `self` when issued by `id`, or `None` if the counter is exhausted.
    pub fn checked_next(self, id: NodeId) -> Option<Self> {
        self.counter().checked_add(1).map(|counter| Ballot::new(counter, id))
    }

    /// Returns the ballot following `self` when issued by `id`.
    ///
    /// # Panics
    ///
    /// Panics if the round counter overflows.
    pub fn next(self, id: NodeId) -> Self {
        self.checked_next(id)
            .unwrap_or_else(|| panic!("ballot counter overflow after {}", self))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn from_u64(bits: u64) -> Self {
        Ballot(bits)
    }
}

impl fmt::Display for Ballot {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let id = self.id();
        write!(fmt, "{}.{}.{}", self.counter(), id.zone, id.node)
    }
}

impl FromStr for Ballot {
    type Err = BallotParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = text.trim().split('.').collect();
        match parts.as_slice() {
            [counter, zone, node] => Ok(Ballot::new(
                counter.parse()?,
                NodeId::new(zone.parse()?, node.parse()?),
            )),
            _ => Err(BallotParseError::Format(text.to_string())),
        }
    }
}

//
// BallotParseError impls
//

impl fmt::Display for BallotParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BallotParseError::Format(text) => {
                write!(fmt, "expected `counter.zone.node`, got `{}`", text)
            }
            BallotParseError::Int(err) => write!(fmt, "invalid ballot component: {}", err),
        }
    }
}

impl Error for BallotParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            BallotParseError::Format(_) => None,
            BallotParseError::Int(err) => Some(err),
        }
    }
}

impl From<ParseIntError> for BallotParseError {
    fn from(err: ParseIntError) -> Self {
        BallotParseError::Int(err)
    }
}
