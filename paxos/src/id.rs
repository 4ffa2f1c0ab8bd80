//! Replica and client identities.
//!
//! A replica is named by its zone and its position within the zone, both numbered from 1. The text form of a
//! [`NodeId`] is `"zone.node"`.

use std::error::Error;
use std::fmt;
use std::num::ParseIntError;
use std::str::FromStr;

/// The identity of a replica within a zoned group.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct NodeId {
    /// The zone (datacenter or region) hosting the replica.
    pub zone: u16,

    /// The index of the replica within its zone.
    pub node: u16,
}

/// The identity of a client, which lives in exactly one zone.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ClientId {
    /// The zone the client issues its requests from.
    pub zone: u16,

    /// A number distinguishing clients of the same zone.
    pub id: u32,
}

/// An error returned when parsing a [`NodeId`] from text.
#[derive(Debug, PartialEq)]
pub enum IdParseError {
    /// The text is not of the form `zone.node`.
    Format(String),
    /// One of the components is not a valid integer.
    Int(ParseIntError),
}

//
// NodeId impls
//

impl NodeId {
    pub const fn new(zone: u16, node: u16) -> Self {
        Self { zone, node }
    }

    /// Packs the identity into 32 bits, zone in the high half.
    pub const fn to_bits(self) -> u32 {
        (self.zone as u32) << 16 | self.node as u32
    }

    pub const fn from_bits(bits: u32) -> Self {
        Self {
            zone: (bits >> 16) as u16,
            node: bits as u16,
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "{}.{}", self.zone, self.node)
    }
}

impl FromStr for NodeId {
    type Err = IdParseError;

    fn from_str(text: &str) -> Result<Self, Self::Err> {
        let mut parts = text.trim().split('.');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(zone), Some(node), None) => Ok(Self {
                zone: zone.parse()?,
                node: node.parse()?,
            }),
            _ => Err(IdParseError::Format(text.to_string())),
        }
    }
}

//
// ClientId impls
//

impl ClientId {
    pub const fn new(zone: u16, id: u32) -> Self {
        Self { zone, id }
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(fmt, "client {}.{}", self.zone, self.id)
    }
}

//
// IdParseError impls
//

impl fmt::Display for IdParseError {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdParseError::Format(text) => write!(fmt, "expected `zone.node`, got `{}`", text),
            IdParseError::Int(err) => write!(fmt, "invalid id component: {}", err),
        }
    }
}

impl Error for IdParseError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            IdParseError::Format(_) => None,
            IdParseError::Int(err) => Some(err),
        }
    }
}

impl From<ParseIntError> for IdParseError {
    fn from(err: ParseIntError) -> Self {
        IdParseError::Int(err)
    }
}
