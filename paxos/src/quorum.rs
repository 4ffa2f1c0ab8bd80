//! Quorum certificates over a zoned replica group.
//!
//! A [`QuorumCertificate`] accumulates acknowledgements from replicas and answers whether they satisfy one of the
//! quorum systems below, evaluated against a [`Topology`]:
//!
//! * **majority**: strictly more than half of all replicas.
//! * **Q1(F)**: local majorities in at least `Z - F` zones, used for phase 1 (leader election).
//! * **Q2(F)**: local majorities in at least `F + 1` zones, used for phase 2 (value acceptance).
//!
//! Any Q1(F) and any Q2(F) certificate share a zone in which both hold a local majority, and so share at least one
//! replica. With `F = 0` both degenerate to a plain majority.

use std::collections::{BTreeMap, BTreeSet};

use crate::id::NodeId;

/// The zone layout of a replica group: how many replicas each zone hosts.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Topology {
    zones: BTreeMap<u16, usize>,
}

/// A set of replicas which acknowledged (or refused) some proposal.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct QuorumCertificate {
    acks: BTreeSet<NodeId>,
    nacks: BTreeSet<NodeId>,
}

//
// Topology impls
//

impl Topology {
    /// A topology of `zones` zones numbered from 1, each hosting `nodes_per_zone` replicas numbered from 1.
    pub fn uniform(zones: u16, nodes_per_zone: u16) -> Self {
        Self::from_zones((1..=zones).map(|zone| (zone, nodes_per_zone)))
    }

    /// A topology from explicit `(zone, replica count)` pairs. Zones hosting no replicas are left out.
    pub fn from_zones<I: IntoIterator<Item = (u16, u16)>>(zones: I) -> Self {
        let zones = zones
            .into_iter()
            .filter(|&(_, count)| count > 0)
            .map(|(zone, count)| (zone, count as usize))
            .collect();
        Self { zones }
    }

    /// The total number of replicas.
    pub fn n(&self) -> usize {
        self.zones.values().sum()
    }

    /// The number of zones.
    pub fn z(&self) -> usize {
        self.zones.len()
    }

    /// The number of replicas in `zone`, zero if the zone is unknown.
    pub fn npz(&self, zone: u16) -> usize {
        self.zones.get(&zone).copied().unwrap_or(0)
    }

    pub fn zones(&self) -> impl Iterator<Item = u16> + '_ {
        self.zones.keys().copied()
    }

    /// Every replica of the group, zone by zone.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.zones
            .iter()
            .flat_map(|(&zone, &count)| (1..=count as u16).map(move |node| NodeId::new(zone, node)))
    }

    pub fn contains(&self, id: NodeId) -> bool {
        id.node >= 1 && id.node as usize <= self.npz(id.zone)
    }
}

//
// QuorumCertificate impls
//

impl QuorumCertificate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records an acknowledgement from `id`. Returns `false` if `id` had already acknowledged.
    pub fn ack(&mut self, id: NodeId) -> bool {
        self.acks.insert(id)
    }

    /// Records a refusal from `id`. Refusals are kept for inspection only and never count toward any quorum.
    pub fn nack(&mut self, id: NodeId) -> bool {
        self.nacks.insert(id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.acks.contains(&id)
    }

    /// The number of distinct acknowledging replicas.
    pub fn size(&self) -> usize {
        self.acks.len()
    }

    pub fn acks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.acks.iter().copied()
    }

    pub fn nacks(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nacks.iter().copied()
    }

    pub fn reset(&mut self) {
        self.acks.clear();
        self.nacks.clear();
    }

    /// Strictly more than half of all replicas acknowledged.
    pub fn majority(&self, topology: &Topology) -> bool {
        self.members(topology) > topology.n() / 2
    }

    /// Every replica acknowledged.
    pub fn all(&self, topology: &Topology) -> bool {
        topology.nodes().all(|id| self.contains(id))
    }

    /// All replicas but at most one acknowledged.
    pub fn fast_quorum(&self, topology: &Topology) -> bool {
        let members = self.members(topology);
        members > 0 && members + 1 >= topology.n()
    }

    /// At least three quarters of all replicas acknowledged.
    pub fn fast_path(&self, topology: &Topology) -> bool {
        let members = self.members(topology);
        members > 0 && members * 4 >= topology.n() * 3
    }

    /// Every zone has at least one acknowledging replica.
    pub fn all_zones(&self, topology: &Topology) -> bool {
        topology.zones().all(|zone| self.zone_count(topology, zone) > 0)
    }

    /// Some zone has a local majority.
    pub fn zone_majority(&self, topology: &Topology) -> bool {
        self.majority_zones(topology) > 0
    }

    /// A grid row: one replica in every zone.
    pub fn grid_row(&self, topology: &Topology) -> bool {
        self.all_zones(topology)
    }

    /// A grid column: every replica of some zone.
    pub fn grid_column(&self, topology: &Topology) -> bool {
        topology
            .zones()
            .any(|zone| self.zone_count(topology, zone) == topology.npz(zone))
    }

    /// Phase-1 quorum tolerating `fz` zone failures.
    pub fn q1(&self, topology: &Topology, fz: usize) -> bool {
        if fz == 0 {
            return self.majority(topology);
        }
        self.majority_zones(topology) >= topology.z().saturating_sub(fz)
    }

    /// Phase-2 quorum tolerating `fz` zone failures.
    pub fn q2(&self, topology: &Topology, fz: usize) -> bool {
        if fz == 0 {
            return self.majority(topology);
        }
        self.majority_zones(topology) > fz
    }

    /// The number of acknowledging replicas which belong to `topology`.
    fn members(&self, topology: &Topology) -> usize {
        topology.zones().map(|zone| self.zone_count(topology, zone)).sum()
    }

    /// The number of acknowledging replicas of `zone` which belong to `topology`.
    fn zone_count(&self, topology: &Topology, zone: u16) -> usize {
        match topology.npz(zone) {
            0 => 0,
            count => self
                .acks
                .range(NodeId::new(zone, 1)..=NodeId::new(zone, count as u16))
                .count(),
        }
    }

    /// The number of zones of `topology` in which a strict local majority acknowledged.
    fn majority_zones(&self, topology: &Topology) -> usize {
        topology
            .zones()
            .filter(|&zone| self.zone_count(topology, zone) > topology.npz(zone) / 2)
            .count()
    }
}
