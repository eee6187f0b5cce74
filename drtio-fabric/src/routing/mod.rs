/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Routing tables and the routing snapshot.
//!
//! Every node holds a [`RoutingTable`]: one [`NextHop`] per destination.  The
//! master combines all tables into a [`RoutingSnapshot`] which also precomputes
//! the link path to every destination and carries the channel → owner map.
//!
//! ## Atomic replacement
//!
//! [`Router`] publishes the snapshot behind `RwLock<Arc<_>>`.  A routing write:
//!
//! ```text
//!  stage(new)          pause affected destinations (submit → RouteBusy)
//!      │
//!  try_commit() ...    each tick: commit once in-flight(dest) == 0 for all affected
//!      │
//!  swap + unpause      destinations that do not cross a changed satellite
//!      │
//!  acknowledge() ...   one RoutingAck per changed satellite table
//!      │
//!  unpause             the rest
//! ```
//!
//! A command therefore uses the snapshot in force when it was accepted, and
//! one destination never has commands in flight on two different paths.  A
//! destination whose new path crosses a satellite with a new table stays
//! paused until that satellite confirmed it installed the table, so no
//! command reaches a satellite still routing by its old table.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info};

use crate::channel::ChannelId;
use crate::error::RoutingError;
use crate::link::LinkId;
use crate::node::{NodeId, Topology, DEST_COUNT};

/// Longest path the validator accepts.
pub const MAX_HOPS: usize = 32;

const WIRE_LOCAL: u8 = 0;
const WIRE_NO_ROUTE: u8 = 0xff;

// ── RoutingTable ──────────────────────────────────────────────────────────────

/// Routing decision of one node for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NextHop {
    /// The destination is this node.
    Local,
    /// Forward through downstream port `p`.
    Port(u8),
    #[default]
    NoRoute,
}

/// One node's destination → next-hop table.
#[derive(Clone, PartialEq, Eq)]
pub struct RoutingTable {
    entries: Vec<NextHop>,
}

impl Default for RoutingTable {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RoutingTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.routed()).finish()
    }
}

impl RoutingTable {
    /// A table with no routes.
    pub fn new() -> Self {
        Self {
            entries: vec![NextHop::NoRoute; DEST_COUNT],
        }
    }

    pub fn get(&self, destination: NodeId) -> NextHop {
        self.entries[usize::from(destination.0)]
    }

    pub fn set(&mut self, destination: NodeId, hop: NextHop) {
        self.entries[usize::from(destination.0)] = hop;
    }

    /// Entries other than `NoRoute`.
    pub fn routed(&self) -> impl Iterator<Item = (NodeId, NextHop)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, h)| **h != NextHop::NoRoute)
            .map(|(d, h)| (NodeId(d as u8), *h))
    }

    /// Wire form: one byte per destination, `0` local, `p + 1` port,
    /// `0xff` no route.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.entries
            .iter()
            .map(|h| match h {
                NextHop::Local => WIRE_LOCAL,
                NextHop::Port(p) => p.saturating_add(1),
                NextHop::NoRoute => WIRE_NO_ROUTE,
            })
            .collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RoutingError> {
        if bytes.len() != DEST_COUNT {
            return Err(RoutingError::MalformedTable(format!(
                "expected {DEST_COUNT} entries, got {}",
                bytes.len()
            )));
        }
        let entries = bytes
            .iter()
            .map(|b| match *b {
                WIRE_LOCAL => NextHop::Local,
                WIRE_NO_ROUTE => NextHop::NoRoute,
                p => NextHop::Port(p - 1),
            })
            .collect();
        Ok(Self { entries })
    }
}

/// The tables of every node in the topology.
pub type RoutingTables = BTreeMap<NodeId, RoutingTable>;

/// Tables derived from the tree: each node routes its own id locally and
/// every node of a child's subtree through the port of that child.
pub fn default_tables(topology: &Topology) -> RoutingTables {
    topology
        .nodes()
        .map(|info| {
            let mut table = RoutingTable::new();
            table.set(info.id, NextHop::Local);
            for (port, child) in info.ports.iter().enumerate() {
                for d in topology.subtree(*child) {
                    table.set(d, NextHop::Port(port as u8));
                }
            }
            (info.id, table)
        })
        .collect()
}

// ── Path resolution ───────────────────────────────────────────────────────────

/// Resolved path from the master to one destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub destination: NodeId,
    /// Links in travel order; the first one is a master port.
    pub links: Vec<LinkId>,
}

/// Follow `tables` from the master towards `destination`.
///
/// `Ok(None)` means some node on the way has no route.  Loops, missing ports
/// and local entries at the wrong node are errors.
pub fn path(
    topology: &Topology,
    tables: &RoutingTables,
    destination: NodeId,
) -> Result<Option<Route>, RoutingError> {
    let mut at = NodeId::MASTER;
    let mut links = Vec::new();
    let mut visited = BTreeSet::from([at]);
    loop {
        let hop = tables
            .get(&at)
            .map_or(NextHop::NoRoute, |t| t.get(destination));
        match hop {
            NextHop::NoRoute => return Ok(None),
            NextHop::Local if at == destination => {
                return Ok(Some(Route { destination, links }))
            }
            NextHop::Local => return Err(RoutingError::Misrouted { destination, at }),
            NextHop::Port(port) => {
                let next = topology
                    .neighbour(at, port)
                    .ok_or(RoutingError::UnknownPort { node: at, port })?;
                links.push(LinkId::new(at, port));
                if !visited.insert(next) {
                    return Err(RoutingError::Loop { destination, at });
                }
                if links.len() > MAX_HOPS {
                    return Err(RoutingError::HopLimit {
                        destination,
                        max: MAX_HOPS,
                    });
                }
                at = next;
            }
        }
    }
}

/// Check a complete set of tables against the topology.
pub fn validate(topology: &Topology, tables: &RoutingTables) -> Result<(), RoutingError> {
    let master = tables
        .get(&NodeId::MASTER)
        .ok_or(RoutingError::MasterNotLocal)?;
    if master.get(NodeId::MASTER) != NextHop::Local {
        return Err(RoutingError::MasterNotLocal);
    }
    for (node, table) in tables {
        let info = topology.node(*node).ok_or(RoutingError::UnknownNode(*node))?;
        for (_, hop) in table.routed() {
            if let NextHop::Port(port) = hop {
                if usize::from(port) >= info.ports.len() {
                    return Err(RoutingError::UnknownPort { node: *node, port });
                }
            }
        }
    }
    for (destination, _) in master.routed() {
        path(topology, tables, destination)?;
    }
    Ok(())
}

// ── RoutingSnapshot ───────────────────────────────────────────────────────────

/// Everything the interconnect needs to route one command, immutable once
/// published.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingSnapshot {
    version: u64,
    tables: RoutingTables,
    channels: BTreeMap<ChannelId, NodeId>,
    routes: BTreeMap<NodeId, Route>,
}

impl RoutingSnapshot {
    /// Validate `tables` and precompute the path to every routed destination.
    pub fn build(
        topology: &Topology,
        tables: RoutingTables,
        channels: BTreeMap<ChannelId, NodeId>,
        version: u64,
    ) -> Result<Self, RoutingError> {
        validate(topology, &tables)?;
        let mut routes = BTreeMap::new();
        for info in topology.nodes() {
            if let Some(route) = path(topology, &tables, info.id)? {
                routes.insert(info.id, route);
            }
        }
        Ok(Self {
            version,
            tables,
            channels,
            routes,
        })
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Node owning `channel`.
    pub fn owner(&self, channel: ChannelId) -> Option<NodeId> {
        self.channels.get(&channel).copied()
    }

    pub fn route(&self, destination: NodeId) -> Option<&Route> {
        self.routes.get(&destination)
    }

    pub fn table(&self, node: NodeId) -> Option<&RoutingTable> {
        self.tables.get(&node)
    }

    pub fn tables(&self) -> &RoutingTables {
        &self.tables
    }

    pub fn channels(&self) -> &BTreeMap<ChannelId, NodeId> {
        &self.channels
    }

    /// Destinations whose path or channel ownership differs between `self`
    /// and `next`.
    pub fn affected_by(&self, next: &RoutingSnapshot) -> BTreeSet<NodeId> {
        let mut affected = BTreeSet::new();
        let dests: BTreeSet<NodeId> = self.routes.keys().chain(next.routes.keys()).copied().collect();
        for d in dests {
            if self.routes.get(&d) != next.routes.get(&d) {
                affected.insert(d);
            }
        }
        let channels: BTreeSet<ChannelId> = self
            .channels
            .keys()
            .chain(next.channels.keys())
            .copied()
            .collect();
        for c in channels {
            let (old, new) = (self.owner(c), next.owner(c));
            if old != new {
                affected.extend(old);
                affected.extend(new);
            }
        }
        affected.remove(&NodeId::MASTER);
        affected
    }

    /// Satellites whose own table differs between `self` and `next`.
    pub fn changed_tables(&self, next: &RoutingSnapshot) -> Vec<NodeId> {
        next.tables
            .iter()
            .filter(|(node, table)| **node != NodeId::MASTER && self.tables.get(node) != Some(table))
            .map(|(node, _)| *node)
            .collect()
    }
}

// ── Router ────────────────────────────────────────────────────────────────────

/// A routing update that has been committed.
#[derive(Debug, Clone)]
pub struct CommittedUpdate {
    pub snapshot: Arc<RoutingSnapshot>,
    pub affected: Vec<NodeId>,
    /// Satellites that must receive their new table.
    pub changed_tables: Vec<NodeId>,
    /// Destinations still paused until every changed table is acknowledged.
    pub held: Vec<NodeId>,
}

#[derive(Debug)]
struct AwaitingAcks {
    version: u64,
    nodes: BTreeSet<NodeId>,
    held: BTreeSet<NodeId>,
}

#[derive(Debug)]
struct PendingUpdate {
    next: Arc<RoutingSnapshot>,
    affected: BTreeSet<NodeId>,
}

/// Published snapshot plus the per-destination pause and in-flight state.
#[derive(Debug)]
pub struct Router {
    snapshot: RwLock<Arc<RoutingSnapshot>>,
    paused: Vec<AtomicBool>,
    in_flight: Vec<AtomicUsize>,
    pending: Mutex<Option<PendingUpdate>>,
    awaiting: Mutex<Option<AwaitingAcks>>,
}

impl Router {
    pub fn new(initial: RoutingSnapshot) -> Self {
        Self {
            snapshot: RwLock::new(Arc::new(initial)),
            paused: (0..DEST_COUNT).map(|_| AtomicBool::new(false)).collect(),
            in_flight: (0..DEST_COUNT).map(|_| AtomicUsize::new(0)).collect(),
            pending: Mutex::new(None),
            awaiting: Mutex::new(None),
        }
    }

    /// The snapshot in force.
    pub fn snapshot(&self) -> Arc<RoutingSnapshot> {
        self.snapshot.read().clone()
    }

    /// Register a command towards `destination`.  Fails while an update for
    /// that destination drains.  Every successful call must be matched by one
    /// [`retire`](Self::retire).
    pub fn begin_forward(&self, destination: NodeId) -> bool {
        let i = usize::from(destination.0);
        self.in_flight[i].fetch_add(1, Ordering::SeqCst);
        if self.paused[i].load(Ordering::SeqCst) {
            self.in_flight[i].fetch_sub(1, Ordering::SeqCst);
            return false;
        }
        true
    }

    /// A command towards `destination` arrived or failed.
    pub fn retire(&self, destination: NodeId) {
        let i = usize::from(destination.0);
        let prev = self.in_flight[i].fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "retire without begin_forward");
    }

    pub fn in_flight(&self, destination: NodeId) -> usize {
        self.in_flight[usize::from(destination.0)].load(Ordering::SeqCst)
    }

    pub fn is_paused(&self, destination: NodeId) -> bool {
        self.paused[usize::from(destination.0)].load(Ordering::SeqCst)
    }

    /// An update is staged, or committed but not yet acknowledged by every
    /// satellite whose table changed.
    pub fn has_pending(&self) -> bool {
        self.pending.lock().is_some() || self.awaiting.lock().is_some()
    }

    /// Satellites whose acknowledgement of the last commit is outstanding.
    pub fn awaiting_acks(&self) -> Vec<NodeId> {
        self.awaiting
            .lock()
            .as_ref()
            .map(|a| a.nodes.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Stage `next` and pause the destinations it affects.  Returns them.
    pub fn stage(&self, next: RoutingSnapshot) -> Result<Vec<NodeId>, RoutingError> {
        let mut pending = self.pending.lock();
        if pending.is_some() || self.awaiting.lock().is_some() {
            return Err(RoutingError::UpdatePending);
        }
        let affected = self.snapshot().affected_by(&next);
        for d in &affected {
            self.paused[usize::from(d.0)].store(true, Ordering::SeqCst);
        }
        info!(
            version = next.version(),
            affected = ?affected,
            "routing update staged"
        );
        let list = affected.iter().copied().collect();
        *pending = Some(PendingUpdate {
            next: Arc::new(next),
            affected,
        });
        Ok(list)
    }

    /// Publish the staged snapshot if every affected destination drained.
    pub fn try_commit(&self) -> Option<CommittedUpdate> {
        let mut pending = self.pending.lock();
        let update = pending.as_ref()?;
        if let Some(busy) = update.affected.iter().find(|d| self.in_flight(**d) > 0) {
            debug!(destination = %busy, in_flight = self.in_flight(*busy), "routing update draining");
            return None;
        }
        let update = pending.take()?;
        let previous = std::mem::replace(&mut *self.snapshot.write(), update.next.clone());
        let changed_tables = previous.changed_tables(&update.next);
        let changed: BTreeSet<NodeId> = changed_tables.iter().copied().collect();
        let held: BTreeSet<NodeId> = update
            .affected
            .iter()
            .copied()
            .filter(|d| crosses(&update.next, *d, &changed))
            .collect();
        for d in update.affected.difference(&held) {
            self.paused[usize::from(d.0)].store(false, Ordering::SeqCst);
        }
        if !changed.is_empty() {
            *self.awaiting.lock() = Some(AwaitingAcks {
                version: update.next.version(),
                nodes: changed,
                held: held.clone(),
            });
        }
        info!(
            version = update.next.version(),
            changed = ?changed_tables,
            held = ?held,
            "✓ routing update committed"
        );
        Some(CommittedUpdate {
            snapshot: update.next,
            affected: update.affected.into_iter().collect(),
            changed_tables,
            held: held.into_iter().collect(),
        })
    }

    /// Record that `node` answered the table of snapshot `version`.  Once the
    /// last outstanding answer arrives the held destinations are unpaused and
    /// returned.  Answers for another version are ignored.
    pub fn acknowledge(&self, node: NodeId, version: u64) -> Option<Vec<NodeId>> {
        let mut awaiting = self.awaiting.lock();
        let state = awaiting.as_mut()?;
        if state.version != version || !state.nodes.remove(&node) {
            debug!(%node, version, "stale routing acknowledgement");
            return None;
        }
        if !state.nodes.is_empty() {
            return None;
        }
        let done = awaiting.take()?;
        for d in &done.held {
            self.paused[usize::from(d.0)].store(false, Ordering::SeqCst);
        }
        info!(version, released = ?done.held, "✓ routing update applied everywhere");
        Some(done.held.into_iter().collect())
    }
}

/// `destination` is, or is reached through, one of `nodes` in `snapshot`.
fn crosses(snapshot: &RoutingSnapshot, destination: NodeId, nodes: &BTreeSet<NodeId>) -> bool {
    nodes.contains(&destination)
        || snapshot
            .route(destination)
            .is_some_and(|r| r.links.iter().any(|l| nodes.contains(&l.node)))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    /// master ─p0─ 1 ─p0─ 3
    ///        └p1─ 2
    fn topology() -> Topology {
        let mut t = Topology::new("master");
        t.add_satellite(NodeId(1), "sat1", NodeId(0)).unwrap();
        t.add_satellite(NodeId(2), "sat2", NodeId(0)).unwrap();
        t.add_satellite(NodeId(3), "sat3", NodeId(1)).unwrap();
        t
    }

    fn channels() -> BTreeMap<ChannelId, NodeId> {
        BTreeMap::from([(ChannelId(7), NodeId(3)), (ChannelId(8), NodeId(2))])
    }

    #[test]
    fn default_tables_follow_the_tree() {
        let t = topology();
        let tables = default_tables(&t);
        let master = &tables[&NodeId(0)];
        assert_eq!(master.get(NodeId(0)), NextHop::Local);
        assert_eq!(master.get(NodeId(3)), NextHop::Port(0));
        assert_eq!(master.get(NodeId(2)), NextHop::Port(1));
        assert_eq!(tables[&NodeId(1)].get(NodeId(3)), NextHop::Port(0));
        assert_eq!(tables[&NodeId(1)].get(NodeId(2)), NextHop::NoRoute);

        let route = path(&t, &tables, NodeId(3)).unwrap().unwrap();
        assert_eq!(
            route.links,
            vec![LinkId::new(NodeId(0), 0), LinkId::new(NodeId(1), 0)]
        );
    }

    #[test]
    fn wire_form_is_one_byte_per_destination() {
        let mut table = RoutingTable::new();
        table.set(NodeId(0), NextHop::Local);
        table.set(NodeId(5), NextHop::Port(2));
        let bytes = table.to_bytes();
        assert_eq!(bytes.len(), DEST_COUNT);
        assert_eq!(bytes[0], 0);
        assert_eq!(bytes[5], 3);
        assert_eq!(bytes[6], 0xff);
        assert_eq!(RoutingTable::from_bytes(&bytes).unwrap(), table);
        assert!(matches!(
            RoutingTable::from_bytes(&bytes[..10]),
            Err(RoutingError::MalformedTable(_))
        ));
    }

    #[test]
    fn validation_rejects_loops_bad_ports_and_master_entry() {
        let t = topology();

        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(0))
            .unwrap()
            .set(NodeId(0), NextHop::Port(0));
        assert_eq!(validate(&t, &tables), Err(RoutingError::MasterNotLocal));

        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(2))
            .unwrap()
            .set(NodeId(9), NextHop::Port(4));
        assert_eq!(
            validate(&t, &tables),
            Err(RoutingError::UnknownPort {
                node: NodeId(2),
                port: 4
            })
        );

        // master and sat1 send 2 down towards sat3, which claims it locally.
        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(0))
            .unwrap()
            .set(NodeId(2), NextHop::Port(0));
        tables
            .get_mut(&NodeId(1))
            .unwrap()
            .set(NodeId(2), NextHop::Port(0));
        tables
            .get_mut(&NodeId(3))
            .unwrap()
            .set(NodeId(2), NextHop::Local);
        assert_eq!(
            validate(&t, &tables),
            Err(RoutingError::Misrouted {
                destination: NodeId(2),
                at: NodeId(3)
            })
        );
    }

    #[test]
    fn broken_chain_means_no_route() {
        let t = topology();
        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(1))
            .unwrap()
            .set(NodeId(3), NextHop::NoRoute);
        let snap = RoutingSnapshot::build(&t, tables, channels(), 1).unwrap();
        assert!(snap.route(NodeId(3)).is_none());
        assert!(snap.route(NodeId(2)).is_some());
    }

    #[test]
    fn update_waits_for_in_flight_commands() {
        let t = topology();
        let snap = RoutingSnapshot::build(&t, default_tables(&t), channels(), 0).unwrap();
        let router = Router::new(snap.clone());

        assert!(router.begin_forward(NodeId(3)));

        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(0))
            .unwrap()
            .set(NodeId(3), NextHop::NoRoute);
        let next = RoutingSnapshot::build(&t, tables, channels(), 1).unwrap();
        assert_eq!(router.stage(next.clone()).unwrap(), vec![NodeId(3)]);
        assert_eq!(router.stage(next), Err(RoutingError::UpdatePending));

        assert!(!router.begin_forward(NodeId(3)), "paused");
        assert!(router.begin_forward(NodeId(2)), "unaffected");
        router.retire(NodeId(2));

        assert!(router.try_commit().is_none());
        assert_eq!(router.snapshot().version(), 0);

        router.retire(NodeId(3));
        let done = router.try_commit().unwrap();
        assert_eq!(done.affected, vec![NodeId(3)]);
        assert!(done.changed_tables.is_empty());
        assert_eq!(router.snapshot().version(), 1);
        assert!(router.snapshot().route(NodeId(3)).is_none());
        assert!(!router.is_paused(NodeId(3)));
    }

    #[test]
    fn changed_satellite_tables_are_reported() {
        let t = topology();
        let snap = RoutingSnapshot::build(&t, default_tables(&t), channels(), 0).unwrap();
        let router = Router::new(snap);
        let mut tables = default_tables(&t);
        tables
            .get_mut(&NodeId(1))
            .unwrap()
            .set(NodeId(3), NextHop::NoRoute);
        let next = RoutingSnapshot::build(&t, tables, channels(), 1).unwrap();
        router.stage(next).unwrap();
        let done = router.try_commit().unwrap();
        assert_eq!(done.changed_tables, vec![NodeId(1)]);
        assert_eq!(done.affected, vec![NodeId(3)]);
        // No path to 3 any more, nothing to hold.
        assert!(done.held.is_empty());
        assert!(!router.is_paused(NodeId(3)));
        assert!(router.has_pending());
        assert_eq!(router.acknowledge(NodeId(1), 1), Some(Vec::new()));
        assert!(!router.has_pending());
    }

    #[test]
    fn destinations_behind_a_changed_table_wait_for_its_ack() {
        let t = topology();
        let mut cut = default_tables(&t);
        cut.get_mut(&NodeId(1))
            .unwrap()
            .set(NodeId(3), NextHop::NoRoute);
        let snap = RoutingSnapshot::build(&t, cut, channels(), 0).unwrap();
        let router = Router::new(snap);

        // Restore the route through sat1.
        let next = RoutingSnapshot::build(&t, default_tables(&t), channels(), 1).unwrap();
        router.stage(next).unwrap();
        let done = router.try_commit().unwrap();
        assert_eq!(done.changed_tables, vec![NodeId(1)]);
        assert_eq!(done.held, vec![NodeId(3)]);
        assert_eq!(router.snapshot().version(), 1);

        assert!(!router.begin_forward(NodeId(3)), "held until sat1 answers");
        assert!(router.has_pending());
        assert_eq!(router.awaiting_acks(), vec![NodeId(1)]);
        let again = RoutingSnapshot::build(&t, default_tables(&t), channels(), 2).unwrap();
        assert_eq!(router.stage(again), Err(RoutingError::UpdatePending));

        assert_eq!(router.acknowledge(NodeId(1), 0), None, "wrong version");
        assert_eq!(router.acknowledge(NodeId(2), 1), None, "not asked");
        assert!(router.is_paused(NodeId(3)));

        assert_eq!(router.acknowledge(NodeId(1), 1), Some(vec![NodeId(3)]));
        assert!(!router.has_pending());
        assert!(router.begin_forward(NodeId(3)));
        router.retire(NodeId(3));
    }
}
