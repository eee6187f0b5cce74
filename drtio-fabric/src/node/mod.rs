/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Nodes of the fabric and the tree that connects them.
//!
//! [`Topology`] is an arena of [`NodeInfo`] keyed by [`NodeId`]; nodes refer
//! to each other by id only.  Every satellite hangs off exactly one
//! downstream port of its upstream node:
//!
//! ```text
//!   master(0) ─port 0─► sat(1) ─port 0─► sat(3)
//!             └port 1─► sat(2)
//! ```
//!
//! * [`port`]: upstream side of a link (calibration, TSC load, egress).
//! * [`master`]: the master node.
//! * [`satellite`]: a satellite, including its repeater ports.

pub mod master;
pub mod port;
pub mod satellite;

use std::collections::BTreeMap;
use std::fmt;

use crate::error::DrtioError;
use crate::link::LinkId;

pub use master::Master;
pub use port::{DownstreamPort, PortEvent, PortSettings};
pub use satellite::{Satellite, SatelliteSettings};

/// Number of addressable destinations.
pub const DEST_COUNT: usize = 256;

/// Destination number of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct NodeId(pub u8);

impl NodeId {
    pub const MASTER: NodeId = NodeId(0);
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Master,
    Satellite,
}

/// One node of the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub id: NodeId,
    pub name: String,
    pub role: Role,
    /// The link this node hangs off; `None` for the master.
    pub upstream: Option<LinkId>,
    /// Neighbour on each downstream port, indexed by port number.
    pub ports: Vec<NodeId>,
    /// Hops from the master.
    pub rank: usize,
}

/// The node arena.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    nodes: BTreeMap<NodeId, NodeInfo>,
}

impl Topology {
    /// A topology holding only the master.
    pub fn new(master_name: impl Into<String>) -> Self {
        let master = NodeInfo {
            id: NodeId::MASTER,
            name: master_name.into(),
            role: Role::Master,
            upstream: None,
            ports: Vec::new(),
            rank: 0,
        };
        Self {
            nodes: BTreeMap::from([(NodeId::MASTER, master)]),
        }
    }

    /// Attach `id` to the next free downstream port of `upstream`.
    pub fn add_satellite(
        &mut self,
        id: NodeId,
        name: impl Into<String>,
        upstream: NodeId,
    ) -> Result<LinkId, DrtioError> {
        if self.nodes.contains_key(&id) {
            return Err(DrtioError::Config(format!("node {id} defined twice")));
        }
        let parent = self
            .nodes
            .get_mut(&upstream)
            .ok_or_else(|| DrtioError::Config(format!("upstream node {upstream} of {id} is not defined")))?;
        let port = u8::try_from(parent.ports.len())
            .map_err(|_| DrtioError::Config(format!("node {upstream} has too many ports")))?;
        parent.ports.push(id);
        let rank = parent.rank + 1;
        let link = LinkId::new(upstream, port);
        self.nodes.insert(
            id,
            NodeInfo {
                id,
                name: name.into(),
                role: Role::Satellite,
                upstream: Some(link),
                ports: Vec::new(),
                rank,
            },
        );
        Ok(link)
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeInfo> {
        self.nodes.get(&id)
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.nodes.contains_key(&id)
    }

    /// Every node, by id.
    pub fn nodes(&self) -> impl Iterator<Item = &NodeInfo> {
        self.nodes.values()
    }

    /// Satellites ordered by rank (closest to the master first), then id.
    pub fn satellites_by_rank(&self) -> Vec<&NodeInfo> {
        let mut sats: Vec<&NodeInfo> = self
            .nodes
            .values()
            .filter(|n| n.role == Role::Satellite)
            .collect();
        sats.sort_by_key(|n| (n.rank, n.id));
        sats
    }

    /// Node on the far end of `node`'s downstream port `port`.
    pub fn neighbour(&self, node: NodeId, port: u8) -> Option<NodeId> {
        self.nodes
            .get(&node)
            .and_then(|n| n.ports.get(usize::from(port)))
            .copied()
    }

    /// `root` and every node below it.
    pub fn subtree(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            if let Some(n) = self.nodes.get(&id) {
                out.push(id);
                stack.extend(n.ports.iter().rev().copied());
            }
        }
        out
    }

    /// `link` and every link below its downstream node.
    pub fn links_below(&self, link: LinkId) -> Vec<LinkId> {
        let mut out = vec![link];
        if let Some(child) = self.neighbour(link.node, link.port) {
            for id in self.subtree(child) {
                if let Some(n) = self.nodes.get(&id) {
                    out.extend((0..n.ports.len()).map(|p| LinkId::new(id, p as u8)));
                }
            }
        }
        out
    }

    /// Every link of the tree.
    pub fn links(&self) -> Vec<LinkId> {
        self.nodes
            .values()
            .flat_map(|n| (0..n.ports.len()).map(move |p| LinkId::new(n.id, p as u8)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> Topology {
        let mut t = Topology::new("master");
        t.add_satellite(NodeId(1), "a", NodeId(0)).unwrap();
        t.add_satellite(NodeId(2), "b", NodeId(0)).unwrap();
        t.add_satellite(NodeId(3), "c", NodeId(1)).unwrap();
        t
    }

    #[test]
    fn ports_are_assigned_in_order() {
        let t = tree();
        assert_eq!(t.neighbour(NodeId(0), 0), Some(NodeId(1)));
        assert_eq!(t.neighbour(NodeId(0), 1), Some(NodeId(2)));
        assert_eq!(t.neighbour(NodeId(1), 0), Some(NodeId(3)));
        assert_eq!(t.node(NodeId(3)).unwrap().upstream, Some(LinkId::new(NodeId(1), 0)));
        assert_eq!(t.node(NodeId(3)).unwrap().rank, 2);
    }

    #[test]
    fn satellites_come_in_rank_order() {
        let ids: Vec<NodeId> = tree().satellites_by_rank().iter().map(|n| n.id).collect();
        assert_eq!(ids, vec![NodeId(1), NodeId(2), NodeId(3)]);
    }

    #[test]
    fn subtree_and_links_below() {
        let t = tree();
        assert_eq!(t.subtree(NodeId(1)), vec![NodeId(1), NodeId(3)]);
        assert_eq!(
            t.links_below(LinkId::new(NodeId(0), 0)),
            vec![LinkId::new(NodeId(0), 0), LinkId::new(NodeId(1), 0)]
        );
        assert_eq!(t.links().len(), 3);
    }

    #[test]
    fn duplicate_and_orphan_nodes_are_rejected() {
        let mut t = tree();
        assert!(matches!(
            t.add_satellite(NodeId(1), "again", NodeId(0)),
            Err(DrtioError::Config(_))
        ));
        assert!(matches!(
            t.add_satellite(NodeId(9), "orphan", NodeId(42)),
            Err(DrtioError::Config(_))
        ));
    }
}
