/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Administrative interface of the fabric, implemented by the master.

use std::collections::BTreeMap;

use crate::aux::RemoteErrorKind;
use crate::error::{DrtioError, RoutingError};
use crate::link::{LinkCounters, LinkId, LinkReport};
use crate::node::NodeId;
use crate::routing::RoutingTable;

/// Error counters collected on the master.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorCounters {
    /// Sum of reported `count`s per reporting node and cause.
    pub remote: BTreeMap<(NodeId, RemoteErrorKind), u64>,
    /// Counters of every link: the master's ports as they are, repeater
    /// ports as last reported by their satellite.
    pub links: BTreeMap<LinkId, LinkCounters>,
    /// Links with a raised calibration alarm, in link order.
    pub alarms: Vec<LinkId>,
}

impl ErrorCounters {
    pub fn remote(&self, node: NodeId, kind: RemoteErrorKind) -> u64 {
        self.remote.get(&(node, kind)).copied().unwrap_or(0)
    }
}

/// Operator access to routing, link state, error counters and echo.
pub trait Admin {
    /// The table currently in force on `node`.
    fn routing_table(&self, node: NodeId) -> Option<RoutingTable>;

    /// Replace `node`'s table.  The candidate set is validated, affected
    /// destinations are paused until they drain, then the new snapshot is
    /// published and pushed to the satellites whose table changed.  Returns
    /// the affected destinations.
    fn install_routing(
        &mut self,
        node: NodeId,
        table: RoutingTable,
    ) -> Result<Vec<NodeId>, RoutingError>;

    fn link_status(&self) -> BTreeMap<LinkId, LinkReport>;

    fn error_counters(&self) -> ErrorCounters;

    /// Send an echo request; the reply arrives as
    /// [`FabricEvent::EchoReply`](crate::events::FabricEvent::EchoReply)
    /// carrying the returned nonce.
    fn ping(&mut self, node: NodeId) -> Result<u64, DrtioError>;
}
