/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The master node.
//!
//! The master owns the global TSC, its downstream ports and its local
//! channels.  Command acceptance happens in the
//! [`Interconnect`](crate::cri::Interconnect), which shares the router, the
//! link board and the local FIFOs with this struct; the master's tick turns
//! port activity into board updates, in-flight retirements and
//! [`FabricEvent`]s.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::admin::{Admin, ErrorCounters};
use crate::aux::{AuxFrame, AuxMessage, AuxSettings, RemoteError, RemoteErrorKind};
use crate::channel::LocalIo;
use crate::error::{CriError, DrtioError, RoutingError};
use crate::events::{EventSink, FabricEvent};
use crate::link::{LinkBoard, LinkCounters, LinkId, LinkReport, LinkState, LinkStateKind};
use crate::node::port::{DownstreamPort, PortEvent};
use crate::node::{NodeId, Topology};
use crate::routing::{NextHop, Router, RoutingSnapshot, RoutingTable};
use crate::tsc::Tsc;

pub struct Master {
    topology: Topology,
    tsc: Tsc,
    ports: Vec<DownstreamPort>,
    local: Arc<LocalIo>,
    router: Arc<Router>,
    board: Arc<LinkBoard>,
    events: EventSink,
    remote_errors: BTreeMap<(NodeId, RemoteErrorKind), u64>,
    /// Repeater ports as last reported by their satellite.
    remote_ports: BTreeMap<LinkId, (LinkCounters, bool)>,
    /// Outstanding echo requests: nonce → (node, sent at).
    pending_echo: BTreeMap<u64, (NodeId, u64)>,
    echo_timeout: u64,
    next_nonce: u64,
}

impl std::fmt::Debug for Master {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Master")
            .field("now", &self.tsc.now())
            .field("ports", &self.ports)
            .field("local", &self.local)
            .finish()
    }
}

impl Master {
    pub fn new(
        topology: Topology,
        tsc: Tsc,
        ports: Vec<DownstreamPort>,
        local: Arc<LocalIo>,
        router: Arc<Router>,
        board: Arc<LinkBoard>,
        events: EventSink,
    ) -> Self {
        Self {
            topology,
            tsc,
            ports,
            local,
            router,
            board,
            events,
            remote_errors: BTreeMap::new(),
            remote_ports: BTreeMap::new(),
            pending_echo: BTreeMap::new(),
            echo_timeout: AuxSettings::default().echo_timeout,
            next_nonce: 1,
        }
    }

    pub fn now(&self) -> u64 {
        self.tsc.now()
    }

    /// Ticks an echo request stays outstanding.
    pub fn set_echo_timeout(&mut self, ticks: u64) {
        self.echo_timeout = ticks.max(1);
    }

    /// Echo requests still waiting for a reply.
    pub fn pending_echoes(&self) -> usize {
        self.pending_echo.len()
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn ports(&self) -> &[DownstreamPort] {
        &self.ports
    }

    pub fn port(&self, port: u8) -> Option<&DownstreamPort> {
        self.ports.get(usize::from(port))
    }

    pub fn local(&self) -> &Arc<LocalIo> {
        &self.local
    }

    pub fn router(&self) -> &Arc<Router> {
        &self.router
    }

    pub fn board(&self) -> &Arc<LinkBoard> {
        &self.board
    }

    /// Run one tick.  The TSC must already have advanced.
    pub fn step(&mut self) {
        let now = self.tsc.now();

        for reject in self.local.execute_due(now) {
            let error = RemoteError::new(RemoteErrorKind::ChannelFault)
                .on_channel(reject.channel)
                .at(now);
            self.record_remote(NodeId::MASTER, error);
        }

        let mut events = Vec::new();
        for i in 0..self.ports.len() {
            self.ports[i].step(now, &mut events);
            let link = self.ports[i].link();
            let neighbour = self.ports[i].neighbour();
            for event in events.drain(..) {
                self.on_port_event(link, neighbour, event);
            }
        }

        self.expire_echoes(now);

        if let Some(update) = self.router.try_commit() {
            let version = update.snapshot.version();
            let mut pushed = Vec::new();
            let mut unreachable = Vec::new();
            for node in &update.changed_tables {
                let Some(table) = update.snapshot.table(*node) else {
                    unreachable.push(*node);
                    continue;
                };
                let frame = AuxFrame::new(
                    NodeId::MASTER,
                    *node,
                    AuxMessage::RoutingUpdate {
                        version,
                        table: table.clone(),
                    },
                );
                match self.send_aux(frame) {
                    Ok(()) => pushed.push(*node),
                    Err(e) => {
                        warn!(%node, error = %e, "cannot push routing table");
                        unreachable.push(*node);
                    }
                }
            }
            self.events.emit(FabricEvent::RoutingCommitted {
                version,
                affected: update.affected,
                pushed,
            });
            // Nobody will answer for a table that never left.
            for node in unreachable {
                self.routing_answered(node, version);
            }
        }
    }

    fn expire_echoes(&mut self, now: u64) {
        let timeout = self.echo_timeout;
        let mut expired = Vec::new();
        self.pending_echo.retain(|nonce, (node, sent)| {
            let alive = now.saturating_sub(*sent) < timeout;
            if !alive {
                expired.push((*node, *nonce));
            }
            alive
        });
        for (node, nonce) in expired {
            self.events.emit(FabricEvent::EchoTimeout { node, nonce });
        }
    }

    fn routing_answered(&mut self, node: NodeId, version: u64) {
        if let Some(released) = self.router.acknowledge(node, version) {
            self.events
                .emit(FabricEvent::RoutingApplied { version, released });
        }
    }

    fn on_port_event(&mut self, link: LinkId, neighbour: NodeId, event: PortEvent) {
        match event {
            PortEvent::StateChanged(state) => {
                let latency = match state {
                    LinkState::Synchronized { latency, .. } => Some(latency),
                    _ => None,
                };
                self.update_board(link, state.kind(), latency);
            }
            PortEvent::Aux(frame) => self.on_aux(frame),
            PortEvent::Retired { destination } => self.router.retire(destination),
            PortEvent::Failed {
                destination,
                command,
            } => {
                self.router.retire(destination);
                self.events.emit(FabricEvent::CommandFailed {
                    destination,
                    command,
                    error: CriError::LinkDown { link, destination },
                });
            }
            PortEvent::CalibrationTimeout { attempts } => {
                debug!(%link, attempts, "calibration attempt timed out");
            }
            PortEvent::CalibrationAlarm { attempts } => {
                self.events
                    .emit(FabricEvent::CalibrationAlarm { link, attempts });
            }
            PortEvent::AuxError(error) => {
                self.events
                    .emit(FabricEvent::AuxProtocolError { link, error });
            }
            PortEvent::AuxReset => self.events.emit(FabricEvent::AuxSessionReset { link }),
            PortEvent::TopologyMismatch { found } => {
                self.events.emit(FabricEvent::TopologyMismatch {
                    link,
                    expected: neighbour,
                    found,
                });
            }
        }
    }

    /// Publish a link's state.  A link that is not synchronized takes every
    /// link below it down with it.
    fn update_board(&mut self, link: LinkId, state: LinkStateKind, latency: Option<u64>) {
        let report = LinkReport { state, latency };
        if self.board.get(link) == report {
            return;
        }
        if state != LinkStateKind::Synchronized {
            self.board.invalidate_below(self.topology.links_below(link));
        }
        self.board.publish(link, report);
        self.events.emit(FabricEvent::LinkStateChanged {
            link,
            state,
            latency,
        });
    }

    fn record_remote(&mut self, node: NodeId, error: RemoteError) {
        *self.remote_errors.entry((node, error.kind)).or_default() += error.count;
        self.events.emit(FabricEvent::RemoteError { node, error });
    }

    fn on_aux(&mut self, frame: AuxFrame) {
        if frame.destination != NodeId::MASTER {
            // Satellite to satellite traffic turns around here.
            if let Err(e) = self.send_aux(frame) {
                debug!(error = %e, "aux frame dropped");
            }
            return;
        }
        let source = frame.source;
        match frame.message {
            AuxMessage::ErrorReport(error) => self.record_remote(source, error),
            AuxMessage::LinkStatus {
                port,
                state,
                latency,
            } => {
                let link = LinkId::new(source, port);
                if self.topology.neighbour(source, port).is_none() {
                    warn!(%link, "status for a link outside the topology");
                    return;
                }
                self.update_board(link, state, latency);
            }
            AuxMessage::PortCounters {
                port,
                counters,
                alarm,
            } => {
                let link = LinkId::new(source, port);
                if self.topology.neighbour(source, port).is_none() {
                    warn!(%link, "counters for a link outside the topology");
                    return;
                }
                self.remote_ports.insert(link, (counters, alarm));
            }
            AuxMessage::EchoReply { nonce } => {
                match self.pending_echo.remove(&nonce) {
                    Some((node, sent)) => self.events.emit(FabricEvent::EchoReply {
                        node,
                        nonce,
                        rtt: self.tsc.now().saturating_sub(sent),
                    }),
                    None => debug!(%source, nonce, "unsolicited echo reply"),
                }
            }
            AuxMessage::RoutingAck {
                version,
                accepted,
                reason,
            } => {
                self.events.emit(FabricEvent::RoutingAck {
                    node: source,
                    version,
                    accepted,
                    reason,
                });
                self.routing_answered(source, version);
            }
            other => debug!(%source, ?other, "unexpected aux message"),
        }
    }

    /// Queue an aux frame on the port the master's table names for its
    /// destination.
    pub fn send_aux(&mut self, frame: AuxFrame) -> Result<(), DrtioError> {
        let destination = frame.destination;
        let hop = self
            .router
            .snapshot()
            .table(NodeId::MASTER)
            .map(|t| t.get(destination))
            .unwrap_or_default();
        match hop {
            NextHop::Port(p) => {
                let port = self
                    .ports
                    .get_mut(usize::from(p))
                    .ok_or(DrtioError::NoRoute(destination))?;
                port.send_aux(frame);
                Ok(())
            }
            NextHop::Local | NextHop::NoRoute => Err(DrtioError::NoRoute(destination)),
        }
    }
}

// ── Admin ─────────────────────────────────────────────────────────────────────

impl Admin for Master {
    fn routing_table(&self, node: NodeId) -> Option<RoutingTable> {
        self.router.snapshot().table(node).cloned()
    }

    fn install_routing(
        &mut self,
        node: NodeId,
        table: RoutingTable,
    ) -> Result<Vec<NodeId>, RoutingError> {
        if !self.topology.contains(node) {
            return Err(RoutingError::UnknownNode(node));
        }
        let current = self.router.snapshot();
        let mut tables = current.tables().clone();
        tables.insert(node, table);
        let next = RoutingSnapshot::build(
            &self.topology,
            tables,
            current.channels().clone(),
            current.version() + 1,
        )?;
        let affected = self.router.stage(next)?;
        info!(%node, ?affected, "routing table write accepted");
        Ok(affected)
    }

    fn link_status(&self) -> BTreeMap<LinkId, LinkReport> {
        let mut status: BTreeMap<LinkId, LinkReport> = self
            .topology
            .links()
            .into_iter()
            .map(|l| (l, LinkReport::DOWN))
            .collect();
        status.extend(self.board.all());
        status
    }

    fn error_counters(&self) -> ErrorCounters {
        let mut links: BTreeMap<LinkId, LinkCounters> = self
            .remote_ports
            .iter()
            .map(|(link, (counters, _))| (*link, *counters))
            .collect();
        links.extend(self.ports.iter().map(|p| (p.link(), *p.counters())));
        let mut alarms: Vec<LinkId> = self
            .ports
            .iter()
            .filter(|p| p.alarm())
            .map(|p| p.link())
            .chain(
                self.remote_ports
                    .iter()
                    .filter(|(_, (_, alarm))| *alarm)
                    .map(|(link, _)| *link),
            )
            .collect();
        alarms.sort();
        ErrorCounters {
            remote: self.remote_errors.clone(),
            links,
            alarms,
        }
    }

    fn ping(&mut self, node: NodeId) -> Result<u64, DrtioError> {
        if !self.topology.contains(node) {
            return Err(RoutingError::UnknownNode(node).into());
        }
        let nonce = self.next_nonce;
        self.next_nonce += 1;
        let now = self.tsc.now();
        if node == NodeId::MASTER {
            self.events.emit(FabricEvent::EchoReply {
                node,
                nonce,
                rtt: 0,
            });
            return Ok(nonce);
        }
        self.send_aux(AuxFrame::new(
            NodeId::MASTER,
            node,
            AuxMessage::EchoRequest { nonce },
        ))?;
        self.pending_echo.insert(nonce, (node, now));
        Ok(nonce)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelSpec, LatchBank};
    use crate::routing::default_tables;

    /// master ─p0─ 1 ─p0─ 2, no ports wired: aux frames are fed in directly.
    fn master() -> (Master, tokio::sync::mpsc::UnboundedReceiver<FabricEvent>) {
        let mut topology = Topology::new("master");
        topology.add_satellite(NodeId(1), "a", NodeId(0)).unwrap();
        topology.add_satellite(NodeId(2), "b", NodeId(1)).unwrap();
        let snapshot =
            RoutingSnapshot::build(&topology, default_tables(&topology), BTreeMap::new(), 0)
                .unwrap();
        let (sink, rx) = EventSink::channel();
        let m = Master::new(
            topology,
            Tsc::new(),
            Vec::new(),
            Arc::new(LocalIo::new(
                Vec::<ChannelSpec>::new(),
                4,
                Arc::new(LatchBank::new()),
            )),
            Arc::new(Router::new(snapshot)),
            Arc::new(LinkBoard::new()),
            sink,
        );
        (m, rx)
    }

    fn status(node: u8, port: u8, state: LinkStateKind, latency: Option<u64>) -> AuxFrame {
        AuxFrame::new(
            NodeId(node),
            NodeId::MASTER,
            AuxMessage::LinkStatus {
                port,
                state,
                latency,
            },
        )
    }

    #[test]
    fn link_status_reports_feed_the_board() {
        let (mut m, mut rx) = master();
        let deep = LinkId::new(NodeId(1), 0);
        m.on_aux(status(1, 0, LinkStateKind::Synchronized, Some(4)));
        assert_eq!(m.board().latency(deep), Some(4));
        assert_eq!(
            rx.try_recv().ok(),
            Some(FabricEvent::LinkStateChanged {
                link: deep,
                state: LinkStateKind::Synchronized,
                latency: Some(4)
            })
        );

        // The same report again is not news.
        m.on_aux(status(1, 0, LinkStateKind::Synchronized, Some(4)));
        assert!(rx.try_recv().is_err());

        // Unknown links are ignored.
        m.on_aux(status(2, 3, LinkStateKind::Synchronized, Some(1)));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn losing_an_upper_link_invalidates_deeper_ones() {
        let (mut m, _rx) = master();
        let top = LinkId::new(NodeId(0), 0);
        let deep = LinkId::new(NodeId(1), 0);
        m.update_board(top, LinkStateKind::Synchronized, Some(2));
        m.on_aux(status(1, 0, LinkStateKind::Synchronized, Some(4)));
        m.update_board(top, LinkStateKind::Down, None);
        assert_eq!(m.board().get(deep), LinkReport::DOWN);
    }

    #[test]
    fn error_reports_are_counted_per_node_and_kind() {
        let (mut m, mut rx) = master();
        let report = RemoteError::new(RemoteErrorKind::LinkDown).count(3);
        m.on_aux(AuxFrame::new(
            NodeId(2),
            NodeId::MASTER,
            AuxMessage::ErrorReport(report),
        ));
        m.on_aux(AuxFrame::new(
            NodeId(2),
            NodeId::MASTER,
            AuxMessage::ErrorReport(report),
        ));
        assert_eq!(
            m.error_counters().remote(NodeId(2), RemoteErrorKind::LinkDown),
            6
        );
        assert_eq!(
            rx.try_recv().ok(),
            Some(FabricEvent::RemoteError {
                node: NodeId(2),
                error: report
            })
        );
    }

    #[test]
    fn install_rejects_loops_and_unknown_nodes() {
        let (mut m, _rx) = master();
        let mut looped = RoutingTable::new();
        looped.set(NodeId(1), NextHop::Local);
        looped.set(NodeId(2), NextHop::Port(5));
        assert!(matches!(
            m.install_routing(NodeId(1), looped),
            Err(RoutingError::UnknownPort { .. })
        ));
        assert_eq!(
            m.install_routing(NodeId(9), RoutingTable::new()),
            Err(RoutingError::UnknownNode(NodeId(9)))
        );
        assert!(!m.router().has_pending());
    }

    #[test]
    fn ping_needs_a_route() {
        let (mut m, mut rx) = master();
        // No ports are wired, so the table's port 0 does not exist.
        assert!(matches!(m.ping(NodeId(1)), Err(DrtioError::NoRoute(NodeId(1)))));
        let nonce = m.ping(NodeId::MASTER).unwrap();
        assert_eq!(
            rx.try_recv().ok(),
            Some(FabricEvent::EchoReply {
                node: NodeId::MASTER,
                nonce,
                rtt: 0
            })
        );
    }
}
