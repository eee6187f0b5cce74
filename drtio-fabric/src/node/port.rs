/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Upstream side of one link: a downstream port of the master or of a
//! repeating satellite.
//!
//! ```text
//!  phy up ─► Calibrating ─► Hello (aux) ─► Ping ─► Pong ─► TscLoad ─► Synchronized
//!               ▲                                                       │
//!               └──── window expired (retry) / Hello again (restart) ◄──┘
//! ```
//!
//! Latency is `ceil(rtt / 2) + latency_margin`.  While synchronized the port
//! re-broadcasts the TSC every `broadcast_period` ticks and drains its egress
//! queue onto the wire.  Commands sent over the link stay in an in-flight
//! list until they must have arrived; losing the link fails all of them.

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::aux::{AuxController, AuxFrame, AuxMessage, AuxSettings, AuxStats};
use crate::cri::{EgressReceiver, TimedCommand};
use crate::error::AuxProtocolError;
use crate::link::{
    DownReason, Frame, LinkCounters, LinkFsm, LinkId, LinkState, PhyState, RtPacket, Transceiver,
};
use crate::node::NodeId;

/// Timing parameters of a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortSettings {
    pub broadcast_period: u64,
    pub calibration_window: u64,
    pub alarm_after: u32,
    pub latency_margin: u64,
}

impl Default for PortSettings {
    fn default() -> Self {
        Self {
            broadcast_period: 64,
            calibration_window: 64,
            alarm_after: 3,
            latency_margin: 0,
        }
    }
}

/// What happened on the port during one step, for the owning node.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    StateChanged(LinkState),
    /// An aux frame from downstream, other than the `Hello` handshake.
    Aux(AuxFrame),
    /// A command sent over the link has arrived at its destination.
    Retired { destination: NodeId },
    /// A queued or in-flight command was lost with the link.
    Failed {
        destination: NodeId,
        command: TimedCommand,
    },
    CalibrationTimeout { attempts: u32 },
    /// Consecutive calibration failures reached the alarm threshold.
    CalibrationAlarm { attempts: u32 },
    AuxError(AuxProtocolError),
    AuxReset,
    /// The `Hello` came from a different node than the configured neighbour.
    TopologyMismatch { found: NodeId },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    AwaitHello,
    Ping { seq: u32, sent_at: u64 },
    Done,
}

#[derive(Debug, Clone, Copy)]
struct InFlight {
    arrives_at: u64,
    destination: NodeId,
    command: TimedCommand,
}

/// One downstream port.
pub struct DownstreamPort {
    neighbour: NodeId,
    fsm: LinkFsm,
    settings: PortSettings,
    transceiver: Box<dyn Transceiver>,
    aux: AuxController,
    egress: Option<EgressReceiver>,
    handshake: Handshake,
    next_ping: u32,
    last_sync: u64,
    phy_up: bool,
    in_flight: VecDeque<InFlight>,
}

impl std::fmt::Debug for DownstreamPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownstreamPort")
            .field("link", &self.fsm.link())
            .field("neighbour", &self.neighbour)
            .field("state", &self.fsm.state())
            .field("in_flight", &self.in_flight.len())
            .finish()
    }
}

impl DownstreamPort {
    /// `egress` is the interconnect queue of a master port; repeater ports
    /// get commands through [`forward`](Self::forward) instead.
    pub fn new(
        link: LinkId,
        neighbour: NodeId,
        transceiver: Box<dyn Transceiver>,
        settings: PortSettings,
        aux: AuxSettings,
        egress: Option<EgressReceiver>,
    ) -> Self {
        Self {
            neighbour,
            fsm: LinkFsm::new(link),
            settings,
            transceiver,
            aux: AuxController::new(link, aux, 1),
            egress,
            handshake: Handshake::AwaitHello,
            next_ping: 1,
            last_sync: 0,
            phy_up: false,
            in_flight: VecDeque::new(),
        }
    }

    pub fn link(&self) -> LinkId {
        self.fsm.link()
    }

    pub fn port(&self) -> u8 {
        self.fsm.link().port
    }

    pub fn neighbour(&self) -> NodeId {
        self.neighbour
    }

    pub fn state(&self) -> LinkState {
        self.fsm.state()
    }

    pub fn is_synchronized(&self) -> bool {
        self.fsm.is_synchronized()
    }

    pub fn latency(&self) -> Option<u64> {
        self.fsm.latency()
    }

    pub fn counters(&self) -> &LinkCounters {
        self.fsm.counters()
    }

    pub fn alarm(&self) -> bool {
        self.fsm.alarm()
    }

    pub fn aux_stats(&self) -> &AuxStats {
        self.aux.stats()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Queue an aux frame towards the neighbour (or beyond).
    pub fn send_aux(&mut self, frame: AuxFrame) {
        self.aux.enqueue(frame);
    }

    /// Put a command on the wire right away.  Returns `false` (and sends
    /// nothing) unless the link is synchronized.
    pub fn forward(&mut self, destination: NodeId, command: TimedCommand, now: u64) -> bool {
        let Some(latency) = self.fsm.latency() else {
            return false;
        };
        self.transmit(destination, command, now, latency)
    }

    fn transmit(&mut self, destination: NodeId, command: TimedCommand, now: u64, travel: u64) -> bool {
        if !self
            .transceiver
            .send(Frame::Rt(RtPacket::Write { destination, command }))
        {
            return false;
        }
        self.fsm.counters_mut().commands_forwarded += 1;
        self.in_flight.push_back(InFlight {
            arrives_at: now.saturating_add(travel),
            destination,
            command,
        });
        trace!(link = %self.link(), %destination, at = %command.timestamp, "command on the wire");
        true
    }

    /// Run one tick of the port.
    pub fn step(&mut self, now: u64, out: &mut Vec<PortEvent>) {
        let phy = self.transceiver.phy_state();
        if phy != PhyState::Up && self.phy_up {
            self.phy_up = false;
            self.aux.reset_session();
            out.push(PortEvent::AuxReset);
        }
        if phy == PhyState::Down {
            if self.fsm.down(DownReason::PhyLost) {
                self.lose_link(out);
            }
            self.drain_failed(out);
            return;
        }
        self.phy_up = phy == PhyState::Up;

        if self.fsm.begin_calibration(now) {
            self.handshake = Handshake::AwaitHello;
            out.push(PortEvent::StateChanged(self.fsm.state()));
        }

        while let Some(frame) = self.transceiver.recv() {
            match frame {
                Frame::Rt(RtPacket::Pong { seq }) => self.on_pong(seq, now, out),
                Frame::Rt(other) => trace!(link = %self.link(), ?other, "ignored rt packet"),
                Frame::Aux(bytes) => self.on_aux(&bytes, now, out),
            }
        }

        if self.fsm.calibration_expired(now, self.settings.calibration_window) {
            let attempts = self.fsm.calibration_timeout(now, self.settings.alarm_after);
            out.push(PortEvent::CalibrationTimeout { attempts });
            if attempts == self.settings.alarm_after {
                out.push(PortEvent::CalibrationAlarm { attempts });
            }
            out.push(PortEvent::StateChanged(self.fsm.state()));
            // A neighbour that already said Hello is only waiting for us.
            if matches!(self.handshake, Handshake::Ping { .. }) {
                self.send_ping(now);
            }
        }

        if let LinkState::Synchronized { latency, .. } = self.fsm.state() {
            if now.saturating_sub(self.last_sync) >= self.settings.broadcast_period {
                self.transceiver.send(Frame::Rt(RtPacket::TscSync {
                    coarse: now + latency,
                }));
                self.last_sync = now;
            }
            while let Some(item) = self.egress.as_mut().and_then(|rx| rx.pop()) {
                if !self.transmit(item.destination, item.command, now, item.path_latency) {
                    self.fail(item.destination, item.command, out);
                }
            }
        } else {
            self.drain_failed(out);
        }

        // Path latencies differ per destination, so arrival order is not
        // queue order.
        self.in_flight.retain(|f| {
            if f.arrives_at > now {
                return true;
            }
            out.push(PortEvent::Retired {
                destination: f.destination,
            });
            false
        });

        if self.phy_up {
            for bytes in self.aux.poll_transmit(now) {
                self.transceiver.send(Frame::Aux(bytes));
            }
        }
    }

    fn on_aux(&mut self, bytes: &[u8], now: u64, out: &mut Vec<PortEvent>) {
        match self.aux.receive(bytes) {
            Ok(Some(frame)) => match frame.message {
                AuxMessage::Hello { node, ref name } if frame.destination == self.link().node => {
                    if node != self.neighbour {
                        warn!(link = %self.link(), expected = %self.neighbour, found = %node, "✗ topology mismatch");
                        out.push(PortEvent::TopologyMismatch { found: node });
                        return;
                    }
                    info!(link = %self.link(), %node, name = %name, "hello from satellite");
                    if self.fsm.is_synchronized() {
                        self.fsm.down(DownReason::PeerRestart);
                        self.lose_link(out);
                        self.fsm.begin_calibration(now);
                        out.push(PortEvent::StateChanged(self.fsm.state()));
                    }
                    self.send_ping(now);
                }
                _ => out.push(PortEvent::Aux(frame)),
            },
            Ok(None) => {}
            Err(e) => {
                self.fsm.counters_mut().aux_protocol_errors += 1;
                out.push(PortEvent::AuxError(e));
                if self.aux.take_session_reset() {
                    out.push(PortEvent::AuxReset);
                }
            }
        }
    }

    fn send_ping(&mut self, now: u64) {
        let seq = self.next_ping;
        self.next_ping = self.next_ping.wrapping_add(1);
        self.handshake = Handshake::Ping { seq, sent_at: now };
        debug!(link = %self.link(), seq, "latency ping");
        self.transceiver.send(Frame::Rt(RtPacket::Ping { seq }));
    }

    fn on_pong(&mut self, seq: u32, now: u64, out: &mut Vec<PortEvent>) {
        let Handshake::Ping { seq: expected, sent_at } = self.handshake else {
            return;
        };
        if seq != expected || !matches!(self.fsm.state(), LinkState::Calibrating { .. }) {
            trace!(link = %self.link(), seq, expected, "stale pong");
            return;
        }
        let rtt = now - sent_at;
        let latency = rtt.div_ceil(2) + self.settings.latency_margin;
        self.transceiver.send(Frame::Rt(RtPacket::TscLoad {
            coarse: now + latency,
            latency,
        }));
        self.handshake = Handshake::Done;
        self.last_sync = now;
        self.fsm.synchronized(latency, now);
        out.push(PortEvent::StateChanged(self.fsm.state()));
    }

    /// The link was lost: everything queued or on the wire fails.
    fn lose_link(&mut self, out: &mut Vec<PortEvent>) {
        self.handshake = Handshake::AwaitHello;
        let lost: Vec<InFlight> = self.in_flight.drain(..).collect();
        for f in lost {
            self.fail(f.destination, f.command, out);
        }
        self.drain_failed(out);
        out.push(PortEvent::StateChanged(self.fsm.state()));
    }

    /// Commands accepted for a link that is not synchronized fail.
    fn drain_failed(&mut self, out: &mut Vec<PortEvent>) {
        while let Some(item) = self.egress.as_mut().and_then(|rx| rx.pop()) {
            self.fail(item.destination, item.command, out);
        }
    }

    fn fail(&mut self, destination: NodeId, command: TimedCommand, out: &mut Vec<PortEvent>) {
        self.fsm.counters_mut().commands_failed += 1;
        out.push(PortEvent::Failed {
            destination,
            command,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aux::packet::{self, Sequencing};
    use crate::channel::ChannelId;
    use crate::cri::{egress_queue, EgressItem, SourceId};
    use crate::link::{SimEndpoint, SimLink};

    /// Minimal downstream peer: answers pings, says hello through a bare
    /// aux envelope.
    struct Peer {
        end: SimEndpoint,
        session: u32,
        loaded: Option<u64>,
        writes: Vec<(NodeId, TimedCommand)>,
    }

    impl Peer {
        fn hello(&mut self, from: NodeId) {
            let frame = AuxFrame::new(
                from,
                NodeId(0),
                AuxMessage::Hello {
                    node: from,
                    name: "sat".into(),
                },
            );
            let seq = Sequencing {
                session: self.session,
                seq: 1,
                base: 1,
                ack: 1,
                ack_session: 0,
            };
            self.end.send(Frame::Aux(packet::encode(seq, Some(&frame))));
        }

        fn step(&mut self) {
            while let Some(frame) = self.end.recv() {
                match frame {
                    Frame::Rt(RtPacket::Ping { seq }) => {
                        self.end.send(Frame::Rt(RtPacket::Pong { seq }));
                    }
                    Frame::Rt(RtPacket::TscLoad { coarse, .. }) => self.loaded = Some(coarse),
                    Frame::Rt(RtPacket::Write {
                        destination,
                        command,
                    }) => self.writes.push((destination, command)),
                    _ => {}
                }
            }
        }
    }

    struct Rig {
        link: SimLink,
        port: DownstreamPort,
        peer: Peer,
        now: u64,
        events: Vec<PortEvent>,
    }

    impl Rig {
        fn new(latency: u64, egress: Option<EgressReceiver>) -> Self {
            let (link, up, down) = SimLink::new(latency, 0);
            let port = DownstreamPort::new(
                LinkId::new(NodeId(0), 0),
                NodeId(1),
                Box::new(up),
                PortSettings {
                    calibration_window: 40,
                    ..PortSettings::default()
                },
                AuxSettings::default(),
                egress,
            );
            Self {
                link,
                port,
                peer: Peer {
                    end: down,
                    session: 7,
                    loaded: None,
                    writes: Vec::new(),
                },
                now: 0,
                events: Vec::new(),
            }
        }

        fn tick(&mut self) {
            self.now += 1;
            self.link.tick();
            self.port.step(self.now, &mut self.events);
            self.peer.step();
        }

        fn run(&mut self, ticks: u64) {
            for _ in 0..ticks {
                self.tick();
            }
        }
    }

    #[test]
    fn calibrates_latency_from_ping_round_trip() {
        let mut r = Rig::new(5, None);
        r.tick();
        assert!(matches!(r.port.state(), LinkState::Calibrating { .. }));
        r.peer.hello(NodeId(1));
        // hello arrives after 5 ticks, pong 10 ticks after the ping.
        r.run(15);
        assert_eq!(r.port.latency(), Some(5));
        r.run(5);
        // TscLoad is stamped with the master time of its arrival.
        assert_eq!(r.peer.loaded, Some(r.now));
    }

    #[test]
    fn wrong_neighbour_keeps_calibrating() {
        let mut r = Rig::new(1, None);
        r.tick();
        r.peer.hello(NodeId(9));
        r.run(5);
        assert!(r
            .events
            .contains(&PortEvent::TopologyMismatch { found: NodeId(9) }));
        assert!(matches!(r.port.state(), LinkState::Calibrating { .. }));
    }

    #[test]
    fn silent_neighbour_times_out_and_raises_alarm() {
        let mut r = Rig::new(1, None);
        r.run(1 + 40 * 3);
        let timeouts = r
            .events
            .iter()
            .filter(|e| matches!(e, PortEvent::CalibrationTimeout { .. }))
            .count();
        assert_eq!(timeouts, 3);
        assert!(r
            .events
            .contains(&PortEvent::CalibrationAlarm { attempts: 3 }));
        assert!(r.port.alarm());
    }

    #[test]
    fn link_loss_fails_in_flight_commands() {
        let (tx, rx) = egress_queue(8, 2);
        let mut r = Rig::new(3, Some(rx));
        r.tick();
        r.peer.hello(NodeId(1));
        r.run(10);
        assert!(r.port.is_synchronized());

        let cmd = TimedCommand::write(ChannelId(7), 500, 1);
        tx.try_push(EgressItem {
            source: SourceId::CPU,
            destination: NodeId(1),
            command: cmd,
            path_latency: 3,
        })
        .unwrap();
        r.tick();
        assert_eq!(r.port.in_flight(), 1);

        r.link.set_connected(false);
        r.events.clear();
        r.tick();
        assert!(r.events.contains(&PortEvent::Failed {
            destination: NodeId(1),
            command: cmd
        }));
        assert!(r.events.contains(&PortEvent::StateChanged(LinkState::Down)));
        assert!(r.peer.writes.is_empty());
        assert_eq!(r.port.counters().commands_failed, 1);
    }

    #[test]
    fn delivered_commands_are_retired() {
        let (tx, rx) = egress_queue(8, 2);
        let mut r = Rig::new(2, Some(rx));
        r.tick();
        r.peer.hello(NodeId(1));
        r.run(8);
        assert!(r.port.is_synchronized());
        r.events.clear();

        tx.try_push(EgressItem {
            source: SourceId::CPU,
            destination: NodeId(1),
            command: TimedCommand::write(ChannelId(7), 500, 1),
            path_latency: 2,
        })
        .unwrap();
        r.run(2);
        assert!(r.events.is_empty());
        r.tick();
        assert_eq!(r.events, vec![PortEvent::Retired { destination: NodeId(1) }]);
        assert_eq!(r.peer.writes.len(), 1);
    }

    #[test]
    fn short_paths_retire_before_earlier_long_ones() {
        let (tx, rx) = egress_queue(8, 2);
        let mut r = Rig::new(2, Some(rx));
        r.tick();
        r.peer.hello(NodeId(1));
        r.run(8);
        assert!(r.port.is_synchronized());
        r.events.clear();

        for (destination, path_latency) in [(NodeId(2), 6), (NodeId(1), 2)] {
            tx.try_push(EgressItem {
                source: SourceId::CPU,
                destination,
                command: TimedCommand::write(ChannelId(7), 500, 1),
                path_latency,
            })
            .unwrap();
        }
        r.run(3);
        assert_eq!(r.events, vec![PortEvent::Retired { destination: NodeId(1) }]);
        assert_eq!(r.port.in_flight(), 1);

        r.run(4);
        assert_eq!(
            r.events,
            vec![
                PortEvent::Retired { destination: NodeId(1) },
                PortEvent::Retired { destination: NodeId(2) },
            ]
        );
        assert_eq!(r.port.in_flight(), 0);
    }
}
