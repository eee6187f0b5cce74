/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Satellite node.
//!
//! The satellite recovers the master's time from its upstream link, executes
//! the commands addressed to its own channels and repeats everything else
//! through its downstream ports.
//!
//! Synchronized requires all three of:
//!
//! | Condition | Source |
//! |---|---|
//! | phy `Up` (word alignment) | transceiver |
//! | phase aligner `Locked` | [`PhaseAligner`] |
//! | `TscLoad` received | upstream node |
//!
//! Every asynchronous problem is reported to the master as an aux
//! `ErrorReport`.  Reports raised while the upstream link is down wait in
//! the aux queue and go out once the link is usable again.  The counters of
//! the repeater ports travel the same way as `PortCounters`, at most once
//! per [`COUNTER_REPORT_INTERVAL`] ticks unless an alarm flips.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use crate::aux::{AuxController, AuxFrame, AuxMessage, AuxSettings, RemoteError, RemoteErrorKind};
use crate::channel::{LocalIo, PushError};
use crate::cri::TimedCommand;
use crate::link::{
    DownReason, Frame, LinkCounters, LinkFsm, LinkId, LinkState, PhyState, RtPacket, Transceiver,
};
use crate::node::port::{DownstreamPort, PortEvent};
use crate::node::NodeId;
use crate::routing::{NextHop, RoutingTable};
use crate::siphaser::{AlignerStatus, PhaseAligner, PhaseDetector};
use crate::tsc::Tsc;

/// Least ticks between two counter reports of one repeater port.
pub const COUNTER_REPORT_INTERVAL: u64 = 64;

/// Tunables of the upstream side of a satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatelliteSettings {
    /// Largest accepted difference between a `TscSync` and the local TSC.
    pub tolerance: u64,
    pub calibration_window: u64,
    pub alarm_after: u32,
}

impl Default for SatelliteSettings {
    fn default() -> Self {
        Self {
            tolerance: 0,
            calibration_window: 64,
            alarm_after: 3,
        }
    }
}

/// Counters of one satellite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SatelliteStats {
    pub commands_received: u64,
    pub commands_forwarded: u64,
    pub commands_dropped: u64,
    pub reports_sent: u64,
    pub tsc_loads: u64,
}

struct Uplink {
    fsm: LinkFsm,
    transceiver: Box<dyn Transceiver>,
    aux: AuxController,
    aligner: PhaseAligner,
    detector: Box<dyn PhaseDetector>,
    phy_up: bool,
    hello_sent: bool,
    /// Bad aux frames not yet reported.
    aux_errors: u64,
}

/// What the master last heard about one repeater port.
#[derive(Debug, Clone, Copy, Default)]
struct PortReport {
    counters: LinkCounters,
    alarm: bool,
    at: Option<u64>,
}

/// One satellite.
pub struct Satellite {
    id: NodeId,
    name: String,
    tsc: Tsc,
    settings: SatelliteSettings,
    up: Uplink,
    ports: Vec<DownstreamPort>,
    reported: Vec<PortReport>,
    table: RoutingTable,
    local: Arc<LocalIo>,
    stats: SatelliteStats,
}

impl std::fmt::Debug for Satellite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Satellite")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.up.fsm.state())
            .field("locked", &self.up.aligner.is_locked())
            .field("ports", &self.ports)
            .finish()
    }
}

impl Satellite {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        upstream: LinkId,
        transceiver: Box<dyn Transceiver>,
        detector: Box<dyn PhaseDetector>,
        aligner: PhaseAligner,
        tsc: Tsc,
        local: Arc<LocalIo>,
        ports: Vec<DownstreamPort>,
        table: RoutingTable,
        settings: SatelliteSettings,
        aux: AuxSettings,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            tsc,
            settings,
            up: Uplink {
                fsm: LinkFsm::new(upstream),
                transceiver,
                aux: AuxController::new(upstream, aux, 1),
                aligner,
                detector,
                phy_up: false,
                hello_sent: false,
                aux_errors: 0,
            },
            reported: vec![PortReport::default(); ports.len()],
            ports,
            table,
            local,
            stats: SatelliteStats::default(),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// State of the upstream link as seen from this side.
    pub fn link_state(&self) -> LinkState {
        self.up.fsm.state()
    }

    pub fn is_synchronized(&self) -> bool {
        self.up.fsm.is_synchronized()
    }

    pub fn is_phase_locked(&self) -> bool {
        self.up.aligner.is_locked()
    }

    pub fn alarm(&self) -> bool {
        self.up.fsm.alarm()
    }

    pub fn now(&self) -> u64 {
        self.tsc.now()
    }

    pub fn local(&self) -> &Arc<LocalIo> {
        &self.local
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn ports(&self) -> &[DownstreamPort] {
        &self.ports
    }

    pub fn stats(&self) -> &SatelliteStats {
        &self.stats
    }

    pub fn uplink_counters(&self) -> &LinkCounters {
        self.up.fsm.counters()
    }

    /// Run one tick.  The TSC must already have advanced.
    pub fn step(&mut self) {
        self.step_uplink();

        let now = self.tsc.now();
        for reject in self.local.execute_due(now) {
            self.report(
                RemoteError::new(RemoteErrorKind::ChannelFault)
                    .on_channel(reject.channel)
                    .at(now),
            );
        }

        self.step_ports(now);

        if self.up.phy_up {
            for bytes in self.up.aux.poll_transmit(now) {
                self.up.transceiver.send(Frame::Aux(bytes));
            }
        }
    }

    // ── Upstream link ─────────────────────────────────────────────────────────

    fn step_uplink(&mut self) {
        let now = self.tsc.now();
        let phy = self.up.transceiver.phy_state();
        if phy != PhyState::Up && self.up.phy_up {
            self.up.phy_up = false;
            self.up.aux.reset_session();
            // Only resets caused by bad frames are reported.
            self.up.aux.take_session_reset();
        }
        if phy == PhyState::Down {
            if self.up.fsm.down(DownReason::PhyLost) {
                self.lose_sync(now);
            }
            self.up.aligner.reset();
            self.up.hello_sent = false;
            return;
        }
        self.up.phy_up = phy == PhyState::Up;

        if self.up.fsm.begin_calibration(now) {
            self.up.aligner.reset();
            self.up.hello_sent = false;
        }

        // Searching is part of calibration; only a lost lock drops the link.
        let status = self.up.aligner.step(self.up.detector.as_mut());
        if status != AlignerStatus::Locked
            && self.up.fsm.is_synchronized()
            && self.up.fsm.down(DownReason::PhaseUnlock)
        {
            self.lose_sync(now);
            self.up.fsm.begin_calibration(now);
        }

        let mut dropped = 0u64;
        while let Some(frame) = self.up.transceiver.recv() {
            match frame {
                Frame::Rt(RtPacket::Ping { seq }) => {
                    self.up.transceiver.send(Frame::Rt(RtPacket::Pong { seq }));
                }
                Frame::Rt(RtPacket::TscLoad { coarse, latency }) => self.on_tsc_load(coarse, latency),
                Frame::Rt(RtPacket::TscSync { coarse }) => self.on_tsc_sync(coarse),
                Frame::Rt(RtPacket::Write {
                    destination,
                    command,
                }) => {
                    if self.up.fsm.is_synchronized() {
                        self.on_write(destination, command);
                    } else {
                        dropped += 1;
                    }
                }
                Frame::Rt(RtPacket::Pong { .. }) => {}
                Frame::Aux(bytes) => match self.up.aux.receive(&bytes) {
                    Ok(Some(frame)) => self.on_aux(frame, true),
                    Ok(None) => {}
                    Err(_) => {
                        self.up.fsm.counters_mut().aux_protocol_errors += 1;
                        self.up.aux_errors += 1;
                        if self.up.aux.take_session_reset() {
                            let count = std::mem::take(&mut self.up.aux_errors);
                            warn!(node = %self.id, count, "✗ upstream aux session reset");
                            self.report(
                                RemoteError::new(RemoteErrorKind::AuxProtocol)
                                    .count(count)
                                    .at(self.tsc.now()),
                            );
                        }
                    }
                },
            }
        }
        if dropped > 0 {
            warn!(node = %self.id, dropped, "commands received while not synchronized");
            self.stats.commands_dropped += dropped;
            self.report(
                RemoteError::new(RemoteErrorKind::LinkDown)
                    .count(dropped)
                    .at(self.tsc.now()),
            );
        }

        let now = self.tsc.now();
        if self.up.phy_up
            && !self.up.hello_sent
            && self.up.aligner.is_locked()
            && matches!(self.up.fsm.state(), LinkState::Calibrating { .. })
        {
            let hello = AuxFrame::new(
                self.id,
                self.up.fsm.link().node,
                AuxMessage::Hello {
                    node: self.id,
                    name: self.name.clone(),
                },
            );
            self.up.aux.enqueue(hello);
            self.up.hello_sent = true;
            debug!(node = %self.id, "phase locked, hello queued");
        }

        if self
            .up
            .fsm
            .calibration_expired(now, self.settings.calibration_window)
        {
            let attempts = self
                .up
                .fsm
                .calibration_timeout(now, self.settings.alarm_after);
            self.up.aligner.reset();
            self.up.hello_sent = false;
            if attempts == self.settings.alarm_after {
                self.report(
                    RemoteError::new(RemoteErrorKind::CalibrationTimeout)
                        .count(u64::from(attempts))
                        .at(now),
                );
            }
        }
    }

    fn on_tsc_load(&mut self, coarse: u64, latency: u64) {
        let calibrating = matches!(self.up.fsm.state(), LinkState::Calibrating { .. });
        if !calibrating || !self.up.aligner.is_locked() || !self.up.phy_up {
            warn!(node = %self.id, coarse, state = ?self.up.fsm.state(), "TscLoad ignored");
            return;
        }
        self.tsc.load(coarse);
        self.stats.tsc_loads += 1;
        self.up.fsm.synchronized(latency, coarse);
        // The master may have lost the state of the links below us.
        let statuses: Vec<AuxMessage> = self
            .ports
            .iter()
            .map(|port| {
                let state = port.state();
                AuxMessage::LinkStatus {
                    port: port.port(),
                    state: state.kind(),
                    latency: port.latency(),
                }
            })
            .collect();
        for message in statuses {
            self.send_up(message);
        }
    }

    fn on_tsc_sync(&mut self, coarse: u64) {
        if !self.up.fsm.is_synchronized() {
            return;
        }
        let local = self.tsc.now();
        let diff = coarse.abs_diff(local);
        if diff > self.settings.tolerance {
            error!(node = %self.id, master = coarse, local, diff, "✗ TSC divergence");
            self.up.fsm.down(DownReason::TscFault);
            self.lose_sync(local);
        }
    }

    /// The upstream link dropped: pending local commands can no longer be
    /// trusted to execute on time.
    fn lose_sync(&mut self, now: u64) {
        self.up.aligner.reset();
        self.up.hello_sent = false;
        let flushed = self.local.flush();
        if flushed > 0 {
            warn!(node = %self.id, flushed, "pending commands flushed");
            self.report(
                RemoteError::new(RemoteErrorKind::LinkDown)
                    .count(flushed as u64)
                    .at(now),
            );
        }
    }

    // ── Commands ──────────────────────────────────────────────────────────────

    fn on_write(&mut self, destination: NodeId, command: TimedCommand) {
        let now = self.tsc.now();
        self.stats.commands_received += 1;
        if destination == self.id {
            let kind = match self.local.push(command, now) {
                Ok(()) => return,
                Err(PushError::Underflow) => RemoteErrorKind::Underflow,
                Err(PushError::Overflow) => RemoteErrorKind::Overflow,
                Err(PushError::UnknownChannel) => RemoteErrorKind::UnknownChannel,
                Err(PushError::Unsupported) => RemoteErrorKind::Unsupported,
            };
            warn!(node = %self.id, channel = %command.channel, at = %command.timestamp, now, %kind, "✗ command rejected");
            self.report(
                RemoteError::new(kind)
                    .on_channel(command.channel)
                    .at(command.timestamp.coarse()),
            );
            return;
        }
        match self.table.get(destination) {
            NextHop::Port(p) => match self
                .ports
                .get_mut(usize::from(p))
                .map(|port| port.forward(destination, command, now))
            {
                Some(true) => {
                    self.stats.commands_forwarded += 1;
                }
                Some(false) => self.report(
                    RemoteError::new(RemoteErrorKind::LinkDown)
                        .on_channel(command.channel)
                        .on_port(p)
                        .at(command.timestamp.coarse()),
                ),
                None => self.report_no_route(command),
            },
            NextHop::Local | NextHop::NoRoute => self.report_no_route(command),
        }
    }

    fn report_no_route(&mut self, command: TimedCommand) {
        self.report(
            RemoteError::new(RemoteErrorKind::NoRoute)
                .on_channel(command.channel)
                .at(command.timestamp.coarse()),
        );
    }

    // ── Aux ───────────────────────────────────────────────────────────────────

    fn report(&mut self, error: RemoteError) {
        self.stats.reports_sent += 1;
        self.send_up(AuxMessage::ErrorReport(error));
    }

    fn send_up(&mut self, message: AuxMessage) {
        self.up
            .aux
            .enqueue(AuxFrame::new(self.id, NodeId::MASTER, message));
    }

    /// Send towards `frame.destination`: down if the table knows it, up
    /// otherwise.
    fn send_aux(&mut self, frame: AuxFrame) {
        if let NextHop::Port(p) = self.table.get(frame.destination) {
            if let Some(port) = self.ports.get_mut(usize::from(p)) {
                port.send_aux(frame);
                return;
            }
        }
        self.up.aux.enqueue(frame);
    }

    fn on_aux(&mut self, frame: AuxFrame, from_upstream: bool) {
        if frame.destination != self.id {
            let downward = matches!(
                self.table.get(frame.destination),
                NextHop::Port(p) if usize::from(p) < self.ports.len()
            );
            if from_upstream && !downward {
                warn!(node = %self.id, dest = %frame.destination, "aux frame with no route dropped");
                return;
            }
            self.send_aux(frame);
            return;
        }
        match frame.message {
            AuxMessage::EchoRequest { nonce } => {
                self.send_aux(AuxFrame::new(
                    self.id,
                    frame.source,
                    AuxMessage::EchoReply { nonce },
                ));
            }
            AuxMessage::RoutingUpdate { version, table } => {
                let (accepted, reason) = match self.check_table(&table) {
                    Ok(()) => {
                        info!(node = %self.id, version, "✓ routing table installed");
                        self.table = table;
                        (true, String::new())
                    }
                    Err(reason) => {
                        warn!(node = %self.id, %reason, "✗ routing table refused");
                        (false, reason)
                    }
                };
                self.send_aux(AuxFrame::new(
                    self.id,
                    frame.source,
                    AuxMessage::RoutingAck {
                        version,
                        accepted,
                        reason,
                    },
                ));
            }
            other => debug!(node = %self.id, ?other, "unexpected aux message"),
        }
    }

    fn check_table(&self, table: &RoutingTable) -> Result<(), String> {
        if table.get(self.id) != NextHop::Local {
            return Err(format!("entry for node {} is not local", self.id));
        }
        for (dest, hop) in table.routed() {
            if let NextHop::Port(p) = hop {
                if usize::from(p) >= self.ports.len() {
                    return Err(format!("destination {dest} uses missing port {p}"));
                }
            }
        }
        Ok(())
    }

    // ── Repeater ports ────────────────────────────────────────────────────────

    fn step_ports(&mut self, now: u64) {
        let mut events = Vec::new();
        for i in 0..self.ports.len() {
            self.ports[i].step(now, &mut events);
            let port = self.ports[i].port();
            let mut failed = 0u64;
            for event in events.drain(..) {
                match event {
                    PortEvent::StateChanged(state) => {
                        let latency = match state {
                            LinkState::Synchronized { latency, .. } => Some(latency),
                            _ => None,
                        };
                        self.send_up(AuxMessage::LinkStatus {
                            port,
                            state: state.kind(),
                            latency,
                        });
                    }
                    PortEvent::Aux(frame) => self.on_aux(frame, false),
                    PortEvent::Failed { .. } => failed += 1,
                    PortEvent::CalibrationAlarm { attempts } => self.report(
                        RemoteError::new(RemoteErrorKind::CalibrationTimeout)
                            .on_port(port)
                            .count(u64::from(attempts))
                            .at(now),
                    ),
                    PortEvent::TopologyMismatch { found } => self.report(
                        RemoteError::new(RemoteErrorKind::TopologyMismatch)
                            .on_port(port)
                            .count(u64::from(found.0))
                            .at(now),
                    ),
                    PortEvent::Retired { .. }
                    | PortEvent::CalibrationTimeout { .. }
                    | PortEvent::AuxError(_)
                    | PortEvent::AuxReset => {}
                }
            }
            if failed > 0 {
                self.report(
                    RemoteError::new(RemoteErrorKind::LinkDown)
                        .on_port(port)
                        .count(failed)
                        .at(now),
                );
            }
            self.report_port_counters(i, now);
        }
    }

    fn report_port_counters(&mut self, i: usize, now: u64) {
        let (port, counters, alarm) = {
            let p = &self.ports[i];
            (p.port(), *p.counters(), p.alarm())
        };
        let last = self.reported[i];
        let due = match last.at {
            None => true,
            Some(_) if alarm != last.alarm => true,
            Some(at) => {
                counters != last.counters && now.saturating_sub(at) >= COUNTER_REPORT_INTERVAL
            }
        };
        if !due {
            return;
        }
        self.reported[i] = PortReport {
            counters,
            alarm,
            at: Some(now),
        };
        self.send_up(AuxMessage::PortCounters {
            port,
            counters,
            alarm,
        });
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
