/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Transceiver boundary and the simulated serial link.
//!
//! Real-time packets and auxiliary frames share one link, in order, with a
//! fixed one-way latency.  A [`SimLink`] is the control handle (tick, fault
//! injection); its two [`SimEndpoint`]s are handed to the nodes on either end.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::cri::TimedCommand;
use crate::node::NodeId;

/// Link state as reported by the physical layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyState {
    /// No signal.
    Down,
    /// Signal present, word alignment not yet achieved.
    Training,
    /// Byte/word aligned; frames flow.
    Up,
}

/// Real-time data-path packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RtPacket {
    /// Initial TSC value; `coarse` is the sender's TSC at arrival time and
    /// `latency` the calibrated one-way latency of the link.
    TscLoad { coarse: u64, latency: u64 },
    /// Periodic TSC broadcast, same convention as `TscLoad`.
    TscSync { coarse: u64 },
    /// Latency calibration ping.
    Ping { seq: u32 },
    Pong { seq: u32 },
    /// A timed command on its way to `destination`.
    Write {
        destination: NodeId,
        command: TimedCommand,
    },
}

/// One link-layer frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Rt(RtPacket),
    Aux(Vec<u8>),
}

/// The transceiver as seen by a node.
pub trait Transceiver: Send {
    fn phy_state(&self) -> PhyState;

    /// Queue a frame for transmission.  Returns `false` if the frame was lost
    /// because the link is not up.
    fn send(&mut self, frame: Frame) -> bool;

    /// Next received frame, if one has arrived.
    fn recv(&mut self) -> Option<Frame>;
}

// ── Simulated link ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Upstream,
    Downstream,
}

#[derive(Debug)]
struct InFlight {
    due: u64,
    frame: Frame,
}

#[derive(Debug)]
struct Wire {
    clock: u64,
    latency: u64,
    training: u64,
    connected: bool,
    /// Ticks since the link was (re)connected.
    up_for: u64,
    to_downstream: VecDeque<InFlight>,
    to_upstream: VecDeque<InFlight>,
    drop_aux_down: u32,
    drop_aux_up: u32,
    corrupt_aux_down: u32,
}

impl Wire {
    fn phy_state(&self) -> PhyState {
        if !self.connected {
            PhyState::Down
        } else if self.up_for < self.training {
            PhyState::Training
        } else {
            PhyState::Up
        }
    }
}

/// Control handle of a simulated point-to-point link.
#[derive(Debug, Clone)]
pub struct SimLink {
    wire: Arc<Mutex<Wire>>,
}

impl SimLink {
    /// A connected link with `latency` ticks one-way delay that needs
    /// `training` ticks before word alignment.  Returns the handle and the
    /// `(upstream, downstream)` endpoints.
    pub fn new(latency: u64, training: u64) -> (Self, SimEndpoint, SimEndpoint) {
        let wire = Arc::new(Mutex::new(Wire {
            clock: 0,
            latency,
            training,
            connected: true,
            up_for: 0,
            to_downstream: VecDeque::new(),
            to_upstream: VecDeque::new(),
            drop_aux_down: 0,
            drop_aux_up: 0,
            corrupt_aux_down: 0,
        }));
        let up = SimEndpoint {
            wire: wire.clone(),
            side: Side::Upstream,
        };
        let down = SimEndpoint {
            wire: wire.clone(),
            side: Side::Downstream,
        };
        (Self { wire }, up, down)
    }

    /// Advance the link clock by one tick.
    pub fn tick(&self) {
        let mut w = self.wire.lock();
        w.clock += 1;
        if w.connected {
            w.up_for += 1;
        }
    }

    pub fn phy_state(&self) -> PhyState {
        self.wire.lock().phy_state()
    }

    /// Plug or unplug the cable.  Frames on the wire are lost on unplug; on
    /// re-plug the link trains again.
    pub fn set_connected(&self, connected: bool) {
        let mut w = self.wire.lock();
        if w.connected == connected {
            return;
        }
        w.connected = connected;
        w.up_for = 0;
        if !connected {
            let lost = w.to_downstream.len() + w.to_upstream.len();
            w.to_downstream.clear();
            w.to_upstream.clear();
            info!(lost, "sim link disconnected");
        } else {
            info!("sim link reconnected");
        }
    }

    /// Silently drop the next `n` aux frames travelling downstream.
    pub fn drop_aux_downstream(&self, n: u32) {
        self.wire.lock().drop_aux_down += n;
    }

    /// Silently drop the next `n` aux frames travelling upstream.
    pub fn drop_aux_upstream(&self, n: u32) {
        self.wire.lock().drop_aux_up += n;
    }

    /// Replace the next `n` downstream aux frames with garbage.
    pub fn corrupt_aux_downstream(&self, n: u32) {
        self.wire.lock().corrupt_aux_down += n;
    }

    pub fn latency(&self) -> u64 {
        self.wire.lock().latency
    }
}

/// One end of a [`SimLink`].
#[derive(Debug)]
pub struct SimEndpoint {
    wire: Arc<Mutex<Wire>>,
    side: Side,
}

impl Transceiver for SimEndpoint {
    fn phy_state(&self) -> PhyState {
        self.wire.lock().phy_state()
    }

    fn send(&mut self, frame: Frame) -> bool {
        let mut w = self.wire.lock();
        if w.phy_state() != PhyState::Up {
            return false;
        }
        let frame = match (&frame, self.side) {
            (Frame::Aux(_), Side::Upstream) if w.drop_aux_down > 0 => {
                w.drop_aux_down -= 1;
                debug!("sim link: dropping downstream aux frame");
                return true;
            }
            (Frame::Aux(_), Side::Downstream) if w.drop_aux_up > 0 => {
                w.drop_aux_up -= 1;
                debug!("sim link: dropping upstream aux frame");
                return true;
            }
            (Frame::Aux(_), Side::Upstream) if w.corrupt_aux_down > 0 => {
                w.corrupt_aux_down -= 1;
                Frame::Aux(vec![0xff; 4])
            }
            _ => frame,
        };
        let due = w.clock + w.latency;
        let queue = match self.side {
            Side::Upstream => &mut w.to_downstream,
            Side::Downstream => &mut w.to_upstream,
        };
        queue.push_back(InFlight { due, frame });
        true
    }

    fn recv(&mut self) -> Option<Frame> {
        let mut w = self.wire.lock();
        let clock = w.clock;
        let queue = match self.side {
            Side::Upstream => &mut w.to_upstream,
            Side::Downstream => &mut w.to_downstream,
        };
        if queue.front().is_some_and(|f| f.due <= clock) {
            queue.pop_front().map(|f| f.frame)
        } else {
            None
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
