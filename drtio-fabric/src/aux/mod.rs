/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Auxiliary control channel.
//!
//! Low-bandwidth, reliable, ordered messaging multiplexed with the real-time
//! path on every link.  Nothing on the real-time path ever waits for it.
//!
//! ```text
//!   AuxFrame ──► AuxController::enqueue ──► poll_transmit ──► Frame::Aux(bytes) ──► wire
//!   wire ──► Frame::Aux(bytes) ──► AuxController::receive ──► Some(AuxFrame) (exactly once)
//! ```
//!
//! * [`packet`] is the versioned protobuf envelope.
//! * [`controller`] adds sequencing, acknowledgement and retransmission.

pub mod controller;
pub mod packet;

use std::fmt;

use crate::channel::ChannelId;
use crate::link::{LinkCounters, LinkStateKind};
use crate::node::NodeId;
use crate::routing::RoutingTable;

pub use controller::{AuxController, AuxStats};

/// Tunables of every aux controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuxSettings {
    /// Ticks before unacknowledged messages are resent.
    pub retransmit_after: u64,
    /// Maximum number of unacknowledged messages.
    pub window: usize,
    /// Consecutive protocol errors that reset the session.
    pub error_threshold: u32,
    /// Ticks the master waits for an echo reply before giving up.
    pub echo_timeout: u64,
}

impl Default for AuxSettings {
    fn default() -> Self {
        Self {
            retransmit_after: 32,
            window: 8,
            error_threshold: 8,
            echo_timeout: 1024,
        }
    }
}

/// Cause carried by an asynchronous error report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RemoteErrorKind {
    /// A command reached its node after its timestamp.
    Underflow,
    /// A channel FIFO was full.
    Overflow,
    UnknownChannel,
    NoRoute,
    /// Commands were dropped because a link went down.
    LinkDown,
    CalibrationTimeout,
    /// The channel driver rejected a due command.
    ChannelFault,
    /// A `Hello` came from an unexpected node.
    TopologyMismatch,
    Unsupported,
    /// Enough consecutive bad aux frames arrived to reset the session.
    AuxProtocol,
}

impl fmt::Display for RemoteErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RemoteErrorKind::Underflow => "underflow",
            RemoteErrorKind::Overflow => "overflow",
            RemoteErrorKind::UnknownChannel => "unknown channel",
            RemoteErrorKind::NoRoute => "no route",
            RemoteErrorKind::LinkDown => "link down",
            RemoteErrorKind::CalibrationTimeout => "calibration timeout",
            RemoteErrorKind::ChannelFault => "channel fault",
            RemoteErrorKind::TopologyMismatch => "topology mismatch",
            RemoteErrorKind::Unsupported => "unsupported opcode",
            RemoteErrorKind::AuxProtocol => "aux protocol",
        };
        f.write_str(s)
    }
}

/// Body of an `ErrorReport`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteError {
    pub kind: RemoteErrorKind,
    pub channel: Option<ChannelId>,
    /// Downstream port of the reporting node, for link-related reports.
    pub port: Option<u8>,
    /// Number of commands affected (or attempts, for calibration).
    pub count: u64,
    /// Reporter's coarse TSC, or the offending command's timestamp.
    pub timestamp: u64,
}

impl RemoteError {
    pub fn new(kind: RemoteErrorKind) -> Self {
        Self {
            kind,
            channel: None,
            port: None,
            count: 1,
            timestamp: 0,
        }
    }

    pub fn on_channel(mut self, channel: ChannelId) -> Self {
        self.channel = Some(channel);
        self
    }

    pub fn on_port(mut self, port: u8) -> Self {
        self.port = Some(port);
        self
    }

    pub fn count(mut self, count: u64) -> Self {
        self.count = count;
        self
    }

    pub fn at(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Decoded aux payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuxMessage {
    /// Sent by a satellite once its clock is phase locked.
    Hello { node: NodeId, name: String },
    EchoRequest { nonce: u64 },
    EchoReply { nonce: u64 },
    ErrorReport(RemoteError),
    /// Replace the receiver's routing table with the one of snapshot
    /// `version`.
    RoutingUpdate { version: u64, table: RoutingTable },
    /// Answer to the `RoutingUpdate` of the same `version`.
    RoutingAck {
        version: u64,
        accepted: bool,
        reason: String,
    },
    /// State of one of the sender's downstream ports.
    LinkStatus {
        port: u8,
        state: LinkStateKind,
        latency: Option<u64>,
    },
    /// Counters and alarm of one of the sender's downstream ports.
    PortCounters {
        port: u8,
        counters: LinkCounters,
        alarm: bool,
    },
}

/// An addressed aux message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxFrame {
    pub source: NodeId,
    pub destination: NodeId,
    pub message: AuxMessage,
}

impl AuxFrame {
    pub fn new(source: NodeId, destination: NodeId, message: AuxMessage) -> Self {
        Self {
            source,
            destination,
            message,
        }
    }
}
