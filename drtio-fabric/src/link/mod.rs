/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Per-link synchronization state machine.
//!
//! ```text
//!            phy up                    TscLoad sent / received
//!   Down ───────────────► Calibrating ─────────────────────────► Synchronized
//!    ▲                        │  ▲                                    │
//!    │     calibration window │  │ retry (attempt + 1)                │
//!    │          expired       ▼  │                                    │
//!    └──────────────────── (Down) ◄───── phy lost / TSC fault ────────┘
//! ```
//!
//! The transceiver itself is external; [`phy`] defines the boundary and a
//! simulated link used by the fabric simulator.

pub mod board;
pub mod phy;

use std::fmt;

use tracing::{error, info, warn};

use crate::node::NodeId;

pub use board::{LinkBoard, LinkReport};
pub use phy::{Frame, PhyState, RtPacket, SimEndpoint, SimLink, Transceiver};

// ── LinkId ────────────────────────────────────────────────────────────────────

/// A link, named by its upstream end: downstream port `port` of `node`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkId {
    pub node: NodeId,
    pub port: u8,
}

impl LinkId {
    pub fn new(node: NodeId, port: u8) -> Self {
        Self { node, port }
    }
}

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.port)
    }
}

// ── LinkState ─────────────────────────────────────────────────────────────────

/// State of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// No valid signal; nothing is routed across the link.
    Down,
    /// Alignment and latency calibration in progress.  The aux channel may be
    /// used for the handshake; the real-time path is not trusted.
    Calibrating { since: u64, attempt: u32 },
    /// TSC loaded; `latency` is the calibrated one-way latency in coarse
    /// ticks, `epoch` the tick the link came up.
    Synchronized { latency: u64, epoch: u64 },
}

/// Discriminant of [`LinkState`], used in status reports and on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkStateKind {
    Down,
    Calibrating,
    Synchronized,
}

impl LinkState {
    pub fn kind(&self) -> LinkStateKind {
        match self {
            LinkState::Down => LinkStateKind::Down,
            LinkState::Calibrating { .. } => LinkStateKind::Calibrating,
            LinkState::Synchronized { .. } => LinkStateKind::Synchronized,
        }
    }
}

impl fmt::Display for LinkStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LinkStateKind::Down => "down",
            LinkStateKind::Calibrating => "calibrating",
            LinkStateKind::Synchronized => "synchronized",
        };
        f.write_str(s)
    }
}

/// Why a link left `Calibrating` or `Synchronized`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownReason {
    PhyLost,
    /// Coarse timestamp diverged beyond tolerance.
    TscFault,
    CalibrationTimeout,
    /// The satellite's recovered clock lost phase lock.
    PhaseUnlock,
    /// The satellite announced itself again while the link was up.
    PeerRestart,
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Error and activity counters of one link, exposed to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LinkCounters {
    pub link_downs: u64,
    pub calibration_attempts: u64,
    pub calibration_timeouts: u64,
    pub tsc_faults: u64,
    pub aux_protocol_errors: u64,
    pub commands_forwarded: u64,
    pub commands_failed: u64,
    pub remote_errors: u64,
}

// ── LinkFsm ───────────────────────────────────────────────────────────────────

/// The state machine of one link plus its counters and alarm flag.
#[derive(Debug, Clone)]
pub struct LinkFsm {
    link: LinkId,
    state: LinkState,
    counters: LinkCounters,
    /// Consecutive calibration failures since the last successful lock.
    failures: u32,
    alarm: bool,
}

impl LinkFsm {
    pub fn new(link: LinkId) -> Self {
        Self {
            link,
            state: LinkState::Down,
            counters: LinkCounters::default(),
            failures: 0,
            alarm: false,
        }
    }

    pub fn link(&self) -> LinkId {
        self.link
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn is_synchronized(&self) -> bool {
        matches!(self.state, LinkState::Synchronized { .. })
    }

    pub fn latency(&self) -> Option<u64> {
        match self.state {
            LinkState::Synchronized { latency, .. } => Some(latency),
            _ => None,
        }
    }

    pub fn counters(&self) -> &LinkCounters {
        &self.counters
    }

    pub fn counters_mut(&mut self) -> &mut LinkCounters {
        &mut self.counters
    }

    /// `true` once calibration failed `alarm_after` times in a row.
    pub fn alarm(&self) -> bool {
        self.alarm
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures
    }

    /// `Down → Calibrating`.  No-op (returns `false`) from any other state.
    pub fn begin_calibration(&mut self, now: u64) -> bool {
        if self.state != LinkState::Down {
            return false;
        }
        let attempt = self.failures + 1;
        self.state = LinkState::Calibrating {
            since: now,
            attempt,
        };
        self.counters.calibration_attempts += 1;
        info!(link = %self.link, attempt, now, "link calibrating");
        true
    }

    /// Whether the current calibration attempt ran past `window` ticks.
    pub fn calibration_expired(&self, now: u64, window: u64) -> bool {
        match self.state {
            LinkState::Calibrating { since, .. } => now.saturating_sub(since) >= window,
            _ => false,
        }
    }

    /// Record a failed calibration attempt and restart calibration right
    /// away.  Returns the number of consecutive failures.
    pub fn calibration_timeout(&mut self, now: u64, alarm_after: u32) -> u32 {
        self.failures += 1;
        self.counters.calibration_timeouts += 1;
        self.down(DownReason::CalibrationTimeout);
        if self.failures >= alarm_after && !self.alarm {
            self.alarm = true;
            error!(
                link = %self.link,
                attempts = self.failures,
                "calibration keeps failing, operator attention required"
            );
        }
        self.begin_calibration(now);
        self.failures
    }

    /// `Calibrating → Synchronized`.
    pub fn synchronized(&mut self, latency: u64, now: u64) {
        if self.alarm {
            info!(link = %self.link, "calibration alarm cleared");
        }
        self.failures = 0;
        self.alarm = false;
        self.state = LinkState::Synchronized {
            latency,
            epoch: now,
        };
        info!(link = %self.link, latency, epoch = now, "✓ link synchronized");
    }

    /// Drop the link.  Returns `true` if the state changed.
    pub fn down(&mut self, reason: DownReason) -> bool {
        if self.state == LinkState::Down {
            return false;
        }
        let was = self.state.kind();
        self.state = LinkState::Down;
        self.counters.link_downs += 1;
        if reason == DownReason::TscFault {
            self.counters.tsc_faults += 1;
        }
        match reason {
            DownReason::CalibrationTimeout => {
                warn!(link = %self.link, from = %was, ?reason, "link down")
            }
            _ => error!(link = %self.link, from = %was, ?reason, "✗ link down"),
        }
        true
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
