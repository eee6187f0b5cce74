/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Structured error types for the DRTIO fabric.
//!
//! The enums follow the two failure layers of the fabric:
//!
//! * Real-time path errors ([`CriError`]) are returned synchronously from
//!   [`Interconnect::submit()`](crate::cri::Interconnect::submit) and are
//!   never discovered after the fact.
//! * Control-plane errors ([`AuxProtocolError`], [`RoutingError`],
//!   [`DmaError`]) come from the auxiliary channel, the administrative
//!   interface and the DMA decoder.
//!
//! [`DrtioError`] is the top-level taxonomy that every error converts into:
//!
//! | Variant | Retried automatically | Surfaced to |
//! |---|---|---|
//! | `LinkDown` | yes (link re-trains) | command source / event stream |
//! | `CalibrationTimeout` | yes, forever | operator alarm |
//! | `NoRoute` | no | command source |
//! | `SequenceError` | no, caller picks a later time | command source |
//! | `AuxProtocol` | message dropped | log + counters |
//!
//! **Do not** replace these with `anyhow::Error` in library paths: callers
//! match on the variants.

use thiserror::Error;

use crate::channel::ChannelId;
use crate::cri::Opcode;
use crate::link::LinkId;
use crate::node::NodeId;

// ── Real-time path ────────────────────────────────────────────────────────────

/// Rejection returned synchronously by the CRI interconnect.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CriError {
    /// The channel index is not owned by any node in the current snapshot.
    #[error("channel {channel} is not mapped to any node")]
    UnknownChannel { channel: ChannelId },

    /// The routing table has no path to the channel's owner.
    #[error("no route to destination {destination}")]
    NoRoute { destination: NodeId },

    /// A link on the path is not synchronized, or went down while the command
    /// was in flight.
    #[error("link {link} is down (destination {destination})")]
    LinkDown { link: LinkId, destination: NodeId },

    /// The timestamp cannot be honoured: either it is not strictly after
    /// `now + latency`, or it goes backwards on its channel.
    #[error("sequence error on channel {channel}: timestamp {timestamp} not after {earliest}")]
    SequenceError {
        channel: ChannelId,
        timestamp: u64,
        /// Last coarse tick that is already too late.
        earliest: u64,
    },

    /// The channel cannot execute this opcode (e.g. `Sample` on an
    /// output-only channel).
    #[error("channel {channel} does not support {opcode:?}")]
    UnsupportedOpcode { channel: ChannelId, opcode: Opcode },

    /// The local FIFO or the source's egress quota is exhausted.  Retryable.
    #[error("buffer full towards destination {destination}")]
    BufferFull { destination: NodeId },

    /// A routing update for the destination is draining.  Retryable.
    #[error("routing update in progress for destination {destination}")]
    RouteBusy { destination: NodeId },
}

// ── Aux protocol ──────────────────────────────────────────────────────────────

/// A malformed or incompatible auxiliary frame.  The frame is dropped; the
/// session is only reset after repeated errors.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AuxProtocolError {
    #[error("cannot decode aux frame: {0}")]
    Decode(#[from] prost::DecodeError),

    /// The peer runs a different protocol version.
    #[error("aux protocol version mismatch: expected {expected}, found {found}")]
    VersionMismatch { expected: u32, found: u32 },

    /// A sequenced frame without a body.
    #[error("aux frame seq {seq} carries no body")]
    MissingBody { seq: u32 },

    /// An error report whose kind this firmware does not know.
    #[error("unknown error report kind {0}")]
    UnknownErrorKind(i32),

    /// The body decoded but its content is out of range.
    #[error("malformed aux body: {0}")]
    MalformedBody(String),
}

// ── Routing ───────────────────────────────────────────────────────────────────

/// A routing-table write that would break the loop-free invariant, or a
/// malformed table received on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("the master's entry for itself must be local")]
    MasterNotLocal,

    #[error("node {0} is not part of the topology")]
    UnknownNode(NodeId),

    #[error("node {node} has no downstream port {port}")]
    UnknownPort { node: NodeId, port: u8 },

    #[error("routing loop towards destination {destination} at node {at}")]
    Loop { destination: NodeId, at: NodeId },

    #[error("path to destination {destination} exceeds {max} hops")]
    HopLimit { destination: NodeId, max: usize },

    /// A node claims the destination is local but it is a different node.
    #[error("node {at} routes destination {destination} locally")]
    Misrouted { destination: NodeId, at: NodeId },

    #[error("malformed routing table: {0}")]
    MalformedTable(String),

    /// Another update has not finished draining yet.
    #[error("a routing update is already pending")]
    UpdatePending,
}

// ── DMA ───────────────────────────────────────────────────────────────────────

/// Errors from decoding or replaying a DMA command sequence.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("DMA record at offset {offset} is truncated")]
    Truncated { offset: usize },

    #[error("DMA record at offset {offset} carries {len} data bytes (max 64)")]
    DataTooWide { offset: usize, len: usize },

    /// Shifting record `index` by the playback offset overflows the timeline.
    #[error("DMA record {index} lands past the end of the timeline")]
    TimestampOverflow { index: usize },

    #[error("DMA sequence has no terminating record")]
    Unterminated,

    /// Playback stopped at `index` because the interconnect rejected a record.
    #[error("DMA playback stopped at record {index}: {source}")]
    Submit {
        index: usize,
        #[source]
        source: CriError,
    },
}

// ── Channel driver ────────────────────────────────────────────────────────────

/// Rejection from a hardware channel driver.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("driver rejected channel {channel}: {reason}")]
pub struct DriverReject {
    pub channel: ChannelId,
    pub reason: String,
}

// ── Top-level taxonomy ────────────────────────────────────────────────────────

/// Every failure of the fabric, attributable to one cause.
#[derive(Debug, Error)]
pub enum DrtioError {
    #[error("link {0} is down")]
    LinkDown(LinkId),

    #[error("link {link} failed to calibrate after {attempts} attempt(s)")]
    CalibrationTimeout { link: LinkId, attempts: u32 },

    #[error("no route to destination {0}")]
    NoRoute(NodeId),

    #[error(transparent)]
    SequenceError(CriError),

    #[error(transparent)]
    Cri(CriError),

    #[error(transparent)]
    AuxProtocol(#[from] AuxProtocolError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Dma(#[from] DmaError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl From<CriError> for DrtioError {
    fn from(e: CriError) -> Self {
        match e {
            CriError::LinkDown { link, .. } => DrtioError::LinkDown(link),
            CriError::NoRoute { destination } => DrtioError::NoRoute(destination),
            e @ CriError::SequenceError { .. } => DrtioError::SequenceError(e),
            other => DrtioError::Cri(other),
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
