/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Aux wire format.
//!
//! Every aux frame is one length-delimited protobuf [`AuxEnvelope`].  The
//! message types are declared with `prost` derives directly (there is no
//! `.proto` compilation step); tags are part of the wire contract and must
//! never be reused.
//!
//! | Field | Meaning |
//! |---|---|
//! | `version` | [`AUX_PROTOCOL_VERSION`]; mismatches are rejected |
//! | `session` | sender's session id, changes on every session reset |
//! | `seq` | sender's sequence number, `0` for a pure acknowledgement |
//! | `base` | oldest unacknowledged `seq` of the sender |
//! | `ack` / `ack_session` | next `seq` expected from the peer, and for which session |
//! | `source` / `destination` | node ids for multi-hop forwarding |

use prost::Message;

use crate::aux::{AuxFrame, AuxMessage, RemoteError, RemoteErrorKind};
use crate::channel::ChannelId;
use crate::error::AuxProtocolError;
use crate::link::{LinkCounters, LinkStateKind};
use crate::node::NodeId;
use crate::routing::RoutingTable;

/// Version carried by every envelope.  Bump on any incompatible change.
pub const AUX_PROTOCOL_VERSION: u32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct AuxEnvelope {
    #[prost(uint32, tag = "1")]
    pub version: u32,
    #[prost(uint32, tag = "2")]
    pub session: u32,
    #[prost(uint32, tag = "3")]
    pub seq: u32,
    #[prost(uint32, tag = "4")]
    pub base: u32,
    #[prost(uint32, tag = "5")]
    pub ack: u32,
    #[prost(uint32, tag = "6")]
    pub ack_session: u32,
    #[prost(uint32, tag = "7")]
    pub source: u32,
    #[prost(uint32, tag = "8")]
    pub destination: u32,
    #[prost(oneof = "aux_envelope::Body", tags = "10, 11, 12, 13, 14, 15, 16, 17")]
    pub body: Option<aux_envelope::Body>,
}

pub mod aux_envelope {
    #[derive(Clone, PartialEq, prost::Oneof)]
    pub enum Body {
        #[prost(message, tag = "10")]
        Hello(super::Hello),
        #[prost(message, tag = "11")]
        EchoRequest(super::Echo),
        #[prost(message, tag = "12")]
        EchoReply(super::Echo),
        #[prost(message, tag = "13")]
        ErrorReport(super::ErrorReport),
        #[prost(message, tag = "14")]
        RoutingUpdate(super::RoutingUpdate),
        #[prost(message, tag = "15")]
        RoutingAck(super::RoutingAck),
        #[prost(message, tag = "16")]
        LinkStatus(super::LinkStatus),
        #[prost(message, tag = "17")]
        PortCounters(super::PortCounters),
    }
}

#[derive(Clone, PartialEq, Message)]
pub struct Hello {
    #[prost(uint32, tag = "1")]
    pub node: u32,
    #[prost(string, tag = "2")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct Echo {
    #[prost(uint64, tag = "1")]
    pub nonce: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorReport {
    #[prost(enumeration = "ErrorKind", tag = "1")]
    pub kind: i32,
    /// Absent when not channel-specific.
    #[prost(uint32, optional, tag = "2")]
    pub channel: Option<u32>,
    /// Absent when not port-specific.
    #[prost(uint32, optional, tag = "3")]
    pub port: Option<u32>,
    #[prost(uint64, tag = "4")]
    pub count: u64,
    #[prost(uint64, tag = "5")]
    pub timestamp: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RoutingUpdate {
    /// One byte per destination, see [`RoutingTable::to_bytes`].
    #[prost(bytes = "vec", tag = "1")]
    pub table: Vec<u8>,
    /// Snapshot version the table belongs to.
    #[prost(uint64, tag = "2")]
    pub version: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct RoutingAck {
    #[prost(bool, tag = "1")]
    pub accepted: bool,
    #[prost(string, tag = "2")]
    pub reason: String,
    /// Version of the update being answered.
    #[prost(uint64, tag = "3")]
    pub version: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct LinkStatus {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(enumeration = "WireLinkState", tag = "2")]
    pub state: i32,
    #[prost(uint64, tag = "3")]
    pub latency: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct PortCounters {
    #[prost(uint32, tag = "1")]
    pub port: u32,
    #[prost(uint64, tag = "2")]
    pub link_downs: u64,
    #[prost(uint64, tag = "3")]
    pub calibration_attempts: u64,
    #[prost(uint64, tag = "4")]
    pub calibration_timeouts: u64,
    #[prost(uint64, tag = "5")]
    pub tsc_faults: u64,
    #[prost(uint64, tag = "6")]
    pub aux_protocol_errors: u64,
    #[prost(uint64, tag = "7")]
    pub commands_forwarded: u64,
    #[prost(uint64, tag = "8")]
    pub commands_failed: u64,
    #[prost(uint64, tag = "9")]
    pub remote_errors: u64,
    #[prost(bool, tag = "10")]
    pub alarm: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorKind {
    Unspecified = 0,
    Underflow = 1,
    Overflow = 2,
    UnknownChannel = 3,
    NoRoute = 4,
    LinkDown = 5,
    CalibrationTimeout = 6,
    ChannelFault = 7,
    TopologyMismatch = 8,
    Unsupported = 9,
    AuxProtocol = 10,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum WireLinkState {
    Down = 0,
    Calibrating = 1,
    Synchronized = 2,
}

// ── Domain ⇄ wire conversion ──────────────────────────────────────────────────

impl From<RemoteErrorKind> for ErrorKind {
    fn from(k: RemoteErrorKind) -> Self {
        match k {
            RemoteErrorKind::Underflow => ErrorKind::Underflow,
            RemoteErrorKind::Overflow => ErrorKind::Overflow,
            RemoteErrorKind::UnknownChannel => ErrorKind::UnknownChannel,
            RemoteErrorKind::NoRoute => ErrorKind::NoRoute,
            RemoteErrorKind::LinkDown => ErrorKind::LinkDown,
            RemoteErrorKind::CalibrationTimeout => ErrorKind::CalibrationTimeout,
            RemoteErrorKind::ChannelFault => ErrorKind::ChannelFault,
            RemoteErrorKind::TopologyMismatch => ErrorKind::TopologyMismatch,
            RemoteErrorKind::Unsupported => ErrorKind::Unsupported,
            RemoteErrorKind::AuxProtocol => ErrorKind::AuxProtocol,
        }
    }
}

impl TryFrom<i32> for RemoteErrorKind {
    type Error = AuxProtocolError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        let kind = match ErrorKind::try_from(raw) {
            Ok(ErrorKind::Underflow) => RemoteErrorKind::Underflow,
            Ok(ErrorKind::Overflow) => RemoteErrorKind::Overflow,
            Ok(ErrorKind::UnknownChannel) => RemoteErrorKind::UnknownChannel,
            Ok(ErrorKind::NoRoute) => RemoteErrorKind::NoRoute,
            Ok(ErrorKind::LinkDown) => RemoteErrorKind::LinkDown,
            Ok(ErrorKind::CalibrationTimeout) => RemoteErrorKind::CalibrationTimeout,
            Ok(ErrorKind::ChannelFault) => RemoteErrorKind::ChannelFault,
            Ok(ErrorKind::TopologyMismatch) => RemoteErrorKind::TopologyMismatch,
            Ok(ErrorKind::Unsupported) => RemoteErrorKind::Unsupported,
            Ok(ErrorKind::AuxProtocol) => RemoteErrorKind::AuxProtocol,
            Ok(ErrorKind::Unspecified) | Err(_) => {
                return Err(AuxProtocolError::UnknownErrorKind(raw))
            }
        };
        Ok(kind)
    }
}

fn encode_state(state: LinkStateKind) -> WireLinkState {
    match state {
        LinkStateKind::Down => WireLinkState::Down,
        LinkStateKind::Calibrating => WireLinkState::Calibrating,
        LinkStateKind::Synchronized => WireLinkState::Synchronized,
    }
}

fn decode_state(raw: i32) -> Result<LinkStateKind, AuxProtocolError> {
    match WireLinkState::try_from(raw) {
        Ok(WireLinkState::Down) => Ok(LinkStateKind::Down),
        Ok(WireLinkState::Calibrating) => Ok(LinkStateKind::Calibrating),
        Ok(WireLinkState::Synchronized) => Ok(LinkStateKind::Synchronized),
        Err(_) => Err(AuxProtocolError::MalformedBody(format!(
            "unknown link state {raw}"
        ))),
    }
}

fn node_id(raw: u32) -> Result<NodeId, AuxProtocolError> {
    u8::try_from(raw)
        .map(NodeId)
        .map_err(|_| AuxProtocolError::MalformedBody(format!("node id {raw} out of range")))
}

impl From<&AuxMessage> for aux_envelope::Body {
    fn from(msg: &AuxMessage) -> Self {
        use aux_envelope::Body;
        match msg {
            AuxMessage::Hello { node, name } => Body::Hello(Hello {
                node: u32::from(node.0),
                name: name.clone(),
            }),
            AuxMessage::EchoRequest { nonce } => Body::EchoRequest(Echo { nonce: *nonce }),
            AuxMessage::EchoReply { nonce } => Body::EchoReply(Echo { nonce: *nonce }),
            AuxMessage::ErrorReport(e) => Body::ErrorReport(ErrorReport {
                kind: ErrorKind::from(e.kind) as i32,
                channel: e.channel.map(|c| c.0),
                port: e.port.map(u32::from),
                count: e.count,
                timestamp: e.timestamp,
            }),
            AuxMessage::RoutingUpdate { version, table } => Body::RoutingUpdate(RoutingUpdate {
                table: table.to_bytes(),
                version: *version,
            }),
            AuxMessage::RoutingAck {
                version,
                accepted,
                reason,
            } => Body::RoutingAck(RoutingAck {
                accepted: *accepted,
                reason: reason.clone(),
                version: *version,
            }),
            AuxMessage::LinkStatus {
                port,
                state,
                latency,
            } => Body::LinkStatus(LinkStatus {
                port: u32::from(*port),
                state: encode_state(*state) as i32,
                latency: latency.unwrap_or(0),
            }),
            AuxMessage::PortCounters {
                port,
                counters: c,
                alarm,
            } => Body::PortCounters(PortCounters {
                port: u32::from(*port),
                link_downs: c.link_downs,
                calibration_attempts: c.calibration_attempts,
                calibration_timeouts: c.calibration_timeouts,
                tsc_faults: c.tsc_faults,
                aux_protocol_errors: c.aux_protocol_errors,
                commands_forwarded: c.commands_forwarded,
                commands_failed: c.commands_failed,
                remote_errors: c.remote_errors,
                alarm: *alarm,
            }),
        }
    }
}

impl TryFrom<aux_envelope::Body> for AuxMessage {
    type Error = AuxProtocolError;

    fn try_from(body: aux_envelope::Body) -> Result<Self, Self::Error> {
        use aux_envelope::Body;
        let msg = match body {
            Body::Hello(h) => AuxMessage::Hello {
                node: node_id(h.node)?,
                name: h.name,
            },
            Body::EchoRequest(e) => AuxMessage::EchoRequest { nonce: e.nonce },
            Body::EchoReply(e) => AuxMessage::EchoReply { nonce: e.nonce },
            Body::ErrorReport(r) => AuxMessage::ErrorReport(RemoteError {
                kind: RemoteErrorKind::try_from(r.kind)?,
                channel: r.channel.map(ChannelId),
                port: r
                    .port
                    .map(|p| {
                        u8::try_from(p).map_err(|_| {
                            AuxProtocolError::MalformedBody(format!("port {p} out of range"))
                        })
                    })
                    .transpose()?,
                count: r.count,
                timestamp: r.timestamp,
            }),
            Body::RoutingUpdate(u) => AuxMessage::RoutingUpdate {
                version: u.version,
                table: RoutingTable::from_bytes(&u.table)
                    .map_err(|e| AuxProtocolError::MalformedBody(e.to_string()))?,
            },
            Body::RoutingAck(a) => AuxMessage::RoutingAck {
                version: a.version,
                accepted: a.accepted,
                reason: a.reason,
            },
            Body::LinkStatus(s) => {
                let state = decode_state(s.state)?;
                AuxMessage::LinkStatus {
                    port: u8::try_from(s.port).map_err(|_| {
                        AuxProtocolError::MalformedBody(format!("port {} out of range", s.port))
                    })?,
                    state,
                    latency: (state == LinkStateKind::Synchronized).then_some(s.latency),
                }
            }
            Body::PortCounters(c) => AuxMessage::PortCounters {
                port: u8::try_from(c.port).map_err(|_| {
                    AuxProtocolError::MalformedBody(format!("port {} out of range", c.port))
                })?,
                counters: LinkCounters {
                    link_downs: c.link_downs,
                    calibration_attempts: c.calibration_attempts,
                    calibration_timeouts: c.calibration_timeouts,
                    tsc_faults: c.tsc_faults,
                    aux_protocol_errors: c.aux_protocol_errors,
                    commands_forwarded: c.commands_forwarded,
                    commands_failed: c.commands_failed,
                    remote_errors: c.remote_errors,
                },
                alarm: c.alarm,
            },
        };
        Ok(msg)
    }
}

// ── Framing ───────────────────────────────────────────────────────────────────

/// Sequencing header of an envelope, filled in by the aux controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Sequencing {
    pub session: u32,
    pub seq: u32,
    pub base: u32,
    pub ack: u32,
    pub ack_session: u32,
}

/// A decoded, version-checked envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct Decoded {
    pub sequencing: Sequencing,
    /// `None` for a pure acknowledgement.
    pub frame: Option<AuxFrame>,
}

/// Encode one envelope; `frame == None` produces a pure acknowledgement.
pub fn encode(sequencing: Sequencing, frame: Option<&AuxFrame>) -> Vec<u8> {
    let envelope = AuxEnvelope {
        version: AUX_PROTOCOL_VERSION,
        session: sequencing.session,
        seq: sequencing.seq,
        base: sequencing.base,
        ack: sequencing.ack,
        ack_session: sequencing.ack_session,
        source: frame.map_or(0, |f| u32::from(f.source.0)),
        destination: frame.map_or(0, |f| u32::from(f.destination.0)),
        body: frame.map(|f| aux_envelope::Body::from(&f.message)),
    };
    envelope.encode_length_delimited_to_vec()
}

/// Decode and validate one envelope.
pub fn decode(bytes: &[u8]) -> Result<Decoded, AuxProtocolError> {
    let envelope = AuxEnvelope::decode_length_delimited(bytes)?;
    if envelope.version != AUX_PROTOCOL_VERSION {
        return Err(AuxProtocolError::VersionMismatch {
            expected: AUX_PROTOCOL_VERSION,
            found: envelope.version,
        });
    }
    let sequencing = Sequencing {
        session: envelope.session,
        seq: envelope.seq,
        base: envelope.base,
        ack: envelope.ack,
        ack_session: envelope.ack_session,
    };
    let frame = match envelope.body {
        Some(body) => Some(AuxFrame {
            source: node_id(envelope.source)?,
            destination: node_id(envelope.destination)?,
            message: AuxMessage::try_from(body)?,
        }),
        None if envelope.seq != 0 => {
            return Err(AuxProtocolError::MissingBody { seq: envelope.seq })
        }
        None => None,
    };
    Ok(Decoded { sequencing, frame })
}

// ── Tests ─────────────────────────────────────────────────────────────────────
