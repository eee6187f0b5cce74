/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Asynchronous fabric events.
//!
//! Everything the real-time side discovers after a command was accepted, or
//! learns from the aux channel, becomes a [`FabricEvent`] on an unbounded
//! channel.  Sending never blocks and a dropped receiver is ignored, so the
//! tick loop cannot stall on a slow consumer.

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::aux::RemoteError;
use crate::cri::TimedCommand;
use crate::error::{AuxProtocolError, CriError};
use crate::link::{LinkId, LinkStateKind};
use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq)]
pub enum FabricEvent {
    /// An accepted command was lost on its way to `destination`.
    CommandFailed {
        destination: NodeId,
        command: TimedCommand,
        error: CriError,
    },
    /// An `ErrorReport` from a node (or a local driver rejection on the master).
    RemoteError { node: NodeId, error: RemoteError },
    CalibrationAlarm { link: LinkId, attempts: u32 },
    AuxProtocolError { link: LinkId, error: AuxProtocolError },
    AuxSessionReset { link: LinkId },
    LinkStateChanged {
        link: LinkId,
        state: LinkStateKind,
        latency: Option<u64>,
    },
    EchoReply { node: NodeId, nonce: u64, rtt: u64 },
    /// No reply to echo `nonce` within the echo timeout.
    EchoTimeout { node: NodeId, nonce: u64 },
    RoutingAck {
        node: NodeId,
        version: u64,
        accepted: bool,
        reason: String,
    },
    TopologyMismatch {
        link: LinkId,
        expected: NodeId,
        found: NodeId,
    },
    RoutingCommitted {
        version: u64,
        affected: Vec<NodeId>,
        pushed: Vec<NodeId>,
    },
    /// Every satellite answered the tables of `version`; `released`
    /// destinations accept commands again.
    RoutingApplied { version: u64, released: Vec<NodeId> },
}

/// Sending half of the event stream.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<FabricEvent>,
}

impl EventSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<FabricEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Log `event` and hand it to the consumer, if there still is one.
    pub fn emit(&self, event: FabricEvent) {
        match &event {
            FabricEvent::CommandFailed {
                destination,
                command,
                error,
            } => warn!(%destination, channel = %command.channel, at = %command.timestamp, %error, "✗ command failed"),
            FabricEvent::RemoteError { node, error } => warn!(
                %node,
                kind = %error.kind,
                channel = ?error.channel,
                port = ?error.port,
                count = error.count,
                "✗ remote error"
            ),
            FabricEvent::CalibrationAlarm { link, attempts } => {
                error!(%link, attempts, "calibration alarm")
            }
            FabricEvent::AuxProtocolError { link, error } => {
                warn!(%link, %error, "aux protocol error")
            }
            FabricEvent::AuxSessionReset { link } => info!(%link, "aux session reset"),
            FabricEvent::LinkStateChanged {
                link,
                state,
                latency,
            } => info!(%link, %state, ?latency, "link state"),
            FabricEvent::EchoReply { node, nonce, rtt } => debug!(%node, nonce, rtt, "echo reply"),
            FabricEvent::EchoTimeout { node, nonce } => warn!(%node, nonce, "✗ echo timed out"),
            FabricEvent::RoutingAck {
                node,
                version,
                accepted,
                reason,
            } => {
                if *accepted {
                    debug!(%node, version, "routing table acknowledged");
                } else {
                    warn!(%node, version, %reason, "✗ routing table refused");
                }
            }
            FabricEvent::TopologyMismatch {
                link,
                expected,
                found,
            } => error!(%link, %expected, %found, "✗ topology mismatch"),
            FabricEvent::RoutingCommitted {
                version,
                affected,
                pushed,
            } => info!(version, ?affected, ?pushed, "routing committed"),
            FabricEvent::RoutingApplied { version, released } => {
                info!(version, ?released, "routing applied")
            }
        }
        // A closed receiver only means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_survives_a_closed_receiver() {
        let (sink, mut rx) = EventSink::channel();
        let link = LinkId::new(NodeId(0), 0);
        sink.emit(FabricEvent::AuxSessionReset { link });
        assert_eq!(rx.try_recv().ok(), Some(FabricEvent::AuxSessionReset { link }));

        drop(rx);
        sink.emit(FabricEvent::AuxSessionReset { link });
    }
}
