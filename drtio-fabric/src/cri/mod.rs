/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! CRI interconnect: accepts timed commands from the command sources and
//! routes them to the owning node.
//!
//! ```text
//!  SourceHandle (CPU) ─┐
//!                      ├─► Interconnect::submit ──► owner local?  ──► LocalIo FIFO
//!  DmaPlayer (DMA) ────┘          │                  owner remote? ──► EgressSender[first-hop port]
//!                                 └── Err(CriError) synchronously
//! ```
//!
//! ## Checks, in order
//!
//! | Check | Error |
//! |---|---|
//! | channel known, opcode supported | `UnknownChannel`, `UnsupportedOpcode` |
//! | timestamp not before the channel's last accepted one | `SequenceError` |
//! | local: `coarse > now + local_latency` | `SequenceError` |
//! | remote: destination not draining a routing update | `RouteBusy` |
//! | remote: path exists | `NoRoute` |
//! | remote: every hop synchronized | `LinkDown` |
//! | remote: `coarse > now + Σ hop latency` | `SequenceError` |
//! | FIFO / source quota has room | `BufferFull` |
//!
//! The per-channel lock is held from the ordering check until the command
//! sits in its FIFO, so per-channel acceptance order equals FIFO order.
//! No lock covers more than one channel.

pub mod dma;
pub mod egress;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::channel::{ChannelId, ChannelSpec, LocalIo, PushError};
use crate::error::CriError;
use crate::link::LinkBoard;
use crate::node::NodeId;
use crate::routing::Router;
use crate::tsc::{GlobalTimestamp, Tsc};

pub use egress::{egress_queue, EgressItem, EgressReceiver, EgressReject, EgressSender};

// ── Commands ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    /// Drive `data` onto the channel.
    Write,
    /// Latch the channel's input level.
    Sample,
}

/// Widest payload one command carries, in bytes.
pub const MAX_PAYLOAD: usize = 64;

/// Data bytes of a command, little endian, between 1 and [`MAX_PAYLOAD`]
/// bytes long.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Payload {
    width: u8,
    bytes: [u8; MAX_PAYLOAD],
}

impl Payload {
    /// The fewest bytes that hold `word`, at least one.
    pub fn from_word(word: u64) -> Self {
        let width = (8 - word.leading_zeros() as usize / 8).max(1);
        let mut bytes = [0; MAX_PAYLOAD];
        bytes[..8].copy_from_slice(&word.to_le_bytes());
        Self {
            width: width as u8,
            bytes,
        }
    }

    /// `None` when `data` is empty or wider than [`MAX_PAYLOAD`].
    pub fn from_bytes(data: &[u8]) -> Option<Self> {
        if data.is_empty() || data.len() > MAX_PAYLOAD {
            return None;
        }
        let mut bytes = [0; MAX_PAYLOAD];
        bytes[..data.len()].copy_from_slice(data);
        Some(Self {
            width: data.len() as u8,
            bytes,
        })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..usize::from(self.width)]
    }

    /// Number of data bytes.
    pub fn width(&self) -> usize {
        usize::from(self.width)
    }

    /// The first eight bytes as a word.
    pub fn word(&self) -> u64 {
        let mut low = [0; 8];
        low.copy_from_slice(&self.bytes[..8]);
        u64::from_le_bytes(low)
    }
}

impl From<u64> for Payload {
    fn from(word: u64) -> Self {
        Self::from_word(word)
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("0x")?;
        for b in self.as_bytes().iter().rev() {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

/// One timed I/O command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedCommand {
    pub channel: ChannelId,
    pub timestamp: GlobalTimestamp,
    pub opcode: Opcode,
    pub address: u8,
    pub data: Payload,
}

impl TimedCommand {
    pub fn write(channel: ChannelId, timestamp: impl Into<GlobalTimestamp>, data: u64) -> Self {
        Self::write_payload(channel, timestamp, Payload::from_word(data))
    }

    /// A write wider than one word.
    pub fn write_payload(
        channel: ChannelId,
        timestamp: impl Into<GlobalTimestamp>,
        data: Payload,
    ) -> Self {
        Self {
            channel,
            timestamp: timestamp.into(),
            opcode: Opcode::Write,
            address: 0,
            data,
        }
    }

    pub fn sample(channel: ChannelId, timestamp: impl Into<GlobalTimestamp>) -> Self {
        Self {
            channel,
            timestamp: timestamp.into(),
            opcode: Opcode::Sample,
            address: 0,
            data: Payload::from_word(0),
        }
    }

    pub fn with_address(mut self, address: u8) -> Self {
        self.address = address;
        self
    }
}

/// Identifies a command source for egress arbitration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SourceId(pub u8);

impl SourceId {
    pub const CPU: SourceId = SourceId(0);
    pub const DMA: SourceId = SourceId(1);
}

/// Synchronous acceptance of a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    /// Queued on a channel of the master itself.
    Local,
    /// Queued on the egress of a master port.
    Forwarded,
}

/// Interconnect tunables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterconnectSettings {
    pub egress_depth: usize,
    pub sources: usize,
    /// Ticks a local command needs between acceptance and execution.
    pub local_latency: u64,
}

impl Default for InterconnectSettings {
    fn default() -> Self {
        Self {
            egress_depth: 128,
            sources: 2,
            local_latency: 0,
        }
    }
}

/// Acceptance counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InterconnectStats {
    pub local: u64,
    pub forwarded: u64,
    pub rejected: u64,
}

#[derive(Debug)]
struct Lane {
    spec: ChannelSpec,
    last: Mutex<Option<GlobalTimestamp>>,
}

// ── Interconnect ──────────────────────────────────────────────────────────────

/// The master's command router.  Shared as `Arc<Interconnect>`.
#[derive(Debug)]
pub struct Interconnect {
    node: NodeId,
    tsc: Tsc,
    settings: InterconnectSettings,
    router: Arc<Router>,
    board: Arc<LinkBoard>,
    local: Arc<LocalIo>,
    egress: BTreeMap<u8, EgressSender>,
    lanes: BTreeMap<ChannelId, Lane>,
    local_count: AtomicU64,
    forwarded_count: AtomicU64,
    rejected_count: AtomicU64,
}

impl Interconnect {
    /// `channels` lists every channel of the topology, `egress` the sender
    /// of each master port.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node: NodeId,
        tsc: Tsc,
        settings: InterconnectSettings,
        router: Arc<Router>,
        board: Arc<LinkBoard>,
        local: Arc<LocalIo>,
        egress: BTreeMap<u8, EgressSender>,
        channels: impl IntoIterator<Item = ChannelSpec>,
    ) -> Self {
        let lanes = channels
            .into_iter()
            .map(|spec| {
                (
                    spec.id,
                    Lane {
                        spec,
                        last: Mutex::new(None),
                    },
                )
            })
            .collect();
        Self {
            node,
            tsc,
            settings,
            router,
            board,
            local,
            egress,
            lanes,
            local_count: AtomicU64::new(0),
            forwarded_count: AtomicU64::new(0),
            rejected_count: AtomicU64::new(0),
        }
    }

    pub fn now(&self) -> u64 {
        self.tsc.now()
    }

    pub fn settings(&self) -> &InterconnectSettings {
        &self.settings
    }

    pub fn stats(&self) -> InterconnectStats {
        InterconnectStats {
            local: self.local_count.load(Ordering::Relaxed),
            forwarded: self.forwarded_count.load(Ordering::Relaxed),
            rejected: self.rejected_count.load(Ordering::Relaxed),
        }
    }

    /// A submission handle for `source`.  Source ids beyond the configured
    /// count share quota slots modulo that count.
    pub fn source(self: &Arc<Self>, source: SourceId) -> SourceHandle {
        SourceHandle {
            source,
            interconnect: self.clone(),
        }
    }

    /// Accept or reject one command.
    pub fn submit(&self, source: SourceId, cmd: TimedCommand) -> Result<Ack, CriError> {
        let result = self.route(source, cmd);
        match &result {
            Ok(Ack::Local) => {
                self.local_count.fetch_add(1, Ordering::Relaxed);
            }
            Ok(Ack::Forwarded) => {
                self.forwarded_count.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.rejected_count.fetch_add(1, Ordering::Relaxed);
                debug!(source = source.0, channel = %cmd.channel, at = %cmd.timestamp, error = %e, "command rejected");
            }
        }
        result
    }

    fn route(&self, source: SourceId, cmd: TimedCommand) -> Result<Ack, CriError> {
        let channel = cmd.channel;
        let lane = self
            .lanes
            .get(&channel)
            .ok_or(CriError::UnknownChannel { channel })?;
        if !lane.spec.supports(cmd.opcode) {
            return Err(CriError::UnsupportedOpcode {
                channel,
                opcode: cmd.opcode,
            });
        }
        let owner = self
            .router
            .snapshot()
            .owner(channel)
            .ok_or(CriError::UnknownChannel { channel })?;

        let mut last = lane.last.lock();
        if let Some(prev) = *last {
            if cmd.timestamp < prev {
                return Err(CriError::SequenceError {
                    channel,
                    timestamp: cmd.timestamp.coarse(),
                    earliest: prev.coarse().saturating_sub(1),
                });
            }
        }

        let ack = if owner == self.node {
            self.submit_local(owner, cmd)?
        } else {
            self.submit_remote(source, owner, cmd)?
        };
        *last = Some(cmd.timestamp);
        Ok(ack)
    }

    fn submit_local(&self, owner: NodeId, cmd: TimedCommand) -> Result<Ack, CriError> {
        let now = self.tsc.now();
        let earliest = now + self.settings.local_latency;
        if cmd.timestamp.coarse() <= earliest {
            return Err(CriError::SequenceError {
                channel: cmd.channel,
                timestamp: cmd.timestamp.coarse(),
                earliest,
            });
        }
        self.local.push(cmd, now).map_err(|e| match e {
            PushError::UnknownChannel => CriError::UnknownChannel {
                channel: cmd.channel,
            },
            PushError::Unsupported => CriError::UnsupportedOpcode {
                channel: cmd.channel,
                opcode: cmd.opcode,
            },
            PushError::Overflow => CriError::BufferFull { destination: owner },
            PushError::Underflow => CriError::SequenceError {
                channel: cmd.channel,
                timestamp: cmd.timestamp.coarse(),
                earliest,
            },
        })?;
        trace!(channel = %cmd.channel, at = %cmd.timestamp, "accepted locally");
        Ok(Ack::Local)
    }

    fn submit_remote(
        &self,
        source: SourceId,
        destination: NodeId,
        cmd: TimedCommand,
    ) -> Result<Ack, CriError> {
        if !self.router.begin_forward(destination) {
            return Err(CriError::RouteBusy { destination });
        }
        let result = self.forward(source, destination, cmd);
        if result.is_err() {
            self.router.retire(destination);
        }
        result
    }

    /// Runs with the destination's in-flight count held.
    fn forward(
        &self,
        source: SourceId,
        destination: NodeId,
        cmd: TimedCommand,
    ) -> Result<Ack, CriError> {
        let snapshot = self.router.snapshot();
        if snapshot.owner(cmd.channel) != Some(destination) {
            // Ownership moved between the two snapshot reads.
            return Err(CriError::RouteBusy { destination });
        }
        let route = snapshot
            .route(destination)
            .ok_or(CriError::NoRoute { destination })?;
        let first = *route.links.first().ok_or(CriError::NoRoute { destination })?;

        let mut path_latency = 0;
        for link in &route.links {
            let latency = self
                .board
                .latency(*link)
                .ok_or(CriError::LinkDown {
                    link: *link,
                    destination,
                })?;
            path_latency += latency;
        }

        let now = self.tsc.now();
        let earliest = now + path_latency;
        if cmd.timestamp.coarse() <= earliest {
            return Err(CriError::SequenceError {
                channel: cmd.channel,
                timestamp: cmd.timestamp.coarse(),
                earliest,
            });
        }

        let egress = self.egress.get(&first.port).ok_or(CriError::LinkDown {
            link: first,
            destination,
        })?;
        egress
            .try_push(EgressItem {
                source,
                destination,
                command: cmd,
                path_latency,
            })
            .map_err(|e| match e {
                EgressReject::Full => CriError::BufferFull { destination },
                EgressReject::Closed => CriError::LinkDown {
                    link: first,
                    destination,
                },
            })?;
        trace!(channel = %cmd.channel, at = %cmd.timestamp, %destination, path_latency, "forwarded");
        Ok(Ack::Forwarded)
    }
}

// ── SourceHandle ──────────────────────────────────────────────────────────────

/// The command source interface: submit, and read the time to schedule
/// against.
#[derive(Debug, Clone)]
pub struct SourceHandle {
    source: SourceId,
    interconnect: Arc<Interconnect>,
}

impl SourceHandle {
    pub fn id(&self) -> SourceId {
        self.source
    }

    pub fn submit(&self, cmd: TimedCommand) -> Result<Ack, CriError> {
        self.interconnect.submit(self.source, cmd)
    }

    /// The master's current coarse TSC.
    pub fn now(&self) -> u64 {
        self.interconnect.now()
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelKind, Direction, LatchBank};
    use crate::link::{LinkId, LinkReport, LinkStateKind};
    use crate::node::Topology;
    use crate::routing::{default_tables, RoutingSnapshot};

    struct Rig {
        tsc: Tsc,
        board: Arc<LinkBoard>,
        router: Arc<Router>,
        ic: Arc<Interconnect>,
        rx: EgressReceiver,
        local: Arc<LocalIo>,
        bank: Arc<LatchBank>,
    }

    fn out(id: u32) -> ChannelSpec {
        ChannelSpec {
            id: ChannelId(id),
            direction: Direction::Output,
            kind: ChannelKind::Output,
        }
    }

    /// Master with local channel 0, satellite 1 (port 0) owning channel 7.
    fn rig(depth: usize) -> Rig {
        let mut topology = Topology::new("master");
        topology.add_satellite(NodeId(1), "sat", NodeId(0)).unwrap();
        let channels = BTreeMap::from([(ChannelId(0), NodeId(0)), (ChannelId(7), NodeId(1))]);
        let snapshot =
            RoutingSnapshot::build(&topology, default_tables(&topology), channels, 0).unwrap();
        let router = Arc::new(Router::new(snapshot));
        let board = Arc::new(LinkBoard::new());
        let tsc = Tsc::new();
        let bank = Arc::new(LatchBank::new());
        let local = Arc::new(LocalIo::new([out(0)], 4, bank.clone()));
        let (tx, rx) = egress_queue(depth, 2);
        let ic = Arc::new(Interconnect::new(
            NodeId(0),
            tsc.clone(),
            InterconnectSettings::default(),
            router.clone(),
            board.clone(),
            local.clone(),
            BTreeMap::from([(0, tx)]),
            [out(0), out(7)],
        ));
        Rig {
            tsc,
            board,
            router,
            ic,
            rx,
            local,
            bank,
        }
    }

    fn sync_link(board: &LinkBoard, latency: u64) {
        board.publish(
            LinkId::new(NodeId(0), 0),
            LinkReport {
                state: LinkStateKind::Synchronized,
                latency: Some(latency),
            },
        );
    }

    #[test]
    fn remote_threshold_is_now_plus_path_latency() {
        let mut r = rig(16);
        sync_link(&r.board, 5);
        r.tsc.load(10);
        let cpu = r.ic.source(SourceId::CPU);

        for ts in [12, 15] {
            assert_eq!(
                cpu.submit(TimedCommand::write(ChannelId(7), ts, 1)),
                Err(CriError::SequenceError {
                    channel: ChannelId(7),
                    timestamp: ts,
                    earliest: 15
                })
            );
        }
        assert_eq!(cpu.submit(TimedCommand::write(ChannelId(7), 16, 1)), Ok(Ack::Forwarded));
        assert_eq!(cpu.submit(TimedCommand::write(ChannelId(7), 100, 1)), Ok(Ack::Forwarded));

        let item = r.rx_items().remove(0);
        assert_eq!(item.destination, NodeId(1));
        assert_eq!(item.path_latency, 5);
        assert_eq!(r.router.in_flight(NodeId(1)), 2);
    }

    impl Rig {
        fn rx_items(&mut self) -> Vec<EgressItem> {
            std::iter::from_fn(|| self.rx.pop()).collect()
        }
    }

    #[test]
    fn local_threshold_and_fifo() {
        let r = rig(16);
        r.tsc.load(10);
        assert!(matches!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(0), 10, 1)),
            Err(CriError::SequenceError { earliest: 10, .. })
        ));
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(0), 11, 1)),
            Ok(Ack::Local)
        );
        assert_eq!(r.local.pending(), 1);
        for ts in 12..15 {
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(0), ts, 1))
                .unwrap();
        }
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(0), 20, 1)),
            Err(CriError::BufferFull {
                destination: NodeId(0)
            })
        );
    }

    #[test]
    fn rejections_are_attributed() {
        let r = rig(16);
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(3), 50, 1)),
            Err(CriError::UnknownChannel {
                channel: ChannelId(3)
            })
        );
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::sample(ChannelId(7), 50)),
            Err(CriError::UnsupportedOpcode {
                channel: ChannelId(7),
                opcode: Opcode::Sample
            })
        );
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(7), 50, 1)),
            Err(CriError::LinkDown {
                link: LinkId::new(NodeId(0), 0),
                destination: NodeId(1)
            })
        );
        assert_eq!(r.router.in_flight(NodeId(1)), 0, "failed submit retires");
        assert_eq!(r.ic.stats().rejected, 3);
    }

    #[test]
    fn channel_timestamps_must_not_go_backwards() {
        let r = rig(16);
        sync_link(&r.board, 1);
        r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(7), 50, 1))
            .unwrap();
        r.ic.submit(SourceId::DMA, TimedCommand::write(ChannelId(7), 50, 2))
            .unwrap();
        assert!(matches!(
            r.ic.submit(SourceId::DMA, TimedCommand::write(ChannelId(7), 49, 3)),
            Err(CriError::SequenceError { timestamp: 49, .. })
        ));
        // Other channels are independent.
        r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(0), 20, 1))
            .unwrap();
    }

    #[test]
    fn per_source_quota_is_enforced() {
        let r = rig(4);
        sync_link(&r.board, 1);
        for ts in 10..12 {
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(7), ts, 1))
                .unwrap();
        }
        assert_eq!(
            r.ic.submit(SourceId::CPU, TimedCommand::write(ChannelId(7), 12, 1)),
            Err(CriError::BufferFull {
                destination: NodeId(1)
            })
        );
        assert_eq!(
            r.ic.submit(SourceId::DMA, TimedCommand::write(ChannelId(7), 12, 1)),
            Ok(Ack::Forwarded)
        );
    }

    #[test]
    fn payload_keeps_its_width() {
        assert_eq!(Payload::from_word(0).as_bytes(), &[0]);
        assert_eq!(Payload::from_word(0x1234).as_bytes(), &[0x34, 0x12]);
        assert_eq!(Payload::from_word(u64::MAX).width(), 8);

        let wide: Vec<u8> = (1..=40).collect();
        let p = Payload::from_bytes(&wide).unwrap();
        assert_eq!(p.width(), 40);
        assert_eq!(p.as_bytes(), &wide[..]);
        assert_eq!(p.word(), u64::from_le_bytes([1, 2, 3, 4, 5, 6, 7, 8]));

        assert!(Payload::from_bytes(&[]).is_none());
        assert!(Payload::from_bytes(&[0; MAX_PAYLOAD]).is_some());
        assert!(Payload::from_bytes(&[0; MAX_PAYLOAD + 1]).is_none());
        // Same leading bytes, different width.
        assert_ne!(Payload::from_bytes(&[1]), Payload::from_bytes(&[1, 0]));
    }

    #[test]
    fn wide_write_executes_with_every_byte() {
        let r = rig(16);
        r.tsc.load(10);
        let data: Vec<u8> = (0..MAX_PAYLOAD as u8).collect();
        let payload = Payload::from_bytes(&data).unwrap();
        assert_eq!(
            r.ic.submit(
                SourceId::CPU,
                TimedCommand::write_payload(ChannelId(0), 12, payload)
            ),
            Ok(Ack::Local)
        );
        r.local.execute_due(12);
        let bank = r.bank.history();
        assert_eq!(bank.len(), 1);
        assert_eq!(bank[0].data.as_bytes(), &data[..]);
    }
}
