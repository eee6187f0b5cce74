/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The whole fabric, driven one tick at a time.
//!
//! [`Fabric::new`] builds every node from a [`TopologyConfig`], connecting
//! them with [`SimLink`]s and giving every node a [`LatchBank`] driver.
//! One [`tick`](Fabric::tick) is:
//!
//! 1. every TSC advances,
//! 2. every link advances,
//! 3. the master steps,
//! 4. the satellites step, closest to the master first.
//!
//! The order is fixed, so runs are reproducible.

use std::collections::BTreeMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tracing::info;

use crate::channel::{LatchBank, LocalIo};
use crate::config::TopologyConfig;
use crate::cri::{egress_queue, Interconnect, SourceHandle, SourceId};
use crate::error::DrtioError;
use crate::events::{EventSink, FabricEvent};
use crate::link::{LinkBoard, LinkId, SimEndpoint, SimLink};
use crate::node::{DownstreamPort, Master, NodeId, Satellite};
use crate::routing::{Router, RoutingSnapshot};
use crate::siphaser::{PhaseAligner, SimPhaseDetector};
use crate::tsc::Tsc;

struct SatelliteSlot {
    tsc: Tsc,
    node: Satellite,
}

pub struct Fabric {
    tsc: Tsc,
    master: Master,
    satellites: Vec<SatelliteSlot>,
    links: BTreeMap<LinkId, SimLink>,
    interconnect: Arc<Interconnect>,
    latches: BTreeMap<NodeId, Arc<LatchBank>>,
    phase_faults: BTreeMap<NodeId, Arc<AtomicBool>>,
}

impl std::fmt::Debug for Fabric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fabric")
            .field("now", &self.tsc.now())
            .field("master", &self.master)
            .field("satellites", &self.satellites.len())
            .finish()
    }
}

impl Fabric {
    /// Build the fabric.  Returns it with the receiving end of its event
    /// stream.
    pub fn new(
        config: &TopologyConfig,
    ) -> Result<(Self, UnboundedReceiver<FabricEvent>), DrtioError> {
        config.validate()?;
        let topology = config.topology()?;
        let settings = config.settings;

        let mut links = BTreeMap::new();
        let mut upstream_ends: BTreeMap<LinkId, SimEndpoint> = BTreeMap::new();
        let mut downstream_ends: BTreeMap<NodeId, SimEndpoint> = BTreeMap::new();
        for sat in &config.satellites {
            let link = topology
                .node(sat.id)
                .and_then(|n| n.upstream)
                .ok_or_else(|| DrtioError::Config(format!("satellite {} is not attached", sat.id)))?;
            let (handle, up, down) = SimLink::new(sat.latency, sat.training);
            links.insert(link, handle);
            upstream_ends.insert(link, up);
            downstream_ends.insert(sat.id, down);
        }

        let snapshot = RoutingSnapshot::build(
            &topology,
            config.tables(&topology),
            config.channel_owners(),
            0,
        )?;
        let tables = snapshot.tables().clone();
        let router = Arc::new(Router::new(snapshot));
        let board = Arc::new(LinkBoard::new());
        let (sink, events) = EventSink::channel();
        let port_settings = settings.port_settings();
        let mut latches = BTreeMap::new();

        // ── Master ──
        let tsc = Tsc::new();
        let bank = Arc::new(LatchBank::new());
        latches.insert(NodeId::MASTER, bank.clone());
        let local = Arc::new(LocalIo::new(
            config.master.channels.iter().copied(),
            settings.fifo_depth,
            bank,
        ));
        let master_info = topology
            .node(NodeId::MASTER)
            .ok_or_else(|| DrtioError::Config(String::from("no master")))?;
        let mut senders = BTreeMap::new();
        let mut ports = Vec::new();
        for (p, neighbour) in master_info.ports.iter().enumerate() {
            let link = LinkId::new(NodeId::MASTER, p as u8);
            let end = upstream_ends
                .remove(&link)
                .ok_or_else(|| DrtioError::Config(format!("link {link} has no transceiver")))?;
            let (tx, rx) = egress_queue(
                settings.interconnect.egress_depth,
                settings.interconnect.sources,
            );
            senders.insert(p as u8, tx);
            ports.push(DownstreamPort::new(
                link,
                *neighbour,
                Box::new(end),
                port_settings,
                settings.aux,
                Some(rx),
            ));
        }
        let interconnect = Arc::new(Interconnect::new(
            NodeId::MASTER,
            tsc.clone(),
            settings.interconnect,
            router.clone(),
            board.clone(),
            local.clone(),
            senders,
            config.channels(),
        ));
        let mut master =
            Master::new(topology.clone(), tsc.clone(), ports, local, router, board, sink);
        master.set_echo_timeout(settings.aux.echo_timeout);

        // ── Satellites ──
        let mut phase_faults = BTreeMap::new();
        let mut satellites = Vec::new();
        for info in topology.satellites_by_rank() {
            let spec = config
                .node(info.id)
                .ok_or_else(|| DrtioError::Config(format!("node {} has no configuration", info.id)))?;
            let upstream = info
                .upstream
                .ok_or_else(|| DrtioError::Config(format!("satellite {} is not attached", info.id)))?;
            let uplink = downstream_ends
                .remove(&info.id)
                .ok_or_else(|| DrtioError::Config(format!("satellite {} has no transceiver", info.id)))?;

            let mut ports = Vec::new();
            for (p, neighbour) in info.ports.iter().enumerate() {
                let link = LinkId::new(info.id, p as u8);
                let end = upstream_ends
                    .remove(&link)
                    .ok_or_else(|| DrtioError::Config(format!("link {link} has no transceiver")))?;
                ports.push(DownstreamPort::new(
                    link,
                    *neighbour,
                    Box::new(end),
                    port_settings,
                    settings.aux,
                    None,
                ));
            }

            let bank = Arc::new(LatchBank::new());
            latches.insert(info.id, bank.clone());
            let local = Arc::new(LocalIo::new(
                spec.channels.iter().copied(),
                settings.fifo_depth,
                bank,
            ));
            let detector = SimPhaseDetector::new(spec.phase_offset);
            phase_faults.insert(info.id, detector.fault_switch());
            let sat_tsc = Tsc::new();
            let node = Satellite::new(
                info.id,
                info.name.clone(),
                upstream,
                Box::new(uplink),
                Box::new(detector),
                PhaseAligner::new(settings.calibration.lock_confirm),
                sat_tsc.clone(),
                local,
                ports,
                tables.get(&info.id).cloned().unwrap_or_default(),
                settings.satellite_settings(),
                settings.aux,
            );
            satellites.push(SatelliteSlot { tsc: sat_tsc, node });
        }

        info!(
            satellites = satellites.len(),
            links = links.len(),
            channels = config.channels().len(),
            "fabric built"
        );
        Ok((
            Self {
                tsc,
                master,
                satellites,
                links,
                interconnect,
                latches,
                phase_faults,
            },
            events,
        ))
    }

    /// Advance the whole fabric by one coarse tick.
    pub fn tick(&mut self) {
        self.tsc.advance();
        for s in &self.satellites {
            s.tsc.advance();
        }
        for link in self.links.values() {
            link.tick();
        }
        self.master.step();
        for s in &mut self.satellites {
            s.node.step();
        }
    }

    pub fn run(&mut self, ticks: u64) {
        for _ in 0..ticks {
            self.tick();
        }
    }

    /// Tick until `done` holds, at most `max` times.  Returns whether it did.
    pub fn run_until(&mut self, max: u64, mut done: impl FnMut(&Self) -> bool) -> bool {
        for _ in 0..max {
            if done(self) {
                return true;
            }
            self.tick();
        }
        done(self)
    }

    /// Master time.
    pub fn now(&self) -> u64 {
        self.tsc.now()
    }

    pub fn interconnect(&self) -> &Arc<Interconnect> {
        &self.interconnect
    }

    pub fn source(&self, id: SourceId) -> SourceHandle {
        self.interconnect.source(id)
    }

    pub fn master(&self) -> &Master {
        &self.master
    }

    pub fn master_mut(&mut self) -> &mut Master {
        &mut self.master
    }

    pub fn satellite(&self, id: NodeId) -> Option<&Satellite> {
        self.satellites
            .iter()
            .map(|s| &s.node)
            .find(|n| n.id() == id)
    }

    pub fn satellites(&self) -> impl Iterator<Item = &Satellite> {
        self.satellites.iter().map(|s| &s.node)
    }

    /// Every satellite synchronized, and the master knows every link latency.
    pub fn is_synchronized(&self) -> bool {
        self.satellites.iter().all(|s| s.node.is_synchronized())
            && self
                .master
                .topology()
                .links()
                .into_iter()
                .all(|l| self.master.board().latency(l).is_some())
    }

    /// Fault-injection handle of a link.
    pub fn link(&self, link: LinkId) -> Option<&SimLink> {
        self.links.get(&link)
    }

    /// Switch that stops a satellite's phase aligner from locking.
    pub fn phase_fault(&self, node: NodeId) -> Option<Arc<AtomicBool>> {
        self.phase_faults.get(&node).cloned()
    }

    pub fn latches(&self, node: NodeId) -> Option<&Arc<LatchBank>> {
        self.latches.get(&node)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::admin::Admin;
    use crate::aux::RemoteErrorKind;
    use crate::channel::{ChannelDriver, ChannelId, ChannelKind, ChannelSpec, Direction};
    use crate::config::NodeSpec;
    use crate::cri::dma::{DmaPlayer, DmaProgress, DmaSequence};
    use crate::cri::{Ack, TimedCommand};
    use crate::error::CriError;
    use crate::link::{LinkState, LinkStateKind};
    use crate::routing::{NextHop, RoutingTable};

    const OUT: ChannelId = ChannelId(7);
    const IN: ChannelId = ChannelId(8);
    const LOCAL: ChannelId = ChannelId(0);

    fn channel(id: u32, direction: Direction, kind: ChannelKind) -> ChannelSpec {
        ChannelSpec {
            id: ChannelId(id),
            direction,
            kind,
        }
    }

    /// The built-in two-node fabric with a perfectly aligned clock.
    fn two_nodes() -> TopologyConfig {
        let mut cfg = TopologyConfig::default_config();
        cfg.satellites[0].phase_offset = 0;
        cfg
    }

    /// master ─3─ 1 ─3─ 2, channel 9 on node 2.
    fn chain() -> TopologyConfig {
        let mut cfg = TopologyConfig::default_config();
        cfg.satellites[0].latency = 3;
        cfg.satellites[0].training = 0;
        cfg.satellites.push(NodeSpec {
            id: NodeId(2),
            name: String::from("sat2"),
            upstream: Some(NodeId(1)),
            latency: 3,
            training: 0,
            phase_offset: -30,
            channels: vec![channel(9, Direction::Output, ChannelKind::Output)],
        });
        cfg
    }

    fn up(cfg: &TopologyConfig) -> (Fabric, UnboundedReceiver<FabricEvent>) {
        let (mut f, rx) = Fabric::new(cfg).unwrap();
        assert!(f.run_until(400, Fabric::is_synchronized), "fabric never synchronized");
        (f, rx)
    }

    fn drain(rx: &mut UnboundedReceiver<FabricEvent>) -> Vec<FabricEvent> {
        let mut out = Vec::new();
        while let Ok(e) = rx.try_recv() {
            out.push(e);
        }
        out
    }

    fn executed_at(f: &Fabric, node: u8, ch: ChannelId) -> Vec<u64> {
        f.latches(NodeId(node))
            .unwrap()
            .history_of(ch)
            .iter()
            .map(|e| e.at.coarse())
            .collect()
    }

    #[test]
    fn command_executes_on_the_satellite_at_its_timestamp() {
        let (mut f, _rx) = Fabric::new(&two_nodes()).unwrap();
        // Word alignment takes the 3 training ticks.
        f.run(2);
        assert!(!f.satellite(NodeId(1)).unwrap().is_synchronized());
        assert!(f.run_until(100, Fabric::is_synchronized));

        let sat = f.satellite(NodeId(1)).unwrap();
        assert_eq!(sat.now(), f.now());
        assert_eq!(f.master().board().latency(LinkId::new(NodeId(0), 0)), Some(5));

        let cpu = f.source(SourceId::CPU);
        let at = 100;
        assert!(f.now() < 90, "synchronized late, at {}", f.now());
        let early = f.now() + 2;
        assert!(matches!(
            cpu.submit(TimedCommand::write(OUT, early, 1)),
            Err(CriError::SequenceError { .. })
        ));
        assert_eq!(cpu.submit(TimedCommand::write(OUT, at, 1)), Ok(Ack::Forwarded));
        assert_eq!(
            cpu.submit(TimedCommand::write(ChannelId(9999), at, 1)),
            Err(CriError::UnknownChannel {
                channel: ChannelId(9999)
            })
        );
        // Equal timestamps on one channel are fine.
        assert_eq!(
            cpu.submit(TimedCommand::write(OUT, at, 2).with_address(1)),
            Ok(Ack::Forwarded)
        );

        assert!(f.run_until(100, |f| f.now() == at - 1));
        assert!(executed_at(&f, 1, OUT).is_empty());
        f.tick();
        assert_eq!(executed_at(&f, 1, OUT), vec![at, at]);
        assert_eq!(f.satellite(NodeId(1)).unwrap().now(), at);
    }

    #[test]
    fn timestamps_inside_the_path_latency_are_rejected() {
        let (f, _rx) = up(&two_nodes());
        let cpu = f.source(SourceId::CPU);
        let now = f.now();
        for late in [now + 2, now + 5] {
            assert_eq!(
                cpu.submit(TimedCommand::write(OUT, late, 1)),
                Err(CriError::SequenceError {
                    channel: OUT,
                    timestamp: late,
                    earliest: now + 5
                })
            );
        }
        assert_eq!(cpu.submit(TimedCommand::write(OUT, now + 6, 1)), Ok(Ack::Forwarded));
    }

    #[test]
    fn phase_lock_failure_keeps_the_satellite_out_of_sync() {
        let cfg = two_nodes();
        let (mut f, mut rx) = Fabric::new(&cfg).unwrap();
        let fault = f.phase_fault(NodeId(1)).unwrap();
        fault.store(true, Ordering::Relaxed);

        for _ in 0..600 {
            f.tick();
            let sat = f.satellite(NodeId(1)).unwrap();
            assert!(!sat.is_synchronized());
            assert!(!sat.is_phase_locked());
        }
        let events = drain(&mut rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, FabricEvent::CalibrationAlarm { .. })));
        assert!(events.iter().any(|e| matches!(
            e,
            FabricEvent::RemoteError { node: NodeId(1), error } if error.kind == RemoteErrorKind::CalibrationTimeout
        )));
        assert!(f.master().port(0).unwrap().alarm());

        fault.store(false, Ordering::Relaxed);
        assert!(f.run_until(300, Fabric::is_synchronized));
        assert!(!f.master().port(0).unwrap().alarm());
    }

    #[test]
    fn per_channel_order_is_submission_order() {
        let (mut f, _rx) = up(&two_nodes());
        let cpu = f.source(SourceId::CPU);
        let base = f.now() + 20;
        // Equal timestamps are allowed; they keep submission order.
        let stamps = [0, 1, 1, 1, 4, 9, 9, 30];
        for (i, s) in stamps.iter().enumerate() {
            cpu.submit(TimedCommand::write(OUT, base + s, i as u64)).unwrap();
            cpu.submit(TimedCommand::write(LOCAL, base + s, i as u64)).unwrap();
        }
        assert!(matches!(
            cpu.submit(TimedCommand::write(OUT, base + 29, 0)),
            Err(CriError::SequenceError { .. })
        ));
        f.run(60);

        for node in [0, 1] {
            let ch = if node == 0 { LOCAL } else { OUT };
            let values: Vec<u64> = f
                .latches(NodeId(node))
                .unwrap()
                .history_of(ch)
                .iter()
                .map(|e| e.value)
                .collect();
            assert_eq!(values, (0..stamps.len() as u64).collect::<Vec<_>>());
        }
    }

    #[test]
    fn removed_route_rejects_new_commands_and_drains_old_ones() {
        let (mut f, mut rx) = up(&two_nodes());
        let cpu = f.source(SourceId::CPU);
        let at = f.now() + 40;
        cpu.submit(TimedCommand::write(OUT, at, 1)).unwrap();

        let mut table = RoutingTable::new();
        table.set(NodeId::MASTER, NextHop::Local);
        let affected = f.master_mut().install_routing(NodeId::MASTER, table).unwrap();
        assert_eq!(affected, vec![NodeId(1)]);
        assert!(matches!(
            cpu.submit(TimedCommand::write(OUT, at + 1, 2)),
            Err(CriError::RouteBusy { .. })
        ));

        assert!(f.run_until(20, |f| !f.master().router().has_pending()));
        assert_eq!(
            cpu.submit(TimedCommand::write(OUT, at + 1, 2)),
            Err(CriError::NoRoute {
                destination: NodeId(1)
            })
        );
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FabricEvent::RoutingCommitted { version: 1, .. })));

        f.run(50);
        assert_eq!(executed_at(&f, 1, OUT), vec![at]);
        assert_eq!(
            f.master_mut().routing_table(NodeId::MASTER).unwrap().get(NodeId(1)),
            NextHop::NoRoute
        );
    }

    #[test]
    fn restored_route_waits_for_the_repeater_to_install_its_table() {
        let (mut f, mut rx) = up(&chain());
        let cpu = f.source(SourceId::CPU);
        let deep = ChannelId(9);
        let original = f.master().routing_table(NodeId(1)).unwrap();

        let mut cut = original.clone();
        cut.set(NodeId(2), NextHop::NoRoute);
        f.master_mut().install_routing(NodeId(1), cut).unwrap();
        assert!(f.run_until(100, |f| !f.master().router().has_pending()));
        assert_eq!(
            f.satellite(NodeId(1)).unwrap().table().get(NodeId(2)),
            NextHop::NoRoute
        );

        f.master_mut().install_routing(NodeId(1), original).unwrap();
        f.tick();
        assert_eq!(f.master().router().snapshot().version(), 2);
        assert_eq!(f.master().router().awaiting_acks(), vec![NodeId(1)]);
        assert!(matches!(
            cpu.submit(TimedCommand::write(deep, f.now() + 50, 1)),
            Err(CriError::RouteBusy { .. })
        ));

        assert!(f.run_until(100, |f| !f.master().router().has_pending()));
        assert_eq!(
            f.satellite(NodeId(1)).unwrap().table().get(NodeId(2)),
            NextHop::Port(0)
        );
        let at = f.now() + 50;
        assert_eq!(cpu.submit(TimedCommand::write(deep, at, 1)), Ok(Ack::Forwarded));
        f.run(60);
        assert_eq!(executed_at(&f, 2, deep), vec![at]);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            FabricEvent::RoutingApplied { version: 2, released } if released == &vec![NodeId(2)]
        )));
        assert!(!events.iter().any(|e| matches!(
            e,
            FabricEvent::RemoteError { error, .. } if error.kind == RemoteErrorKind::NoRoute
        )));
    }

    #[test]
    fn link_loss_fails_commands_on_the_wire() {
        let (mut f, mut rx) = up(&two_nodes());
        let cpu = f.source(SourceId::CPU);
        let link = LinkId::new(NodeId(0), 0);
        let cmd = TimedCommand::write(OUT, f.now() + 100, 1);
        cpu.submit(cmd).unwrap();
        f.run(2);
        drain(&mut rx);

        f.link(link).unwrap().set_connected(false);
        f.tick();
        let events = drain(&mut rx);
        assert!(events.contains(&FabricEvent::CommandFailed {
            destination: NodeId(1),
            command: cmd,
            error: CriError::LinkDown {
                link,
                destination: NodeId(1)
            }
        }));
        assert_eq!(f.master().router().in_flight(NodeId(1)), 0);
        assert_eq!(
            cpu.submit(TimedCommand::write(OUT, f.now() + 200, 1)),
            Err(CriError::LinkDown {
                link,
                destination: NodeId(1)
            })
        );

        f.link(link).unwrap().set_connected(true);
        assert!(f.run_until(200, Fabric::is_synchronized));
        assert!(executed_at(&f, 1, OUT).is_empty());
    }

    #[test]
    fn satellite_reports_flushed_commands_after_recovery() {
        let (mut f, mut rx) = up(&two_nodes());
        let cpu = f.source(SourceId::CPU);
        cpu.submit(TimedCommand::write(OUT, f.now() + 300, 1)).unwrap();
        assert!(f.run_until(20, |f| f.satellite(NodeId(1)).unwrap().local().pending() == 1));

        let link = LinkId::new(NodeId(0), 0);
        f.link(link).unwrap().set_connected(false);
        f.run(5);
        assert_eq!(f.satellite(NodeId(1)).unwrap().local().pending(), 0);
        assert_eq!(
            f.satellite(NodeId(1)).unwrap().link_state(),
            LinkState::Down
        );
        f.link(link).unwrap().set_connected(true);
        assert!(f.run_until(200, Fabric::is_synchronized));
        f.run(40);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            FabricEvent::RemoteError { node: NodeId(1), error }
                if error.kind == RemoteErrorKind::LinkDown && error.count == 1
        )));
        assert_eq!(
            f.master_mut().error_counters().remote(NodeId(1), RemoteErrorKind::LinkDown),
            1
        );
        assert!(executed_at(&f, 1, OUT).is_empty());
    }

    #[test]
    fn two_sources_round_trip_through_the_latches() {
        let (mut f, _rx) = up(&two_nodes());
        f.latches(NodeId(1)).unwrap().set_input(IN, 0xab);
        let base = f.now() + 50;
        let cpu = f.source(SourceId::CPU);
        let dma = f.source(SourceId::DMA);

        std::thread::scope(|s| {
            s.spawn(|| {
                for i in 0..20u64 {
                    assert_eq!(cpu.submit(TimedCommand::write(OUT, base + i, i)), Ok(Ack::Forwarded));
                }
                assert_eq!(cpu.submit(TimedCommand::sample(IN, base + 25)), Ok(Ack::Forwarded));
            });
            s.spawn(|| {
                for i in 0..20u64 {
                    assert_eq!(
                        dma.submit(TimedCommand::write(LOCAL, base + i, 100 + i)),
                        Ok(Ack::Local)
                    );
                }
            });
        });
        f.run(90);

        let sat = f.latches(NodeId(1)).unwrap();
        let master = f.latches(NodeId(0)).unwrap();
        assert_eq!(sat.read_latched(OUT), Some(19));
        assert_eq!(master.read_latched(LOCAL), Some(119));
        assert_eq!(sat.read_latched(IN), Some(0xab));
        assert_eq!(sat.history_of(OUT).len(), 20);
        assert_eq!(master.history_of(LOCAL).len(), 20);
        let stats = f.interconnect().stats();
        assert_eq!((stats.local, stats.forwarded, stats.rejected), (20, 21, 0));
    }

    #[test]
    fn dma_sequence_plays_back_with_offset() {
        let (mut f, _rx) = up(&two_nodes());
        let recorded = DmaSequence::from_commands([
            TimedCommand::write(OUT, 10, 1),
            TimedCommand::write(OUT, 12, 0),
            TimedCommand::write(LOCAL, 12, 0xff),
        ]);
        let bytes = recorded.encode();
        let sequence = DmaSequence::decode(&bytes).unwrap();

        let offset = f.now() + 20;
        let mut player = DmaPlayer::new(f.source(SourceId::DMA), sequence, offset);
        assert_eq!(player.pump(), Ok(DmaProgress::Done));
        assert_eq!(player.position(), 3);
        f.run(40);
        assert_eq!(executed_at(&f, 1, OUT), vec![offset + 10, offset + 12]);
        assert_eq!(executed_at(&f, 0, LOCAL), vec![offset + 12]);
    }

    #[test]
    fn commands_cross_a_repeater() {
        let (mut f, _rx) = up(&chain());
        let deep = LinkId::new(NodeId(1), 0);
        assert_eq!(f.master().board().latency(deep), Some(3));
        assert_eq!(f.satellite(NodeId(2)).unwrap().now(), f.now());

        let cpu = f.source(SourceId::CPU);
        let ch = ChannelId(9);
        let now = f.now();
        assert!(matches!(
            cpu.submit(TimedCommand::write(ch, now + 6, 1)),
            Err(CriError::SequenceError { earliest, .. }) if earliest == now + 6
        ));
        cpu.submit(TimedCommand::write(ch, now + 7, 1)).unwrap();
        cpu.submit(TimedCommand::write(ch, now + 30, 2)).unwrap();
        f.run(40);
        assert_eq!(executed_at(&f, 2, ch), vec![now + 7, now + 30]);
    }

    #[test]
    fn losing_a_repeater_uplink_takes_the_deeper_link_down() {
        let (mut f, mut rx) = up(&chain());
        let top = LinkId::new(NodeId(0), 0);
        let deep = LinkId::new(NodeId(1), 0);
        drain(&mut rx);
        f.link(top).unwrap().set_connected(false);
        f.tick();
        assert_eq!(f.master().board().get(deep).state, LinkStateKind::Down);
        assert!(matches!(
            f.source(SourceId::CPU)
                .submit(TimedCommand::write(ChannelId(9), f.now() + 50, 1)),
            Err(CriError::LinkDown { link, .. }) if link == top
        ));
        f.link(top).unwrap().set_connected(true);
        assert!(f.run_until(300, Fabric::is_synchronized));
    }

    #[test]
    fn ping_reaches_a_deep_satellite() {
        let (mut f, mut rx) = up(&chain());
        drain(&mut rx);
        let nonce = f.master_mut().ping(NodeId(2)).unwrap();
        f.run(40);
        let rtt = drain(&mut rx).iter().find_map(|e| match e {
            FabricEvent::EchoReply { node, nonce: n, rtt } if *n == nonce => {
                assert_eq!(*node, NodeId(2));
                Some(*rtt)
            }
            _ => None,
        });
        // Two hops of 3 ticks each way.
        assert!(rtt.is_some_and(|r| r >= 12), "rtt {rtt:?}");
    }

    #[test]
    fn echo_to_an_unreachable_node_times_out() {
        let (mut f, mut rx) = up(&two_nodes());
        f.master_mut().set_echo_timeout(50);
        f.link(LinkId::new(NodeId(0), 0)).unwrap().set_connected(false);
        let nonce = f.master_mut().ping(NodeId(1)).unwrap();
        assert_eq!(f.master().pending_echoes(), 1);

        f.run(49);
        assert_eq!(f.master().pending_echoes(), 1);
        f.tick();
        assert_eq!(f.master().pending_echoes(), 0);
        assert!(drain(&mut rx).contains(&FabricEvent::EchoTimeout {
            node: NodeId(1),
            nonce
        }));
    }

    #[test]
    fn echo_survives_lost_and_corrupted_aux_frames() {
        let (mut f, mut rx) = up(&two_nodes());
        let link = f.link(LinkId::new(NodeId(0), 0)).unwrap().clone();
        link.corrupt_aux_downstream(1);
        link.drop_aux_upstream(1);
        drain(&mut rx);

        let nonce = f.master_mut().ping(NodeId(1)).unwrap();
        f.run(200);
        assert!(drain(&mut rx)
            .iter()
            .any(|e| matches!(e, FabricEvent::EchoReply { nonce: n, .. } if *n == nonce)));
        let sat = f.satellite(NodeId(1)).unwrap();
        assert!(sat.uplink_counters().aux_protocol_errors >= 1);
        assert!(f.master().port(0).unwrap().aux_stats().retransmits >= 1);
        assert!(sat.is_synchronized());
    }

    #[test]
    fn link_status_covers_every_link() {
        let (f, _rx) = up(&chain());
        let status = f.master().link_status();
        assert_eq!(status.len(), 2);
        assert!(status.values().all(|r| r.state == LinkStateKind::Synchronized));
        let counters = f.master().error_counters();
        assert!(counters.alarms.is_empty());
        assert!(counters.links[&LinkId::new(NodeId(0), 0)].calibration_attempts >= 1);
        assert!(counters.links.contains_key(&LinkId::new(NodeId(1), 0)));
    }

    #[test]
    fn repeater_link_alarm_reaches_the_master_counters() {
        let (mut f, _rx) = Fabric::new(&chain()).unwrap();
        let fault = f.phase_fault(NodeId(2)).unwrap();
        fault.store(true, Ordering::Relaxed);
        let deep = LinkId::new(NodeId(1), 0);

        f.run(600);
        assert!(f.satellite(NodeId(1)).unwrap().is_synchronized());
        let counters = f.master().error_counters();
        assert_eq!(counters.alarms, vec![deep]);
        assert!(counters.links[&deep].calibration_timeouts >= 3);
        assert!(counters.remote(NodeId(1), RemoteErrorKind::CalibrationTimeout) >= 3);

        fault.store(false, Ordering::Relaxed);
        assert!(f.run_until(400, Fabric::is_synchronized));
        assert!(f.run_until(100, |f| f.master().error_counters().alarms.is_empty()));
        assert!(f.master().error_counters().links[&deep].calibration_attempts >= 4);
    }
}
