/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Topology configuration loading.
//!
//! The expected YAML structure is:
//! ```yaml
//! master:
//!   name: master
//!   channels:
//!     - { id: 0 }
//! tsc:
//!   broadcast_period: 64
//!   tolerance: 0
//! interconnect:
//!   egress_depth: 128
//!   sources: 2
//!   local_latency: 0
//!   fifo_depth: 64
//! aux:
//!   retransmit_after: 32
//!   window: 8
//!   error_threshold: 8
//!   echo_timeout: 1024
//! calibration:
//!   window: 64
//!   alarm_after: 3
//!   lock_confirm: 2
//!   latency_margin: 0
//! satellites:            # parents before children
//!   - id: 1
//!     name: sat1
//!     upstream: 0
//!     latency: 5
//!     training: 3
//!     phase_offset: 40
//!     channels:
//!       - { id: 7 }
//!       - { id: 8, direction: input, kind: input }
//! routing:               # optional, replaces the derived table of each listed node
//!   0: { 0: local, 1: 0 }
//! ```
//!
//! Every section except `satellites` may be omitted.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, info};

use crate::aux::AuxSettings;
use crate::channel::{ChannelId, ChannelKind, ChannelSpec, Direction};
use crate::cri::InterconnectSettings;
use crate::error::DrtioError;
use crate::node::{NodeId, PortSettings, SatelliteSettings, Topology};
use crate::routing::{default_tables, NextHop, RoutingSnapshot, RoutingTable, RoutingTables};

// ── Private YAML deserialization types ────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    master: MasterEntry,
    #[serde(default)]
    tsc: TscEntry,
    #[serde(default)]
    interconnect: InterconnectEntry,
    #[serde(default)]
    aux: AuxEntry,
    #[serde(default)]
    calibration: CalibrationEntry,
    satellites: Vec<SatelliteEntry>,
    routing: Option<BTreeMap<u8, BTreeMap<u8, HopEntry>>>,
}

#[derive(Debug, Deserialize)]
struct MasterEntry {
    #[serde(default = "default_master_name")]
    name: String,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

impl Default for MasterEntry {
    fn default() -> Self {
        Self {
            name: default_master_name(),
            channels: Vec::new(),
        }
    }
}

fn default_master_name() -> String {
    String::from("master")
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct TscEntry {
    broadcast_period: u64,
    tolerance: u64,
}

impl Default for TscEntry {
    fn default() -> Self {
        Self {
            broadcast_period: 64,
            tolerance: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct InterconnectEntry {
    egress_depth: usize,
    sources: usize,
    local_latency: u64,
    fifo_depth: usize,
}

impl Default for InterconnectEntry {
    fn default() -> Self {
        Self {
            egress_depth: 128,
            sources: 2,
            local_latency: 0,
            fifo_depth: 64,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct AuxEntry {
    retransmit_after: u64,
    window: usize,
    error_threshold: u32,
    echo_timeout: u64,
}

impl Default for AuxEntry {
    fn default() -> Self {
        let d = AuxSettings::default();
        Self {
            retransmit_after: d.retransmit_after,
            window: d.window,
            error_threshold: d.error_threshold,
            echo_timeout: d.echo_timeout,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
struct CalibrationEntry {
    window: u64,
    alarm_after: u32,
    lock_confirm: u32,
    latency_margin: u64,
}

impl Default for CalibrationEntry {
    fn default() -> Self {
        Self {
            window: 64,
            alarm_after: 3,
            lock_confirm: 2,
            latency_margin: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SatelliteEntry {
    id: u8,
    name: Option<String>,
    #[serde(default)]
    upstream: u8,
    #[serde(default = "default_latency")]
    latency: u64,
    #[serde(default)]
    training: u64,
    #[serde(default)]
    phase_offset: i32,
    #[serde(default)]
    channels: Vec<ChannelEntry>,
}

fn default_latency() -> u64 {
    1
}

#[derive(Debug, Deserialize)]
struct ChannelEntry {
    id: u32,
    #[serde(default)]
    direction: Direction,
    #[serde(default)]
    kind: ChannelKind,
}

impl From<&ChannelEntry> for ChannelSpec {
    fn from(e: &ChannelEntry) -> Self {
        ChannelSpec {
            id: ChannelId(e.id),
            direction: e.direction,
            kind: e.kind,
        }
    }
}

/// `local`, `none` or a port number.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum HopEntry {
    Port(u8),
    Word(String),
}

impl HopEntry {
    fn to_hop(&self) -> Result<NextHop, DrtioError> {
        match self {
            HopEntry::Port(p) => Ok(NextHop::Port(*p)),
            HopEntry::Word(w) if w == "local" => Ok(NextHop::Local),
            HopEntry::Word(w) if w == "none" => Ok(NextHop::NoRoute),
            HopEntry::Word(w) => Err(DrtioError::Config(format!(
                "unknown next hop {w:?} (expected local, none or a port number)"
            ))),
        }
    }
}

// ── Public data structures ────────────────────────────────────────────────────

/// One node as configured.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub name: String,
    /// `None` for the master.
    pub upstream: Option<NodeId>,
    /// One-way latency of the upstream link, in coarse ticks.
    pub latency: u64,
    /// Ticks the upstream link needs before word alignment.
    pub training: u64,
    /// True phase offset seen by the satellite's phase detector.
    pub phase_offset: i32,
    pub channels: Vec<ChannelSpec>,
}

/// Calibration tunables shared by every link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalibrationSettings {
    pub window: u64,
    pub alarm_after: u32,
    pub lock_confirm: u32,
    pub latency_margin: u64,
}

/// Every tunable of the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FabricSettings {
    pub broadcast_period: u64,
    pub tolerance: u64,
    pub interconnect: InterconnectSettings,
    /// Depth of each channel FIFO.
    pub fifo_depth: usize,
    pub aux: AuxSettings,
    pub calibration: CalibrationSettings,
}

impl Default for FabricSettings {
    fn default() -> Self {
        let tsc = TscEntry::default();
        let cal = CalibrationEntry::default();
        Self {
            broadcast_period: tsc.broadcast_period,
            tolerance: tsc.tolerance,
            interconnect: InterconnectSettings::default(),
            fifo_depth: InterconnectEntry::default().fifo_depth,
            aux: AuxSettings::default(),
            calibration: CalibrationSettings {
                window: cal.window,
                alarm_after: cal.alarm_after,
                lock_confirm: cal.lock_confirm,
                latency_margin: cal.latency_margin,
            },
        }
    }
}

impl FabricSettings {
    pub fn port_settings(&self) -> PortSettings {
        PortSettings {
            broadcast_period: self.broadcast_period,
            calibration_window: self.calibration.window,
            alarm_after: self.calibration.alarm_after,
            latency_margin: self.calibration.latency_margin,
        }
    }

    pub fn satellite_settings(&self) -> SatelliteSettings {
        SatelliteSettings {
            tolerance: self.tolerance,
            calibration_window: self.calibration.window,
            alarm_after: self.calibration.alarm_after,
        }
    }
}

/// A validated topology.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologyConfig {
    pub master: NodeSpec,
    /// In file order; parents come before their children.
    pub satellites: Vec<NodeSpec>,
    pub settings: FabricSettings,
    /// Explicit tables replacing the derived ones.
    pub routing: BTreeMap<NodeId, RoutingTable>,
}

impl TopologyConfig {
    /// Built-in topology used when no file is given: the master with
    /// channel 0, one satellite with output channel 7 and input channel 8
    /// behind a 5-tick link that trains for 3 ticks.
    pub fn default_config() -> Self {
        Self {
            master: NodeSpec {
                id: NodeId::MASTER,
                name: default_master_name(),
                upstream: None,
                latency: 0,
                training: 0,
                phase_offset: 0,
                channels: vec![output(0)],
            },
            satellites: vec![NodeSpec {
                id: NodeId(1),
                name: String::from("sat1"),
                upstream: Some(NodeId::MASTER),
                latency: 5,
                training: 3,
                phase_offset: 40,
                channels: vec![
                    output(7),
                    ChannelSpec {
                        id: ChannelId(8),
                        direction: Direction::Input,
                        kind: ChannelKind::Input,
                    },
                ],
            }],
            settings: FabricSettings::default(),
            routing: BTreeMap::new(),
        }
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeSpec> {
        std::iter::once(&self.master).chain(self.satellites.iter())
    }

    pub fn node(&self, id: NodeId) -> Option<&NodeSpec> {
        self.nodes().find(|n| n.id == id)
    }

    /// The node tree.  Ports are numbered in satellite order.
    pub fn topology(&self) -> Result<Topology, DrtioError> {
        let mut topology = Topology::new(self.master.name.clone());
        for sat in &self.satellites {
            let upstream = sat
                .upstream
                .ok_or_else(|| DrtioError::Config(format!("satellite {} has no upstream", sat.id)))?;
            topology.add_satellite(sat.id, sat.name.clone(), upstream)?;
        }
        Ok(topology)
    }

    /// Derived tables with the explicit overrides applied.
    pub fn tables(&self, topology: &Topology) -> RoutingTables {
        let mut tables = default_tables(topology);
        for (node, table) in &self.routing {
            tables.insert(*node, table.clone());
        }
        tables
    }

    /// Owner of every channel.
    pub fn channel_owners(&self) -> BTreeMap<ChannelId, NodeId> {
        self.nodes()
            .flat_map(|n| n.channels.iter().map(move |c| (c.id, n.id)))
            .collect()
    }

    pub fn channels(&self) -> Vec<ChannelSpec> {
        self.nodes().flat_map(|n| n.channels.iter().copied()).collect()
    }

    /// Check everything that can be checked before bring-up.
    pub fn validate(&self) -> Result<(), DrtioError> {
        let mut seen = BTreeSet::new();
        for node in self.nodes() {
            if node.upstream.is_some() && node.latency == 0 {
                return Err(DrtioError::Config(format!(
                    "link to satellite {} must have a latency of at least one tick",
                    node.id
                )));
            }
            for c in &node.channels {
                if c.id.0 > ChannelId::MAX {
                    return Err(DrtioError::Config(format!(
                        "channel {} is beyond the 24-bit channel space",
                        c.id
                    )));
                }
                if !seen.insert(c.id) {
                    return Err(DrtioError::Config(format!("channel {} defined twice", c.id)));
                }
            }
        }
        let s = &self.settings;
        if s.interconnect.sources == 0 || s.interconnect.egress_depth == 0 || s.fifo_depth == 0 {
            return Err(DrtioError::Config(String::from(
                "interconnect depths and source count must be positive",
            )));
        }
        if s.broadcast_period == 0 || s.calibration.window == 0 || s.aux.window == 0 {
            return Err(DrtioError::Config(String::from(
                "broadcast period, calibration window and aux window must be positive",
            )));
        }
        let topology = self.topology()?;
        RoutingSnapshot::build(&topology, self.tables(&topology), self.channel_owners(), 0)?;
        Ok(())
    }
}

fn output(id: u32) -> ChannelSpec {
    ChannelSpec {
        id: ChannelId(id),
        direction: Direction::Output,
        kind: ChannelKind::Output,
    }
}

// ── TopologyConfigManager ─────────────────────────────────────────────────────

/// Loads and validates a topology from a YAML file.
#[derive(Debug, Default)]
pub struct TopologyConfigManager {
    config: Option<TopologyConfig>,
}

impl TopologyConfigManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse and validate `path`.  Calling this a second time replaces the
    /// previous topology.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read, the YAML is invalid or
    /// the topology fails validation.
    pub fn load_from_file(&mut self, path: &Path) -> Result<()> {
        info!("Loading topology from: {}", path.display());
        self.config = None;

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Cannot open topology file: {}", path.display()))?;
        let file: TopologyFile = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse YAML file: {}", path.display()))?;

        let config = convert(file)
            .with_context(|| format!("Invalid topology in {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid topology in {}", path.display()))?;

        for node in config.nodes() {
            debug!(
                id = %node.id,
                name = %node.name,
                upstream = ?node.upstream,
                latency = node.latency,
                channels = node.channels.len(),
                "  node"
            );
        }
        info!(
            satellites = config.satellites.len(),
            channels = config.channels().len(),
            overrides = config.routing.len(),
            "✓ topology loaded"
        );
        self.config = Some(config);
        Ok(())
    }

    pub fn is_loaded(&self) -> bool {
        self.config.is_some()
    }

    pub fn config(&self) -> Option<&TopologyConfig> {
        self.config.as_ref()
    }

    /// The loaded topology, or the built-in one.
    pub fn config_or_default(&self) -> TopologyConfig {
        self.config
            .clone()
            .unwrap_or_else(TopologyConfig::default_config)
    }
}

fn convert(file: TopologyFile) -> Result<TopologyConfig, DrtioError> {
    let master = NodeSpec {
        id: NodeId::MASTER,
        name: file.master.name,
        upstream: None,
        latency: 0,
        training: 0,
        phase_offset: 0,
        channels: file.master.channels.iter().map(ChannelSpec::from).collect(),
    };
    let mut satellites = Vec::with_capacity(file.satellites.len());
    for s in &file.satellites {
        if s.id == 0 {
            return Err(DrtioError::Config(String::from(
                "node 0 is the master and cannot be a satellite",
            )));
        }
        satellites.push(NodeSpec {
            id: NodeId(s.id),
            name: s.name.clone().unwrap_or_else(|| format!("sat{}", s.id)),
            upstream: Some(NodeId(s.upstream)),
            latency: s.latency,
            training: s.training,
            phase_offset: s.phase_offset,
            channels: s.channels.iter().map(ChannelSpec::from).collect(),
        });
    }

    let mut routing = BTreeMap::new();
    for (node, entries) in file.routing.unwrap_or_default() {
        let mut table = RoutingTable::new();
        for (dest, hop) in &entries {
            table.set(NodeId(*dest), hop.to_hop()?);
        }
        routing.insert(NodeId(node), table);
    }

    let i = file.interconnect;
    let c = file.calibration;
    Ok(TopologyConfig {
        master,
        satellites,
        settings: FabricSettings {
            broadcast_period: file.tsc.broadcast_period,
            tolerance: file.tsc.tolerance,
            interconnect: InterconnectSettings {
                egress_depth: i.egress_depth,
                sources: i.sources,
                local_latency: i.local_latency,
            },
            fifo_depth: i.fifo_depth,
            aux: AuxSettings {
                retransmit_after: file.aux.retransmit_after,
                window: file.aux.window,
                error_threshold: file.aux.error_threshold,
                echo_timeout: file.aux.echo_timeout,
            },
            calibration: CalibrationSettings {
                window: c.window,
                alarm_after: c.alarm_after,
                lock_confirm: c.lock_confirm,
                latency_margin: c.latency_margin,
            },
        },
        routing,
    })
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    /// Helper: write a YAML string to a temp file and return it.
    fn yaml_tempfile(content: &str) -> NamedTempFile {
        let mut f = NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    fn load(yaml: &str) -> Result<TopologyConfig> {
        let f = yaml_tempfile(yaml);
        let mut mgr = TopologyConfigManager::new();
        mgr.load_from_file(f.path())?;
        Ok(mgr.config().cloned().unwrap())
    }

    #[test]
    fn default_config_is_valid() {
        let cfg = TopologyConfig::default_config();
        cfg.validate().unwrap();
        assert_eq!(cfg.channel_owners().get(&ChannelId(7)), Some(&NodeId(1)));
        assert_eq!(cfg.settings.port_settings().broadcast_period, 64);
    }

    #[test]
    fn load_full_topology() {
        let yaml = r#"
master:
  name: crate0
  channels:
    - { id: 0 }
tsc:
  broadcast_period: 16
  tolerance: 1
interconnect:
  egress_depth: 32
  fifo_depth: 8
calibration:
  window: 100
  lock_confirm: 4
satellites:
  - id: 1
    name: crate1
    latency: 4
    training: 2
    channels:
      - { id: 7 }
      - { id: 8, direction: input, kind: input }
  - id: 2
    upstream: 1
    latency: 3
    phase_offset: -20
    channels:
      - { id: 9, kind: log }
"#;
        let cfg = load(yaml).unwrap();
        assert_eq!(cfg.master.name, "crate0");
        assert_eq!(cfg.satellites.len(), 2);
        assert_eq!(cfg.satellites[1].name, "sat2");
        assert_eq!(cfg.satellites[1].upstream, Some(NodeId(1)));
        assert_eq!(cfg.satellites[1].phase_offset, -20);
        assert_eq!(cfg.satellites[1].channels[0].kind, ChannelKind::Log);
        assert_eq!(cfg.satellites[0].channels[1].direction, Direction::Input);

        let s = cfg.settings;
        assert_eq!(s.broadcast_period, 16);
        assert_eq!(s.tolerance, 1);
        assert_eq!(s.interconnect.egress_depth, 32);
        assert_eq!(s.interconnect.sources, 2, "default");
        assert_eq!(s.fifo_depth, 8);
        assert_eq!(s.calibration.window, 100);
        assert_eq!(s.calibration.alarm_after, 3, "default");
        assert_eq!(s.calibration.lock_confirm, 4);
        assert_eq!(s.aux, AuxSettings::default());

        let topology = cfg.topology().unwrap();
        assert_eq!(topology.neighbour(NodeId(1), 0), Some(NodeId(2)));
    }

    #[test]
    fn omitted_sections_use_defaults() {
        let cfg = load("satellites:\n  - id: 1\n").unwrap();
        assert_eq!(cfg.master.name, "master");
        assert_eq!(cfg.satellites[0].latency, 1);
        assert_eq!(cfg.settings, FabricSettings::default());
        assert!(cfg.routing.is_empty());
    }

    #[test]
    fn routing_overrides_replace_derived_tables() {
        let yaml = r#"
satellites:
  - id: 1
  - id: 2
routing:
  0: { 0: local, 1: 0 }
"#;
        let cfg = load(yaml).unwrap();
        let topology = cfg.topology().unwrap();
        let tables = cfg.tables(&topology);
        assert_eq!(tables[&NodeId(0)].get(NodeId(1)), NextHop::Port(0));
        assert_eq!(tables[&NodeId(0)].get(NodeId(2)), NextHop::NoRoute);
        // Not overridden: still derived.
        assert_eq!(tables[&NodeId(2)].get(NodeId(2)), NextHop::Local);
    }

    #[test]
    fn invalid_topologies_are_rejected() {
        // Duplicate channel.
        assert!(load("satellites:\n  - id: 1\n    channels: [{ id: 7 }, { id: 7 }]\n").is_err());
        // Parent defined after the child.
        assert!(load("satellites:\n  - { id: 2, upstream: 1 }\n  - { id: 1 }\n").is_err());
        // Zero-latency link.
        assert!(load("satellites:\n  - { id: 1, latency: 0 }\n").is_err());
        // Route through a port that does not exist.
        assert!(load("satellites:\n  - id: 1\nrouting:\n  0: { 0: local, 1: 3 }\n").is_err());
        // Unknown hop keyword.
        assert!(load("satellites:\n  - id: 1\nrouting:\n  0: { 0: here }\n").is_err());
    }

    #[test]
    fn missing_file_returns_error() {
        let mut mgr = TopologyConfigManager::new();
        let result = mgr.load_from_file(Path::new("/nonexistent/path/topology.yaml"));
        assert!(result.is_err());
        assert!(!mgr.is_loaded());
        assert_eq!(mgr.config_or_default(), TopologyConfig::default_config());
    }

    #[test]
    fn malformed_yaml_returns_error() {
        let f = yaml_tempfile("this is: not: valid: yaml: content:::");
        let mut mgr = TopologyConfigManager::new();
        assert!(mgr.load_from_file(f.path()).is_err());
        assert!(!mgr.is_loaded());
    }
}
