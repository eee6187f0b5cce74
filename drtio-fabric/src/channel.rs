/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Timed I/O channels: the driver boundary and the per-node output FIFOs.
//!
//! ```text
//!  TimedCommand ──► LocalIo (one FIFO per channel) ──(tick ≥ timestamp)──► ChannelDriver
//! ```
//!
//! Hardware channel implementations are external; [`LatchBank`] is the
//! in-memory reference driver used by the simulator and the tests.

use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::cri::{Opcode, Payload, TimedCommand};
use crate::error::DriverReject;
use crate::tsc::GlobalTimestamp;

// ── Identity ──────────────────────────────────────────────────────────────────

/// Logical channel index, unique across the whole topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ChannelId(pub u32);

impl ChannelId {
    /// Channel numbers are carried in 3 bytes on the DMA wire.
    pub const MAX: u32 = 0x00ff_ffff;
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Data direction of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Output,
    Input,
    Bidirectional,
}

/// What the channel is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    #[default]
    Output,
    /// Input-capable: accepts `Sample` and latches the sampled level.
    Input,
    /// Diagnostic log channel; payload words are recorded verbatim.
    Log,
}

/// Static description of one channel on its owning node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec {
    pub id: ChannelId,
    pub direction: Direction,
    pub kind: ChannelKind,
}

impl ChannelSpec {
    /// Whether the channel can execute `opcode`.
    pub fn supports(&self, opcode: Opcode) -> bool {
        match opcode {
            Opcode::Write => self.direction != Direction::Input,
            Opcode::Sample => {
                self.kind == ChannelKind::Input && self.direction != Direction::Output
            }
        }
    }
}

// ── Driver interface ──────────────────────────────────────────────────────────

/// Hardware channel driver as seen by the fabric.
///
/// `write` and `sample` are called on the tick the command is due; the driver
/// applies the fine timestamp itself.
pub trait ChannelDriver: Send + Sync {
    fn write(
        &self,
        channel: ChannelId,
        at: GlobalTimestamp,
        address: u8,
        data: &Payload,
    ) -> Result<(), DriverReject>;

    fn sample(&self, channel: ChannelId, at: GlobalTimestamp) -> Result<(), DriverReject>;

    /// Last latched value, `None` if the channel never executed anything.
    fn read_latched(&self, channel: ChannelId) -> Option<u64>;
}

/// One executed command, as recorded by [`LatchBank`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Execution {
    pub channel: ChannelId,
    pub at: GlobalTimestamp,
    pub opcode: Opcode,
    /// First word of `data`.
    pub value: u64,
    pub data: Payload,
}

#[derive(Debug, Default)]
struct Latch {
    value: Option<u64>,
    input_level: u64,
}

/// In-memory reference driver: every channel is a latch.
///
/// `Write` latches the data word, `Sample` latches the current input level
/// (set with [`set_input`](Self::set_input)).  Every execution is appended to
/// a history so tests can check exact execution ticks.
#[derive(Debug, Default)]
pub struct LatchBank {
    latches: Mutex<BTreeMap<ChannelId, Latch>>,
    history: Mutex<Vec<Execution>>,
}

impl LatchBank {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the input level seen by subsequent `Sample` commands.
    pub fn set_input(&self, channel: ChannelId, level: u64) {
        self.latches.lock().entry(channel).or_default().input_level = level;
    }

    /// Every execution so far, in execution order.
    pub fn history(&self) -> Vec<Execution> {
        self.history.lock().clone()
    }

    /// Executions on one channel.
    pub fn history_of(&self, channel: ChannelId) -> Vec<Execution> {
        self.history
            .lock()
            .iter()
            .filter(|e| e.channel == channel)
            .copied()
            .collect()
    }
}

impl ChannelDriver for LatchBank {
    fn write(
        &self,
        channel: ChannelId,
        at: GlobalTimestamp,
        _address: u8,
        data: &Payload,
    ) -> Result<(), DriverReject> {
        self.latches.lock().entry(channel).or_default().value = Some(data.word());
        self.history.lock().push(Execution {
            channel,
            at,
            opcode: Opcode::Write,
            value: data.word(),
            data: *data,
        });
        Ok(())
    }

    fn sample(&self, channel: ChannelId, at: GlobalTimestamp) -> Result<(), DriverReject> {
        let level = {
            let mut latches = self.latches.lock();
            let latch = latches.entry(channel).or_default();
            latch.value = Some(latch.input_level);
            latch.input_level
        };
        self.history.lock().push(Execution {
            channel,
            at,
            opcode: Opcode::Sample,
            value: level,
            data: Payload::from_word(level),
        });
        Ok(())
    }

    fn read_latched(&self, channel: ChannelId) -> Option<u64> {
        self.latches.lock().get(&channel).and_then(|l| l.value)
    }
}

// ── LocalIo ───────────────────────────────────────────────────────────────────

/// Why a command could not be queued on its destination node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    UnknownChannel,
    Unsupported,
    /// Channel FIFO full.
    Overflow,
    /// The timestamp is already in the past on this node.
    Underflow,
}

struct ChannelFifo {
    spec: ChannelSpec,
    queue: Mutex<VecDeque<TimedCommand>>,
}

/// The output FIFOs of one node plus the driver they drain into.
///
/// `push` may be called from any thread; `execute_due` is called once per
/// tick by the node's tick loop.
pub struct LocalIo {
    fifos: BTreeMap<ChannelId, ChannelFifo>,
    depth: usize,
    driver: Arc<dyn ChannelDriver>,
    flushed: AtomicU64,
}

impl fmt::Debug for LocalIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIo")
            .field("channels", &self.fifos.keys().collect::<Vec<_>>())
            .field("depth", &self.depth)
            .field("pending", &self.pending())
            .finish()
    }
}

impl LocalIo {
    pub fn new(
        channels: impl IntoIterator<Item = ChannelSpec>,
        depth: usize,
        driver: Arc<dyn ChannelDriver>,
    ) -> Self {
        let fifos = channels
            .into_iter()
            .map(|spec| {
                (
                    spec.id,
                    ChannelFifo {
                        spec,
                        queue: Mutex::new(VecDeque::with_capacity(depth)),
                    },
                )
            })
            .collect();
        Self {
            fifos,
            depth,
            driver,
            flushed: AtomicU64::new(0),
        }
    }

    pub fn spec(&self, channel: ChannelId) -> Option<&ChannelSpec> {
        self.fifos.get(&channel).map(|f| &f.spec)
    }

    pub fn driver(&self) -> &Arc<dyn ChannelDriver> {
        &self.driver
    }

    /// Queue `cmd` on its channel.  `now` is this node's current coarse tick.
    pub fn push(&self, cmd: TimedCommand, now: u64) -> Result<(), PushError> {
        let fifo = self
            .fifos
            .get(&cmd.channel)
            .ok_or(PushError::UnknownChannel)?;
        if !fifo.spec.supports(cmd.opcode) {
            return Err(PushError::Unsupported);
        }
        if cmd.timestamp.coarse() < now {
            return Err(PushError::Underflow);
        }
        let mut queue = fifo.queue.lock();
        if queue.len() >= self.depth {
            return Err(PushError::Overflow);
        }
        queue.push_back(cmd);
        Ok(())
    }

    /// Hand every command whose coarse timestamp has been reached to the
    /// driver.  Returns the driver rejections (reported asynchronously by the
    /// caller).
    pub fn execute_due(&self, now: u64) -> Vec<DriverReject> {
        let mut faults = Vec::new();
        for (channel, fifo) in &self.fifos {
            let mut queue = fifo.queue.lock();
            while queue.front().is_some_and(|c| c.timestamp.coarse() <= now) {
                let Some(cmd) = queue.pop_front() else { break };
                let result = match cmd.opcode {
                    Opcode::Write => {
                        self.driver
                            .write(*channel, cmd.timestamp, cmd.address, &cmd.data)
                    }
                    Opcode::Sample => self.driver.sample(*channel, cmd.timestamp),
                };
                match result {
                    Ok(()) => debug!(channel = %channel, at = %cmd.timestamp, now, "executed"),
                    Err(reject) => {
                        warn!(channel = %channel, reason = %reject.reason, "driver rejected command");
                        faults.push(reject);
                    }
                }
            }
        }
        faults
    }

    /// Drop every pending command (loss of synchronization).  Returns how
    /// many were dropped.
    pub fn flush(&self) -> usize {
        let dropped: usize = self
            .fifos
            .values()
            .map(|f| {
                let mut q = f.queue.lock();
                let n = q.len();
                q.clear();
                n
            })
            .sum();
        self.flushed.fetch_add(dropped as u64, Ordering::Relaxed);
        dropped
    }

    /// Commands dropped by [`flush`](Self::flush) since start-up.
    pub fn flushed_total(&self) -> u64 {
        self.flushed.load(Ordering::Relaxed)
    }

    pub fn pending(&self) -> usize {
        self.fifos.values().map(|f| f.queue.lock().len()).sum()
    }

    pub fn channels(&self) -> impl Iterator<Item = &ChannelSpec> {
        self.fifos.values().map(|f| &f.spec)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
