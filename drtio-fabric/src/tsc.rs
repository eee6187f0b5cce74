/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Timestamp counter (TSC) and the global timestamp type.
//!
//! ```text
//!  master TSC ──(TscLoad / TscSync)──► satellite TSC ──► repeater TSC ...
//!  free-running                         loaded once per link-up, then free-running
//! ```
//!
//! The coarse component is the shared cross-node time axis.  The fine
//! component is a sub-tick phase value that only the destination channel
//! driver interprets; it never takes part in scheduling decisions.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Number of fine-timestamp bits below one coarse tick.
pub const FINE_TS_WIDTH: u32 = 3;

/// Fine ticks per coarse tick.
pub const FINE_TICKS_PER_COARSE: u8 = 1 << FINE_TS_WIDTH;

// ── GlobalTimestamp ───────────────────────────────────────────────────────────

/// A point on the global timeline.
///
/// Ordering is lexicographic on `(coarse, fine)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct GlobalTimestamp {
    coarse: u64,
    fine: u8,
}

impl GlobalTimestamp {
    /// Build a timestamp.  `fine` is masked to [`FINE_TS_WIDTH`] bits.
    pub fn new(coarse: u64, fine: u8) -> Self {
        Self {
            coarse,
            fine: fine & (FINE_TICKS_PER_COARSE - 1),
        }
    }

    /// Timestamp on a coarse tick boundary.
    pub fn from_coarse(coarse: u64) -> Self {
        Self { coarse, fine: 0 }
    }

    /// Decode the packed `coarse << FINE_TS_WIDTH | fine` representation.
    pub fn from_packed(raw: u64) -> Self {
        Self::new(raw >> FINE_TS_WIDTH, (raw & 0x7) as u8)
    }

    /// Packed representation used by the DMA record format.
    pub fn to_packed(self) -> u64 {
        (self.coarse << FINE_TS_WIDTH) | u64::from(self.fine)
    }

    pub fn coarse(self) -> u64 {
        self.coarse
    }

    pub fn fine(self) -> u8 {
        self.fine
    }
}

impl From<u64> for GlobalTimestamp {
    fn from(coarse: u64) -> Self {
        Self::from_coarse(coarse)
    }
}

impl fmt::Display for GlobalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.coarse, self.fine)
    }
}

// ── Tsc ───────────────────────────────────────────────────────────────────────

/// The node-local timestamp counter.
///
/// Cloning yields another handle onto the same counter: the tick loop owns
/// the writes, command sources read it concurrently to make scheduling
/// decisions.
#[derive(Debug, Clone, Default)]
pub struct Tsc {
    coarse: Arc<AtomicU64>,
}

impl Tsc {
    /// A counter starting at epoch 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current coarse value.
    pub fn now(&self) -> u64 {
        self.coarse.load(Ordering::Acquire)
    }

    /// Advance by one coarse tick and return the new value.
    pub fn advance(&self) -> u64 {
        self.coarse.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Overwrite the counter (satellite TSC load).
    pub fn load(&self, coarse: u64) {
        self.coarse.store(coarse, Ordering::Release);
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
