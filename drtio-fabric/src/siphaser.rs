/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Clock phase aligner (satellites only).
//!
//! Each tick the aligner samples a phase detector that compares the recovered
//! link clock with the locally generated clock and nudges the local clock's
//! phase shift towards zero error.  The step size halves every time the error
//! changes sign, so the loop converges like a binary search and then holds.
//! `lock_confirm` consecutive `Within` samples declare lock.
//!
//! The detector is hardware; [`SimPhaseDetector`] models one with a fixed
//! true offset and a fault switch that keeps it from ever converging.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

/// Fine phase-shift steps per fine timestamp tick.
pub const STEPS_PER_FINE_TICK: i32 = 8;

/// Initial correction step, in phase-shift steps.
const INITIAL_STEP: i32 = 64;

/// Result of one phase comparison.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseSample {
    /// Local clock leads: shift it later.
    Lead,
    /// Local clock lags: shift it earlier.
    Lag,
    /// Edges coincide within one fine tick.
    Within,
}

/// Phase detector driven by the aligner.
pub trait PhaseDetector: Send {
    /// Compare edges with the local clock shifted by `shift` steps.
    fn sample(&mut self, shift: i32) -> PhaseSample;
}

/// Aligner status after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlignerStatus {
    Searching,
    Locked,
}

/// The feedback loop state.
#[derive(Debug, Clone)]
pub struct PhaseAligner {
    shift: i32,
    step: i32,
    last: Option<PhaseSample>,
    confirmations: u32,
    lock_confirm: u32,
    locked: bool,
}

impl PhaseAligner {
    pub fn new(lock_confirm: u32) -> Self {
        Self {
            shift: 0,
            step: INITIAL_STEP,
            last: None,
            confirmations: 0,
            lock_confirm: lock_confirm.max(1),
            locked: false,
        }
    }

    /// Current phase shift applied to the local clock.
    pub fn shift(&self) -> i32 {
        self.shift
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// Restart the search from scratch (new calibration attempt).
    pub fn reset(&mut self) {
        *self = Self::new(self.lock_confirm);
    }

    /// Run one iteration of the loop.
    ///
    /// Once locked the aligner keeps tracking: a sample outside the lock
    /// window drops lock and the search resumes with the smallest step.
    pub fn step(&mut self, detector: &mut dyn PhaseDetector) -> AlignerStatus {
        let sample = detector.sample(self.shift);
        match sample {
            PhaseSample::Within => {
                self.confirmations += 1;
                if !self.locked && self.confirmations >= self.lock_confirm {
                    self.locked = true;
                    info!(shift = self.shift, "phase locked");
                }
            }
            PhaseSample::Lead | PhaseSample::Lag => {
                if self.locked {
                    debug!(shift = self.shift, "phase lock lost, re-tracking");
                    self.locked = false;
                    self.step = 1;
                }
                self.confirmations = 0;
                if matches!(self.last, Some(prev) if prev != sample && prev != PhaseSample::Within)
                {
                    self.step = (self.step / 2).max(1);
                }
                match sample {
                    PhaseSample::Lead => self.shift += self.step,
                    _ => self.shift -= self.step,
                }
            }
        }
        self.last = Some(sample);
        if self.locked {
            AlignerStatus::Locked
        } else {
            AlignerStatus::Searching
        }
    }
}

// ── Simulated detector ────────────────────────────────────────────────────────

/// A phase detector with a fixed true offset (in phase-shift steps).
///
/// While the shared fault flag is set the detector reports the opposite of
/// the truth on alternate samples, so the loop can never settle.
#[derive(Debug, Clone)]
pub struct SimPhaseDetector {
    offset: i32,
    fault: Arc<AtomicBool>,
    flip: bool,
}

impl SimPhaseDetector {
    pub fn new(offset: i32) -> Self {
        Self {
            offset,
            fault: Arc::new(AtomicBool::new(false)),
            flip: false,
        }
    }

    /// Switch controlling the injected fault.
    pub fn fault_switch(&self) -> Arc<AtomicBool> {
        self.fault.clone()
    }
}

impl PhaseDetector for SimPhaseDetector {
    fn sample(&mut self, shift: i32) -> PhaseSample {
        if self.fault.load(Ordering::Relaxed) {
            self.flip = !self.flip;
            return if self.flip {
                PhaseSample::Lead
            } else {
                PhaseSample::Lag
            };
        }
        let error = self.offset - shift;
        if error.abs() < STEPS_PER_FINE_TICK {
            PhaseSample::Within
        } else if error > 0 {
            PhaseSample::Lead
        } else {
            PhaseSample::Lag
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
