/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Reliable delivery over one link (go-back-N).
//!
//! ## Sender
//!
//! Messages wait in an outbox.  A message gets its sequence number the first
//! time it is transmitted; at most `window` numbered messages are
//! outstanding.  When the oldest outstanding message has waited
//! `retransmit_after` ticks, every outstanding message is sent again.
//! Cumulative acknowledgements retire them.
//!
//! ## Receiver
//!
//! Delivers `seq == expected` exactly once, re-acknowledges duplicates and
//! drops anything beyond a gap.  A frame from a new peer session only moves
//! `expected` forward, up to that frame's `base`; it never rewinds it.
//!
//! ## Sessions
//!
//! [`reset_session`](AuxController::reset_session) (on link loss, or after
//! `error_threshold` consecutive bad frames) starts a new transmit session.
//! Sequence numbers keep running across sessions, so a message resent after
//! a reset keeps its number and the receiver drops it if it already
//! delivered it.  Acks from an older session are ignored.
//!
//! Sequence numbers wrap and skip `0`, which marks a pure acknowledgement;
//! they are compared in serial-number order.

use std::collections::VecDeque;

use tracing::{debug, info, trace, warn};

use crate::aux::packet::{self, Sequencing};
use crate::aux::{AuxFrame, AuxSettings};
use crate::error::AuxProtocolError;
use crate::link::LinkId;

/// Activity counters of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuxStats {
    /// Frames handed to the link, acks and retransmissions included.
    pub sent: u64,
    pub retransmits: u64,
    pub delivered: u64,
    pub duplicates: u64,
    pub gaps: u64,
    pub protocol_errors: u64,
    pub session_resets: u64,
}

#[derive(Debug)]
struct Outgoing {
    frame: AuxFrame,
    seq: Option<u32>,
    sent_at: u64,
}

/// One end of the aux channel of a link.
#[derive(Debug)]
pub struct AuxController {
    link: LinkId,
    settings: AuxSettings,

    tx_session: u32,
    next_seq: u32,
    outbox: VecDeque<Outgoing>,
    resend: bool,

    rx_session: u32,
    expected: u32,
    ack_pending: bool,

    consecutive_errors: u32,
    reset_flag: bool,
    stats: AuxStats,
}

impl AuxController {
    /// `initial_session` lets the two ends of a link start from distinct
    /// session ids; any non-zero value works.
    pub fn new(link: LinkId, settings: AuxSettings, initial_session: u32) -> Self {
        Self {
            link,
            settings,
            tx_session: initial_session.max(1),
            next_seq: 1,
            outbox: VecDeque::new(),
            resend: false,
            rx_session: 0,
            expected: 1,
            ack_pending: false,
            consecutive_errors: 0,
            reset_flag: false,
            stats: AuxStats::default(),
        }
    }

    pub fn stats(&self) -> &AuxStats {
        &self.stats
    }

    pub fn session(&self) -> u32 {
        self.tx_session
    }

    /// Messages not yet acknowledged, numbered or not.
    pub fn queued(&self) -> usize {
        self.outbox.len()
    }

    /// Queue a message for reliable delivery.
    pub fn enqueue(&mut self, frame: AuxFrame) {
        trace!(link = %self.link, dest = %frame.destination, "aux enqueue");
        self.outbox.push_back(frame_entry(frame));
    }

    /// Start a new transmit session.  Queued messages keep their numbers and
    /// outstanding ones go out again on the next poll.
    pub fn reset_session(&mut self) {
        self.tx_session = self.tx_session.wrapping_add(1).max(1);
        self.resend = true;
        self.consecutive_errors = 0;
        self.ack_pending = false;
        self.stats.session_resets += 1;
        self.reset_flag = true;
        info!(
            link = %self.link,
            session = self.tx_session,
            queued = self.outbox.len(),
            "aux session reset"
        );
    }

    /// `true` once after every session reset.
    pub fn take_session_reset(&mut self) -> bool {
        std::mem::take(&mut self.reset_flag)
    }

    /// Process one received aux frame.  Returns the frame to deliver, if any.
    pub fn receive(&mut self, bytes: &[u8]) -> Result<Option<AuxFrame>, AuxProtocolError> {
        let decoded = match packet::decode(bytes) {
            Ok(d) => d,
            Err(e) => {
                self.stats.protocol_errors += 1;
                self.consecutive_errors += 1;
                warn!(
                    link = %self.link,
                    error = %e,
                    consecutive = self.consecutive_errors,
                    "✗ aux frame dropped"
                );
                if self.consecutive_errors >= self.settings.error_threshold {
                    self.reset_session();
                }
                return Err(e);
            }
        };
        self.consecutive_errors = 0;
        let s = decoded.sequencing;

        if s.ack_session == self.tx_session {
            self.process_ack(s.ack);
        }

        let Some(frame) = decoded.frame else {
            return Ok(None);
        };

        if s.session != self.rx_session {
            debug!(
                link = %self.link,
                old = self.rx_session,
                new = s.session,
                base = s.base,
                "aux peer session adopted"
            );
            self.rx_session = s.session;
            if seq_before(self.expected, s.base) {
                self.expected = s.base;
            }
        }

        self.ack_pending = true;
        if s.seq == self.expected {
            self.expected = next_seq(self.expected);
            self.stats.delivered += 1;
            Ok(Some(frame))
        } else if seq_before(s.seq, self.expected) {
            self.stats.duplicates += 1;
            trace!(link = %self.link, seq = s.seq, "aux duplicate");
            Ok(None)
        } else {
            self.stats.gaps += 1;
            trace!(link = %self.link, seq = s.seq, expected = self.expected, "aux gap");
            Ok(None)
        }
    }

    fn process_ack(&mut self, ack: u32) {
        while let Some(front) = self.outbox.front() {
            match front.seq {
                Some(seq) if seq_before(seq, ack) => {
                    self.outbox.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Frames to put on the wire this tick.  Call only while the link is up.
    pub fn poll_transmit(&mut self, now: u64) -> Vec<Vec<u8>> {
        let mut out = Vec::new();

        let retransmit_after = self.settings.retransmit_after;
        let due = self.outbox.front().is_some_and(|e| {
            e.seq.is_some() && (self.resend || now.saturating_sub(e.sent_at) >= retransmit_after)
        });
        self.resend = false;
        if due {
            let n = self.outbox.iter().take_while(|e| e.seq.is_some()).count();
            debug!(link = %self.link, count = n, "aux retransmit");
            self.stats.retransmits += n as u64;
            for i in 0..n {
                out.push(self.transmit(i, now));
            }
        }

        let outstanding = self.outbox.iter().filter(|e| e.seq.is_some()).count();
        let mut room = self.settings.window.saturating_sub(outstanding);
        let mut i = outstanding;
        while room > 0 && i < self.outbox.len() {
            self.outbox[i].seq = Some(self.next_seq);
            self.next_seq = next_seq(self.next_seq);
            out.push(self.transmit(i, now));
            i += 1;
            room -= 1;
        }

        if out.is_empty() && self.ack_pending {
            let seq = self.sequencing(0);
            out.push(packet::encode(seq, None));
        }
        self.ack_pending = false;
        self.stats.sent += out.len() as u64;
        out
    }

    fn transmit(&mut self, index: usize, now: u64) -> Vec<u8> {
        let seq = self.outbox[index].seq.unwrap_or(0);
        let sequencing = self.sequencing(seq);
        let entry = &mut self.outbox[index];
        entry.sent_at = now;
        packet::encode(sequencing, Some(&entry.frame))
    }

    fn sequencing(&self, seq: u32) -> Sequencing {
        let base = self
            .outbox
            .front()
            .and_then(|e| e.seq)
            .unwrap_or(self.next_seq);
        Sequencing {
            session: self.tx_session,
            seq,
            base,
            ack: self.expected,
            ack_session: self.rx_session,
        }
    }
}

/// The number after `seq`, skipping `0`.
fn next_seq(seq: u32) -> u32 {
    seq.wrapping_add(1).max(1)
}

/// `a` comes before `b` in serial-number order.
fn seq_before(a: u32, b: u32) -> bool {
    (b.wrapping_sub(a) as i32) > 0
}

fn frame_entry(frame: AuxFrame) -> Outgoing {
    Outgoing {
        frame,
        seq: None,
        sent_at: 0,
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
