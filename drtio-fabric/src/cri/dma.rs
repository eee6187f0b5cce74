/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! DMA command source.
//!
//! A DMA sequence is a byte buffer of write records:
//!
//! ```text
//!  ┌─────┬──────────────┬─────────────────┬─────────┬────────────────┐
//!  │ len │ channel (3)  │ timestamp (8)   │ address │ data (1..=64)  │   all little endian
//!  └─────┴──────────────┴─────────────────┴─────────┴────────────────┘
//!  len counts the whole record including itself; a zero len byte ends the sequence.
//! ```
//!
//! The timestamp field holds the packed `coarse << FINE_TS_WIDTH | fine` form.
//! [`DmaPlayer`] replays a decoded sequence through its own source id.

use tracing::{debug, warn};

use crate::channel::ChannelId;
use crate::cri::{Ack, Payload, SourceHandle, TimedCommand, MAX_PAYLOAD};
use crate::error::{CriError, DmaError};
use crate::tsc::GlobalTimestamp;

/// len + channel + timestamp + address.
const HEADER_LEN: usize = 1 + 3 + 8 + 1;

/// A decoded DMA sequence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DmaSequence {
    records: Vec<TimedCommand>,
}

impl DmaSequence {
    pub fn from_commands(records: impl IntoIterator<Item = TimedCommand>) -> Self {
        Self {
            records: records.into_iter().collect(),
        }
    }

    pub fn records(&self) -> &[TimedCommand] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Parse records up to the terminating zero byte.  Trailing bytes after
    /// the terminator (buffer padding) are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self, DmaError> {
        let mut records = Vec::new();
        let mut offset = 0;
        loop {
            let len = usize::from(*bytes.get(offset).ok_or(DmaError::Unterminated)?);
            if len == 0 {
                return Ok(Self { records });
            }
            if len <= HEADER_LEN || len > HEADER_LEN + MAX_PAYLOAD {
                let data = len.saturating_sub(HEADER_LEN);
                return Err(if data > MAX_PAYLOAD {
                    DmaError::DataTooWide { offset, len: data }
                } else {
                    DmaError::Truncated { offset }
                });
            }
            let record = bytes
                .get(offset..offset + len)
                .ok_or(DmaError::Truncated { offset })?;
            let channel = le(&record[1..4]) as u32;
            let timestamp = GlobalTimestamp::from_packed(le(&record[4..12]));
            let address = record[12];
            let data =
                Payload::from_bytes(&record[HEADER_LEN..]).ok_or(DmaError::Truncated { offset })?;
            records.push(
                TimedCommand::write_payload(ChannelId(channel), timestamp, data).with_address(address),
            );
            offset += len;
        }
    }

    /// Serialize; each record keeps the width of its payload.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for r in &self.records {
            out.push((HEADER_LEN + r.data.width()) as u8);
            out.extend_from_slice(&r.channel.0.to_le_bytes()[..3]);
            out.extend_from_slice(&r.timestamp.to_packed().to_le_bytes());
            out.push(r.address);
            out.extend_from_slice(r.data.as_bytes());
        }
        out.push(0);
        out
    }
}

fn le(bytes: &[u8]) -> u64 {
    bytes
        .iter()
        .rev()
        .fold(0u64, |acc, b| (acc << 8) | u64::from(*b))
}

/// Outcome of one [`DmaPlayer::pump`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaProgress {
    /// Some records are waiting for egress room.
    Pending { submitted: usize },
    Done,
}

/// Replays a sequence through the interconnect.
///
/// Every record's timestamp is shifted by `offset` coarse ticks, so one
/// recorded sequence can be played at different times.
#[derive(Debug)]
pub struct DmaPlayer {
    source: SourceHandle,
    sequence: DmaSequence,
    offset: u64,
    next: usize,
}

impl DmaPlayer {
    pub fn new(source: SourceHandle, sequence: DmaSequence, offset: u64) -> Self {
        Self {
            source,
            sequence,
            offset,
            next: 0,
        }
    }

    /// Records accepted so far.
    pub fn position(&self) -> usize {
        self.next
    }

    /// Submit as many records as the interconnect takes.  `BufferFull` and
    /// `RouteBusy` pause playback until the next call; any other rejection
    /// aborts it.
    pub fn pump(&mut self) -> Result<DmaProgress, DmaError> {
        let mut submitted = 0;
        while let Some(record) = self.sequence.records.get(self.next) {
            let mut cmd = *record;
            let coarse = cmd
                .timestamp
                .coarse()
                .checked_add(self.offset)
                .ok_or(DmaError::TimestampOverflow { index: self.next })?;
            cmd.timestamp = GlobalTimestamp::new(coarse, cmd.timestamp.fine());
            match self.source.submit(cmd) {
                Ok(Ack::Local | Ack::Forwarded) => {
                    self.next += 1;
                    submitted += 1;
                }
                Err(CriError::BufferFull { .. } | CriError::RouteBusy { .. }) => {
                    debug!(position = self.next, submitted, "DMA waiting for egress room");
                    return Ok(DmaProgress::Pending { submitted });
                }
                Err(source) => {
                    warn!(index = self.next, error = %source, "✗ DMA playback aborted");
                    return Err(DmaError::Submit {
                        index: self.next,
                        source,
                    });
                }
            }
        }
        Ok(DmaProgress::Done)
    }
}
