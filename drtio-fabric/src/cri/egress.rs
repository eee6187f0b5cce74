/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Bounded egress queue of one master port with per-source quotas.
//!
//! The queue itself is a `tokio::sync::mpsc` channel used in its
//! non-blocking form (`try_send` / `try_recv`), so producers on any thread
//! and the tick loop never wait on each other.  Each source may hold at most
//! `depth / sources` entries, which bounds how long one source can keep the
//! other out of the queue.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::cri::{SourceId, TimedCommand};
use crate::node::NodeId;

/// A command accepted for a remote destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EgressItem {
    pub source: SourceId,
    pub destination: NodeId,
    pub command: TimedCommand,
    /// Sum of link latencies to the destination at acceptance time.
    pub path_latency: u64,
}

/// Why an item was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EgressReject {
    /// Source quota or queue capacity exhausted.
    Full,
    /// The port's receiving side is gone.
    Closed,
}

#[derive(Debug)]
struct Quotas {
    per_source: usize,
    used: Vec<AtomicUsize>,
}

impl Quotas {
    fn slot(&self, source: SourceId) -> &AtomicUsize {
        &self.used[usize::from(source.0) % self.used.len()]
    }
}

/// Producer side, held by the interconnect.
#[derive(Debug, Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressItem>,
    quotas: Arc<Quotas>,
}

/// Consumer side, held by the master port.
#[derive(Debug)]
pub struct EgressReceiver {
    rx: mpsc::Receiver<EgressItem>,
    quotas: Arc<Quotas>,
}

/// Create one egress queue of `depth` entries shared by `sources` sources.
pub fn egress_queue(depth: usize, sources: usize) -> (EgressSender, EgressReceiver) {
    let depth = depth.max(1);
    let sources = sources.max(1);
    let (tx, rx) = mpsc::channel(depth);
    let quotas = Arc::new(Quotas {
        per_source: (depth / sources).max(1),
        used: (0..sources).map(|_| AtomicUsize::new(0)).collect(),
    });
    (
        EgressSender {
            tx,
            quotas: quotas.clone(),
        },
        EgressReceiver { rx, quotas },
    )
}

impl EgressSender {
    pub fn try_push(&self, item: EgressItem) -> Result<(), EgressReject> {
        let slot = self.quotas.slot(item.source);
        if slot.fetch_add(1, Ordering::AcqRel) >= self.quotas.per_source {
            slot.fetch_sub(1, Ordering::AcqRel);
            return Err(EgressReject::Full);
        }
        self.tx.try_send(item).map_err(|e| {
            slot.fetch_sub(1, Ordering::AcqRel);
            match e {
                mpsc::error::TrySendError::Full(_) => EgressReject::Full,
                mpsc::error::TrySendError::Closed(_) => EgressReject::Closed,
            }
        })
    }

    /// Entries `source` currently holds.
    pub fn used_by(&self, source: SourceId) -> usize {
        self.quotas.slot(source).load(Ordering::Acquire)
    }
}

impl EgressReceiver {
    pub fn pop(&mut self) -> Option<EgressItem> {
        let item = self.rx.try_recv().ok()?;
        self.quotas.slot(item.source).fetch_sub(1, Ordering::AcqRel);
        Some(item)
    }
}
