/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! The master's view of every link in the tree.
//!
//! Master ports publish their own state directly; deeper links are known
//! from the `LinkStatus` reports satellites send upstream.  The interconnect
//! reads the board to decide whether a path is usable and how late a command
//! may be scheduled.

use std::collections::BTreeMap;

use parking_lot::RwLock;
use tracing::debug;

use crate::link::{LinkId, LinkStateKind};

/// Last known state of one link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReport {
    pub state: LinkStateKind,
    /// Calibrated one-way latency, only while synchronized.
    pub latency: Option<u64>,
}

impl LinkReport {
    pub const DOWN: LinkReport = LinkReport {
        state: LinkStateKind::Down,
        latency: None,
    };
}

#[derive(Debug, Default)]
pub struct LinkBoard {
    links: RwLock<BTreeMap<LinkId, LinkReport>>,
}

impl LinkBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, link: LinkId, report: LinkReport) {
        let prev = self.links.write().insert(link, report);
        if prev != Some(report) {
            debug!(link = %link, state = %report.state, latency = ?report.latency, "link board updated");
        }
    }

    pub fn get(&self, link: LinkId) -> LinkReport {
        self.links
            .read()
            .get(&link)
            .copied()
            .unwrap_or(LinkReport::DOWN)
    }

    /// Latency of a synchronized link, `None` otherwise.
    pub fn latency(&self, link: LinkId) -> Option<u64> {
        let report = self.get(link);
        match report.state {
            LinkStateKind::Synchronized => report.latency,
            _ => None,
        }
    }

    /// Mark `links` as down: a link above them was lost, so their last
    /// reports are stale.
    pub fn invalidate_below(&self, links: impl IntoIterator<Item = LinkId>) {
        let mut board = self.links.write();
        for link in links {
            board.insert(link, LinkReport::DOWN);
        }
    }

    pub fn all(&self) -> BTreeMap<LinkId, LinkReport> {
        self.links.read().clone()
    }
}
