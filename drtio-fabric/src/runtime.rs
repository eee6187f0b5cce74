/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! Running a [`Fabric`] on tokio.
//!
//! ```text
//!   RuntimeHandle ──Request──► tick task ──FabricEvent──► relay task ──► caller
//!        ▲          (bounded)   │  interval → Fabric::tick    │ resolves echo
//!        └────── oneshot reply ─┘                             │ waiters
//! ```
//!
//! The tick task owns the fabric; admin calls are served between two ticks.
//! Command sources do not go through the task: they submit straight into the
//! shared [`Interconnect`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::admin::{Admin, ErrorCounters};
use crate::cri::{Interconnect, SourceHandle, SourceId};
use crate::error::{DrtioError, RoutingError};
use crate::events::FabricEvent;
use crate::fabric::Fabric;
use crate::link::{LinkId, LinkReport};
use crate::node::NodeId;
use crate::routing::RoutingTable;

const REQUEST_DEPTH: usize = 32;

/// nonce → waiter; `None` means the master gave up on the echo.
type EchoWaiters = Arc<Mutex<HashMap<u64, oneshot::Sender<Option<u64>>>>>;

enum Request {
    RoutingTable {
        node: NodeId,
        reply: oneshot::Sender<Option<RoutingTable>>,
    },
    InstallRouting {
        node: NodeId,
        table: RoutingTable,
        reply: oneshot::Sender<Result<Vec<NodeId>, RoutingError>>,
    },
    LinkStatus {
        reply: oneshot::Sender<BTreeMap<LinkId, LinkReport>>,
    },
    ErrorCounters {
        reply: oneshot::Sender<ErrorCounters>,
    },
    Synchronized {
        reply: oneshot::Sender<bool>,
    },
    Ping {
        node: NodeId,
        reply: oneshot::Sender<Result<(u64, oneshot::Receiver<Option<u64>>), DrtioError>>,
    },
    Shutdown,
}

// ── FabricRuntime ─────────────────────────────────────────────────────────────

/// A fabric ticking in the background.
pub struct FabricRuntime {
    handle: RuntimeHandle,
    ticker: JoinHandle<Fabric>,
    relay: JoinHandle<()>,
}

impl FabricRuntime {
    /// Spawn the tick task and the event relay.  `events` is the receiver
    /// returned by [`Fabric::new`]; the returned receiver carries the same
    /// events on to the caller.
    pub fn start(
        fabric: Fabric,
        events: mpsc::UnboundedReceiver<FabricEvent>,
        tick: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<FabricEvent>) {
        let (req_tx, req_rx) = mpsc::channel(REQUEST_DEPTH);
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let waiters: EchoWaiters = Arc::new(Mutex::new(HashMap::new()));
        let interconnect = fabric.interconnect().clone();

        let tick = tick.max(Duration::from_micros(1));
        info!(tick_us = tick.as_micros() as u64, "fabric runtime starting");
        let ticker = tokio::spawn(tick_loop(fabric, req_rx, waiters.clone(), tick));
        let relay = tokio::spawn(relay(events, out_tx, waiters.clone()));

        let handle = RuntimeHandle {
            requests: req_tx,
            interconnect,
            waiters,
        };
        (
            Self {
                handle,
                ticker,
                relay,
            },
            out_rx,
        )
    }

    pub fn handle(&self) -> RuntimeHandle {
        self.handle.clone()
    }

    /// Stop ticking and get the fabric back.
    pub async fn shutdown(self) -> Result<Fabric> {
        // A closed request channel also stops the loop.
        let _ = self.handle.requests.send(Request::Shutdown).await;
        let fabric = self.ticker.await.context("tick task failed")?;
        self.relay.abort();
        info!(now = fabric.now(), "fabric runtime stopped");
        Ok(fabric)
    }
}

async fn tick_loop(
    mut fabric: Fabric,
    mut requests: mpsc::Receiver<Request>,
    waiters: EchoWaiters,
    tick: Duration,
) -> Fabric {
    let mut interval = time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Burst);
    loop {
        tokio::select! {
            _ = interval.tick() => fabric.tick(),
            request = requests.recv() => match request {
                Some(Request::Shutdown) | None => break,
                Some(request) => serve(&mut fabric, request, &waiters),
            },
        }
    }
    fabric
}

fn serve(fabric: &mut Fabric, request: Request, waiters: &EchoWaiters) {
    // Replies to callers that gave up are dropped.
    match request {
        Request::RoutingTable { node, reply } => {
            let _ = reply.send(fabric.master().routing_table(node));
        }
        Request::InstallRouting { node, table, reply } => {
            let _ = reply.send(fabric.master_mut().install_routing(node, table));
        }
        Request::LinkStatus { reply } => {
            let _ = reply.send(fabric.master().link_status());
        }
        Request::ErrorCounters { reply } => {
            let _ = reply.send(fabric.master().error_counters());
        }
        Request::Synchronized { reply } => {
            let _ = reply.send(fabric.is_synchronized());
        }
        Request::Ping { node, reply } => {
            // The lock spans the ping so the relay cannot see the reply first.
            let mut pending = waiters.lock();
            let result = fabric.master_mut().ping(node).map(|nonce| {
                let (tx, rx) = oneshot::channel();
                pending.insert(nonce, tx);
                (nonce, rx)
            });
            drop(pending);
            let _ = reply.send(result);
        }
        Request::Shutdown => {}
    }
}

async fn relay(
    mut events: mpsc::UnboundedReceiver<FabricEvent>,
    out: mpsc::UnboundedSender<FabricEvent>,
    waiters: EchoWaiters,
) {
    while let Some(event) = events.recv().await {
        let answer = match &event {
            FabricEvent::EchoReply { nonce, rtt, .. } => Some((*nonce, Some(*rtt))),
            FabricEvent::EchoTimeout { nonce, .. } => Some((*nonce, None)),
            _ => None,
        };
        if let Some((nonce, rtt)) = answer {
            if let Some(waiter) = waiters.lock().remove(&nonce) {
                let _ = waiter.send(rtt);
            }
        }
        let _ = out.send(event);
    }
    debug!("event stream closed");
}

// ── RuntimeHandle ─────────────────────────────────────────────────────────────

/// Async access to a running fabric.  Cheap to clone.
#[derive(Clone)]
pub struct RuntimeHandle {
    requests: mpsc::Sender<Request>,
    interconnect: Arc<Interconnect>,
    waiters: EchoWaiters,
}

impl RuntimeHandle {
    /// Master time.
    pub fn now(&self) -> u64 {
        self.interconnect.now()
    }

    pub fn source(&self, id: SourceId) -> SourceHandle {
        self.interconnect.source(id)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.requests
            .send(make(tx))
            .await
            .map_err(|_| anyhow!("fabric runtime is not running"))?;
        rx.await.context("fabric runtime dropped the request")
    }

    pub async fn routing_table(&self, node: NodeId) -> Result<Option<RoutingTable>> {
        self.call(|reply| Request::RoutingTable { node, reply }).await
    }

    pub async fn install_routing(&self, node: NodeId, table: RoutingTable) -> Result<Vec<NodeId>> {
        let affected = self
            .call(|reply| Request::InstallRouting { node, table, reply })
            .await??;
        Ok(affected)
    }

    pub async fn link_status(&self) -> Result<BTreeMap<LinkId, LinkReport>> {
        self.call(|reply| Request::LinkStatus { reply }).await
    }

    pub async fn error_counters(&self) -> Result<ErrorCounters> {
        self.call(|reply| Request::ErrorCounters { reply }).await
    }

    pub async fn is_synchronized(&self) -> Result<bool> {
        self.call(|reply| Request::Synchronized { reply }).await
    }

    /// Poll until every link is synchronized or `timeout` passes.
    pub async fn wait_synchronized(&self, timeout: Duration) -> Result<()> {
        time::timeout(timeout, async {
            while !self.is_synchronized().await? {
                time::sleep(Duration::from_millis(1)).await;
            }
            Ok::<_, anyhow::Error>(())
        })
        .await
        .context("fabric did not synchronize in time")?
    }

    /// Echo round trip to `node`, in ticks.
    pub async fn ping(&self, node: NodeId, timeout: Duration) -> Result<u64> {
        let (nonce, reply) = self.call(|reply| Request::Ping { node, reply }).await??;
        match time::timeout(timeout, reply).await {
            Ok(rtt) => rtt
                .context("echo waiter dropped")?
                .ok_or_else(|| anyhow!("{node} did not answer echo {nonce}")),
            Err(_) => {
                self.waiters.lock().remove(&nonce);
                warn!(%node, nonce, "✗ echo timed out");
                Err(anyhow!("no echo reply from {node} within {timeout:?}"))
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelDriver, ChannelId};
    use crate::config::TopologyConfig;
    use crate::cri::TimedCommand;
    use crate::link::LinkStateKind;
    use crate::routing::NextHop;

    const SECOND: Duration = Duration::from_secs(1);

    fn start() -> (FabricRuntime, mpsc::UnboundedReceiver<FabricEvent>) {
        let (fabric, events) = Fabric::new(&TopologyConfig::default_config()).unwrap();
        FabricRuntime::start(fabric, events, Duration::from_micros(50))
    }

    #[tokio::test]
    async fn admin_calls_reach_the_running_fabric() {
        let (rt, mut events) = start();
        let h = rt.handle();
        h.wait_synchronized(5 * SECOND).await.unwrap();

        let status = h.link_status().await.unwrap();
        let top = status[&LinkId::new(NodeId(0), 0)];
        assert_eq!(top.state, LinkStateKind::Synchronized);
        assert_eq!(top.latency, Some(5));

        let rtt = h.ping(NodeId(1), 5 * SECOND).await.unwrap();
        assert!(rtt >= 10, "rtt {rtt}");
        assert_eq!(h.ping(NodeId(0), SECOND).await.unwrap(), 0);
        assert!(h.ping(NodeId(42), SECOND).await.is_err());

        let mut table = RoutingTable::new();
        table.set(NodeId(42), NextHop::Port(0));
        assert!(h.install_routing(NodeId::MASTER, table).await.is_err());
        let table = h.routing_table(NodeId::MASTER).await.unwrap().unwrap();
        assert_eq!(table.get(NodeId(1)), NextHop::Port(0));
        assert!(h.error_counters().await.unwrap().alarms.is_empty());

        let mut seen_sync = false;
        while let Ok(event) = events.try_recv() {
            seen_sync |= matches!(
                event,
                FabricEvent::LinkStateChanged {
                    state: LinkStateKind::Synchronized,
                    ..
                }
            );
        }
        assert!(seen_sync);
        rt.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn sources_submit_while_the_fabric_ticks() {
        let (rt, _events) = start();
        let h = rt.handle();
        h.wait_synchronized(5 * SECOND).await.unwrap();

        let at = h.now() + 100;
        let cpu = h.source(SourceId::CPU);
        let submitted = std::thread::spawn(move || cpu.submit(TimedCommand::write(ChannelId(7), at, 3)))
            .join()
            .unwrap();
        assert!(submitted.is_ok());

        time::timeout(5 * SECOND, async {
            while h.now() <= at {
                time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();

        let fabric = rt.shutdown().await.unwrap();
        assert!(fabric.now() > at);
        assert!(h.link_status().await.is_err());
        let latches = fabric.latches(NodeId(1)).unwrap();
        assert_eq!(latches.read_latched(ChannelId(7)), Some(3));
        let history = latches.history_of(ChannelId(7));
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].at.coarse(), at);
    }
}
