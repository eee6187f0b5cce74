/*
SPDX-FileCopyrightText: Copyright 2026 LG Electronics Inc.
SPDX-License-Identifier: MIT
*/

//! DRTIO fabric – distributed real-time I/O over a tree of nodes
//!
//! A master distributes its timestamp counter to satellites over
//! point-to-point links, routes timed commands to the node owning each
//! channel, and runs a reliable auxiliary channel for control traffic.
//!
//! ```text
//! lib.rs
//! ├── tsc          – timestamp counter, global timestamps
//! ├── siphaser     – clock phase aligner
//! ├── link/        – link state machine, transceivers, link board
//! ├── aux/         – auxiliary control channel (prost wire format)
//! ├── channel      – channel drivers, per-node timed FIFOs
//! ├── cri/         – command interconnect, egress queues, DMA playback
//! ├── routing/     – routing tables, snapshots, update staging
//! ├── node/        – master, satellites, downstream ports, topology
//! ├── admin        – operator interface
//! ├── events       – asynchronous fabric events
//! ├── config/      – YAML topology configuration
//! ├── fabric       – the whole simulated fabric, tick by tick
//! ├── runtime      – tokio driver and async admin handle
//! └── error        – error taxonomy
//! ```

pub mod admin;
pub mod aux;
pub mod channel;
pub mod config;
pub mod cri;
pub mod error;
pub mod events;
pub mod fabric;
pub mod link;
pub mod node;
pub mod routing;
pub mod runtime;
pub mod siphaser;
pub mod tsc;
