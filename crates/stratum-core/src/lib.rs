// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stratum Core - Partitioned Event-Sourced Workflow Engine
//!
//! Commands are appended to a per-partition log, processed one at a time by
//! a deterministic state machine and turned into events. Events update the
//! indexed partition state and are written back to the same log, so the
//! state of a partition can always be rebuilt from its latest snapshot and
//! the log that follows it.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                          NodeRuntime                              │
//! └───────────────────────────────────────────────────────────────────┘
//!        │ one actor per partition                    │
//!        ▼                                            ▼
//! ┌──────────────────────┐   subscription   ┌──────────────────────────┐
//! │ Partition            │◄────messages────►│ Partition                │
//! │  StreamProcessor     │   (by key hash)  │  (message subscriptions) │
//! │  PartitionState      │                  │                          │
//! └──────────────────────┘                  └──────────────────────────┘
//!        │                                            ▲
//!        ▼                                            │ log blocks,
//! ┌──────────────────────┐                  ┌──────────────────────────┐
//! │ PartitionLog (SQLite)│                  │ RestoreController        │
//! │ SnapshotStore (fs)   │──ReplicationServer──► (restoring replica)   │
//! └──────────────────────┘                  └──────────────────────────┘
//! ```
//!
//! # Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`record`] | Commands, events and rejections written to the log |
//! | [`state`] | Indexed partition state: processes, element instances, messages, subscriptions |
//! | [`processing`] | The per-record state machine |
//! | [`correlation`] | Routing subscription messages between partitions |
//! | [`partition`] | The actor owning a partition's log and state |
//! | [`persistence`] | Log stores and chunked snapshots |
//! | [`replication`] | Restore decision, log/snapshot transfer, restore controller |
//! | [`runtime`] | Embeddable node runtime |
//!
//! # Configuration
//!
//! See [`config::Config::from_env`] for the environment variables read by
//! the `stratum-node` binary.

pub mod config;
pub mod correlation;
pub mod error;
pub mod partition;
pub mod persistence;
pub mod processing;
pub mod record;
pub mod replication;
pub mod runtime;
pub mod state;
