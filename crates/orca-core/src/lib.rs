// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orca Core - Distributed Orchestration Engine
//!
//! This crate is the engine every orca agent embeds. It persists workflows as
//! dags of nodes of subtasks, drives them one node per tick, serialises
//! long-running work behind maintenance locks in a shared store, and lets a
//! main dag on one agent coordinate sub-dags on its peers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         External Caller                                  │
//! │                  (operator tooling, peer agents)                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │ JSON over HTTP
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          orca-agent                                      │
//! │             (RPC server, flows, configuration, main)                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ TaskService                                  │ Coordinator
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │  Driver + Runner      │◄───────────────────│  Identity, heartbeat,       │
//! │  (this crate)         │  maintainer flag   │  maintainer election        │
//! └───────────────────────┘                    └─────────────────────────────┘
//!           │
//!           ▼
//! ┌───────────────────────┐
//! │   Shared store        │
//! │   (SQLite via sqlx)   │
//! └───────────────────────┘
//! ```
//!
//! # State Machine
//!
//! Dags, nodes and subtasks share one state machine. The operator records
//! why the last transition happened.
//!
//! ```text
//!   PENDING ──► READY ──► RUNNING ──┬──► SUCCEED
//!                 ▲                 │
//!                 │ RETRY/ROLLBACK  ▼
//!                 └────────────── FAILED
//! ```
//!
//! | Operator | Effect |
//! |----------|--------|
//! | `RUN` | Forward execution |
//! | `RETRY` | Re-run failed subtasks of the current node |
//! | `ROLLBACK` | Walk back over executed nodes running compensations |
//! | `CANCEL` | Cooperatively stop the current node; the dag ends FAILED |
//! | `PASS` | Mark failed subtasks SUCCEED without running them |
//!
//! # Maintenance Locks
//!
//! A dag tagged with a locking [`Maintainer`] is inserted together with its
//! lock in one transaction. Cluster dags lock in the cluster namespace, local
//! dags in their owning agent's namespace. A conflicting insert fails with
//! [`CoreError::MaintenanceConflict`] quoting the holder's generic id.
//!
//! # Modules
//!
//! - [`context`]: Params, data and per-agent data carried between subtasks
//! - [`template`]: Fluent dag assembly with maintenance scope composition
//! - [`persistence`]: Store trait and the SQLite backend
//! - [`service`]: Dag creation, lookup and operator application
//! - [`executor`]: The per-agent driver and the bounded subtask runner
//! - [`coordinator`]: Agent identity, heartbeat and maintainer election
//! - [`remote`]: Peer client and the sub-dag protocol tasks

pub mod agent;
pub mod context;
pub mod coordinator;
pub mod env;
pub mod error;
pub mod executor;
pub mod generic_id;
pub mod maintenance;
pub mod migrations;
pub mod model;
pub mod persistence;
pub mod remote;
pub mod service;
pub mod task;
pub mod template;
pub mod view;

pub use agent::AgentAddr;
pub use context::TaskContext;
pub use coordinator::{AgentIdentity, Coordinator, CoordinatorConfig, IdentityManager, ReconcileHooks};
pub use env::{AgentEnv, PollPolicy};
pub use error::{CoreError, Result};
pub use executor::{ExecutorConfig, ExecutorHandle};
pub use maintenance::{MaintenanceType, Maintainer};
pub use model::{Dag, Node, NodeType, SubTask};
pub use persistence::{Persistence, SqlitePersistence};
pub use remote::{HttpPeerClient, PeerClient, RetryBudget, SubDagAction};
pub use service::{EntityKind, TaskService};
pub use task::{Capabilities, Operator, TaskBody, TaskError, TaskRegistry, TaskRuntime, TaskState};
pub use template::{NodeTemplate, TaskTemplate, Template, TemplateBuilder};
pub use view::{AgentStatus, DagDetail, NodeDetail, TaskDetail};
