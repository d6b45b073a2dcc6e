// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orca Agent - Cluster Management Agent
//!
//! One agent runs on every host of a database cluster. It embeds
//! [`orca_core`] and adds what the engine leaves to its host:
//!
//! - [`config`]: environment-driven configuration
//! - [`observer`]: control of the local database process ([`observer::ObserverOps`])
//! - [`flows`]: concrete dags (cluster bootstrap, backup config, scale-in/out,
//!   take-over, rebuild, peer sub-dag actions)
//! - [`handlers`] and [`server`]: the JSON RPC peers and operators call
//! - [`runtime`]: wiring of store, coordinator, executor and server
//!
//! # RPC
//!
//! | Endpoint | Purpose |
//! |----------|---------|
//! | `/task/v1/...` | Inspect dags, nodes and subtasks; apply operators |
//! | `/ob/v1/rpc/{action}` | Peer asks for a sub-dag |
//! | `/observer/rpc` | Peer asks this agent to kill its observer |
//! | `/api/v1/...` | Agent status and flow entry points |

pub mod config;
pub mod error;
pub mod flows;
pub mod handlers;
pub mod observer;
pub mod runtime;
pub mod server;

pub use config::Config;
pub use error::{AgentError, ApiError};
pub use runtime::AgentRuntime;
