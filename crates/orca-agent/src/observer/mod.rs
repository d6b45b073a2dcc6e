// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observer control.
//!
//! The observer is the database process an agent manages. Flows never talk
//! to it directly; they go through [`ObserverOps`], so task bodies stay
//! deterministic under test.

mod fake;
mod script;

pub use fake::FakeObserverOps;
pub use script::ScriptObserverOps;

use std::fmt;

use async_trait::async_trait;
use orca_core::{AgentAddr, TaskError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors from observer operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ObserverError {
    /// The operation ran and reported a failure.
    #[error("{op} failed: {details}")]
    Failed {
        /// Operation name.
        op: String,
        /// What went wrong.
        details: String,
    },

    /// Control script exited with non-zero code.
    #[error("{op} exited with code {exit_code}: {stderr}")]
    ExitCode {
        /// Operation name.
        op: String,
        /// Exit code from the script.
        exit_code: i32,
        /// Standard error output.
        stderr: String,
    },

    /// Control script did not finish in time.
    #[error("{op} timed out")]
    Timeout {
        /// Operation name.
        op: String,
    },

    /// Script output could not be understood.
    #[error("unexpected output from {op}: {output}")]
    Output {
        /// Operation name.
        op: String,
        /// The raw output.
        output: String,
    },

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for observer operations.
pub type Result<T> = std::result::Result<T, ObserverError>;

impl From<ObserverError> for TaskError {
    fn from(err: ObserverError) -> Self {
        TaskError::failed(err.to_string())
    }
}

/// A user tenant of the managed database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tenant {
    pub id: i64,
    pub name: String,
}

/// Scripts run once while a new cluster is bootstrapped, in this order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BootstrapScript {
    MigrateTable,
    ModifyPassword,
    MigrateData,
    ImportScript,
}

impl BootstrapScript {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MigrateTable => "migrate_table",
            Self::ModifyPassword => "modify_password",
            Self::MigrateData => "migrate_data",
            Self::ImportScript => "import_script",
        }
    }
}

impl fmt::Display for BootstrapScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations on the local observer and on the cluster it belongs to.
///
/// Implementations are pure executors: they never touch the shared store.
/// Every mutating call must be idempotent, since task bodies re-run it
/// after a retry or a restart.
#[async_trait]
pub trait ObserverOps: Send + Sync {
    /// Implementation identifier (e.g., "script", "fake")
    fn kind(&self) -> &'static str;

    /// Install the observer package at `version`.
    async fn deploy(&self, version: &str) -> Result<()>;

    /// Remove the installed package and its data.
    async fn destroy(&self) -> Result<()>;

    async fn start_observer(&self) -> Result<()>;

    async fn stop_observer(&self) -> Result<()>;

    /// Kill the observer process. Without `force` the observer is asked to
    /// exit on its own.
    async fn kill_observer(&self, force: bool) -> Result<()>;

    async fn is_observer_alive(&self) -> Result<bool>;

    /// Bootstrap a new cluster over `servers`.
    async fn bootstrap(&self, servers: &[AgentAddr]) -> Result<()>;

    async fn run_script(&self, script: BootstrapScript) -> Result<()>;

    async fn cluster_id(&self) -> Result<i64>;

    async fn list_user_tenants(&self) -> Result<Vec<Tenant>>;

    /// Check that a backup destination is reachable and writable.
    async fn check_path(&self, uri: &str) -> Result<()>;

    async fn tenant_config(&self, tenant: &Tenant, key: &str) -> Result<Option<String>>;

    async fn set_tenant_config(&self, tenant: &Tenant, key: &str, value: &str) -> Result<()>;

    /// Agents whose observers are registered in the cluster.
    async fn list_servers(&self) -> Result<Vec<AgentAddr>>;

    async fn add_server(&self, server: &AgentAddr) -> Result<()>;

    /// Start removing `server` from the cluster. Completion is asynchronous;
    /// see [`is_server_deleted`](Self::is_server_deleted).
    async fn delete_server(&self, server: &AgentAddr) -> Result<()>;

    async fn is_server_deleted(&self, server: &AgentAddr) -> Result<bool>;

    /// Whether the consensus group keeps a majority once `without` is gone.
    async fn is_quorum_alive(&self, without: &AgentAddr) -> Result<bool>;
}
