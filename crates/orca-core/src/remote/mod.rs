// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Peer-to-peer calls and the remote sub-DAG protocol.
//!
//! [`PeerClient`] is the seam between task bodies and the network. The
//! production implementation is [`HttpPeerClient`]; tests route calls to
//! in-process agents instead.

mod executable;
mod http;
mod retry;
mod subdag;

pub use executable::{MAX_WATCH_TRANSPORT_ERRORS, RemoteDagRequest, run_remote_dag};
pub use http::HttpPeerClient;
pub use retry::RetryBudget;
pub use subdag::{
    CHECK_DAG_STAGE, CHECK_SUB_DAG_READY, CREATE_SUB_DAG, EXPECTED_STAGE, MAIN_AGENT, MAIN_DAG_ID, PASS_SUB_DAG,
    RETRY_SUB_DAG, SubDagSpec, WAIT_PASS_OPERATOR, WAIT_POINT_STAGE, WAIT_SUB_DAG_FINISH, accept_sub_dag,
    register_protocol_tasks, sub_dag_name, sub_dag_template, sub_dag_wrapper,
};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::agent::AgentAddr;
use crate::error::{CoreError, Result};
use crate::task::Operator;
use crate::view::{AgentStatus, DagDetail};

/// Calls one agent makes on another.
#[async_trait]
pub trait PeerClient: Send + Sync {
    /// `GET /task/v1/dag/{generic_id}`
    async fn get_dag(&self, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail>;

    /// `POST /task/v1/dag/{generic_id}`
    async fn apply_operator(&self, agent: &AgentAddr, generic_id: &str, operator: Operator) -> Result<DagDetail>;

    /// `GET /task/v1/dag/maintain/agent`: the peer's own last dag still
    /// holding a lock.
    async fn last_maintenance_dag(&self, agent: &AgentAddr) -> Result<Option<DagDetail>>;

    /// `POST /ob/v1/rpc/{action}`
    async fn create_sub_dag(
        &self,
        agent: &AgentAddr,
        action: SubDagAction,
        request: &SubDagRequest,
    ) -> Result<SubDagResponse>;

    /// `DELETE /observer/rpc`
    async fn kill_observer(&self, agent: &AgentAddr, force: bool) -> Result<()>;

    /// `GET /api/v1/status`
    async fn status(&self, agent: &AgentAddr) -> Result<AgentStatus>;
}

/// Operation a main dag asks a peer to run as a sub-DAG.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubDagAction {
    Stop,
    Start,
    Deploy,
    Destroy,
    ScaleOut,
}

impl SubDagAction {
    pub const ALL: [SubDagAction; 5] = [
        Self::Stop,
        Self::Start,
        Self::Deploy,
        Self::Destroy,
        Self::ScaleOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Start => "start",
            Self::Deploy => "deploy",
            Self::Destroy => "destroy",
            Self::ScaleOut => "scale_out",
        }
    }

    /// Action undoing a finished `self`.
    pub fn inverse(self) -> Option<SubDagAction> {
        match self {
            Self::Stop => Some(Self::Start),
            Self::Start => Some(Self::Stop),
            Self::Deploy | Self::ScaleOut => Some(Self::Destroy),
            Self::Destroy => None,
        }
    }
}

impl fmt::Display for SubDagAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SubDagAction {
    type Err = CoreError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "action".to_string(),
                message: format!("unknown sub-dag action '{}'", s),
            })
    }
}

/// Body of `POST /ob/v1/rpc/{action}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagRequest {
    pub main_dag_id: String,
    pub main_agent: AgentAddr,
    /// Stage of the main dag at which the sub-DAG hands control back.
    /// `None` asks for a standalone dag without the hand-shake.
    #[serde(default)]
    pub expected_stage: Option<i32>,
    pub main_max_stage: i32,
    /// Action parameters, copied into the sub-DAG's params.
    #[serde(default)]
    pub params: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagResponse {
    pub generic_id: String,
    /// Peer-side stage at which the sub-DAG waits for the main dag.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stage: Option<i32>,
}

/// Body of `POST /task/v1/dag/{generic_id}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorRequest {
    pub operator: Operator,
}

/// Body of `DELETE /observer/rpc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct KillObserverRequest {
    #[serde(default)]
    pub force_kill: bool,
}

/// Error body every endpoint answers with on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

impl From<&CoreError> for ErrorBody {
    fn from(err: &CoreError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
        }
    }
}
