// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Running an operation on a peer as a fresh dag and watching it.
//!
//! The peer answers with the generic id of the dag it created. The main task
//! records that id per peer, so a retried or restarted main task drives the
//! same peer dag instead of creating another one.

use serde_json::{Map, Value};
use tracing::warn;

use super::{SubDagAction, SubDagRequest};
use crate::agent::AgentAddr;
use crate::task::{Operator, TaskError, TaskRuntime};
use crate::view::DagDetail;

/// Consecutive transport failures a watcher tolerates before giving up.
pub const MAX_WATCH_TRANSPORT_ERRORS: u32 = 30;

/// An operation to run on `agent` as a standalone dag.
#[derive(Debug, Clone)]
pub struct RemoteDagRequest {
    pub agent: AgentAddr,
    pub action: SubDagAction,
    pub params: Map<String, Value>,
}

impl RemoteDagRequest {
    pub fn new(agent: AgentAddr, action: SubDagAction) -> Self {
        Self {
            agent,
            action,
            params: Map::new(),
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: Value) -> Self {
        self.params.insert(key.into(), value);
        self
    }
}

fn dag_id_key(action: SubDagAction) -> String {
    format!("{}_dag_id", action)
}

/// Run `request` on its peer as a dag of its own and wait for it.
///
/// A dag recorded by an earlier attempt is watched instead of creating
/// another one, and retried once more when it failed. Rolling back the
/// calling task does not undo the peer dag; a rollback that restores a peer,
/// such as relaunching an observer an earlier step stopped, runs the
/// restoring action through this same call.
pub async fn run_remote_dag(rt: &TaskRuntime, request: &RemoteDagRequest) -> Result<(), TaskError> {
    let agent = &request.agent;
    let recorded = rt
        .context()
        .await
        .agent_data::<String>(agent, &dag_id_key(request.action))
        .into_option();
    let dag = match recorded {
        Some(generic_id) => {
            let dag = watch_dag(rt, agent, &generic_id).await?;
            if dag.is_failed() {
                rt.log(format!("retrying peer dag {} on {}", generic_id, agent)).await;
                apply(rt, agent, &generic_id, Operator::Retry).await?;
                watch_dag(rt, agent, &generic_id).await?
            } else {
                dag
            }
        }
        None => create_and_watch(rt, agent, request.action, &request.params).await?,
    };
    if dag.is_failed() {
        return Err(TaskError::failed(format!("peer {}: {}", agent, dag.failure_message())));
    }
    Ok(())
}

/// Compensate a finished peer dag of `action` with a new dag of the inverse
/// action.
pub(crate) async fn run_inverse(
    rt: &TaskRuntime,
    agent: &AgentAddr,
    action: SubDagAction,
    params: &Map<String, Value>,
) -> Result<(), TaskError> {
    let inverse = action
        .inverse()
        .ok_or_else(|| TaskError::failed(format!("{} on {} cannot be undone", action, agent)))?;
    rt.log(format!("compensating {} on {} with {}", action, agent, inverse))
        .await;
    let dag = create_and_watch(rt, agent, inverse, params).await?;
    if dag.is_failed() {
        return Err(TaskError::failed(format!("peer {}: {}", agent, dag.failure_message())));
    }
    Ok(())
}

async fn create_and_watch(
    rt: &TaskRuntime,
    agent: &AgentAddr,
    action: SubDagAction,
    params: &Map<String, Value>,
) -> Result<DagDetail, TaskError> {
    let request = SubDagRequest {
        main_dag_id: rt.dag().generic_id.clone(),
        main_agent: rt.agent().clone(),
        expected_stage: None,
        main_max_stage: rt.dag().max_stage,
        params: params.clone(),
    };
    let client = rt.env().peer.clone();
    let response = rt
        .with_retry(&format!("create {} dag on {}", action, agent), || {
            client.create_sub_dag(agent, action, &request)
        })
        .await?;
    rt.context()
        .await
        .set_agent_data(agent, &dag_id_key(action), &response.generic_id)?;
    rt.log(format!("created {} dag {} on {}", action, response.generic_id, agent))
        .await;
    watch_dag(rt, agent, &response.generic_id).await
}

/// Poll a peer dag until it is terminal.
///
/// Gives up after [`MAX_WATCH_TRANSPORT_ERRORS`] consecutive transport
/// failures or once the poll budget is spent.
pub(crate) async fn watch_dag(rt: &TaskRuntime, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail, TaskError> {
    let client = rt.env().peer.clone();
    let policy = rt.env().poll;
    let mut transport_errors = 0;
    for _ in 0..policy.max_attempts {
        rt.check()?;
        match client.get_dag(agent, generic_id).await {
            Ok(dag) if dag.is_terminal() => return Ok(dag),
            Ok(_) => transport_errors = 0,
            Err(e) if e.is_transient() => {
                transport_errors += 1;
                if transport_errors >= MAX_WATCH_TRANSPORT_ERRORS {
                    return Err(TaskError::failed(format!(
                        "lost contact with {} after {} attempts: {}",
                        agent, transport_errors, e
                    )));
                }
                warn!(%agent, dag_id = generic_id, transport_errors, error = %e, "Peer unreachable while watching dag");
            }
            Err(e) => return Err(e.into()),
        }
        rt.sleep(policy.interval).await?;
    }
    Err(TaskError::Timeout {
        what: format!("dag {} on {}", generic_id, agent),
        attempts: policy.max_attempts,
    })
}

/// Fetch a peer dag under the retry budget.
pub(crate) async fn fetch_dag(rt: &TaskRuntime, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail, TaskError> {
    let client = rt.env().peer.clone();
    rt.with_retry(&format!("fetch dag {} from {}", generic_id, agent), || {
        client.get_dag(agent, generic_id)
    })
    .await
}

/// Apply an operator to a peer dag under the retry budget.
pub(crate) async fn apply(
    rt: &TaskRuntime,
    agent: &AgentAddr,
    generic_id: &str,
    operator: Operator,
) -> Result<DagDetail, TaskError> {
    let client = rt.env().peer.clone();
    rt.with_retry(&format!("{} dag {} on {}", operator, generic_id, agent), || {
        client.apply_operator(agent, generic_id, operator)
    })
    .await
}
