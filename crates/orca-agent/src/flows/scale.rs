// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Removing an agent from a running cluster and adding one to it.

use std::sync::Arc;

use async_trait::async_trait;
use orca_core::error::{CoreError, Result};
use orca_core::remote::{RemoteDagRequest, SubDagSpec, run_remote_dag, sub_dag_wrapper};
use orca_core::{
    AgentAddr, AgentEnv, AgentIdentity, Maintainer, NodeTemplate, SubDagAction, TaskBody, TaskError, TaskRegistry,
    TaskRuntime, Template, TemplateBuilder,
};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::{data_of, register_with_ops, task};
use crate::observer::ObserverOps;

pub const DELETE_OBSERVER: &str = "DeleteObserverTask";
pub const SET_AGENT_IDENTITY: &str = "SetAgentIdentityTask";
pub const CHECK_MULTI_PAXOS_ALIVE: &str = "CheckMultiPaxosAliveTask";
pub const INFORM_KILL_OBSERVER: &str = "InformKillObserverTask";
pub const WAIT_DELETE_COMPLETE: &str = "WaitDeleteCompleteTask";
pub const DELETE_AGENT: &str = "DeleteAgentTask";
pub const ADD_SERVER: &str = "AddServerTask";

pub(super) fn register(registry: &mut TaskRegistry, ops: &Arc<dyn ObserverOps>) {
    register_with_ops(registry, ops, DELETE_OBSERVER, |ops| DeleteObserverTask { ops });
    register_with_ops(registry, ops, CHECK_MULTI_PAXOS_ALIVE, |ops| CheckMultiPaxosAliveTask { ops });
    register_with_ops(registry, ops, WAIT_DELETE_COMPLETE, |ops| WaitDeleteCompleteTask { ops });
    register_with_ops(registry, ops, ADD_SERVER, |ops| AddServerTask { ops });
    registry
        .register(SET_AGENT_IDENTITY, super::capabilities(SET_AGENT_IDENTITY), || SetAgentIdentityTask)
        .register(INFORM_KILL_OBSERVER, super::capabilities(INFORM_KILL_OBSERVER), || InformKillObserverTask)
        .register(DELETE_AGENT, super::capabilities(DELETE_AGENT), || DeleteAgentTask);
}

/// Body of `POST /api/v1/agent/scale_in`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleInRequest {
    pub agent: AgentAddr,
    /// Fail the dag when the departing agent cannot be told to kill its
    /// observer.
    #[serde(default)]
    pub force_kill: bool,
}

/// Body of `POST /api/v1/agent/scale_out`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleOutRequest {
    pub agent: AgentAddr,
}

/// The agent a scale step acts on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScaleTarget {
    pub agent: AgentAddr,
    #[serde(default)]
    pub force_kill: bool,
}

/// Identity to give an agent, and the one to give back on rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityChange {
    pub agent: AgentAddr,
    pub identity: AgentIdentity,
    #[serde(default)]
    pub restore: Option<AgentIdentity>,
}

fn node(struct_name: &str, name: String, data: &impl Serialize) -> Result<NodeTemplate> {
    Ok(NodeTemplate::normal(
        task(struct_name, name).with_additional_data(serde_json::to_value(data)?),
    ))
}

fn identity_node(agent: &AgentAddr, identity: AgentIdentity, restore: Option<AgentIdentity>) -> Result<NodeTemplate> {
    let change = IdentityChange {
        agent: agent.clone(),
        identity,
        restore,
    };
    node(SET_AGENT_IDENTITY, format!("set {} {}", agent, identity), &change)
}

/// The target must be a registered peer of `env`'s agent.
async fn check_target(env: &AgentEnv, agent: &AgentAddr) -> Result<AgentIdentity> {
    if *agent == env.agent {
        return Err(CoreError::Validation {
            field: "agent".to_string(),
            message: format!("{} cannot scale itself", agent),
        });
    }
    env.identity.stored(agent).await
}

/// Template removing `request.agent` from the cluster.
pub async fn scale_in(env: &AgentEnv, request: &ScaleInRequest) -> Result<Template> {
    let identity = check_target(env, &request.agent).await?;
    if identity != AgentIdentity::ClusterAgent && identity != AgentIdentity::ScalingIn {
        return Err(CoreError::invalid_state(
            &request.agent,
            format!("only a cluster agent can be scaled in, it is {}", identity),
        ));
    }
    let x = &request.agent;
    let target = ScaleTarget {
        agent: x.clone(),
        force_kill: request.force_kill,
    };
    TemplateBuilder::new(format!("Scale in {}", x))
        .add_node(node(DELETE_OBSERVER, format!("delete observer {}", x), &target)?)
        .add_node(identity_node(x, AgentIdentity::ScalingIn, Some(AgentIdentity::ClusterAgent))?)
        .add_node(node(CHECK_MULTI_PAXOS_ALIVE, format!("check quorum without {}", x), &target)?)
        .add_node(node(INFORM_KILL_OBSERVER, format!("inform {} to kill observer", x), &target)?)
        .add_node(node(WAIT_DELETE_COMPLETE, format!("wait for {} to leave", x), &target)?)
        .add_node(node(DELETE_AGENT, format!("delete agent {}", x), &target)?)
        .maintenance(Maintainer::global())
        .build()
}

/// Template deploying and starting an observer on `request.agent` and
/// adding it to the cluster.
///
/// The peer runs deploy and start as two sub-dags, each held at a
/// hand-shake point until this dag releases it.
pub async fn scale_out(env: &AgentEnv, request: &ScaleOutRequest) -> Result<Template> {
    let identity = check_target(env, &request.agent).await?;
    if identity != AgentIdentity::Single && identity != AgentIdentity::ScalingOut {
        return Err(CoreError::invalid_state(
            &request.agent,
            format!("only a single agent can be scaled out, it is {}", identity),
        ));
    }
    let x = &request.agent;
    let target = ScaleTarget {
        agent: x.clone(),
        force_kill: false,
    };
    let add_server = node(ADD_SERVER, format!("add server {}", x), &target)?;
    TemplateBuilder::new(format!("Scale out {}", x))
        .add_node(identity_node(x, AgentIdentity::ScalingOut, Some(AgentIdentity::Single))?)
        .add_template(sub_dag_wrapper(
            &SubDagSpec::new(SubDagAction::Deploy, vec![x.clone()]),
            vec![],
        )?)
        .add_template(sub_dag_wrapper(
            &SubDagSpec::new(SubDagAction::Start, vec![x.clone()]),
            vec![add_server],
        )?)
        .add_node(identity_node(x, AgentIdentity::ClusterAgent, None)?)
        .maintenance(Maintainer::global())
        .build()
}

/// Asks the cluster to drop the target's server.
pub struct DeleteObserverTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for DeleteObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        rt.log(format!("deleting server {}", target.agent)).await;
        self.ops.delete_server(&target.agent).await?;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        rt.log(format!("adding server {} back", target.agent)).await;
        self.ops.add_server(&target.agent).await?;
        Ok(())
    }
}

pub struct SetAgentIdentityTask;

#[async_trait]
impl TaskBody for SetAgentIdentityTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let change: IdentityChange = data_of(rt)?;
        rt.env().identity.set_identity(&change.agent, change.identity).await?;
        rt.log(format!("{} is now {}", change.agent, change.identity)).await;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let change: IdentityChange = data_of(rt)?;
        if let Some(restore) = change.restore {
            rt.env().identity.set_identity(&change.agent, restore).await?;
            rt.log(format!("{} is {} again", change.agent, restore)).await;
        }
        Ok(())
    }
}

/// Refuses to go on when the consensus group would lose its majority.
pub struct CheckMultiPaxosAliveTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for CheckMultiPaxosAliveTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        if !self.ops.is_quorum_alive(&target.agent).await? {
            return Err(TaskError::failed(format!("quorum is lost without {}", target.agent)));
        }
        rt.log(format!("quorum survives without {}", target.agent)).await;
        Ok(())
    }
}

/// Tells the departing agent to kill its observer.
///
/// Without `force_kill` an unreachable agent is logged and tolerated.
/// Rolling back relaunches the observer through a start dag on the agent.
pub struct InformKillObserverTask;

#[async_trait]
impl TaskBody for InformKillObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        let agent = &target.agent;
        let client = rt.env().peer.clone();
        let outcome = rt
            .with_retry(&format!("inform {} to kill observer", agent), || {
                client.kill_observer(agent, target.force_kill)
            })
            .await;
        match outcome {
            Ok(()) => {
                rt.log(format!("{} killed its observer", agent)).await;
                Ok(())
            }
            Err(TaskError::Cancelled) => Err(TaskError::Cancelled),
            Err(e) if !target.force_kill => {
                warn!(%agent, error = %e, "Could not inform agent to kill observer");
                rt.log(format!("ignoring failed kill on {}: {}", agent, e)).await;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        rt.log(format!("relaunching observer on {}", target.agent)).await;
        run_remote_dag(rt, &RemoteDagRequest::new(target.agent, SubDagAction::Start)).await
    }
}

pub struct WaitDeleteCompleteTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for WaitDeleteCompleteTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        let ops = self.ops.clone();
        let agent = &target.agent;
        rt.poll_until(&format!("{} to leave the cluster", agent), || {
            let ops = ops.clone();
            async move { Ok::<_, TaskError>(ops.is_server_deleted(agent).await?.then_some(())) }
        })
        .await?;
        rt.log(format!("{} left the cluster", agent)).await;
        Ok(())
    }
}

pub struct DeleteAgentTask;

#[async_trait]
impl TaskBody for DeleteAgentTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        rt.env().persistence.delete_agent(&target.agent.key()).await?;
        rt.log(format!("agent {} removed", target.agent)).await;
        Ok(())
    }
}

/// Registers the new server once its observer is up.
pub struct AddServerTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for AddServerTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        rt.log(format!("adding server {}", target.agent)).await;
        self.ops.add_server(&target.agent).await?;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let target: ScaleTarget = data_of(rt)?;
        self.ops.delete_server(&target.agent).await?;
        Ok(())
    }
}
