// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bootstrap of a new cluster.
//!
//! The creating agent becomes MASTER and every other member FOLLOWER. Once
//! the observers are deployed, started, bootstrapped and migrated, the
//! convert sub-template moves the master and then the followers to
//! CLUSTER_AGENT, and the master waits until each peer reports the new
//! identity.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use orca_core::error::{CoreError, Result};
use orca_core::{
    AgentAddr, AgentIdentity, Maintainer, NodeTemplate, TaskBody, TaskContext, TaskError, TaskRegistry, TaskRuntime,
    Template, TemplateBuilder,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{data_of, observer, register_with_ops, task};
use crate::observer::{BootstrapScript, ObserverOps};

pub const INTEGRATE_CONFIG: &str = "IntegrateConfigTask";
pub const BOOTSTRAP: &str = "BootstrapTask";
pub const RUN_SCRIPT: &str = "RunScriptTask";
pub const CONVERT_MASTER: &str = "ConvertMasterTask";
pub const CONVERT_FOLLOWERS: &str = "ConvertFollowersTask";
pub const CONVERT_SYNC: &str = "ConvertSyncTask";
pub const AGENT_SYNC: &str = "AgentSyncTask";

/// Param naming the cluster.
pub const CLUSTER_NAME: &str = "cluster_name";

pub(super) fn register(registry: &mut TaskRegistry, ops: &Arc<dyn ObserverOps>) {
    registry
        .register(INTEGRATE_CONFIG, super::capabilities(INTEGRATE_CONFIG), || IntegrateConfigTask)
        .register(CONVERT_MASTER, super::capabilities(CONVERT_MASTER), || ConvertMasterTask)
        .register(CONVERT_FOLLOWERS, super::capabilities(CONVERT_FOLLOWERS), || ConvertFollowersTask)
        .register(CONVERT_SYNC, super::capabilities(CONVERT_SYNC), || ConvertSyncTask)
        .register(AGENT_SYNC, super::capabilities(AGENT_SYNC), || AgentSyncTask);
    register_with_ops(registry, ops, BOOTSTRAP, |ops| BootstrapTask { ops });
    register_with_ops(registry, ops, RUN_SCRIPT, |ops| RunScriptTask { ops });
}

/// Body of `POST /api/v1/ob/init`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitClusterRequest {
    pub cluster_name: String,
    /// Every member, the creating agent included.
    pub agents: Vec<AgentAddr>,
}

/// Members of the cluster being bootstrapped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterMembers {
    pub agents: Vec<AgentAddr>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ScriptStep {
    script: BootstrapScript,
}

fn validate(creator: &AgentAddr, request: &InitClusterRequest) -> Result<()> {
    let invalid = |message: String| CoreError::Validation {
        field: "agents".to_string(),
        message,
    };
    if request.cluster_name.trim().is_empty() {
        return Err(CoreError::Validation {
            field: "cluster_name".to_string(),
            message: "cluster name must not be empty".to_string(),
        });
    }
    if request.agents.is_empty() {
        return Err(invalid("a cluster needs at least one agent".to_string()));
    }
    if !request.agents.contains(creator) {
        return Err(invalid(format!("the creating agent {} must be a member", creator)));
    }
    let mut seen = HashSet::new();
    if let Some(dup) = request.agents.iter().find(|a| !seen.insert(*a)) {
        return Err(invalid(format!("agent {} is listed twice", dup)));
    }
    Ok(())
}

fn script_node(script: BootstrapScript) -> Result<NodeTemplate> {
    Ok(NodeTemplate::normal(
        task(RUN_SCRIPT, format!("run {}", script)).with_additional_data(serde_json::to_value(ScriptStep { script })?),
    ))
}

/// Parallel node running `struct_name` once on each of `agents`.
fn per_agent(struct_name: &str, what: &str, agents: &[AgentAddr]) -> Result<NodeTemplate> {
    let mut agents = agents.iter();
    let first = agents
        .next()
        .ok_or_else(|| CoreError::Build(format!("{} needs at least one agent", what)))?;
    let mut node = NodeTemplate::parallel(task(struct_name, format!("{} on {}", what, first)).on(first.clone()))
        .named(format!("{}s", what));
    for agent in agents {
        node.add_task(task(struct_name, format!("{} on {}", what, agent)).on(agent.clone()))?;
    }
    Ok(node)
}

/// Moves the master, then the followers, to CLUSTER_AGENT and checks that
/// every member row agrees.
fn convert_cluster(members: &serde_json::Value) -> Result<Template> {
    TemplateBuilder::new("Convert to cluster")
        .add_node(NodeTemplate::normal(
            task(CONVERT_MASTER, "convert master").with_additional_data(members.clone()),
        ))
        .add_node(NodeTemplate::normal(
            task(CONVERT_FOLLOWERS, "convert followers").with_additional_data(members.clone()),
        ))
        .add_node(NodeTemplate::normal(
            task(CONVERT_SYNC, "sync converted members").with_additional_data(members.clone()),
        ))
        .build()
}

/// Template and context bootstrapping `request.agents` into a cluster.
pub fn init_cluster(creator: &AgentAddr, request: &InitClusterRequest) -> Result<(Template, TaskContext)> {
    validate(creator, request)?;
    let members = serde_json::to_value(ClusterMembers {
        agents: request.agents.clone(),
    })?;

    let deploy = per_agent(observer::DEPLOY, "deploy observer", &request.agents)?;
    let start = per_agent(observer::START_OBSERVER, "start observer", &request.agents)?;

    let template = TemplateBuilder::new("Initialize cluster")
        .add_node(NodeTemplate::normal(
            task(INTEGRATE_CONFIG, "integrate cluster config").with_additional_data(members.clone()),
        ))
        .add_node(deploy)
        .add_node(start)
        .add_node(NodeTemplate::normal(
            task(BOOTSTRAP, "bootstrap cluster").with_additional_data(members.clone()),
        ))
        .add_node(script_node(BootstrapScript::MigrateTable)?)
        .add_node(script_node(BootstrapScript::ModifyPassword)?)
        .add_node(script_node(BootstrapScript::MigrateData)?)
        .add_template(convert_cluster(&members)?)
        .add_node(script_node(BootstrapScript::ImportScript)?)
        .add_node(NodeTemplate::normal(
            task(AGENT_SYNC, "wait for agents to sync").with_additional_data(members),
        ))
        .maintenance(Maintainer::global())
        .build()?;

    let mut context = TaskContext::new();
    context
        .set_param(CLUSTER_NAME, &request.cluster_name)
        .map_err(|e| CoreError::Serialization(e.to_string()))?;
    Ok((template, context))
}

/// Assigns MASTER to the dag owner and FOLLOWER to everyone else.
pub struct IntegrateConfigTask;

#[async_trait]
impl TaskBody for IntegrateConfigTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        let owner = &rt.dag().owner;
        let identity = &rt.env().identity;
        for agent in &members.agents {
            let to = if agent == owner {
                AgentIdentity::Master
            } else {
                AgentIdentity::Follower
            };
            identity.set_identity(agent, to).await?;
            rt.log(format!("{} is now {}", agent, to)).await;
        }
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        for agent in &members.agents {
            rt.env().identity.set_identity(agent, AgentIdentity::Single).await?;
        }
        rt.log("members are single agents again").await;
        Ok(())
    }
}

pub struct BootstrapTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for BootstrapTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        let cluster_name = rt.context().await.param::<String>(CLUSTER_NAME).require(CLUSTER_NAME)?;
        rt.log(format!("bootstrapping cluster {} over {} servers", cluster_name, members.agents.len()))
            .await;
        self.ops.bootstrap(&members.agents).await?;
        Ok(())
    }
}

pub struct RunScriptTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for RunScriptTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let step: ScriptStep = data_of(rt)?;
        rt.log(format!("running {}", step.script)).await;
        self.ops.run_script(step.script).await?;
        Ok(())
    }
}

/// Moves the dag owner from MASTER to CLUSTER_AGENT.
pub struct ConvertMasterTask;

#[async_trait]
impl TaskBody for ConvertMasterTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let owner = rt.dag().owner.clone();
        rt.env()
            .identity
            .set_identity(&owner, AgentIdentity::ClusterAgent)
            .await?;
        rt.log(format!("master {} converted", owner)).await;
        Ok(())
    }
}

/// Moves every member but the owner from FOLLOWER to CLUSTER_AGENT.
pub struct ConvertFollowersTask;

#[async_trait]
impl TaskBody for ConvertFollowersTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        let owner = &rt.dag().owner;
        let mut converted = 0;
        for agent in members.agents.iter().filter(|a| *a != owner) {
            rt.check()?;
            rt.env()
                .identity
                .set_identity(agent, AgentIdentity::ClusterAgent)
                .await?;
            converted += 1;
        }
        rt.log(format!("{} followers converted", converted)).await;
        Ok(())
    }
}

/// Fails unless every member row reads CLUSTER_AGENT.
pub struct ConvertSyncTask;

#[async_trait]
impl TaskBody for ConvertSyncTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        for agent in &members.agents {
            let stored = rt.env().identity.stored(agent).await?;
            if stored != AgentIdentity::ClusterAgent {
                return Err(TaskError::failed(format!("{} is still {}", agent, stored)));
            }
        }
        rt.log(format!("{} members converted", members.agents.len())).await;
        Ok(())
    }
}

/// Waits until every member reports CLUSTER_AGENT over RPC.
pub struct AgentSyncTask;

#[async_trait]
impl TaskBody for AgentSyncTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let members: ClusterMembers = data_of(rt)?;
        let client = rt.env().peer.clone();
        for agent in &members.agents {
            let client = client.clone();
            rt.poll_until(&format!("{} to report {}", agent, AgentIdentity::ClusterAgent), || {
                let client = client.clone();
                async move {
                    match client.status(agent).await {
                        Ok(status) => Ok::<_, TaskError>((status.identity == AgentIdentity::ClusterAgent).then_some(())),
                        Err(e) if e.is_transient() => {
                            debug!(%agent, error = %e, "Agent not reachable yet");
                            Ok(None)
                        }
                        Err(e) => Err(e.into()),
                    }
                }
            })
            .await?;
            rt.log(format!("{} is in sync", agent)).await;
        }
        Ok(())
    }
}
