// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dags the coordinator starts when this agent's identity needs repair.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use orca_core::error::{CoreError, Result};
use orca_core::persistence::AgentRecord;
use orca_core::{
    AgentEnv, AgentIdentity, Maintainer, NodeTemplate, ReconcileHooks, TaskBody, TaskContext, TaskError, TaskRegistry,
    TaskRuntime, TemplateBuilder,
};
use tracing::{info, warn};

use super::{observer, register_with_ops, task};
use crate::observer::ObserverOps;

pub const SYNC_AGENT_ROWS: &str = "SyncAgentRowsTask";
pub const CONVERT_PEERS: &str = "ConvertPeersTask";
pub const SYNC_SELF: &str = "SyncSelfTask";

pub(super) fn register(registry: &mut TaskRegistry, ops: &Arc<dyn ObserverOps>) {
    register_with_ops(registry, ops, SYNC_AGENT_ROWS, |ops| SyncAgentRowsTask { ops });
    register_with_ops(registry, ops, CONVERT_PEERS, |ops| ConvertPeersTask { ops });
    registry.register(SYNC_SELF, super::capabilities(SYNC_SELF), || SyncSelfTask);
}

/// [`ReconcileHooks`] backed by the flows of this crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct FlowHooks;

#[async_trait]
impl ReconcileHooks for FlowHooks {
    async fn take_over(&self, env: &AgentEnv) -> Result<()> {
        let template = TemplateBuilder::new("Take over cluster")
            .add_node(NodeTemplate::normal(task(SYNC_AGENT_ROWS, "sync agent rows")))
            .add_node(NodeTemplate::normal(task(CONVERT_PEERS, "convert peers to cluster agents")))
            .add_node(NodeTemplate::normal(task(SYNC_SELF, "convert self to cluster agent")))
            .maintenance(Maintainer::global())
            .build()?;
        let dag = env.service.create_dag(&template, TaskContext::new()).await?;
        info!(agent = %env.agent, dag_id = %dag.generic_id(), "Take-over dag created");
        Ok(())
    }

    async fn rebuild(&self, env: &AgentEnv, stored: &AgentRecord) -> Result<()> {
        let template = TemplateBuilder::new(format!("Rebuild {}", env.agent))
            .add_node(NodeTemplate::normal(task(observer::STOP_OBSERVER, "stop observer")))
            .add_node(NodeTemplate::normal(task(observer::DEPLOY, "redeploy observer")))
            .add_node(NodeTemplate::normal(task(observer::START_OBSERVER, "start observer")))
            .local(true)
            .maintenance(Maintainer::global())
            .build()?;
        let mut context = TaskContext::new();
        context
            .set_param(observer::VERSION, &stored.version)
            .map_err(|e| CoreError::Serialization(e.to_string()))?;
        match env.service.create_dag(&template, context).await {
            Ok(dag) => {
                info!(agent = %env.agent, dag_id = %dag.generic_id(), version = %stored.version, "Rebuild dag created");
                Ok(())
            }
            Err(CoreError::MaintenanceConflict { holder, name }) => {
                warn!(agent = %env.agent, %holder, %name, "Agent busy, rebuild not started");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// Creates a TAKE_OVER_FOLLOWER row for every cluster server the store does
/// not know yet.
pub struct SyncAgentRowsTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for SyncAgentRowsTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let persistence = &rt.env().persistence;
        let own_key = rt.agent().key();
        let own = persistence
            .get_agent(&own_key)
            .await?
            .ok_or_else(|| CoreError::not_found("agent", &own_key))?;
        for server in self.ops.list_servers().await? {
            let key = server.key();
            if persistence.get_agent(&key).await?.is_some() {
                continue;
            }
            persistence
                .upsert_agent(&AgentRecord {
                    address: key,
                    identity: AgentIdentity::TakeOverFollower.as_str().to_string(),
                    version: own.version.clone(),
                    home_path: own.home_path.clone(),
                    last_heartbeat: None,
                    created_at: Utc::now(),
                })
                .await?;
            rt.log(format!("added row for {}", server)).await;
        }
        Ok(())
    }
}

/// Moves every other cluster server to CLUSTER_AGENT.
pub struct ConvertPeersTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for ConvertPeersTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let identity = &rt.env().identity;
        for server in self.ops.list_servers().await? {
            if server == *rt.agent() {
                continue;
            }
            rt.check()?;
            if identity.stored(&server).await? == AgentIdentity::Single {
                identity.set_identity(&server, AgentIdentity::TakeOverFollower).await?;
            }
            identity.set_identity(&server, AgentIdentity::ClusterAgent).await?;
            rt.log(format!("{} is now {}", server, AgentIdentity::ClusterAgent)).await;
        }
        Ok(())
    }
}

pub struct SyncSelfTask;

#[async_trait]
impl TaskBody for SyncSelfTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.env().identity.transition(AgentIdentity::ClusterAgent).await?;
        rt.log(format!("{} took over the cluster", rt.agent())).await;
        Ok(())
    }
}
