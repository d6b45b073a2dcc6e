// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task service: creates dags, resolves generic ids and applies operators.
//!
//! The service is the only writer of operator changes. The executor picks
//! the rewritten state up on its next tick.

mod operator;

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument};

use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::generic_id::{self, GenericId};
use crate::model::{CLUSTER_LOCK_OWNER, Dag};
use crate::persistence::{DagFilter, Persistence, TaskLogRecord};
use crate::task::Operator;
use crate::template::Template;
use crate::view::{DagDetail, NodeDetail, TaskDetail};

use self::operator::Plan;

/// Which kind of entity a generic id names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Dag,
    Node,
    Task,
}

#[derive(Clone)]
pub struct TaskService {
    persistence: Arc<dyn Persistence>,
    agent: AgentAddr,
}

impl TaskService {
    pub fn new(persistence: Arc<dyn Persistence>, agent: AgentAddr) -> Self {
        Self { persistence, agent }
    }

    pub fn agent(&self) -> &AgentAddr {
        &self.agent
    }

    /// Persist a dag for `template`, taking its maintenance lock.
    #[instrument(skip(self, template, context), fields(template = %template.name))]
    pub async fn create_dag(&self, template: &Template, context: TaskContext) -> Result<Dag> {
        let dag = template.instantiate(context, &self.agent)?;
        let id = self.persistence.insert_dag(&dag).await?;
        let dag = self.load(id).await?;
        info!(
            dag_id = %dag.generic_id(),
            maintenance = %dag.maintainer,
            max_stage = dag.max_stage,
            "Created dag"
        );
        Ok(dag)
    }

    pub async fn load(&self, dag_id: i64) -> Result<Dag> {
        self.persistence
            .load_dag(dag_id)
            .await?
            .ok_or_else(|| CoreError::not_found("dag", dag_id))
    }

    /// Resolve a generic id of `kind` to the dag owning it.
    pub async fn resolve(&self, kind: EntityKind, raw: &str) -> Result<Dag> {
        let id = generic_id::decode(raw)?;
        let dag_id = match kind {
            EntityKind::Dag => id.id,
            EntityKind::Node => self
                .persistence
                .node_dag_id(id.id)
                .await?
                .ok_or_else(|| CoreError::not_found("node", raw))?,
            EntityKind::Task => {
                self.persistence
                    .get_task(id.id)
                    .await?
                    .ok_or_else(|| CoreError::not_found("task", raw))?
                    .dag_id
            }
        };
        let dag = self
            .persistence
            .load_dag(dag_id)
            .await?
            .ok_or_else(|| CoreError::not_found("dag", raw))?;
        check_owner(&dag, &id, raw)?;
        Ok(dag)
    }

    pub async fn dag_detail(&self, generic_id: &str) -> Result<DagDetail> {
        let dag = self.resolve(EntityKind::Dag, generic_id).await?;
        self.detail(&dag).await
    }

    /// Detail view with the execute-logs of every subtask that ran.
    pub async fn detail(&self, dag: &Dag) -> Result<DagDetail> {
        let mut logs = HashMap::new();
        for task in dag.all_tasks().filter(|t| t.has_executed()) {
            logs.insert(task.id, self.log_lines(task.id).await?);
        }
        Ok(DagDetail::from_dag(dag, logs))
    }

    pub async fn node_detail(&self, generic_id: &str) -> Result<NodeDetail> {
        let dag = self.resolve(EntityKind::Node, generic_id).await?;
        let node_id = generic_id::decode(generic_id)?.id;
        let node = dag
            .node_by_id(node_id)
            .ok_or_else(|| CoreError::not_found("node", generic_id))?;
        let mut logs = HashMap::new();
        for task in &node.tasks {
            logs.insert(task.id, self.log_lines(task.id).await?);
        }
        Ok(NodeDetail::from_node(&dag, node, &mut logs))
    }

    pub async fn task_detail(&self, generic_id: &str) -> Result<TaskDetail> {
        let dag = self.resolve(EntityKind::Task, generic_id).await?;
        let task_id = generic_id::decode(generic_id)?.id;
        let task = dag
            .task_by_id(task_id)
            .ok_or_else(|| CoreError::not_found("task", generic_id))?;
        let logs = self.log_lines(task.id).await?;
        Ok(TaskDetail::from_task(&dag, task, logs))
    }

    /// Execute-log of a subtask, oldest line first.
    pub async fn task_logs(&self, generic_id: &str) -> Result<Vec<TaskLogRecord>> {
        let dag = self.resolve(EntityKind::Task, generic_id).await?;
        let task_id = generic_id::decode(generic_id)?.id;
        if dag.task_by_id(task_id).is_none() {
            return Err(CoreError::not_found("task", generic_id));
        }
        self.persistence.task_logs(task_id).await
    }

    async fn log_lines(&self, task_id: i64) -> Result<Vec<String>> {
        Ok(self
            .persistence
            .task_logs(task_id)
            .await?
            .into_iter()
            .map(|l| l.content)
            .collect())
    }

    pub async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<DagDetail>> {
        let mut details = Vec::new();
        for record in self.persistence.list_dags(filter).await? {
            if let Some(dag) = self.persistence.load_dag(record.id).await? {
                details.push(DagDetail::from_dag(&dag, HashMap::new()));
            }
        }
        Ok(details)
    }

    /// Most recent dag still holding a lock: in this agent's own namespace
    /// when `local`, in the cluster namespace otherwise.
    pub async fn last_maintenance_dag(&self, local: bool) -> Result<Option<Dag>> {
        let owner = if local {
            self.agent.key()
        } else {
            CLUSTER_LOCK_OWNER.to_string()
        };
        match self.persistence.last_maintenance_dag(&owner).await? {
            Some(record) => self.persistence.load_dag(record.id).await,
            None => Ok(None),
        }
    }

    /// Apply `op` to the dag owning the entity named by `generic_id`.
    #[instrument(skip(self), fields(operator = %op))]
    pub async fn apply_operator(&self, kind: EntityKind, generic_id: &str, op: Operator) -> Result<Dag> {
        let dag = self.resolve(kind, generic_id).await?;
        self.apply_to_dag(dag, op).await
    }

    /// Validate `op` against the whole dag and persist the outcome in one
    /// transaction. A refused operator changes nothing.
    pub async fn apply_to_dag(&self, mut dag: Dag, op: Operator) -> Result<Dag> {
        let expected = (dag.state, dag.operator);
        let id = dag.id;
        let gid = dag.generic_id();
        match operator::plan(&mut dag, op)? {
            Plan::NoOp => {
                info!(dag_id = %gid, operator = %op, "Operator already in effect");
                return Ok(dag);
            }
            Plan::Cancel { node_id } => {
                self.persistence.cancel_dag(id, node_id).await?;
            }
            Plan::Rewrite { release_lock } => {
                self.persistence
                    .apply_operator(&dag, expected, release_lock)
                    .await?;
            }
        }
        info!(dag_id = %gid, operator = %op, "Applied operator");
        self.load(id).await
    }
}

/// A generic id names its owning agent; refuse ids that point elsewhere.
fn check_owner(dag: &Dag, id: &GenericId, raw: &str) -> Result<()> {
    let matches = match &id.agent {
        None => !dag.is_local,
        Some(agent) => dag.is_local && *agent == dag.owner,
    };
    if matches {
        Ok(())
    } else {
        Err(CoreError::not_found("dag", raw))
    }
}
