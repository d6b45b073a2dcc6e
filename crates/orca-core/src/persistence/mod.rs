// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for orca-core.
//!
//! The shared store is the single source of truth for dag, node and task
//! state, maintenance locks and agent identity. Every state transition is a
//! single statement or a single transaction.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::maintenance::{MaintenanceType, Maintainer};
use crate::model::{Dag, Node, NodeType, SubTask};
use crate::task::{Capabilities, Operator, TaskState};

/// Dag row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct DagRecord {
    pub id: i64,
    pub name: String,
    pub dag_type: String,
    pub state: i32,
    pub operator: i32,
    pub stage: i32,
    pub max_stage: i32,
    pub is_local: bool,
    /// Creating agent (`ip:port`).
    pub owner: String,
    pub maintenance_type: i32,
    pub maintenance_key: String,
    pub failure_exit_maintenance: bool,
    /// Serialized [`TaskContext`].
    pub context: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Node row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct NodeRecord {
    pub id: i64,
    pub dag_id: i64,
    pub name: String,
    pub node_type: i32,
    pub stage: i32,
    pub state: i32,
    pub operator: i32,
    pub context: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Subtask row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct SubTaskRecord {
    pub id: i64,
    pub node_id: i64,
    pub dag_id: i64,
    pub seq: i32,
    pub name: String,
    pub struct_name: String,
    pub state: i32,
    pub operator: i32,
    pub execute_times: i32,
    /// Executor agent (`ip:port`).
    pub executor: String,
    pub can_cancel: bool,
    pub can_continue: bool,
    pub can_pass: bool,
    pub can_retry: bool,
    pub can_rollback: bool,
    pub context: String,
    pub additional_data: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// One execute-log line.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct TaskLogRecord {
    pub id: i64,
    pub task_id: i64,
    pub execute_times: i32,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A held maintenance lock.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LockRecord {
    pub dag_id: i64,
    /// `cluster` or the owning agent address.
    pub owner: String,
    pub lock_type: i32,
    pub lock_key: String,
    pub acquired_at: DateTime<Utc>,
}

/// Agent identity and liveness row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AgentRecord {
    /// `ip:port`.
    pub address: String,
    pub identity: String,
    pub version: String,
    pub home_path: String,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl AgentRecord {
    pub fn addr(&self) -> Result<AgentAddr> {
        self.address.parse()
    }
}

/// Filter for listing dags.
#[derive(Debug, Clone)]
pub struct DagFilter {
    /// Only dags that have not succeeded.
    pub unfinished_only: bool,
    pub name: Option<String>,
    pub limit: i64,
}

impl Default for DagFilter {
    fn default() -> Self {
        Self {
            unfinished_only: false,
            name: None,
            limit: 100,
        }
    }
}

fn decode_state(value: i32) -> Result<TaskState> {
    TaskState::from_i32(value)
        .ok_or_else(|| CoreError::Serialization(format!("unknown state {}", value)))
}

fn decode_operator(value: i32) -> Result<Operator> {
    Operator::from_i32(value)
        .ok_or_else(|| CoreError::Serialization(format!("unknown operator {}", value)))
}

fn decode_context(raw: &str) -> Result<TaskContext> {
    Ok(serde_json::from_str(raw)?)
}

impl DagRecord {
    pub fn state(&self) -> Result<TaskState> {
        decode_state(self.state)
    }

    pub fn maintainer(&self) -> Result<Maintainer> {
        let kind = MaintenanceType::from_i32(self.maintenance_type).ok_or_else(|| {
            CoreError::Serialization(format!("unknown maintenance type {}", self.maintenance_type))
        })?;
        Ok(Maintainer {
            kind,
            key: self.maintenance_key.clone(),
        })
    }

    pub fn generic_id(&self) -> Result<String> {
        Ok(crate::generic_id::encode(
            self.id,
            &self.owner.parse()?,
            self.is_local,
            &self.dag_type,
        ))
    }
}

impl SubTaskRecord {
    pub fn into_model(self) -> Result<SubTask> {
        Ok(SubTask {
            id: self.id,
            node_id: self.node_id,
            dag_id: self.dag_id,
            seq: self.seq,
            state: decode_state(self.state)?,
            operator: decode_operator(self.operator)?,
            execute_times: self.execute_times,
            executor: self.executor.parse()?,
            capabilities: Capabilities {
                can_cancel: self.can_cancel,
                can_continue: self.can_continue,
                can_pass: self.can_pass,
                can_retry: self.can_retry,
                can_rollback: self.can_rollback,
            },
            context: decode_context(&self.context)?,
            additional_data: self
                .additional_data
                .as_deref()
                .map(serde_json::from_str)
                .transpose()?,
            start_time: self.start_time,
            end_time: self.end_time,
            name: self.name,
            struct_name: self.struct_name,
        })
    }
}

/// Assemble a dag from its rows. Nodes are ordered by stage and subtasks by
/// registration order.
pub fn assemble_dag(dag: DagRecord, nodes: Vec<NodeRecord>, tasks: Vec<SubTaskRecord>) -> Result<Dag> {
    let mut built: Vec<Node> = nodes
        .into_iter()
        .map(|n| {
            Ok(Node {
                id: n.id,
                dag_id: n.dag_id,
                node_type: NodeType::from_i32(n.node_type)
                    .ok_or_else(|| CoreError::Serialization(format!("unknown node type {}", n.node_type)))?,
                stage: n.stage,
                state: decode_state(n.state)?,
                operator: decode_operator(n.operator)?,
                context: decode_context(&n.context)?,
                start_time: n.start_time,
                end_time: n.end_time,
                name: n.name,
                tasks: Vec::new(),
            })
        })
        .collect::<Result<_>>()?;
    built.sort_by_key(|n| n.stage);

    for record in tasks {
        let task = record.into_model()?;
        let node = built
            .iter_mut()
            .find(|n| n.id == task.node_id)
            .ok_or_else(|| CoreError::not_found("node", task.node_id))?;
        node.tasks.push(task);
    }
    for node in &mut built {
        node.tasks.sort_by_key(|t| t.seq);
    }

    Ok(Dag {
        id: dag.id,
        state: decode_state(dag.state)?,
        operator: decode_operator(dag.operator)?,
        stage: dag.stage,
        max_stage: dag.max_stage,
        is_local: dag.is_local,
        owner: dag.owner.parse()?,
        maintainer: dag.maintainer()?,
        failure_exit_maintenance: dag.failure_exit_maintenance,
        context: decode_context(&dag.context)?,
        start_time: dag.start_time,
        end_time: dag.end_time,
        name: dag.name,
        dag_type: dag.dag_type,
        nodes: built,
    })
}

/// Persistence backend for dags, locks and agents.
#[async_trait]
pub trait Persistence: Send + Sync {
    // ------------------------------------------------------------------
    // Dags
    // ------------------------------------------------------------------

    /// Insert a dag with all nodes and subtasks and take its maintenance
    /// lock, in one transaction.
    ///
    /// Fails with [`CoreError::MaintenanceConflict`] and inserts nothing when
    /// an overlapping lock is held in the same namespace.
    async fn insert_dag(&self, dag: &Dag) -> Result<i64>;

    async fn get_dag(&self, dag_id: i64) -> Result<Option<DagRecord>>;

    /// Load a dag with its nodes and subtasks.
    async fn load_dag(&self, dag_id: i64) -> Result<Option<Dag>>;

    async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<DagRecord>>;

    /// READY/RUNNING dags this agent may advance, oldest first: local dags
    /// owned by `owner`, plus cluster dags when `include_cluster`.
    async fn list_schedulable_dags(&self, owner: &AgentAddr, include_cluster: bool) -> Result<Vec<DagRecord>>;

    async fn node_dag_id(&self, node_id: i64) -> Result<Option<i64>>;

    async fn get_task(&self, task_id: i64) -> Result<Option<SubTaskRecord>>;

    /// Write dag state, stage, context and timestamps. Leaves the operator
    /// alone so concurrent operator requests are not lost.
    async fn update_dag_progress(&self, dag: &Dag) -> Result<()>;

    /// Write a terminal dag state, releasing its lock in the same
    /// transaction when `release_lock`.
    async fn finish_dag(&self, dag: &Dag, release_lock: bool) -> Result<()>;

    async fn update_node(&self, node: &Node) -> Result<()>;

    /// Move a PENDING subtask to READY with its dispatch context.
    async fn dispatch_task(&self, task: &SubTask) -> Result<bool>;

    /// Return unclaimed READY subtasks of a node to PENDING.
    async fn reset_ready_tasks(&self, node_id: i64) -> Result<u64>;

    // ------------------------------------------------------------------
    // Runner
    // ------------------------------------------------------------------

    /// READY subtasks assigned to `executor`, oldest first.
    async fn list_ready_tasks(&self, executor: &AgentAddr, limit: i64) -> Result<Vec<SubTaskRecord>>;

    async fn list_tasks_in_state(&self, executor: &AgentAddr, state: TaskState) -> Result<Vec<SubTaskRecord>>;

    /// READY -> RUNNING, bumping `execute_times`. Returns false when another
    /// worker won the race.
    async fn claim_task(&self, task_id: i64, started_at: DateTime<Utc>) -> Result<bool>;

    /// RUNNING -> terminal `state`, saving the context the body left behind.
    async fn complete_task(
        &self,
        task_id: i64,
        state: TaskState,
        context: &TaskContext,
        ended_at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Compare-and-set a subtask's state.
    async fn transition_task(&self, task_id: i64, from: TaskState, to: TaskState) -> Result<bool>;

    /// Current operators of the given subtasks.
    async fn task_operators(&self, task_ids: &[i64]) -> Result<Vec<(i64, i32)>>;

    // ------------------------------------------------------------------
    // Operators
    // ------------------------------------------------------------------

    /// Rewrite a dag with all nodes and subtasks after an operator was
    /// applied, releasing the lock when `release_lock`.
    ///
    /// Fails with [`CoreError::InvalidState`] when the stored dag no longer
    /// has state `expected.0` and operator `expected.1`.
    async fn apply_operator(&self, dag: &Dag, expected: (TaskState, Operator), release_lock: bool) -> Result<()>;

    /// Mark a dag CANCEL: running subtasks of `node_id` get the CANCEL
    /// operator, unclaimed READY ones fail immediately.
    async fn cancel_dag(&self, dag_id: i64, node_id: i64) -> Result<()>;

    // ------------------------------------------------------------------
    // Execute logs
    // ------------------------------------------------------------------

    async fn append_task_log(&self, task_id: i64, execute_times: i32, content: &str) -> Result<()>;

    async fn task_logs(&self, task_id: i64) -> Result<Vec<TaskLogRecord>>;

    // ------------------------------------------------------------------
    // Maintenance locks
    // ------------------------------------------------------------------

    async fn list_locks(&self, owner: &str) -> Result<Vec<LockRecord>>;

    /// Most recent dag still holding a lock in `owner`'s namespace.
    async fn last_maintenance_dag(&self, owner: &str) -> Result<Option<DagRecord>>;

    // ------------------------------------------------------------------
    // Agents
    // ------------------------------------------------------------------

    /// Insert an agent row, or refresh its version and home path.
    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()>;

    async fn get_agent(&self, address: &str) -> Result<Option<AgentRecord>>;

    async fn list_agents(&self) -> Result<Vec<AgentRecord>>;

    /// Compare-and-set an agent identity.
    async fn update_agent_identity(&self, address: &str, expected: &str, identity: &str) -> Result<bool>;

    /// Become TAKE_OVER_MASTER unless another agent already is.
    async fn claim_take_over_master(&self, address: &str, expected: &str) -> Result<bool>;

    async fn heartbeat(&self, address: &str, at: DateTime<Utc>) -> Result<()>;

    async fn delete_agent(&self, address: &str) -> Result<()>;

    /// Check that the store answers.
    async fn health_check(&self) -> Result<()>;
}
