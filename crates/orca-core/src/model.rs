// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Runtime model of dags, nodes and subtasks.
//!
//! A dag owns its nodes in stage order and each node owns its subtasks, so
//! upstream/downstream links are plain indices (`stage - 1` / `stage + 1`).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::generic_id;
use crate::maintenance::Maintainer;
use crate::task::{Capabilities, DagMeta, Operator, TaskMeta, TaskState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    /// Subtasks run one after another in registration order.
    Normal,
    /// Subtasks run concurrently on their executor agents.
    Parallel,
}

impl NodeType {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Normal => 1,
            Self::Parallel => 2,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Normal),
            2 => Some(Self::Parallel),
            _ => None,
        }
    }
}

/// Aggregate child states into a node state.
///
/// All SUCCEED gives SUCCEED. A FAILED child fails a node with no RUNNING
/// child; a PARALLEL node fails as soon as any child fails. Otherwise the
/// strongest of RUNNING, READY, PENDING wins.
pub fn aggregate(node_type: NodeType, states: impl IntoIterator<Item = TaskState>) -> TaskState {
    let (mut total, mut succeeded) = (0usize, 0usize);
    let (mut failed, mut running, mut ready) = (false, false, false);
    for state in states {
        total += 1;
        match state {
            TaskState::Succeed => succeeded += 1,
            TaskState::Failed => failed = true,
            TaskState::Running => running = true,
            TaskState::Ready => ready = true,
            TaskState::Pending => {}
        }
    }
    if succeeded == total {
        return TaskState::Succeed;
    }
    if failed && (node_type == NodeType::Parallel || !running) {
        return TaskState::Failed;
    }
    if running || failed {
        TaskState::Running
    } else if ready {
        TaskState::Ready
    } else {
        TaskState::Pending
    }
}

#[derive(Debug, Clone)]
pub struct SubTask {
    pub id: i64,
    pub node_id: i64,
    pub dag_id: i64,
    /// Registration order inside the node.
    pub seq: i32,
    pub name: String,
    pub struct_name: String,
    pub state: TaskState,
    pub operator: Operator,
    pub execute_times: i32,
    pub executor: AgentAddr,
    pub capabilities: Capabilities,
    pub context: TaskContext,
    pub additional_data: Option<Value>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl SubTask {
    /// Whether the body ran at least once and may need compensating.
    pub fn has_executed(&self) -> bool {
        self.execute_times > 0
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self.state, TaskState::Ready | TaskState::Running)
    }
}

#[derive(Debug, Clone)]
pub struct Node {
    pub id: i64,
    pub dag_id: i64,
    pub name: String,
    pub node_type: NodeType,
    /// 1-based position in the dag.
    pub stage: i32,
    pub state: TaskState,
    pub operator: Operator,
    pub context: TaskContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tasks: Vec<SubTask>,
}

impl Node {
    pub fn aggregate(&self) -> TaskState {
        aggregate(self.node_type, self.tasks.iter().map(|t| t.state))
    }

    /// Aggregate only the subtasks taking part in a rollback.
    pub fn aggregate_rollback(&self) -> TaskState {
        aggregate(
            self.node_type,
            self.tasks
                .iter()
                .filter(|t| t.operator == Operator::Rollback)
                .map(|t| t.state),
        )
    }

    pub fn has_in_flight(&self) -> bool {
        self.tasks.iter().any(SubTask::is_in_flight)
    }

    pub fn failed_tasks(&self) -> impl Iterator<Item = &SubTask> {
        self.tasks.iter().filter(|t| t.state == TaskState::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct Dag {
    pub id: i64,
    pub name: String,
    pub dag_type: String,
    pub state: TaskState,
    pub operator: Operator,
    /// 1-based index of the current node.
    pub stage: i32,
    pub max_stage: i32,
    pub is_local: bool,
    /// Agent that created the dag. Owns it when local.
    pub owner: AgentAddr,
    pub maintainer: Maintainer,
    pub failure_exit_maintenance: bool,
    pub context: TaskContext,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub nodes: Vec<Node>,
}

impl Dag {
    pub fn generic_id(&self) -> String {
        self.encode(self.id)
    }

    pub fn node_generic_id(&self, node: &Node) -> String {
        self.encode(node.id)
    }

    pub fn task_generic_id(&self, task: &SubTask) -> String {
        self.encode(task.id)
    }

    fn encode(&self, id: i64) -> String {
        generic_id::encode(id, &self.owner, self.is_local, &self.dag_type)
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn current_node(&self) -> Option<&Node> {
        usize::try_from(self.stage - 1)
            .ok()
            .and_then(|i| self.nodes.get(i))
    }

    pub fn current_node_mut(&mut self) -> Option<&mut Node> {
        usize::try_from(self.stage - 1)
            .ok()
            .and_then(|i| self.nodes.get_mut(i))
    }

    pub fn node_by_id(&self, node_id: i64) -> Option<&Node> {
        self.nodes.iter().find(|n| n.id == node_id)
    }

    pub fn task_by_id(&self, task_id: i64) -> Option<&SubTask> {
        self.nodes
            .iter()
            .flat_map(|n| n.tasks.iter())
            .find(|t| t.id == task_id)
    }

    pub fn all_tasks(&self) -> impl Iterator<Item = &SubTask> {
        self.nodes.iter().flat_map(|n| n.tasks.iter())
    }

    /// Namespace a maintenance lock of this dag lives in.
    pub fn lock_owner(&self) -> String {
        lock_owner(self.is_local, &self.owner)
    }

    pub fn meta(&self) -> DagMeta {
        DagMeta {
            id: self.id,
            generic_id: self.generic_id(),
            name: self.name.clone(),
            dag_type: self.dag_type.clone(),
            stage: self.stage,
            max_stage: self.max_stage,
            is_local: self.is_local,
            owner: self.owner.clone(),
        }
    }

    pub fn task_meta(&self, task: &SubTask) -> TaskMeta {
        TaskMeta {
            id: task.id,
            generic_id: self.task_generic_id(task),
            node_id: task.node_id,
            name: task.name.clone(),
            struct_name: task.struct_name.clone(),
            operator: task.operator,
            execute_times: task.execute_times,
            executor: task.executor.clone(),
        }
    }
}

/// Lock namespace: `cluster` for cluster dags, the owning agent otherwise.
pub fn lock_owner(is_local: bool, owner: &AgentAddr) -> String {
    if is_local {
        owner.key()
    } else {
        CLUSTER_LOCK_OWNER.to_string()
    }
}

pub const CLUSTER_LOCK_OWNER: &str = "cluster";

/// Stored wire form of a subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteTask {
    pub task_id: i64,
    pub name: String,
    pub struct_name: String,
    pub state: i32,
    pub operator: i32,
    pub can_cancel: bool,
    pub can_continue: bool,
    pub can_pass: bool,
    pub can_retry: bool,
    pub can_rollback: bool,
    pub context: TaskContext,
    pub execute_times: i32,
    pub executer_agent: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

impl From<&SubTask> for RemoteTask {
    fn from(task: &SubTask) -> Self {
        Self {
            task_id: task.id,
            name: task.name.clone(),
            struct_name: task.struct_name.clone(),
            state: task.state.as_i32(),
            operator: task.operator.as_i32(),
            can_cancel: task.capabilities.can_cancel,
            can_continue: task.capabilities.can_continue,
            can_pass: task.capabilities.can_pass,
            can_retry: task.capabilities.can_retry,
            can_rollback: task.capabilities.can_rollback,
            context: task.context.clone(),
            execute_times: task.execute_times,
            executer_agent: task.executor.to_string(),
            start_time: task.start_time,
            end_time: task.end_time,
        }
    }
}

impl RemoteTask {
    /// Rebuild a subtask; the wire form does not carry its parents.
    pub fn into_sub_task(self, node_id: i64, dag_id: i64, seq: i32) -> Result<SubTask> {
        let state = TaskState::from_i32(self.state)
            .ok_or_else(|| CoreError::Serialization(format!("unknown task state {}", self.state)))?;
        let operator = Operator::from_i32(self.operator)
            .ok_or_else(|| CoreError::Serialization(format!("unknown operator {}", self.operator)))?;
        Ok(SubTask {
            id: self.task_id,
            node_id,
            dag_id,
            seq,
            name: self.name,
            struct_name: self.struct_name,
            state,
            operator,
            execute_times: self.execute_times,
            executor: self.executer_agent.parse()?,
            capabilities: Capabilities {
                can_cancel: self.can_cancel,
                can_continue: self.can_continue,
                can_pass: self.can_pass,
                can_retry: self.can_retry,
                can_rollback: self.can_rollback,
            },
            context: self.context,
            additional_data: None,
            start_time: self.start_time,
            end_time: self.end_time,
        })
    }
}
