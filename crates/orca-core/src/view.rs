// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Externally visible views of dags, nodes and subtasks.
//!
//! These are the JSON bodies served to callers and peers. Entities are
//! addressed by generic id only; numeric ids never leave the agent.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::coordinator::AgentIdentity;
use crate::maintenance::Maintainer;
use crate::model::{Dag, Node, NodeType, SubTask};
use crate::task::{Capabilities, Operator, TaskState};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDetail {
    pub generic_id: String,
    pub name: String,
    pub struct_name: String,
    pub state: TaskState,
    pub operator: Operator,
    pub execute_times: i32,
    pub executor: String,
    pub capabilities: Capabilities,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDetail {
    pub generic_id: String,
    pub name: String,
    pub node_type: NodeType,
    pub stage: i32,
    pub state: TaskState,
    pub operator: Operator,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub tasks: Vec<TaskDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagDetail {
    pub generic_id: String,
    pub name: String,
    pub dag_type: String,
    pub state: TaskState,
    pub operator: Operator,
    pub stage: i32,
    pub max_stage: i32,
    pub is_local: bool,
    pub owner: String,
    pub maintenance: Maintainer,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub nodes: Vec<NodeDetail>,
    /// Concatenated execute-logs of failed subtasks, by generic id.
    #[serde(default)]
    pub failure_summary: BTreeMap<String, String>,
}

impl TaskDetail {
    pub fn from_task(dag: &Dag, task: &SubTask, logs: Vec<String>) -> Self {
        Self {
            generic_id: dag.task_generic_id(task),
            name: task.name.clone(),
            struct_name: task.struct_name.clone(),
            state: task.state,
            operator: task.operator,
            execute_times: task.execute_times,
            executor: task.executor.to_string(),
            capabilities: task.capabilities,
            start_time: task.start_time,
            end_time: task.end_time,
            logs,
        }
    }
}

impl NodeDetail {
    pub fn from_node(dag: &Dag, node: &Node, logs: &mut HashMap<i64, Vec<String>>) -> Self {
        Self {
            generic_id: dag.node_generic_id(node),
            name: node.name.clone(),
            node_type: node.node_type,
            stage: node.stage,
            state: node.state,
            operator: node.operator,
            start_time: node.start_time,
            end_time: node.end_time,
            tasks: node
                .tasks
                .iter()
                .map(|t| TaskDetail::from_task(dag, t, logs.remove(&t.id).unwrap_or_default()))
                .collect(),
        }
    }
}

impl DagDetail {
    /// Build the view; `logs` holds execute-log lines by task id.
    pub fn from_dag(dag: &Dag, mut logs: HashMap<i64, Vec<String>>) -> Self {
        let failure_summary = dag
            .all_tasks()
            .filter(|t| t.state == TaskState::Failed)
            .map(|t| {
                let lines = logs.get(&t.id).map(|l| l.join("\n")).unwrap_or_default();
                (dag.task_generic_id(t), lines)
            })
            .collect();
        Self {
            generic_id: dag.generic_id(),
            name: dag.name.clone(),
            dag_type: dag.dag_type.clone(),
            state: dag.state,
            operator: dag.operator,
            stage: dag.stage,
            max_stage: dag.max_stage,
            is_local: dag.is_local,
            owner: dag.owner.to_string(),
            maintenance: dag.maintainer.clone(),
            start_time: dag.start_time,
            end_time: dag.end_time,
            nodes: dag
                .nodes
                .iter()
                .map(|n| NodeDetail::from_node(dag, n, &mut logs))
                .collect(),
            failure_summary,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_succeed(&self) -> bool {
        self.state == TaskState::Succeed
    }

    pub fn is_failed(&self) -> bool {
        self.state == TaskState::Failed
    }

    pub fn current_node(&self) -> Option<&NodeDetail> {
        self.nodes.iter().find(|n| n.stage == self.stage)
    }

    /// Whether the current node runs subtasks of type `struct_name`.
    pub fn is_at(&self, struct_name: &str) -> bool {
        self.current_node()
            .and_then(|n| n.tasks.first())
            .is_some_and(|t| t.struct_name == struct_name)
    }

    /// One line summing up why the dag failed.
    pub fn failure_message(&self) -> String {
        if self.failure_summary.is_empty() {
            return format!("dag {} ({}) is {}", self.generic_id, self.name, self.state);
        }
        let details: Vec<String> = self
            .failure_summary
            .iter()
            .map(|(id, logs)| format!("{}: {}", id, logs.lines().last().unwrap_or("no log")))
            .collect();
        format!("dag {} ({}) failed: {}", self.generic_id, self.name, details.join("; "))
    }
}

/// Body of the status/info endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStatus {
    pub agent: String,
    pub identity: AgentIdentity,
    pub version: String,
    pub home_path: String,
    pub is_maintainer: bool,
    pub uptime_secs: u64,
    pub store_healthy: bool,
}
