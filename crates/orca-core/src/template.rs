// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dag templates and the builder that composes them.
//!
//! A template is the build-time description of a dag: an ordered, strictly
//! linear list of node templates plus the maintenance scope the dag will
//! lock. [`TemplateBuilder`] wires each appended node as the downstream of
//! the previous one and can import whole sub-templates.

use serde_json::Value;

use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::generic_id::DAG_TYPE_OB;
use crate::maintenance::Maintainer;
use crate::model::{Dag, Node, NodeType, SubTask};
use crate::task::{Capabilities, Operator, TaskState};

/// One subtask to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskTemplate {
    pub name: String,
    pub struct_name: String,
    pub capabilities: Capabilities,
    /// Executor agent; `None` means the creating agent, or a fan-out over
    /// the node's `execute_agents`.
    pub executor: Option<AgentAddr>,
    pub additional_data: Option<Value>,
}

impl TaskTemplate {
    pub fn new(struct_name: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            struct_name: struct_name.into(),
            capabilities: Capabilities::default(),
            executor: None,
            additional_data: None,
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    pub fn on(mut self, executor: AgentAddr) -> Self {
        self.executor = Some(executor);
        self
    }

    pub fn with_additional_data(mut self, data: Value) -> Self {
        self.additional_data = Some(data);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NodeTemplate {
    pub name: String,
    pub node_type: NodeType,
    pub tasks: Vec<TaskTemplate>,
    pub context: TaskContext,
    upstream: Option<usize>,
    downstream: Option<usize>,
}

impl NodeTemplate {
    /// A node running `task`, named after it.
    pub fn new(task: TaskTemplate, node_type: NodeType) -> Self {
        Self {
            name: task.name.clone(),
            node_type,
            tasks: vec![task],
            context: TaskContext::new(),
            upstream: None,
            downstream: None,
        }
    }

    pub fn normal(task: TaskTemplate) -> Self {
        Self::new(task, NodeType::Normal)
    }

    pub fn parallel(task: TaskTemplate) -> Self {
        Self::new(task, NodeType::Parallel)
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_context(mut self, context: TaskContext) -> Self {
        self.context = context;
        self
    }

    /// Add another subtask. All subtasks of a node share one task type.
    pub fn add_task(&mut self, task: TaskTemplate) -> Result<&mut Self> {
        if let Some(first) = self.tasks.first()
            && first.struct_name != task.struct_name
        {
            return Err(CoreError::Build(format!(
                "node '{}' runs {} and cannot take a {} subtask",
                self.name, first.struct_name, task.struct_name
            )));
        }
        self.tasks.push(task);
        Ok(self)
    }

    pub fn upstream(&self) -> Option<usize> {
        self.upstream
    }

    pub fn downstream(&self) -> Option<usize> {
        self.downstream
    }
}

/// A buildable dag description.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub name: String,
    pub dag_type: String,
    pub nodes: Vec<NodeTemplate>,
    pub maintainer: Maintainer,
    pub is_local: bool,
    pub failure_exit_maintenance: bool,
}

impl Template {
    pub fn max_stage(&self) -> i32 {
        i32::try_from(self.nodes.len()).unwrap_or(i32::MAX)
    }

    /// Link `downstream` after `upstream`. Each node takes at most one of
    /// each link.
    pub fn link(&mut self, upstream: usize, downstream: usize) -> Result<()> {
        let len = self.nodes.len();
        if upstream >= len || downstream >= len || upstream == downstream {
            return Err(CoreError::Build(format!(
                "cannot link node {} to node {} in a template of {} nodes",
                upstream, downstream, len
            )));
        }
        if let Some(existing) = self.nodes[upstream].downstream {
            return Err(CoreError::Build(format!(
                "node '{}' already has downstream {}",
                self.nodes[upstream].name, existing
            )));
        }
        if let Some(existing) = self.nodes[downstream].upstream {
            return Err(CoreError::Build(format!(
                "node '{}' already has upstream {}",
                self.nodes[downstream].name, existing
            )));
        }
        self.nodes[upstream].downstream = Some(downstream);
        self.nodes[downstream].upstream = Some(upstream);
        Ok(())
    }

    /// Create the runtime dag for this template. Ids are assigned on insert.
    ///
    /// A node holding a single subtask without an executor fans out into one
    /// subtask per agent listed under `execute_agents` in its context.
    pub fn instantiate(&self, context: TaskContext, creator: &AgentAddr) -> Result<Dag> {
        let mut nodes = Vec::with_capacity(self.nodes.len());
        for (index, template) in self.nodes.iter().enumerate() {
            let fan_out = match template.tasks.as_slice() {
                [only] if only.executor.is_none() => template
                    .context
                    .execute_agents()
                    .map_err(|e| CoreError::Build(e.to_string()))?
                    .filter(|agents| !agents.is_empty())
                    .map(|agents| (only, agents)),
                _ => None,
            };

            let tasks: Vec<SubTask> = match fan_out {
                Some((task, agents)) => agents
                    .into_iter()
                    .enumerate()
                    .map(|(seq, agent)| new_sub_task(task, agent, seq))
                    .collect(),
                None => template
                    .tasks
                    .iter()
                    .enumerate()
                    .map(|(seq, task)| {
                        let executor = task.executor.clone().unwrap_or_else(|| creator.clone());
                        new_sub_task(task, executor, seq)
                    })
                    .collect(),
            };

            nodes.push(Node {
                id: 0,
                dag_id: 0,
                name: template.name.clone(),
                node_type: template.node_type,
                stage: index as i32 + 1,
                state: TaskState::Pending,
                operator: Operator::Run,
                context: template.context.clone(),
                start_time: None,
                end_time: None,
                tasks,
            });
        }

        Ok(Dag {
            id: 0,
            name: self.name.clone(),
            dag_type: self.dag_type.clone(),
            state: TaskState::Ready,
            operator: Operator::Run,
            stage: 1,
            max_stage: self.max_stage(),
            is_local: self.is_local,
            owner: creator.clone(),
            maintainer: self.maintainer.clone(),
            failure_exit_maintenance: self.failure_exit_maintenance,
            context,
            start_time: None,
            end_time: None,
            nodes,
        })
    }

    fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(CoreError::Build(format!("template '{}' has no nodes", self.name)));
        }
        for (i, node) in self.nodes.iter().enumerate() {
            if node.tasks.is_empty() {
                return Err(CoreError::Build(format!("node '{}' has no subtasks", node.name)));
            }
            let expected_up = i.checked_sub(1);
            let expected_down = (i + 1 < self.nodes.len()).then_some(i + 1);
            if node.upstream != expected_up || node.downstream != expected_down {
                return Err(CoreError::Build(format!(
                    "node '{}' breaks the linear chain of '{}'",
                    node.name, self.name
                )));
            }
        }
        Ok(())
    }
}

fn new_sub_task(template: &TaskTemplate, executor: AgentAddr, seq: usize) -> SubTask {
    SubTask {
        id: 0,
        node_id: 0,
        dag_id: 0,
        seq: seq as i32,
        name: template.name.clone(),
        struct_name: template.struct_name.clone(),
        state: TaskState::Pending,
        operator: Operator::Run,
        execute_times: 0,
        executor,
        capabilities: template.capabilities,
        context: TaskContext::new(),
        additional_data: template.additional_data.clone(),
        start_time: None,
        end_time: None,
    }
}

/// Composes templates node by node.
#[derive(Debug)]
pub struct TemplateBuilder {
    template: Template,
    merged: Maintainer,
    explicit: Option<Maintainer>,
    error: Option<CoreError>,
}

impl TemplateBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            template: Template {
                name: name.into(),
                dag_type: DAG_TYPE_OB.to_string(),
                nodes: Vec::new(),
                maintainer: Maintainer::none(),
                is_local: false,
                failure_exit_maintenance: false,
            },
            merged: Maintainer::none(),
            explicit: None,
            error: None,
        }
    }

    /// Append a node as the downstream of the last one.
    pub fn add_node(mut self, mut node: NodeTemplate) -> Self {
        node.upstream = None;
        node.downstream = None;
        self.template.nodes.push(node);
        let len = self.template.nodes.len();
        if len > 1
            && let Err(e) = self.template.link(len - 2, len - 1)
        {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Import every node of `sub`, dropping its links, and merge its scope.
    pub fn add_template(mut self, sub: Template) -> Self {
        self.merged = self.merged.merge(&sub.maintainer);
        for node in sub.nodes {
            self = self.add_node(node);
        }
        self
    }

    /// Declare the scope explicitly, overriding the merged default.
    pub fn maintenance(mut self, maintainer: Maintainer) -> Self {
        self.explicit = Some(maintainer);
        self
    }

    pub fn local(mut self, is_local: bool) -> Self {
        self.template.is_local = is_local;
        self
    }

    pub fn dag_type(mut self, dag_type: impl Into<String>) -> Self {
        self.template.dag_type = dag_type.into();
        self
    }

    /// Release the maintenance lock when the dag fails, too.
    pub fn failure_exit_maintenance(mut self, value: bool) -> Self {
        self.template.failure_exit_maintenance = value;
        self
    }

    pub fn build(mut self) -> Result<Template> {
        if let Some(e) = self.error {
            return Err(e);
        }
        self.template.maintainer = self.explicit.unwrap_or(self.merged);
        self.template.validate()?;
        Ok(self.template)
    }
}
