// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The per-agent dag driver.
//!
//! One driver runs per agent. Each tick it loads every dag this agent may
//! advance, oldest first, and moves each one a single step: start the
//! current node, dispatch its subtasks, aggregate their states, or move the
//! stage. Subtask bodies run in the [`Runner`](super::Runner) of their
//! executor agent; the driver only reads their outcome from the store.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use super::ExecutorConfig;
use crate::context::TaskContext;
use crate::env::AgentEnv;
use crate::error::{CoreError, Result};
use crate::model::{Dag, Node, NodeType, SubTask};
use crate::task::{Operator, TaskState};

pub struct Driver {
    env: Arc<AgentEnv>,
    maintainer: watch::Receiver<bool>,
    config: ExecutorConfig,
    shutdown: Arc<Notify>,
}

impl Driver {
    /// `maintainer` tells the driver whether this agent currently advances
    /// cluster dags.
    pub fn new(env: Arc<AgentEnv>, maintainer: watch::Receiver<bool>, config: ExecutorConfig) -> Self {
        Self {
            env,
            maintainer,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    pub async fn run(&self) {
        info!(
            agent = %self.env.agent,
            interval_ms = self.config.interval.as_millis() as u64,
            "Dag driver started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Dag driver received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Dag driver tick failed");
                    }
                }
            }
        }

        info!("Dag driver stopped");
    }

    /// Advance every schedulable dag by one step.
    pub async fn tick(&self) -> Result<()> {
        let include_cluster = *self.maintainer.borrow();
        let records = self
            .env
            .persistence
            .list_schedulable_dags(&self.env.agent, include_cluster)
            .await?;
        for record in records {
            if let Err(e) = self.advance(record.id).await {
                error!(dag_id = record.id, dag = %record.name, error = %e, "Failed to advance dag");
            }
        }
        Ok(())
    }

    async fn advance(&self, dag_id: i64) -> Result<()> {
        let Some(mut dag) = self.env.persistence.load_dag(dag_id).await? else {
            return Ok(());
        };
        if dag.is_terminal() {
            return Ok(());
        }
        if dag.state == TaskState::Ready {
            dag.state = TaskState::Running;
            dag.start_time.get_or_insert_with(Utc::now);
            dag.end_time = None;
            self.env.persistence.update_dag_progress(&dag).await?;
            info!(dag_id = %dag.generic_id(), dag = %dag.name, operator = %dag.operator, "Dag running");
        }
        let index = current_index(&dag)?;
        if dag.operator == Operator::Rollback {
            self.step_rollback(&mut dag, index).await
        } else {
            self.step_forward(&mut dag, index).await
        }
    }

    async fn step_forward(&self, dag: &mut Dag, index: usize) -> Result<()> {
        let cancelling = dag.operator == Operator::Cancel;
        match dag.nodes[index].state {
            TaskState::Pending | TaskState::Ready => {
                if cancelling {
                    return self.fail(dag, index, "cancelled before the node started").await;
                }
                self.start_node(dag, index).await?;
                self.dispatch(dag, index, false).await
            }
            TaskState::Running => match dag.nodes[index].aggregate() {
                TaskState::Succeed => self.complete_forward(dag, index).await,
                TaskState::Failed => self.fail(dag, index, "subtask failed").await,
                _ if cancelling => {
                    if dag.nodes[index].tasks.iter().any(|t| t.state == TaskState::Running) {
                        debug!(dag_id = %dag.generic_id(), "Waiting for cancelled subtasks to stop");
                        Ok(())
                    } else {
                        self.fail(dag, index, "cancelled").await
                    }
                }
                _ => self.dispatch(dag, index, false).await,
            },
            TaskState::Succeed => self.complete_forward(dag, index).await,
            TaskState::Failed => self.fail(dag, index, "node failed").await,
        }
    }

    async fn step_rollback(&self, dag: &mut Dag, index: usize) -> Result<()> {
        match dag.nodes[index].state {
            TaskState::Pending | TaskState::Ready => {
                self.start_node(dag, index).await?;
                self.dispatch(dag, index, true).await
            }
            TaskState::Running => match dag.nodes[index].aggregate_rollback() {
                TaskState::Succeed => self.complete_rollback(dag, index).await,
                TaskState::Failed => self.fail(dag, index, "rollback of a subtask failed").await,
                _ => self.dispatch(dag, index, true).await,
            },
            TaskState::Succeed => self.complete_rollback(dag, index).await,
            TaskState::Failed => self.fail(dag, index, "node rollback failed").await,
        }
    }

    async fn start_node(&self, dag: &mut Dag, index: usize) -> Result<()> {
        let node = &mut dag.nodes[index];
        node.state = TaskState::Running;
        node.start_time = Some(Utc::now());
        node.end_time = None;
        self.env.persistence.update_node(node).await?;
        debug!(
            dag_id = dag.id,
            stage = node.stage,
            node = %node.name,
            "Node started"
        );
        Ok(())
    }

    /// Hand PENDING subtasks to their executors. NORMAL nodes run one
    /// subtask at a time, in registration order (reverse order when rolling
    /// back); PARALLEL nodes release every subtask at once.
    async fn dispatch(&self, dag: &Dag, index: usize, rollback: bool) -> Result<()> {
        let node = &dag.nodes[index];
        let eligible = |t: &&SubTask| !rollback || t.operator == Operator::Rollback;
        let batch: Vec<&SubTask> = match node.node_type {
            NodeType::Parallel => node
                .tasks
                .iter()
                .filter(eligible)
                .filter(|t| t.state == TaskState::Pending)
                .collect(),
            NodeType::Normal => {
                let mut ordered: Vec<&SubTask> = node.tasks.iter().filter(eligible).collect();
                if rollback {
                    ordered.reverse();
                }
                ordered
                    .into_iter()
                    .find(|t| t.state != TaskState::Succeed)
                    .filter(|t| t.state == TaskState::Pending)
                    .into_iter()
                    .collect()
            }
        };

        for task in batch {
            let mut ready = task.clone();
            ready.context = dispatch_context(dag, node, task);
            if self.env.persistence.dispatch_task(&ready).await? {
                debug!(
                    dag_id = dag.id,
                    task_id = task.id,
                    task = %task.name,
                    executor = %task.executor,
                    operator = %task.operator,
                    "Subtask dispatched"
                );
            }
        }
        Ok(())
    }

    async fn complete_forward(&self, dag: &mut Dag, index: usize) -> Result<()> {
        finish_node(&mut dag.nodes[index], TaskState::Succeed);
        let node = &dag.nodes[index];
        self.env.persistence.update_node(node).await?;
        let node_context = node.context.clone();
        dag.context.merge_without_execute_agents(&node_context);

        if dag.stage >= dag.max_stage {
            dag.state = TaskState::Succeed;
            dag.end_time = Some(Utc::now());
            self.env.persistence.finish_dag(dag, true).await?;
            info!(dag_id = %dag.generic_id(), dag = %dag.name, operator = %dag.operator, "Dag succeeded");
        } else {
            dag.stage += 1;
            self.env.persistence.update_dag_progress(dag).await?;
            debug!(dag_id = dag.id, stage = dag.stage, "Dag advanced");
        }
        Ok(())
    }

    async fn complete_rollback(&self, dag: &mut Dag, index: usize) -> Result<()> {
        let node = &mut dag.nodes[index];
        node.state = TaskState::Succeed;
        node.end_time = Some(Utc::now());
        self.env.persistence.update_node(node).await?;

        if dag.stage <= 1 {
            dag.state = TaskState::Succeed;
            dag.end_time = Some(Utc::now());
            self.env.persistence.finish_dag(dag, true).await?;
            info!(dag_id = %dag.generic_id(), dag = %dag.name, "Dag rolled back");
        } else {
            dag.stage -= 1;
            self.env.persistence.update_dag_progress(dag).await?;
            debug!(dag_id = dag.id, stage = dag.stage, "Rollback moved to previous node");
        }
        Ok(())
    }

    async fn fail(&self, dag: &mut Dag, index: usize, reason: &str) -> Result<()> {
        let node = &mut dag.nodes[index];
        let returned = self.env.persistence.reset_ready_tasks(node.id).await?;
        node.state = TaskState::Failed;
        node.end_time = Some(Utc::now());
        self.env.persistence.update_node(node).await?;

        dag.state = TaskState::Failed;
        dag.end_time = Some(Utc::now());
        let release = dag.failure_exit_maintenance;
        self.env.persistence.finish_dag(dag, release).await?;
        warn!(
            dag_id = %dag.generic_id(),
            dag = %dag.name,
            stage = dag.stage,
            operator = %dag.operator,
            unclaimed = returned,
            lock_released = release,
            reason,
            "Dag failed"
        );
        Ok(())
    }
}

fn current_index(dag: &Dag) -> Result<usize> {
    usize::try_from(dag.stage - 1)
        .ok()
        .filter(|i| *i < dag.nodes.len())
        .ok_or_else(|| {
            CoreError::invalid_state(
                dag.generic_id(),
                format!("stage {} outside 1..={}", dag.stage, dag.nodes.len()),
            )
        })
}

/// Context a subtask starts with: the dag's, then the node's, then whatever
/// the subtask kept from earlier attempts.
fn dispatch_context(dag: &Dag, node: &Node, task: &SubTask) -> TaskContext {
    let mut context = dag.context.clone();
    context.merge(&node.context);
    context.merge(&task.context);
    context
}

/// Mark a node finished and fold its subtasks' contexts into it.
fn finish_node(node: &mut Node, state: TaskState) {
    for task in &node.tasks {
        node.context.merge(&task.context);
    }
    node.state = state;
    node.end_time = Some(Utc::now());
}
