// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handle given to a task body while it runs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Operator, TaskError};
use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::env::AgentEnv;
use crate::error::CoreError;

/// Identity of the running task.
#[derive(Debug, Clone)]
pub struct TaskMeta {
    pub id: i64,
    pub generic_id: String,
    pub node_id: i64,
    pub name: String,
    pub struct_name: String,
    pub operator: Operator,
    pub execute_times: i32,
    pub executor: AgentAddr,
}

/// The dag the running task belongs to, as of dispatch.
#[derive(Debug, Clone)]
pub struct DagMeta {
    pub id: i64,
    pub generic_id: String,
    pub name: String,
    pub dag_type: String,
    pub stage: i32,
    pub max_stage: i32,
    pub is_local: bool,
    pub owner: AgentAddr,
}

pub struct TaskRuntime {
    task: TaskMeta,
    dag: DagMeta,
    context: Mutex<TaskContext>,
    additional_data: Option<Value>,
    cancel: CancellationToken,
    env: Arc<AgentEnv>,
}

impl TaskRuntime {
    pub fn new(
        task: TaskMeta,
        dag: DagMeta,
        context: TaskContext,
        additional_data: Option<Value>,
        cancel: CancellationToken,
        env: Arc<AgentEnv>,
    ) -> Self {
        Self {
            task,
            dag,
            context: Mutex::new(context),
            additional_data,
            cancel,
            env,
        }
    }

    pub fn task(&self) -> &TaskMeta {
        &self.task
    }

    pub fn dag(&self) -> &DagMeta {
        &self.dag
    }

    pub fn env(&self) -> &Arc<AgentEnv> {
        &self.env
    }

    /// The agent this task executes on.
    pub fn agent(&self) -> &AgentAddr {
        &self.env.agent
    }

    pub fn operator(&self) -> Operator {
        self.task.operator
    }

    pub fn is_rollback(&self) -> bool {
        self.task.operator == Operator::Rollback
    }

    pub fn additional_data(&self) -> Option<&Value> {
        self.additional_data.as_ref()
    }

    pub async fn context(&self) -> MutexGuard<'_, TaskContext> {
        self.context.lock().await
    }

    pub fn into_context(self) -> TaskContext {
        self.context.into_inner()
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Append a line to the task's execute-log.
    pub async fn log(&self, line: impl Into<String>) {
        let line = line.into();
        info!(
            task_id = self.task.id,
            dag_id = self.dag.id,
            execute_times = self.task.execute_times,
            "{}",
            line
        );
        if let Err(e) = self
            .env
            .persistence
            .append_task_log(self.task.id, self.task.execute_times, &line)
            .await
        {
            warn!(task_id = self.task.id, error = %e, "Failed to persist execute-log line");
        }
    }

    /// Cooperative cancellation point. Returns `Cancelled` once the task has
    /// been marked CANCEL.
    pub fn check(&self) -> Result<(), TaskError> {
        if self.cancel.is_cancelled() {
            Err(TaskError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep, waking early with `Cancelled` if the task is cancelled.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TaskError> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TaskError::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Run `step` until it yields a value, sleeping the poll interval between
    /// attempts. Gives up after the configured number of attempts.
    pub async fn poll_until<T, F, Fut>(&self, what: &str, mut step: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Option<T>, TaskError>>,
    {
        let policy = self.env.poll;
        for attempt in 0..policy.max_attempts {
            self.check()?;
            if let Some(value) = step().await? {
                return Ok(value);
            }
            if attempt + 1 < policy.max_attempts {
                self.sleep(policy.interval).await?;
            }
        }
        Err(TaskError::Timeout {
            what: what.to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Call `op` under the agent's peer retry budget.
    pub async fn with_retry<T, F, Fut>(&self, what: &str, op: F) -> Result<T, TaskError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        self.env.retry.run(&self.cancel, what, op).await
    }
}
