// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Executes the subtasks assigned to this agent.
//!
//! The runner claims READY subtasks whose executor is this agent, runs their
//! bodies on a bounded pool, and writes the outcome back. It also trips the
//! cancellation token of an in-flight subtask once the store shows a CANCEL
//! operator for it, wherever that operator was issued.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Notify, OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::ExecutorConfig;
use crate::env::AgentEnv;
use crate::error::Result;
use crate::model::SubTask;
use crate::task::{Operator, TaskError, TaskRuntime, TaskState};

pub struct Runner {
    env: Arc<AgentEnv>,
    config: ExecutorConfig,
    permits: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashMap<i64, CancellationToken>>>,
    shutdown: Arc<Notify>,
}

impl Runner {
    pub fn new(env: Arc<AgentEnv>, config: ExecutorConfig) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(config.max_parallel_tasks.max(1))),
            env,
            config,
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Recover, then claim and watch subtasks until shutdown.
    pub async fn run(&self) {
        info!(
            agent = %self.env.agent,
            max_parallel_tasks = self.config.max_parallel_tasks,
            "Task runner started"
        );

        if let Err(e) = self.recover().await {
            error!(error = %e, "Failed to recover interrupted subtasks");
        }

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Task runner received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Task runner tick failed");
                    }
                }
            }
        }

        let in_flight = self.in_flight.lock().await;
        if !in_flight.is_empty() {
            warn!(count = in_flight.len(), "Task runner stopped with subtasks still running");
        }
        info!("Task runner stopped");
    }

    /// Put subtasks that were RUNNING when this agent stopped back in line.
    ///
    /// Subtasks that allow it return to READY and are executed again;
    /// the others fail with a note in their execute-log.
    pub async fn recover(&self) -> Result<usize> {
        let persistence = &self.env.persistence;
        let interrupted = persistence
            .list_tasks_in_state(&self.env.agent, TaskState::Running)
            .await?;
        let mut recovered = 0;
        for record in interrupted {
            if record.can_continue {
                if persistence
                    .transition_task(record.id, TaskState::Running, TaskState::Ready)
                    .await?
                {
                    recovered += 1;
                    info!(task_id = record.id, task = %record.name, "Recovered interrupted subtask");
                }
            } else if persistence
                .transition_task(record.id, TaskState::Running, TaskState::Failed)
                .await?
            {
                persistence
                    .append_task_log(
                        record.id,
                        record.execute_times,
                        "agent restarted while the subtask was running and it cannot continue",
                    )
                    .await?;
                warn!(task_id = record.id, task = %record.name, "Interrupted subtask cannot continue");
            }
        }
        Ok(recovered)
    }

    /// Propagate cancellations, then claim as many READY subtasks as there
    /// are free slots.
    pub async fn tick(&self) -> Result<()> {
        self.propagate_cancellations().await?;

        let free = self.permits.available_permits();
        if free == 0 {
            return Ok(());
        }
        let ready = self
            .env
            .persistence
            .list_ready_tasks(&self.env.agent, free as i64)
            .await?;
        for record in ready {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let mut task = record.into_model()?;
            let started_at = Utc::now();
            if !self.env.persistence.claim_task(task.id, started_at).await? {
                continue;
            }
            task.state = TaskState::Running;
            task.execute_times += 1;
            task.start_time = Some(started_at);

            let token = CancellationToken::new();
            self.in_flight.lock().await.insert(task.id, token.clone());
            let env = self.env.clone();
            let in_flight = self.in_flight.clone();
            tokio::spawn(async move {
                let task_id = task.id;
                execute(env, task, token, permit).await;
                in_flight.lock().await.remove(&task_id);
            });
        }
        Ok(())
    }

    async fn propagate_cancellations(&self) -> Result<()> {
        let ids: Vec<i64> = self.in_flight.lock().await.keys().copied().collect();
        if ids.is_empty() {
            return Ok(());
        }
        let operators = self.env.persistence.task_operators(&ids).await?;
        let in_flight = self.in_flight.lock().await;
        for (task_id, operator) in operators {
            if operator == Operator::Cancel.as_i32()
                && let Some(token) = in_flight.get(&task_id)
                && !token.is_cancelled()
            {
                info!(task_id, "Cancelling running subtask");
                token.cancel();
            }
        }
        Ok(())
    }

    /// Number of subtasks currently executing.
    pub async fn in_flight(&self) -> usize {
        self.in_flight.lock().await.len()
    }
}

/// Run one claimed subtask to completion and record its outcome.
async fn execute(env: Arc<AgentEnv>, task: SubTask, token: CancellationToken, _permit: OwnedSemaphorePermit) {
    let dag = match env.persistence.load_dag(task.dag_id).await {
        Ok(Some(dag)) => dag,
        Ok(None) => {
            error!(task_id = task.id, dag_id = task.dag_id, "Dag of claimed subtask disappeared");
            let missing = TaskError::failed(format!("dag {} of subtask {} not found", task.dag_id, task.id));
            finish(&env, &task, Err(missing), &task.context).await;
            return;
        }
        Err(e) => {
            error!(task_id = task.id, error = %e, "Failed to load dag of claimed subtask");
            finish(&env, &task, Err(TaskError::from(e)), &task.context).await;
            return;
        }
    };

    let body = match env.registry.instantiate(&task.struct_name, &task.executor, &env.agent) {
        Ok(body) => body,
        Err(e) => {
            finish(&env, &task, Err(TaskError::from(e)), &task.context).await;
            return;
        }
    };

    let rollback = task.operator == Operator::Rollback;
    let runtime = Arc::new(TaskRuntime::new(
        dag.task_meta(&task),
        dag.meta(),
        task.context.clone(),
        task.additional_data.clone(),
        token,
        env.clone(),
    ));
    debug!(
        task_id = task.id,
        task = %task.name,
        operator = %task.operator,
        attempt = task.execute_times,
        "Executing subtask"
    );

    // A panicking body is a failed subtask, never a success.
    let handle = tokio::spawn({
        let runtime = runtime.clone();
        async move {
            if rollback {
                body.rollback(&runtime).await
            } else {
                body.execute(&runtime).await
            }
        }
    });
    let outcome = match handle.await {
        Ok(outcome) => outcome,
        Err(e) => Err(TaskError::failed(format!("task body panicked: {}", e))),
    };

    let context = runtime.context().await.clone();
    finish(&env, &task, outcome, &context).await;
}

async fn finish(
    env: &AgentEnv,
    task: &SubTask,
    outcome: std::result::Result<(), TaskError>,
    context: &crate::context::TaskContext,
) {
    let state = match &outcome {
        Ok(()) => TaskState::Succeed,
        Err(e) => {
            let what = if task.operator == Operator::Rollback {
                "rollback"
            } else {
                "execution"
            };
            let line = format!("{} failed: {}", what, e);
            if let Err(log_err) = env
                .persistence
                .append_task_log(task.id, task.execute_times, &line)
                .await
            {
                warn!(task_id = task.id, error = %log_err, "Failed to persist execute-log line");
            }
            warn!(task_id = task.id, task = %task.name, error = %e, "Subtask failed");
            TaskState::Failed
        }
    };

    match env
        .persistence
        .complete_task(task.id, state, context, Utc::now())
        .await
    {
        Ok(true) => debug!(task_id = task.id, state = %state, "Subtask finished"),
        Ok(false) => warn!(task_id = task.id, "Subtask left RUNNING before its outcome was written"),
        Err(e) => error!(task_id = task.id, error = %e, "Failed to write subtask outcome"),
    }
}
