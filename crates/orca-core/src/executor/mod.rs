// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dag execution: the driver that advances dags and the runner that executes
//! subtasks.

mod driver;
mod runner;

pub use driver::Driver;
pub use runner::Runner;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tracing::warn;

use crate::env::AgentEnv;

/// Configuration for the driver and the runner.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Sleep between two ticks.
    pub interval: Duration,
    /// Upper bound on subtasks executing at once on this agent.
    pub max_parallel_tasks: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_parallel_tasks: 8,
        }
    }
}

/// Running driver and runner loops of one agent.
pub struct ExecutorHandle {
    shutdown: Vec<Arc<Notify>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ExecutorHandle {
    /// Spawn the runner (which recovers interrupted subtasks first) and the
    /// driver.
    pub fn spawn(env: Arc<AgentEnv>, maintainer: watch::Receiver<bool>, config: ExecutorConfig) -> Self {
        let runner = Runner::new(env.clone(), config.clone());
        let driver = Driver::new(env, maintainer, config);
        let shutdown = vec![runner.shutdown_handle(), driver.shutdown_handle()];
        let tasks = vec![
            tokio::spawn(async move { runner.run().await }),
            tokio::spawn(async move { driver.run().await }),
        ];
        Self { shutdown, tasks }
    }

    /// Signal both loops and wait for them to stop.
    pub async fn shutdown(self) {
        for notify in &self.shutdown {
            notify.notify_one();
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Executor loop ended abnormally");
            }
        }
    }
}
