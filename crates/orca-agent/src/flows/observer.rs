// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observer lifecycle steps on the executing agent.

use std::sync::Arc;

use async_trait::async_trait;
use orca_core::{CoreError, TaskBody, TaskError, TaskRegistry, TaskRuntime};

use super::register_with_ops;
use crate::observer::ObserverOps;

pub const DEPLOY: &str = "DeployTask";
pub const DESTROY: &str = "DestroyTask";
pub const START_OBSERVER: &str = "StartObserverTask";
pub const STOP_OBSERVER: &str = "StopObserverTask";

/// Param naming the package version to deploy.
pub const VERSION: &str = "version";

pub(super) fn register(registry: &mut TaskRegistry, ops: &Arc<dyn ObserverOps>) {
    register_with_ops(registry, ops, DEPLOY, |ops| DeployTask { ops });
    register_with_ops(registry, ops, DESTROY, |ops| DestroyTask { ops });
    register_with_ops(registry, ops, START_OBSERVER, |ops| StartObserverTask { ops });
    register_with_ops(registry, ops, STOP_OBSERVER, |ops| StopObserverTask { ops });
}

/// Deploys the `version` param, or the version this agent is registered
/// with.
pub struct DeployTask {
    ops: Arc<dyn ObserverOps>,
}

impl DeployTask {
    async fn version(&self, rt: &TaskRuntime) -> Result<String, TaskError> {
        if let Some(version) = rt.context().await.param::<String>(VERSION).into_option() {
            return Ok(version);
        }
        let key = rt.agent().key();
        let record = rt
            .env()
            .persistence
            .get_agent(&key)
            .await?
            .ok_or_else(|| CoreError::not_found("agent", &key))?;
        Ok(record.version)
    }
}

#[async_trait]
impl TaskBody for DeployTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        let version = self.version(rt).await?;
        rt.log(format!("deploying observer {}", version)).await;
        self.ops.deploy(&version).await?;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("removing deployed observer").await;
        self.ops.destroy().await?;
        Ok(())
    }
}

pub struct DestroyTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for DestroyTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("destroying observer").await;
        self.ops.destroy().await?;
        Ok(())
    }
}

/// Starts the observer and waits until it answers.
pub struct StartObserverTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for StartObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("starting observer").await;
        self.ops.start_observer().await?;
        let ops = self.ops.clone();
        rt.poll_until("observer to come up", || {
            let ops = ops.clone();
            async move { Ok::<_, TaskError>(ops.is_observer_alive().await?.then_some(())) }
        })
        .await?;
        rt.log("observer is alive").await;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("stopping observer").await;
        self.ops.stop_observer().await?;
        Ok(())
    }
}

pub struct StopObserverTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for StopObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("stopping observer").await;
        self.ops.stop_observer().await?;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        rt.log("restarting observer").await;
        self.ops.start_observer().await?;
        Ok(())
    }
}
