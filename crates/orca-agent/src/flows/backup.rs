// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backup destination configuration for user tenants.
//!
//! Destinations are laid out per cluster and tenant:
//! `{dest}/{cluster_id}/{tenant_id}/archivelog` and `.../data`. Every
//! destination is checked before any tenant is reconfigured.

use std::sync::Arc;

use async_trait::async_trait;
use orca_core::{
    CoreError, Maintainer, NodeTemplate, TaskBody, TaskError, TaskRegistry, TaskRuntime, Template, TemplateBuilder,
};
use serde::{Deserialize, Serialize};

use super::{data_of, register_with_ops, task};
use crate::error::AgentError;
use crate::observer::{ObserverOps, Tenant};

pub const CHECK_PATH: &str = "CheckPathTask";
pub const SET_BACKUP_CONFIG: &str = "SetBackupConfigTask";

pub const LOG_ARCHIVE_DEST: &str = "LOG_ARCHIVE_DEST";
pub const LOG_ARCHIVE_DEST_STATE: &str = "LOG_ARCHIVE_DEST_STATE";
pub const DATA_BACKUP_DEST: &str = "DATA_BACKUP_DEST";

/// Data key holding the values a configuration replaced.
const PREVIOUS_CONFIG: &str = "previous_backup_config";

pub(super) fn register(registry: &mut TaskRegistry, ops: &Arc<dyn ObserverOps>) {
    register_with_ops(registry, ops, CHECK_PATH, |ops| CheckPathTask { ops });
    register_with_ops(registry, ops, SET_BACKUP_CONFIG, |ops| SetBackupConfigTask { ops });
}

/// Body of `POST /api/v1/backup/config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupConfig {
    /// Configure every user tenant; `tenants` is ignored.
    #[serde(default)]
    pub all_user_tenants: bool,
    #[serde(default)]
    pub tenants: Vec<String>,
    pub archive_dest: String,
    pub data_dest: String,
}

/// Destinations of one tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupTarget {
    pub tenant: Tenant,
    pub archive_uri: String,
    pub data_uri: String,
}

impl BackupTarget {
    fn new(request: &BackupConfig, cluster_id: i64, tenant: Tenant) -> Self {
        let uri = |dest: &str, leaf: &str| format!("{}/{}/{}/{}", dest.trim_end_matches('/'), cluster_id, tenant.id, leaf);
        Self {
            archive_uri: uri(&request.archive_dest, "archivelog"),
            data_uri: uri(&request.data_dest, "data"),
            tenant,
        }
    }

    /// Config entries applied to the tenant, in order.
    fn entries(&self) -> [(&'static str, String); 3] {
        [
            (LOG_ARCHIVE_DEST, format!("location={}", self.archive_uri)),
            (LOG_ARCHIVE_DEST_STATE, "ENABLE".to_string()),
            (DATA_BACKUP_DEST, self.data_uri.clone()),
        ]
    }
}

/// A config value as it was before the dag changed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SavedConfig {
    tenant: Tenant,
    key: String,
    value: Option<String>,
}

/// Tenants selected by `request`, in observer order.
async fn select_tenants(ops: &dyn ObserverOps, request: &BackupConfig) -> Result<Vec<Tenant>, AgentError> {
    let tenants = ops.list_user_tenants().await?;
    let selected = if request.all_user_tenants {
        tenants
    } else {
        let mut selected = Vec::with_capacity(request.tenants.len());
        for name in &request.tenants {
            let tenant = tenants
                .iter()
                .find(|t| &t.name == name)
                .ok_or_else(|| CoreError::not_found("tenant", name))?;
            selected.push(tenant.clone());
        }
        selected
    };
    if selected.is_empty() {
        return Err(CoreError::Validation {
            field: "tenants".to_string(),
            message: "no tenant selected".to_string(),
        }
        .into());
    }
    Ok(selected)
}

/// Template checking and then applying the destinations of `request`.
pub async fn backup_config(ops: &dyn ObserverOps, request: &BackupConfig) -> Result<Template, AgentError> {
    for (field, dest) in [("archiveDest", &request.archive_dest), ("dataDest", &request.data_dest)] {
        if dest.trim().is_empty() {
            return Err(CoreError::Validation {
                field: field.to_string(),
                message: "destination must not be empty".to_string(),
            }
            .into());
        }
    }
    let tenants = select_tenants(ops, request).await?;
    let cluster_id = ops.cluster_id().await?;
    let targets: Vec<BackupTarget> = tenants
        .into_iter()
        .map(|tenant| BackupTarget::new(request, cluster_id, tenant))
        .collect();

    let check_task = |target: &BackupTarget| -> Result<_, AgentError> {
        Ok(task(CHECK_PATH, format!("check backup paths of {}", target.tenant.name))
            .with_additional_data(serde_json::to_value(target).map_err(CoreError::from)?))
    };
    let mut check = NodeTemplate::parallel(check_task(&targets[0])?).named("check backup paths");
    for target in &targets[1..] {
        check.add_task(check_task(target)?)?;
    }
    let set = task(SET_BACKUP_CONFIG, "set backup config")
        .with_additional_data(serde_json::to_value(&targets).map_err(CoreError::from)?);

    Ok(TemplateBuilder::new("Set backup config")
        .add_node(check)
        .add_node(NodeTemplate::normal(set))
        .maintenance(Maintainer::global())
        .build()?)
}

pub struct CheckPathTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for CheckPathTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        let target: BackupTarget = data_of(rt)?;
        for uri in [&target.archive_uri, &target.data_uri] {
            rt.check()?;
            rt.log(format!("checking {}", uri)).await;
            self.ops.check_path(uri).await?;
        }
        Ok(())
    }
}

/// Applies every target. The replaced values are saved on the first attempt
/// and written back on rollback.
pub struct SetBackupConfigTask {
    ops: Arc<dyn ObserverOps>,
}

#[async_trait]
impl TaskBody for SetBackupConfigTask {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        let targets: Vec<BackupTarget> = data_of(rt)?;

        let saved = rt.context().await.data::<Vec<SavedConfig>>(PREVIOUS_CONFIG).is_set();
        if !saved {
            let mut previous = Vec::new();
            for target in &targets {
                for (key, _) in target.entries() {
                    previous.push(SavedConfig {
                        tenant: target.tenant.clone(),
                        key: key.to_string(),
                        value: self.ops.tenant_config(&target.tenant, key).await?,
                    });
                }
            }
            rt.context().await.set_data(PREVIOUS_CONFIG, &previous)?;
        }

        for target in &targets {
            for (key, value) in target.entries() {
                rt.check()?;
                self.ops.set_tenant_config(&target.tenant, key, &value).await?;
            }
            rt.log(format!("tenant {} archives to {}", target.tenant.name, target.archive_uri))
                .await;
        }
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> Result<(), TaskError> {
        let previous = rt
            .context()
            .await
            .data::<Vec<SavedConfig>>(PREVIOUS_CONFIG)
            .into_option()
            .unwrap_or_default();
        for saved in previous.iter().rev() {
            let value = saved.value.as_deref().unwrap_or("");
            self.ops.set_tenant_config(&saved.tenant, &saved.key, value).await?;
        }
        rt.log(format!("restored {} config values", previous.len())).await;
        Ok(())
    }
}
