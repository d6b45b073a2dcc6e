// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! RPC handlers.
//!
//! Handlers validate their input, call into [`TaskService`] or a flow, and
//! answer with JSON. Every failure is an [`ApiError`] carrying an
//! [`ErrorBody`](orca_core::remote::ErrorBody).
//!
//! [`TaskService`]: orca_core::TaskService

use std::sync::Arc;
use std::time::Instant;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use orca_core::persistence::{DagFilter, TaskLogRecord};
use orca_core::remote::{KillObserverRequest, OperatorRequest, SubDagRequest, SubDagResponse, accept_sub_dag};
use orca_core::{AgentEnv, AgentStatus, DagDetail, EntityKind, NodeDetail, SubDagAction, TaskContext, TaskDetail};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{info, instrument, warn};

use crate::error::ApiResult;
use crate::flows::backup::{BackupConfig, backup_config};
use crate::flows::init::{InitClusterRequest, init_cluster};
use crate::flows::scale::{ScaleInRequest, ScaleOutRequest, scale_in, scale_out};
use crate::flows::action_template;
use crate::observer::ObserverOps;

/// Shared state of every handler.
#[derive(Clone)]
pub struct AppState {
    pub env: Arc<AgentEnv>,
    pub ops: Arc<dyn ObserverOps>,
    /// Whether this agent currently advances cluster dags.
    pub maintainer: watch::Receiver<bool>,
    pub started: Instant,
    pub version: String,
    pub home_path: String,
}

impl AppState {
    pub fn new(
        env: Arc<AgentEnv>,
        ops: Arc<dyn ObserverOps>,
        maintainer: watch::Receiver<bool>,
        version: impl Into<String>,
        home_path: impl Into<String>,
    ) -> Self {
        Self {
            env,
            ops,
            maintainer,
            started: Instant::now(),
            version: version.into(),
            home_path: home_path.into(),
        }
    }
}

// ============================================================================
// Dags, nodes and subtasks
// ============================================================================

#[instrument(skip(state))]
pub async fn get_dag(State(state): State<AppState>, Path(generic_id): Path<String>) -> ApiResult<Json<DagDetail>> {
    Ok(Json(state.env.service.dag_detail(&generic_id).await?))
}

#[instrument(skip(state))]
pub async fn operate_dag(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
    Json(request): Json<OperatorRequest>,
) -> ApiResult<Json<DagDetail>> {
    let service = &state.env.service;
    let dag = service
        .apply_operator(EntityKind::Dag, &generic_id, request.operator)
        .await?;
    info!(dag_id = %generic_id, operator = %request.operator, "Operator applied");
    Ok(Json(service.detail(&dag).await?))
}

#[instrument(skip(state))]
pub async fn get_node(State(state): State<AppState>, Path(generic_id): Path<String>) -> ApiResult<Json<NodeDetail>> {
    Ok(Json(state.env.service.node_detail(&generic_id).await?))
}

#[instrument(skip(state))]
pub async fn operate_node(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
    Json(request): Json<OperatorRequest>,
) -> ApiResult<Json<NodeDetail>> {
    let service = &state.env.service;
    service
        .apply_operator(EntityKind::Node, &generic_id, request.operator)
        .await?;
    Ok(Json(service.node_detail(&generic_id).await?))
}

#[instrument(skip(state))]
pub async fn get_task(State(state): State<AppState>, Path(generic_id): Path<String>) -> ApiResult<Json<TaskDetail>> {
    Ok(Json(state.env.service.task_detail(&generic_id).await?))
}

#[instrument(skip(state))]
pub async fn operate_task(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
    Json(request): Json<OperatorRequest>,
) -> ApiResult<Json<TaskDetail>> {
    let service = &state.env.service;
    service
        .apply_operator(EntityKind::Task, &generic_id, request.operator)
        .await?;
    Ok(Json(service.task_detail(&generic_id).await?))
}

#[instrument(skip(state))]
pub async fn task_logs(
    State(state): State<AppState>,
    Path(generic_id): Path<String>,
) -> ApiResult<Json<Vec<TaskLogRecord>>> {
    Ok(Json(state.env.service.task_logs(&generic_id).await?))
}

/// Query of `GET /task/v1/dags`.
#[derive(Debug, Default, Deserialize)]
pub struct ListDagsQuery {
    #[serde(default)]
    pub unfinished: bool,
    pub name: Option<String>,
    pub limit: Option<i64>,
}

#[instrument(skip(state))]
pub async fn list_dags(
    State(state): State<AppState>,
    Query(query): Query<ListDagsQuery>,
) -> ApiResult<Json<Vec<DagDetail>>> {
    let mut filter = DagFilter {
        unfinished_only: query.unfinished,
        name: query.name,
        ..DagFilter::default()
    };
    if let Some(limit) = query.limit {
        filter.limit = limit.clamp(1, 1000);
    }
    Ok(Json(state.env.service.list_dags(&filter).await?))
}

async fn maintenance_dag(state: &AppState, local: bool) -> ApiResult<Json<Option<DagDetail>>> {
    let service = &state.env.service;
    let detail = match service.last_maintenance_dag(local).await? {
        Some(dag) => Some(service.detail(&dag).await?),
        None => None,
    };
    Ok(Json(detail))
}

/// Last dag holding a lock in this agent's own namespace.
pub async fn agent_maintenance_dag(State(state): State<AppState>) -> ApiResult<Json<Option<DagDetail>>> {
    maintenance_dag(&state, true).await
}

/// Last dag holding a cluster lock.
pub async fn cluster_maintenance_dag(State(state): State<AppState>) -> ApiResult<Json<Option<DagDetail>>> {
    maintenance_dag(&state, false).await
}

// ============================================================================
// Peer RPC
// ============================================================================

#[instrument(skip(state, request), fields(main_dag_id = %request.main_dag_id))]
pub async fn create_sub_dag(
    State(state): State<AppState>,
    Path(action): Path<String>,
    Json(request): Json<SubDagRequest>,
) -> ApiResult<Json<SubDagResponse>> {
    let action: SubDagAction = action.parse()?;
    let response = accept_sub_dag(&state.env, action, Some(action_template(action)?), &request).await?;
    info!(%action, dag_id = %response.generic_id, main_agent = %request.main_agent, "Sub-dag accepted");
    Ok(Json(response))
}

#[instrument(skip(state))]
pub async fn kill_observer(
    State(state): State<AppState>,
    Json(request): Json<KillObserverRequest>,
) -> ApiResult<StatusCode> {
    warn!(force_kill = request.force_kill, "Killing observer on request");
    state.ops.kill_observer(request.force_kill).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ============================================================================
// Agent status
// ============================================================================

async fn status(state: &AppState) -> AgentStatus {
    let env = &state.env;
    let store_healthy = match env.persistence.health_check().await {
        Ok(()) => true,
        Err(e) => {
            warn!(error = %e, "Store health check failed");
            false
        }
    };
    let identity = if store_healthy {
        match env.identity.load().await {
            Ok(identity) => identity,
            Err(e) => {
                warn!(error = %e, "Could not refresh agent identity");
                env.identity.current()
            }
        }
    } else {
        env.identity.current()
    };
    AgentStatus {
        agent: env.agent.to_string(),
        identity,
        version: state.version.clone(),
        home_path: state.home_path.clone(),
        is_maintainer: *state.maintainer.borrow(),
        uptime_secs: state.started.elapsed().as_secs(),
        store_healthy,
    }
}

pub async fn agent_status(State(state): State<AppState>) -> Json<AgentStatus> {
    Json(status(&state).await)
}

/// Body of `GET /api/v1/info`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInfo {
    #[serde(flatten)]
    pub status: AgentStatus,
    pub observer: String,
    /// Every task type this agent can execute.
    pub task_types: Vec<String>,
}

pub async fn agent_info(State(state): State<AppState>) -> Json<AgentInfo> {
    Json(AgentInfo {
        status: status(&state).await,
        observer: state.ops.kind().to_string(),
        task_types: state
            .env
            .registry
            .struct_names()
            .into_iter()
            .map(str::to_string)
            .collect(),
    })
}

// ============================================================================
// Flows
// ============================================================================

#[instrument(skip(state))]
pub async fn init_cluster_dag(
    State(state): State<AppState>,
    Json(request): Json<InitClusterRequest>,
) -> ApiResult<Json<DagDetail>> {
    let (template, context) = init_cluster(&state.env.agent, &request)?;
    created(&state, template, context).await
}

#[instrument(skip(state))]
pub async fn backup_config_dag(
    State(state): State<AppState>,
    Json(request): Json<BackupConfig>,
) -> ApiResult<Json<DagDetail>> {
    let template = backup_config(state.ops.as_ref(), &request).await?;
    created(&state, template, TaskContext::new()).await
}

#[instrument(skip(state))]
pub async fn scale_in_dag(
    State(state): State<AppState>,
    Json(request): Json<ScaleInRequest>,
) -> ApiResult<Json<DagDetail>> {
    let template = scale_in(&state.env, &request).await?;
    created(&state, template, TaskContext::new()).await
}

#[instrument(skip(state))]
pub async fn scale_out_dag(
    State(state): State<AppState>,
    Json(request): Json<ScaleOutRequest>,
) -> ApiResult<Json<DagDetail>> {
    let template = scale_out(&state.env, &request).await?;
    created(&state, template, TaskContext::new()).await
}

async fn created(
    state: &AppState,
    template: orca_core::Template,
    context: TaskContext,
) -> ApiResult<Json<DagDetail>> {
    let service = &state.env.service;
    let dag = service.create_dag(&template, context).await?;
    info!(dag_id = %dag.generic_id(), name = %dag.name, "Dag created");
    Ok(Json(service.detail(&dag).await?))
}
