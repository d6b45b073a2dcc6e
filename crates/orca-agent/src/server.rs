// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server for the agent RPC.
//!
//! ## Endpoints
//!
//! Dags, nodes and subtasks:
//! - `GET|POST /task/v1/dag/{generic_id}` - Detail / apply an operator
//! - `GET /task/v1/dag/maintain/agent` - Last dag locking this agent
//! - `GET /task/v1/dag/maintain` - Last dag locking the cluster
//! - `GET /task/v1/dags` - List dags (`unfinished`, `name`, `limit`)
//! - `GET|POST /task/v1/node/{generic_id}`
//! - `GET|POST /task/v1/task/{generic_id}`
//! - `GET /task/v1/task/{generic_id}/logs`
//!
//! Peer RPC:
//! - `POST /ob/v1/rpc/{action}` - Create a sub-dag
//! - `DELETE /observer/rpc` - Kill the local observer
//!
//! Agent and flows:
//! - `GET /api/v1/status`, `GET /api/v1/info`
//! - `POST /api/v1/ob/init`, `POST /api/v1/backup/config`
//! - `POST /api/v1/agent/scale_in`, `POST /api/v1/agent/scale_out`

use axum::Router;
use axum::routing::{delete, get, post};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::handlers::{self, AppState};

/// Create the RPC router.
pub fn router(state: AppState) -> Router {
    Router::new()
        // Dags
        .route("/task/v1/dag/maintain/agent", get(handlers::agent_maintenance_dag))
        .route("/task/v1/dag/maintain", get(handlers::cluster_maintenance_dag))
        .route("/task/v1/dag/{generic_id}", get(handlers::get_dag).post(handlers::operate_dag))
        .route("/task/v1/dags", get(handlers::list_dags))
        // Nodes and subtasks
        .route("/task/v1/node/{generic_id}", get(handlers::get_node).post(handlers::operate_node))
        .route("/task/v1/task/{generic_id}", get(handlers::get_task).post(handlers::operate_task))
        .route("/task/v1/task/{generic_id}/logs", get(handlers::task_logs))
        // Peer RPC
        .route("/ob/v1/rpc/{action}", post(handlers::create_sub_dag))
        .route("/observer/rpc", delete(handlers::kill_observer))
        // Agent
        .route("/api/v1/status", get(handlers::agent_status))
        .route("/api/v1/info", get(handlers::agent_info))
        // Flows
        .route("/api/v1/ob/init", post(handlers::init_cluster_dag))
        .route("/api/v1/backup/config", post(handlers::backup_config_dag))
        .route("/api/v1/agent/scale_in", post(handlers::scale_in_dag))
        .route("/api/v1/agent/scale_out", post(handlers::scale_out_dag))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Serve the RPC on `listener` until `shutdown` trips.
pub async fn serve(listener: TcpListener, state: AppState, shutdown: CancellationToken) -> std::io::Result<()> {
    let addr = listener.local_addr()?;
    info!(%addr, "RPC server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    info!("RPC server stopped");
    Ok(())
}
