// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orca-agent.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use orca_core::CoreError;
use orca_core::remote::ErrorBody;
use thiserror::Error;

use crate::config::ConfigError;
use crate::observer::ObserverError;

/// Errors raised while assembling the agent or building its flows.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Observer(#[from] ObserverError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The RPC listener could not be bound or failed while serving.
    #[error("server error: {0}")]
    Server(#[from] std::io::Error),
}

/// Failure of an RPC handler, answered as an [`ErrorBody`].
#[derive(Debug)]
pub enum ApiError {
    Core(CoreError),
    Observer(ObserverError),
    Internal(String),
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Core(err) => match err {
                CoreError::NotFound { .. } => StatusCode::NOT_FOUND,
                CoreError::InvalidGenericId(_) | CoreError::Validation { .. } | CoreError::Build(_) => {
                    StatusCode::BAD_REQUEST
                }
                CoreError::CapabilityViolation { .. }
                | CoreError::InvalidState { .. }
                | CoreError::MaintenanceConflict { .. }
                | CoreError::IdentityTransition { .. } => StatusCode::CONFLICT,
                CoreError::Transport { .. } | CoreError::Remote { .. } => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            Self::Observer(_) => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn body(&self) -> ErrorBody {
        match self {
            Self::Core(err) => ErrorBody::from(err),
            Self::Observer(err) => ErrorBody {
                code: "OBSERVER_ERROR".to_string(),
                message: err.to_string(),
            },
            Self::Internal(message) => ErrorBody {
                code: "INTERNAL_ERROR".to_string(),
                message: message.clone(),
            },
        }
    }
}

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self::Core(err)
    }
}

impl From<ObserverError> for ApiError {
    fn from(err: ObserverError) -> Self {
        Self::Observer(err)
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::Core(e) => Self::Core(e),
            AgentError::Observer(e) => Self::Observer(e),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = self.body();
        if status.is_server_error() {
            tracing::error!(code = %body.code, error = %body.message, "Request failed");
        }
        (status, Json(body)).into_response()
    }
}

/// Result type of RPC handlers.
pub type ApiResult<T> = std::result::Result<T, ApiError>;
