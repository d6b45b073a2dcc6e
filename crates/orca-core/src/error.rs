// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for orca-core.
//!
//! Provides a unified error type that maps to RPC error responses.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur while building, persisting or driving dags.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// Dag, node, task or agent was not found in the store.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What was looked up (dag, node, task, agent).
        kind: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// A generic id could not be decoded.
    #[error("invalid generic id '{0}'")]
    InvalidGenericId(String),

    /// The requested operator is not permitted by a task's capability flags.
    #[error("operator {operator} not permitted: {reason}")]
    CapabilityViolation {
        /// The refused operator.
        operator: String,
        /// Which task refused and why.
        reason: String,
    },

    /// The entity is in a state that does not allow the request.
    #[error("invalid state for '{id}': {reason}")]
    InvalidState {
        /// Generic id of the entity.
        id: String,
        /// Why the request was refused.
        reason: String,
    },

    /// Another workflow holds an overlapping maintenance lock.
    #[error("maintenance lock held by dag '{holder}' ({name})")]
    MaintenanceConflict {
        /// Generic id of the dag holding the lock.
        holder: String,
        /// Name of the dag holding the lock.
        name: String,
    },

    /// A template or node invariant was violated while building a dag.
    #[error("build error: {0}")]
    Build(String),

    /// A concrete task type was not registered.
    #[error("unknown task type '{0}'")]
    UnknownTaskType(String),

    /// A remote task carrier was asked to execute.
    #[error("task '{0}' is owned by another agent and cannot execute here")]
    RemoteTaskNotExecutable(String),

    /// An agent identity transition is not permitted.
    #[error("identity transition {from} -> {to} not permitted")]
    IdentityTransition {
        /// Current identity.
        from: String,
        /// Requested identity.
        to: String,
    },

    /// Peer transport failed (connection refused, timeout, bad gateway).
    #[error("transport error talking to {agent}: {details}")]
    Transport {
        /// Peer agent address.
        agent: String,
        /// Error details.
        details: String,
    },

    /// Peer answered with an error body.
    #[error("remote error from {agent}: {code} - {message}")]
    Remote {
        /// Peer agent address.
        agent: String,
        /// Error code returned by the peer.
        code: String,
        /// Error message returned by the peer.
        message: String,
    },

    /// Input validation failed.
    #[error("validation error for '{field}': {message}")]
    Validation {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Database operation failed.
    #[error("database error during '{operation}': {details}")]
    Database {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "NOT_FOUND",
            Self::InvalidGenericId(_) => "INVALID_GENERIC_ID",
            Self::CapabilityViolation { .. } => "CAPABILITY_VIOLATION",
            Self::InvalidState { .. } => "INVALID_STATE",
            Self::MaintenanceConflict { .. } => "MAINTENANCE_CONFLICT",
            Self::Build(_) => "BUILD_ERROR",
            Self::UnknownTaskType(_) => "UNKNOWN_TASK_TYPE",
            Self::RemoteTaskNotExecutable(_) => "REMOTE_TASK_NOT_EXECUTABLE",
            Self::IdentityTransition { .. } => "IDENTITY_TRANSITION",
            Self::Transport { .. } => "TRANSPORT_ERROR",
            Self::Remote { .. } => "REMOTE_ERROR",
            Self::Validation { .. } => "VALIDATION_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
            Self::Database { .. } => "DATABASE_ERROR",
        }
    }

    /// Whether the error is a transient transport failure worth retrying.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transport { .. })
    }

    /// Shorthand for a not-found error.
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Self::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Shorthand for an invalid-state error.
    pub fn invalid_state(id: impl ToString, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            id: id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::Database {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::Database {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<reqwest::Error> for CoreError {
    fn from(err: reqwest::Error) -> Self {
        let agent = err
            .url()
            .and_then(|u| u.host_str().map(|h| format!("{}:{}", h, u.port().unwrap_or(80))))
            .unwrap_or_else(|| "peer".to_string());
        if err.is_decode() {
            CoreError::Serialization(err.to_string())
        } else {
            CoreError::Transport {
                agent,
                details: err.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}
