// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task state machine, capability flags and the task body contract.

mod registry;
mod runtime;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::context::ContextError;
use crate::error::CoreError;

pub use registry::{TaskRegistry, TaskType};
pub use runtime::{DagMeta, TaskMeta, TaskRuntime};

/// State of a task, node or dag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Pending,
    Ready,
    Running,
    Failed,
    Succeed,
}

impl TaskState {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Pending => 1,
            Self::Ready => 2,
            Self::Running => 3,
            Self::Failed => 4,
            Self::Succeed => 5,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Ready),
            3 => Some(Self::Running),
            4 => Some(Self::Failed),
            5 => Some(Self::Succeed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeed | Self::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Ready => "READY",
            Self::Running => "RUNNING",
            Self::Failed => "FAILED",
            Self::Succeed => "SUCCEED",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the last transition happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operator {
    Run,
    Retry,
    Rollback,
    Cancel,
    Pass,
}

impl Operator {
    pub fn as_i32(self) -> i32 {
        match self {
            Self::Run => 1,
            Self::Retry => 2,
            Self::Rollback => 3,
            Self::Cancel => 4,
            Self::Pass => 5,
        }
    }

    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            1 => Some(Self::Run),
            2 => Some(Self::Retry),
            3 => Some(Self::Rollback),
            4 => Some(Self::Cancel),
            5 => Some(Self::Pass),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Run => "RUN",
            Self::Retry => "RETRY",
            Self::Rollback => "ROLLBACK",
            Self::Cancel => "CANCEL",
            Self::Pass => "PASS",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operator {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "RUN" => Ok(Self::Run),
            "RETRY" => Ok(Self::Retry),
            "ROLLBACK" => Ok(Self::Rollback),
            "CANCEL" => Ok(Self::Cancel),
            "PASS" => Ok(Self::Pass),
            _ => Err(CoreError::Validation {
                field: "operator".to_string(),
                message: format!("unknown operator '{}'", s),
            }),
        }
    }
}

/// Which operators a task permits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_cancel: bool,
    pub can_continue: bool,
    pub can_pass: bool,
    pub can_retry: bool,
    pub can_rollback: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            can_cancel: false,
            can_continue: true,
            can_pass: true,
            can_retry: true,
            can_rollback: true,
        }
    }
}

impl Capabilities {
    pub fn with_cancel(mut self, value: bool) -> Self {
        self.can_cancel = value;
        self
    }

    pub fn with_continue(mut self, value: bool) -> Self {
        self.can_continue = value;
        self
    }

    pub fn with_pass(mut self, value: bool) -> Self {
        self.can_pass = value;
        self
    }

    pub fn with_retry(mut self, value: bool) -> Self {
        self.can_retry = value;
        self
    }

    pub fn with_rollback(mut self, value: bool) -> Self {
        self.can_rollback = value;
        self
    }

    /// Whether `op` is allowed on a task with these flags.
    pub fn permits(&self, op: Operator) -> bool {
        match op {
            Operator::Run => true,
            Operator::Retry => self.can_retry,
            Operator::Rollback => self.can_rollback,
            Operator::Cancel => self.can_cancel,
            Operator::Pass => self.can_pass,
        }
    }
}

/// Error returned from a task body. Any error puts the task in FAILED.
#[derive(Debug, Clone, Error)]
pub enum TaskError {
    #[error("{0}")]
    Failed(String),

    #[error("task cancelled")]
    Cancelled,

    #[error("gave up waiting for {what} after {attempts} attempts")]
    Timeout { what: String, attempts: u32 },

    #[error(transparent)]
    Context(#[from] ContextError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl TaskError {
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    pub fn cancelled() -> Self {
        Self::Cancelled
    }
}

/// A concrete unit of work.
///
/// Bodies must be idempotent: after a crash a RUNNING task is re-executed.
#[async_trait]
pub trait TaskBody: Send + Sync {
    async fn execute(&self, rt: &TaskRuntime) -> Result<(), TaskError>;

    /// Compensating action run when the dag is rolled back.
    async fn rollback(&self, _rt: &TaskRuntime) -> Result<(), TaskError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_are_stable() {
        for state in [
            TaskState::Pending,
            TaskState::Ready,
            TaskState::Running,
            TaskState::Failed,
            TaskState::Succeed,
        ] {
            assert_eq!(TaskState::from_i32(state.as_i32()), Some(state));
        }
        assert_eq!(TaskState::Succeed.as_i32(), 5);
        assert_eq!(TaskState::from_i32(0), None);
    }

    #[test]
    fn test_operator_parse() {
        assert_eq!("retry".parse::<Operator>().unwrap(), Operator::Retry);
        assert_eq!("PASS".parse::<Operator>().unwrap(), Operator::Pass);
        assert!("jump".parse::<Operator>().is_err());
        assert_eq!(Operator::from_i32(Operator::Cancel.as_i32()), Some(Operator::Cancel));
    }

    #[test]
    fn test_capabilities_permit() {
        let caps = Capabilities::default().with_retry(false);
        assert!(!caps.permits(Operator::Retry));
        assert!(caps.permits(Operator::Rollback));
        assert!(!caps.permits(Operator::Cancel));
        assert!(caps.permits(Operator::Run));
    }
}
