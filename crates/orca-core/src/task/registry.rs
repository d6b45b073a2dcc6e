// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! String-keyed task type registry.
//!
//! Every concrete task registers a constructor under its struct name at
//! process start. Stored tasks carry that name, and the runner rebuilds the
//! body from it. Agents that do not own a task get a carrier that refuses to
//! execute, so they can still load and report the dag.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::{Capabilities, TaskBody, TaskError, TaskRuntime};
use crate::agent::AgentAddr;
use crate::error::{CoreError, Result};

type TaskFactory = Arc<dyn Fn() -> Box<dyn TaskBody> + Send + Sync>;

/// A registered task type.
#[derive(Clone)]
pub struct TaskType {
    pub struct_name: String,
    pub capabilities: Capabilities,
    factory: TaskFactory,
}

impl fmt::Debug for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskType")
            .field("struct_name", &self.struct_name)
            .field("capabilities", &self.capabilities)
            .finish()
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    types: HashMap<String, TaskType>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task type. Registering the same name twice replaces the
    /// earlier entry.
    pub fn register<F, B>(&mut self, struct_name: &str, capabilities: Capabilities, factory: F) -> &mut Self
    where
        F: Fn() -> B + Send + Sync + 'static,
        B: TaskBody + 'static,
    {
        let factory: TaskFactory = Arc::new(move || Box::new(factory()) as Box<dyn TaskBody>);
        self.types.insert(
            struct_name.to_string(),
            TaskType {
                struct_name: struct_name.to_string(),
                capabilities,
                factory,
            },
        );
        self
    }

    pub fn get(&self, struct_name: &str) -> Option<&TaskType> {
        self.types.get(struct_name)
    }

    pub fn contains(&self, struct_name: &str) -> bool {
        self.types.contains_key(struct_name)
    }

    pub fn struct_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.types.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Build the body for a stored task.
    ///
    /// Returns a carrier that refuses to execute when `executor` is not
    /// `local`.
    pub fn instantiate(
        &self,
        struct_name: &str,
        executor: &AgentAddr,
        local: &AgentAddr,
    ) -> Result<Box<dyn TaskBody>> {
        if executor != local {
            return Ok(Box::new(RemoteTaskCarrier {
                struct_name: struct_name.to_string(),
                executor: executor.clone(),
            }));
        }
        let task_type = self
            .types
            .get(struct_name)
            .ok_or_else(|| CoreError::UnknownTaskType(struct_name.to_string()))?;
        Ok((task_type.factory)())
    }
}

struct RemoteTaskCarrier {
    struct_name: String,
    executor: AgentAddr,
}

#[async_trait]
impl TaskBody for RemoteTaskCarrier {
    async fn execute(&self, _rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        Err(CoreError::RemoteTaskNotExecutable(format!("{}@{}", self.struct_name, self.executor)).into())
    }

    async fn rollback(&self, _rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        Err(CoreError::RemoteTaskNotExecutable(format!("{}@{}", self.struct_name, self.executor)).into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Noop;

    #[async_trait]
    impl TaskBody for Noop {
        async fn execute(&self, _rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
            Ok(())
        }
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = TaskRegistry::new();
        registry.register("Noop", Capabilities::default().with_cancel(true), || Noop);

        assert!(registry.contains("Noop"));
        assert!(registry.get("Noop").unwrap().capabilities.can_cancel);
        assert_eq!(registry.struct_names(), vec!["Noop"]);

        let local: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        assert!(registry.instantiate("Noop", &local, &local).is_ok());
        assert!(matches!(
            registry.instantiate("Missing", &local, &local),
            Err(CoreError::UnknownTaskType(_))
        ));
    }

    #[test]
    fn test_foreign_task_gets_carrier() {
        let registry = TaskRegistry::new();
        let local: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        let other: AgentAddr = "10.0.0.2:2886".parse().unwrap();
        // Unregistered names still load on non-owners.
        assert!(registry.instantiate("Unknown", &other, &local).is_ok());
    }
}
