// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Long-lived collaborators of one agent process.
//!
//! [`AgentEnv`] is built once at startup and shared (`Arc`) by the executor,
//! the runner, the coordinator and every running task body. Tests build one
//! per simulated agent over a shared store.

use std::sync::Arc;
use std::time::Duration;

use crate::agent::AgentAddr;
use crate::coordinator::IdentityManager;
use crate::persistence::Persistence;
use crate::remote::{PeerClient, RetryBudget};
use crate::service::TaskService;
use crate::task::TaskRegistry;

/// How task bodies wait for an external condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 600,
            interval: Duration::from_secs(1),
        }
    }
}

pub struct AgentEnv {
    pub agent: AgentAddr,
    pub persistence: Arc<dyn Persistence>,
    pub service: TaskService,
    pub registry: Arc<TaskRegistry>,
    pub peer: Arc<dyn PeerClient>,
    pub identity: Arc<IdentityManager>,
    pub poll: PollPolicy,
    pub retry: RetryBudget,
}

impl AgentEnv {
    pub fn new(
        agent: AgentAddr,
        persistence: Arc<dyn Persistence>,
        registry: Arc<TaskRegistry>,
        peer: Arc<dyn PeerClient>,
    ) -> Self {
        Self {
            service: TaskService::new(persistence.clone(), agent.clone()),
            identity: Arc::new(IdentityManager::new(persistence.clone(), agent.clone())),
            agent,
            persistence,
            registry,
            peer,
            poll: PollPolicy::default(),
            retry: RetryBudget::default(),
        }
    }

    pub fn with_poll(mut self, poll: PollPolicy) -> Self {
        self.poll = poll;
        self
    }

    pub fn with_retry(mut self, retry: RetryBudget) -> Self {
        self.retry = retry;
        self
    }
}
