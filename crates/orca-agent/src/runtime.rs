// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable agent runtime.
//!
//! [`AgentRuntime`] wires the store, the task registry, the coordinator, the
//! executor and the RPC server of one agent, and stops them in reverse
//! order.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use orca_agent::config::Config;
//! use orca_agent::observer::ScriptObserverOps;
//! use orca_agent::runtime::AgentRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let ops = Arc::new(ScriptObserverOps::new(&config.observer_scripts));
//!
//!     let runtime = AgentRuntime::builder()
//!         .config(config)
//!         .observer(ops)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     tokio::signal::ctrl_c().await?;
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use orca_core::{
    AgentEnv, Coordinator, CoordinatorConfig, ExecutorConfig, ExecutorHandle, HttpPeerClient, Persistence,
    SqlitePersistence,
};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::flows::reconcile::FlowHooks;
use crate::flows::task_registry;
use crate::handlers::AppState;
use crate::observer::ObserverOps;
use crate::server;

/// Builder for [`AgentRuntime`].
#[derive(Default)]
pub struct AgentRuntimeBuilder {
    config: Option<Config>,
    observer: Option<Arc<dyn ObserverOps>>,
}

impl std::fmt::Debug for AgentRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRuntimeBuilder")
            .field("config", &self.config)
            .field("observer", &self.observer.as_ref().map(|o| o.kind()))
            .finish()
    }
}

impl AgentRuntimeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the agent configuration (required).
    pub fn config(mut self, config: Config) -> Self {
        self.config = Some(config);
        self
    }

    /// Set the observer implementation (required).
    pub fn observer(mut self, observer: Arc<dyn ObserverOps>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn build(self) -> Result<AgentRuntimeConfig> {
        let config = self.config.ok_or_else(|| anyhow::anyhow!("config is required"))?;
        let observer = self
            .observer
            .ok_or_else(|| anyhow::anyhow!("observer is required"))?;
        Ok(AgentRuntimeConfig { config, observer })
    }
}

/// A validated runtime description, ready to start.
pub struct AgentRuntimeConfig {
    config: Config,
    observer: Arc<dyn ObserverOps>,
}

impl AgentRuntimeConfig {
    /// Connect the store, register this agent and spawn the coordinator,
    /// the executor and the RPC server.
    pub async fn start(self) -> Result<AgentRuntime> {
        let config = self.config;
        let agent = config.agent();

        info!(database_url = %config.database_url, "Connecting to store...");
        let persistence: Arc<dyn Persistence> = Arc::new(SqlitePersistence::connect(&config.database_url, 5).await?);
        persistence.health_check().await?;
        info!("Store connection established");

        let registry = Arc::new(task_registry(self.observer.clone()));
        let peer = Arc::new(HttpPeerClient::new(config.peer_timeout)?);
        let env = Arc::new(AgentEnv::new(agent.clone(), persistence, registry, peer));

        let home_path = config.home_path.to_string_lossy().to_string();
        let coordinator = Arc::new(Coordinator::new(
            env.clone(),
            Arc::new(FlowHooks),
            CoordinatorConfig {
                liveness_timeout: config.heartbeat_timeout,
                ..CoordinatorConfig::default()
            },
            config.version.clone(),
            home_path.clone(),
        ));
        let identity = coordinator.start().await?;
        info!(%agent, %identity, "Agent registered");
        if config.take_over {
            let identity = coordinator.take_over().await?;
            info!(%agent, %identity, "Take-over race finished");
        }

        let coordinator_handle = tokio::spawn({
            let coordinator = coordinator.clone();
            async move { coordinator.run().await }
        });
        let executor = ExecutorHandle::spawn(
            env.clone(),
            coordinator.maintainer(),
            ExecutorConfig {
                interval: config.executor_interval,
                max_parallel_tasks: config.max_parallel_tasks,
            },
        );

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let bind_addr = listener.local_addr()?;
        let state = AppState::new(
            env.clone(),
            self.observer,
            coordinator.maintainer(),
            config.version.clone(),
            home_path,
        );
        let shutdown = CancellationToken::new();
        let server_handle = tokio::spawn(server::serve(listener, state, shutdown.clone()));

        info!(addr = %bind_addr, "AgentRuntime started");
        Ok(AgentRuntime {
            env,
            coordinator,
            coordinator_handle,
            executor,
            server_handle,
            shutdown,
            bind_addr,
        })
    }
}

/// A running agent.
pub struct AgentRuntime {
    env: Arc<AgentEnv>,
    coordinator: Arc<Coordinator>,
    coordinator_handle: JoinHandle<()>,
    executor: ExecutorHandle,
    server_handle: JoinHandle<std::io::Result<()>>,
    shutdown: CancellationToken,
    bind_addr: SocketAddr,
}

impl AgentRuntime {
    pub fn builder() -> AgentRuntimeBuilder {
        AgentRuntimeBuilder::new()
    }

    /// Address the RPC server listens on.
    pub fn bind_addr(&self) -> SocketAddr {
        self.bind_addr
    }

    pub fn env(&self) -> &Arc<AgentEnv> {
        &self.env
    }

    /// Stop accepting requests, then stop the executor and the coordinator.
    ///
    /// Subtasks still running are left RUNNING and recovered on the next
    /// start.
    pub async fn shutdown(self) -> Result<()> {
        info!("AgentRuntime shutting down...");

        self.shutdown.cancel();
        match self.server_handle.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "RPC server error during shutdown"),
            Err(e) => error!(error = %e, "RPC server task panicked"),
        }

        self.executor.shutdown().await;

        self.coordinator.shutdown_handle().notify_one();
        if let Err(e) = self.coordinator_handle.await {
            error!(error = %e, "Coordinator task panicked");
        }

        info!("AgentRuntime shutdown complete");
        Ok(())
    }
}
