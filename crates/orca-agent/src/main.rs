// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orca Agent
//!
//! Runs the orchestration core for one host: registers the agent, elects the
//! maintainer, executes dags and serves the RPC.

use std::sync::Arc;

use anyhow::Result;
use tracing::{error, info};

use orca_agent::config::Config;
use orca_agent::observer::ScriptObserverOps;
use orca_agent::runtime::AgentRuntime;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("orca_core=info,orca_agent=info")),
        )
        .init();

    info!("Starting Orca Agent");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        agent = %config.agent(),
        version = %config.version,
        home_path = %config.home_path.display(),
        max_parallel_tasks = config.max_parallel_tasks,
        take_over = config.take_over,
        "Configuration loaded"
    );

    let observer = Arc::new(ScriptObserverOps::new(&config.observer_scripts));
    let runtime = AgentRuntime::builder()
        .config(config)
        .observer(observer)
        .build()?
        .start()
        .await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runtime.shutdown().await?;
    info!("Shutdown complete");
    Ok(())
}
