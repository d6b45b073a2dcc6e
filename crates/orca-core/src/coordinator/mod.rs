// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness, maintainer election and identity reconciliation.
//!
//! Every agent publishes a heartbeat in the shared store. The maintainer,
//! the one agent that advances cluster dags, is the live MASTER or
//! CLUSTER_AGENT with the lowest address. Before any agent holds one of
//! those identities (a cluster being bootstrapped) the lowest live agent
//! maintains.

mod identity;

pub use identity::{AgentIdentity, IdentityManager};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Notify, watch};
use tracing::{debug, error, info, warn};

use crate::agent::AgentAddr;
use crate::env::AgentEnv;
use crate::error::{CoreError, Result};
use crate::persistence::AgentRecord;

/// Configuration for the coordinator loop.
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub heartbeat_interval: Duration,
    /// An agent without a heartbeat for this long is not live.
    pub liveness_timeout: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(5),
            liveness_timeout: Duration::from_secs(30),
        }
    }
}

/// Reconciliation dags started on identity changes. Implemented by the
/// agent, which owns the concrete flows.
#[async_trait]
pub trait ReconcileHooks: Send + Sync {
    /// This agent won the take-over race.
    async fn take_over(&self, env: &AgentEnv) -> Result<()>;

    /// This agent restarted with a local copy that diverges from its row.
    async fn rebuild(&self, env: &AgentEnv, stored: &AgentRecord) -> Result<()>;
}

/// Pick the maintainer among `agents`.
pub fn elect_maintainer(agents: &[AgentRecord], now: DateTime<Utc>, timeout: Duration) -> Option<AgentAddr> {
    let timeout = chrono::Duration::from_std(timeout).unwrap_or_else(|_| chrono::Duration::days(365));
    let live: Vec<(AgentAddr, AgentIdentity)> = agents
        .iter()
        .filter(|a| a.last_heartbeat.is_some_and(|at| now - at <= timeout))
        .filter_map(|a| Some((a.addr().ok()?, a.identity.parse().ok()?)))
        .collect();

    live.iter()
        .filter(|(_, identity)| identity.is_maintainer_candidate())
        .map(|(addr, _)| addr)
        .min()
        .or_else(|| live.iter().map(|(addr, _)| addr).min())
        .cloned()
}

pub struct Coordinator {
    env: Arc<AgentEnv>,
    hooks: Arc<dyn ReconcileHooks>,
    config: CoordinatorConfig,
    version: String,
    home_path: String,
    maintainer: watch::Sender<bool>,
    shutdown: Arc<Notify>,
}

impl Coordinator {
    pub fn new(
        env: Arc<AgentEnv>,
        hooks: Arc<dyn ReconcileHooks>,
        config: CoordinatorConfig,
        version: impl Into<String>,
        home_path: impl Into<String>,
    ) -> Self {
        let (maintainer, _) = watch::channel(false);
        Self {
            env,
            hooks,
            config,
            version: version.into(),
            home_path: home_path.into(),
            maintainer,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Receiver for the "this agent is maintainer" flag.
    pub fn maintainer(&self) -> watch::Receiver<bool> {
        self.maintainer.subscribe()
    }

    pub fn is_maintainer(&self) -> bool {
        *self.maintainer.borrow()
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Register this agent, start a rebuild when its row diverges, and run
    /// a first election.
    pub async fn start(&self) -> Result<AgentIdentity> {
        let key = self.env.agent.key();
        let previous = self.env.persistence.get_agent(&key).await?;
        let identity = self.env.identity.register(&self.version, &self.home_path).await?;
        info!(agent = %self.env.agent, %identity, version = %self.version, "Agent registered");

        if let Some(stored) = previous
            && self.diverges(&stored, identity)
        {
            warn!(
                agent = %self.env.agent,
                stored_version = %stored.version,
                version = %self.version,
                "Local agent diverges from its stored row, rebuilding"
            );
            self.hooks.rebuild(&self.env, &stored).await?;
        }

        self.beat().await?;
        Ok(identity)
    }

    fn diverges(&self, stored: &AgentRecord, identity: AgentIdentity) -> bool {
        identity == AgentIdentity::ClusterAgent
            && (stored.version != self.version || stored.home_path != self.home_path)
    }

    /// Race for take-over and start the take-over dag when this agent wins.
    pub async fn take_over(&self) -> Result<AgentIdentity> {
        let identity = self.env.identity.claim_take_over().await?;
        if identity == AgentIdentity::TakeOverMaster {
            self.hooks.take_over(&self.env).await?;
        }
        Ok(identity)
    }

    pub async fn run(&self) {
        info!(
            agent = %self.env.agent,
            heartbeat_interval_secs = self.config.heartbeat_interval.as_secs(),
            liveness_timeout_secs = self.config.liveness_timeout.as_secs(),
            "Coordinator started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Coordinator received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.heartbeat_interval) => {
                    if let Err(e) = self.beat().await {
                        error!(error = %e, "Heartbeat failed");
                    }
                }
            }
        }

        self.maintainer.send_replace(false);
        info!("Coordinator stopped");
    }

    /// Publish a heartbeat, refresh the identity cache and re-run the
    /// election.
    pub async fn beat(&self) -> Result<bool> {
        let now = Utc::now();
        let persistence = &self.env.persistence;
        persistence.heartbeat(&self.env.agent.key(), now).await?;
        self.env.identity.load().await?;

        let agents = persistence.list_agents().await?;
        let elected = elect_maintainer(&agents, now, self.config.liveness_timeout)
            .ok_or_else(|| CoreError::invalid_state(&self.env.agent, "no live agent to elect"))?;
        let is_maintainer = elected == self.env.agent;
        let previous = self.maintainer.send_replace(is_maintainer);
        if previous != is_maintainer {
            info!(agent = %self.env.agent, maintainer = %elected, is_maintainer, "Maintainer changed");
        } else {
            debug!(maintainer = %elected, "Heartbeat published");
        }
        Ok(is_maintainer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(address: &str, identity: AgentIdentity, seconds_ago: Option<i64>) -> AgentRecord {
        let now = Utc::now();
        AgentRecord {
            address: address.to_string(),
            identity: identity.as_str().to_string(),
            version: "0.3.0".to_string(),
            home_path: "/home/admin".to_string(),
            last_heartbeat: seconds_ago.map(|s| now - chrono::Duration::seconds(s)),
            created_at: now,
        }
    }

    #[test]
    fn test_lowest_live_cluster_agent_wins() {
        let agents = vec![
            record("10.0.0.3:2886", AgentIdentity::ClusterAgent, Some(1)),
            record("10.0.0.1:2886", AgentIdentity::ClusterAgent, Some(120)),
            record("10.0.0.2:2886", AgentIdentity::ClusterAgent, Some(2)),
            record("10.0.0.0:2886", AgentIdentity::ScalingOut, Some(1)),
        ];
        let elected = elect_maintainer(&agents, Utc::now(), Duration::from_secs(30)).unwrap();
        assert_eq!(elected, "10.0.0.2:2886".parse().unwrap());
    }

    #[test]
    fn test_bootstrap_falls_back_to_lowest_live_agent() {
        let agents = vec![
            record("10.0.0.2:2886", AgentIdentity::Single, Some(1)),
            record("10.0.0.1:2886", AgentIdentity::Single, Some(1)),
        ];
        let elected = elect_maintainer(&agents, Utc::now(), Duration::from_secs(30)).unwrap();
        assert_eq!(elected, "10.0.0.1:2886".parse().unwrap());
        assert!(elect_maintainer(&[], Utc::now(), Duration::from_secs(30)).is_none());
    }

    #[test]
    fn test_ports_order_within_a_host() {
        let agents = vec![
            record("10.0.0.1:2887", AgentIdentity::Master, Some(1)),
            record("10.0.0.1:2886", AgentIdentity::ClusterAgent, Some(1)),
        ];
        let elected = elect_maintainer(&agents, Utc::now(), Duration::from_secs(30)).unwrap();
        assert_eq!(elected.port, 2886);
    }
}
