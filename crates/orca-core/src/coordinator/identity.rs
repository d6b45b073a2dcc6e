// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent roles and the only permitted ways to change them.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::agent::AgentAddr;
use crate::error::{CoreError, Result};
use crate::persistence::{AgentRecord, Persistence};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentIdentity {
    /// Not part of any cluster yet.
    Single,
    /// Coordinates the bootstrap of a new cluster.
    Master,
    /// Joins a cluster being bootstrapped by a master.
    Follower,
    /// Member of a running cluster.
    ClusterAgent,
    /// Won the take-over race and runs the take-over dag.
    TakeOverMaster,
    /// Waits for the take-over master to convert it.
    TakeOverFollower,
    /// Being removed from the cluster.
    ScalingIn,
    /// Being added to a running cluster.
    ScalingOut,
}

impl AgentIdentity {
    pub const ALL: [AgentIdentity; 8] = [
        Self::Single,
        Self::Master,
        Self::Follower,
        Self::ClusterAgent,
        Self::TakeOverMaster,
        Self::TakeOverFollower,
        Self::ScalingIn,
        Self::ScalingOut,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "SINGLE",
            Self::Master => "MASTER",
            Self::Follower => "FOLLOWER",
            Self::ClusterAgent => "CLUSTER_AGENT",
            Self::TakeOverMaster => "TAKE_OVER_MASTER",
            Self::TakeOverFollower => "TAKE_OVER_FOLLOWER",
            Self::ScalingIn => "SCALING_IN",
            Self::ScalingOut => "SCALING_OUT",
        }
    }

    /// Whether this agent may be elected to advance cluster dags.
    pub fn is_maintainer_candidate(self) -> bool {
        matches!(self, Self::Master | Self::ClusterAgent)
    }

    /// Transition table. Staying in the same identity is always allowed.
    pub fn can_transition_to(self, to: AgentIdentity) -> bool {
        use AgentIdentity::*;
        if self == to {
            return true;
        }
        match self {
            Single => matches!(to, Master | Follower | TakeOverMaster | TakeOverFollower | ScalingOut),
            Master | Follower => matches!(to, ClusterAgent | Single),
            TakeOverMaster | TakeOverFollower => matches!(to, ClusterAgent | Single),
            ClusterAgent => matches!(to, ScalingIn | TakeOverMaster | TakeOverFollower),
            ScalingIn => matches!(to, ClusterAgent | Single),
            ScalingOut => matches!(to, ClusterAgent | Single),
        }
    }
}

impl fmt::Display for AgentIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AgentIdentity {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL
            .into_iter()
            .find(|identity| identity.as_str() == s)
            .ok_or_else(|| CoreError::Validation {
                field: "identity".to_string(),
                message: format!("unknown agent identity '{}'", s),
            })
    }
}

/// Owns this agent's identity. The store is written first; the in-memory
/// copy only changes after the store accepted the transition.
pub struct IdentityManager {
    persistence: Arc<dyn Persistence>,
    agent: AgentAddr,
    current: watch::Sender<AgentIdentity>,
}

impl IdentityManager {
    pub fn new(persistence: Arc<dyn Persistence>, agent: AgentAddr) -> Self {
        let (current, _) = watch::channel(AgentIdentity::Single);
        Self {
            persistence,
            agent,
            current,
        }
    }

    pub fn agent(&self) -> &AgentAddr {
        &self.agent
    }

    /// Cached identity of this agent.
    pub fn current(&self) -> AgentIdentity {
        *self.current.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AgentIdentity> {
        self.current.subscribe()
    }

    /// Publish this agent in the store (as SINGLE when new) and load its
    /// identity.
    pub async fn register(&self, version: &str, home_path: &str) -> Result<AgentIdentity> {
        self.persistence
            .upsert_agent(&AgentRecord {
                address: self.agent.key(),
                identity: AgentIdentity::Single.as_str().to_string(),
                version: version.to_string(),
                home_path: home_path.to_string(),
                last_heartbeat: Some(Utc::now()),
                created_at: Utc::now(),
            })
            .await?;
        self.load().await
    }

    /// Refresh the cache from the store.
    pub async fn load(&self) -> Result<AgentIdentity> {
        let identity = self.stored(&self.agent).await?;
        self.current.send_replace(identity);
        Ok(identity)
    }

    /// Identity of any agent as recorded in the store.
    pub async fn stored(&self, address: &AgentAddr) -> Result<AgentIdentity> {
        let record = self
            .persistence
            .get_agent(&address.key())
            .await?
            .ok_or_else(|| CoreError::not_found("agent", address))?;
        record.identity.parse()
    }

    /// Move this agent to `to`.
    pub async fn transition(&self, to: AgentIdentity) -> Result<()> {
        self.set_identity(&self.agent, to).await
    }

    /// Move any agent to `to`, validating against the transition table and
    /// compare-and-setting on the stored identity.
    pub async fn set_identity(&self, address: &AgentAddr, to: AgentIdentity) -> Result<()> {
        let from = self.stored(address).await?;
        if !from.can_transition_to(to) {
            return Err(CoreError::IdentityTransition {
                from: from.to_string(),
                to: to.to_string(),
            });
        }
        if from != to {
            let updated = self
                .persistence
                .update_agent_identity(&address.key(), from.as_str(), to.as_str())
                .await?;
            if !updated {
                return Err(CoreError::invalid_state(
                    address,
                    format!("identity changed concurrently while moving {} -> {}", from, to),
                ));
            }
            info!(agent = %address, %from, %to, "Agent identity changed");
        }
        if *address == self.agent {
            self.current.send_replace(to);
        }
        Ok(())
    }

    /// Race for TAKE_OVER_MASTER. The loser becomes TAKE_OVER_FOLLOWER.
    pub async fn claim_take_over(&self) -> Result<AgentIdentity> {
        let from = self.stored(&self.agent).await?;
        if matches!(from, AgentIdentity::TakeOverMaster | AgentIdentity::TakeOverFollower) {
            self.current.send_replace(from);
            return Ok(from);
        }
        if !from.can_transition_to(AgentIdentity::TakeOverMaster) {
            return Err(CoreError::IdentityTransition {
                from: from.to_string(),
                to: AgentIdentity::TakeOverMaster.to_string(),
            });
        }
        let won = self
            .persistence
            .claim_take_over_master(&self.agent.key(), from.as_str())
            .await?;
        if won {
            info!(agent = %self.agent, "Won the take-over race");
            self.current.send_replace(AgentIdentity::TakeOverMaster);
            Ok(AgentIdentity::TakeOverMaster)
        } else {
            self.transition(AgentIdentity::TakeOverFollower).await?;
            Ok(AgentIdentity::TakeOverFollower)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;

    #[test]
    fn test_identity_round_trips_through_strings() {
        for identity in AgentIdentity::ALL {
            assert_eq!(identity.as_str().parse::<AgentIdentity>().unwrap(), identity);
            let json = serde_json::to_string(&identity).unwrap();
            assert_eq!(json, format!("\"{}\"", identity.as_str()));
        }
        assert!("LEADER".parse::<AgentIdentity>().is_err());
    }

    #[test]
    fn test_transition_table() {
        use AgentIdentity::*;
        assert!(Single.can_transition_to(Master));
        assert!(Follower.can_transition_to(ClusterAgent));
        assert!(ClusterAgent.can_transition_to(ScalingIn));
        assert!(ScalingIn.can_transition_to(ClusterAgent));
        assert!(!ClusterAgent.can_transition_to(Master));
        assert!(!Single.can_transition_to(ScalingIn));
        assert!(ClusterAgent.can_transition_to(ClusterAgent));
    }

    #[tokio::test]
    async fn test_cache_follows_store() {
        let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let agent: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        let manager = IdentityManager::new(store.clone(), agent.clone());
        assert_eq!(manager.register("0.3.0", "/home/admin").await.unwrap(), AgentIdentity::Single);

        manager.transition(AgentIdentity::Master).await.unwrap();
        assert_eq!(manager.current(), AgentIdentity::Master);
        assert_eq!(store.get_agent("10.0.0.1:2886").await.unwrap().unwrap().identity, "MASTER");

        let err = manager.transition(AgentIdentity::ScalingIn).await.unwrap_err();
        assert!(matches!(err, CoreError::IdentityTransition { .. }));
        assert_eq!(manager.current(), AgentIdentity::Master);
    }

    #[tokio::test]
    async fn test_take_over_race() {
        let store: Arc<dyn Persistence> = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let a = IdentityManager::new(store.clone(), "10.0.0.1:2886".parse().unwrap());
        let b = IdentityManager::new(store.clone(), "10.0.0.2:2886".parse().unwrap());
        a.register("0.3.0", "/home/admin").await.unwrap();
        b.register("0.3.0", "/home/admin").await.unwrap();

        assert_eq!(a.claim_take_over().await.unwrap(), AgentIdentity::TakeOverMaster);
        assert_eq!(b.claim_take_over().await.unwrap(), AgentIdentity::TakeOverFollower);
        // Claiming again is stable.
        assert_eq!(a.claim_take_over().await.unwrap(), AgentIdentity::TakeOverMaster);
    }
}
