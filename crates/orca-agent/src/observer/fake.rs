// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory observer for tests.
//!
//! Simulates one observer and the cluster it sees without running any
//! process. Every mutating call is recorded, and any operation can be made
//! to fail.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use orca_core::AgentAddr;

use super::{BootstrapScript, ObserverError, ObserverOps, Result, Tenant};

#[derive(Debug)]
struct FakeState {
    calls: Vec<String>,
    failing: HashSet<String>,
    deployed: Option<String>,
    running: bool,
    cluster_id: i64,
    tenants: Vec<Tenant>,
    config: BTreeMap<(String, String), String>,
    servers: BTreeSet<AgentAddr>,
    deletes_complete: bool,
    quorum_alive: bool,
}

/// Fake observer for tests.
#[derive(Debug)]
pub struct FakeObserverOps {
    state: Mutex<FakeState>,
}

impl Default for FakeObserverOps {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeObserverOps {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                calls: Vec::new(),
                failing: HashSet::new(),
                deployed: None,
                running: false,
                cluster_id: 1,
                tenants: Vec::new(),
                config: BTreeMap::new(),
                servers: BTreeSet::new(),
                deletes_complete: true,
                quorum_alive: true,
            }),
        }
    }

    pub fn with_tenants(self, tenants: Vec<Tenant>) -> Self {
        self.lock().tenants = tenants;
        self
    }

    pub fn with_cluster_id(self, cluster_id: i64) -> Self {
        self.lock().cluster_id = cluster_id;
        self
    }

    pub fn with_servers(self, servers: &[AgentAddr]) -> Self {
        self.lock().servers = servers.iter().cloned().collect();
        self
    }

    /// Make every later call of `op` fail.
    pub fn fail_on(&self, op: &str) {
        self.lock().failing.insert(op.to_string());
    }

    pub fn recover(&self, op: &str) {
        self.lock().failing.remove(op);
    }

    /// Whether deleted servers ever finish leaving the cluster.
    pub fn set_deletes_complete(&self, complete: bool) {
        self.lock().deletes_complete = complete;
    }

    pub fn set_quorum_alive(&self, alive: bool) {
        self.lock().quorum_alive = alive;
    }

    /// Mutating calls so far, oldest first.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub fn deployed_version(&self) -> Option<String> {
        self.lock().deployed.clone()
    }

    pub fn servers(&self) -> Vec<AgentAddr> {
        self.lock().servers.iter().cloned().collect()
    }

    /// Tenant config as `(tenant name, key) -> value`.
    pub fn config(&self) -> BTreeMap<(String, String), String> {
        self.lock().config.clone()
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record `call` and fail when `op` was marked failing.
    fn record(&self, op: &str, call: String) -> Result<MutexGuard<'_, FakeState>> {
        let mut state = self.lock();
        state.calls.push(call);
        if state.failing.contains(op) {
            return Err(ObserverError::Failed {
                op: op.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(state)
    }

    fn query(&self, op: &str) -> Result<MutexGuard<'_, FakeState>> {
        let state = self.lock();
        if state.failing.contains(op) {
            return Err(ObserverError::Failed {
                op: op.to_string(),
                details: "injected failure".to_string(),
            });
        }
        Ok(state)
    }
}

#[async_trait]
impl ObserverOps for FakeObserverOps {
    fn kind(&self) -> &'static str {
        "fake"
    }

    async fn deploy(&self, version: &str) -> Result<()> {
        let mut state = self.record("deploy", format!("deploy {}", version))?;
        state.deployed = Some(version.to_string());
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        let mut state = self.record("destroy", "destroy".to_string())?;
        state.deployed = None;
        state.running = false;
        Ok(())
    }

    async fn start_observer(&self) -> Result<()> {
        let mut state = self.record("start_observer", "start_observer".to_string())?;
        state.running = true;
        Ok(())
    }

    async fn stop_observer(&self) -> Result<()> {
        let mut state = self.record("stop_observer", "stop_observer".to_string())?;
        state.running = false;
        Ok(())
    }

    async fn kill_observer(&self, force: bool) -> Result<()> {
        let mut state = self.record("kill_observer", format!("kill_observer force={}", force))?;
        state.running = false;
        Ok(())
    }

    async fn is_observer_alive(&self) -> Result<bool> {
        Ok(self.query("is_observer_alive")?.running)
    }

    async fn bootstrap(&self, servers: &[AgentAddr]) -> Result<()> {
        let joined: Vec<String> = servers.iter().map(ToString::to_string).collect();
        let mut state = self.record("bootstrap", format!("bootstrap {}", joined.join(",")))?;
        state.servers = servers.iter().cloned().collect();
        Ok(())
    }

    async fn run_script(&self, script: BootstrapScript) -> Result<()> {
        self.record(script.as_str(), format!("run_script {}", script))?;
        Ok(())
    }

    async fn cluster_id(&self) -> Result<i64> {
        Ok(self.query("cluster_id")?.cluster_id)
    }

    async fn list_user_tenants(&self) -> Result<Vec<Tenant>> {
        Ok(self.query("list_user_tenants")?.tenants.clone())
    }

    async fn check_path(&self, uri: &str) -> Result<()> {
        self.record("check_path", format!("check_path {}", uri))?;
        Ok(())
    }

    async fn tenant_config(&self, tenant: &Tenant, key: &str) -> Result<Option<String>> {
        let state = self.query("tenant_config")?;
        Ok(state.config.get(&(tenant.name.clone(), key.to_string())).cloned())
    }

    async fn set_tenant_config(&self, tenant: &Tenant, key: &str, value: &str) -> Result<()> {
        let mut state = self.record(
            "set_tenant_config",
            format!("set_tenant_config {} {}={}", tenant.name, key, value),
        )?;
        let entry = (tenant.name.clone(), key.to_string());
        if value.is_empty() {
            state.config.remove(&entry);
        } else {
            state.config.insert(entry, value.to_string());
        }
        Ok(())
    }

    async fn list_servers(&self) -> Result<Vec<AgentAddr>> {
        Ok(self.query("list_servers")?.servers.iter().cloned().collect())
    }

    async fn add_server(&self, server: &AgentAddr) -> Result<()> {
        let mut state = self.record("add_server", format!("add_server {}", server))?;
        state.servers.insert(server.clone());
        Ok(())
    }

    async fn delete_server(&self, server: &AgentAddr) -> Result<()> {
        self.record("delete_server", format!("delete_server {}", server))?;
        Ok(())
    }

    async fn is_server_deleted(&self, server: &AgentAddr) -> Result<bool> {
        let mut state = self.query("is_server_deleted")?;
        if state.deletes_complete {
            state.servers.remove(server);
            return Ok(true);
        }
        Ok(!state.servers.contains(server))
    }

    async fn is_quorum_alive(&self, _without: &AgentAddr) -> Result<bool> {
        Ok(self.query("is_quorum_alive")?.quorum_alive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_records_calls_and_injects_failures() {
        let ops = FakeObserverOps::new();
        ops.deploy("4.2.1").await.unwrap();
        ops.start_observer().await.unwrap();
        assert!(ops.is_observer_alive().await.unwrap());
        assert_eq!(ops.deployed_version().as_deref(), Some("4.2.1"));

        ops.fail_on("stop_observer");
        assert!(ops.stop_observer().await.is_err());
        assert!(ops.is_running());
        ops.recover("stop_observer");
        ops.stop_observer().await.unwrap();

        assert_eq!(
            ops.calls(),
            vec!["deploy 4.2.1", "start_observer", "stop_observer", "stop_observer"]
        );
    }

    #[tokio::test]
    async fn test_deleted_server_leaves_once_complete() {
        let x: AgentAddr = "10.0.0.3:2886".parse().unwrap();
        let ops = FakeObserverOps::new().with_servers(&[x.clone()]);
        ops.set_deletes_complete(false);
        ops.delete_server(&x).await.unwrap();
        assert!(!ops.is_server_deleted(&x).await.unwrap());
        ops.set_deletes_complete(true);
        assert!(ops.is_server_deleted(&x).await.unwrap());
        assert!(ops.servers().is_empty());
    }
}
