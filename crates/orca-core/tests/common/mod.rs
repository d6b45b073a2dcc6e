// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orca-core integration tests.
//!
//! Provides a [`TestCluster`] of in-process agents sharing one in-memory
//! store, with peer calls routed straight to the target agent's service.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;

use orca_core::agent::AgentAddr;
use orca_core::env::{AgentEnv, PollPolicy};
use orca_core::error::{CoreError, Result};
use orca_core::executor::{ExecutorConfig, ExecutorHandle};
use orca_core::persistence::{Persistence, SqlitePersistence};
use orca_core::remote::{
    PeerClient, RemoteDagRequest, RetryBudget, SubDagAction, SubDagRequest, SubDagResponse, accept_sub_dag,
    register_protocol_tasks, run_remote_dag,
};
use orca_core::service::EntityKind;
use orca_core::task::{Capabilities, Operator, TaskBody, TaskError, TaskRegistry, TaskRuntime};
use orca_core::template::{NodeTemplate, TaskTemplate, Template, TemplateBuilder};
use orca_core::view::{AgentStatus, DagDetail};
use orca_core::{AgentIdentity, TaskState};

pub const A: &str = "10.0.0.1:2886";
pub const B: &str = "10.0.0.2:2886";
pub const C: &str = "10.0.0.3:2886";

pub fn addr(s: &str) -> AgentAddr {
    s.parse().unwrap()
}

/// Fast polling so protocol tasks settle within a test's lifetime.
pub fn test_poll() -> PollPolicy {
    PollPolicy {
        max_attempts: 500,
        interval: Duration::from_millis(20),
    }
}

pub fn test_executor() -> ExecutorConfig {
    ExecutorConfig {
        interval: Duration::from_millis(10),
        max_parallel_tasks: 4,
    }
}

// ============================================================================
// Test task bodies
// ============================================================================

pub struct NoopTask;

#[async_trait]
impl TaskBody for NoopTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.log("noop").await;
        Ok(())
    }
}

/// Fails its first attempt, succeeds afterwards.
pub struct FlakyTask;

#[async_trait]
impl TaskBody for FlakyTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        if rt.task().execute_times <= 1 {
            return Err(TaskError::failed("first attempt always fails"));
        }
        Ok(())
    }
}

/// Always fails; its rollback records that it ran.
pub struct FailTask;

#[async_trait]
impl TaskBody for FailTask {
    async fn execute(&self, _rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        Err(TaskError::failed("disk full"))
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.context().await.set_data("fail_rolled_back", true)?;
        Ok(())
    }
}

pub struct PanicTask;

#[async_trait]
impl TaskBody for PanicTask {
    async fn execute(&self, _rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        panic!("boom");
    }
}

/// Runs until cancelled.
pub struct BlockTask;

#[async_trait]
impl TaskBody for BlockTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        loop {
            rt.sleep(Duration::from_millis(10)).await?;
        }
    }
}

/// Writes `written` into the shared data.
pub struct WriteTask;

#[async_trait]
impl TaskBody for WriteTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let name = rt.task().name.clone();
        rt.context().await.set_data("written", name)?;
        Ok(())
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.context().await.set_data("write_rolled_back", true)?;
        Ok(())
    }
}

/// Fails unless an earlier node wrote `written`.
pub struct ReadTask;

#[async_trait]
impl TaskBody for ReadTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let written: String = rt.context().await.data("written").require("written")?;
        rt.log(format!("read {}", written)).await;
        Ok(())
    }
}

pub struct StopObserverTask;

#[async_trait]
impl TaskBody for StopObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.log(format!("observer on {} stopped", rt.agent())).await;
        Ok(())
    }
}

pub struct StartObserverTask;

#[async_trait]
impl TaskBody for StartObserverTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        rt.log(format!("observer on {} started", rt.agent())).await;
        Ok(())
    }
}

/// Starts the observer on the agent named in its additional data, as a
/// standalone dag on that peer. Rolling back stops it with another one.
pub struct RemoteStartTask;

#[async_trait]
impl TaskBody for RemoteStartTask {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        run_remote_dag(rt, &RemoteDagRequest::new(target_agent(rt)?, SubDagAction::Start)).await
    }

    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        run_remote_dag(rt, &RemoteDagRequest::new(target_agent(rt)?, SubDagAction::Stop)).await
    }
}

fn target_agent(rt: &TaskRuntime) -> std::result::Result<AgentAddr, TaskError> {
    Ok(rt
        .additional_data()
        .and_then(|d| d.get("agent"))
        .and_then(|a| a.as_str())
        .ok_or_else(|| TaskError::failed("no target agent"))?
        .parse::<AgentAddr>()?)
}

pub fn remote_start(agent: &str) -> TaskTemplate {
    task("RemoteStartTask", &format!("start observer on {}", agent))
        .with_additional_data(serde_json::json!({ "agent": agent }))
}

pub fn test_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    register_protocol_tasks(&mut registry);
    let caps = Capabilities::default();
    registry
        .register("NoopTask", caps, || NoopTask)
        .register("FlakyTask", caps, || FlakyTask)
        .register("FailTask", caps, || FailTask)
        .register("PanicTask", caps, || PanicTask)
        .register("BlockTask", caps.with_cancel(true).with_continue(false), || BlockTask)
        .register("WriteTask", caps, || WriteTask)
        .register("ReadTask", caps, || ReadTask)
        .register("StopObserverTask", caps, || StopObserverTask)
        .register("StartObserverTask", caps, || StartObserverTask)
        .register("RemoteStartTask", caps.with_cancel(true), || RemoteStartTask);
    registry
}

/// A task template carrying the capabilities its type registered with.
pub fn task(struct_name: &str, name: &str) -> TaskTemplate {
    let caps = test_registry()
        .get(struct_name)
        .map(|t| t.capabilities)
        .unwrap_or_default();
    TaskTemplate::new(struct_name, name).with_capabilities(caps)
}

pub fn single_step(struct_name: &str) -> Template {
    TemplateBuilder::new(format!("{} only", struct_name))
        .add_node(NodeTemplate::normal(task(struct_name, struct_name)))
        .build()
        .unwrap()
}

// ============================================================================
// Fake peer client
// ============================================================================

/// Routes peer calls to in-process agents, the way the HTTP layer would.
#[derive(Default)]
pub struct FakePeerClient {
    agents: RwLock<HashMap<AgentAddr, Weak<AgentEnv>>>,
    actions: RwLock<HashMap<SubDagAction, Template>>,
    agent_actions: RwLock<HashMap<(AgentAddr, SubDagAction), Template>>,
    unreachable: RwLock<HashSet<AgentAddr>>,
    pub killed: Mutex<Vec<(AgentAddr, bool)>>,
}

impl FakePeerClient {
    pub fn new() -> Self {
        let client = Self::default();
        client.set_action(SubDagAction::Stop, single_step("StopObserverTask"));
        client.set_action(SubDagAction::Start, single_step("StartObserverTask"));
        client
    }

    pub fn attach(&self, env: &Arc<AgentEnv>) {
        self.agents
            .write()
            .unwrap()
            .insert(env.agent.clone(), Arc::downgrade(env));
    }

    pub fn set_action(&self, action: SubDagAction, template: Template) {
        self.actions.write().unwrap().insert(action, template);
    }

    /// Override the steps one agent runs for `action`.
    pub fn set_agent_action(&self, agent: &AgentAddr, action: SubDagAction, template: Template) {
        self.agent_actions
            .write()
            .unwrap()
            .insert((agent.clone(), action), template);
    }

    pub fn set_unreachable(&self, agent: &AgentAddr, unreachable: bool) {
        let mut set = self.unreachable.write().unwrap();
        if unreachable {
            set.insert(agent.clone());
        } else {
            set.remove(agent);
        }
    }

    fn env_of(&self, agent: &AgentAddr) -> Result<Arc<AgentEnv>> {
        let transport = || CoreError::Transport {
            agent: agent.to_string(),
            details: "connection refused".to_string(),
        };
        if self.unreachable.read().unwrap().contains(agent) {
            return Err(transport());
        }
        self.agents
            .read()
            .unwrap()
            .get(agent)
            .and_then(Weak::upgrade)
            .ok_or_else(transport)
    }

    fn action_template(&self, agent: &AgentAddr, action: SubDagAction) -> Option<Template> {
        if let Some(template) = self.agent_actions.read().unwrap().get(&(agent.clone(), action)) {
            return Some(template.clone());
        }
        self.actions.read().unwrap().get(&action).cloned()
    }
}

/// An error the peer answered with, as the HTTP client would surface it.
fn remote(agent: &AgentAddr, err: CoreError) -> CoreError {
    CoreError::Remote {
        agent: agent.to_string(),
        code: err.error_code().to_string(),
        message: err.to_string(),
    }
}

#[async_trait]
impl PeerClient for FakePeerClient {
    async fn get_dag(&self, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail> {
        let env = self.env_of(agent)?;
        env.service.dag_detail(generic_id).await.map_err(|e| remote(agent, e))
    }

    async fn apply_operator(&self, agent: &AgentAddr, generic_id: &str, operator: Operator) -> Result<DagDetail> {
        let env = self.env_of(agent)?;
        let dag = env
            .service
            .apply_operator(EntityKind::Dag, generic_id, operator)
            .await
            .map_err(|e| remote(agent, e))?;
        env.service.detail(&dag).await.map_err(|e| remote(agent, e))
    }

    async fn last_maintenance_dag(&self, agent: &AgentAddr) -> Result<Option<DagDetail>> {
        let env = self.env_of(agent)?;
        match env.service.last_maintenance_dag(true).await.map_err(|e| remote(agent, e))? {
            Some(dag) => Ok(Some(env.service.detail(&dag).await.map_err(|e| remote(agent, e))?)),
            None => Ok(None),
        }
    }

    async fn create_sub_dag(
        &self,
        agent: &AgentAddr,
        action: SubDagAction,
        request: &SubDagRequest,
    ) -> Result<SubDagResponse> {
        let env = self.env_of(agent)?;
        accept_sub_dag(&env, action, self.action_template(agent, action), request)
            .await
            .map_err(|e| remote(agent, e))
    }

    async fn kill_observer(&self, agent: &AgentAddr, force: bool) -> Result<()> {
        self.env_of(agent)?;
        self.killed.lock().unwrap().push((agent.clone(), force));
        Ok(())
    }

    async fn status(&self, agent: &AgentAddr) -> Result<AgentStatus> {
        let env = self.env_of(agent)?;
        Ok(AgentStatus {
            agent: agent.to_string(),
            identity: env.identity.current(),
            version: "test".to_string(),
            home_path: "/tmp".to_string(),
            is_maintainer: false,
            uptime_secs: 0,
            store_healthy: true,
        })
    }
}

// ============================================================================
// Cluster of in-process agents
// ============================================================================

pub struct TestAgent {
    pub env: Arc<AgentEnv>,
    maintainer: watch::Sender<bool>,
    executor: Option<ExecutorHandle>,
}

impl TestAgent {
    pub fn addr(&self) -> &AgentAddr {
        &self.env.agent
    }

    pub fn start(&mut self) {
        if self.executor.is_none() {
            self.executor = Some(ExecutorHandle::spawn(
                self.env.clone(),
                self.maintainer.subscribe(),
                test_executor(),
            ));
        }
    }

    pub async fn stop(&mut self) {
        if let Some(executor) = self.executor.take() {
            executor.shutdown().await;
        }
    }
}

pub struct TestCluster {
    pub store: Arc<SqlitePersistence>,
    pub peers: Arc<FakePeerClient>,
    pub agents: Vec<TestAgent>,
}

impl TestCluster {
    /// Agents at `addrs`; the first one maintains cluster dags. Executors
    /// are not started.
    pub async fn new(addrs: &[&str]) -> Self {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let peers = Arc::new(FakePeerClient::new());
        let registry = Arc::new(test_registry());
        let mut agents = Vec::new();
        for (i, raw) in addrs.iter().enumerate() {
            let env = Arc::new(
                AgentEnv::new(
                    addr(raw),
                    store.clone() as Arc<dyn Persistence>,
                    registry.clone(),
                    peers.clone() as Arc<dyn PeerClient>,
                )
                .with_poll(test_poll())
                .with_retry(RetryBudget::new(3, Duration::from_millis(10))),
            );
            peers.attach(&env);
            let (maintainer, _) = watch::channel(i == 0);
            agents.push(TestAgent {
                env,
                maintainer,
                executor: None,
            });
        }
        Self { store, peers, agents }
    }

    pub fn agent(&self, index: usize) -> &TestAgent {
        &self.agents[index]
    }

    pub fn env(&self, index: usize) -> &Arc<AgentEnv> {
        &self.agents[index].env
    }

    pub fn start(&mut self) {
        for agent in &mut self.agents {
            agent.start();
        }
    }

    pub async fn shutdown(mut self) {
        for agent in &mut self.agents {
            agent.stop().await;
        }
    }
}

/// Poll a dag through `env` until `done` holds. Panics after ten seconds.
pub async fn wait_for(env: &AgentEnv, generic_id: &str, done: impl Fn(&DagDetail) -> bool) -> DagDetail {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let dag = env.service.dag_detail(generic_id).await.unwrap();
        if done(&dag) {
            return dag;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "dag {} stuck in {} at stage {}/{} ({})",
                generic_id,
                dag.state,
                dag.stage,
                dag.max_stage,
                dag.failure_message()
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub async fn wait_terminal(env: &AgentEnv, generic_id: &str) -> DagDetail {
    wait_for(env, generic_id, |d| d.is_terminal()).await
}

/// States of every subtask, in stage order.
pub fn task_states(dag: &DagDetail) -> Vec<TaskState> {
    dag.nodes
        .iter()
        .flat_map(|n| n.tasks.iter().map(|t| t.state))
        .collect()
}

pub fn identity_of(cluster: &TestCluster, index: usize) -> AgentIdentity {
    cluster.env(index).identity.current()
}
