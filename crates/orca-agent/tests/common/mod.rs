// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for orca-agent integration tests.
//!
//! Agents share one in-memory store and each drives a [`FakeObserverOps`].
//! Peer calls go through the real RPC router of the target agent, so every
//! flow test also exercises the handlers.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, header};
use http_body_util::BodyExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::watch;
use tower::ServiceExt;

use orca_agent::flows::task_registry;
use orca_agent::handlers::AppState;
use orca_agent::observer::{FakeObserverOps, ObserverOps};
use orca_agent::server;
use orca_core::error::{CoreError, Result};
use orca_core::remote::{ErrorBody, KillObserverRequest, OperatorRequest, PeerClient, SubDagRequest, SubDagResponse};
use orca_core::{
    AgentAddr, AgentEnv, AgentIdentity, AgentStatus, DagDetail, ExecutorConfig, ExecutorHandle, Operator, Persistence,
    PollPolicy, RetryBudget, SqlitePersistence, SubDagAction,
};

pub const A: &str = "10.0.0.1:2886";
pub const B: &str = "10.0.0.2:2886";
pub const C: &str = "10.0.0.3:2886";

pub const VERSION: &str = "0.3.0";
pub const HOME: &str = "/home/admin";

pub fn addr(s: &str) -> AgentAddr {
    s.parse().unwrap()
}

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
// Peer client over the RPC router
// ============================================================================

struct Route {
    env: Weak<AgentEnv>,
    ops: Arc<dyn ObserverOps>,
    maintainer: watch::Receiver<bool>,
}

/// Serves peer calls with the target agent's router, without a socket.
#[derive(Default)]
pub struct RouterPeerClient {
    routes: RwLock<HashMap<AgentAddr, Route>>,
    unreachable: RwLock<HashSet<AgentAddr>>,
}

impl RouterPeerClient {
    pub fn attach(&self, env: &Arc<AgentEnv>, ops: Arc<dyn ObserverOps>, maintainer: watch::Receiver<bool>) {
        self.routes.write().unwrap().insert(
            env.agent.clone(),
            Route {
                env: Arc::downgrade(env),
                ops,
                maintainer,
            },
        );
    }

    pub fn set_unreachable(&self, agent: &AgentAddr, unreachable: bool) {
        let mut set = self.unreachable.write().unwrap();
        if unreachable {
            set.insert(agent.clone());
        } else {
            set.remove(agent);
        }
    }

    /// The router `agent` would serve.
    pub fn router(&self, agent: &AgentAddr) -> Result<Router> {
        let transport = || CoreError::Transport {
            agent: agent.to_string(),
            details: "connection refused".to_string(),
        };
        if self.unreachable.read().unwrap().contains(agent) {
            return Err(transport());
        }
        let routes = self.routes.read().unwrap();
        let route = routes.get(agent).ok_or_else(transport)?;
        let env = route.env.upgrade().ok_or_else(transport)?;
        Ok(server::router(AppState::new(
            env,
            route.ops.clone(),
            route.maintainer.clone(),
            VERSION,
            HOME,
        )))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        agent: &AgentAddr,
        method: Method,
        uri: String,
        body: Option<&impl Serialize>,
    ) -> Result<T> {
        let router = self.router(agent)?;
        let (status, bytes) = send(router, method, &uri, body).await;
        if status.is_success() {
            let bytes = if bytes.is_empty() { b"null".to_vec() } else { bytes };
            return Ok(serde_json::from_slice(&bytes)?);
        }
        let (code, message) = match serde_json::from_slice::<ErrorBody>(&bytes) {
            Ok(body) => (body.code, body.message),
            Err(_) => (status.as_u16().to_string(), String::from_utf8_lossy(&bytes).to_string()),
        };
        Err(CoreError::Remote {
            agent: agent.to_string(),
            code,
            message,
        })
    }
}

/// Send one request through `router` and collect the answer.
pub async fn send(
    router: Router,
    method: Method,
    uri: &str,
    body: Option<&impl Serialize>,
) -> (axum::http::StatusCode, Vec<u8>) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_vec(body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes().to_vec();
    (status, bytes)
}

const NO_BODY: Option<&()> = None;

#[async_trait]
impl PeerClient for RouterPeerClient {
    async fn get_dag(&self, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail> {
        self.call(agent, Method::GET, format!("/task/v1/dag/{}", generic_id), NO_BODY)
            .await
    }

    async fn apply_operator(&self, agent: &AgentAddr, generic_id: &str, operator: Operator) -> Result<DagDetail> {
        self.call(
            agent,
            Method::POST,
            format!("/task/v1/dag/{}", generic_id),
            Some(&OperatorRequest { operator }),
        )
        .await
    }

    async fn last_maintenance_dag(&self, agent: &AgentAddr) -> Result<Option<DagDetail>> {
        self.call(agent, Method::GET, "/task/v1/dag/maintain/agent".to_string(), NO_BODY)
            .await
    }

    async fn create_sub_dag(
        &self,
        agent: &AgentAddr,
        action: SubDagAction,
        request: &SubDagRequest,
    ) -> Result<SubDagResponse> {
        self.call(agent, Method::POST, format!("/ob/v1/rpc/{}", action), Some(request))
            .await
    }

    async fn kill_observer(&self, agent: &AgentAddr, force: bool) -> Result<()> {
        self.call(
            agent,
            Method::DELETE,
            "/observer/rpc".to_string(),
            Some(&KillObserverRequest { force_kill: force }),
        )
        .await
    }

    async fn status(&self, agent: &AgentAddr) -> Result<AgentStatus> {
        self.call(agent, Method::GET, "/api/v1/status".to_string(), NO_BODY)
            .await
    }
}

// ============================================================================
// Cluster of in-process agents
// ============================================================================

pub struct TestAgent {
    pub env: Arc<AgentEnv>,
    pub ops: Arc<FakeObserverOps>,
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
    pub peers: Arc<RouterPeerClient>,
    pub agents: Vec<TestAgent>,
}

impl TestCluster {
    /// Registered SINGLE agents at `addrs`, each with a fresh fake observer;
    /// the first one maintains cluster dags. Executors are not started.
    pub async fn new(addrs: &[&str]) -> Self {
        Self::with_observers(addrs, |_| FakeObserverOps::new()).await
    }

    /// Like [`TestCluster::new`], with the observer of agent `i` built by
    /// `observer(i)`.
    pub async fn with_observers(addrs: &[&str], observer: impl Fn(usize) -> FakeObserverOps) -> Self {
        let store = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let peers = Arc::new(RouterPeerClient::default());
        let mut agents = Vec::new();
        for (i, raw) in addrs.iter().enumerate() {
            let ops = Arc::new(observer(i));
            let registry = Arc::new(task_registry(ops.clone() as Arc<dyn ObserverOps>));
            let env = Arc::new(
                AgentEnv::new(
                    addr(raw),
                    store.clone() as Arc<dyn Persistence>,
                    registry,
                    peers.clone() as Arc<dyn PeerClient>,
                )
                .with_poll(test_poll())
                .with_retry(RetryBudget::new(3, Duration::from_millis(10))),
            );
            env.identity.register(VERSION, HOME).await.unwrap();
            let (maintainer, _) = watch::channel(i == 0);
            peers.attach(&env, ops.clone() as Arc<dyn ObserverOps>, maintainer.subscribe());
            agents.push(TestAgent {
                env,
                ops,
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

    pub fn ops(&self, index: usize) -> &Arc<FakeObserverOps> {
        &self.agents[index].ops
    }

    /// The router agent `index` serves.
    pub fn router(&self, index: usize) -> Router {
        self.peers.router(self.agents[index].addr()).unwrap()
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

/// Move a registered SINGLE agent into the cluster.
pub async fn join_cluster(env: &AgentEnv, agent: &AgentAddr) {
    env.identity
        .set_identity(agent, AgentIdentity::TakeOverFollower)
        .await
        .unwrap();
    env.identity
        .set_identity(agent, AgentIdentity::ClusterAgent)
        .await
        .unwrap();
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

pub async fn stored_identity(cluster: &TestCluster, agent: &str) -> AgentIdentity {
    cluster.env(0).identity.stored(&addr(agent)).await.unwrap()
}
