// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! JSON-over-HTTP peer client.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::debug;

use super::{ErrorBody, KillObserverRequest, OperatorRequest, PeerClient, SubDagAction, SubDagRequest, SubDagResponse};
use crate::agent::AgentAddr;
use crate::error::{CoreError, Result};
use crate::task::Operator;
use crate::view::{AgentStatus, DagDetail};

#[derive(Debug, Clone)]
pub struct HttpPeerClient {
    http: Client,
}

impl HttpPeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }

    fn url(&self, agent: &AgentAddr, path: &str) -> String {
        format!("http://{}{}", agent, path)
    }

    async fn send<T: DeserializeOwned>(&self, agent: &AgentAddr, request: RequestBuilder) -> Result<T> {
        let response = request.send().await.map_err(|e| transport(agent, e))?;
        let response = check(agent, response).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| CoreError::Serialization(format!("bad response from {}: {}", agent, e)))
    }
}

impl Default for HttpPeerClient {
    fn default() -> Self {
        Self { http: Client::new() }
    }
}

fn transport(agent: &AgentAddr, err: reqwest::Error) -> CoreError {
    CoreError::Transport {
        agent: agent.to_string(),
        details: err.to_string(),
    }
}

/// Turn a non-success response into an error. Gateway failures without an
/// error body are transport errors so callers retry them.
async fn check(agent: &AgentAddr, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    if let Ok(error) = serde_json::from_str::<ErrorBody>(&body) {
        return Err(CoreError::Remote {
            agent: agent.to_string(),
            code: error.code,
            message: error.message,
        });
    }
    if matches!(
        status,
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT
    ) {
        return Err(CoreError::Transport {
            agent: agent.to_string(),
            details: format!("{}: {}", status, body),
        });
    }
    Err(CoreError::Remote {
        agent: agent.to_string(),
        code: status.as_u16().to_string(),
        message: body,
    })
}

#[async_trait]
impl PeerClient for HttpPeerClient {
    async fn get_dag(&self, agent: &AgentAddr, generic_id: &str) -> Result<DagDetail> {
        let url = self.url(agent, &format!("/task/v1/dag/{}", generic_id));
        self.send(agent, self.http.get(url)).await
    }

    async fn apply_operator(&self, agent: &AgentAddr, generic_id: &str, operator: Operator) -> Result<DagDetail> {
        debug!(%agent, dag_id = generic_id, %operator, "Sending operator to peer");
        let url = self.url(agent, &format!("/task/v1/dag/{}", generic_id));
        self.send(agent, self.http.post(url).json(&OperatorRequest { operator }))
            .await
    }

    async fn last_maintenance_dag(&self, agent: &AgentAddr) -> Result<Option<DagDetail>> {
        let url = self.url(agent, "/task/v1/dag/maintain/agent");
        self.send(agent, self.http.get(url)).await
    }

    async fn create_sub_dag(
        &self,
        agent: &AgentAddr,
        action: SubDagAction,
        request: &SubDagRequest,
    ) -> Result<SubDagResponse> {
        debug!(%agent, %action, main_dag_id = %request.main_dag_id, "Requesting sub-dag");
        let url = self.url(agent, &format!("/ob/v1/rpc/{}", action));
        self.send(agent, self.http.post(url).json(request)).await
    }

    async fn kill_observer(&self, agent: &AgentAddr, force: bool) -> Result<()> {
        let url = self.url(agent, "/observer/rpc");
        let response = self
            .http
            .delete(url)
            .json(&KillObserverRequest { force_kill: force })
            .send()
            .await
            .map_err(|e| transport(agent, e))?;
        check(agent, response).await?;
        Ok(())
    }

    async fn status(&self, agent: &AgentAddr) -> Result<AgentStatus> {
        let url = self.url(agent, "/api/v1/status");
        self.send(agent, self.http.get(url)).await
    }
}
