// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The main/sub dag hand-shake.
//!
//! A main dag coordinating peers runs, in order:
//!
//! 1. `CreateSubDagTask` asks every peer for a sub-dag and records the
//!    returned generic ids per peer.
//! 2. `CheckSubDagReadyTask` waits until every sub-dag sits at its
//!    wait-point.
//! 3. any steps of the main dag itself.
//! 4. `RetrySubDagTask` releases the peers. Its stage is the expected stage.
//! 5. `WaitSubDagFinishTask` waits for every sub-dag to succeed.
//! 6. `PassSubDagTask` passes whatever is still unfinished. It also runs
//!    when the main dag is passed after a failure, so the peers are freed
//!    whatever the outcome.
//!
//! A sub-dag is `[CheckDagStageTask, action nodes.., WaitPassOperatorTask]`.
//! `CheckDagStageTask` fails while the main dag is short of the expected
//! stage; that failure is the wait-point. Once the main dag reaches it, the
//! RETRY sent by the main dag lets the sub-dag run its action, and
//! `WaitPassOperatorTask` then holds it until the main dag moves on.

use async_trait::async_trait;
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use super::executable::{apply, fetch_dag, run_inverse, watch_dag};
use super::{SubDagAction, SubDagRequest, SubDagResponse};
use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::env::AgentEnv;
use crate::error::{CoreError, Result};
use crate::maintenance::Maintainer;
use crate::task::{Capabilities, Operator, TaskBody, TaskError, TaskRegistry, TaskRuntime, TaskState};
use crate::template::{NodeTemplate, TaskTemplate, Template, TemplateBuilder};
use crate::view::DagDetail;

pub const CREATE_SUB_DAG: &str = "CreateSubDagTask";
pub const CHECK_SUB_DAG_READY: &str = "CheckSubDagReadyTask";
pub const RETRY_SUB_DAG: &str = "RetrySubDagTask";
pub const WAIT_SUB_DAG_FINISH: &str = "WaitSubDagFinishTask";
pub const PASS_SUB_DAG: &str = "PassSubDagTask";
pub const CHECK_DAG_STAGE: &str = "CheckDagStageTask";
pub const WAIT_PASS_OPERATOR: &str = "WaitPassOperatorTask";

/// Sub-dag params naming the main dag.
pub const MAIN_DAG_ID: &str = "main_dag_id";
pub const MAIN_AGENT: &str = "main_agent";
pub const EXPECTED_STAGE: &str = "expected_stage";

/// Stage of a sub-dag at which it waits for the main dag.
pub const WAIT_POINT_STAGE: i32 = 1;

/// Name of the dag a peer runs for `action` on behalf of `main_dag_id`.
pub fn sub_dag_name(action: SubDagAction, main_dag_id: &str) -> String {
    format!("{} for {}", action, main_dag_id)
}

/// What the main-side protocol tasks coordinate. Carried as additional data
/// of every protocol subtask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubDagSpec {
    pub action: SubDagAction,
    pub peers: Vec<AgentAddr>,
    #[serde(default)]
    pub params: Map<String, Value>,
    /// Main dag stage the sub-dags wait for. Defaults to the stage of the
    /// next `RetrySubDagTask` node.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_stage: Option<i32>,
}

impl SubDagSpec {
    pub fn new(action: SubDagAction, peers: Vec<AgentAddr>) -> Self {
        Self {
            action,
            peers,
            params: Map::new(),
            expected_stage: None,
        }
    }

    pub fn with_params(mut self, params: Map<String, Value>) -> Self {
        self.params = params;
        self
    }

    pub fn with_expected_stage(mut self, stage: i32) -> Self {
        self.expected_stage = Some(stage);
        self
    }

    fn id_key(&self) -> String {
        format!("{}_sub_dag_id", self.action)
    }

    fn stage_key(&self) -> String {
        format!("{}_sub_dag_stage", self.action)
    }
}

fn capabilities(struct_name: &str) -> Capabilities {
    let caps = Capabilities::default().with_cancel(true);
    match struct_name {
        // Passing the release step would leave peers locked.
        PASS_SUB_DAG => caps.with_pass(false),
        _ => caps,
    }
}

/// Register every protocol task. Each agent needs both sides.
pub fn register_protocol_tasks(registry: &mut TaskRegistry) {
    registry
        .register(CREATE_SUB_DAG, capabilities(CREATE_SUB_DAG), || CreateSubDag)
        .register(CHECK_SUB_DAG_READY, capabilities(CHECK_SUB_DAG_READY), || CheckSubDagReady)
        .register(RETRY_SUB_DAG, capabilities(RETRY_SUB_DAG), || RetrySubDag)
        .register(WAIT_SUB_DAG_FINISH, capabilities(WAIT_SUB_DAG_FINISH), || WaitSubDagFinish)
        .register(PASS_SUB_DAG, capabilities(PASS_SUB_DAG), || PassSubDag)
        .register(CHECK_DAG_STAGE, capabilities(CHECK_DAG_STAGE), || CheckDagStage)
        .register(WAIT_PASS_OPERATOR, capabilities(WAIT_PASS_OPERATOR), || WaitPassOperator);
}

fn protocol_node(struct_name: &str, name: String, data: &Value) -> NodeTemplate {
    NodeTemplate::normal(
        TaskTemplate::new(struct_name, name)
            .with_capabilities(capabilities(struct_name))
            .with_additional_data(data.clone()),
    )
}

/// Main-side nodes coordinating `spec.peers`, with `own_steps` run by the
/// main dag while the peers wait.
pub fn sub_dag_wrapper(spec: &SubDagSpec, own_steps: Vec<NodeTemplate>) -> Result<Template> {
    if spec.peers.is_empty() {
        return Err(CoreError::Build(format!("{} sub-dags need at least one peer", spec.action)));
    }
    let data = serde_json::to_value(spec)?;
    let action = spec.action;
    let mut builder = TemplateBuilder::new(format!("{} on peers", action))
        .add_node(protocol_node(CREATE_SUB_DAG, format!("create {} sub-dags", action), &data))
        .add_node(protocol_node(CHECK_SUB_DAG_READY, format!("check {} sub-dags ready", action), &data));
    for step in own_steps {
        builder = builder.add_node(step);
    }
    builder
        .add_node(protocol_node(RETRY_SUB_DAG, format!("release {} sub-dags", action), &data))
        .add_node(protocol_node(WAIT_SUB_DAG_FINISH, format!("wait {} sub-dags finish", action), &data))
        .add_node(protocol_node(PASS_SUB_DAG, format!("pass {} sub-dags", action), &data))
        .build()
}

/// Peer-side template for `request`: the action nodes, wrapped in the
/// hand-shake nodes when the request names an expected stage.
///
/// The sub-dag is local to the peer and locks its own namespace globally.
pub fn sub_dag_template(
    action: SubDagAction,
    action_template: Option<Template>,
    request: &SubDagRequest,
) -> Result<(Template, TaskContext)> {
    let encode = |e: crate::context::ContextError| CoreError::Serialization(e.to_string());
    let mut context = TaskContext::new();
    context
        .set_param(MAIN_DAG_ID, &request.main_dag_id)
        .map_err(encode)?
        .set_param(MAIN_AGENT, &request.main_agent)
        .map_err(encode)?;
    for (key, value) in &request.params {
        context.set_param(key, value).map_err(encode)?;
    }

    let mut builder = TemplateBuilder::new(sub_dag_name(action, &request.main_dag_id)).local(true);
    match request.expected_stage {
        Some(stage) => {
            if stage < 1 || stage > request.main_max_stage {
                return Err(CoreError::Build(format!(
                    "expected stage {} outside 1..={} of main dag {}",
                    stage, request.main_max_stage, request.main_dag_id
                )));
            }
            context.set_param(EXPECTED_STAGE, stage).map_err(encode)?;
            builder = builder.add_node(peer_node(CHECK_DAG_STAGE, format!("wait for main dag stage {}", stage)));
            if let Some(action_template) = action_template {
                builder = builder.add_template(action_template);
            }
            builder = builder.add_node(peer_node(WAIT_PASS_OPERATOR, "wait for main dag to move on".to_string()));
        }
        None => {
            let action_template = action_template
                .ok_or_else(|| CoreError::Build(format!("{} has no steps to run", action)))?;
            builder = builder.add_template(action_template);
        }
    }
    let template = builder.maintenance(Maintainer::global()).build()?;
    Ok((template, context))
}

fn peer_node(struct_name: &str, name: String) -> NodeTemplate {
    NodeTemplate::normal(TaskTemplate::new(struct_name, name).with_capabilities(capabilities(struct_name)))
}

/// Create the sub-dag for `request` on this agent.
///
/// A repeated request for the same main dag returns the sub-dag created the
/// first time.
pub async fn accept_sub_dag(
    env: &AgentEnv,
    action: SubDagAction,
    action_template: Option<Template>,
    request: &SubDagRequest,
) -> Result<SubDagResponse> {
    let expected_stage = request.expected_stage.map(|_| WAIT_POINT_STAGE);
    let name = sub_dag_name(action, &request.main_dag_id);
    if let Some(existing) = env.service.last_maintenance_dag(true).await?
        && existing.name == name
    {
        info!(dag_id = %existing.generic_id(), %name, "Sub-dag already exists");
        return Ok(SubDagResponse {
            generic_id: existing.generic_id(),
            expected_stage,
        });
    }
    let (template, context) = sub_dag_template(action, action_template, request)?;
    let dag = env.service.create_dag(&template, context).await?;
    Ok(SubDagResponse {
        generic_id: dag.generic_id(),
        expected_stage,
    })
}

fn spec_of(rt: &TaskRuntime) -> std::result::Result<SubDagSpec, TaskError> {
    let data = rt
        .additional_data()
        .ok_or_else(|| TaskError::failed(format!("{} carries no sub-dag spec", rt.task().name)))?;
    serde_json::from_value(data.clone()).map_err(|e| TaskError::failed(format!("bad sub-dag spec: {}", e)))
}

/// A peer and the sub-dag it runs for this main dag.
struct SubDagRef {
    agent: AgentAddr,
    generic_id: String,
    wait_stage: i32,
}

async fn recorded_sub_dags(rt: &TaskRuntime, spec: &SubDagSpec) -> std::result::Result<Vec<SubDagRef>, TaskError> {
    let context = rt.context().await;
    let id_key = spec.id_key();
    let stage_key = spec.stage_key();
    let mut refs = Vec::with_capacity(spec.peers.len());
    for agent in &spec.peers {
        refs.push(SubDagRef {
            generic_id: context.agent_data::<String>(agent, &id_key).require(&id_key)?,
            wait_stage: context.agent_data::<i32>(agent, &stage_key).or(&stage_key, WAIT_POINT_STAGE)?,
            agent: agent.clone(),
        });
    }
    Ok(refs)
}

/// Whether a sub-dag rests at one of its hand-shake nodes.
fn is_waiting(dag: &DagDetail) -> bool {
    dag.is_at(CHECK_DAG_STAGE) || dag.is_at(WAIT_PASS_OPERATOR)
}

/// Whether any action node of a sub-dag ran.
fn action_ran(dag: &DagDetail) -> bool {
    dag.nodes.iter().any(|node| {
        node.tasks
            .iter()
            .any(|t| t.struct_name != CHECK_DAG_STAGE && t.struct_name != WAIT_PASS_OPERATOR && t.execute_times > 0)
    })
}

/// Fetch every sub-dag at once, in `subs` order.
async fn fetch_all(rt: &TaskRuntime, subs: &[SubDagRef]) -> std::result::Result<Vec<DagDetail>, TaskError> {
    try_join_all(subs.iter().map(|sub| fetch_dag(rt, &sub.agent, &sub.generic_id))).await
}

async fn wait_terminal(rt: &TaskRuntime, sub: &SubDagRef) -> std::result::Result<DagDetail, TaskError> {
    watch_dag(rt, &sub.agent, &sub.generic_id).await
}

/// Stage of the first `RetrySubDagTask` node after the running task.
async fn next_retry_stage(rt: &TaskRuntime) -> std::result::Result<i32, TaskError> {
    let meta = rt.dag();
    let dag = rt
        .env()
        .persistence
        .load_dag(meta.id)
        .await?
        .ok_or_else(|| CoreError::not_found("dag", &meta.generic_id))?;
    dag.nodes
        .iter()
        .find(|n| n.stage > meta.stage && n.tasks.first().is_some_and(|t| t.struct_name == RETRY_SUB_DAG))
        .map(|n| n.stage)
        .ok_or_else(|| TaskError::failed(format!("no {} follows stage {} of dag {}", RETRY_SUB_DAG, meta.stage, meta.generic_id)))
}

struct CreateSubDag;

#[async_trait]
impl TaskBody for CreateSubDag {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        let expected_stage = match spec.expected_stage {
            Some(stage) => stage,
            None => next_retry_stage(rt).await?,
        };
        let client = rt.env().peer.clone();
        for agent in &spec.peers {
            let recorded = rt.context().await.agent_data::<String>(agent, &spec.id_key()).into_option();
            if let Some(generic_id) = recorded {
                rt.log(format!("reusing {} sub-dag {} on {}", spec.action, generic_id, agent))
                    .await;
                continue;
            }
            let request = SubDagRequest {
                main_dag_id: rt.dag().generic_id.clone(),
                main_agent: rt.agent().clone(),
                expected_stage: Some(expected_stage),
                main_max_stage: rt.dag().max_stage,
                params: spec.params.clone(),
            };
            let response = rt
                .with_retry(&format!("create {} sub-dag on {}", spec.action, agent), || {
                    client.create_sub_dag(agent, spec.action, &request)
                })
                .await?;
            {
                let mut context = rt.context().await;
                context.set_agent_data(agent, &spec.id_key(), &response.generic_id)?;
                if let Some(stage) = response.expected_stage {
                    context.set_agent_data(agent, &spec.stage_key(), stage)?;
                }
            }
            rt.log(format!(
                "created {} sub-dag {} on {} waiting for stage {}",
                spec.action, response.generic_id, agent, expected_stage
            ))
            .await;
        }
        Ok(())
    }

    /// Roll back every sub-dag this task created.
    async fn rollback(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        for agent in &spec.peers {
            let recorded = rt.context().await.agent_data::<String>(agent, &spec.id_key()).into_option();
            let Some(generic_id) = recorded else {
                continue;
            };
            let sub = SubDagRef {
                agent: agent.clone(),
                generic_id,
                wait_stage: WAIT_POINT_STAGE,
            };
            roll_back_sub_dag(rt, &spec, &sub).await?;
        }
        Ok(())
    }
}

async fn roll_back_sub_dag(rt: &TaskRuntime, spec: &SubDagSpec, sub: &SubDagRef) -> std::result::Result<(), TaskError> {
    let mut dag = fetch_dag(rt, &sub.agent, &sub.generic_id).await?;
    if !dag.is_terminal() {
        rt.log(format!("cancelling sub-dag {} on {} before rollback", sub.generic_id, sub.agent))
            .await;
        apply(rt, &sub.agent, &sub.generic_id, Operator::Cancel).await?;
        dag = wait_terminal(rt, sub).await?;
    }
    match dag.state {
        TaskState::Succeed if dag.operator == Operator::Rollback => Ok(()),
        TaskState::Succeed if !action_ran(&dag) => {
            rt.log(format!("sub-dag {} on {} never ran its action", sub.generic_id, sub.agent))
                .await;
            Ok(())
        }
        TaskState::Succeed => run_inverse(rt, &sub.agent, spec.action, &spec.params).await,
        _ => {
            rt.log(format!("rolling back sub-dag {} on {}", sub.generic_id, sub.agent))
                .await;
            apply(rt, &sub.agent, &sub.generic_id, Operator::Rollback).await?;
            let done = wait_terminal(rt, sub).await?;
            if done.is_failed() {
                return Err(TaskError::failed(format!(
                    "rollback on {} failed: {}",
                    sub.agent,
                    done.failure_message()
                )));
            }
            Ok(())
        }
    }
}

struct CheckSubDagReady;

#[async_trait]
impl TaskBody for CheckSubDagReady {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        let subs = recorded_sub_dags(rt, &spec).await?;
        let subs = &subs;
        rt.poll_until(&format!("{} sub-dags to reach their wait-point", spec.action), || async move {
            let mut waiting = 0;
            for (sub, dag) in subs.iter().zip(fetch_all(rt, subs).await?) {
                match dag.state {
                    TaskState::Succeed => {}
                    TaskState::Failed if dag.stage == sub.wait_stage && is_waiting(&dag) => {}
                    TaskState::Failed => {
                        return Err(TaskError::failed(format!(
                            "sub-dag on {} failed: {}",
                            sub.agent,
                            dag.failure_message()
                        )));
                    }
                    _ if dag.stage > sub.wait_stage => {}
                    _ => waiting += 1,
                }
            }
            Ok((waiting == 0).then_some(()))
        })
        .await
    }
}

struct RetrySubDag;

#[async_trait]
impl TaskBody for RetrySubDag {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        for sub in recorded_sub_dags(rt, &spec).await? {
            let dag = fetch_dag(rt, &sub.agent, &sub.generic_id).await?;
            match dag.state {
                TaskState::Failed if is_waiting(&dag) => {
                    apply(rt, &sub.agent, &sub.generic_id, Operator::Retry).await?;
                    rt.log(format!("released sub-dag {} on {}", sub.generic_id, sub.agent))
                        .await;
                }
                TaskState::Failed => {
                    return Err(TaskError::failed(format!(
                        "sub-dag on {} failed: {}",
                        sub.agent,
                        dag.failure_message()
                    )));
                }
                // Already released.
                _ => {}
            }
        }
        Ok(())
    }
}

struct WaitSubDagFinish;

#[async_trait]
impl TaskBody for WaitSubDagFinish {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        let subs = recorded_sub_dags(rt, &spec).await?;

        if rt.operator() == Operator::Retry {
            for sub in &subs {
                let dag = fetch_dag(rt, &sub.agent, &sub.generic_id).await?;
                if dag.is_failed() {
                    apply(rt, &sub.agent, &sub.generic_id, Operator::Retry).await?;
                    rt.log(format!("retrying failed sub-dag {} on {}", sub.generic_id, sub.agent))
                        .await;
                }
            }
        }

        let subs_ref = &subs;
        let outcome = rt
            .poll_until(&format!("{} sub-dags to finish", spec.action), || async move {
                let mut running = 0;
                for (sub, dag) in subs_ref.iter().zip(fetch_all(rt, subs_ref).await?) {
                    if dag.is_failed() {
                        return Err(TaskError::failed(format!(
                            "sub-dag on {} failed: {}",
                            sub.agent,
                            dag.failure_message()
                        )));
                    }
                    if !dag.is_succeed() {
                        running += 1;
                    }
                }
                Ok((running == 0).then_some(()))
            })
            .await;

        if let Err(TaskError::Timeout { .. }) = &outcome {
            for sub in &subs {
                if let Err(e) = cancel_and_wait(rt, sub).await {
                    warn!(agent = %sub.agent, dag_id = %sub.generic_id, error = %e, "Failed to cancel overdue sub-dag");
                    rt.log(format!("could not cancel sub-dag {} on {}: {}", sub.generic_id, sub.agent, e))
                        .await;
                }
            }
        }
        outcome
    }
}

async fn cancel_and_wait(rt: &TaskRuntime, sub: &SubDagRef) -> std::result::Result<DagDetail, TaskError> {
    let dag = fetch_dag(rt, &sub.agent, &sub.generic_id).await?;
    if dag.is_terminal() {
        return Ok(dag);
    }
    rt.log(format!("cancelling sub-dag {} on {}", sub.generic_id, sub.agent))
        .await;
    apply(rt, &sub.agent, &sub.generic_id, Operator::Cancel).await?;
    wait_terminal(rt, sub).await
}

struct PassSubDag;

#[async_trait]
impl TaskBody for PassSubDag {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let spec = spec_of(rt)?;
        for agent in &spec.peers {
            // A peer the main dag never reached holds nothing.
            let recorded = rt.context().await.agent_data::<String>(agent, &spec.id_key()).into_option();
            let Some(generic_id) = recorded else {
                continue;
            };
            let sub = SubDagRef {
                agent: agent.clone(),
                generic_id,
                wait_stage: WAIT_POINT_STAGE,
            };
            let dag = cancel_and_wait(rt, &sub).await?;
            if dag.is_failed() {
                apply(rt, &sub.agent, &sub.generic_id, Operator::Pass).await?;
                rt.log(format!("passed sub-dag {} on {}", sub.generic_id, sub.agent))
                    .await;
            }
        }
        Ok(())
    }
}

/// Where the main dag named by a sub-dag's params is.
struct MainDag {
    agent: AgentAddr,
    generic_id: String,
    expected_stage: i32,
}

async fn main_dag_of(rt: &TaskRuntime) -> std::result::Result<MainDag, TaskError> {
    let context = rt.context().await;
    Ok(MainDag {
        agent: context.param(MAIN_AGENT).require(MAIN_AGENT)?,
        generic_id: context.param(MAIN_DAG_ID).require(MAIN_DAG_ID)?,
        expected_stage: context.param(EXPECTED_STAGE).require(EXPECTED_STAGE)?,
    })
}

struct CheckDagStage;

#[async_trait]
impl TaskBody for CheckDagStage {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let main = main_dag_of(rt).await?;
        let dag = fetch_dag(rt, &main.agent, &main.generic_id).await?;
        if dag.is_failed() {
            return Err(TaskError::failed(format!("main dag {} failed", main.generic_id)));
        }
        if dag.is_succeed() || dag.stage >= main.expected_stage {
            rt.log(format!("main dag {} reached stage {}", main.generic_id, dag.stage))
                .await;
            return Ok(());
        }
        Err(TaskError::failed(format!(
            "main dag {} is at stage {}, waiting for stage {}",
            main.generic_id, dag.stage, main.expected_stage
        )))
    }
}

struct WaitPassOperator;

#[async_trait]
impl TaskBody for WaitPassOperator {
    async fn execute(&self, rt: &TaskRuntime) -> std::result::Result<(), TaskError> {
        let main = main_dag_of(rt).await?;
        let main = &main;
        rt.poll_until(&format!("main dag {} to pass stage {}", main.generic_id, main.expected_stage), || async move {
            let dag = fetch_dag(rt, &main.agent, &main.generic_id).await?;
            if dag.is_failed() {
                return Err(TaskError::failed(format!("main dag {} failed", main.generic_id)));
            }
            Ok((dag.is_succeed() || dag.stage > main.expected_stage).then_some(()))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(expected_stage: Option<i32>) -> SubDagRequest {
        SubDagRequest {
            main_dag_id: "1042".to_string(),
            main_agent: "10.0.0.1:2886".parse().unwrap(),
            expected_stage,
            main_max_stage: 5,
            params: Map::from_iter([("tenant".to_string(), Value::String("t1".to_string()))]),
        }
    }

    fn stop_template() -> Template {
        TemplateBuilder::new("stop observer")
            .add_node(NodeTemplate::normal(TaskTemplate::new("StopObserverTask", "stop observer")))
            .build()
            .unwrap()
    }

    #[test]
    fn test_sub_dag_is_wrapped_in_hand_shake() {
        let (template, context) =
            sub_dag_template(SubDagAction::Stop, Some(stop_template()), &request(Some(3))).unwrap();
        let names: Vec<&str> = template
            .nodes
            .iter()
            .map(|n| n.tasks[0].struct_name.as_str())
            .collect();
        assert_eq!(names, vec![CHECK_DAG_STAGE, "StopObserverTask", WAIT_PASS_OPERATOR]);
        assert!(template.is_local);
        assert_eq!(template.maintainer, Maintainer::global());
        assert_eq!(template.name, "stop for 1042");
        assert_eq!(context.param::<i32>(EXPECTED_STAGE).into_option(), Some(3));
        assert_eq!(context.param::<String>("tenant").into_option().unwrap(), "t1");
    }

    #[test]
    fn test_expected_stage_beyond_main_dag_is_rejected() {
        let err = sub_dag_template(SubDagAction::Stop, Some(stop_template()), &request(Some(6))).unwrap_err();
        assert!(matches!(err, CoreError::Build(_)));
        assert!(sub_dag_template(SubDagAction::Stop, None, &request(Some(0))).is_err());
        // An empty action is fine inside the hand-shake.
        assert_eq!(
            sub_dag_template(SubDagAction::Stop, None, &request(Some(5)))
                .unwrap()
                .0
                .max_stage(),
            2
        );
    }

    #[test]
    fn test_standalone_dag_needs_steps() {
        assert!(sub_dag_template(SubDagAction::Start, None, &request(None)).is_err());
        let (template, _) = sub_dag_template(SubDagAction::Start, Some(stop_template()), &request(None)).unwrap();
        assert_eq!(template.max_stage(), 1);
    }

    #[test]
    fn test_wrapper_orders_protocol_nodes() {
        let peers = vec!["10.0.0.2:2886".parse().unwrap(), "10.0.0.3:2886".parse().unwrap()];
        let spec = SubDagSpec::new(SubDagAction::Stop, peers);
        let own = NodeTemplate::normal(TaskTemplate::new("MajorFreezeTask", "major freeze"));
        let template = sub_dag_wrapper(&spec, vec![own]).unwrap();
        let names: Vec<&str> = template
            .nodes
            .iter()
            .map(|n| n.tasks[0].struct_name.as_str())
            .collect();
        assert_eq!(
            names,
            vec![
                CREATE_SUB_DAG,
                CHECK_SUB_DAG_READY,
                "MajorFreezeTask",
                RETRY_SUB_DAG,
                WAIT_SUB_DAG_FINISH,
                PASS_SUB_DAG
            ]
        );
        let carried: SubDagSpec =
            serde_json::from_value(template.nodes[0].tasks[0].additional_data.clone().unwrap()).unwrap();
        assert_eq!(carried, spec);
        assert!(!template.nodes[5].tasks[0].capabilities.can_pass);

        assert!(sub_dag_wrapper(&SubDagSpec::new(SubDagAction::Stop, vec![]), vec![]).is_err());
    }
}
