// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Main/sub dag hand-shake and remote dag tests across in-process agents.

mod common;

use serde_json::Map;

use common::*;
use orca_core::context::TaskContext;
use orca_core::maintenance::Maintainer;
use orca_core::persistence::DagFilter;
use orca_core::remote::{
    CHECK_DAG_STAGE, EXPECTED_STAGE, SubDagAction, SubDagRequest, SubDagSpec, WAIT_PASS_OPERATOR, WAIT_POINT_STAGE,
    accept_sub_dag, sub_dag_name, sub_dag_wrapper,
};
use orca_core::service::EntityKind;
use orca_core::task::{Operator, TaskState};
use orca_core::template::{NodeTemplate, Template, TemplateBuilder};
use orca_core::view::DagDetail;
use orca_core::{AgentEnv, CoreError};

fn stop_on_peers(peers: &[&str]) -> Template {
    let spec = SubDagSpec::new(SubDagAction::Stop, peers.iter().map(|p| addr(p)).collect());
    TemplateBuilder::new("Stop observers")
        .add_template(sub_dag_wrapper(&spec, vec![]).unwrap())
        .maintenance(Maintainer::global())
        .build()
        .unwrap()
}

/// Every dag named `name` in the store, as seen by `env`.
async fn dags_named(env: &AgentEnv, name: &str) -> Vec<DagDetail> {
    let filter = DagFilter {
        name: Some(name.to_string()),
        ..DagFilter::default()
    };
    env.service.list_dags(&filter).await.unwrap()
}

#[tokio::test]
async fn test_hand_shake_leaves_no_peer_dag_running() {
    let mut cluster = TestCluster::new(&[A, B, C]).await;
    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&stop_on_peers(&[B, C]), TaskContext::new())
        .await
        .unwrap();
    let gid = main.generic_id();
    // create, check ready, release, wait finish, pass
    assert_eq!(main.max_stage, 5);
    cluster.start();

    let done = wait_terminal(&main_env, &gid).await;
    assert_eq!(done.state, TaskState::Succeed, "{}", done.failure_message());
    assert!(main_env.service.last_maintenance_dag(false).await.unwrap().is_none());

    for index in [1, 2] {
        let peer = cluster.env(index).clone();
        let subs = dags_named(&peer, &sub_dag_name(SubDagAction::Stop, &gid)).await;
        assert_eq!(subs.len(), 2, "one sub-dag per peer");
        let own: Vec<&DagDetail> = subs.iter().filter(|d| d.owner == peer.agent.to_string()).collect();
        assert_eq!(own.len(), 1);
        let sub = peer.service.dag_detail(&own[0].generic_id).await.unwrap();
        assert_eq!(sub.state, TaskState::Succeed);
        assert!(sub.is_local);

        let structs: Vec<&str> = sub.nodes.iter().map(|n| n.tasks[0].struct_name.as_str()).collect();
        assert_eq!(structs, vec![CHECK_DAG_STAGE, "StopObserverTask", WAIT_PASS_OPERATOR]);
        // The action ran exactly once, after the main dag released it.
        assert_eq!(sub.nodes[1].tasks[0].execute_times, 1);
        // The first stage check ran into the wait-point and was retried.
        assert_eq!(sub.nodes[0].tasks[0].execute_times, 2);
        assert!(peer.service.last_maintenance_dag(true).await.unwrap().is_none());

        // The sub-dag waited for the stage of the release node.
        let stored = peer.service.resolve(EntityKind::Dag, &sub.generic_id).await.unwrap();
        assert_eq!(stored.context.param::<i32>(EXPECTED_STAGE).into_option(), Some(3));
    }

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_peer_failure_fails_main_and_rollback_releases_peers() {
    let mut cluster = TestCluster::new(&[A, B, C]).await;
    cluster.peers.set_agent_action(
        &addr(B),
        SubDagAction::Stop,
        TemplateBuilder::new("stop observer")
            .add_node(NodeTemplate::normal(task("FailTask", "stop observer")))
            .build()
            .unwrap(),
    );
    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&stop_on_peers(&[B, C]), TaskContext::new())
        .await
        .unwrap();
    let gid = main.generic_id();
    cluster.start();

    let failed = wait_terminal(&main_env, &gid).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert!(failed.failure_message().contains(B), "{}", failed.failure_message());
    // B's sub-dag failed inside its action and keeps its lock.
    assert!(cluster.env(1).service.last_maintenance_dag(true).await.unwrap().is_some());

    main_env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Rollback)
        .await
        .unwrap();
    let rolled = wait_terminal(&main_env, &gid).await;
    assert_eq!(rolled.state, TaskState::Succeed, "{}", rolled.failure_message());
    assert_eq!(rolled.operator, Operator::Rollback);

    // Every peer is free again.
    for index in [1, 2] {
        let peer = cluster.env(index).clone();
        let busy = peer.service.last_maintenance_dag(true).await.unwrap();
        assert!(busy.is_none(), "{} still holds {:?}", peer.agent, busy.map(|d| d.name));
    }
    let b_sub = dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Stop, &gid))
        .await
        .into_iter()
        .find(|d| d.owner == B)
        .unwrap();
    assert_eq!(b_sub.state, TaskState::Succeed);
    assert_eq!(b_sub.operator, Operator::Rollback);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_peer_failure_then_pass_releases_peers() {
    let mut cluster = TestCluster::new(&[A, B, C]).await;
    cluster.peers.set_agent_action(
        &addr(B),
        SubDagAction::Stop,
        TemplateBuilder::new("stop observer")
            .add_node(NodeTemplate::normal(task("FailTask", "stop observer")))
            .build()
            .unwrap(),
    );
    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&stop_on_peers(&[B, C]), TaskContext::new())
        .await
        .unwrap();
    let gid = main.generic_id();
    cluster.start();

    let failed = wait_terminal(&main_env, &gid).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert!(cluster.env(1).service.last_maintenance_dag(true).await.unwrap().is_some());

    main_env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Pass)
        .await
        .unwrap();
    let passed = wait_terminal(&main_env, &gid).await;
    assert_eq!(passed.state, TaskState::Succeed, "{}", passed.failure_message());
    assert_eq!(passed.operator, Operator::Pass);
    assert!(main_env.service.last_maintenance_dag(false).await.unwrap().is_none());
    // The release step ran even though the dag was passed.
    assert_eq!(passed.nodes[4].tasks[0].execute_times, 1);

    for index in [1, 2] {
        let peer = cluster.env(index).clone();
        let busy = peer.service.last_maintenance_dag(true).await.unwrap();
        assert!(busy.is_none(), "{} still holds {:?}", peer.agent, busy.map(|d| d.name));
    }
    let b_sub = dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Stop, &gid))
        .await
        .into_iter()
        .find(|d| d.owner == B)
        .unwrap();
    assert_eq!(b_sub.state, TaskState::Succeed);
    assert_eq!(b_sub.operator, Operator::Pass);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_sub_dag_request_is_idempotent_and_bounded() {
    let cluster = TestCluster::new(&[A, B]).await;
    let peer = cluster.env(1).clone();
    let request = SubDagRequest {
        main_dag_id: "1042".to_string(),
        main_agent: addr(A),
        expected_stage: Some(3),
        main_max_stage: 5,
        params: Map::new(),
    };

    let first = accept_sub_dag(&peer, SubDagAction::Stop, Some(single_step("StopObserverTask")), &request)
        .await
        .unwrap();
    assert_eq!(first.expected_stage, Some(WAIT_POINT_STAGE));
    let second = accept_sub_dag(&peer, SubDagAction::Stop, Some(single_step("StopObserverTask")), &request)
        .await
        .unwrap();
    assert_eq!(first.generic_id, second.generic_id);

    // A different main dag finds the peer busy.
    let other = SubDagRequest {
        main_dag_id: "1043".to_string(),
        ..request.clone()
    };
    let busy = accept_sub_dag(&peer, SubDagAction::Stop, None, &other).await;
    assert!(matches!(busy, Err(CoreError::MaintenanceConflict { .. })));

    // An expected stage past the main dag's last stage never inserts a row.
    let beyond = SubDagRequest {
        main_dag_id: "1044".to_string(),
        expected_stage: Some(6),
        ..request
    };
    let err = accept_sub_dag(cluster.env(0), SubDagAction::Stop, None, &beyond).await.unwrap_err();
    assert!(matches!(err, CoreError::Build(_)));
    assert!(dags_named(cluster.env(0), &sub_dag_name(SubDagAction::Stop, "1044")).await.is_empty());
}

fn remote_start_dag() -> Template {
    TemplateBuilder::new("Start observer on B")
        .add_node(NodeTemplate::normal(remote_start(B)))
        .add_node(NodeTemplate::normal(task("FailTask", "fails after start")))
        .maintenance(Maintainer::global())
        .build()
        .unwrap()
}

#[tokio::test]
async fn test_remote_dag_is_compensated_on_rollback() {
    let mut cluster = TestCluster::new(&[A, B]).await;
    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&remote_start_dag(), TaskContext::new())
        .await
        .unwrap();
    let gid = main.generic_id();
    cluster.start();

    let failed = wait_terminal(&main_env, &gid).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 2);
    let started = dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Start, &gid)).await;
    assert_eq!(started.len(), 1);
    assert_eq!(started[0].state, TaskState::Succeed);

    main_env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Rollback)
        .await
        .unwrap();
    let rolled = wait_terminal(&main_env, &gid).await;
    assert_eq!(rolled.state, TaskState::Succeed, "{}", rolled.failure_message());

    // The finished start was undone by a fresh stop dag, not rolled back.
    let stopped = dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Stop, &gid)).await;
    assert_eq!(stopped.len(), 1);
    assert_eq!(stopped[0].state, TaskState::Succeed);
    let started = dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Start, &gid)).await;
    assert_eq!(started[0].operator, Operator::Run);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_remote_dag_refuses_busy_peer() {
    let mut cluster = TestCluster::new(&[A, B]).await;
    // B is busy with unrelated local maintenance that never gets driven.
    let chore = TemplateBuilder::new("local chore")
        .add_node(NodeTemplate::normal(task("NoopTask", "chore")))
        .maintenance(Maintainer::global())
        .local(true)
        .build()
        .unwrap();
    let holder = cluster.env(1).service.create_dag(&chore, TaskContext::new()).await.unwrap();

    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&remote_start_dag(), TaskContext::new())
        .await
        .unwrap();
    cluster.agents[0].start();

    let failed = wait_terminal(&main_env, &main.generic_id()).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 1);
    let message = failed.failure_message();
    assert!(message.contains("MAINTENANCE_CONFLICT") && message.contains(&holder.generic_id()), "{}", message);
    assert!(dags_named(cluster.env(1), &sub_dag_name(SubDagAction::Start, &main.generic_id())).await.is_empty());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_unreachable_peer_fails_after_retry_budget() {
    let mut cluster = TestCluster::new(&[A, B]).await;
    cluster.peers.set_unreachable(&addr(B), true);
    let main_env = cluster.env(0).clone();
    let main = main_env
        .service
        .create_dag(&stop_on_peers(&[B]), TaskContext::new())
        .await
        .unwrap();
    cluster.start();

    let failed = wait_terminal(&main_env, &main.generic_id()).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 1);
    assert!(failed.failure_message().contains("transport"), "{}", failed.failure_message());

    // Once the peer is back, a retry creates the sub-dag.
    cluster.peers.set_unreachable(&addr(B), false);
    main_env
        .service
        .apply_operator(EntityKind::Dag, &main.generic_id(), Operator::Retry)
        .await
        .unwrap();
    let done = wait_terminal(&main_env, &main.generic_id()).await;
    assert_eq!(done.state, TaskState::Succeed, "{}", done.failure_message());

    cluster.shutdown().await;
}
