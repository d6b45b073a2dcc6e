// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Dag lifecycle tests: forward execution, operators and restart recovery.

mod common;

use chrono::Utc;
use tokio::sync::watch;

use common::*;
use orca_core::context::TaskContext;
use orca_core::executor::{Driver, Runner};
use orca_core::maintenance::Maintainer;
use orca_core::service::EntityKind;
use orca_core::task::{Operator, TaskState};
use orca_core::template::{NodeTemplate, Template, TemplateBuilder};
use orca_core::{CoreError, Persistence};

fn template(name: &str, steps: &[&str]) -> Template {
    let mut builder = TemplateBuilder::new(name).maintenance(Maintainer::global());
    for step in steps {
        builder = builder.add_node(NodeTemplate::normal(task(step, &step.to_lowercase())));
    }
    builder.build().unwrap()
}

#[tokio::test]
async fn test_dag_runs_to_success_and_releases_lock() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("write then read", &["WriteTask", "ReadTask"]), TaskContext::new())
        .await
        .unwrap();
    cluster.start();

    let done = wait_terminal(&env, &dag.generic_id()).await;
    assert_eq!(done.state, TaskState::Succeed);
    assert_eq!(done.stage, done.max_stage);
    assert!(done.failure_summary.is_empty());
    // The read step saw what the write step left in the shared data.
    assert_eq!(done.nodes[1].tasks[0].logs, vec!["read writetask".to_string()]);
    assert!(env.service.last_maintenance_dag(false).await.unwrap().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_retry_resumes_failed_node() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("flaky", &["NoopTask", "FlakyTask"]), TaskContext::new())
        .await
        .unwrap();
    let gid = dag.generic_id();
    cluster.start();

    let failed = wait_terminal(&env, &gid).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 2);
    // An ordinary dag keeps its lock so it can still be retried or rolled back.
    let holder = env.service.last_maintenance_dag(false).await.unwrap().unwrap();
    assert_eq!(holder.generic_id(), gid);

    env.service
        .apply_operator(EntityKind::Dag, &gid, Operator::Retry)
        .await
        .unwrap();
    let done = wait_for(&env, &gid, |d| d.is_succeed()).await;
    assert_eq!(done.nodes[0].tasks[0].execute_times, 1);
    assert_eq!(done.nodes[1].tasks[0].execute_times, 2);
    assert!(env.service.last_maintenance_dag(false).await.unwrap().is_none());

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_panicking_task_fails_the_dag() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("panics", &["PanicTask"]), TaskContext::new())
        .await
        .unwrap();
    cluster.start();

    let done = wait_terminal(&env, &dag.generic_id()).await;
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.failure_summary.len(), 1);
    let logs = done.failure_summary.values().next().unwrap();
    assert!(logs.contains("panicked"), "unexpected log: {}", logs);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_rollback_walks_back_and_is_idempotent() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("doomed", &["WriteTask", "FailTask", "NoopTask"]), TaskContext::new())
        .await
        .unwrap();
    let gid = dag.generic_id();
    cluster.start();

    let failed = wait_terminal(&env, &gid).await;
    assert_eq!(failed.state, TaskState::Failed);
    assert_eq!(failed.stage, 2);

    env.service
        .apply_operator(EntityKind::Dag, &gid, Operator::Rollback)
        .await
        .unwrap();
    let rolled = wait_for(&env, &gid, |d| d.is_succeed()).await;
    assert_eq!(rolled.operator, Operator::Rollback);
    assert_eq!(rolled.stage, 1);
    // Each executed subtask ran once forward and once backward; the third
    // node never ran and was left alone.
    assert_eq!(rolled.nodes[0].tasks[0].execute_times, 2);
    assert_eq!(rolled.nodes[1].tasks[0].execute_times, 2);
    assert_eq!(rolled.nodes[2].tasks[0].execute_times, 0);
    assert!(env.service.last_maintenance_dag(false).await.unwrap().is_none());

    let again = env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Rollback)
        .await
        .unwrap();
    assert_eq!(again.state, TaskState::Succeed);
    assert_eq!(again.operator, Operator::Rollback);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_cancel_keeps_lock_until_pass() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let blocking = template("blocking", &["BlockTask"]);
    let dag = env.service.create_dag(&blocking, TaskContext::new()).await.unwrap();
    let gid = dag.generic_id();
    cluster.start();

    wait_for(&env, &gid, |d| d.nodes[0].tasks[0].state == TaskState::Running).await;
    env.service
        .apply_operator(EntityKind::Dag, &gid, Operator::Cancel)
        .await
        .unwrap();
    let cancelled = wait_terminal(&env, &gid).await;
    assert_eq!(cancelled.state, TaskState::Failed);
    assert_eq!(cancelled.operator, Operator::Cancel);

    // A cancelled dag still holds its lock.
    let err = env.service.create_dag(&blocking, TaskContext::new()).await.unwrap_err();
    assert!(matches!(err, CoreError::MaintenanceConflict { ref holder, .. } if *holder == gid));

    let passed = env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Pass)
        .await
        .unwrap();
    assert_eq!(passed.state, TaskState::Succeed);
    assert_eq!(passed.operator, Operator::Pass);
    assert!(env.service.last_maintenance_dag(false).await.unwrap().is_none());
    assert!(
        env.service
            .create_dag(&template("next", &["NoopTask"]), TaskContext::new())
            .await
            .is_ok()
    );

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_retry_on_non_retryable_task_is_refused() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let node = NodeTemplate::normal(
        task("FailTask", "no second chance")
            .with_capabilities(orca_core::Capabilities::default().with_retry(false)),
    );
    let template = TemplateBuilder::new("one shot")
        .add_node(node)
        .maintenance(Maintainer::global())
        .build()
        .unwrap();
    let dag = env.service.create_dag(&template, TaskContext::new()).await.unwrap();
    let gid = dag.generic_id();
    cluster.start();

    wait_terminal(&env, &gid).await;
    let err = env
        .service
        .apply_operator(EntityKind::Dag, &gid, Operator::Retry)
        .await
        .unwrap_err();
    assert!(matches!(err, CoreError::CapabilityViolation { .. }));
    // A refused operator changes nothing.
    let unchanged = env.service.dag_detail(&gid).await.unwrap();
    assert_eq!(unchanged.state, TaskState::Failed);
    assert_eq!(unchanged.operator, Operator::Run);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_task_is_executed_once_after_restart() {
    let mut cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("restart", &["NoopTask"]), TaskContext::new())
        .await
        .unwrap();
    let gid = dag.generic_id();

    // One driver step dispatches the subtask; claiming it without running
    // the body leaves it RUNNING as if the agent died mid-execution.
    let (_maintainer, rx) = watch::channel(true);
    Driver::new(env.clone(), rx, test_executor()).tick().await.unwrap();
    let task_id = env.service.load(dag.id).await.unwrap().nodes[0].tasks[0].id;
    assert!(cluster.store.claim_task(task_id, Utc::now()).await.unwrap());

    let recovered = Runner::new(env.clone(), test_executor()).recover().await.unwrap();
    assert_eq!(recovered, 1);
    let record = cluster.store.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(record.state, TaskState::Ready.as_i32());

    cluster.start();
    let done = wait_terminal(&env, &gid).await;
    assert_eq!(done.state, TaskState::Succeed);
    assert_eq!(done.nodes[0].tasks[0].execute_times, 2);
    assert_eq!(done.nodes[0].tasks[0].logs, vec!["noop".to_string()]);

    cluster.shutdown().await;
}

#[tokio::test]
async fn test_interrupted_task_that_cannot_continue_fails() {
    let cluster = TestCluster::new(&[A]).await;
    let env = cluster.env(0).clone();
    let dag = env
        .service
        .create_dag(&template("restart", &["BlockTask"]), TaskContext::new())
        .await
        .unwrap();

    let (_maintainer, rx) = watch::channel(true);
    let driver = Driver::new(env.clone(), rx, test_executor());
    driver.tick().await.unwrap();
    let task_id = env.service.load(dag.id).await.unwrap().nodes[0].tasks[0].id;
    assert!(cluster.store.claim_task(task_id, Utc::now()).await.unwrap());

    let recovered = Runner::new(env.clone(), test_executor()).recover().await.unwrap();
    assert_eq!(recovered, 0);

    driver.tick().await.unwrap();
    let done = env.service.dag_detail(&dag.generic_id()).await.unwrap();
    assert_eq!(done.state, TaskState::Failed);
    let logs = &done.nodes[0].tasks[0].logs;
    assert!(logs[0].contains("cannot continue"));
}

#[tokio::test]
async fn test_non_maintainer_leaves_cluster_dags_alone() {
    let mut cluster = TestCluster::new(&[A, B]).await;
    // Created through B, but only A maintains cluster dags.
    let env_b = cluster.env(1).clone();
    let dag = env_b
        .service
        .create_dag(&template("cluster work", &["NoopTask"]), TaskContext::new())
        .await
        .unwrap();

    let (_maintainer, rx) = watch::channel(false);
    Driver::new(env_b.clone(), rx, test_executor()).tick().await.unwrap();
    let untouched = env_b.service.dag_detail(&dag.generic_id()).await.unwrap();
    assert_eq!(untouched.state, TaskState::Ready);

    cluster.start();
    let done = wait_terminal(&env_b, &dag.generic_id()).await;
    assert_eq!(done.state, TaskState::Succeed);
    // The subtask ran on the agent that created the dag.
    assert_eq!(done.nodes[0].tasks[0].executor, B);

    cluster.shutdown().await;
}
