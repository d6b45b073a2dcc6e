// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operator validation and rewriting.
//!
//! Planning is pure: it checks the capability flags of every affected
//! subtask and rewrites the in-memory dag. Nothing is changed when any check
//! fails. The service persists the outcome in one transaction.
//!
//! PASS on a main dag that still has a peer release step ahead is deferred:
//! every other remaining node is passed, and the dag runs on so the release
//! steps free the peers' locks before the dag succeeds.

use chrono::Utc;

use crate::error::{CoreError, Result};
use crate::model::{Dag, Node, SubTask};
use crate::remote::PASS_SUB_DAG;
use crate::task::{Operator, TaskState};

/// What the service has to persist for an accepted operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Plan {
    /// The dag already is where the operator would take it.
    NoOp,
    /// Flag the current node for cooperative cancellation.
    Cancel { node_id: i64 },
    /// Rewrite the dag as planned, releasing its lock when asked.
    Rewrite { release_lock: bool },
}

pub(crate) fn plan(dag: &mut Dag, op: Operator) -> Result<Plan> {
    match op {
        Operator::Run => plan_run(dag),
        Operator::Retry => plan_retry(dag),
        Operator::Rollback => plan_rollback(dag),
        Operator::Cancel => plan_cancel(dag),
        Operator::Pass => plan_pass(dag),
    }
}

fn refuse(op: Operator, dag: &Dag, task: &SubTask) -> CoreError {
    CoreError::CapabilityViolation {
        operator: op.to_string(),
        reason: format!(
            "subtask {} ({}) does not permit {}",
            dag.task_generic_id(task),
            task.name,
            op
        ),
    }
}

fn check_permitted<'a>(op: Operator, dag: &Dag, tasks: impl IntoIterator<Item = &'a SubTask>) -> Result<()> {
    match tasks.into_iter().find(|t| !t.capabilities.permits(op)) {
        Some(task) => Err(refuse(op, dag, task)),
        None => Ok(()),
    }
}

fn no_in_flight(dag: &Dag) -> Result<()> {
    if dag.all_tasks().any(SubTask::is_in_flight) {
        return Err(CoreError::invalid_state(
            dag.generic_id(),
            "subtasks are still in flight",
        ));
    }
    Ok(())
}

fn plan_run(dag: &Dag) -> Result<Plan> {
    if dag.operator == Operator::Run && !dag.is_terminal() {
        return Ok(Plan::NoOp);
    }
    Err(CoreError::invalid_state(
        dag.generic_id(),
        "RUN is implied when a dag is created; use RETRY to resume a failed dag",
    ))
}

fn plan_retry(dag: &mut Dag) -> Result<Plan> {
    if dag.state != TaskState::Failed {
        return Err(CoreError::invalid_state(
            dag.generic_id(),
            format!("only a FAILED dag can be retried, dag is {}", dag.state),
        ));
    }
    if dag.operator == Operator::Rollback {
        return Err(CoreError::invalid_state(
            dag.generic_id(),
            "dag failed while rolling back; resume it with ROLLBACK",
        ));
    }
    no_in_flight(dag)?;
    let node = dag
        .current_node()
        .ok_or_else(|| CoreError::invalid_state(dag.generic_id(), "dag has no current node"))?;
    check_permitted(Operator::Retry, dag, node.failed_tasks())?;

    let node = dag
        .current_node_mut()
        .ok_or_else(|| CoreError::not_found("node", "current"))?;
    for task in node.tasks.iter_mut().filter(|t| t.state == TaskState::Failed) {
        task.state = TaskState::Pending;
        task.operator = Operator::Retry;
        task.end_time = None;
    }
    node.state = TaskState::Ready;
    node.operator = Operator::Retry;
    node.end_time = None;

    dag.state = TaskState::Ready;
    dag.operator = Operator::Retry;
    dag.end_time = None;
    Ok(Plan::Rewrite { release_lock: false })
}

/// Whether `task` still needs its compensating action.
fn needs_rollback(task: &SubTask) -> bool {
    task.has_executed() && !(task.operator == Operator::Rollback && task.state == TaskState::Succeed)
}

fn plan_rollback(dag: &mut Dag) -> Result<Plan> {
    if dag.state == TaskState::Succeed && dag.operator == Operator::Rollback {
        return Ok(Plan::NoOp);
    }
    if dag.state != TaskState::Failed {
        return Err(CoreError::invalid_state(
            dag.generic_id(),
            format!("only a FAILED dag can be rolled back, dag is {}", dag.state),
        ));
    }
    no_in_flight(dag)?;
    let stage = dag.stage;
    check_permitted(
        Operator::Rollback,
        dag,
        dag.nodes
            .iter()
            .filter(|n| n.stage <= stage)
            .flat_map(|n| n.tasks.iter())
            .filter(|t| needs_rollback(t)),
    )?;

    for node in dag.nodes.iter_mut().filter(|n| n.stage <= stage) {
        for task in node.tasks.iter_mut().filter(|t| needs_rollback(t)) {
            task.state = TaskState::Pending;
            task.operator = Operator::Rollback;
            task.end_time = None;
        }
        node.state = if node.stage == stage {
            TaskState::Ready
        } else {
            TaskState::Pending
        };
        node.operator = Operator::Rollback;
        node.end_time = None;
    }

    dag.state = TaskState::Ready;
    dag.operator = Operator::Rollback;
    dag.end_time = None;
    Ok(Plan::Rewrite { release_lock: false })
}

fn plan_cancel(dag: &Dag) -> Result<Plan> {
    match dag.state {
        TaskState::Failed => return Ok(Plan::NoOp),
        TaskState::Succeed => {
            return Err(CoreError::invalid_state(
                dag.generic_id(),
                "a SUCCEED dag cannot be cancelled",
            ));
        }
        _ => {}
    }
    match dag.operator {
        Operator::Cancel => return Ok(Plan::NoOp),
        Operator::Rollback => {
            return Err(CoreError::invalid_state(
                dag.generic_id(),
                "a rollback in progress cannot be cancelled",
            ));
        }
        _ => {}
    }
    let node = dag
        .current_node()
        .ok_or_else(|| CoreError::invalid_state(dag.generic_id(), "dag has no current node"))?;
    check_permitted(
        Operator::Cancel,
        dag,
        node.tasks.iter().filter(|t| t.state == TaskState::Running),
    )?;
    Ok(Plan::Cancel { node_id: node.id })
}

/// Whether `node` frees the peers of a main dag.
fn releases_peers(node: &Node) -> bool {
    node.tasks.first().is_some_and(|t| t.struct_name == PASS_SUB_DAG)
}

fn pass_node(node: &mut Node, now: chrono::DateTime<Utc>, only_failed: bool) {
    for task in node
        .tasks
        .iter_mut()
        .filter(|t| !only_failed || t.state == TaskState::Failed)
    {
        task.state = TaskState::Succeed;
        task.operator = Operator::Pass;
        task.end_time = Some(now);
    }
    node.state = TaskState::Succeed;
    node.operator = Operator::Pass;
    node.end_time = Some(now);
}

fn plan_pass(dag: &mut Dag) -> Result<Plan> {
    match dag.state {
        TaskState::Succeed => return Ok(Plan::NoOp),
        // A deferred pass still releasing peers.
        TaskState::Ready | TaskState::Running if dag.operator == Operator::Pass => return Ok(Plan::NoOp),
        TaskState::Failed => {}
        other => {
            return Err(CoreError::invalid_state(
                dag.generic_id(),
                format!("only a FAILED dag can be passed, dag is {}; cancel it first", other),
            ));
        }
    }
    no_in_flight(dag)?;
    let node = dag
        .current_node()
        .ok_or_else(|| CoreError::invalid_state(dag.generic_id(), "dag has no current node"))?;
    check_permitted(Operator::Pass, dag, node.failed_tasks())?;

    let now = Utc::now();
    let stage = dag.stage;
    let node = dag
        .current_node_mut()
        .ok_or_else(|| CoreError::not_found("node", "current"))?;
    pass_node(node, now, true);
    dag.operator = Operator::Pass;

    if !dag.nodes.iter().any(|n| n.stage > stage && releases_peers(n)) {
        dag.state = TaskState::Succeed;
        dag.end_time = Some(now);
        return Ok(Plan::Rewrite { release_lock: true });
    }
    for node in dag
        .nodes
        .iter_mut()
        .filter(|n| n.stage > stage && !releases_peers(n))
    {
        pass_node(node, now, false);
    }
    dag.state = TaskState::Ready;
    dag.end_time = None;
    Ok(Plan::Rewrite { release_lock: false })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentAddr;
    use crate::context::TaskContext;
    use crate::task::Capabilities;
    use crate::template::{NodeTemplate, TaskTemplate, TemplateBuilder};

    fn dag(second: Capabilities) -> Dag {
        let creator: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        let mut dag = TemplateBuilder::new("upgrade")
            .add_node(NodeTemplate::normal(TaskTemplate::new("PrepareTask", "prepare")))
            .add_node(NodeTemplate::normal(
                TaskTemplate::new("UpgradeTask", "upgrade").with_capabilities(second),
            ))
            .build()
            .unwrap()
            .instantiate(TaskContext::new(), &creator)
            .unwrap();
        for (i, node) in dag.nodes.iter_mut().enumerate() {
            node.id = i as i64 + 10;
            for task in &mut node.tasks {
                task.id = i as i64 + 20;
            }
        }
        dag.id = 1;
        dag
    }

    /// Dag failed in its second node after the first one succeeded.
    fn failed_at_second(second: Capabilities) -> Dag {
        let mut dag = dag(second);
        dag.stage = 2;
        dag.state = TaskState::Failed;
        dag.nodes[0].state = TaskState::Succeed;
        dag.nodes[0].tasks[0].state = TaskState::Succeed;
        dag.nodes[0].tasks[0].execute_times = 1;
        dag.nodes[1].state = TaskState::Failed;
        dag.nodes[1].tasks[0].state = TaskState::Failed;
        dag.nodes[1].tasks[0].execute_times = 1;
        dag
    }

    #[test]
    fn test_retry_resets_failed_tasks() {
        let mut dag = failed_at_second(Capabilities::default());
        assert_eq!(plan(&mut dag, Operator::Retry).unwrap(), Plan::Rewrite { release_lock: false });
        assert_eq!(dag.state, TaskState::Ready);
        assert_eq!(dag.operator, Operator::Retry);
        assert_eq!(dag.nodes[1].tasks[0].state, TaskState::Pending);
        assert_eq!(dag.nodes[1].tasks[0].operator, Operator::Retry);
        assert_eq!(dag.nodes[0].tasks[0].operator, Operator::Run);
    }

    #[test]
    fn test_retry_refused_by_capability_changes_nothing() {
        let mut dag = failed_at_second(Capabilities::default().with_retry(false));
        let err = plan(&mut dag, Operator::Retry).unwrap_err();
        assert!(matches!(err, CoreError::CapabilityViolation { .. }));
        assert_eq!(dag.state, TaskState::Failed);
        assert_eq!(dag.nodes[1].tasks[0].state, TaskState::Failed);
    }

    #[test]
    fn test_retry_requires_failed_dag() {
        let mut dag = dag(Capabilities::default());
        assert!(matches!(
            plan(&mut dag, Operator::Retry),
            Err(CoreError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_rollback_marks_executed_tasks() {
        let mut dag = failed_at_second(Capabilities::default());
        plan(&mut dag, Operator::Rollback).unwrap();
        assert_eq!(dag.operator, Operator::Rollback);
        assert_eq!(dag.state, TaskState::Ready);
        assert_eq!(dag.nodes[1].state, TaskState::Ready);
        assert_eq!(dag.nodes[0].state, TaskState::Pending);
        for node in &dag.nodes {
            assert_eq!(node.tasks[0].operator, Operator::Rollback);
            assert_eq!(node.tasks[0].state, TaskState::Pending);
        }
    }

    #[test]
    fn test_rollback_refused_atomically() {
        let mut dag = failed_at_second(Capabilities::default().with_rollback(false));
        assert!(plan(&mut dag, Operator::Rollback).is_err());
        assert_eq!(dag.nodes[0].tasks[0].operator, Operator::Run);
        assert_eq!(dag.nodes[0].tasks[0].state, TaskState::Succeed);
    }

    #[test]
    fn test_rolled_back_dag_is_noop() {
        let mut dag = failed_at_second(Capabilities::default());
        dag.state = TaskState::Succeed;
        dag.operator = Operator::Rollback;
        assert_eq!(plan(&mut dag, Operator::Rollback).unwrap(), Plan::NoOp);
    }

    #[test]
    fn test_pass_finishes_dag_and_releases() {
        let mut dag = failed_at_second(Capabilities::default());
        assert_eq!(plan(&mut dag, Operator::Pass).unwrap(), Plan::Rewrite { release_lock: true });
        assert_eq!(dag.state, TaskState::Succeed);
        assert_eq!(dag.operator, Operator::Pass);
        assert_eq!(dag.nodes[1].tasks[0].operator, Operator::Pass);
        assert_eq!(plan(&mut dag, Operator::Pass).unwrap(), Plan::NoOp);
    }

    #[test]
    fn test_pass_before_peer_release_is_deferred() {
        let creator: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        let mut dag = TemplateBuilder::new("stop peers")
            .add_node(NodeTemplate::normal(TaskTemplate::new("WaitSubDagFinishTask", "wait")))
            .add_node(NodeTemplate::normal(TaskTemplate::new("MajorFreezeTask", "freeze")))
            .add_node(NodeTemplate::normal(
                TaskTemplate::new(PASS_SUB_DAG, "pass").with_capabilities(Capabilities::default().with_pass(false)),
            ))
            .build()
            .unwrap()
            .instantiate(TaskContext::new(), &creator)
            .unwrap();
        dag.state = TaskState::Failed;
        dag.nodes[0].state = TaskState::Failed;
        dag.nodes[0].tasks[0].state = TaskState::Failed;
        dag.nodes[0].tasks[0].execute_times = 1;

        assert_eq!(plan(&mut dag, Operator::Pass).unwrap(), Plan::Rewrite { release_lock: false });
        assert_eq!(dag.state, TaskState::Ready);
        assert_eq!(dag.operator, Operator::Pass);
        assert_eq!(dag.stage, 1);
        assert_eq!(dag.nodes[0].state, TaskState::Succeed);
        assert_eq!(dag.nodes[1].state, TaskState::Succeed);
        assert_eq!(dag.nodes[1].tasks[0].operator, Operator::Pass);
        // The release step still runs.
        assert_eq!(dag.nodes[2].state, TaskState::Pending);
        assert_eq!(dag.nodes[2].tasks[0].state, TaskState::Pending);
        assert_eq!(dag.nodes[2].tasks[0].operator, Operator::Run);

        // Passing again while the peers are being released changes nothing.
        dag.state = TaskState::Running;
        assert_eq!(plan(&mut dag, Operator::Pass).unwrap(), Plan::NoOp);
    }

    #[test]
    fn test_pass_on_running_dag_is_refused() {
        let mut dag = dag(Capabilities::default());
        dag.state = TaskState::Running;
        assert!(matches!(plan(&mut dag, Operator::Pass), Err(CoreError::InvalidState { .. })));
    }

    #[test]
    fn test_cancel_checks_running_tasks() {
        let mut dag = dag(Capabilities::default());
        dag.state = TaskState::Running;
        dag.nodes[0].tasks[0].state = TaskState::Running;
        assert!(matches!(
            plan(&mut dag, Operator::Cancel),
            Err(CoreError::CapabilityViolation { .. })
        ));

        dag.nodes[0].tasks[0].capabilities.can_cancel = true;
        assert_eq!(plan(&mut dag, Operator::Cancel).unwrap(), Plan::Cancel { node_id: 10 });

        dag.state = TaskState::Failed;
        assert_eq!(plan(&mut dag, Operator::Cancel).unwrap(), Plan::NoOp);
    }
}
