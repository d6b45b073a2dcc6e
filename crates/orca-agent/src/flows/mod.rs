// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Concrete flows run by this agent.
//!
//! Each submodule owns the task bodies of one flow and the function that
//! assembles its template. Task bodies reach the observer only through
//! [`ObserverOps`] and the store only through the [`AgentEnv`] of their
//! runtime.
//!
//! | Flow | Template | Scope |
//! |------|----------|-------|
//! | cluster bootstrap | [`init::init_cluster`] | global |
//! | backup configuration | [`backup::backup_config`] | global |
//! | scale-in / scale-out | [`scale::scale_in`], [`scale::scale_out`] | global |
//! | take-over / rebuild | [`reconcile::FlowHooks`] | global |
//! | peer sub-dag actions | [`action_template`] | local |
//!
//! [`AgentEnv`]: orca_core::AgentEnv

pub mod backup;
pub mod init;
pub mod observer;
pub mod reconcile;
pub mod scale;

use std::sync::Arc;

use orca_core::error::Result;
use orca_core::remote::register_protocol_tasks;
use orca_core::{
    Capabilities, NodeTemplate, SubDagAction, TaskBody, TaskError, TaskRegistry, TaskRuntime, TaskTemplate, Template,
    TemplateBuilder,
};
use serde::de::DeserializeOwned;

use crate::observer::ObserverOps;

/// Operator flags of a task type.
fn capabilities(struct_name: &str) -> Capabilities {
    let caps = Capabilities::default();
    match struct_name {
        observer::START_OBSERVER
        | observer::STOP_OBSERVER
        | init::AGENT_SYNC
        | scale::INFORM_KILL_OBSERVER
        | scale::WAIT_DELETE_COMPLETE => caps.with_cancel(true),
        // Identities already moved forward on every member.
        init::CONVERT_MASTER | init::CONVERT_FOLLOWERS | reconcile::CONVERT_PEERS => caps.with_rollback(false),
        _ => caps,
    }
}

/// Template of one task of `struct_name`, carrying its registered flags.
pub fn task(struct_name: &str, name: impl Into<String>) -> TaskTemplate {
    TaskTemplate::new(struct_name, name).with_capabilities(capabilities(struct_name))
}

/// Additional data of the running task, decoded as `T`.
fn data_of<T: DeserializeOwned>(rt: &TaskRuntime) -> std::result::Result<T, TaskError> {
    let data = rt
        .additional_data()
        .ok_or_else(|| TaskError::failed(format!("{} carries no data", rt.task().name)))?;
    serde_json::from_value(data.clone())
        .map_err(|e| TaskError::failed(format!("bad data for {}: {}", rt.task().name, e)))
}

fn register_with_ops<B>(
    registry: &mut TaskRegistry,
    ops: &Arc<dyn ObserverOps>,
    struct_name: &str,
    make: fn(Arc<dyn ObserverOps>) -> B,
) where
    B: TaskBody + 'static,
{
    let ops = ops.clone();
    registry.register(struct_name, capabilities(struct_name), move || make(ops.clone()));
}

/// Every task type this agent can execute, bound to `ops`.
pub fn task_registry(ops: Arc<dyn ObserverOps>) -> TaskRegistry {
    let mut registry = TaskRegistry::new();
    register_protocol_tasks(&mut registry);
    observer::register(&mut registry, &ops);
    init::register(&mut registry, &ops);
    backup::register(&mut registry, &ops);
    scale::register(&mut registry, &ops);
    reconcile::register(&mut registry, &ops);
    registry
}

/// Steps a peer runs for `action` when a main dag asks for a sub-dag.
pub fn action_template(action: SubDagAction) -> Result<Template> {
    let steps: &[(&str, &str)] = match action {
        SubDagAction::Stop => &[(observer::STOP_OBSERVER, "stop observer")],
        SubDagAction::Start => &[(observer::START_OBSERVER, "start observer")],
        SubDagAction::Deploy => &[(observer::DEPLOY, "deploy observer")],
        SubDagAction::Destroy => &[
            (observer::STOP_OBSERVER, "stop observer"),
            (observer::DESTROY, "destroy observer"),
        ],
        SubDagAction::ScaleOut => &[
            (observer::DEPLOY, "deploy observer"),
            (observer::START_OBSERVER, "start observer"),
        ],
    };
    steps
        .iter()
        .fold(TemplateBuilder::new(action.as_str()), |builder, (struct_name, name)| {
            builder.add_node(NodeTemplate::normal(task(struct_name, *name)))
        })
        .build()
}
