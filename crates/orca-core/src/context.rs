// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task context: the keyed bag of values flowing through a dag.
//!
//! A context holds three maps plus a counter map:
//!
//! - `params`: write-once. A merge never overwrites an existing key.
//! - `data`: overwritable. Object values merge recursively, anything else
//!   is replaced by the source value.
//! - `agent_data[agent][key]`: per-agent scoped values.
//! - `agent_data_update_count[agent]`: bumped on every per-agent write. A
//!   merge copies `agent_data[agent]` only when the source counter is
//!   strictly greater than the destination's.
//!
//! Values are stored as `serde_json::Value`, so every entry is
//! self-describing and typed getters report "not set" and "type mismatch"
//! separately from a value.

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::agent::AgentAddr;

/// Reserved key listing the agents a node fans out to.
pub const EXECUTE_AGENTS: &str = "execute_agents";

/// Errors from typed context access.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ContextError {
    #[error("context key '{0}' is not set")]
    NotSet(String),

    #[error("context key '{key}' has an unexpected type: {reason}")]
    Mismatch { key: String, reason: String },

    #[error("context value for '{key}' cannot be encoded: {reason}")]
    Encode { key: String, reason: String },
}

/// Outcome of a typed lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue<T> {
    NotSet,
    Mismatch(String),
    Value(T),
}

impl<T> ContextValue<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Self::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        !matches!(self, Self::NotSet)
    }

    /// Turn the triple into a `Result`, naming `key` in the error.
    pub fn require(self, key: &str) -> Result<T, ContextError> {
        match self {
            Self::Value(v) => Ok(v),
            Self::NotSet => Err(ContextError::NotSet(key.to_string())),
            Self::Mismatch(reason) => Err(ContextError::Mismatch {
                key: key.to_string(),
                reason,
            }),
        }
    }

    /// Like [`require`](Self::require) but treats "not set" as `default`.
    pub fn or(self, key: &str, default: T) -> Result<T, ContextError> {
        match self {
            Self::NotSet => Ok(default),
            other => other.require(key),
        }
    }
}

fn lookup<T: DeserializeOwned>(value: Option<&Value>) -> ContextValue<T> {
    match value {
        None | Some(Value::Null) => ContextValue::NotSet,
        Some(v) => match serde_json::from_value(v.clone()) {
            Ok(v) => ContextValue::Value(v),
            Err(e) => ContextValue::Mismatch(e.to_string()),
        },
    }
}

fn encode<T: Serialize>(key: &str, value: T) -> Result<Value, ContextError> {
    serde_json::to_value(value).map_err(|e| ContextError::Encode {
        key: key.to_string(),
        reason: e.to_string(),
    })
}

/// Recursively merge `src` into `dst`: objects merge per key, anything else
/// is overwritten.
fn merge_value(dst: &mut Value, src: &Value) {
    match (dst, src) {
        (Value::Object(dst), Value::Object(src)) => {
            for (k, v) in src {
                match dst.get_mut(k) {
                    Some(existing) => merge_value(existing, v),
                    None => {
                        dst.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (dst, src) => *dst = src.clone(),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskContext {
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default)]
    pub data: BTreeMap<String, Value>,
    #[serde(default)]
    pub agent_data: BTreeMap<String, Map<String, Value>>,
    #[serde(default)]
    pub agent_data_update_count: BTreeMap<String, u64>,
}

impl TaskContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn param<T: DeserializeOwned>(&self, key: &str) -> ContextValue<T> {
        lookup(self.params.get(key))
    }

    /// Set a param, replacing any previous value. Only build-time code should
    /// call this; merges keep params write-once.
    pub fn set_param<T: Serialize>(&mut self, key: &str, value: T) -> Result<&mut Self, ContextError> {
        let value = encode(key, value)?;
        self.params.insert(key.to_string(), value);
        Ok(self)
    }

    pub fn data<T: DeserializeOwned>(&self, key: &str) -> ContextValue<T> {
        lookup(self.data.get(key))
    }

    pub fn set_data<T: Serialize>(&mut self, key: &str, value: T) -> Result<&mut Self, ContextError> {
        let value = encode(key, value)?;
        self.data.insert(key.to_string(), value);
        Ok(self)
    }

    pub fn agent_data<T: DeserializeOwned>(&self, agent: &AgentAddr, key: &str) -> ContextValue<T> {
        lookup(self.agent_data.get(&agent.key()).and_then(|m| m.get(key)))
    }

    /// Set a per-agent value and bump that agent's update counter.
    pub fn set_agent_data<T: Serialize>(
        &mut self,
        agent: &AgentAddr,
        key: &str,
        value: T,
    ) -> Result<&mut Self, ContextError> {
        let value = encode(key, value)?;
        let agent_key = agent.key();
        self.agent_data
            .entry(agent_key.clone())
            .or_default()
            .insert(key.to_string(), value);
        *self.agent_data_update_count.entry(agent_key).or_insert(0) += 1;
        Ok(self)
    }

    pub fn agent_update_count(&self, agent: &AgentAddr) -> u64 {
        self.agent_data_update_count
            .get(&agent.key())
            .copied()
            .unwrap_or(0)
    }

    /// Agents listed under the reserved `execute_agents` key (params first,
    /// then data).
    pub fn execute_agents(&self) -> Result<Option<Vec<AgentAddr>>, ContextError> {
        let value = match self.param::<Vec<AgentAddr>>(EXECUTE_AGENTS) {
            ContextValue::NotSet => self.data::<Vec<AgentAddr>>(EXECUTE_AGENTS),
            other => other,
        };
        match value {
            ContextValue::NotSet => Ok(None),
            other => other.require(EXECUTE_AGENTS).map(Some),
        }
    }

    /// Merge `src` into `self`.
    pub fn merge(&mut self, src: &TaskContext) {
        self.merge_inner(src, false);
    }

    /// Merge `src` into `self`, skipping the reserved `execute_agents` key.
    pub fn merge_without_execute_agents(&mut self, src: &TaskContext) {
        self.merge_inner(src, true);
    }

    fn merge_inner(&mut self, src: &TaskContext, exclude_execute_agents: bool) {
        let skip = |k: &str| exclude_execute_agents && k == EXECUTE_AGENTS;

        for (k, v) in &src.params {
            if skip(k) {
                continue;
            }
            self.params.entry(k.clone()).or_insert_with(|| v.clone());
        }

        for (k, v) in &src.data {
            if skip(k) {
                continue;
            }
            match self.data.get_mut(k) {
                Some(existing) => merge_value(existing, v),
                None => {
                    self.data.insert(k.clone(), v.clone());
                }
            }
        }

        for (agent, src_count) in &src.agent_data_update_count {
            let dst_count = self.agent_data_update_count.get(agent).copied().unwrap_or(0);
            if *src_count > dst_count {
                let values = src.agent_data.get(agent).cloned().unwrap_or_default();
                self.agent_data.insert(agent.clone(), values);
                self.agent_data_update_count.insert(agent.clone(), *src_count);
            }
        }
    }
}
