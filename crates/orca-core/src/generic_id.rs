// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Generic ids: decimal strings that address a dag, node or task anywhere in
//! the fleet.
//!
//! | prefix | form                                   | used for              |
//! |--------|----------------------------------------|-----------------------|
//! | `1`    | `1` + id                               | cluster entity        |
//! | `2`    | `2` + ipv4 (10 digits) + port (5) + id | local entity, ipv4    |
//! | `3`    | `3` + ipv6 (39 digits) + port (5) + id | local entity, ipv6    |
//! | `4`    | as `2`                                 | local proxy entity    |
//! | `5`    | as `3`                                 | local proxy entity    |

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::agent::AgentAddr;
use crate::error::{CoreError, Result};

/// Dag type of ordinary observer maintenance work.
pub const DAG_TYPE_OB: &str = "ob";
/// Dag type of proxy maintenance work.
pub const DAG_TYPE_PROXY: &str = "proxy";

const V4_WIDTH: usize = 10;
const V6_WIDTH: usize = 39;
const PORT_WIDTH: usize = 5;

/// A decoded generic id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericId {
    /// Numeric store id.
    pub id: i64,
    /// Owning agent for local entities; `None` for cluster entities.
    pub agent: Option<AgentAddr>,
    /// Whether the entity belongs to a proxy dag.
    pub is_proxy: bool,
}

impl GenericId {
    pub fn is_local(&self) -> bool {
        self.agent.is_some()
    }

    /// Re-encode this id.
    pub fn encode(&self) -> String {
        let dag_type = if self.is_proxy {
            DAG_TYPE_PROXY
        } else {
            DAG_TYPE_OB
        };
        match &self.agent {
            Some(agent) => encode(self.id, agent, true, dag_type),
            None => format!("1{}", self.id),
        }
    }
}

/// Encode a numeric id. Cluster entities ignore `agent`.
pub fn encode(id: i64, agent: &AgentAddr, is_local: bool, dag_type: &str) -> String {
    if !is_local {
        return format!("1{}", id);
    }
    let proxy = dag_type == DAG_TYPE_PROXY;
    match agent.ip {
        IpAddr::V4(ip) => format!(
            "{}{:0v4$}{:0port$}{}",
            if proxy { '4' } else { '2' },
            u32::from(ip),
            agent.port,
            id,
            v4 = V4_WIDTH,
            port = PORT_WIDTH
        ),
        IpAddr::V6(ip) => format!(
            "{}{:0v6$}{:0port$}{}",
            if proxy { '5' } else { '3' },
            u128::from(ip),
            agent.port,
            id,
            v6 = V6_WIDTH,
            port = PORT_WIDTH
        ),
    }
}

/// Decode a generic id, rejecting malformed strings and lengths that do not
/// match the prefix.
pub fn decode(generic_id: &str) -> Result<GenericId> {
    let invalid = || CoreError::InvalidGenericId(generic_id.to_string());
    if generic_id.is_empty() || !generic_id.bytes().all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let (prefix, rest) = generic_id.split_at(1);
    match prefix {
        "1" => Ok(GenericId {
            id: parse_id(rest).ok_or_else(invalid)?,
            agent: None,
            is_proxy: false,
        }),
        "2" | "4" => {
            if rest.len() <= V4_WIDTH + PORT_WIDTH {
                return Err(invalid());
            }
            let ip: u32 = rest[..V4_WIDTH].parse().map_err(|_| invalid())?;
            let port = parse_port(&rest[V4_WIDTH..V4_WIDTH + PORT_WIDTH]).ok_or_else(invalid)?;
            let id = parse_id(&rest[V4_WIDTH + PORT_WIDTH..]).ok_or_else(invalid)?;
            Ok(GenericId {
                id,
                agent: Some(AgentAddr::new(IpAddr::V4(Ipv4Addr::from(ip)), port)),
                is_proxy: prefix == "4",
            })
        }
        "3" | "5" => {
            if rest.len() <= V6_WIDTH + PORT_WIDTH {
                return Err(invalid());
            }
            let ip: u128 = rest[..V6_WIDTH].parse().map_err(|_| invalid())?;
            let port = parse_port(&rest[V6_WIDTH..V6_WIDTH + PORT_WIDTH]).ok_or_else(invalid)?;
            let id = parse_id(&rest[V6_WIDTH + PORT_WIDTH..]).ok_or_else(invalid)?;
            Ok(GenericId {
                id,
                agent: Some(AgentAddr::new(IpAddr::V6(Ipv6Addr::from(ip)), port)),
                is_proxy: prefix == "5",
            })
        }
        _ => Err(invalid()),
    }
}

fn parse_port(digits: &str) -> Option<u16> {
    digits.parse::<u32>().ok().and_then(|p| u16::try_from(p).ok())
}

// Leading zeros would break the encode/decode bijection.
fn parse_id(digits: &str) -> Option<i64> {
    if digits.is_empty() || (digits.len() > 1 && digits.starts_with('0')) {
        return None;
    }
    digits.parse().ok()
}
