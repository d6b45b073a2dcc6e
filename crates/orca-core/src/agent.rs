// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent addressing.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Network address of an agent (ip + listen port).
///
/// Ordering compares the parsed ip first, so `10.0.0.2` sorts before
/// `10.0.0.10`. The lowest address wins maintainer elections.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AgentAddr {
    pub ip: IpAddr,
    pub port: u16,
}

impl AgentAddr {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Self { ip, port }
    }

    /// Stable key used for per-agent context entries and lock owners.
    pub fn key(&self) -> String {
        self.to_string()
    }

    pub fn is_ipv6(&self) -> bool {
        self.ip.is_ipv6()
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            IpAddr::V4(ip) => write!(f, "{}:{}", ip, self.port),
            IpAddr::V6(ip) => write!(f, "[{}]:{}", ip, self.port),
        }
    }
}

impl FromStr for AgentAddr {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || CoreError::Validation {
            field: "agent".to_string(),
            message: format!("'{}' is not an ip:port address", s),
        };
        let (host, port) = s.rsplit_once(':').ok_or_else(invalid)?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        let ip = host.parse::<IpAddr>().map_err(|_| invalid())?;
        let port = port.parse::<u16>().map_err(|_| invalid())?;
        Ok(Self { ip, port })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        let v4: AgentAddr = "10.0.0.1:2886".parse().unwrap();
        assert_eq!(v4.to_string(), "10.0.0.1:2886");

        let v6: AgentAddr = "[::1]:2886".parse().unwrap();
        assert!(v6.is_ipv6());
        assert_eq!(v6.to_string(), "[::1]:2886");

        assert!("10.0.0.1".parse::<AgentAddr>().is_err());
        assert!("10.0.0.1:99999".parse::<AgentAddr>().is_err());
    }

    #[test]
    fn test_ordering_is_numeric() {
        let a: AgentAddr = "10.0.0.2:2886".parse().unwrap();
        let b: AgentAddr = "10.0.0.10:2886".parse().unwrap();
        assert!(a < b);
    }
}
