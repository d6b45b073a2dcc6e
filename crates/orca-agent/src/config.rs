// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for orca-agent.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use orca_core::AgentAddr;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// URL of the shared store (SQLite URL)
    pub database_url: String,
    /// Address peers reach this agent at
    pub agent_ip: IpAddr,
    /// Port of the RPC server
    pub agent_port: u16,
    /// Installation directory of the managed database
    pub home_path: PathBuf,
    /// Agent version published in the agents table
    pub version: String,
    /// Sleep between two executor ticks
    pub executor_interval: Duration,
    /// Upper bound on subtasks executing at once on this agent
    pub max_parallel_tasks: usize,
    /// An agent without a heartbeat for this long is not live
    pub heartbeat_timeout: Duration,
    /// Per-request timeout of peer calls
    pub peer_timeout: Duration,
    /// Directory holding the observer control scripts
    pub observer_scripts: PathBuf,
    /// Race for take-over once the store is reachable
    pub take_over: bool,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through `lookup`, which returns the raw value of a
    /// variable when it is set.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let database_url = lookup("ORCA_DATABASE_URL").ok_or(ConfigError::Missing("ORCA_DATABASE_URL"))?;

        let agent_ip = parse(&lookup, "ORCA_AGENT_IP", IpAddr::from([127, 0, 0, 1]))?;
        let agent_port = parse(&lookup, "ORCA_AGENT_PORT", 2886u16)?;
        let home_path = PathBuf::from(lookup("ORCA_HOME_PATH").unwrap_or_else(|| ".".to_string()));
        let version = lookup("ORCA_VERSION").unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string());

        let executor_interval = Duration::from_millis(parse(&lookup, "ORCA_EXECUTOR_INTERVAL_MS", 1000u64)?);
        let max_parallel_tasks = parse(&lookup, "ORCA_MAX_PARALLEL_TASKS", 8usize)?;
        if max_parallel_tasks == 0 {
            return Err(ConfigError::Invalid {
                key: "ORCA_MAX_PARALLEL_TASKS",
                value: "0".to_string(),
            });
        }
        let heartbeat_timeout = Duration::from_secs(parse(&lookup, "ORCA_HEARTBEAT_TIMEOUT_SECS", 30u64)?);
        let peer_timeout = Duration::from_secs(parse(&lookup, "ORCA_PEER_TIMEOUT_SECS", 10u64)?);

        let observer_scripts = lookup("ORCA_OBSERVER_SCRIPTS")
            .map(PathBuf::from)
            .unwrap_or_else(|| home_path.join("scripts"));

        let take_over = lookup("ORCA_TAKE_OVER")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        Ok(Self {
            database_url,
            agent_ip,
            agent_port,
            home_path,
            version,
            executor_interval,
            max_parallel_tasks,
            heartbeat_timeout,
            peer_timeout,
            observer_scripts,
            take_over,
        })
    }

    /// This agent's address as peers know it.
    pub fn agent(&self) -> AgentAddr {
        AgentAddr::new(self.agent_ip, self.agent_port)
    }

    /// Address the RPC server binds to.
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.agent_ip, self.agent_port)
    }
}

fn parse<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match lookup(key) {
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),
    /// A variable is set to a value that does not parse.
    #[error("Invalid value for {key}: '{value}'")]
    Invalid {
        /// The offending variable.
        key: &'static str,
        /// Its raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = load(&[("ORCA_DATABASE_URL", "sqlite::memory:")]).unwrap();
        assert_eq!(config.agent().to_string(), "127.0.0.1:2886");
        assert_eq!(config.executor_interval, Duration::from_secs(1));
        assert_eq!(config.max_parallel_tasks, 8);
        assert_eq!(config.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.observer_scripts, PathBuf::from("./scripts"));
        assert_eq!(config.version, env!("CARGO_PKG_VERSION"));
        assert!(!config.take_over);
    }

    #[test]
    fn test_overrides() {
        let config = load(&[
            ("ORCA_DATABASE_URL", "sqlite:/var/lib/orca/orca.db"),
            ("ORCA_AGENT_IP", "10.0.0.2"),
            ("ORCA_AGENT_PORT", "2887"),
            ("ORCA_HOME_PATH", "/home/admin/oceanbase"),
            ("ORCA_EXECUTOR_INTERVAL_MS", "250"),
            ("ORCA_MAX_PARALLEL_TASKS", "2"),
            ("ORCA_TAKE_OVER", "true"),
        ])
        .unwrap();
        assert_eq!(config.bind_addr(), "10.0.0.2:2887".parse().unwrap());
        assert_eq!(config.executor_interval, Duration::from_millis(250));
        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.observer_scripts, PathBuf::from("/home/admin/oceanbase/scripts"));
        assert!(config.take_over);
    }

    #[test]
    fn test_missing_database_url() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::Missing("ORCA_DATABASE_URL")));
    }

    #[test]
    fn test_invalid_values() {
        let err = load(&[("ORCA_DATABASE_URL", "sqlite::memory:"), ("ORCA_AGENT_PORT", "http")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ORCA_AGENT_PORT", .. }));
        let err = load(&[("ORCA_DATABASE_URL", "sqlite::memory:"), ("ORCA_MAX_PARALLEL_TASKS", "0")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "ORCA_MAX_PARALLEL_TASKS", .. }));
    }
}
