// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Observer control through shell scripts.
//!
//! Every operation runs `{scripts_dir}/{op}.sh` with its arguments. Pure
//! execution logic, no store access. Queries answer on stdout:
//! - `is_observer_alive`, `is_server_deleted`, `is_quorum_alive`: `true` or `false`
//! - `cluster_id`: a number
//! - `list_user_tenants`: a JSON array of `{id, name}`
//! - `list_servers`: one `ip:port` per line
//! - `tenant_config`: the value, empty when unset

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use orca_core::AgentAddr;
use tokio::process::Command;
use tracing::{debug, error};

use super::{BootstrapScript, ObserverError, ObserverOps, Result, Tenant};

/// Runs observer operations as scripts under one directory.
#[derive(Debug, Clone)]
pub struct ScriptObserverOps {
    scripts_dir: PathBuf,
    timeout: Duration,
}

impl ScriptObserverOps {
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        Self {
            scripts_dir: scripts_dir.into(),
            timeout: Duration::from_secs(600),
        }
    }

    /// Kill a script still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `op` and return its trimmed stdout.
    async fn run(&self, op: &str, args: &[String]) -> Result<String> {
        let script = self.scripts_dir.join(format!("{}.sh", op));
        debug!(op, script = %script.display(), ?args, "Running observer script");

        let mut cmd = Command::new("sh");
        cmd.arg(&script)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| ObserverError::Timeout { op: op.to_string() })??;

        if !output.status.success() {
            let exit_code = output.status.code().unwrap_or(-1);
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            error!(op, exit_code, stderr = %stderr, "Observer script failed");
            return Err(ObserverError::ExitCode {
                op: op.to_string(),
                exit_code,
                stderr,
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    async fn run_bool(&self, op: &str, args: &[String]) -> Result<bool> {
        let output = self.run(op, args).await?;
        match output.as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            _ => Err(ObserverError::Output {
                op: op.to_string(),
                output,
            }),
        }
    }
}

#[async_trait]
impl ObserverOps for ScriptObserverOps {
    fn kind(&self) -> &'static str {
        "script"
    }

    async fn deploy(&self, version: &str) -> Result<()> {
        self.run("deploy", &[version.to_string()]).await.map(drop)
    }

    async fn destroy(&self) -> Result<()> {
        self.run("destroy", &[]).await.map(drop)
    }

    async fn start_observer(&self) -> Result<()> {
        self.run("start_observer", &[]).await.map(drop)
    }

    async fn stop_observer(&self) -> Result<()> {
        self.run("stop_observer", &[]).await.map(drop)
    }

    async fn kill_observer(&self, force: bool) -> Result<()> {
        let args = if force { vec!["--force".to_string()] } else { vec![] };
        self.run("kill_observer", &args).await.map(drop)
    }

    async fn is_observer_alive(&self) -> Result<bool> {
        self.run_bool("is_observer_alive", &[]).await
    }

    async fn bootstrap(&self, servers: &[AgentAddr]) -> Result<()> {
        let args: Vec<String> = servers.iter().map(ToString::to_string).collect();
        self.run("bootstrap", &args).await.map(drop)
    }

    async fn run_script(&self, script: BootstrapScript) -> Result<()> {
        self.run(script.as_str(), &[]).await.map(drop)
    }

    async fn cluster_id(&self) -> Result<i64> {
        let output = self.run("cluster_id", &[]).await?;
        output.parse().map_err(|_| ObserverError::Output {
            op: "cluster_id".to_string(),
            output,
        })
    }

    async fn list_user_tenants(&self) -> Result<Vec<Tenant>> {
        let output = self.run("list_user_tenants", &[]).await?;
        if output.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_str(&output)?)
    }

    async fn check_path(&self, uri: &str) -> Result<()> {
        self.run("check_path", &[uri.to_string()]).await.map(drop)
    }

    async fn tenant_config(&self, tenant: &Tenant, key: &str) -> Result<Option<String>> {
        let output = self.run("tenant_config", &[tenant.name.clone(), key.to_string()]).await?;
        Ok((!output.is_empty()).then_some(output))
    }

    async fn set_tenant_config(&self, tenant: &Tenant, key: &str, value: &str) -> Result<()> {
        self.run(
            "set_tenant_config",
            &[tenant.name.clone(), key.to_string(), value.to_string()],
        )
        .await
        .map(drop)
    }

    async fn list_servers(&self) -> Result<Vec<AgentAddr>> {
        let output = self.run("list_servers", &[]).await?;
        output
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(|line| {
                line.parse().map_err(|_| ObserverError::Output {
                    op: "list_servers".to_string(),
                    output: line.to_string(),
                })
            })
            .collect()
    }

    async fn add_server(&self, server: &AgentAddr) -> Result<()> {
        self.run("add_server", &[server.to_string()]).await.map(drop)
    }

    async fn delete_server(&self, server: &AgentAddr) -> Result<()> {
        self.run("delete_server", &[server.to_string()]).await.map(drop)
    }

    async fn is_server_deleted(&self, server: &AgentAddr) -> Result<bool> {
        self.run_bool("is_server_deleted", &[server.to_string()]).await
    }

    async fn is_quorum_alive(&self, without: &AgentAddr) -> Result<bool> {
        self.run_bool("is_quorum_alive", &[without.to_string()]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn script(dir: &TempDir, op: &str, body: &str) {
        std::fs::write(dir.path().join(format!("{}.sh", op)), body).unwrap();
    }

    #[tokio::test]
    async fn test_arguments_and_output() {
        let dir = TempDir::new().unwrap();
        script(&dir, "deploy", "echo \"$1\" > \"$(dirname \"$0\")/deployed\"\n");
        script(&dir, "is_observer_alive", "echo true\n");
        script(&dir, "cluster_id", "echo 1001\n");
        script(
            &dir,
            "list_user_tenants",
            "echo '[{\"id\":1002,\"name\":\"t1\"},{\"id\":1004,\"name\":\"t2\"}]'\n",
        );
        script(&dir, "list_servers", "echo 10.0.0.1:2882\necho 10.0.0.2:2882\n");
        let ops = ScriptObserverOps::new(dir.path());

        ops.deploy("4.2.1").await.unwrap();
        let deployed = std::fs::read_to_string(dir.path().join("deployed")).unwrap();
        assert_eq!(deployed.trim(), "4.2.1");

        assert!(ops.is_observer_alive().await.unwrap());
        assert_eq!(ops.cluster_id().await.unwrap(), 1001);
        let tenants = ops.list_user_tenants().await.unwrap();
        assert_eq!(tenants[1], Tenant { id: 1004, name: "t2".to_string() });
        let servers = ops.list_servers().await.unwrap();
        assert_eq!(servers.len(), 2);
        assert_eq!(servers[0].port, 2882);
    }

    #[tokio::test]
    async fn test_failures() {
        let dir = TempDir::new().unwrap();
        script(&dir, "stop_observer", "echo 'observer busy' >&2\nexit 3\n");
        script(&dir, "is_quorum_alive", "echo maybe\n");
        script(&dir, "start_observer", "sleep 5\n");
        let ops = ScriptObserverOps::new(dir.path()).with_timeout(Duration::from_millis(200));

        match ops.stop_observer().await.unwrap_err() {
            ObserverError::ExitCode { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 3);
                assert_eq!(stderr, "observer busy");
            }
            other => panic!("expected exit code error, got {:?}", other),
        }
        let x: AgentAddr = "10.0.0.3:2886".parse().unwrap();
        assert!(matches!(
            ops.is_quorum_alive(&x).await,
            Err(ObserverError::Output { .. })
        ));
        assert!(matches!(ops.start_observer().await, Err(ObserverError::Timeout { .. })));
        // A missing script is a failed run of `sh`.
        assert!(matches!(ops.destroy().await, Err(ObserverError::ExitCode { .. })));
    }
}
