// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};

use crate::agent::AgentAddr;
use crate::context::TaskContext;
use crate::error::{CoreError, Result};
use crate::generic_id;
use crate::maintenance::{MaintenanceType, Maintainer};
use crate::migrations;
use crate::model::{Dag, Node, SubTask};
use crate::task::{Operator, TaskState};

use super::{
    AgentRecord, DagFilter, DagRecord, LockRecord, NodeRecord, Persistence, SubTaskRecord,
    TaskLogRecord, assemble_dag,
};

const DAG_COLUMNS: &str = "id, name, dag_type, state, operator, stage, max_stage, is_local, owner, \
     maintenance_type, maintenance_key, failure_exit_maintenance, context, start_time, end_time, created_at";

const NODE_COLUMNS: &str =
    "id, dag_id, name, node_type, stage, state, operator, context, start_time, end_time";

const TASK_COLUMNS: &str = "id, node_id, dag_id, seq, name, struct_name, state, operator, execute_times, \
     executor, can_cancel, can_continue, can_pass, can_retry, can_rollback, context, additional_data, \
     start_time, end_time";

const AGENT_COLUMNS: &str = "address, identity, version, home_path, last_heartbeat, created_at";

/// A lock joined with the dag holding it.
#[derive(Debug, sqlx::FromRow)]
struct HeldLock {
    dag_id: i64,
    lock_type: i32,
    lock_key: String,
    name: String,
    is_local: bool,
    owner: String,
    dag_type: String,
}

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`migrations::run_sqlite`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file when missing, then
    /// runs all migrations.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::Database {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url, 5).await
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Invalid SQLite URL {}: {}", url, e),
            })?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::Database {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    /// A private in-memory database. Uses a single connection that never
    /// expires, since every new in-memory connection is a new database.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrations::run_sqlite(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Begin a transaction holding the database write lock. Dropping it
    /// without a commit rolls it back.
    async fn begin_immediate(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }
}

fn to_json(context: &TaskContext) -> Result<String> {
    Ok(serde_json::to_string(context)?)
}

async fn insert_dag_tx(conn: &mut SqliteConnection, dag: &Dag) -> Result<i64> {
    let lock_owner = dag.lock_owner();

    if dag.maintainer.is_locking() {
        let held: Vec<HeldLock> = sqlx::query_as(
            r#"
            SELECT l.dag_id, l.lock_type, l.lock_key, d.name, d.is_local, d.owner, d.dag_type
            FROM maintenance_locks l
            JOIN dag_instances d ON d.id = l.dag_id
            WHERE l.owner = ?
            ORDER BY l.dag_id
            "#,
        )
        .bind(&lock_owner)
        .fetch_all(&mut *conn)
        .await?;

        for lock in held {
            let kind = MaintenanceType::from_i32(lock.lock_type).ok_or_else(|| {
                CoreError::Serialization(format!("unknown lock type {}", lock.lock_type))
            })?;
            let scope = Maintainer {
                kind,
                key: lock.lock_key,
            };
            if scope.overlaps(&dag.maintainer) {
                let owner: AgentAddr = lock.owner.parse()?;
                return Err(CoreError::MaintenanceConflict {
                    holder: generic_id::encode(lock.dag_id, &owner, lock.is_local, &lock.dag_type),
                    name: lock.name,
                });
            }
        }
    }

    let now = Utc::now();
    let dag_id = sqlx::query(
        r#"
        INSERT INTO dag_instances
            (name, dag_type, state, operator, stage, max_stage, is_local, owner,
             maintenance_type, maintenance_key, failure_exit_maintenance, context,
             start_time, end_time, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&dag.name)
    .bind(&dag.dag_type)
    .bind(dag.state.as_i32())
    .bind(dag.operator.as_i32())
    .bind(dag.stage)
    .bind(dag.max_stage)
    .bind(dag.is_local)
    .bind(dag.owner.to_string())
    .bind(dag.maintainer.kind.as_i32())
    .bind(&dag.maintainer.key)
    .bind(dag.failure_exit_maintenance)
    .bind(to_json(&dag.context)?)
    .bind(dag.start_time)
    .bind(dag.end_time)
    .bind(now)
    .execute(&mut *conn)
    .await?
    .last_insert_rowid();

    for node in &dag.nodes {
        let node_id = sqlx::query(
            r#"
            INSERT INTO node_instances
                (dag_id, name, node_type, stage, state, operator, context, start_time, end_time)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(dag_id)
        .bind(&node.name)
        .bind(node.node_type.as_i32())
        .bind(node.stage)
        .bind(node.state.as_i32())
        .bind(node.operator.as_i32())
        .bind(to_json(&node.context)?)
        .bind(node.start_time)
        .bind(node.end_time)
        .execute(&mut *conn)
        .await?
        .last_insert_rowid();

        for task in &node.tasks {
            let additional = task
                .additional_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?;
            sqlx::query(
                r#"
                INSERT INTO sub_task_instances
                    (node_id, dag_id, seq, name, struct_name, state, operator, execute_times,
                     executor, can_cancel, can_continue, can_pass, can_retry, can_rollback,
                     context, additional_data, start_time, end_time)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(node_id)
            .bind(dag_id)
            .bind(task.seq)
            .bind(&task.name)
            .bind(&task.struct_name)
            .bind(task.state.as_i32())
            .bind(task.operator.as_i32())
            .bind(task.execute_times)
            .bind(task.executor.to_string())
            .bind(task.capabilities.can_cancel)
            .bind(task.capabilities.can_continue)
            .bind(task.capabilities.can_pass)
            .bind(task.capabilities.can_retry)
            .bind(task.capabilities.can_rollback)
            .bind(to_json(&task.context)?)
            .bind(additional)
            .bind(task.start_time)
            .bind(task.end_time)
            .execute(&mut *conn)
            .await?;
        }
    }

    if dag.maintainer.is_locking() {
        sqlx::query(
            r#"
            INSERT INTO maintenance_locks (dag_id, owner, lock_type, lock_key, acquired_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(dag_id)
        .bind(&lock_owner)
        .bind(dag.maintainer.kind.as_i32())
        .bind(&dag.maintainer.key)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }

    Ok(dag_id)
}

async fn write_dag_progress(conn: &mut SqliteConnection, dag: &Dag) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE dag_instances
        SET state = ?, stage = ?, context = ?, start_time = ?, end_time = ?
        WHERE id = ?
        "#,
    )
    .bind(dag.state.as_i32())
    .bind(dag.stage)
    .bind(to_json(&dag.context)?)
    .bind(dag.start_time)
    .bind(dag.end_time)
    .bind(dag.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_node(conn: &mut SqliteConnection, node: &Node) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE node_instances
        SET state = ?, operator = ?, context = ?, start_time = ?, end_time = ?
        WHERE id = ?
        "#,
    )
    .bind(node.state.as_i32())
    .bind(node.operator.as_i32())
    .bind(to_json(&node.context)?)
    .bind(node.start_time)
    .bind(node.end_time)
    .bind(node.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn write_task(conn: &mut SqliteConnection, task: &SubTask) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE sub_task_instances
        SET state = ?, operator = ?, execute_times = ?, context = ?, start_time = ?, end_time = ?
        WHERE id = ?
        "#,
    )
    .bind(task.state.as_i32())
    .bind(task.operator.as_i32())
    .bind(task.execute_times)
    .bind(to_json(&task.context)?)
    .bind(task.start_time)
    .bind(task.end_time)
    .bind(task.id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn release_lock(conn: &mut SqliteConnection, dag_id: i64) -> Result<()> {
    sqlx::query("DELETE FROM maintenance_locks WHERE dag_id = ?")
        .bind(dag_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn insert_dag(&self, dag: &Dag) -> Result<i64> {
        let mut tx = self.begin_immediate().await?;
        let dag_id = insert_dag_tx(&mut tx, dag).await?;
        tx.commit().await?;
        Ok(dag_id)
    }

    async fn get_dag(&self, dag_id: i64) -> Result<Option<DagRecord>> {
        let record = sqlx::query_as::<_, DagRecord>(&format!(
            "SELECT {} FROM dag_instances WHERE id = ?",
            DAG_COLUMNS
        ))
        .bind(dag_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn load_dag(&self, dag_id: i64) -> Result<Option<Dag>> {
        let Some(dag) = self.get_dag(dag_id).await? else {
            return Ok(None);
        };
        let nodes = sqlx::query_as::<_, NodeRecord>(&format!(
            "SELECT {} FROM node_instances WHERE dag_id = ? ORDER BY stage",
            NODE_COLUMNS
        ))
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;
        let tasks = sqlx::query_as::<_, SubTaskRecord>(&format!(
            "SELECT {} FROM sub_task_instances WHERE dag_id = ? ORDER BY node_id, seq",
            TASK_COLUMNS
        ))
        .bind(dag_id)
        .fetch_all(&self.pool)
        .await?;
        assemble_dag(dag, nodes, tasks).map(Some)
    }

    async fn list_dags(&self, filter: &DagFilter) -> Result<Vec<DagRecord>> {
        let mut sql = format!("SELECT {} FROM dag_instances WHERE 1 = 1", DAG_COLUMNS);
        if filter.unfinished_only {
            sql.push_str(&format!(" AND state != {}", TaskState::Succeed.as_i32()));
        }
        if filter.name.is_some() {
            sql.push_str(" AND name = ?");
        }
        sql.push_str(" ORDER BY id DESC LIMIT ?");

        let mut query = sqlx::query_as::<_, DagRecord>(&sql);
        if let Some(name) = &filter.name {
            query = query.bind(name);
        }
        let records = query.bind(filter.limit).fetch_all(&self.pool).await?;
        Ok(records)
    }

    async fn list_schedulable_dags(&self, owner: &AgentAddr, include_cluster: bool) -> Result<Vec<DagRecord>> {
        let records = sqlx::query_as::<_, DagRecord>(&format!(
            r#"
            SELECT {} FROM dag_instances
            WHERE state IN (?, ?)
              AND ((is_local = 1 AND owner = ?) OR (is_local = 0 AND ? = 1))
            ORDER BY id
            "#,
            DAG_COLUMNS
        ))
        .bind(TaskState::Ready.as_i32())
        .bind(TaskState::Running.as_i32())
        .bind(owner.to_string())
        .bind(include_cluster)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn node_dag_id(&self, node_id: i64) -> Result<Option<i64>> {
        let dag_id = sqlx::query_scalar::<_, i64>("SELECT dag_id FROM node_instances WHERE id = ?")
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(dag_id)
    }

    async fn get_task(&self, task_id: i64) -> Result<Option<SubTaskRecord>> {
        let record = sqlx::query_as::<_, SubTaskRecord>(&format!(
            "SELECT {} FROM sub_task_instances WHERE id = ?",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn update_dag_progress(&self, dag: &Dag) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_dag_progress(&mut conn, dag).await
    }

    async fn finish_dag(&self, dag: &Dag, release: bool) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        write_dag_progress(&mut tx, dag).await?;
        if release {
            release_lock(&mut tx, dag.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn update_node(&self, node: &Node) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        write_node(&mut conn, node).await
    }

    async fn dispatch_task(&self, task: &SubTask) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instances
            SET state = ?, operator = ?, context = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(TaskState::Ready.as_i32())
        .bind(task.operator.as_i32())
        .bind(to_json(&task.context)?)
        .bind(task.id)
        .bind(TaskState::Pending.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn reset_ready_tasks(&self, node_id: i64) -> Result<u64> {
        let result = sqlx::query(
            "UPDATE sub_task_instances SET state = ? WHERE node_id = ? AND state = ?",
        )
        .bind(TaskState::Pending.as_i32())
        .bind(node_id)
        .bind(TaskState::Ready.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn list_ready_tasks(&self, executor: &AgentAddr, limit: i64) -> Result<Vec<SubTaskRecord>> {
        let records = sqlx::query_as::<_, SubTaskRecord>(&format!(
            "SELECT {} FROM sub_task_instances WHERE executor = ? AND state = ? ORDER BY dag_id, seq LIMIT ?",
            TASK_COLUMNS
        ))
        .bind(executor.to_string())
        .bind(TaskState::Ready.as_i32())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_tasks_in_state(&self, executor: &AgentAddr, state: TaskState) -> Result<Vec<SubTaskRecord>> {
        let records = sqlx::query_as::<_, SubTaskRecord>(&format!(
            "SELECT {} FROM sub_task_instances WHERE executor = ? AND state = ? ORDER BY id",
            TASK_COLUMNS
        ))
        .bind(executor.to_string())
        .bind(state.as_i32())
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn claim_task(&self, task_id: i64, started_at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instances
            SET state = ?, execute_times = execute_times + 1, start_time = ?, end_time = NULL
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(TaskState::Running.as_i32())
        .bind(started_at)
        .bind(task_id)
        .bind(TaskState::Ready.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn complete_task(
        &self,
        task_id: i64,
        state: TaskState,
        context: &TaskContext,
        ended_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE sub_task_instances
            SET state = ?, context = ?, end_time = ?
            WHERE id = ? AND state = ?
            "#,
        )
        .bind(state.as_i32())
        .bind(to_json(context)?)
        .bind(ended_at)
        .bind(task_id)
        .bind(TaskState::Running.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn transition_task(&self, task_id: i64, from: TaskState, to: TaskState) -> Result<bool> {
        let ended_at = to.is_terminal().then(Utc::now);
        let result = sqlx::query(
            "UPDATE sub_task_instances SET state = ?, end_time = ? WHERE id = ? AND state = ?",
        )
        .bind(to.as_i32())
        .bind(ended_at)
        .bind(task_id)
        .bind(from.as_i32())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn task_operators(&self, task_ids: &[i64]) -> Result<Vec<(i64, i32)>> {
        if task_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; task_ids.len()].join(", ");
        let sql = format!(
            "SELECT id, operator FROM sub_task_instances WHERE id IN ({})",
            placeholders
        );
        let mut query = sqlx::query_as::<_, (i64, i32)>(&sql);
        for id in task_ids {
            query = query.bind(*id);
        }
        Ok(query.fetch_all(&self.pool).await?)
    }

    async fn apply_operator(
        &self,
        dag: &Dag,
        expected: (TaskState, Operator),
        release: bool,
    ) -> Result<()> {
        let mut tx = self.begin_immediate().await?;
        let updated = sqlx::query(
            r#"
            UPDATE dag_instances
            SET state = ?, operator = ?, stage = ?, context = ?, start_time = ?, end_time = ?
            WHERE id = ? AND state = ? AND operator = ?
            "#,
        )
        .bind(dag.state.as_i32())
        .bind(dag.operator.as_i32())
        .bind(dag.stage)
        .bind(to_json(&dag.context)?)
        .bind(dag.start_time)
        .bind(dag.end_time)
        .bind(dag.id)
        .bind(expected.0.as_i32())
        .bind(expected.1.as_i32())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(CoreError::invalid_state(
                dag.generic_id(),
                "dag changed while the operator was being applied",
            ));
        }
        for node in &dag.nodes {
            write_node(&mut tx, node).await?;
            for task in &node.tasks {
                write_task(&mut tx, task).await?;
            }
        }
        if release {
            release_lock(&mut tx, dag.id).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn cancel_dag(&self, dag_id: i64, node_id: i64) -> Result<()> {
        let cancel = Operator::Cancel.as_i32();
        let mut tx = self.begin_immediate().await?;
        let updated = sqlx::query(
            r#"
            UPDATE dag_instances SET operator = ?
            WHERE id = ? AND state IN (?, ?) AND operator != ?
            "#,
        )
        .bind(cancel)
        .bind(dag_id)
        .bind(TaskState::Ready.as_i32())
        .bind(TaskState::Running.as_i32())
        .bind(Operator::Rollback.as_i32())
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() != 1 {
            return Err(CoreError::invalid_state(
                dag_id,
                "dag finished or started rolling back before it could be cancelled",
            ));
        }
        sqlx::query("UPDATE node_instances SET operator = ? WHERE id = ? AND state IN (?, ?, ?)")
            .bind(cancel)
            .bind(node_id)
            .bind(TaskState::Pending.as_i32())
            .bind(TaskState::Ready.as_i32())
            .bind(TaskState::Running.as_i32())
            .execute(&mut *tx)
            .await?;
        sqlx::query("UPDATE sub_task_instances SET operator = ? WHERE node_id = ? AND state = ?")
            .bind(cancel)
            .bind(node_id)
            .bind(TaskState::Running.as_i32())
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            r#"
            UPDATE sub_task_instances
            SET operator = ?, state = ?, end_time = ?
            WHERE node_id = ? AND state = ?
            "#,
        )
        .bind(cancel)
        .bind(TaskState::Failed.as_i32())
        .bind(Utc::now())
        .bind(node_id)
        .bind(TaskState::Ready.as_i32())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn append_task_log(&self, task_id: i64, execute_times: i32, content: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sub_task_logs (task_id, execute_times, content, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(task_id)
        .bind(execute_times)
        .bind(content)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn task_logs(&self, task_id: i64) -> Result<Vec<TaskLogRecord>> {
        let records = sqlx::query_as::<_, TaskLogRecord>(
            r#"
            SELECT id, task_id, execute_times, content, created_at
            FROM sub_task_logs
            WHERE task_id = ?
            ORDER BY id
            "#,
        )
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn list_locks(&self, owner: &str) -> Result<Vec<LockRecord>> {
        let records = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT dag_id, owner, lock_type, lock_key, acquired_at
            FROM maintenance_locks
            WHERE owner = ?
            ORDER BY dag_id
            "#,
        )
        .bind(owner)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn last_maintenance_dag(&self, owner: &str) -> Result<Option<DagRecord>> {
        let record = sqlx::query_as::<_, DagRecord>(&format!(
            r#"
            SELECT {} FROM dag_instances
            WHERE id = (
                SELECT dag_id FROM maintenance_locks WHERE owner = ? ORDER BY dag_id DESC LIMIT 1
            )
            "#,
            DAG_COLUMNS
        ))
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn upsert_agent(&self, agent: &AgentRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO agents (address, identity, version, home_path, last_heartbeat, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(address) DO UPDATE
            SET version = excluded.version, home_path = excluded.home_path
            "#,
        )
        .bind(&agent.address)
        .bind(&agent.identity)
        .bind(&agent.version)
        .bind(&agent.home_path)
        .bind(agent.last_heartbeat)
        .bind(agent.created_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_agent(&self, address: &str) -> Result<Option<AgentRecord>> {
        let record = sqlx::query_as::<_, AgentRecord>(&format!(
            "SELECT {} FROM agents WHERE address = ?",
            AGENT_COLUMNS
        ))
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;
        Ok(record)
    }

    async fn list_agents(&self) -> Result<Vec<AgentRecord>> {
        let records = sqlx::query_as::<_, AgentRecord>(&format!(
            "SELECT {} FROM agents ORDER BY address",
            AGENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    async fn update_agent_identity(&self, address: &str, expected: &str, identity: &str) -> Result<bool> {
        let result = sqlx::query("UPDATE agents SET identity = ? WHERE address = ? AND identity = ?")
            .bind(identity)
            .bind(address)
            .bind(expected)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn claim_take_over_master(&self, address: &str, expected: &str) -> Result<bool> {
        let mut tx = self.begin_immediate().await?;
        let masters: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agents WHERE identity = 'TAKE_OVER_MASTER'")
            .fetch_one(&mut *tx)
            .await?;
        if masters > 0 {
            return Ok(false);
        }
        let result = sqlx::query("UPDATE agents SET identity = 'TAKE_OVER_MASTER' WHERE address = ? AND identity = ?")
            .bind(address)
            .bind(expected)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() == 1)
    }

    async fn heartbeat(&self, address: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE agents SET last_heartbeat = ? WHERE address = ?")
            .bind(at)
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_agent(&self, address: &str) -> Result<()> {
        sqlx::query("DELETE FROM agents WHERE address = ?")
            .bind(address)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
