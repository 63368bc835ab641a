//! Registry of executors seen via heartbeat.
//!
//! Purely informational: the queue's correctness never depends on it, and a
//! failed upsert does not fail the heartbeat that carried it.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::{FromRow, PgPool, Row};
use tracing::instrument;

use crate::clock::{Clock, SystemClock};

/// Metadata an executor reports about itself on every heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorHeartbeat {
    pub hostname: String,
    pub queue_name: String,
    pub os: String,
    pub architecture: String,
    pub docker_version: String,
    pub executor_version: String,
    pub git_version: String,
    pub ignite_version: String,
    pub src_cli_version: String,
}

/// A registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutorInfo {
    #[serde(flatten)]
    pub heartbeat: ExecutorHeartbeat,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RegistryError {
    #[error("executor registry unavailable: {0}")]
    Unavailable(String),
    #[error("executor registry storage error: {0}")]
    Storage(String),
}

#[async_trait]
pub trait ExecutorRegistry: Send + Sync {
    async fn upsert_heartbeat(&self, heartbeat: &ExecutorHeartbeat) -> Result<(), RegistryError>;

    /// All known executors, most recently seen first.
    async fn list(&self) -> Result<Vec<ExecutorInfo>, RegistryError>;
}

/// In-memory registry for tests/dev.
pub struct InMemoryExecutorRegistry {
    clock: Arc<dyn Clock>,
    inner: RwLock<BTreeMap<String, ExecutorInfo>>,
}

impl InMemoryExecutorRegistry {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutorRegistry for InMemoryExecutorRegistry {
    async fn upsert_heartbeat(&self, heartbeat: &ExecutorHeartbeat) -> Result<(), RegistryError> {
        let now = self.clock.now();
        let mut inner = self
            .inner
            .write()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;

        inner
            .entry(heartbeat.hostname.clone())
            .and_modify(|info| {
                info.heartbeat = heartbeat.clone();
                info.last_seen_at = now;
            })
            .or_insert_with(|| ExecutorInfo {
                heartbeat: heartbeat.clone(),
                first_seen_at: now,
                last_seen_at: now,
            });
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ExecutorInfo>, RegistryError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| RegistryError::Unavailable("registry lock poisoned".to_string()))?;
        let mut all: Vec<ExecutorInfo> = inner.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen_at.cmp(&a.last_seen_at));
        Ok(all)
    }
}

/// Postgres-backed registry (`executor_heartbeats` table).
#[derive(Debug, Clone)]
pub struct PostgresExecutorRegistry {
    pool: Arc<PgPool>,
}

impl PostgresExecutorRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    pub fn from_shared(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExecutorRegistry for PostgresExecutorRegistry {
    #[instrument(skip(self, heartbeat), fields(executor = %heartbeat.hostname), err)]
    async fn upsert_heartbeat(&self, heartbeat: &ExecutorHeartbeat) -> Result<(), RegistryError> {
        sqlx::query(
            r#"
            INSERT INTO executor_heartbeats (
                hostname, queue_name, os, architecture, docker_version,
                executor_version, git_version, ignite_version, src_cli_version,
                first_seen_at, last_seen_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now(), now())
            ON CONFLICT (hostname) DO UPDATE
            SET queue_name = EXCLUDED.queue_name,
                os = EXCLUDED.os,
                architecture = EXCLUDED.architecture,
                docker_version = EXCLUDED.docker_version,
                executor_version = EXCLUDED.executor_version,
                git_version = EXCLUDED.git_version,
                ignite_version = EXCLUDED.ignite_version,
                src_cli_version = EXCLUDED.src_cli_version,
                last_seen_at = now()
            "#,
        )
        .bind(&heartbeat.hostname)
        .bind(&heartbeat.queue_name)
        .bind(&heartbeat.os)
        .bind(&heartbeat.architecture)
        .bind(&heartbeat.docker_version)
        .bind(&heartbeat.executor_version)
        .bind(&heartbeat.git_version)
        .bind(&heartbeat.ignite_version)
        .bind(&heartbeat.src_cli_version)
        .execute(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn list(&self) -> Result<Vec<ExecutorInfo>, RegistryError> {
        let rows = sqlx::query(
            r#"
            SELECT *
            FROM executor_heartbeats
            ORDER BY last_seen_at DESC
            "#,
        )
        .fetch_all(&*self.pool)
        .await
        .map_err(map_sqlx_error)?;

        rows.iter()
            .map(|row| {
                ExecutorRow::from_row(row)
                    .map(ExecutorInfo::from)
                    .map_err(map_sqlx_error)
            })
            .collect()
    }
}

fn map_sqlx_error(err: sqlx::Error) -> RegistryError {
    match err {
        sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
            RegistryError::Unavailable(err.to_string())
        }
        other => RegistryError::Storage(other.to_string()),
    }
}

#[derive(Debug)]
struct ExecutorRow {
    hostname: String,
    queue_name: String,
    os: String,
    architecture: String,
    docker_version: String,
    executor_version: String,
    git_version: String,
    ignite_version: String,
    src_cli_version: String,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for ExecutorRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(ExecutorRow {
            hostname: row.try_get("hostname")?,
            queue_name: row.try_get("queue_name")?,
            os: row.try_get("os")?,
            architecture: row.try_get("architecture")?,
            docker_version: row.try_get("docker_version")?,
            executor_version: row.try_get("executor_version")?,
            git_version: row.try_get("git_version")?,
            ignite_version: row.try_get("ignite_version")?,
            src_cli_version: row.try_get("src_cli_version")?,
            first_seen_at: row.try_get("first_seen_at")?,
            last_seen_at: row.try_get("last_seen_at")?,
        })
    }
}

impl From<ExecutorRow> for ExecutorInfo {
    fn from(row: ExecutorRow) -> Self {
        ExecutorInfo {
            heartbeat: ExecutorHeartbeat {
                hostname: row.hostname,
                queue_name: row.queue_name,
                os: row.os,
                architecture: row.architecture,
                docker_version: row.docker_version,
                executor_version: row.executor_version,
                git_version: row.git_version,
                ignite_version: row.ignite_version,
                src_cli_version: row.src_cli_version,
            },
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn upsert_keeps_first_seen() {
        let clock = Arc::new(ManualClock::default());
        let registry = InMemoryExecutorRegistry::with_clock(clock.clone());
        let mut heartbeat = ExecutorHeartbeat {
            hostname: "exec-1".into(),
            queue_name: "indexing".into(),
            os: "linux".into(),
            ..Default::default()
        };

        registry.upsert_heartbeat(&heartbeat).await.unwrap();
        let first_seen = clock.now();
        clock.advance(chrono::Duration::seconds(5));
        heartbeat.executor_version = "5.2.0".into();
        registry.upsert_heartbeat(&heartbeat).await.unwrap();

        let all = registry.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].first_seen_at, first_seen);
        assert_eq!(all[0].last_seen_at, first_seen + chrono::Duration::seconds(5));
        assert_eq!(all[0].heartbeat.executor_version, "5.2.0");
    }
}
