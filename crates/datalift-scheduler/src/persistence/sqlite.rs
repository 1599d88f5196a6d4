// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed job persistence.
//!
//! The embedded/test backend. SQLite's single-writer lock stands in for
//! Postgres row locking; behavior is otherwise identical to the production
//! backend.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use super::{AttemptRecord, JobPersistence, JobRecord, VERSION_KEY};
use crate::error::{Result, SchedulerError};
use crate::models::{AttemptOutput, Job, JobConfig, JobConfigType, JobStatus};

/// Schema applied at startup.
pub const SCHEMA: &str = include_str!("../../migrations/sqlite.sql");

const NON_TERMINAL_IN: &str = "('PENDING', 'RUNNING', 'INCOMPLETE')";
const TERMINAL_IN: &str = "('FAILED', 'SUCCEEDED', 'CANCELLED')";

/// SQLite-backed persistence implementation.
#[derive(Clone)]
pub struct SqliteJobPersistence {
    pool: SqlitePool,
}

impl SqliteJobPersistence {
    /// Create a new SQLite-backed persistence over an existing pool.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create and initialize an in-memory database.
    ///
    /// The pool is capped at one connection so every query sees the same
    /// in-memory database.
    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let persistence = Self::new(pool);
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Create and initialize a file-backed database, creating parent
    /// directories as needed.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(&url)
            .await?;
        let persistence = Self::new(pool);
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Apply the schema. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    async fn attempts_for(&self, job_id: i64) -> Result<Vec<AttemptRecord>> {
        let attempts = sqlx::query_as::<_, AttemptRecord>(
            r#"
            SELECT job_id, attempt_number, status, log_path, output_json AS output,
                   created_at, updated_at, ended_at
            FROM attempts
            WHERE job_id = ?
            ORDER BY attempt_number ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(attempts)
    }

    async fn hydrate(&self, record: JobRecord) -> Result<Job> {
        let attempts = self.attempts_for(record.id).await?;
        record.into_job(attempts)
    }

    async fn hydrate_all(&self, records: Vec<JobRecord>) -> Result<Vec<Job>> {
        let mut jobs = Vec::with_capacity(records.len());
        for record in records {
            jobs.push(self.hydrate(record).await?);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobPersistence for SqliteJobPersistence {
    async fn enqueue_job(&self, scope: Uuid, config: &JobConfig) -> Result<Option<i64>> {
        let now = Utc::now();
        let config_type = config.config_type().as_str();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT id FROM jobs WHERE scope = ? AND config_type = ? AND status IN {} LIMIT 1",
            NON_TERMINAL_IN
        ))
        .bind(scope.to_string())
        .bind(config_type)
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (scope, config_type, config_json, status, created_at, updated_at)
            VALUES (?, ?, ?, 'PENDING', ?, ?)
            RETURNING id
            "#,
        )
        .bind(scope.to_string())
        .bind(config_type)
        .bind(serde_json::to_string(config)?)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn create_attempt(&self, job_id: i64, log_path: &Path) -> Result<i32> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let status = status.ok_or(SchedulerError::JobNotFound { job_id })?;
        let status: JobStatus = status
            .parse()
            .map_err(|details| SchedulerError::CorruptRecord { job_id, details })?;

        if !matches!(status, JobStatus::Pending | JobStatus::Incomplete) {
            return Err(SchedulerError::IllegalTransition {
                job_id,
                from: status,
                to: JobStatus::Running,
            });
        }

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM attempts WHERE job_id = ?")
            .bind(job_id)
            .fetch_one(&mut *tx)
            .await?;
        let attempt_number = count as i32;

        sqlx::query(
            r#"
            INSERT INTO attempts (job_id, attempt_number, status, log_path, created_at, updated_at)
            VALUES (?, ?, 'RUNNING', ?, ?, ?)
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(log_path.display().to_string())
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => {
                SchedulerError::AttemptExists {
                    job_id,
                    number: attempt_number,
                }
            }
            _ => SchedulerError::Database(e),
        })?;

        sqlx::query("UPDATE jobs SET status = 'RUNNING', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(attempt_number)
    }

    async fn fail_attempt(&self, job_id: i64, attempt_number: i32) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'FAILED', updated_at = ?, ended_at = ?
            WHERE job_id = ? AND attempt_number = ?
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(attempt_number)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { job_id });
        }

        sqlx::query(&format!(
            "UPDATE jobs SET status = 'INCOMPLETE', updated_at = ? WHERE id = ? AND status IN {}",
            NON_TERMINAL_IN
        ))
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn succeed_attempt(
        &self,
        job_id: i64,
        attempt_number: i32,
        output: Option<&AttemptOutput>,
    ) -> Result<()> {
        let now = Utc::now();
        let output = output.map(serde_json::to_string).transpose()?;
        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'SUCCEEDED', output_json = ?, updated_at = ?, ended_at = ?
            WHERE job_id = ? AND attempt_number = ?
            "#,
        )
        .bind(output)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(attempt_number)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { job_id });
        }

        sqlx::query(&format!(
            "UPDATE jobs SET status = 'SUCCEEDED', updated_at = ? WHERE id = ? AND status IN {}",
            NON_TERMINAL_IN
        ))
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn requeue_job(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'PENDING', updated_at = ? WHERE id = ? AND status = 'INCOMPLETE'",
        )
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> = sqlx::query_scalar("SELECT status FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?;
        let status = status.ok_or(SchedulerError::JobNotFound { job_id })?;
        let status: JobStatus = status
            .parse()
            .map_err(|details| SchedulerError::CorruptRecord { job_id, details })?;
        if status.is_terminal() {
            // Cancel after a terminal write is a no-op; last writer won.
            tx.rollback().await?;
            return Ok(());
        }

        sqlx::query(
            r#"
            UPDATE attempts
            SET status = 'FAILED', updated_at = ?, ended_at = ?
            WHERE job_id = ? AND status = 'RUNNING'
            "#,
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET status = 'CANCELLED', updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(job_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: i64) -> Result<()> {
        sqlx::query(&format!(
            "UPDATE jobs SET status = 'FAILED', updated_at = ? WHERE id = ? AND status IN {}",
            NON_TERMINAL_IN
        ))
        .bind(Utc::now())
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs WHERE id = ?
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or(SchedulerError::JobNotFound { job_id })?;
        self.hydrate(record).await
    }

    async fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs WHERE status = ?
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(records).await
    }

    async fn list_jobs(
        &self,
        config_type: JobConfigType,
        scope: Uuid,
        page_size: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let records = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs WHERE config_type = ? AND scope = ?
            ORDER BY created_at DESC, id DESC
            LIMIT ? OFFSET ?
            "#,
        )
        .bind(config_type.as_str())
        .bind(scope.to_string())
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        self.hydrate_all(records).await
    }

    async fn get_next_job(&self) -> Result<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs AS j
            WHERE j.status = 'PENDING'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs r WHERE r.scope = j.scope AND r.status = 'RUNNING'
              )
            ORDER BY j.created_at ASC, j.id ASC
            LIMIT 1
            "#,
        )
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(self.hydrate(record).await?)),
            None => Ok(None),
        }
    }

    async fn get_last_replication_job(&self, scope: Uuid) -> Result<Option<Job>> {
        let record = sqlx::query_as::<_, JobRecord>(&format!(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs
            WHERE scope = ?
              AND config_type IN ('SYNC', 'RESET_CONNECTION')
              AND status IN {}
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
            TERMINAL_IN
        ))
        .bind(scope.to_string())
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(self.hydrate(record).await?)),
            None => Ok(None),
        }
    }

    async fn get_version(&self) -> Result<Option<String>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM airbyte_metadata WHERE key = ?")
                .bind(VERSION_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    async fn set_version(&self, version: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO airbyte_metadata (key, value) VALUES (?, ?)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(VERSION_KEY)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        AttemptStatus, CheckConnectionOutput, JobCheckConnectionConfig, JobGetSpecConfig,
        JobSyncConfig,
    };
    use serde_json::json;
    use std::path::PathBuf;

    fn sync_config() -> JobConfig {
        JobConfig::Sync(JobSyncConfig {
            source_docker_image: "airbyte/source-postgres:0.1.0".to_string(),
            destination_docker_image: "airbyte/destination-bigquery:0.2.0".to_string(),
            source_configuration: json!({"host": "db"}),
            destination_configuration: json!({"project": "p"}),
            configured_catalog: json!({"streams": []}),
            state: None,
        })
    }

    fn spec_config() -> JobConfig {
        JobConfig::GetSpec(JobGetSpecConfig {
            docker_image: "airbyte/source-postgres:0.1.0".to_string(),
        })
    }

    fn workspace(job_id: i64, attempt: i32) -> PathBuf {
        PathBuf::from(format!("/workspace/{}/{}", job_id, attempt))
    }

    #[tokio::test]
    async fn test_enqueue_then_succeed_round_trip() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();

        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        let number = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        assert_eq!(number, 0);

        db.succeed_attempt(job_id, number, None).await.unwrap();

        let succeeded = db.list_jobs_with_status(JobStatus::Succeeded).await.unwrap();
        assert_eq!(succeeded.len(), 1);
        assert_eq!(succeeded[0].id, job_id);
        assert_eq!(succeeded[0].attempts.len(), 1);
        assert_eq!(succeeded[0].attempts[0].status, AttemptStatus::Succeeded);
        assert!(succeeded[0].attempts[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_uniqueness_guard_suppresses_duplicate_enqueue() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();

        let first = db.enqueue_job(scope, &sync_config()).await.unwrap();
        assert!(first.is_some());
        // Same scope + config type while non-terminal: suppressed.
        let second = db.enqueue_job(scope, &sync_config()).await.unwrap();
        assert!(second.is_none());

        // A different config type for the same scope is allowed.
        let spec = db.enqueue_job(scope, &spec_config()).await.unwrap();
        assert!(spec.is_some());

        // Once the sync job is terminal, a new sync may be enqueued.
        let job_id = first.unwrap();
        let n = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        db.succeed_attempt(job_id, n, None).await.unwrap();
        let third = db.enqueue_job(scope, &sync_config()).await.unwrap();
        assert!(third.is_some());
    }

    #[tokio::test]
    async fn test_attempt_numbers_dense_from_zero() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();

        let n0 = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        db.fail_attempt(job_id, n0).await.unwrap();
        db.requeue_job(job_id).await.unwrap();
        let n1 = db.create_attempt(job_id, &workspace(job_id, 1)).await.unwrap();
        db.fail_attempt(job_id, n1).await.unwrap();
        db.requeue_job(job_id).await.unwrap();
        let n2 = db.create_attempt(job_id, &workspace(job_id, 2)).await.unwrap();

        assert_eq!((n0, n1, n2), (0, 1, 2));
        let job = db.get_job(job_id).await.unwrap();
        let numbers: Vec<i32> = job.attempts.iter().map(|a| a.number).collect();
        assert_eq!(numbers, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_create_attempt_rejected_while_running() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();

        let err = db
            .create_attempt(job_id, &workspace(job_id, 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::IllegalTransition {
                from: JobStatus::Running,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_fail_attempt_moves_job_to_incomplete() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        let n = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();

        db.fail_attempt(job_id, n).await.unwrap();
        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Incomplete);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
    }

    #[tokio::test]
    async fn test_cancel_job_fails_running_attempt() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();

        db.cancel_job(job_id).await.unwrap();
        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Cancelled);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);
        assert!(job.attempts[0].ended_at.is_some());
    }

    #[tokio::test]
    async fn test_cancel_is_noop_once_terminal() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        let n = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        db.succeed_attempt(job_id, n, None).await.unwrap();

        db.cancel_job(job_id).await.unwrap();
        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_get_next_job_skips_scope_with_running_job() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let busy_scope = Uuid::new_v4();
        let idle_scope = Uuid::new_v4();

        let busy_job = db
            .enqueue_job(busy_scope, &sync_config())
            .await
            .unwrap()
            .unwrap();
        db.create_attempt(busy_job, &workspace(busy_job, 0))
            .await
            .unwrap();
        // A second job for the busy scope (different type) is pending but its
        // scope has a RUNNING job, so it must be skipped.
        db.enqueue_job(busy_scope, &spec_config()).await.unwrap().unwrap();
        let idle_job = db
            .enqueue_job(idle_scope, &sync_config())
            .await
            .unwrap()
            .unwrap();

        let next = db.get_next_job().await.unwrap().unwrap();
        assert_eq!(next.id, idle_job);
    }

    #[tokio::test]
    async fn test_get_next_job_oldest_first() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let first_scope = Uuid::new_v4();
        let second_scope = Uuid::new_v4();

        let first = db
            .enqueue_job(first_scope, &sync_config())
            .await
            .unwrap()
            .unwrap();
        db.enqueue_job(second_scope, &sync_config())
            .await
            .unwrap()
            .unwrap();

        let next = db.get_next_job().await.unwrap().unwrap();
        assert_eq!(next.id, first);
    }

    #[tokio::test]
    async fn test_get_next_job_empty() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        assert!(db.get_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_last_replication_job() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();

        // No terminal sync yet.
        assert!(db.get_last_replication_job(scope).await.unwrap().is_none());

        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        let n = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        db.succeed_attempt(job_id, n, None).await.unwrap();

        let last = db.get_last_replication_job(scope).await.unwrap().unwrap();
        assert_eq!(last.id, job_id);
        assert!(last.ended_at().is_some());

        // Non-replication jobs do not count.
        let spec_id = db.enqueue_job(scope, &spec_config()).await.unwrap().unwrap();
        let n = db.create_attempt(spec_id, &workspace(spec_id, 0)).await.unwrap();
        db.succeed_attempt(spec_id, n, None).await.unwrap();
        let last = db.get_last_replication_job(scope).await.unwrap().unwrap();
        assert_eq!(last.id, job_id);
    }

    #[tokio::test]
    async fn test_fail_job_terminalizes() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();
        let job_id = db.enqueue_job(scope, &sync_config()).await.unwrap().unwrap();
        let n = db.create_attempt(job_id, &workspace(job_id, 0)).await.unwrap();
        db.fail_attempt(job_id, n).await.unwrap();

        db.fail_job(job_id).await.unwrap();
        let job = db.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);

        // Terminal jobs never transition.
        db.requeue_job(job_id).await.unwrap();
        assert_eq!(db.get_job(job_id).await.unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn test_version_round_trip() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        assert!(db.get_version().await.unwrap().is_none());

        db.set_version("0.9.0").await.unwrap();
        assert_eq!(db.get_version().await.unwrap().as_deref(), Some("0.9.0"));

        db.set_version("0.9.1").await.unwrap();
        assert_eq!(db.get_version().await.unwrap().as_deref(), Some("0.9.1"));
    }

    #[tokio::test]
    async fn test_list_jobs_paginated_newest_first() {
        let db = SqliteJobPersistence::in_memory().await.unwrap();
        let scope = Uuid::new_v4();

        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = db
                .enqueue_job(scope, &JobConfig::CheckConnection(JobCheckConnectionConfig {
                    docker_image: "airbyte/source-postgres:0.1.0".to_string(),
                    connection_configuration: json!({}),
                }))
                .await
                .unwrap()
                .unwrap();
            let n = db.create_attempt(id, &workspace(id, 0)).await.unwrap();
            db.succeed_attempt(
                id,
                n,
                Some(&AttemptOutput::CheckConnection(CheckConnectionOutput {
                    succeeded: true,
                    message: None,
                })),
            )
            .await
            .unwrap();
            ids.push(id);
        }

        let page = db
            .list_jobs(JobConfigType::CheckConnection, scope, 2, 0)
            .await
            .unwrap();
        assert_eq!(page.len(), 2);
        assert_eq!(page[0].id, ids[2]);
        assert_eq!(page[1].id, ids[1]);

        let rest = db
            .list_jobs(JobConfigType::CheckConnection, scope, 2, 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, ids[0]);

        // Output payload survives the round trip.
        assert!(matches!(
            rest[0].attempts[0].output,
            Some(AttemptOutput::CheckConnection(CheckConnectionOutput {
                succeeded: true,
                ..
            }))
        ));
    }
}
