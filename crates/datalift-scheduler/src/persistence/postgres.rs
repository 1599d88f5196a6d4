// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed job persistence.
//!
//! The production backend. `get_next_job` takes row locks with
//! `FOR UPDATE SKIP LOCKED` so concurrent submitters never hand the same job
//! to two workers.

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use sqlx::PgPool;
use uuid::Uuid;

use super::{AttemptRecord, JobPersistence, JobRecord, NON_TERMINAL, VERSION_KEY};
use crate::error::{Result, SchedulerError};
use crate::models::{AttemptOutput, Job, JobConfig, JobConfigType, JobStatus};

/// Schema applied at startup.
pub const SCHEMA: &str = include_str!("../../migrations/postgres.sql");

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresJobPersistence {
    pool: PgPool,
}

impl PostgresJobPersistence {
    /// Create a new Postgres-backed persistence over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
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
            WHERE job_id = $1
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
impl JobPersistence for PostgresJobPersistence {
    async fn enqueue_job(&self, scope: Uuid, config: &JobConfig) -> Result<Option<i64>> {
        let now = Utc::now();
        let config_type = config.config_type().as_str();
        let mut tx = self.pool.begin().await?;

        let existing: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT id FROM jobs
            WHERE scope = $1 AND config_type = $2 AND status = ANY($3)
            LIMIT 1
            "#,
        )
        .bind(scope.to_string())
        .bind(config_type)
        .bind(NON_TERMINAL.map(JobStatus::as_str).to_vec())
        .fetch_optional(&mut *tx)
        .await?;

        if existing.is_some() {
            tx.rollback().await?;
            return Ok(None);
        }

        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (scope, config_type, config_json, status, created_at, updated_at)
            VALUES ($1, $2, $3, 'PENDING', $4, $4)
            RETURNING id
            "#,
        )
        .bind(scope.to_string())
        .bind(config_type)
        .bind(serde_json::to_string(config)?)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(id))
    }

    async fn create_attempt(&self, job_id: i64, log_path: &Path) -> Result<i32> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
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

        let attempt_number: i32 =
            sqlx::query_scalar("SELECT COUNT(*)::int FROM attempts WHERE job_id = $1")
                .bind(job_id)
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            r#"
            INSERT INTO attempts (job_id, attempt_number, status, log_path, created_at, updated_at)
            VALUES ($1, $2, 'RUNNING', $3, $4, $4)
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(log_path.display().to_string())
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

        sqlx::query("UPDATE jobs SET status = 'RUNNING', updated_at = $2 WHERE id = $1")
            .bind(job_id)
            .bind(now)
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
            SET status = 'FAILED', updated_at = $3, ended_at = $3
            WHERE job_id = $1 AND attempt_number = $2
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { job_id });
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'INCOMPLETE', updated_at = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(NON_TERMINAL.map(JobStatus::as_str).to_vec())
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
            SET status = 'SUCCEEDED', output_json = $3, updated_at = $4, ended_at = $4
            WHERE job_id = $1 AND attempt_number = $2
            "#,
        )
        .bind(job_id)
        .bind(attempt_number)
        .bind(output)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(SchedulerError::JobNotFound { job_id });
        }

        sqlx::query(
            r#"
            UPDATE jobs SET status = 'SUCCEEDED', updated_at = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(job_id)
        .bind(now)
        .bind(NON_TERMINAL.map(JobStatus::as_str).to_vec())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn requeue_job(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            "UPDATE jobs SET status = 'PENDING', updated_at = $2 WHERE id = $1 AND status = 'INCOMPLETE'",
        )
        .bind(job_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn cancel_job(&self, job_id: i64) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let status: Option<String> =
            sqlx::query_scalar("SELECT status FROM jobs WHERE id = $1 FOR UPDATE")
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
            SET status = 'FAILED', updated_at = $2, ended_at = $2
            WHERE job_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query("UPDATE jobs SET status = 'CANCELLED', updated_at = $2 WHERE id = $1")
            .bind(job_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn fail_job(&self, job_id: i64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE jobs SET status = 'FAILED', updated_at = $2
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(NON_TERMINAL.map(JobStatus::as_str).to_vec())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, job_id: i64) -> Result<Job> {
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs WHERE id = $1
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
            FROM jobs WHERE status = $1
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
            FROM jobs WHERE config_type = $1 AND scope = $2
            ORDER BY created_at DESC, id DESC
            LIMIT $3 OFFSET $4
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
        let mut tx = self.pool.begin().await?;
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs j
            WHERE j.status = 'PENDING'
              AND NOT EXISTS (
                  SELECT 1 FROM jobs r WHERE r.scope = j.scope AND r.status = 'RUNNING'
              )
            ORDER BY j.created_at ASC, j.id ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .fetch_optional(&mut *tx)
        .await?;
        tx.commit().await?;

        match record {
            Some(record) => Ok(Some(self.hydrate(record).await?)),
            None => Ok(None),
        }
    }

    async fn get_last_replication_job(&self, scope: Uuid) -> Result<Option<Job>> {
        let terminal: Vec<&str> = JobStatus::TERMINAL.map(JobStatus::as_str).to_vec();
        let record = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, scope, config_type, config_json AS config, status, created_at, updated_at
            FROM jobs
            WHERE scope = $1
              AND config_type IN ('SYNC', 'RESET_CONNECTION')
              AND status = ANY($2)
            ORDER BY created_at DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(scope.to_string())
        .bind(terminal)
        .fetch_optional(&self.pool)
        .await?;

        match record {
            Some(record) => Ok(Some(self.hydrate(record).await?)),
            None => Ok(None),
        }
    }

    async fn get_version(&self) -> Result<Option<String>> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT value FROM airbyte_metadata WHERE key = $1")
                .bind(VERSION_KEY)
                .fetch_optional(&self.pool)
                .await?;
        Ok(version)
    }

    async fn set_version(&self, version: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO airbyte_metadata (key, value) VALUES ($1, $2)
            ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value
            "#,
        )
        .bind(VERSION_KEY)
        .bind(version)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
