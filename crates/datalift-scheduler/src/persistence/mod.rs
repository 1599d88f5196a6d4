// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job persistence interfaces and backends.
//!
//! The database is the system of record and the synchronization substrate:
//! every operation is one transaction, and all cross-thread coordination
//! flows through committed state. Jobs and attempts are mutated only through
//! this API.

pub mod postgres;
pub mod sqlite;

pub use self::postgres::PostgresJobPersistence;
pub use self::sqlite::SqliteJobPersistence;

use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Result, SchedulerError};
use crate::models::{Attempt, AttemptOutput, Job, JobConfig, JobConfigType, JobStatus};

/// Metadata key holding the platform version stamped by the config server.
pub const VERSION_KEY: &str = "version";

/// Job row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct JobRecord {
    /// Monotonic job id.
    pub id: i64,
    /// Connection scope (uuid as text).
    pub scope: String,
    /// Uppercase config type tag.
    pub config_type: String,
    /// Serialized job configuration.
    pub config: String,
    /// Uppercase status.
    pub status: String,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Last mutation time (UTC).
    pub updated_at: DateTime<Utc>,
}

/// Attempt row as stored.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AttemptRecord {
    /// Owning job.
    pub job_id: i64,
    /// Dense attempt number from 0.
    pub attempt_number: i32,
    /// Uppercase status.
    pub status: String,
    /// Workspace directory of the attempt.
    pub log_path: String,
    /// Serialized output payload.
    pub output: Option<String>,
    /// Creation time (UTC).
    pub created_at: DateTime<Utc>,
    /// Last mutation time (UTC).
    pub updated_at: DateTime<Utc>,
    /// Terminal time (UTC).
    pub ended_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// Interpret the stored row, attaching its attempts.
    pub fn into_job(self, attempts: Vec<AttemptRecord>) -> Result<Job> {
        let job_id = self.id;
        let corrupt = |details: String| SchedulerError::CorruptRecord { job_id, details };

        let scope = Uuid::parse_str(&self.scope)
            .map_err(|e| corrupt(format!("scope: {}", e)))?;
        let status = JobStatus::from_str(&self.status).map_err(corrupt)?;
        let config: JobConfig =
            serde_json::from_str(&self.config).map_err(|e| corrupt(format!("config: {}", e)))?;

        let attempts = attempts
            .into_iter()
            .map(|record| record.into_attempt())
            .collect::<Result<Vec<Attempt>>>()?;

        Ok(Job {
            id: self.id,
            scope,
            config,
            status,
            created_at: self.created_at,
            updated_at: self.updated_at,
            attempts,
        })
    }
}

impl AttemptRecord {
    /// Interpret the stored row.
    pub fn into_attempt(self) -> Result<Attempt> {
        let job_id = self.job_id;
        let corrupt = |details: String| SchedulerError::CorruptRecord { job_id, details };

        let status = self.status.parse().map_err(corrupt)?;
        let output = match self.output {
            Some(raw) => Some(
                serde_json::from_str::<AttemptOutput>(&raw)
                    .map_err(|e| corrupt(format!("output: {}", e)))?,
            ),
            None => None,
        };

        Ok(Attempt {
            job_id: self.job_id,
            number: self.attempt_number,
            status,
            log_path: self.log_path.into(),
            output,
            created_at: self.created_at,
            updated_at: self.updated_at,
            ended_at: self.ended_at,
        })
    }
}

/// Transactional store of jobs, attempts, and platform metadata.
#[async_trait]
pub trait JobPersistence: Send + Sync {
    /// Create a PENDING job for the scope.
    ///
    /// Returns `None` when a non-terminal job of the same config type already
    /// exists for the scope (the uniqueness guard behind the "at most one
    /// non-terminal SYNC per connection" invariant).
    async fn enqueue_job(&self, scope: Uuid, config: &JobConfig) -> Result<Option<i64>>;

    /// Create the next attempt for a PENDING or INCOMPLETE job and move the
    /// job to RUNNING. Returns the dense attempt number.
    async fn create_attempt(&self, job_id: i64, log_path: &Path) -> Result<i32>;

    /// Mark an attempt FAILED; the job becomes INCOMPLETE unless already
    /// terminal. Terminal handling is the retrier's call, made separately.
    async fn fail_attempt(&self, job_id: i64, attempt_number: i32) -> Result<()>;

    /// Mark an attempt SUCCEEDED with its output; the job becomes SUCCEEDED
    /// unless already terminal.
    async fn succeed_attempt(
        &self,
        job_id: i64,
        attempt_number: i32,
        output: Option<&AttemptOutput>,
    ) -> Result<()>;

    /// Move an INCOMPLETE job back to PENDING (retry path).
    async fn requeue_job(&self, job_id: i64) -> Result<()>;

    /// Cancel a job; any RUNNING attempt is marked FAILED. No-op once the
    /// job is terminal.
    async fn cancel_job(&self, job_id: i64) -> Result<()>;

    /// Terminally fail a job (retry budget exhausted).
    async fn fail_job(&self, job_id: i64) -> Result<()>;

    /// Load one job with its attempts.
    async fn get_job(&self, job_id: i64) -> Result<Job>;

    /// All jobs in the given status, oldest first.
    async fn list_jobs_with_status(&self, status: JobStatus) -> Result<Vec<Job>>;

    /// Page of jobs for the API surface, newest first.
    async fn list_jobs(
        &self,
        config_type: JobConfigType,
        scope: Uuid,
        page_size: i64,
        offset: i64,
    ) -> Result<Vec<Job>>;

    /// The oldest PENDING job whose scope has no RUNNING job.
    async fn get_next_job(&self) -> Result<Option<Job>>;

    /// The most recent terminal replication (sync or reset) job for a scope.
    async fn get_last_replication_job(&self, scope: Uuid) -> Result<Option<Job>>;

    /// Persisted platform version, if the config server has stamped one.
    async fn get_version(&self) -> Result<Option<String>>;

    /// Stamp the platform version.
    async fn set_version(&self, version: &str) -> Result<()>;
}

/// Statuses that block a new enqueue for the same (scope, config type).
pub(crate) const NON_TERMINAL: [JobStatus; 3] =
    [JobStatus::Pending, JobStatus::Running, JobStatus::Incomplete];
