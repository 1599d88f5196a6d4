// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the scheduler.
//!
//! The taxonomy matters operationally: [`SchedulerError::Database`] is a
//! transient fault retried on the next tick, while the transition/attempt
//! variants are logic errors that abort the current tick without touching
//! unrelated jobs.

use thiserror::Error;

use crate::models::JobStatus;

/// Scheduler errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum SchedulerError {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed (transient, retried next tick).
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Workflow-runtime call failed.
    #[error("Workflow error: {0}")]
    Workflow(#[from] datalift_workers::workflow::WorkflowError),

    /// Worker process launch failed.
    #[error("Process error: {0}")]
    Process(#[from] datalift_workers::process::ProcessError),

    /// Job was not found in the database.
    #[error("Job {job_id} not found")]
    JobNotFound {
        /// The job that was not found.
        job_id: i64,
    },

    /// A configuration document was not found in the config store.
    #[error("Config {kind}/{id} not found")]
    ConfigNotFound {
        /// Config kind directory.
        kind: &'static str,
        /// Document id.
        id: String,
    },

    /// Invariant-violating job status transition (logic error, aborts the tick).
    #[error("Job {job_id} cannot transition from {from} to {to}")]
    IllegalTransition {
        /// The job in question.
        job_id: i64,
        /// Current status.
        from: JobStatus,
        /// Requested status.
        to: JobStatus,
    },

    /// Attempt number already exists for the job (logic error).
    #[error("Job {job_id} already has attempt {number}")]
    AttemptExists {
        /// The job in question.
        job_id: i64,
        /// The duplicate attempt number.
        number: i32,
    },

    /// Stored record could not be interpreted (unknown status or config).
    #[error("Corrupt record for job {job_id}: {details}")]
    CorruptRecord {
        /// The job whose row failed to parse.
        job_id: i64,
        /// What was wrong.
        details: String,
    },

    /// Application and database versions are incompatible (startup fatal).
    #[error("Version mismatch: application {app} is incompatible with database {db}")]
    VersionMismatch {
        /// Application version.
        app: String,
        /// Persisted database version.
        db: String,
    },

    /// The database never reported a version (startup fatal).
    #[error("Database version unavailable; has the config server run migrations?")]
    VersionUnavailable,
}

/// Result type using SchedulerError.
pub type Result<T> = std::result::Result<T, SchedulerError>;
