// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job retrier.
//!
//! Walks all INCOMPLETE jobs each tick. A job whose failed-attempt count has
//! reached the retry budget is terminally failed (with one notification);
//! otherwise it is moved back to PENDING once its backoff window has elapsed.
//! The PENDING -> RUNNING step is always the submitter's.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, error, info};

use crate::error::Result;
use crate::models::{Job, JobStatus};
use crate::notifier::Notifier;
use crate::persistence::JobPersistence;

/// Retry budget and backoff policy.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Attempts allowed before the job is terminally failed.
    pub max_attempts: usize,
    /// Backoff after the first failure.
    pub base_delay: Duration,
    /// Backoff ceiling.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(600),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry `n + 1`, where `n` failed attempts exist:
    /// `min(base * 2^(n-1), max)`.
    pub fn backoff(&self, failed_attempts: usize) -> Duration {
        if failed_attempts == 0 {
            return Duration::ZERO;
        }
        // Capped well before the shift could overflow; max_delay clamps anyway.
        let doublings = (failed_attempts - 1).min(20) as u32;
        let delay = self.base_delay.saturating_mul(1u32 << doublings);
        delay.min(self.max_delay)
    }
}

/// Advances FAILED attempts to retry or terminal failure.
pub struct JobRetrier {
    persistence: Arc<dyn JobPersistence>,
    notifier: Arc<dyn Notifier>,
    policy: RetryPolicy,
}

impl JobRetrier {
    /// Create a new retrier.
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        notifier: Arc<dyn Notifier>,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            persistence,
            notifier,
            policy,
        }
    }

    /// Run one retrier tick over every INCOMPLETE job.
    pub async fn run(&self) -> Result<()> {
        let jobs = self
            .persistence
            .list_jobs_with_status(JobStatus::Incomplete)
            .await?;
        for job in jobs {
            if let Err(e) = self.advance(&job).await {
                error!(job_id = job.id, error = %e, "Failed to advance incomplete job");
            }
        }
        Ok(())
    }

    async fn advance(&self, job: &Job) -> Result<()> {
        let failed_attempts = job.failed_attempt_count();

        if failed_attempts >= self.policy.max_attempts {
            info!(
                job_id = job.id,
                failed_attempts = failed_attempts,
                "Retry budget exhausted, failing job"
            );
            self.persistence.fail_job(job.id).await?;
            self.notifier
                .fail_job("job failed after exhausting the retry budget", job);
            return Ok(());
        }

        let last_ended = job
            .last_attempt()
            .and_then(|a| a.ended_at)
            .unwrap_or(job.updated_at);
        let since_failure = (Utc::now() - last_ended).to_std().unwrap_or_default();
        let backoff = self.policy.backoff(failed_attempts);

        if since_failure >= backoff {
            debug!(
                job_id = job.id,
                failed_attempts = failed_attempts,
                "Backoff elapsed, requeueing job"
            );
            self.persistence.requeue_job(job.id).await?;
        } else {
            debug!(
                job_id = job.id,
                remaining_secs = (backoff - since_failure).as_secs(),
                "Job still backing off"
            );
        }
        Ok(())
    }
}
