// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job failure notifications.
//!
//! Terminal failures and zombie cancellations surface as structured warnings
//! carrying a link to the job's page in the web UI. Notifications are
//! best-effort and never fail the caller.

use tracing::warn;

use crate::models::Job;

/// Sink for user-facing job failure notifications.
pub trait Notifier: Send + Sync {
    /// Notify that a job failed (or was reaped) with the given reason.
    fn fail_job(&self, reason: &str, job: &Job);
}

/// Notifier that writes to the structured log with a web UI link.
pub struct JobNotifier {
    webapp_url: String,
}

impl JobNotifier {
    /// Create a notifier linking back to the given web UI.
    pub fn new(webapp_url: impl Into<String>) -> Self {
        Self {
            webapp_url: webapp_url.into(),
        }
    }

    /// Link to the job's connection page in the web UI.
    pub fn job_page_url(&self, job: &Job) -> String {
        format!(
            "{}/connections/{}",
            self.webapp_url.trim_end_matches('/'),
            job.scope
        )
    }
}

impl Notifier for JobNotifier {
    fn fail_job(&self, reason: &str, job: &Job) {
        warn!(
            job_id = job.id,
            scope = %job.scope,
            config_type = %job.config_type(),
            reason = reason,
            url = %self.job_page_url(job),
            "Job failure notification"
        );
    }
}
