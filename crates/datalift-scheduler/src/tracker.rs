// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job lifecycle tracking events.
//!
//! Components emit events through an explicit [`TrackingClient`] handle
//! rather than process-global state, so tests can capture them.

use std::str::FromStr;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::models::JobConfigType;

/// Which tracking backend to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackingStrategy {
    /// Emit events into the structured log.
    Logging,
    /// External analytics backend (not wired in the scheduler; falls back to
    /// logging).
    Segment,
}

impl FromStr for TrackingStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "LOGGING" => Ok(TrackingStrategy::Logging),
            "SEGMENT" => Ok(TrackingStrategy::Segment),
            other => Err(format!("unknown tracking strategy: {}", other)),
        }
    }
}

/// One tracked job lifecycle event.
#[derive(Debug, Clone)]
pub struct JobEvent {
    /// Event name.
    pub event: JobEventKind,
    /// Job id.
    pub job_id: i64,
    /// Connection scope.
    pub scope: Uuid,
    /// Kind of work.
    pub config_type: JobConfigType,
    /// Attempt number, when the event concerns one attempt.
    pub attempt_number: Option<i32>,
    /// Wall-clock duration in milliseconds, for terminal events.
    pub duration_ms: Option<u64>,
    /// Records moved, for successful syncs.
    pub records_synced: Option<i64>,
    /// Failure description, for failure events.
    pub failure_reason: Option<String>,
}

/// Tracked event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobEventKind {
    /// An attempt was handed to the workflow runtime.
    Started,
    /// An attempt succeeded.
    Succeeded,
    /// An attempt or job failed.
    Failed,
}

impl JobEventKind {
    /// Event name as emitted.
    pub fn as_str(self) -> &'static str {
        match self {
            JobEventKind::Started => "job_started",
            JobEventKind::Succeeded => "job_succeeded",
            JobEventKind::Failed => "job_failed",
        }
    }
}

/// Sink for job lifecycle events.
pub trait TrackingClient: Send + Sync {
    /// Record one event.
    fn track(&self, event: JobEvent);
}

/// Tracking client that writes events to the structured log.
pub struct LoggingTracking {
    role: String,
}

impl LoggingTracking {
    /// Create a logging tracker tagged with the deployment role.
    pub fn new(role: impl Into<String>) -> Self {
        Self { role: role.into() }
    }
}

impl TrackingClient for LoggingTracking {
    fn track(&self, event: JobEvent) {
        info!(
            target: "tracking",
            event = event.event.as_str(),
            job_id = event.job_id,
            scope = %event.scope,
            config_type = %event.config_type,
            attempt = event.attempt_number,
            duration_ms = event.duration_ms,
            records_synced = event.records_synced,
            failure_reason = event.failure_reason.as_deref(),
            role = %self.role,
            "Job event"
        );
    }
}

/// Build the tracking client for the configured strategy.
pub fn tracking_client(strategy: TrackingStrategy, role: &str) -> Arc<dyn TrackingClient> {
    if strategy == TrackingStrategy::Segment {
        warn!("SEGMENT tracking is handled by the platform, falling back to logging");
    }
    Arc::new(LoggingTracking::new(role))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Tracker that records events for assertions.
    #[derive(Default)]
    pub struct RecordingTracking {
        events: Mutex<Vec<JobEvent>>,
    }

    impl RecordingTracking {
        pub fn events(&self) -> Vec<JobEvent> {
            self.events.lock().unwrap().clone()
        }
    }

    impl TrackingClient for RecordingTracking {
        fn track(&self, event: JobEvent) {
            self.events.lock().unwrap().push(event);
        }
    }
}
