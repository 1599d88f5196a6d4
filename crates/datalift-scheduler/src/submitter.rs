// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job submitter.
//!
//! Dequeues PENDING jobs, creates their next attempt, and hands execution to
//! the workflow runtime on a bounded worker pool. A saturated pool ends the
//! tick; remaining jobs wait for the next one, so a slow workflow never
//! stalls scheduling.
//!
//! At-most-one RUNNING attempt per job is upheld by three layers:
//! `get_next_job` skips scopes with a RUNNING job, `create_attempt` rejects
//! jobs that are not PENDING/INCOMPLETE, and the workflow identity makes
//! duplicate submissions idempotent at the runtime.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use datalift_workers::workflow::{WorkflowClient, WorkflowInput};

use crate::error::Result;
use crate::models::{AttemptOutput, Job, workflow_identity};
use crate::persistence::JobPersistence;
use crate::tracker::{JobEvent, JobEventKind, TrackingClient};

/// Default size of the worker pool.
pub const MAX_WORKERS: usize = 4;

/// Hands pending jobs to the workflow runtime.
pub struct JobSubmitter {
    persistence: Arc<dyn JobPersistence>,
    workflow: Arc<dyn WorkflowClient>,
    tracker: Arc<dyn TrackingClient>,
    workspace_root: PathBuf,
    max_workers: usize,
    pool: Arc<Semaphore>,
}

impl JobSubmitter {
    /// Create a new submitter with a worker pool of `max_workers` slots.
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        workflow: Arc<dyn WorkflowClient>,
        tracker: Arc<dyn TrackingClient>,
        workspace_root: PathBuf,
        max_workers: usize,
    ) -> Self {
        Self {
            persistence,
            workflow,
            tracker,
            workspace_root,
            max_workers,
            pool: Arc::new(Semaphore::new(max_workers)),
        }
    }

    /// Run one submission tick: dequeue eligible jobs until none remain or
    /// the worker pool is saturated.
    pub async fn run(&self) -> Result<()> {
        loop {
            let Ok(permit) = self.pool.clone().try_acquire_owned() else {
                debug!("Worker pool saturated, ending submission tick");
                break;
            };

            let Some(job) = self.persistence.get_next_job().await? else {
                break;
            };

            let attempt_number = job.attempts.len() as i32;
            let workspace = self
                .workspace_root
                .join(job.id.to_string())
                .join(attempt_number.to_string());
            prepare_workspace(&workspace).await?;

            let created = self.persistence.create_attempt(job.id, &workspace).await?;
            if created != attempt_number {
                warn!(
                    job_id = job.id,
                    expected = attempt_number,
                    created = created,
                    "Attempt number advanced concurrently"
                );
            }

            info!(
                job_id = job.id,
                attempt = created,
                config_type = %job.config_type(),
                "Submitting job to workflow runtime"
            );

            let persistence = self.persistence.clone();
            let workflow = self.workflow.clone();
            let tracker = self.tracker.clone();
            tokio::spawn(async move {
                execute_attempt(persistence, workflow, tracker, job, created, workspace).await;
                drop(permit);
            });
        }
        Ok(())
    }

    /// Wait until every in-flight attempt task has finished.
    pub async fn await_idle(&self) {
        let _all = self
            .pool
            .acquire_many(self.max_workers as u32)
            .await
            .expect("worker pool closed");
    }
}

/// Make sure the attempt's workspace directory exists and is empty.
async fn prepare_workspace(workspace: &std::path::Path) -> Result<()> {
    match tokio::fs::remove_dir_all(workspace).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    tokio::fs::create_dir_all(workspace).await?;
    Ok(())
}

/// Execute one attempt on a worker slot and record its result.
///
/// The attempt row is always updated before anything surfaces upward, so a
/// crash mid-flight is recoverable by the zombie reaper.
async fn execute_attempt(
    persistence: Arc<dyn JobPersistence>,
    workflow: Arc<dyn WorkflowClient>,
    tracker: Arc<dyn TrackingClient>,
    job: Job,
    attempt_number: i32,
    workspace: PathBuf,
) {
    let identity = workflow_identity(job.scope, job.id, attempt_number);
    let started = Instant::now();
    tracker.track(JobEvent {
        event: JobEventKind::Started,
        job_id: job.id,
        scope: job.scope,
        config_type: job.config_type(),
        attempt_number: Some(attempt_number),
        duration_ms: None,
        records_synced: None,
        failure_reason: None,
    });

    let config = match serde_json::to_value(&job.config) {
        Ok(config) => config,
        Err(e) => {
            error!(job_id = job.id, error = %e, "Unserializable job config");
            record_failure(
                &persistence,
                &tracker,
                &job,
                attempt_number,
                started,
                format!("unserializable job config: {}", e),
            )
            .await;
            return;
        }
    };

    let input = WorkflowInput {
        job_id: job.id,
        attempt_number,
        workspace,
        config,
    };

    match workflow.submit(&identity, input).await {
        Ok(outcome) if outcome.success => {
            let output = outcome.output.and_then(|raw| {
                match serde_json::from_value::<AttemptOutput>(raw) {
                    Ok(output) => Some(output),
                    Err(e) => {
                        warn!(job_id = job.id, error = %e, "Discarding unreadable attempt output");
                        None
                    }
                }
            });

            if let Err(e) = persistence
                .succeed_attempt(job.id, attempt_number, output.as_ref())
                .await
            {
                error!(job_id = job.id, error = %e, "Failed to record successful attempt");
                return;
            }

            let records_synced = match &output {
                Some(AttemptOutput::Sync(summary)) => Some(summary.records_synced),
                _ => None,
            };
            tracker.track(JobEvent {
                event: JobEventKind::Succeeded,
                job_id: job.id,
                scope: job.scope,
                config_type: job.config_type(),
                attempt_number: Some(attempt_number),
                duration_ms: Some(started.elapsed().as_millis() as u64),
                records_synced,
                failure_reason: None,
            });
            info!(job_id = job.id, attempt = attempt_number, "Attempt succeeded");
        }
        Ok(outcome) => {
            let reason = outcome
                .failure
                .unwrap_or_else(|| "workflow reported failure".to_string());
            record_failure(&persistence, &tracker, &job, attempt_number, started, reason).await;
        }
        Err(e) => {
            record_failure(
                &persistence,
                &tracker,
                &job,
                attempt_number,
                started,
                e.to_string(),
            )
            .await;
        }
    }
}

async fn record_failure(
    persistence: &Arc<dyn JobPersistence>,
    tracker: &Arc<dyn TrackingClient>,
    job: &Job,
    attempt_number: i32,
    started: Instant,
    reason: String,
) {
    warn!(
        job_id = job.id,
        attempt = attempt_number,
        reason = %reason,
        "Attempt failed"
    );
    if let Err(e) = persistence.fail_attempt(job.id, attempt_number).await {
        error!(job_id = job.id, error = %e, "Failed to record failed attempt");
    }
    tracker.track(JobEvent {
        event: JobEventKind::Failed,
        job_id: job.id,
        scope: job.scope,
        config_type: job.config_type(),
        attempt_number: Some(attempt_number),
        duration_ms: Some(started.elapsed().as_millis() as u64),
        records_synced: None,
        failure_reason: Some(reason),
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AttemptStatus, JobConfig, JobStatus, JobSyncConfig};
    use crate::persistence::SqliteJobPersistence;
    use crate::tracker::test_support::RecordingTracking;
    use async_trait::async_trait;
    use datalift_workers::workflow::{FakeWorkflowClient, WorkflowError, WorkflowOutcome};
    use serde_json::json;
    use tempfile::TempDir;
    use tokio::sync::Notify;
    use uuid::Uuid;

    fn sync_config() -> JobConfig {
        JobConfig::Sync(JobSyncConfig {
            source_docker_image: "x:y".to_string(),
            destination_docker_image: "x:y".to_string(),
            source_configuration: json!({}),
            destination_configuration: json!({}),
            configured_catalog: json!({}),
            state: None,
        })
    }

    struct Fixture {
        _tmp: TempDir,
        persistence: Arc<SqliteJobPersistence>,
        workflow: Arc<FakeWorkflowClient>,
        tracker: Arc<RecordingTracking>,
        submitter: JobSubmitter,
    }

    async fn fixture(max_workers: usize) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let persistence = Arc::new(SqliteJobPersistence::in_memory().await.unwrap());
        let workflow = Arc::new(FakeWorkflowClient::new());
        let tracker = Arc::new(RecordingTracking::default());
        let submitter = JobSubmitter::new(
            persistence.clone(),
            workflow.clone(),
            tracker.clone(),
            tmp.path().to_path_buf(),
            max_workers,
        );
        Fixture {
            _tmp: tmp,
            persistence,
            workflow,
            tracker,
            submitter,
        }
    }

    #[tokio::test]
    async fn test_successful_submission() {
        let fx = fixture(MAX_WORKERS).await;
        let job_id = fx
            .persistence
            .enqueue_job(Uuid::new_v4(), &sync_config())
            .await
            .unwrap()
            .unwrap();

        fx.submitter.run().await.unwrap();
        fx.submitter.await_idle().await;

        let job = fx.persistence.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts.len(), 1);
        assert_eq!(job.attempts[0].status, AttemptStatus::Succeeded);

        // Workspace was created at <root>/<job>/<attempt>.
        assert!(fx
            ._tmp
            .path()
            .join(job_id.to_string())
            .join("0")
            .is_dir());

        let events: Vec<_> = fx.tracker.events().iter().map(|e| e.event).collect();
        assert_eq!(events, vec![JobEventKind::Started, JobEventKind::Succeeded]);
    }

    #[tokio::test]
    async fn test_failed_workflow_records_failed_attempt() {
        let fx = fixture(MAX_WORKERS).await;
        let job_id = fx
            .persistence
            .enqueue_job(Uuid::new_v4(), &sync_config())
            .await
            .unwrap()
            .unwrap();
        fx.workflow
            .push_outcome(WorkflowOutcome::failed("connector crashed"))
            .await;

        fx.submitter.run().await.unwrap();
        fx.submitter.await_idle().await;

        let job = fx.persistence.get_job(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Incomplete);
        assert_eq!(job.attempts[0].status, AttemptStatus::Failed);

        let failed: Vec<_> = fx
            .tracker
            .events()
            .into_iter()
            .filter(|e| e.event == JobEventKind::Failed)
            .collect();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].failure_reason.as_deref(), Some("connector crashed"));
    }

    #[tokio::test]
    async fn test_workflow_identity_passed_to_runtime() {
        let fx = fixture(MAX_WORKERS).await;
        let scope = Uuid::new_v4();
        let job_id = fx
            .persistence
            .enqueue_job(scope, &sync_config())
            .await
            .unwrap()
            .unwrap();

        fx.submitter.run().await.unwrap();
        fx.submitter.await_idle().await;

        assert_eq!(
            fx.workflow.executions().await,
            vec![format!("connection-{}-{}-0", scope, job_id)]
        );
    }

    /// Workflow client that parks until released, for saturation tests.
    struct BlockingWorkflow {
        release: Notify,
    }

    #[async_trait]
    impl WorkflowClient for BlockingWorkflow {
        async fn submit(
            &self,
            _identity: &str,
            _input: WorkflowInput,
        ) -> std::result::Result<WorkflowOutcome, WorkflowError> {
            self.release.notified().await;
            Ok(WorkflowOutcome::succeeded(None))
        }

        async fn cancel(&self, _identity: &str) -> std::result::Result<(), WorkflowError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_saturated_pool_ends_tick() {
        let tmp = TempDir::new().unwrap();
        let persistence = Arc::new(SqliteJobPersistence::in_memory().await.unwrap());
        let workflow = Arc::new(BlockingWorkflow {
            release: Notify::new(),
        });
        let tracker = Arc::new(RecordingTracking::default());
        let submitter = JobSubmitter::new(
            persistence.clone(),
            workflow.clone(),
            tracker,
            tmp.path().to_path_buf(),
            1,
        );

        let first = persistence
            .enqueue_job(Uuid::new_v4(), &sync_config())
            .await
            .unwrap()
            .unwrap();
        let second = persistence
            .enqueue_job(Uuid::new_v4(), &sync_config())
            .await
            .unwrap()
            .unwrap();

        // One worker slot: the first job occupies it, the second waits for a
        // future tick.
        submitter.run().await.unwrap();
        assert_eq!(
            persistence.get_job(first).await.unwrap().status,
            JobStatus::Running
        );
        assert_eq!(
            persistence.get_job(second).await.unwrap().status,
            JobStatus::Pending
        );

        // notify_one stores a permit, so the worker task is released even if
        // it has not reached its await yet.
        workflow.release.notify_one();
        submitter.await_idle().await;
        assert_eq!(
            persistence.get_job(first).await.unwrap().status,
            JobStatus::Succeeded
        );

        // Next tick picks up the job that waited.
        submitter.run().await.unwrap();
        workflow.release.notify_one();
        submitter.await_idle().await;
        assert_eq!(
            persistence.get_job(second).await.unwrap().status,
            JobStatus::Succeeded
        );
    }
}
