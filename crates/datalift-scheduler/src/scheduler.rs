// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Job scheduler.
//!
//! Each tick walks the active connections and enqueues a PENDING sync job for
//! every connection whose schedule interval has elapsed since its last
//! terminal replication job. The persistence uniqueness guard silently
//! suppresses duplicates, so a tick may run concurrently with older pending
//! work without double-scheduling.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::config_repository::ConfigRepository;
use crate::error::Result;
use crate::models::{Connection, ConnectionStatus, Job, JobConfig, JobSyncConfig};
use crate::persistence::JobPersistence;

/// Enqueues due sync jobs from connection definitions.
pub struct JobScheduler {
    persistence: Arc<dyn JobPersistence>,
    config_repository: ConfigRepository,
}

impl JobScheduler {
    /// Create a new scheduler.
    pub fn new(persistence: Arc<dyn JobPersistence>, config_repository: ConfigRepository) -> Self {
        Self {
            persistence,
            config_repository,
        }
    }

    /// Run one scheduling tick over every active connection.
    ///
    /// Per-connection failures are logged and do not stop the tick.
    pub async fn run(&self) -> Result<()> {
        let connections = self.config_repository.list_connections().await?;
        for connection in connections {
            if connection.status != ConnectionStatus::Active {
                continue;
            }
            if let Err(e) = self.schedule_connection(&connection).await {
                error!(
                    connection_id = %connection.connection_id,
                    error = %e,
                    "Failed to schedule connection"
                );
            }
        }
        Ok(())
    }

    async fn schedule_connection(&self, connection: &Connection) -> Result<()> {
        let Some(schedule) = connection.schedule else {
            debug!(connection_id = %connection.connection_id, "Manual schedule, skipping");
            return Ok(());
        };

        let last = self
            .persistence
            .get_last_replication_job(connection.connection_id)
            .await?;
        let t_last = last
            .as_ref()
            .and_then(Job::ended_at)
            .unwrap_or(DateTime::UNIX_EPOCH);

        let elapsed = (Utc::now() - t_last).to_std().unwrap_or_default();
        if elapsed < schedule.interval() {
            debug!(
                connection_id = %connection.connection_id,
                elapsed_secs = elapsed.as_secs(),
                interval_secs = schedule.interval().as_secs(),
                "Connection not yet due"
            );
            return Ok(());
        }

        let config = self.build_sync_config(connection).await?;
        match self
            .persistence
            .enqueue_job(connection.connection_id, &config)
            .await?
        {
            Some(job_id) => {
                info!(
                    connection_id = %connection.connection_id,
                    job_id = job_id,
                    "Enqueued sync job"
                );
            }
            None => {
                debug!(
                    connection_id = %connection.connection_id,
                    "Sync job already pending, enqueue suppressed"
                );
            }
        }
        Ok(())
    }

    /// Resolve the connection's source/destination configs and connector
    /// images into a sync job payload.
    async fn build_sync_config(&self, connection: &Connection) -> Result<JobConfig> {
        let source = self
            .config_repository
            .get_source_connection(connection.source_id)
            .await?;
        let destination = self
            .config_repository
            .get_destination_connection(connection.destination_id)
            .await?;
        let source_definition = self
            .config_repository
            .get_source_definition(source.source_definition_id)
            .await?;
        let destination_definition = self
            .config_repository
            .get_destination_definition(destination.destination_definition_id)
            .await?;

        Ok(JobConfig::Sync(JobSyncConfig {
            source_docker_image: source_definition.image(),
            destination_docker_image: destination_definition.image(),
            source_configuration: source.configuration,
            destination_configuration: destination.configuration,
            configured_catalog: connection.catalog.clone(),
            state: None,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobStatus, Schedule, ScheduleTimeUnit};
    use crate::persistence::SqliteJobPersistence;
    use serde_json::json;
    use tempfile::TempDir;
    use uuid::Uuid;

    struct Fixture {
        _tmp: TempDir,
        persistence: Arc<SqliteJobPersistence>,
        scheduler: JobScheduler,
        connection_id: Uuid,
    }

    async fn write_doc(root: &std::path::Path, kind: &str, id: Uuid, doc: serde_json::Value) {
        let dir = root.join(kind);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(format!("{}.json", id)), doc.to_string())
            .await
            .unwrap();
    }

    /// Seed a complete config store with one connection.
    async fn fixture(status: &str, schedule: Option<serde_json::Value>) -> Fixture {
        let tmp = TempDir::new().unwrap();
        let connection_id = Uuid::new_v4();
        let source_id = Uuid::new_v4();
        let destination_id = Uuid::new_v4();
        let source_definition_id = Uuid::new_v4();
        let destination_definition_id = Uuid::new_v4();

        let mut connection = json!({
            "connectionId": connection_id,
            "name": "pg to bq",
            "sourceId": source_id,
            "destinationId": destination_id,
            "status": status,
            "catalog": {"streams": []},
        });
        if let Some(schedule) = schedule {
            connection["schedule"] = schedule;
        }
        write_doc(tmp.path(), "STANDARD_SYNC", connection_id, connection).await;
        write_doc(
            tmp.path(),
            "SOURCE_CONNECTION",
            source_id,
            json!({
                "sourceId": source_id,
                "sourceDefinitionId": source_definition_id,
                "name": "pg",
                "configuration": {"host": "db"},
            }),
        )
        .await;
        write_doc(
            tmp.path(),
            "DESTINATION_CONNECTION",
            destination_id,
            json!({
                "destinationId": destination_id,
                "destinationDefinitionId": destination_definition_id,
                "name": "bq",
                "configuration": {"project": "p"},
            }),
        )
        .await;
        write_doc(
            tmp.path(),
            "STANDARD_SOURCE_DEFINITION",
            source_definition_id,
            json!({
                "sourceDefinitionId": source_definition_id,
                "name": "Postgres",
                "dockerRepository": "airbyte/source-postgres",
                "dockerImageTag": "0.1.0",
            }),
        )
        .await;
        write_doc(
            tmp.path(),
            "STANDARD_DESTINATION_DEFINITION",
            destination_definition_id,
            json!({
                "destinationDefinitionId": destination_definition_id,
                "name": "BigQuery",
                "dockerRepository": "airbyte/destination-bigquery",
                "dockerImageTag": "0.2.0",
            }),
        )
        .await;

        let persistence = Arc::new(SqliteJobPersistence::in_memory().await.unwrap());
        let scheduler = JobScheduler::new(
            persistence.clone(),
            ConfigRepository::new(tmp.path()),
        );
        Fixture {
            _tmp: tmp,
            persistence,
            scheduler,
            connection_id,
        }
    }

    fn hourly() -> serde_json::Value {
        json!({"units": 1, "timeUnit": "HOURS"})
    }

    #[tokio::test]
    async fn test_new_connection_enqueued_immediately() {
        let fx = fixture("ACTIVE", Some(hourly())).await;
        fx.scheduler.run().await.unwrap();

        let pending = fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scope, fx.connection_id);
        match &pending[0].config {
            JobConfig::Sync(sync) => {
                assert_eq!(sync.source_docker_image, "airbyte/source-postgres:0.1.0");
                assert_eq!(
                    sync.destination_docker_image,
                    "airbyte/destination-bigquery:0.2.0"
                );
            }
            other => panic!("expected sync config, got {:?}", other.config_type()),
        }
    }

    #[tokio::test]
    async fn test_manual_connection_skipped() {
        let fx = fixture("ACTIVE", None).await;
        fx.scheduler.run().await.unwrap();
        assert!(fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_inactive_connection_skipped() {
        let fx = fixture("INACTIVE", Some(hourly())).await;
        fx.scheduler.run().await.unwrap();
        assert!(fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_suppressed_while_pending() {
        let fx = fixture("ACTIVE", Some(hourly())).await;
        fx.scheduler.run().await.unwrap();
        fx.scheduler.run().await.unwrap();

        let pending = fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_not_due_after_recent_success() {
        let fx = fixture("ACTIVE", Some(hourly())).await;

        // Complete a sync just now; the next one is due in an hour.
        let job_id = fx
            .persistence
            .enqueue_job(
                fx.connection_id,
                &JobConfig::Sync(crate::models::JobSyncConfig {
                    source_docker_image: "x:y".to_string(),
                    destination_docker_image: "x:y".to_string(),
                    source_configuration: json!({}),
                    destination_configuration: json!({}),
                    configured_catalog: json!({}),
                    state: None,
                }),
            )
            .await
            .unwrap()
            .unwrap();
        let n = fx
            .persistence
            .create_attempt(job_id, std::path::Path::new("/workspace/1/0"))
            .await
            .unwrap();
        fx.persistence.succeed_attempt(job_id, n, None).await.unwrap();

        fx.scheduler.run().await.unwrap();
        assert!(fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_tick_survives_broken_connection_config() {
        let fx = fixture("ACTIVE", Some(hourly())).await;
        // A second connection referencing missing source/destination docs.
        let broken_id = Uuid::new_v4();
        write_doc(
            fx._tmp.path(),
            "STANDARD_SYNC",
            broken_id,
            json!({
                "connectionId": broken_id,
                "name": "broken",
                "sourceId": Uuid::new_v4(),
                "destinationId": Uuid::new_v4(),
                "status": "ACTIVE",
                "schedule": hourly(),
                "catalog": {"streams": []},
            }),
        )
        .await;

        // The healthy connection still gets its job.
        fx.scheduler.run().await.unwrap();
        let pending = fx
            .persistence
            .list_jobs_with_status(JobStatus::Pending)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].scope, fx.connection_id);
    }
}
