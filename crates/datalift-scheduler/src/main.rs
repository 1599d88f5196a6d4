// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datalift scheduler - job orchestration service.
//!
//! Finds scheduled jobs that need to run and launches them: a dispatch loop
//! drives the retrier, scheduler, and submitter; attempts execute as worker
//! containers through the workflow runtime; a cleaner reclaims workspaces.

use std::sync::Arc;

use tracing::{info, warn};

use datalift_scheduler::app::{self, SchedulerApp};
use datalift_scheduler::cleaner::JobCleaner;
use datalift_scheduler::config::{Config, WorkerEnvironment};
use datalift_scheduler::config_repository::ConfigRepository;
use datalift_scheduler::notifier::JobNotifier;
use datalift_scheduler::persistence::{JobPersistence, PostgresJobPersistence};
use datalift_scheduler::retrier::{JobRetrier, RetryPolicy};
use datalift_scheduler::scheduler::JobScheduler;
use datalift_scheduler::submitter::{JobSubmitter, MAX_WORKERS};
use datalift_scheduler::tracker::tracking_client;
use datalift_scheduler::version;
use datalift_workers::heartbeat::{HeartbeatServer, KUBE_HEARTBEAT_PORT};
use datalift_workers::pool::WorkerPool;
use datalift_workers::process::ProcessFactory;
use datalift_workers::runs::AttemptRunner;
use datalift_workers::workflow::TcpWorkflowClient;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "datalift_scheduler=info,datalift_workers=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    let config = Config::from_env()?;
    info!(
        workspace_root = %config.workspace_root.display(),
        config_root = %config.config_root.display(),
        temporal_host = %config.temporal_host,
        worker_environment = ?config.worker_environment,
        version = %config.airbyte_version,
        "Starting datalift scheduler"
    );

    // Open the job database with retry and make sure the schema exists.
    let pool = app::connect_with_retry(&config).await?;
    let persistence = Arc::new(PostgresJobPersistence::new(pool));
    persistence.migrate().await?;

    let process_factory = app::build_process_factory(&config);
    info!(factory_type = process_factory.factory_type(), "Process factory initialized");

    // The config server stamps the platform version once migrations ran;
    // refuse to run against an incompatible database.
    let db_version = app::await_version(persistence.as_ref()).await?;
    version::assert_compatible(&config.airbyte_version, &db_version)?;
    info!(version = %db_version, "Database version compatible");

    // Worker pods probe this endpoint and self-terminate if it goes silent.
    if config.worker_environment == WorkerEnvironment::Kubernetes {
        let heartbeat = HeartbeatServer::new(KUBE_HEARTBEAT_PORT);
        tokio::spawn(async move {
            if let Err(e) = heartbeat.serve().await {
                warn!(error = %e, "Heartbeat server exited");
            }
        });
    }

    let config_repository = ConfigRepository::new(config.config_root.clone());
    let notifier = Arc::new(JobNotifier::new(config.webapp_url.clone()));
    let tracker = tracking_client(config.tracking_strategy, &config.airbyte_role);
    let workflow_client = Arc::new(TcpWorkflowClient::new(config.temporal_host.clone()));
    let worker_pool = Arc::new(WorkerPool::new(
        config.temporal_host.clone(),
        Arc::new(AttemptRunner::new(process_factory)),
    ));

    let app = SchedulerApp::new(
        persistence.clone() as Arc<dyn JobPersistence>,
        JobRetrier::new(persistence.clone(), notifier.clone(), RetryPolicy::default()),
        JobScheduler::new(persistence.clone(), config_repository),
        JobSubmitter::new(
            persistence.clone(),
            workflow_client,
            tracker,
            config.workspace_root.clone(),
            MAX_WORKERS,
        ),
        JobCleaner::new(
            config.workspace_retention,
            config.workspace_root.clone(),
            persistence,
        ),
        notifier,
        worker_pool,
    );

    // Stop accepting work on SIGINT/SIGTERM; the app drains in-flight
    // attempts for up to the graceful shutdown window.
    let shutdown = app.shutdown_handle();
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown.send(true);
    });

    info!("Launching scheduler...");
    app.run().await?;
    info!("Datalift scheduler shut down");

    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut terminate =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = terminate.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
