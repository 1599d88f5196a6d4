// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler application driver.
//!
//! Owns startup sequencing (database retry, version gate, zombie reaping)
//! and the two periodic loops: dispatch (retrier -> scheduler -> submitter)
//! every five seconds and the workspace cleaner every two hours. Both loops
//! are fixed-delay, so a slow tick never stacks ticks. Component failures
//! within a tick are logged and the next tick proceeds.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use tokio::sync::watch;
use tracing::{error, info, warn};

use datalift_workers::heartbeat::{KUBE_HEARTBEAT_PORT, local_ip};
use datalift_workers::pool::WorkerPool;
use datalift_workers::process::docker::{DockerProcessFactory, DockerProcessFactoryConfig};
use datalift_workers::process::kube::{KubeProcessFactory, KubeProcessFactoryConfig};
use datalift_workers::process::port_pool::WorkerPortPool;
use datalift_workers::process::ProcessFactory;

use crate::cleaner::JobCleaner;
use crate::config::{Config, WorkerEnvironment};
use crate::error::{Result, SchedulerError};
use crate::models::JobStatus;
use crate::notifier::Notifier;
use crate::persistence::JobPersistence;
use crate::retrier::JobRetrier;
use crate::scheduler::JobScheduler;
use crate::submitter::JobSubmitter;

/// Fixed delay between dispatch ticks.
pub const SCHEDULING_DELAY: Duration = Duration::from_secs(5);
/// Fixed delay between cleaning sweeps.
pub const CLEANING_DELAY: Duration = Duration::from_secs(2 * 3600);
/// How long shutdown waits for in-flight attempts.
pub const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(30);

const DB_CONNECT_ATTEMPTS: u32 = 10;
const VERSION_WAIT_ATTEMPTS: u64 = 300;

/// The long-running scheduler service.
pub struct SchedulerApp {
    persistence: Arc<dyn JobPersistence>,
    retrier: JobRetrier,
    scheduler: JobScheduler,
    submitter: JobSubmitter,
    cleaner: JobCleaner,
    notifier: Arc<dyn Notifier>,
    worker_pool: Arc<WorkerPool>,
    shutdown: watch::Sender<bool>,
}

impl SchedulerApp {
    /// Assemble the application from its components.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        persistence: Arc<dyn JobPersistence>,
        retrier: JobRetrier,
        scheduler: JobScheduler,
        submitter: JobSubmitter,
        cleaner: JobCleaner,
        notifier: Arc<dyn Notifier>,
        worker_pool: Arc<WorkerPool>,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            persistence,
            retrier,
            scheduler,
            submitter,
            cleaner,
            notifier,
            worker_pool,
            shutdown,
        }
    }

    /// Handle used to request shutdown (e.g. from a signal handler).
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown.clone()
    }

    /// Cancel jobs left RUNNING by a previous scheduler.
    ///
    /// Their workers are no longer monitored by anyone, so the jobs are
    /// zombies: the attempt is failed and the job cancelled rather than
    /// failed, since the workflow never reported a terminal signal. Must
    /// finish before the dispatch loop starts.
    pub async fn cleanup_zombies(&self) -> Result<usize> {
        let zombies = self
            .persistence
            .list_jobs_with_status(JobStatus::Running)
            .await?;
        let count = zombies.len();
        for job in zombies {
            self.notifier.fail_job("zombie job was cancelled", &job);
            self.persistence.cancel_job(job.id).await?;
            info!(job_id = job.id, scope = %job.scope, "Cancelled zombie job");
        }
        Ok(count)
    }

    /// Run until shutdown is requested, then drain gracefully.
    pub async fn run(&self) -> Result<()> {
        // The worker pool serves runtime dispatches for the app's lifetime.
        let pool = self.worker_pool.clone();
        let pool_task = tokio::spawn(async move { pool.run().await });

        let reaped = self.cleanup_zombies().await?;
        if reaped > 0 {
            info!(count = reaped, "Zombie cleanup finished");
        }

        let dispatch = async {
            let mut rx = self.shutdown.subscribe();
            loop {
                if *rx.borrow() {
                    break;
                }
                self.dispatch_tick().await;
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(SCHEDULING_DELAY) => {}
                }
            }
        };

        let cleaning = async {
            let mut rx = self.shutdown.subscribe();
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tokio::time::sleep(CLEANING_DELAY) => {
                        if let Err(e) = self.cleaner.run().await {
                            error!(error = %e, "Cleaning sweep failed");
                        }
                    }
                }
            }
        };

        tokio::join!(dispatch, cleaning);
        info!("Dispatch stopped, draining in-flight attempts");

        self.worker_pool.shutdown_handle().notify_one();
        match tokio::time::timeout(GRACEFUL_SHUTDOWN, self.submitter.await_idle()).await {
            Ok(()) => info!("In-flight attempts drained"),
            Err(_) => warn!(
                grace_secs = GRACEFUL_SHUTDOWN.as_secs(),
                "Graceful shutdown window elapsed, abandoning in-flight attempts"
            ),
        }
        let _ = pool_task.await;
        Ok(())
    }

    /// One dispatch tick: retrier, then scheduler, then submitter.
    async fn dispatch_tick(&self) {
        if let Err(e) = self.retrier.run().await {
            error!(error = %e, "Retrier tick failed");
        }
        if let Err(e) = self.scheduler.run().await {
            error!(error = %e, "Scheduler tick failed");
        }
        if let Err(e) = self.submitter.run().await {
            error!(error = %e, "Submitter tick failed");
        }
    }
}

/// Open the job database, retrying with exponential backoff.
pub async fn connect_with_retry(config: &Config) -> Result<PgPool> {
    let mut options = PgConnectOptions::from_str(&config.database_url)?;
    if let Some(user) = &config.database_user {
        options = options.username(user);
    }
    if let Some(password) = &config.database_password {
        options = options.password(password);
    }

    let mut delay = Duration::from_secs(1);
    let mut last_error = None;
    for attempt in 1..=DB_CONNECT_ATTEMPTS {
        match PgPoolOptions::new()
            .max_connections(10)
            .connect_with(options.clone())
            .await
        {
            Ok(pool) => {
                info!("Connected to job database");
                return Ok(pool);
            }
            Err(e) => {
                warn!(
                    attempt = attempt,
                    max_attempts = DB_CONNECT_ATTEMPTS,
                    error = %e,
                    "Database not reachable yet"
                );
                last_error = Some(e);
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(Duration::from_secs(30));
            }
        }
    }
    Err(SchedulerError::Database(last_error.expect("at least one attempt")))
}

/// Wait until the config server has stamped a platform version.
pub async fn await_version(persistence: &dyn JobPersistence) -> Result<String> {
    await_version_with(persistence, VERSION_WAIT_ATTEMPTS, Duration::from_secs(1)).await
}

async fn await_version_with(
    persistence: &dyn JobPersistence,
    attempts: u64,
    delay: Duration,
) -> Result<String> {
    for attempt in 0..attempts {
        if let Some(version) = persistence.get_version().await? {
            return Ok(version);
        }
        if attempt % 10 == 0 {
            warn!("Waiting for the config server to run migrations...");
        }
        tokio::time::sleep(delay).await;
    }
    Err(SchedulerError::VersionUnavailable)
}

/// Construct the process factory for the configured worker environment.
pub fn build_process_factory(config: &Config) -> Arc<dyn ProcessFactory> {
    match config.worker_environment {
        WorkerEnvironment::Kubernetes => {
            let host = local_ip().to_string();
            let ports = Arc::new(WorkerPortPool::new(
                config.temporal_worker_ports.iter().copied(),
            ));
            Arc::new(KubeProcessFactory::new(
                KubeProcessFactoryConfig {
                    namespace: "default".to_string(),
                    scheduler_host: host.clone(),
                    heartbeat_url: format!("{}:{}", host, KUBE_HEARTBEAT_PORT),
                },
                ports,
            ))
        }
        WorkerEnvironment::Docker => Arc::new(DockerProcessFactory::new(
            DockerProcessFactoryConfig {
                workspace_root: config.workspace_root.clone(),
                workspace_mount: config.workspace_docker_mount.clone(),
                local_mount: config.local_docker_mount.clone(),
                network: config.docker_network.clone(),
            },
        )),
    }
}
