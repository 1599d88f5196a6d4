// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scheduler configuration from environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::tracker::TrackingStrategy;

/// Where worker processes run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerEnvironment {
    /// Local Docker containers.
    Docker,
    /// Ephemeral pods in a Kubernetes cluster.
    Kubernetes,
}

impl FromStr for WorkerEnvironment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "DOCKER" => Ok(WorkerEnvironment::Docker),
            "KUBERNETES" => Ok(WorkerEnvironment::Kubernetes),
            _ => Err(ConfigError::InvalidValue {
                var: "WORKER_ENVIRONMENT",
                details: format!("expected DOCKER or KUBERNETES, got {}", s),
            }),
        }
    }
}

/// Workspace retention policy for the job cleaner.
#[derive(Debug, Clone, Copy)]
pub struct WorkspaceRetention {
    /// Workspaces younger than this are never deleted for size reasons.
    pub min_age: Duration,
    /// Workspaces older than this are always deleted.
    pub max_age: Duration,
    /// Total workspace bytes kept before size-based deletion kicks in.
    pub max_size_bytes: u64,
}

impl Default for WorkspaceRetention {
    fn default() -> Self {
        Self {
            min_age: Duration::from_secs(86_400),      // 1 day
            max_age: Duration::from_secs(60 * 86_400), // 60 days
            max_size_bytes: 5_000_000_000,             // 5 GB
        }
    }
}

/// Scheduler configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root of per-attempt workspace directories.
    pub workspace_root: PathBuf,
    /// Root of the host-local data directory mounted into workers.
    pub local_root: PathBuf,
    /// Root of the file-based config store.
    pub config_root: PathBuf,
    /// Database connection URL.
    pub database_url: String,
    /// Database user override.
    pub database_user: Option<String>,
    /// Database password override.
    pub database_password: Option<String>,
    /// Where worker processes run.
    pub worker_environment: WorkerEnvironment,
    /// Workflow runtime address (`host[:port]`).
    pub temporal_host: String,
    /// Application version, checked against the persisted database version.
    pub airbyte_version: String,
    /// Deployment role tag, forwarded to tracking.
    pub airbyte_role: String,
    /// Tracking backend selection.
    pub tracking_strategy: TrackingStrategy,
    /// Ports leased to Kubernetes worker pods.
    pub temporal_worker_ports: Vec<u16>,
    /// Volume or host path mounted at `/data` in Docker workers.
    pub workspace_docker_mount: String,
    /// Volume or host path mounted at `/local` in Docker workers.
    pub local_docker_mount: String,
    /// Docker network workers are attached to.
    pub docker_network: String,
    /// Base URL of the web UI, used in notifications.
    pub webapp_url: String,
    /// Workspace retention policy.
    pub workspace_retention: WorkspaceRetention,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let workspace_root = PathBuf::from(require("WORKSPACE_ROOT")?);
        let local_root = PathBuf::from(
            std::env::var("LOCAL_ROOT").unwrap_or_else(|_| "/tmp/datalift_local".to_string()),
        );
        let config_root = PathBuf::from(require("CONFIG_ROOT")?);
        let database_url = require("DATABASE_URL")?;
        let airbyte_version = require("AIRBYTE_VERSION")?;

        let worker_environment = std::env::var("WORKER_ENVIRONMENT")
            .unwrap_or_else(|_| "DOCKER".to_string())
            .parse()?;

        let tracking_strategy = std::env::var("TRACKING_STRATEGY")
            .unwrap_or_else(|_| "LOGGING".to_string())
            .parse()
            .unwrap_or(TrackingStrategy::Logging);

        let temporal_worker_ports = parse_ports(
            &std::env::var("TEMPORAL_WORKER_PORTS").unwrap_or_default(),
        )?;

        let workspace_docker_mount = std::env::var("WORKSPACE_DOCKER_MOUNT")
            .unwrap_or_else(|_| workspace_root.display().to_string());
        let local_docker_mount = std::env::var("LOCAL_DOCKER_MOUNT")
            .unwrap_or_else(|_| local_root.display().to_string());

        Ok(Self {
            workspace_root,
            local_root,
            config_root,
            database_url,
            database_user: std::env::var("DATABASE_USER").ok(),
            database_password: std::env::var("DATABASE_PASSWORD").ok(),
            worker_environment,
            temporal_host: std::env::var("TEMPORAL_HOST")
                .unwrap_or_else(|_| "localhost:7233".to_string()),
            airbyte_version,
            airbyte_role: std::env::var("AIRBYTE_ROLE").unwrap_or_default(),
            tracking_strategy,
            temporal_worker_ports,
            workspace_docker_mount,
            local_docker_mount,
            docker_network: std::env::var("DOCKER_NETWORK")
                .unwrap_or_else(|_| "host".to_string()),
            webapp_url: std::env::var("WEBAPP_URL")
                .unwrap_or_else(|_| "http://localhost:8000".to_string()),
            workspace_retention: retention_from_env()?,
        })
    }
}

fn require(var: &'static str) -> Result<String, ConfigError> {
    std::env::var(var).map_err(|_| ConfigError::MissingEnvVar(var))
}

fn parse_ports(raw: &str) -> Result<Vec<u16>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse().map_err(|_| ConfigError::InvalidValue {
                var: "TEMPORAL_WORKER_PORTS",
                details: format!("invalid port: {}", s),
            })
        })
        .collect()
}

fn retention_from_env() -> Result<WorkspaceRetention, ConfigError> {
    let defaults = WorkspaceRetention::default();
    let min_days = parse_optional_u64("MINIMUM_WORKSPACE_RETENTION_DAYS")?;
    let max_days = parse_optional_u64("MAXIMUM_WORKSPACE_RETENTION_DAYS")?;
    let max_size = parse_optional_u64("MAXIMUM_WORKSPACE_SIZE_BYTES")?;
    Ok(WorkspaceRetention {
        min_age: min_days
            .map(|d| Duration::from_secs(d * 86_400))
            .unwrap_or(defaults.min_age),
        max_age: max_days
            .map(|d| Duration::from_secs(d * 86_400))
            .unwrap_or(defaults.max_age),
        max_size_bytes: max_size.unwrap_or(defaults.max_size_bytes),
    })
}

fn parse_optional_u64(var: &'static str) -> Result<Option<u64>, ConfigError> {
    match std::env::var(var) {
        Ok(raw) => raw
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                var,
                details: format!("expected an integer, got {}", raw),
            }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable holds an unusable value.
    #[error("Invalid value for {var}: {details}")]
    InvalidValue {
        /// The offending variable.
        var: &'static str,
        /// What was wrong with it.
        details: String,
    },
}
