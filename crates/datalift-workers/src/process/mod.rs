// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process factory trait definitions.
//!
//! Defines the abstract interface for launching worker containers. A factory
//! turns a [`ProcessSpec`] into a live [`WorkerProcess`] whose contract matches
//! a POSIX child process: stdio handles, wait, exit code, destroy.

pub mod docker;
pub mod kube;
pub mod port_pool;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors from process factory operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProcessError {
    /// Container/process failed to start.
    #[error("Worker start failed: {0}")]
    StartFailed(String),

    /// The worker image could not be pulled or found.
    #[error("Image not found: {0}")]
    ImageNotFound(String),

    /// Staging input files into the worker failed.
    #[error("File staging failed: {0}")]
    Staging(String),

    /// Execution was cancelled before completion.
    #[error("Execution cancelled")]
    Cancelled,

    /// The pod/container disappeared before reporting an exit code.
    #[error("Worker vanished without exit code: {0}")]
    Vanished(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

/// Result type for process factory operations.
pub type Result<T> = std::result::Result<T, ProcessError>;

/// Description of a worker process to launch.
#[derive(Debug, Clone)]
pub struct ProcessSpec {
    /// Job the process belongs to.
    pub job_id: i64,
    /// Attempt number within the job.
    pub attempt_number: i32,
    /// Per-attempt workspace directory on the scheduler host.
    pub job_root: PathBuf,
    /// Container image to run (repository:tag).
    pub image: String,
    /// Whether the caller intends to write to the worker's stdin.
    pub uses_stdin: bool,
    /// Files to materialize in the worker's working directory before the
    /// entrypoint starts (filename -> contents).
    pub files: HashMap<String, String>,
    /// Entrypoint override for the image.
    pub entrypoint: String,
    /// Arguments passed to the entrypoint.
    pub args: Vec<String>,
}

impl ProcessSpec {
    /// Container/pod name for this attempt, `<job>-<attempt>` as the worker
    /// runtimes expect.
    pub fn worker_name(&self) -> String {
        format!("{}-{}", self.job_id, self.attempt_number)
    }
}

/// Byte sink for a worker's stdin.
pub type ProcessStdin = Box<dyn AsyncWrite + Send + Unpin>;
/// Byte source for a worker's stdout or stderr.
pub type ProcessStream = Box<dyn AsyncRead + Send + Unpin>;

/// Handle to a launched worker process.
///
/// Stdio handles are surrendered to the caller on first access (`take_*`
/// returns `None` afterwards, or when the spec did not request the stream).
#[async_trait]
pub trait WorkerProcess: Send {
    /// Take the stdin sink. `None` if `uses_stdin` was false or already taken.
    fn take_stdin(&mut self) -> Option<ProcessStdin>;

    /// Take the stdout source.
    fn take_stdout(&mut self) -> Option<ProcessStream>;

    /// Take the stderr source.
    fn take_stderr(&mut self) -> Option<ProcessStream>;

    /// Wait for the process to exit and return its exit code.
    async fn wait_for(&mut self) -> Result<i32>;

    /// Exit code if the process has already been waited on.
    fn exit_value(&self) -> Option<i32>;

    /// Forcibly terminate the process and release its resources.
    async fn destroy(&mut self) -> Result<()>;

    /// Whether the process is still running.
    async fn is_alive(&self) -> bool;
}

/// Trait for worker process factories.
///
/// Factories are PURE launchers - they do NOT touch the job database.
/// Recording attempt results is the caller's responsibility.
#[async_trait]
pub trait ProcessFactory: Send + Sync {
    /// Factory type identifier (e.g. "docker", "kubernetes").
    fn factory_type(&self) -> &'static str;

    /// Launch a worker for the given spec.
    ///
    /// May block when the factory's resources (e.g. the Kubernetes worker
    /// port pool) are exhausted.
    async fn create(&self, spec: ProcessSpec) -> Result<Box<dyn WorkerProcess>>;
}
