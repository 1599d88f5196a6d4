// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Docker process factory.
//!
//! Launches worker containers via the local `docker` CLI. Input files are
//! written to the per-attempt workspace directory on the host, which is then
//! bind-mounted into the container together with the local data root.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::fs;
use tokio::process::{Child, Command};
use tracing::{debug, error, info, warn};

use super::{
    ProcessError, ProcessFactory, ProcessSpec, ProcessStdin, ProcessStream, Result, WorkerProcess,
};

/// Mount point of the workspace volume inside worker containers.
const DATA_MOUNT_DESTINATION: &str = "/data";
/// Mount point of the local volume inside worker containers.
const LOCAL_MOUNT_DESTINATION: &str = "/local";

/// Docker factory configuration.
#[derive(Debug, Clone)]
pub struct DockerProcessFactoryConfig {
    /// Workspace root on the scheduler host (where job roots live).
    pub workspace_root: PathBuf,
    /// Volume or host path mounted at `/data` inside workers.
    pub workspace_mount: String,
    /// Volume or host path mounted at `/local` inside workers.
    pub local_mount: String,
    /// Docker network workers are attached to.
    pub network: String,
}

/// Process factory backed by `docker run`.
pub struct DockerProcessFactory {
    config: DockerProcessFactoryConfig,
}

impl DockerProcessFactory {
    /// Create a new Docker process factory.
    pub fn new(config: DockerProcessFactoryConfig) -> Self {
        Self { config }
    }

    /// Rebase a host job root onto the in-container workspace mount.
    ///
    /// `<workspace_root>/<job>/<attempt>` becomes `/data/<job>/<attempt>`.
    fn container_workdir(&self, job_root: &Path) -> PathBuf {
        match job_root.strip_prefix(&self.config.workspace_root) {
            Ok(relative) => Path::new(DATA_MOUNT_DESTINATION).join(relative),
            Err(_) => PathBuf::from(DATA_MOUNT_DESTINATION),
        }
    }

    /// Assemble the `docker run` argument vector for a spec.
    fn run_args(&self, spec: &ProcessSpec) -> Vec<String> {
        let mut args: Vec<String> = vec!["run".into(), "--rm".into(), "--init".into()];
        if spec.uses_stdin {
            args.push("-i".into());
        }
        args.extend([
            "--name".into(),
            spec.worker_name(),
            "--network".into(),
            self.config.network.clone(),
            "-v".into(),
            format!("{}:{}", self.config.workspace_mount, DATA_MOUNT_DESTINATION),
            "-v".into(),
            format!("{}:{}", self.config.local_mount, LOCAL_MOUNT_DESTINATION),
            "-w".into(),
            self.container_workdir(&spec.job_root).display().to_string(),
            "--entrypoint".into(),
            spec.entrypoint.clone(),
            spec.image.clone(),
        ]);
        args.extend(spec.args.iter().cloned());
        args
    }

    /// Materialize the spec's input files in the host job root.
    async fn write_files(&self, spec: &ProcessSpec) -> Result<()> {
        fs::create_dir_all(&spec.job_root).await?;
        for (name, contents) in &spec.files {
            let path = spec.job_root.join(name);
            fs::write(&path, contents).await?;
            debug!(path = %path.display(), "Staged worker input file");
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessFactory for DockerProcessFactory {
    fn factory_type(&self) -> &'static str {
        "docker"
    }

    async fn create(&self, spec: ProcessSpec) -> Result<Box<dyn WorkerProcess>> {
        self.write_files(&spec).await?;

        let args = self.run_args(&spec);
        debug!(
            job_id = spec.job_id,
            attempt = spec.attempt_number,
            image = %spec.image,
            "docker {}",
            args.join(" ")
        );

        let mut cmd = Command::new("docker");
        cmd.args(&args)
            .stdin(if spec.uses_stdin {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd
            .spawn()
            .map_err(|e| ProcessError::StartFailed(format!("docker run: {}", e)))?;

        info!(
            job_id = spec.job_id,
            attempt = spec.attempt_number,
            image = %spec.image,
            name = %spec.worker_name(),
            "Launched docker worker"
        );

        Ok(Box::new(DockerProcess {
            name: spec.worker_name(),
            child,
            exit_value: None,
        }))
    }
}

/// A running `docker run` child.
pub struct DockerProcess {
    name: String,
    child: Child,
    exit_value: Option<i32>,
}

#[async_trait]
impl WorkerProcess for DockerProcess {
    fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.child
            .stdin
            .take()
            .map(|s| Box::new(s) as ProcessStdin)
    }

    fn take_stdout(&mut self) -> Option<ProcessStream> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as ProcessStream)
    }

    fn take_stderr(&mut self) -> Option<ProcessStream> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as ProcessStream)
    }

    async fn wait_for(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_value {
            return Ok(code);
        }
        let status = self.child.wait().await?;
        let code = status.code().unwrap_or(-1);
        if code != 0 {
            warn!(name = %self.name, exit_code = code, "Docker worker failed");
        }
        self.exit_value = Some(code);
        Ok(code)
    }

    fn exit_value(&self) -> Option<i32> {
        self.exit_value
    }

    async fn destroy(&mut self) -> Result<()> {
        // `docker run --rm` removes the container once the process dies.
        if let Err(e) = self.child.start_kill() {
            warn!(name = %self.name, error = %e, "Failed to kill docker worker (may already be dead)");
        }
        // Remove the container in case the CLI process died but the
        // container survived.
        let _ = Command::new("docker")
            .args(["rm", "-f", self.name.as_str()])
            .output()
            .await;
        match tokio::time::timeout(Duration::from_secs(10), self.child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_value = Some(status.code().unwrap_or(-1));
            }
            Ok(Err(e)) => {
                error!(name = %self.name, error = %e, "Error reaping docker worker");
            }
            Err(_) => {
                warn!(name = %self.name, "Docker worker did not die within grace period");
            }
        }
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.exit_value.is_none() && self.child.id().is_some()
    }
}
