// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Kubernetes process factory.
//!
//! Launches worker containers as ephemeral pods via the `kubectl` CLI. Each
//! pod has three containers sharing an `emptyDir` at `/config`:
//!
//! - **init**: creates the stdio fifos, then polls until staged input files
//!   arrive (`FINISHED_UPLOADING` marker).
//! - **main**: the user image; the supplied entrypoint is rewritten to run
//!   behind the fifos and write its real exit code to `/config/TERMINATION`.
//! - **heartbeat**: relays the stdio fifos over a duplex TCP connection back
//!   to the scheduler's listener and polls the scheduler's heartbeat URL,
//!   killing the pod after three consecutive misses.
//!
//! One port is leased from the [`WorkerPortPool`] per pod and carries both
//! stdin injection and stdout piping on a single accepted connection. Input
//! files are staged tar-style with `kubectl cp` into the init container.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::process::Command;
use tracing::{debug, info, warn};

use super::port_pool::WorkerPortPool;
use super::{
    ProcessError, ProcessFactory, ProcessSpec, ProcessStdin, ProcessStream, Result, WorkerProcess,
};

/// Image used for the init and heartbeat containers.
const SUPPORT_IMAGE: &str = "busybox:1.36";
/// How often pod phase is polled while waiting.
const POD_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// How long the factory waits for the pod's init container to come up.
const INIT_TIMEOUT: Duration = Duration::from_secs(120);
/// How long the factory waits for the pod's stdio connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(120);
/// Sidecar heartbeat interval.
const HEARTBEAT_INTERVAL_SECS: u64 = 30;
/// Consecutive heartbeat misses before the sidecar kills the pod.
const HEARTBEAT_MISS_LIMIT: u32 = 3;

/// Kubernetes factory configuration.
#[derive(Debug, Clone)]
pub struct KubeProcessFactoryConfig {
    /// Namespace pods are created in.
    pub namespace: String,
    /// Address pods dial for the stdio relay and heartbeat, `host` part must
    /// be reachable from inside the cluster.
    pub scheduler_host: String,
    /// Full heartbeat URL polled by the sidecar (`<host>:<port>`).
    pub heartbeat_url: String,
}

/// Process factory backed by ephemeral Kubernetes pods.
pub struct KubeProcessFactory {
    config: KubeProcessFactoryConfig,
    ports: Arc<WorkerPortPool>,
}

impl KubeProcessFactory {
    /// Create a new Kubernetes process factory over a bounded worker port pool.
    pub fn new(config: KubeProcessFactoryConfig, ports: Arc<WorkerPortPool>) -> Self {
        Self { config, ports }
    }

    async fn stage_files(&self, pod_name: &str, spec: &ProcessSpec) -> Result<()> {
        // kubectl cp is tar over the API server; files land in the init
        // container's /config before the marker releases it.
        tokio::fs::create_dir_all(&spec.job_root).await?;
        for (name, contents) in &spec.files {
            let host_path = spec.job_root.join(name);
            tokio::fs::write(&host_path, contents).await?;
            self.kubectl_cp(&host_path, pod_name, name).await?;
        }
        let marker = spec.job_root.join("FINISHED_UPLOADING");
        tokio::fs::write(&marker, "").await?;
        self.kubectl_cp(&marker, pod_name, "FINISHED_UPLOADING").await?;
        Ok(())
    }

    async fn kubectl_cp(&self, host_path: &Path, pod_name: &str, dest_name: &str) -> Result<()> {
        let src = host_path.display().to_string();
        let dest = format!("{}/{}:/config/{}", self.config.namespace, pod_name, dest_name);
        let output = Command::new("kubectl")
            .args(["cp", src.as_str(), dest.as_str(), "-c", "init"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(ProcessError::Staging(format!(
                "kubectl cp {}: {}",
                dest,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn apply_manifest(&self, manifest: &Value) -> Result<()> {
        let mut child = Command::new("kubectl")
            .args(["apply", "-f", "-"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProcessError::Other("kubectl stdin unavailable".into()))?;
        stdin.write_all(&serde_json::to_vec(manifest)?).await?;
        drop(stdin);
        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ProcessError::StartFailed(format!(
                "kubectl apply: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Wait until the pod's init container is running so files can be staged.
    async fn await_init_running(&self, pod_name: &str) -> Result<()> {
        let deadline = tokio::time::Instant::now() + INIT_TIMEOUT;
        loop {
            if let Some(pod) = get_pod(&self.config.namespace, pod_name).await?
                && init_container_running(&pod)
            {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProcessError::StartFailed(format!(
                    "init container of pod {} not running within {:?}",
                    pod_name, INIT_TIMEOUT
                )));
            }
            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ProcessFactory for KubeProcessFactory {
    fn factory_type(&self) -> &'static str {
        "kubernetes"
    }

    async fn create(&self, spec: ProcessSpec) -> Result<Box<dyn WorkerProcess>> {
        // Blocks while every worker port is leased - this is the factory's
        // back-pressure on pod count.
        let port = self.ports.acquire().await;

        let result = self.create_with_port(&spec, port).await;
        if result.is_err() {
            self.ports.release(port).await;
        }
        result
    }
}

impl KubeProcessFactory {
    async fn create_with_port(
        &self,
        spec: &ProcessSpec,
        port: u16,
    ) -> Result<Box<dyn WorkerProcess>> {
        let pod_name = pod_name(spec);
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;

        let manifest = pod_manifest(
            &pod_name,
            &self.config.namespace,
            spec,
            &self.config.scheduler_host,
            port,
            &self.config.heartbeat_url,
        );
        self.apply_manifest(&manifest).await?;
        debug!(pod = %pod_name, port = port, "Created worker pod");

        self.await_init_running(&pod_name).await?;
        self.stage_files(&pod_name, spec).await?;

        // The heartbeat container dials back once the main container is up.
        let (stream, peer) = tokio::time::timeout(CONNECT_TIMEOUT, listener.accept())
            .await
            .map_err(|_| {
                ProcessError::StartFailed(format!("pod {} never connected stdio", pod_name))
            })??;
        debug!(pod = %pod_name, peer = %peer, "Worker pod stdio connected");

        let (stdout, stdin) = stream.into_split();

        info!(
            job_id = spec.job_id,
            attempt = spec.attempt_number,
            pod = %pod_name,
            image = %spec.image,
            port = port,
            "Launched kubernetes worker"
        );

        Ok(Box::new(KubePodProcess {
            namespace: self.config.namespace.clone(),
            pod_name,
            ports: self.ports.clone(),
            port: Some(port),
            stdin: spec.uses_stdin.then_some(stdin),
            stdout: Some(stdout),
            exit_value: None,
        }))
    }
}

/// A worker running as a Kubernetes pod.
pub struct KubePodProcess {
    namespace: String,
    pod_name: String,
    ports: Arc<WorkerPortPool>,
    port: Option<u16>,
    stdin: Option<OwnedWriteHalf>,
    stdout: Option<OwnedReadHalf>,
    exit_value: Option<i32>,
}

impl KubePodProcess {
    async fn release_port(&mut self) {
        if let Some(port) = self.port.take() {
            self.ports.release(port).await;
        }
    }

    /// Read `/config/TERMINATION` through the heartbeat container, which
    /// shares the emptyDir and outlives the main container.
    async fn read_termination(&self) -> Option<i32> {
        let output = Command::new("kubectl")
            .args([
                "exec",
                "-n",
                self.namespace.as_str(),
                self.pod_name.as_str(),
                "-c",
                "heartbeat",
                "--",
                "cat",
                "/config/TERMINATION",
            ])
            .output()
            .await
            .ok()?;
        if !output.status.success() {
            return None;
        }
        String::from_utf8_lossy(&output.stdout).trim().parse().ok()
    }
}

#[async_trait]
impl WorkerProcess for KubePodProcess {
    fn take_stdin(&mut self) -> Option<ProcessStdin> {
        self.stdin.take().map(|s| Box::new(s) as ProcessStdin)
    }

    fn take_stdout(&mut self) -> Option<ProcessStream> {
        self.stdout.take().map(|s| Box::new(s) as ProcessStream)
    }

    fn take_stderr(&mut self) -> Option<ProcessStream> {
        // stderr stays in the shared volume (stderr.log); it is not piped.
        None
    }

    async fn wait_for(&mut self) -> Result<i32> {
        if let Some(code) = self.exit_value {
            return Ok(code);
        }
        loop {
            let Some(pod) = get_pod(&self.namespace, &self.pod_name).await? else {
                self.release_port().await;
                return Err(ProcessError::Vanished(self.pod_name.clone()));
            };

            let phase = pod_phase(&pod);
            if main_container_terminated(&pod) || phase == "Succeeded" || phase == "Failed" {
                let code = match self.read_termination().await {
                    Some(code) => code,
                    None => infer_exit_code(&pod).unwrap_or(if phase == "Succeeded" {
                        0
                    } else {
                        1
                    }),
                };
                if code != 0 {
                    warn!(pod = %self.pod_name, exit_code = code, phase = %phase, "Kubernetes worker failed");
                }
                self.exit_value = Some(code);
                self.release_port().await;
                return Ok(code);
            }

            tokio::time::sleep(POD_POLL_INTERVAL).await;
        }
    }

    fn exit_value(&self) -> Option<i32> {
        self.exit_value
    }

    async fn destroy(&mut self) -> Result<()> {
        let output = Command::new("kubectl")
            .args([
                "delete",
                "pod",
                "-n",
                self.namespace.as_str(),
                self.pod_name.as_str(),
                "--grace-period=0",
                "--ignore-not-found",
            ])
            .output()
            .await?;
        if !output.status.success() {
            warn!(
                pod = %self.pod_name,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "Failed to delete worker pod"
            );
        }
        self.release_port().await;
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        if self.exit_value.is_some() {
            return false;
        }
        match get_pod(&self.namespace, &self.pod_name).await {
            Ok(Some(pod)) => {
                let phase = pod_phase(&pod);
                (phase == "Pending" || phase == "Running") && !main_container_terminated(&pod)
            }
            _ => false,
        }
    }
}

fn pod_name(spec: &ProcessSpec) -> String {
    format!("datalift-worker-{}", spec.worker_name())
}

async fn get_pod(namespace: &str, pod_name: &str) -> Result<Option<Value>> {
    let output = Command::new("kubectl")
        .args(["get", "pod", "-n", namespace, pod_name, "-o", "json"])
        .output()
        .await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        if stderr.contains("NotFound") {
            return Ok(None);
        }
        return Err(ProcessError::Other(format!(
            "kubectl get pod {}: {}",
            pod_name,
            stderr.trim()
        )));
    }
    Ok(Some(serde_json::from_slice(&output.stdout)?))
}

fn pod_phase(pod: &Value) -> String {
    pod.pointer("/status/phase")
        .and_then(Value::as_str)
        .unwrap_or("Unknown")
        .to_string()
}

fn init_container_running(pod: &Value) -> bool {
    pod.pointer("/status/initContainerStatuses")
        .and_then(Value::as_array)
        .is_some_and(|statuses| {
            statuses
                .iter()
                .any(|s| s.pointer("/state/running").is_some())
        })
}

fn main_container_status(pod: &Value) -> Option<&Value> {
    pod.pointer("/status/containerStatuses")
        .and_then(Value::as_array)?
        .iter()
        .find(|s| s.get("name").and_then(Value::as_str) == Some("main"))
}

fn main_container_terminated(pod: &Value) -> bool {
    main_container_status(pod).is_some_and(|s| s.pointer("/state/terminated").is_some())
}

/// Derive an exit code from container status when the terminator file is
/// missing. Image-pull and missing-command failures map to 127, matching the
/// shell convention for "command not found".
fn infer_exit_code(pod: &Value) -> Option<i32> {
    let status = main_container_status(pod)?;
    if let Some(code) = status
        .pointer("/state/terminated/exitCode")
        .and_then(Value::as_i64)
    {
        return Some(code as i32);
    }
    let waiting_reason = status
        .pointer("/state/waiting/reason")
        .and_then(Value::as_str)
        .unwrap_or("");
    if matches!(
        waiting_reason,
        "ErrImagePull" | "ImagePullBackOff" | "InvalidImageName" | "CreateContainerError"
    ) {
        return Some(127);
    }
    status
        .pointer("/lastState/terminated/exitCode")
        .and_then(Value::as_i64)
        .map(|c| c as i32)
}

/// Main container command: run the rewritten entrypoint behind the fifos and
/// record the real exit code in the terminator file.
fn main_command(entrypoint: &str, args: &[String], uses_stdin: bool) -> String {
    let mut invocation = entrypoint.to_string();
    for arg in args {
        invocation.push(' ');
        invocation.push_str(&shell_quote(arg));
    }
    let stdin_redirect = if uses_stdin {
        " < /config/stdin.pipe"
    } else {
        ""
    };
    format!(
        "cd /config && ({invocation}{stdin_redirect}) > /config/stdout.pipe 2> /config/stderr.log; echo $? > /config/TERMINATION"
    )
}

/// Heartbeat sidecar command: relay the stdio fifos to the scheduler and poll
/// its heartbeat URL, killing the pod after consecutive misses.
fn sidecar_command(
    scheduler_host: &str,
    port: u16,
    heartbeat_url: &str,
    uses_stdin: bool,
) -> String {
    let relay = if uses_stdin {
        format!("nc {scheduler_host} {port} < /config/stdout.pipe > /config/stdin.pipe &")
    } else {
        format!("nc {scheduler_host} {port} < /config/stdout.pipe > /dev/null &")
    };
    format!(
        "{relay} \
         FAILS=0; \
         while [ \"$FAILS\" -lt {HEARTBEAT_MISS_LIMIT} ]; do \
         if wget -q -O /dev/null http://{heartbeat_url}/; then FAILS=0; else FAILS=$((FAILS+1)); fi; \
         sleep {HEARTBEAT_INTERVAL_SECS}; \
         done; \
         echo 143 > /config/TERMINATION; \
         kill -TERM -1"
    )
}

fn shell_quote(arg: &str) -> String {
    if arg
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./=:".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}

/// Build the full pod manifest for a worker spec.
fn pod_manifest(
    pod_name: &str,
    namespace: &str,
    spec: &ProcessSpec,
    scheduler_host: &str,
    port: u16,
    heartbeat_url: &str,
) -> Value {
    let volume_mount = json!([{"name": "worker-shared", "mountPath": "/config"}]);
    let mut init_cmd = String::from("mkfifo /config/stdout.pipe");
    if spec.uses_stdin {
        init_cmd.push_str(" && mkfifo /config/stdin.pipe");
    }
    init_cmd.push_str(" && until [ -f /config/FINISHED_UPLOADING ]; do sleep 0.1; done");

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": pod_name,
            "namespace": namespace,
            "labels": {
                "app": "datalift-worker",
                "job-id": spec.job_id.to_string(),
                "attempt": spec.attempt_number.to_string(),
            },
        },
        "spec": {
            "restartPolicy": "Never",
            "shareProcessNamespace": true,
            "initContainers": [{
                "name": "init",
                "image": SUPPORT_IMAGE,
                "command": ["sh", "-c", init_cmd],
                "volumeMounts": volume_mount.clone(),
            }],
            "containers": [
                {
                    "name": "main",
                    "image": spec.image,
                    "command": ["sh", "-c", main_command(&spec.entrypoint, &spec.args, spec.uses_stdin)],
                    "workingDir": "/config",
                    "volumeMounts": volume_mount.clone(),
                },
                {
                    "name": "heartbeat",
                    "image": SUPPORT_IMAGE,
                    "command": ["sh", "-c", sidecar_command(scheduler_host, port, heartbeat_url, spec.uses_stdin)],
                    "volumeMounts": volume_mount,
                },
            ],
            "volumes": [{"name": "worker-shared", "emptyDir": {}}],
        },
    })
}
