// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Attempt execution: turning one job attempt into worker processes.
//!
//! The workflow runtime owns ordering and durability; when it dispatches an
//! attempt back to this host, the [`AttemptRunner`] realizes it as connector
//! containers via the process factory. Connectors speak a JSON-lines
//! protocol on stdio: one message per line with a `type` tag (`SPEC`,
//! `CONNECTION_STATUS`, `CATALOG`, `RECORD`, `STATE`, `LOG`).

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

use crate::process::{ProcessError, ProcessFactory, ProcessSpec, Result, WorkerProcess};
use crate::workflow::{WorkflowInput, WorkflowOutcome};

/// Entrypoint convention shared by connector images.
const CONNECTOR_ENTRYPOINT: &str = "entrypoint.sh";

/// Cooperative cancellation flag for in-flight attempts.
pub type CancelToken = Arc<AtomicBool>;

/// Job configuration as carried on the wire (the scheduler's serialized
/// job config).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "configType", rename_all = "SCREAMING_SNAKE_CASE")]
enum RunConfig {
    Sync(SyncSpec),
    ResetConnection(SyncSpec),
    GetSpec(ImageSpec),
    CheckConnection(ConnectorSpec),
    DiscoverSchema(ConnectorSpec),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SyncSpec {
    source_docker_image: String,
    destination_docker_image: String,
    source_configuration: Value,
    destination_configuration: Value,
    configured_catalog: Value,
    #[serde(default)]
    state: Option<Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageSpec {
    docker_image: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectorSpec {
    docker_image: String,
    connection_configuration: Value,
}

/// Executes attempts by launching connector processes.
pub struct AttemptRunner {
    factory: Arc<dyn ProcessFactory>,
}

impl AttemptRunner {
    /// Create a runner over the given process factory.
    pub fn new(factory: Arc<dyn ProcessFactory>) -> Self {
        Self { factory }
    }

    /// Execute one attempt to completion (or cancellation).
    ///
    /// Never returns `Err` for connector failures; those become failed
    /// outcomes so the submitter records the attempt row first.
    pub async fn run(&self, input: &WorkflowInput, cancel: Option<CancelToken>) -> WorkflowOutcome {
        let config: RunConfig = match serde_json::from_value(input.config.clone()) {
            Ok(config) => config,
            Err(e) => return WorkflowOutcome::failed(format!("unreadable job config: {}", e)),
        };

        let result = match config {
            RunConfig::GetSpec(spec) => self.run_spec(input, &spec).await,
            RunConfig::CheckConnection(spec) => self.run_check(input, &spec).await,
            RunConfig::DiscoverSchema(spec) => self.run_discover(input, &spec).await,
            RunConfig::Sync(spec) | RunConfig::ResetConnection(spec) => {
                self.run_sync(input, &spec, cancel).await
            }
        };

        match result {
            Ok(outcome) => outcome,
            Err(e) => WorkflowOutcome::failed(e.to_string()),
        }
    }

    async fn run_spec(&self, input: &WorkflowInput, spec: &ImageSpec) -> Result<WorkflowOutcome> {
        let process = self
            .factory
            .create(ProcessSpec {
                job_id: input.job_id,
                attempt_number: input.attempt_number,
                job_root: input.workspace.clone(),
                image: spec.docker_image.clone(),
                uses_stdin: false,
                files: HashMap::new(),
                entrypoint: CONNECTOR_ENTRYPOINT.to_string(),
                args: vec!["spec".to_string()],
            })
            .await?;

        let (exit, messages) = drain_process(process).await?;
        if exit != 0 {
            return Ok(WorkflowOutcome::failed(format!(
                "spec worker exited with {}",
                exit
            )));
        }
        match last_message(&messages, "SPEC", "spec") {
            Some(spec) => Ok(WorkflowOutcome::succeeded(Some(
                json!({"outputType": "SPEC", "spec": spec}),
            ))),
            None => Ok(WorkflowOutcome::failed("worker produced no spec message")),
        }
    }

    async fn run_check(
        &self,
        input: &WorkflowInput,
        spec: &ConnectorSpec,
    ) -> Result<WorkflowOutcome> {
        let process = self
            .factory
            .create(ProcessSpec {
                job_id: input.job_id,
                attempt_number: input.attempt_number,
                job_root: input.workspace.clone(),
                image: spec.docker_image.clone(),
                uses_stdin: false,
                files: config_files(&spec.connection_configuration),
                entrypoint: CONNECTOR_ENTRYPOINT.to_string(),
                args: args_with_config("check"),
            })
            .await?;

        let (exit, messages) = drain_process(process).await?;
        if exit != 0 {
            return Ok(WorkflowOutcome::failed(format!(
                "check worker exited with {}",
                exit
            )));
        }
        match last_message(&messages, "CONNECTION_STATUS", "connectionStatus") {
            Some(status) => {
                let succeeded = status.get("status").and_then(Value::as_str) == Some("SUCCEEDED");
                let message = status
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string);
                Ok(WorkflowOutcome::succeeded(Some(json!({
                    "outputType": "CHECK_CONNECTION",
                    "succeeded": succeeded,
                    "message": message,
                }))))
            }
            None => Ok(WorkflowOutcome::failed(
                "worker produced no connection status",
            )),
        }
    }

    async fn run_discover(
        &self,
        input: &WorkflowInput,
        spec: &ConnectorSpec,
    ) -> Result<WorkflowOutcome> {
        let process = self
            .factory
            .create(ProcessSpec {
                job_id: input.job_id,
                attempt_number: input.attempt_number,
                job_root: input.workspace.clone(),
                image: spec.docker_image.clone(),
                uses_stdin: false,
                files: config_files(&spec.connection_configuration),
                entrypoint: CONNECTOR_ENTRYPOINT.to_string(),
                args: args_with_config("discover"),
            })
            .await?;

        let (exit, messages) = drain_process(process).await?;
        if exit != 0 {
            return Ok(WorkflowOutcome::failed(format!(
                "discover worker exited with {}",
                exit
            )));
        }
        match last_message(&messages, "CATALOG", "catalog") {
            Some(catalog) => Ok(WorkflowOutcome::succeeded(Some(
                json!({"outputType": "DISCOVER_CATALOG", "catalog": catalog}),
            ))),
            None => Ok(WorkflowOutcome::failed("worker produced no catalog")),
        }
    }

    /// Replication: source `read` piped into destination `write`, RECORD
    /// lines counted on the way through.
    async fn run_sync(
        &self,
        input: &WorkflowInput,
        spec: &SyncSpec,
        cancel: Option<CancelToken>,
    ) -> Result<WorkflowOutcome> {
        let started_at = Utc::now();
        let source_root = input.workspace.join("source");
        let destination_root = input.workspace.join("destination");

        let mut source_files = config_files(&spec.source_configuration);
        source_files.insert(
            "catalog.json".to_string(),
            spec.configured_catalog.to_string(),
        );
        let mut source_args = args_with_config("read");
        source_args.extend(["--catalog".to_string(), "catalog.json".to_string()]);
        if let Some(state) = &spec.state {
            source_files.insert("state.json".to_string(), state.to_string());
            source_args.extend(["--state".to_string(), "state.json".to_string()]);
        }

        let mut destination_files = config_files(&spec.destination_configuration);
        destination_files.insert(
            "catalog.json".to_string(),
            spec.configured_catalog.to_string(),
        );
        let mut destination_args = args_with_config("write");
        destination_args.extend(["--catalog".to_string(), "catalog.json".to_string()]);

        let mut source = self
            .factory
            .create(ProcessSpec {
                job_id: input.job_id,
                attempt_number: input.attempt_number,
                job_root: source_root,
                image: spec.source_docker_image.clone(),
                uses_stdin: false,
                files: source_files,
                entrypoint: CONNECTOR_ENTRYPOINT.to_string(),
                args: source_args,
            })
            .await?;

        let mut destination = match self
            .factory
            .create(ProcessSpec {
                job_id: input.job_id,
                attempt_number: input.attempt_number,
                job_root: destination_root,
                image: spec.destination_docker_image.clone(),
                uses_stdin: true,
                files: destination_files,
                entrypoint: CONNECTOR_ENTRYPOINT.to_string(),
                args: destination_args,
            })
            .await
        {
            Ok(destination) => destination,
            Err(e) => {
                let _ = source.destroy().await;
                return Err(e);
            }
        };

        // Drain the destination's own output so a chatty connector cannot
        // fill the pipe and stall the relay.
        if let Some(stdout) = destination.take_stdout() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(line = %line, "Destination output");
                }
            });
        }

        let relay = self
            .relay_records(source.as_mut(), destination.as_mut(), cancel.as_ref())
            .await;
        let (records_synced, bytes_synced) = match relay {
            Ok(counts) => counts,
            Err(e) => {
                let _ = source.destroy().await;
                let _ = destination.destroy().await;
                if matches!(e, ProcessError::Cancelled) {
                    return Ok(WorkflowOutcome::failed("attempt cancelled"));
                }
                return Err(e);
            }
        };

        let source_exit = source.wait_for().await?;
        let destination_exit = destination.wait_for().await?;
        if source_exit != 0 || destination_exit != 0 {
            return Ok(WorkflowOutcome::failed(format!(
                "replication workers exited with source={} destination={}",
                source_exit, destination_exit
            )));
        }

        let ended_at = Utc::now();
        info!(
            job_id = input.job_id,
            attempt = input.attempt_number,
            records_synced = records_synced,
            bytes_synced = bytes_synced,
            "Replication finished"
        );
        Ok(WorkflowOutcome::succeeded(Some(json!({
            "outputType": "SYNC",
            "recordsSynced": records_synced,
            "bytesSynced": bytes_synced,
            "startedAt": started_at,
            "endedAt": ended_at,
        }))))
    }

    /// Forward RECORD/STATE lines from the source to the destination,
    /// returning (records, bytes) moved.
    async fn relay_records(
        &self,
        source: &mut dyn WorkerProcess,
        destination: &mut dyn WorkerProcess,
        cancel: Option<&CancelToken>,
    ) -> Result<(i64, i64)> {
        let stdout = source
            .take_stdout()
            .ok_or_else(|| ProcessError::Other("source stdout unavailable".into()))?;
        let mut stdin = destination
            .take_stdin()
            .ok_or_else(|| ProcessError::Other("destination stdin unavailable".into()))?;

        let mut records: i64 = 0;
        let mut bytes: i64 = 0;
        let mut lines = BufReader::new(stdout).lines();

        while let Some(line) = lines.next_line().await? {
            if let Some(flag) = cancel
                && flag.load(Ordering::Relaxed)
            {
                return Err(ProcessError::Cancelled);
            }
            let Ok(message) = serde_json::from_str::<Value>(&line) else {
                debug!(line = %line, "Ignoring non-protocol source output");
                continue;
            };
            match message.get("type").and_then(Value::as_str) {
                Some("RECORD") => {
                    records += 1;
                    bytes += line.len() as i64;
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                }
                Some("STATE") => {
                    stdin.write_all(line.as_bytes()).await?;
                    stdin.write_all(b"\n").await?;
                }
                Some("LOG") | None => {}
                Some(other) => {
                    debug!(message_type = other, "Ignoring source message");
                }
            }
        }

        stdin.shutdown().await?;
        drop(stdin);
        Ok((records, bytes))
    }
}

fn config_files(configuration: &Value) -> HashMap<String, String> {
    HashMap::from([("config.json".to_string(), configuration.to_string())])
}

fn args_with_config(verb: &str) -> Vec<String> {
    vec![
        verb.to_string(),
        "--config".to_string(),
        "config.json".to_string(),
    ]
}

/// Wait for a process while collecting its protocol messages from stdout.
async fn drain_process(mut process: Box<dyn WorkerProcess>) -> Result<(i32, Vec<Value>)> {
    let mut messages = Vec::new();
    if let Some(stdout) = process.take_stdout() {
        let mut lines = BufReader::new(stdout).lines();
        while let Some(line) = lines.next_line().await? {
            match serde_json::from_str::<Value>(&line) {
                Ok(message) => messages.push(message),
                Err(_) => debug!(line = %line, "Ignoring non-protocol worker output"),
            }
        }
    } else {
        warn!("Worker stdout unavailable, no messages collected");
    }
    let exit = process.wait_for().await?;
    Ok((exit, messages))
}

/// The payload of the last message of the given type, e.g. the `spec` field
/// of the last `SPEC` message.
fn last_message<'a>(messages: &'a [Value], message_type: &str, field: &str) -> Option<&'a Value> {
    messages
        .iter()
        .rev()
        .find(|m| m.get("type").and_then(Value::as_str) == Some(message_type))
        .and_then(|m| m.get(field))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ProcessStdin;
    use crate::process::ProcessStream;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::Mutex;

    /// Factory producing scripted processes, in creation order.
    struct ScriptedFactory {
        processes: Mutex<Vec<ScriptedProcess>>,
        specs: Mutex<Vec<ProcessSpec>>,
    }

    impl ScriptedFactory {
        fn new(processes: Vec<ScriptedProcess>) -> Arc<Self> {
            Arc::new(Self {
                processes: Mutex::new(processes),
                specs: Mutex::new(Vec::new()),
            })
        }

        fn specs(&self) -> Vec<ProcessSpec> {
            self.specs.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProcessFactory for ScriptedFactory {
        fn factory_type(&self) -> &'static str {
            "scripted"
        }

        async fn create(&self, spec: ProcessSpec) -> Result<Box<dyn WorkerProcess>> {
            self.specs.lock().unwrap().push(spec);
            let mut processes = self.processes.lock().unwrap();
            if processes.is_empty() {
                return Err(ProcessError::StartFailed("no scripted process".into()));
            }
            Ok(Box::new(processes.remove(0)))
        }
    }

    /// Process with canned stdout and exit code; captures stdin writes.
    struct ScriptedProcess {
        stdout: Option<Vec<u8>>,
        exit: i32,
        captured_stdin: Arc<Mutex<Vec<u8>>>,
        wants_stdin: bool,
    }

    impl ScriptedProcess {
        fn new(stdout: &str, exit: i32) -> Self {
            Self {
                stdout: Some(stdout.as_bytes().to_vec()),
                exit,
                captured_stdin: Arc::new(Mutex::new(Vec::new())),
                wants_stdin: false,
            }
        }

        fn with_stdin(mut self) -> Self {
            self.wants_stdin = true;
            self
        }
    }

    /// Writer handing bytes to a shared buffer.
    struct CaptureWriter(Arc<Mutex<Vec<u8>>>);

    impl tokio::io::AsyncWrite for CaptureWriter {
        fn poll_write(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            self.0.lock().unwrap().extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[async_trait]
    impl WorkerProcess for ScriptedProcess {
        fn take_stdin(&mut self) -> Option<ProcessStdin> {
            self.wants_stdin
                .then(|| Box::new(CaptureWriter(self.captured_stdin.clone())) as ProcessStdin)
        }

        fn take_stdout(&mut self) -> Option<ProcessStream> {
            self.stdout
                .take()
                .map(|bytes| Box::new(std::io::Cursor::new(bytes)) as ProcessStream)
        }

        fn take_stderr(&mut self) -> Option<ProcessStream> {
            None
        }

        async fn wait_for(&mut self) -> Result<i32> {
            Ok(self.exit)
        }

        fn exit_value(&self) -> Option<i32> {
            Some(self.exit)
        }

        async fn destroy(&mut self) -> Result<()> {
            Ok(())
        }

        async fn is_alive(&self) -> bool {
            false
        }
    }

    fn input(config: Value) -> WorkflowInput {
        WorkflowInput {
            job_id: 9,
            attempt_number: 0,
            workspace: PathBuf::from("/workspace/9/0"),
            config,
        }
    }

    #[tokio::test]
    async fn test_run_spec_collects_last_spec_message() {
        let factory = ScriptedFactory::new(vec![ScriptedProcess::new(
            "{\"type\":\"LOG\",\"log\":{\"message\":\"hi\"}}\n{\"type\":\"SPEC\",\"spec\":{\"documentationUrl\":\"d\"}}\n",
            0,
        )]);
        let runner = AttemptRunner::new(factory.clone());

        let outcome = runner
            .run(
                &input(json!({"configType": "GET_SPEC", "dockerImage": "airbyte/source-postgres:0.1.0"})),
                None,
            )
            .await;

        assert!(outcome.success);
        let output = outcome.output.unwrap();
        assert_eq!(output["outputType"], "SPEC");
        assert_eq!(output["spec"]["documentationUrl"], "d");

        let specs = factory.specs();
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].args, vec!["spec"]);
        assert!(!specs[0].uses_stdin);
    }

    #[tokio::test]
    async fn test_run_check_reads_connection_status() {
        let factory = ScriptedFactory::new(vec![ScriptedProcess::new(
            "{\"type\":\"CONNECTION_STATUS\",\"connectionStatus\":{\"status\":\"FAILED\",\"message\":\"bad password\"}}\n",
            0,
        )]);
        let runner = AttemptRunner::new(factory);

        let outcome = runner
            .run(
                &input(json!({
                    "configType": "CHECK_CONNECTION",
                    "dockerImage": "airbyte/source-postgres:0.1.0",
                    "connectionConfiguration": {"host": "db"},
                })),
                None,
            )
            .await;

        assert!(outcome.success);
        let output = outcome.output.unwrap();
        assert_eq!(output["succeeded"], false);
        assert_eq!(output["message"], "bad password");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed_outcome() {
        let factory = ScriptedFactory::new(vec![ScriptedProcess::new("", 2)]);
        let runner = AttemptRunner::new(factory);

        let outcome = runner
            .run(
                &input(json!({"configType": "GET_SPEC", "dockerImage": "x:y"})),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.failure.unwrap().contains("exited with 2"));
    }

    #[tokio::test]
    async fn test_sync_relays_records_and_counts() {
        let source_stdout = concat!(
            "{\"type\":\"RECORD\",\"record\":{\"data\":{\"id\":1}}}\n",
            "{\"type\":\"LOG\",\"log\":{\"message\":\"reading\"}}\n",
            "{\"type\":\"RECORD\",\"record\":{\"data\":{\"id\":2}}}\n",
            "{\"type\":\"STATE\",\"state\":{\"cursor\":\"2\"}}\n",
        );
        let destination = ScriptedProcess::new("", 0).with_stdin();
        let captured = destination.captured_stdin.clone();
        let factory = ScriptedFactory::new(vec![ScriptedProcess::new(source_stdout, 0), destination]);
        let runner = AttemptRunner::new(factory.clone());

        let outcome = runner
            .run(
                &input(json!({
                    "configType": "SYNC",
                    "sourceDockerImage": "airbyte/source-postgres:0.1.0",
                    "destinationDockerImage": "airbyte/destination-bigquery:0.2.0",
                    "sourceConfiguration": {"host": "db"},
                    "destinationConfiguration": {"project": "p"},
                    "configuredCatalog": {"streams": []},
                })),
                None,
            )
            .await;

        assert!(outcome.success, "failure: {:?}", outcome.failure);
        let output = outcome.output.unwrap();
        assert_eq!(output["outputType"], "SYNC");
        assert_eq!(output["recordsSynced"], 2);

        // Destination received both records and the state, not the log line.
        let written = String::from_utf8(captured.lock().unwrap().clone()).unwrap();
        assert_eq!(written.lines().count(), 3);
        assert!(written.contains("\"STATE\""));
        assert!(!written.contains("\"LOG\""));

        // Source reads, destination writes, both against the shared catalog.
        let specs = factory.specs();
        assert_eq!(specs.len(), 2);
        assert_eq!(specs[0].args[0], "read");
        assert!(specs[0].files.contains_key("catalog.json"));
        assert_eq!(specs[1].args[0], "write");
        assert!(specs[1].uses_stdin);
    }

    #[tokio::test]
    async fn test_sync_fails_when_destination_exits_nonzero() {
        let factory = ScriptedFactory::new(vec![
            ScriptedProcess::new("{\"type\":\"RECORD\",\"record\":{}}\n", 0),
            ScriptedProcess::new("", 1).with_stdin(),
        ]);
        let runner = AttemptRunner::new(factory);

        let outcome = runner
            .run(
                &input(json!({
                    "configType": "SYNC",
                    "sourceDockerImage": "x:y",
                    "destinationDockerImage": "x:y",
                    "sourceConfiguration": {},
                    "destinationConfiguration": {},
                    "configuredCatalog": {},
                })),
                None,
            )
            .await;

        assert!(!outcome.success);
        assert!(outcome.failure.unwrap().contains("destination=1"));
    }

    #[tokio::test]
    async fn test_unreadable_config_is_failed_outcome() {
        let factory = ScriptedFactory::new(vec![]);
        let runner = AttemptRunner::new(factory);
        let outcome = runner
            .run(&input(json!({"configType": "MAKE_COFFEE"})), None)
            .await;
        assert!(!outcome.success);
        assert!(outcome.failure.unwrap().contains("unreadable job config"));
    }
}
