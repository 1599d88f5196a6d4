// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow-runtime client.
//!
//! The scheduler never executes attempts in-process. Each attempt is handed
//! to an external workflow runtime under a deterministic identity
//! (`connection-<uuid>-<job>-<attempt>`), which the runtime uses to
//! deduplicate submissions. The runtime is an opaque dependency reached over
//! TCP; [`FakeWorkflowClient`] substitutes it in tests.

pub mod frame;

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

use self::frame::{Frame, FrameError, MessageType, read_frame, write_frame};

/// Default workflow runtime port.
pub const DEFAULT_WORKFLOW_PORT: u16 = 7233;

/// Errors from workflow-runtime operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WorkflowError {
    /// Connecting to the runtime failed.
    #[error("Workflow runtime unreachable at {addr}: {source}")]
    Unreachable {
        /// Runtime address.
        addr: String,
        /// Underlying connection error.
        source: std::io::Error,
    },

    /// Wire protocol failure.
    #[error("Workflow protocol error: {0}")]
    Frame(#[from] FrameError),

    /// The runtime rejected the request.
    #[error("Workflow rejected: {0}")]
    Rejected(String),
}

/// Result type for workflow-runtime operations.
pub type Result<T> = std::result::Result<T, WorkflowError>;

/// Input handed to the runtime for one attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInput {
    /// Job the attempt belongs to.
    pub job_id: i64,
    /// Attempt number within the job.
    pub attempt_number: i32,
    /// Per-attempt workspace directory.
    pub workspace: PathBuf,
    /// Serialized job configuration.
    pub config: Value,
}

/// Terminal result of a workflow execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowOutcome {
    /// Whether the attempt succeeded.
    pub success: bool,
    /// Output payload from a successful attempt.
    pub output: Option<Value>,
    /// Failure description from an unsuccessful attempt.
    pub failure: Option<String>,
}

impl WorkflowOutcome {
    /// A successful outcome carrying the given output.
    pub fn succeeded(output: Option<Value>) -> Self {
        Self {
            success: true,
            output,
            failure: None,
        }
    }

    /// A failed outcome with a reason.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            failure: Some(reason.into()),
        }
    }
}

/// Capability for submitting attempts to the workflow runtime.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    /// Run a workflow under the given identity and wait for its result.
    ///
    /// Submitting the same identity twice must not execute the attempt twice;
    /// the runtime deduplicates and returns the original result.
    async fn submit(&self, identity: &str, input: WorkflowInput) -> Result<WorkflowOutcome>;

    /// Cooperatively cancel a running workflow.
    async fn cancel(&self, identity: &str) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum WireRequest {
    Submit {
        identity: String,
        input: WorkflowInput,
    },
    Cancel {
        identity: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct WireError {
    message: String,
}

/// Workflow client speaking the frame protocol over TCP.
///
/// One connection per RPC; the runtime owns all durable workflow state.
pub struct TcpWorkflowClient {
    addr: String,
}

impl TcpWorkflowClient {
    /// Create a client for the runtime at `host[:port]`.
    pub fn new(addr: impl Into<String>) -> Self {
        let mut addr = addr.into();
        if !addr.contains(':') {
            addr = format!("{}:{}", addr, DEFAULT_WORKFLOW_PORT);
        }
        Self { addr }
    }

    async fn call(&self, request: &WireRequest) -> Result<Frame> {
        let mut stream = TcpStream::connect(&self.addr)
            .await
            .map_err(|source| WorkflowError::Unreachable {
                addr: self.addr.clone(),
                source,
            })?;

        write_frame(&mut stream, &Frame::request(request)?).await?;
        let response = read_frame(&mut stream).await?;
        match response.message_type {
            MessageType::Response => Ok(response),
            MessageType::Error => {
                let err: WireError = response.decode()?;
                Err(WorkflowError::Rejected(err.message))
            }
            MessageType::Request => Err(WorkflowError::Frame(FrameError::InvalidMessageType(
                MessageType::Request as u16,
            ))),
        }
    }
}

#[async_trait]
impl WorkflowClient for TcpWorkflowClient {
    async fn submit(&self, identity: &str, input: WorkflowInput) -> Result<WorkflowOutcome> {
        debug!(identity = %identity, addr = %self.addr, "Submitting workflow");
        let response = self
            .call(&WireRequest::Submit {
                identity: identity.to_string(),
                input,
            })
            .await?;
        Ok(response.decode()?)
    }

    async fn cancel(&self, identity: &str) -> Result<()> {
        debug!(identity = %identity, addr = %self.addr, "Cancelling workflow");
        self.call(&WireRequest::Cancel {
            identity: identity.to_string(),
        })
        .await?;
        Ok(())
    }
}

/// In-process workflow runtime for tests.
///
/// Outcomes are scripted in submission order; repeated submissions of an
/// identity return the recorded result without counting a new execution,
/// matching the runtime's deduplication contract.
#[derive(Default)]
pub struct FakeWorkflowClient {
    scripted: Mutex<Vec<WorkflowOutcome>>,
    completed: Mutex<HashMap<String, WorkflowOutcome>>,
    executions: Mutex<Vec<String>>,
    cancelled: Mutex<Vec<String>>,
}

impl FakeWorkflowClient {
    /// Create a fake with no scripted outcomes (everything succeeds).
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the outcome of the next unseen submission.
    pub async fn push_outcome(&self, outcome: WorkflowOutcome) {
        self.scripted.lock().await.push(outcome);
    }

    /// Identities that actually executed (deduplicated submissions excluded).
    pub async fn executions(&self) -> Vec<String> {
        self.executions.lock().await.clone()
    }

    /// Identities that were cancelled.
    pub async fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().await.clone()
    }
}

#[async_trait]
impl WorkflowClient for FakeWorkflowClient {
    async fn submit(&self, identity: &str, _input: WorkflowInput) -> Result<WorkflowOutcome> {
        let mut completed = self.completed.lock().await;
        if let Some(previous) = completed.get(identity) {
            return Ok(previous.clone());
        }

        let mut scripted = self.scripted.lock().await;
        let outcome = if scripted.is_empty() {
            WorkflowOutcome::succeeded(None)
        } else {
            scripted.remove(0)
        };
        drop(scripted);

        self.executions.lock().await.push(identity.to_string());
        completed.insert(identity.to_string(), outcome.clone());
        Ok(outcome)
    }

    async fn cancel(&self, identity: &str) -> Result<()> {
        self.cancelled.lock().await.push(identity.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    fn input() -> WorkflowInput {
        WorkflowInput {
            job_id: 1,
            attempt_number: 0,
            workspace: PathBuf::from("/workspace/1/0"),
            config: json!({"configType": "SYNC"}),
        }
    }

    #[tokio::test]
    async fn test_fake_deduplicates_by_identity() {
        let fake = FakeWorkflowClient::new();
        fake.push_outcome(WorkflowOutcome::failed("boom")).await;

        let first = fake.submit("connection-x-1-0", input()).await.unwrap();
        assert!(!first.success);

        // Same identity again: same result, no new execution.
        let second = fake.submit("connection-x-1-0", input()).await.unwrap();
        assert!(!second.success);
        assert_eq!(fake.executions().await, vec!["connection-x-1-0"]);
    }

    #[tokio::test]
    async fn test_fake_defaults_to_success() {
        let fake = FakeWorkflowClient::new();
        let outcome = fake.submit("connection-x-2-0", input()).await.unwrap();
        assert!(outcome.success);
    }

    /// Minimal in-test runtime: answers one submit with a canned outcome.
    async fn spawn_runtime(outcome: WorkflowOutcome) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let request = read_frame(&mut stream).await.unwrap();
            let parsed: WireRequest = request.decode().unwrap();
            match parsed {
                WireRequest::Submit { .. } => {
                    write_frame(&mut stream, &Frame::response(&outcome).unwrap())
                        .await
                        .unwrap();
                }
                WireRequest::Cancel { .. } => {
                    write_frame(&mut stream, &Frame::response(&json!({})).unwrap())
                        .await
                        .unwrap();
                }
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_tcp_client_submit_round_trip() {
        let addr = spawn_runtime(WorkflowOutcome::succeeded(Some(json!({"records": 10})))).await;
        let client = TcpWorkflowClient::new(addr);

        let outcome = client.submit("connection-x-3-0", input()).await.unwrap();
        assert!(outcome.success);
        assert_eq!(outcome.output.unwrap()["records"], 10);
    }

    #[tokio::test]
    async fn test_tcp_client_unreachable_runtime() {
        let client = TcpWorkflowClient::new("127.0.0.1:1");
        let err = client.submit("connection-x-4-0", input()).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unreachable { .. }));
    }

    #[test]
    fn test_default_port_appended() {
        let client = TcpWorkflowClient::new("temporal-host");
        assert_eq!(client.addr, "temporal-host:7233");
        let explicit = TcpWorkflowClient::new("temporal-host:9999");
        assert_eq!(explicit.addr, "temporal-host:9999");
    }
}
