// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker pool attached to the workflow runtime.
//!
//! The runtime owns ordering and durable state; attempt execution happens on
//! the scheduler host. The pool opens an outbound connection to the runtime,
//! registers as an attempt worker, and serves `run_attempt` dispatches with
//! the [`AttemptRunner`] until shut down. Lost connections are re-dialed
//! with a fixed backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::runs::{AttemptRunner, CancelToken};
use crate::workflow::WorkflowInput;
use crate::workflow::frame::{Frame, FrameError, MessageType, read_frame, write_frame};

/// Task queue name this pool registers under.
const ATTEMPT_QUEUE: &str = "datalift-attempts";
/// Backoff between reconnection attempts.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Attempt dispatch received from the runtime.
#[derive(Debug, Deserialize)]
struct Dispatch {
    identity: String,
    input: WorkflowInput,
}

/// Serves attempt executions dispatched by the workflow runtime.
pub struct WorkerPool {
    runtime_addr: String,
    runner: Arc<AttemptRunner>,
    cancel: CancelToken,
    shutdown: Arc<Notify>,
}

impl WorkerPool {
    /// Create a pool dialing the runtime at the given address.
    pub fn new(runtime_addr: impl Into<String>, runner: Arc<AttemptRunner>) -> Self {
        Self {
            runtime_addr: runtime_addr.into(),
            runner,
            cancel: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Cancellation token observed by in-flight attempts.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the pool loop until shut down.
    pub async fn run(&self) {
        info!(runtime_addr = %self.runtime_addr, queue = ATTEMPT_QUEUE, "Worker pool started");
        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => break,

                result = self.serve_connection() => {
                    match result {
                        Ok(()) => info!("Runtime closed the worker connection"),
                        Err(e) => warn!(error = %e, "Worker connection failed"),
                    }
                    tokio::select! {
                        biased;
                        _ = self.shutdown.notified() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            }
        }

        // Cooperative cancellation for anything still in flight.
        self.cancel.store(true, Ordering::Relaxed);
        info!("Worker pool stopped");
    }

    async fn serve_connection(&self) -> Result<(), FrameError> {
        let mut stream = TcpStream::connect(&self.runtime_addr).await?;
        write_frame(
            &mut stream,
            &Frame::request(&json!({"kind": "register_worker", "queue": ATTEMPT_QUEUE}))?,
        )
        .await?;
        info!(runtime_addr = %self.runtime_addr, "Registered with workflow runtime");

        loop {
            let frame = read_frame(&mut stream).await?;
            if frame.message_type != MessageType::Request {
                warn!(message_type = ?frame.message_type, "Ignoring unexpected frame");
                continue;
            }
            let dispatch: Dispatch = frame.decode()?;
            info!(
                identity = %dispatch.identity,
                job_id = dispatch.input.job_id,
                attempt = dispatch.input.attempt_number,
                "Executing dispatched attempt"
            );
            let outcome = self
                .runner
                .run(&dispatch.input, Some(self.cancel.clone()))
                .await;
            write_frame(&mut stream, &Frame::response(&outcome)?).await?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessFactory, ProcessSpec, Result as ProcessResult, WorkerProcess};
    use crate::workflow::WorkflowOutcome;
    use async_trait::async_trait;
    use std::path::PathBuf;
    use tokio::net::TcpListener;

    /// Factory for dispatches that never reach a process.
    struct UnreachableFactory;

    #[async_trait]
    impl ProcessFactory for UnreachableFactory {
        fn factory_type(&self) -> &'static str {
            "unreachable"
        }

        async fn create(&self, _spec: ProcessSpec) -> ProcessResult<Box<dyn WorkerProcess>> {
            unreachable!("dispatch should fail before launching a process");
        }
    }

    #[tokio::test]
    async fn test_pool_registers_and_serves_dispatch() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let runtime = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let register = read_frame(&mut stream).await.unwrap();
            let register: serde_json::Value = register.decode().unwrap();
            assert_eq!(register["kind"], "register_worker");
            assert_eq!(register["queue"], "datalift-attempts");

            // Dispatch an attempt with an unreadable config; the worker must
            // answer with a failed outcome rather than dying.
            let dispatch = json!({
                "identity": "connection-x-1-0",
                "input": {
                    "job_id": 1,
                    "attempt_number": 0,
                    "workspace": "/workspace/1/0",
                    "config": {"configType": "MAKE_COFFEE"},
                },
            });
            write_frame(&mut stream, &Frame::request(&dispatch).unwrap())
                .await
                .unwrap();

            let response = read_frame(&mut stream).await.unwrap();
            assert_eq!(response.message_type, MessageType::Response);
            let outcome: WorkflowOutcome = response.decode().unwrap();
            assert!(!outcome.success);
            assert!(outcome.failure.unwrap().contains("unreadable job config"));
        });

        let pool = WorkerPool::new(
            addr,
            Arc::new(AttemptRunner::new(Arc::new(UnreachableFactory))),
        );
        let shutdown = pool.shutdown_handle();
        let pool_task = tokio::spawn(async move { pool.run().await });

        runtime.await.unwrap();
        shutdown.notify_one();
        let _ = pool_task.await;
    }

    #[test]
    fn test_dispatch_deserializes_workspace_path() {
        let dispatch: Dispatch = serde_json::from_value(json!({
            "identity": "connection-x-2-1",
            "input": {
                "job_id": 2,
                "attempt_number": 1,
                "workspace": "/workspace/2/1",
                "config": {},
            },
        }))
        .unwrap();
        assert_eq!(dispatch.identity, "connection-x-2-1");
        assert_eq!(dispatch.input.workspace, PathBuf::from("/workspace/2/1"));
    }
}
