// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Liveness signal between the scheduler host and ephemeral worker pods.
//!
//! The scheduler runs [`HeartbeatServer`], a minimal HTTP endpoint that
//! answers `200 OK` to any `GET /`. Worker pod sidecars poll it and
//! self-terminate after three consecutive misses, so pods never outlive a
//! crashed scheduler. [`HeartbeatProbe`] is the client-side check used by
//! diagnostics and tests.

use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::http::StatusCode;
use axum::routing::get;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tracing::info;

/// Default heartbeat port, `KUBE_HEARTBEAT_PORT`.
pub const KUBE_HEARTBEAT_PORT: u16 = 9000;

/// HTTP server answering worker heartbeat probes.
pub struct HeartbeatServer {
    port: u16,
    shutdown: Arc<Notify>,
}

impl HeartbeatServer {
    /// Create a server listening on the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Serve until the shutdown handle is notified.
    pub async fn serve(&self) -> std::io::Result<()> {
        let app = Router::new().route("/", get(|| async { StatusCode::OK }));
        let listener = TcpListener::bind(SocketAddr::from(([0, 0, 0, 0], self.port))).await?;
        info!(port = self.port, "Heartbeat server listening");

        let shutdown = self.shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.notified().await })
            .await?;

        info!(port = self.port, "Heartbeat server stopped");
        Ok(())
    }
}

/// Client-side heartbeat check.
pub struct HeartbeatProbe {
    client: reqwest::Client,
    url: String,
}

impl HeartbeatProbe {
    /// Probe the heartbeat endpoint at `<host>:<port>`.
    pub fn new(heartbeat_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: format!("http://{}/", heartbeat_url.trim_end_matches('/')),
        }
    }

    /// Whether the scheduler answered with any 2xx within the timeout.
    pub async fn check(&self, timeout: Duration) -> bool {
        match self.client.get(&self.url).timeout(timeout).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// Best-effort local IP discovery for the heartbeat URL handed to pods.
///
/// Opens a UDP socket towards a public address (nothing is sent) and reads
/// the chosen source address. Falls back to loopback when the host has no
/// route.
pub fn local_ip() -> IpAddr {
    UdpSocket::bind("0.0.0.0:0")
        .and_then(|socket| {
            socket.connect("8.8.8.8:53")?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}
