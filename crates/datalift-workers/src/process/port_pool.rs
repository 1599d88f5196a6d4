// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Bounded pool of worker ports.
//!
//! The Kubernetes process factory needs one host port per live worker pod for
//! the stdio relay. The pool is the back-pressure mechanism: when every port
//! is leased, `acquire` blocks until a pod is destroyed and its port returns.

use std::collections::VecDeque;

use tokio::sync::{Mutex, Notify};
use tracing::debug;

/// Bounded blocking pool of worker ports.
pub struct WorkerPortPool {
    ports: Mutex<VecDeque<u16>>,
    returned: Notify,
}

impl WorkerPortPool {
    /// Create a pool over the given ports.
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: Mutex::new(ports.into_iter().collect()),
            returned: Notify::new(),
        }
    }

    /// Take a port, waiting until one is available.
    pub async fn acquire(&self) -> u16 {
        loop {
            {
                let mut ports = self.ports.lock().await;
                if let Some(port) = ports.pop_front() {
                    debug!(port = port, remaining = ports.len(), "Leased worker port");
                    return port;
                }
            }
            self.returned.notified().await;
        }
    }

    /// Take a port without waiting.
    pub async fn try_acquire(&self) -> Option<u16> {
        self.ports.lock().await.pop_front()
    }

    /// Return a port to the pool.
    pub async fn release(&self, port: u16) {
        let mut ports = self.ports.lock().await;
        ports.push_back(port);
        debug!(port = port, available = ports.len(), "Returned worker port");
        drop(ports);
        self.returned.notify_one();
    }

    /// Number of ports currently available.
    pub async fn available(&self) -> usize {
        self.ports.lock().await.len()
    }
}
