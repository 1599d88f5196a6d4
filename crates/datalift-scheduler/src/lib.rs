// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Datalift scheduler - the orchestration core of the platform.
//!
//! A long-running service that discovers which data-sync jobs are due,
//! submits them for execution, retries them under a backoff policy, cleans
//! up their on-disk artifacts, and reaps jobs orphaned by prior crashes.
//!
//! # Architecture
//!
//! ```text
//!  config store ──► JobScheduler ──► jobs (PENDING)
//!                                        │
//!  JobRetrier ◄── INCOMPLETE ◄───────────┤
//!      │                                 ▼
//!      └─► PENDING ──────────────► JobSubmitter ──► workflow runtime
//!                                        │               │ dispatch
//!                                        ▼               ▼
//!                                   attempts ◄──── worker containers
//! ```
//!
//! The database is the system of record; every cross-thread coordination
//! flows through committed state. A job's status is a deterministic function
//! of its attempts, and for any connection at most one non-terminal sync job
//! exists at any time.
//!
//! # Job Status State Machine
//!
//! ```text
//!   PENDING ──submit──► RUNNING ──fail──► INCOMPLETE ──retry──► PENDING
//!      │                   │                   │
//!      │                succeed            budget spent
//!   cancel                 │                   │
//!      │                   ▼                   ▼
//!      └─────────────► CANCELLED / SUCCEEDED / FAILED   (terminal)
//! ```
//!
//! # Modules
//!
//! - [`config`]: environment configuration
//! - [`models`]: connections, jobs, attempts
//! - [`persistence`]: transactional job store (Postgres, SQLite)
//! - [`config_repository`]: read-through file-based config store access
//! - [`scheduler`], [`retrier`], [`submitter`], [`cleaner`]: the periodic
//!   components driven by [`app::SchedulerApp`]
//! - [`notifier`], [`tracker`]: failure notifications and lifecycle events
//! - [`version`]: application/database compatibility gate

#![deny(missing_docs)]

/// Application driver: startup sequencing, loops, graceful shutdown.
pub mod app;

/// Workspace cleaner.
pub mod cleaner;

/// Environment configuration.
pub mod config;

/// Config store accessor.
pub mod config_repository;

/// Error types.
pub mod error;

/// Domain model.
pub mod models;

/// Failure notifications.
pub mod notifier;

/// Job persistence.
pub mod persistence;

/// Job retrier.
pub mod retrier;

/// Job scheduler.
pub mod scheduler;

/// Job submitter.
pub mod submitter;

/// Lifecycle tracking events.
pub mod tracker;

/// Version compatibility.
pub mod version;

pub use config::Config;
pub use error::{Result, SchedulerError};
