// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace cleaner.
//!
//! Attempt workspaces (`<root>/<job>/<attempt>`) hold logs and transient
//! state. They are kept for debugging and reclaimed here under the retention
//! policy: anything past the maximum age goes; beyond the size budget the
//! oldest directories that have passed the minimum age go too. Workspaces of
//! non-terminal jobs are never touched, and per-directory failures are
//! logged, never fatal.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::WorkspaceRetention;
use crate::error::Result;
use crate::models::JobStatus;
use crate::persistence::JobPersistence;

/// One attempt workspace directory on disk.
#[derive(Debug)]
struct WorkspaceEntry {
    job_id: i64,
    path: PathBuf,
    modified: DateTime<Utc>,
    size_bytes: u64,
}

/// Deletes workspace directories past retention.
pub struct JobCleaner {
    retention: WorkspaceRetention,
    workspace_root: PathBuf,
    persistence: Arc<dyn JobPersistence>,
}

impl JobCleaner {
    /// Create a new cleaner.
    pub fn new(
        retention: WorkspaceRetention,
        workspace_root: PathBuf,
        persistence: Arc<dyn JobPersistence>,
    ) -> Self {
        Self {
            retention,
            workspace_root,
            persistence,
        }
    }

    /// Run one cleaning sweep.
    pub async fn run(&self) -> Result<()> {
        self.sweep_at(Utc::now()).await
    }

    /// Run one cleaning sweep evaluating ages against the given clock.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<()> {
        let protected = self.non_terminal_job_ids().await?;
        let mut entries = self.scan_workspaces().await?;

        let mut deleted = 0u64;
        let mut errors = 0u64;

        // Age pass: everything past max_age goes.
        let max_age = chrono::Duration::from_std(self.retention.max_age).unwrap_or_default();
        let mut survivors = Vec::new();
        for entry in entries.drain(..) {
            if protected.contains(&entry.job_id) {
                continue;
            }
            if now - entry.modified > max_age {
                match remove_workspace(&entry.path).await {
                    Ok(()) => deleted += 1,
                    Err(_) => errors += 1,
                }
            } else {
                survivors.push(entry);
            }
        }

        // Size pass: newest first, delete the overflow that is old enough.
        let min_age = chrono::Duration::from_std(self.retention.min_age).unwrap_or_default();
        survivors.sort_by(|a, b| b.modified.cmp(&a.modified));
        let mut cumulative: u64 = 0;
        for entry in survivors {
            cumulative = cumulative.saturating_add(entry.size_bytes);
            if cumulative > self.retention.max_size_bytes && now - entry.modified > min_age {
                match remove_workspace(&entry.path).await {
                    Ok(()) => deleted += 1,
                    Err(_) => errors += 1,
                }
            }
        }

        self.remove_empty_job_dirs().await;

        if deleted > 0 || errors > 0 {
            info!(deleted = deleted, errors = errors, "Workspace cleaning sweep completed");
        } else {
            debug!("Workspace cleaning sweep completed, nothing to reclaim");
        }
        Ok(())
    }

    async fn non_terminal_job_ids(&self) -> Result<HashSet<i64>> {
        let mut protected = HashSet::new();
        for status in [JobStatus::Pending, JobStatus::Running, JobStatus::Incomplete] {
            for job in self.persistence.list_jobs_with_status(status).await? {
                protected.insert(job.id);
            }
        }
        Ok(protected)
    }

    /// Collect every `<root>/<job>/<attempt>` directory with its age and size.
    async fn scan_workspaces(&self) -> Result<Vec<WorkspaceEntry>> {
        let mut entries = Vec::new();
        let mut job_dirs = match tokio::fs::read_dir(&self.workspace_root).await {
            Ok(dirs) => dirs,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(e) => return Err(e.into()),
        };

        while let Some(job_entry) = job_dirs.next_entry().await? {
            let job_path = job_entry.path();
            if !job_path.is_dir() {
                continue;
            }
            let Some(job_id) = job_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<i64>().ok())
            else {
                continue;
            };

            let mut attempt_dirs = match tokio::fs::read_dir(&job_path).await {
                Ok(dirs) => dirs,
                Err(e) => {
                    warn!(path = %job_path.display(), error = %e, "Failed to read job directory");
                    continue;
                }
            };
            while let Ok(Some(attempt_entry)) = attempt_dirs.next_entry().await {
                let path = attempt_entry.path();
                if !path.is_dir() {
                    continue;
                }
                let modified = match tokio::fs::metadata(&path)
                    .await
                    .and_then(|m| m.modified())
                {
                    Ok(time) => DateTime::<Utc>::from(time),
                    Err(e) => {
                        warn!(path = %path.display(), error = %e, "Failed to stat workspace");
                        continue;
                    }
                };
                let size_bytes = directory_size(&path).await;
                entries.push(WorkspaceEntry {
                    job_id,
                    path,
                    modified,
                    size_bytes,
                });
            }
        }
        Ok(entries)
    }

    /// Drop job directories left empty by the sweep.
    async fn remove_empty_job_dirs(&self) {
        let Ok(mut job_dirs) = tokio::fs::read_dir(&self.workspace_root).await else {
            return;
        };
        while let Ok(Some(job_entry)) = job_dirs.next_entry().await {
            let path = job_entry.path();
            if path.is_dir() {
                // Fails on non-empty directories, which is the point.
                let _ = tokio::fs::remove_dir(&path).await;
            }
        }
    }
}

async fn remove_workspace(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Ok(()) => {
            debug!(path = %path.display(), "Removed workspace");
            Ok(())
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to remove workspace");
            Err(e)
        }
    }
}

/// Recursive directory size, best-effort.
async fn directory_size(root: &Path) -> u64 {
    let mut total = 0u64;
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let Ok(mut entries) = tokio::fs::read_dir(&dir).await else {
            continue;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let Ok(metadata) = entry.metadata().await else {
                continue;
            };
            if metadata.is_dir() {
                stack.push(entry.path());
            } else {
                total = total.saturating_add(metadata.len());
            }
        }
    }
    total
}
