// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Application/database version compatibility.
//!
//! The config server stamps the platform version into the database after
//! running migrations. The scheduler refuses to start against a database
//! whose major.minor differs from its own; patch releases interoperate.

use crate::error::{Result, SchedulerError};

/// Version string that bypasses the compatibility check.
const DEV_VERSION: &str = "dev";

/// Assert that the application can run against the persisted version.
pub fn assert_compatible(app_version: &str, db_version: &str) -> Result<()> {
    if is_compatible(app_version, db_version) {
        Ok(())
    } else {
        Err(SchedulerError::VersionMismatch {
            app: app_version.to_string(),
            db: db_version.to_string(),
        })
    }
}

/// Whether two versions agree on major.minor (or either side is `dev`).
pub fn is_compatible(app_version: &str, db_version: &str) -> bool {
    if app_version == DEV_VERSION || db_version == DEV_VERSION {
        return true;
    }
    match (major_minor(app_version), major_minor(db_version)) {
        (Some(app), Some(db)) => app == db,
        _ => false,
    }
}

fn major_minor(version: &str) -> Option<(u64, u64)> {
    let mut parts = version.trim().split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}
