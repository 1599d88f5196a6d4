// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Domain model: connections, jobs, attempts, and their configuration.
//!
//! A connection describes "replicate from source S to destination D on
//! schedule X". Each invocation of work for a connection is a job; each
//! execution try of a job is an attempt. A job's status is a deterministic
//! function of its attempts, and terminal statuses are immutable.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// Job status
// ============================================================================

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// No attempts yet; eligible for the submitter.
    Pending,
    /// Last attempt is running.
    Running,
    /// Last attempt failed; retrier decides what happens next.
    Incomplete,
    /// Terminal failure (retry budget exhausted).
    Failed,
    /// Terminal success.
    Succeeded,
    /// Terminal cancellation (user action or zombie reaping).
    Cancelled,
}

impl JobStatus {
    /// All statuses from which no transition is permitted.
    pub const TERMINAL: [JobStatus; 3] = [JobStatus::Failed, JobStatus::Succeeded, JobStatus::Cancelled];

    /// Whether this status is terminal.
    pub fn is_terminal(self) -> bool {
        Self::TERMINAL.contains(&self)
    }

    /// Uppercase database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Incomplete => "INCOMPLETE",
            JobStatus::Failed => "FAILED",
            JobStatus::Succeeded => "SUCCEEDED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "INCOMPLETE" => Ok(JobStatus::Incomplete),
            "FAILED" => Ok(JobStatus::Failed),
            "SUCCEEDED" => Ok(JobStatus::Succeeded),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Lifecycle status of an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptStatus {
    /// The workflow runtime is executing this attempt.
    Running,
    /// The attempt failed.
    Failed,
    /// The attempt succeeded.
    Succeeded,
}

impl AttemptStatus {
    /// Uppercase database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            AttemptStatus::Running => "RUNNING",
            AttemptStatus::Failed => "FAILED",
            AttemptStatus::Succeeded => "SUCCEEDED",
        }
    }
}

impl FromStr for AttemptStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RUNNING" => Ok(AttemptStatus::Running),
            "FAILED" => Ok(AttemptStatus::Failed),
            "SUCCEEDED" => Ok(AttemptStatus::Succeeded),
            other => Err(format!("unknown attempt status: {}", other)),
        }
    }
}

// ============================================================================
// Job configuration
// ============================================================================

/// Kind of work a job performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobConfigType {
    /// Replicate data from source to destination.
    Sync,
    /// Wipe the destination and resync from scratch.
    ResetConnection,
    /// Fetch a connector's specification.
    GetSpec,
    /// Validate a connector configuration.
    CheckConnection,
    /// Discover the source's catalog.
    DiscoverSchema,
}

impl JobConfigType {
    /// Uppercase database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            JobConfigType::Sync => "SYNC",
            JobConfigType::ResetConnection => "RESET_CONNECTION",
            JobConfigType::GetSpec => "GET_SPEC",
            JobConfigType::CheckConnection => "CHECK_CONNECTION",
            JobConfigType::DiscoverSchema => "DISCOVER_SCHEMA",
        }
    }
}

impl fmt::Display for JobConfigType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload describing the work of one job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "configType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobConfig {
    /// Replication job.
    Sync(JobSyncConfig),
    /// Reset job; runs the sync machinery against an empty catalog.
    ResetConnection(JobSyncConfig),
    /// Spec fetch.
    GetSpec(JobGetSpecConfig),
    /// Connection check.
    CheckConnection(JobCheckConnectionConfig),
    /// Catalog discovery.
    DiscoverSchema(JobDiscoverCatalogConfig),
}

impl JobConfig {
    /// The config type tag of this payload.
    pub fn config_type(&self) -> JobConfigType {
        match self {
            JobConfig::Sync(_) => JobConfigType::Sync,
            JobConfig::ResetConnection(_) => JobConfigType::ResetConnection,
            JobConfig::GetSpec(_) => JobConfigType::GetSpec,
            JobConfig::CheckConnection(_) => JobConfigType::CheckConnection,
            JobConfig::DiscoverSchema(_) => JobConfigType::DiscoverSchema,
        }
    }
}

/// Configuration of a sync (or reset) job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSyncConfig {
    /// Source connector image (repository:tag).
    pub source_docker_image: String,
    /// Destination connector image (repository:tag).
    pub destination_docker_image: String,
    /// Source connector configuration blob.
    pub source_configuration: Value,
    /// Destination connector configuration blob.
    pub destination_configuration: Value,
    /// Configured catalog of streams to replicate.
    pub configured_catalog: Value,
    /// Replication state carried over from the previous sync.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
}

/// Configuration of a spec-fetch job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobGetSpecConfig {
    /// Connector image to interrogate.
    pub docker_image: String,
}

/// Configuration of a connection-check job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCheckConnectionConfig {
    /// Connector image to run.
    pub docker_image: String,
    /// Connector configuration under test.
    pub connection_configuration: Value,
}

/// Configuration of a catalog-discovery job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobDiscoverCatalogConfig {
    /// Connector image to run.
    pub docker_image: String,
    /// Connector configuration to discover with.
    pub connection_configuration: Value,
}

// ============================================================================
// Attempt output
// ============================================================================

/// Output payload of a successful attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "outputType", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AttemptOutput {
    /// Replication summary.
    Sync(SyncSummary),
    /// Connector specification document.
    Spec(Value),
    /// Connection check verdict.
    CheckConnection(CheckConnectionOutput),
    /// Discovered catalog.
    DiscoverCatalog(Value),
}

/// Summary of one replication run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSummary {
    /// Records moved from source to destination.
    pub records_synced: i64,
    /// Bytes moved from source to destination.
    pub bytes_synced: i64,
    /// When replication started.
    pub started_at: DateTime<Utc>,
    /// When replication ended.
    pub ended_at: DateTime<Utc>,
}

/// Result of a connection check.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckConnectionOutput {
    /// Whether the connector accepted the configuration.
    pub succeeded: bool,
    /// Connector-provided message, usually on failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

// ============================================================================
// Jobs and attempts
// ============================================================================

/// One invocation of work for a connection.
#[derive(Debug, Clone)]
pub struct Job {
    /// Monotonic job id.
    pub id: i64,
    /// Connection the job belongs to.
    pub scope: Uuid,
    /// Work payload.
    pub config: JobConfig,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Attempts ordered by number.
    pub attempts: Vec<Attempt>,
}

impl Job {
    /// The config type of this job.
    pub fn config_type(&self) -> JobConfigType {
        self.config.config_type()
    }

    /// The most recent attempt, if any.
    pub fn last_attempt(&self) -> Option<&Attempt> {
        self.attempts.last()
    }

    /// Number of failed attempts so far.
    pub fn failed_attempt_count(&self) -> usize {
        self.attempts
            .iter()
            .filter(|a| a.status == AttemptStatus::Failed)
            .count()
    }

    /// When the job finished, for cadence computation: the newest attempt's
    /// `ended_at`, falling back to the job's `updated_at`.
    pub fn ended_at(&self) -> Option<DateTime<Utc>> {
        if !self.status.is_terminal() {
            return None;
        }
        self.attempts
            .iter()
            .filter_map(|a| a.ended_at)
            .max()
            .or(Some(self.updated_at))
    }
}

/// One execution try of a job.
#[derive(Debug, Clone)]
pub struct Attempt {
    /// Owning job.
    pub job_id: i64,
    /// Dense attempt number starting at 0.
    pub number: i32,
    /// Current status.
    pub status: AttemptStatus,
    /// Per-attempt workspace directory (`<root>/<job>/<attempt>`).
    pub log_path: PathBuf,
    /// Output payload of a finished attempt.
    pub output: Option<AttemptOutput>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// When the attempt reached a terminal status.
    pub ended_at: Option<DateTime<Utc>>,
}

// ============================================================================
// Connections
// ============================================================================

/// Activation state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionStatus {
    /// Eligible for scheduling.
    Active,
    /// Retained but never scheduled.
    Inactive,
}

/// Time unit of a periodic schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleTimeUnit {
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
    /// Days.
    Days,
    /// Weeks.
    Weeks,
    /// Months (approximated as 30 days).
    Months,
}

/// Periodic schedule: run every `units` x `time_unit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schedule {
    /// Multiplier on the time unit.
    pub units: i64,
    /// Base time unit.
    pub time_unit: ScheduleTimeUnit,
}

impl Schedule {
    /// The schedule interval as a duration.
    pub fn interval(&self) -> Duration {
        let unit_seconds: u64 = match self.time_unit {
            ScheduleTimeUnit::Minutes => 60,
            ScheduleTimeUnit::Hours => 3600,
            ScheduleTimeUnit::Days => 86_400,
            ScheduleTimeUnit::Weeks => 7 * 86_400,
            ScheduleTimeUnit::Months => 30 * 86_400,
        };
        Duration::from_secs(self.units.max(0) as u64 * unit_seconds)
    }
}

/// A persistent description of "replicate from source S to destination D on
/// schedule X". Stored in the config store as `STANDARD_SYNC/<uuid>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    /// Stable connection identity.
    pub connection_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Source config reference.
    pub source_id: Uuid,
    /// Destination config reference.
    pub destination_id: Uuid,
    /// Activation state.
    pub status: ConnectionStatus,
    /// Periodic schedule; `None` means manual.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Schedule>,
    /// Configured catalog of streams to replicate.
    pub catalog: Value,
}

impl Connection {
    /// Whether the connection is only synced on demand.
    pub fn is_manual(&self) -> bool {
        self.schedule.is_none()
    }
}

// ============================================================================
// Config store documents
// ============================================================================

/// Source connector instance configuration (`SOURCE_CONNECTION/<uuid>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConnection {
    /// Stable source identity.
    pub source_id: Uuid,
    /// Definition reference for image resolution.
    pub source_definition_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Connector-specific configuration blob.
    pub configuration: Value,
}

/// Destination connector instance configuration
/// (`DESTINATION_CONNECTION/<uuid>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationConnection {
    /// Stable destination identity.
    pub destination_id: Uuid,
    /// Definition reference for image resolution.
    pub destination_definition_id: Uuid,
    /// Human-readable name.
    pub name: String,
    /// Connector-specific configuration blob.
    pub configuration: Value,
}

/// Source connector definition (`STANDARD_SOURCE_DEFINITION/<uuid>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceDefinition {
    /// Definition identity.
    pub source_definition_id: Uuid,
    /// Connector name.
    pub name: String,
    /// Image repository.
    pub docker_repository: String,
    /// Image tag.
    pub docker_image_tag: String,
}

impl SourceDefinition {
    /// Full image reference.
    pub fn image(&self) -> String {
        format!("{}:{}", self.docker_repository, self.docker_image_tag)
    }
}

/// Destination connector definition
/// (`STANDARD_DESTINATION_DEFINITION/<uuid>.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestinationDefinition {
    /// Definition identity.
    pub destination_definition_id: Uuid,
    /// Connector name.
    pub name: String,
    /// Image repository.
    pub docker_repository: String,
    /// Image tag.
    pub docker_image_tag: String,
}

impl DestinationDefinition {
    /// Full image reference.
    pub fn image(&self) -> String {
        format!("{}:{}", self.docker_repository, self.docker_image_tag)
    }
}

/// Deterministic workflow identity for an attempt, used by the runtime to
/// deduplicate submissions.
pub fn workflow_identity(scope: Uuid, job_id: i64, attempt_number: i32) -> String {
    format!("connection-{}-{}-{}", scope, job_id, attempt_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_terminal_statuses() {
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(!JobStatus::Incomplete.is_terminal());
    }

    #[test]
    fn test_status_string_round_trip() {
        for status in [
            JobStatus::Pending,
            JobStatus::Running,
            JobStatus::Incomplete,
            JobStatus::Failed,
            JobStatus::Succeeded,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert!("pending".parse::<JobStatus>().is_err());
    }

    #[test]
    fn test_job_config_tagging() {
        let config = JobConfig::GetSpec(JobGetSpecConfig {
            docker_image: "airbyte/source-postgres:0.1.0".to_string(),
        });
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["configType"], "GET_SPEC");

        let parsed: JobConfig = serde_json::from_value(value).unwrap();
        assert_eq!(parsed.config_type(), JobConfigType::GetSpec);
    }

    #[test]
    fn test_schedule_intervals() {
        let hourly = Schedule {
            units: 1,
            time_unit: ScheduleTimeUnit::Hours,
        };
        assert_eq!(hourly.interval(), Duration::from_secs(3600));

        let biweekly = Schedule {
            units: 2,
            time_unit: ScheduleTimeUnit::Weeks,
        };
        assert_eq!(biweekly.interval(), Duration::from_secs(14 * 86_400));
    }

    #[test]
    fn test_connection_manual_when_schedule_absent() {
        let connection: Connection = serde_json::from_value(json!({
            "connectionId": Uuid::new_v4(),
            "name": "pg to bq",
            "sourceId": Uuid::new_v4(),
            "destinationId": Uuid::new_v4(),
            "status": "ACTIVE",
            "catalog": {"streams": []},
        }))
        .unwrap();
        assert!(connection.is_manual());
    }

    #[test]
    fn test_job_ended_at_prefers_attempt_end() {
        let t0 = Utc::now();
        let t1 = t0 + chrono::Duration::minutes(5);
        let job = Job {
            id: 1,
            scope: Uuid::new_v4(),
            config: JobConfig::GetSpec(JobGetSpecConfig {
                docker_image: "x:y".to_string(),
            }),
            status: JobStatus::Succeeded,
            created_at: t0,
            updated_at: t1 + chrono::Duration::seconds(2),
            attempts: vec![Attempt {
                job_id: 1,
                number: 0,
                status: AttemptStatus::Succeeded,
                log_path: PathBuf::from("/workspace/1/0"),
                output: None,
                created_at: t0,
                updated_at: t1,
                ended_at: Some(t1),
            }],
        };
        assert_eq!(job.ended_at(), Some(t1));
    }

    #[test]
    fn test_job_ended_at_none_while_non_terminal() {
        let job = Job {
            id: 1,
            scope: Uuid::new_v4(),
            config: JobConfig::GetSpec(JobGetSpecConfig {
                docker_image: "x:y".to_string(),
            }),
            status: JobStatus::Running,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            attempts: vec![],
        };
        assert_eq!(job.ended_at(), None);
    }

    #[test]
    fn test_workflow_identity_format() {
        let scope = Uuid::nil();
        assert_eq!(
            workflow_identity(scope, 17, 2),
            "connection-00000000-0000-0000-0000-000000000000-17-2"
        );
    }

    #[test]
    fn test_attempt_output_tagging() {
        let output = AttemptOutput::CheckConnection(CheckConnectionOutput {
            succeeded: false,
            message: Some("bad credentials".to_string()),
        });
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["outputType"], "CHECK_CONNECTION");
        assert_eq!(value["succeeded"], false);
    }
}
