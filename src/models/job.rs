//! Job domain models and DTOs.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};

/// Scheduler-observable job state.
///
/// `Running` is the only non-terminal state; every other value is reached
/// through a single stop transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Timeout,
    Preempted,
    OutOfMemory,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Stopped => "stopped",
            Self::Timeout => "timeout",
            Self::Preempted => "preempted",
            Self::OutOfMemory => "out_of_memory",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            "cancelled" => Some(Self::Cancelled),
            "stopped" => Some(Self::Stopped),
            "timeout" => Some(Self::Timeout),
            "preempted" => Some(Self::Preempted),
            "out_of_memory" => Some(Self::OutOfMemory),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Central valid-transition predicate: only `running -> terminal` is allowed.
    pub fn may_transition_to(&self, next: JobState) -> bool {
        matches!(self, Self::Running) && next.is_terminal()
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Archival pipeline status kept next to the job state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum MonitoringStatus {
    /// Monitoring was never enabled for this job.
    Disabled,
    /// Job is running, or stopped and queued for archival.
    RunningOrArchiving,
    /// Archival attempted and failed; retry requires re-enqueue.
    ArchivingFailed,
    /// Archive blobs are durable and aggregates are persisted.
    ArchivingSuccessful,
}

impl MonitoringStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Disabled => "disabled",
            Self::RunningOrArchiving => "running_or_archiving",
            Self::ArchivingFailed => "archiving_failed",
            Self::ArchivingSuccessful => "archiving_successful",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(Self::Disabled),
            "running_or_archiving" => Some(Self::RunningOrArchiving),
            "archiving_failed" => Some(Self::ArchivingFailed),
            "archiving_successful" => Some(Self::ArchivingSuccessful),
            _ => None,
        }
    }
}

impl std::fmt::Display for MonitoringStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Measurement unit, split into base and SI prefix ("G" + "Flops/s").
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Unit {
    pub base: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
}

/// Aggregated per-metric statistics stored on the job row at archive time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobStatistics {
    pub unit: Unit,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

/// One allocated node with its optional hardware-thread and accelerator ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct Resource {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hwthreads: Option<Vec<i32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerators: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
}

/// Tag reference used in start payloads and tag_job requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TagSpec {
    #[serde(rename = "type")]
    pub tag_type: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

fn default_exclusive() -> i16 {
    1
}

fn default_smt() -> i16 {
    1
}

fn default_state() -> JobState {
    JobState::Running
}

/// Full job record as exchanged over the wire and stored in archive `meta` blobs.
///
/// `start_job` accepts this shape (aggregate maps empty); `GET /jobs/{id}` and
/// the archive return it with statistics filled in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobMeta {
    /// Internal surrogate key; absent until the catalog assigned one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub job_id: i64,
    pub cluster: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_cluster: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<String>,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_job_id: Option<i64>,
    pub num_nodes: i32,
    #[serde(default)]
    pub num_hwthreads: i32,
    #[serde(default)]
    pub num_acc: i32,
    #[serde(default = "default_exclusive")]
    pub exclusive: i16,
    #[serde(default = "default_smt")]
    pub smt: i16,
    #[serde(default)]
    pub walltime: i64,
    #[serde(default = "default_state")]
    pub job_state: JobState,
    #[serde(default = "default_monitoring_status")]
    pub monitoring_status: MonitoringStatus,
    pub start_time: i64,
    #[serde(default)]
    pub duration: i32,
    pub resources: Vec<Resource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub meta_data: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<TagSpec>>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub statistics: HashMap<String, JobStatistics>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub footprint: HashMap<String, f64>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub energy_footprint: HashMap<String, f64>,
    #[serde(default)]
    pub energy: f64,
}

fn default_monitoring_status() -> MonitoringStatus {
    MonitoringStatus::RunningOrArchiving
}

impl JobMeta {
    /// Local sanity checks on a start payload; cluster/subcluster assignment
    /// is validated separately against the cluster registry.
    pub fn sanity_checks(&self) -> AppResult<()> {
        if self.user.is_empty() {
            return Err(AppError::InvalidInput("user must not be empty".to_string()));
        }
        if self.cluster.is_empty() {
            return Err(AppError::InvalidInput(
                "cluster must not be empty".to_string(),
            ));
        }
        if self.num_nodes < 1 {
            return Err(AppError::InvalidInput(
                "numNodes must be at least 1".to_string(),
            ));
        }
        if self.num_hwthreads < 0 || self.num_acc < 0 {
            return Err(AppError::InvalidInput(
                "numHwthreads and numAcc must not be negative".to_string(),
            ));
        }
        if !(0..=1).contains(&self.exclusive) {
            return Err(AppError::InvalidInput(
                "exclusive must be 0 or 1".to_string(),
            ));
        }
        if !(0..=2).contains(&self.smt) {
            return Err(AppError::InvalidInput("smt must be 0, 1 or 2".to_string()));
        }
        if self.walltime < 0 || self.duration < 0 {
            return Err(AppError::InvalidInput(
                "walltime and duration must not be negative".to_string(),
            ));
        }
        if self.resources.len() != self.num_nodes as usize {
            return Err(AppError::InvalidInput(format!(
                "resources length {} does not match numNodes {}",
                self.resources.len(),
                self.num_nodes
            )));
        }
        Ok(())
    }
}

/// Body of `POST /jobs/stop_job/` (natural key) and `POST /jobs/stop_job/{id}`
/// (key fields optional).
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StopJobRequest {
    #[serde(default)]
    pub job_id: Option<i64>,
    #[serde(default)]
    pub cluster: Option<String>,
    #[serde(default)]
    pub start_time: Option<i64>,
    pub stop_time: i64,
    #[serde(default)]
    pub job_state: Option<JobState>,
}

/// Response of a successful `start_job`.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct StartJobResponse {
    pub id: i64,
}

/// Lightweight archival status, pollable after `stop_job` returned.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct JobArchiveStatus {
    pub id: i64,
    pub state: JobState,
    pub monitoring_status: MonitoringStatus,
}

/// Round to two decimal places, the resolution of all energy figures.
pub fn round_two(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_meta() -> JobMeta {
        serde_json::from_value(serde_json::json!({
            "jobId": 123,
            "cluster": "testcluster",
            "user": "testuser",
            "numNodes": 1,
            "startTime": 123456789,
            "resources": [{"hostname": "testhost"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_state_parse_roundtrip() {
        for s in [
            "running",
            "completed",
            "failed",
            "cancelled",
            "stopped",
            "timeout",
            "preempted",
            "out_of_memory",
        ] {
            assert_eq!(JobState::parse(s).unwrap().as_str(), s);
        }
        assert_eq!(JobState::parse("pending"), None);
    }

    #[test]
    fn test_transition_predicate() {
        assert!(JobState::Running.may_transition_to(JobState::Completed));
        assert!(JobState::Running.may_transition_to(JobState::OutOfMemory));
        assert!(!JobState::Running.may_transition_to(JobState::Running));
        assert!(!JobState::Completed.may_transition_to(JobState::Failed));
    }

    #[test]
    fn test_start_payload_defaults() {
        let meta = minimal_meta();
        assert_eq!(meta.job_state, JobState::Running);
        assert_eq!(meta.monitoring_status, MonitoringStatus::RunningOrArchiving);
        assert_eq!(meta.exclusive, 1);
        assert_eq!(meta.smt, 1);
        assert_eq!(meta.duration, 0);
        assert!(meta.statistics.is_empty());
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result: Result<JobMeta, _> = serde_json::from_value(serde_json::json!({
            "jobId": 1,
            "cluster": "c",
            "user": "u",
            "numNodes": 1,
            "startTime": 1,
            "resources": [{"hostname": "h"}],
            "bogus": true
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_sanity_checks() {
        let mut meta = minimal_meta();
        assert!(meta.sanity_checks().is_ok());

        meta.resources.push(Resource {
            hostname: "other".to_string(),
            hwthreads: None,
            accelerators: None,
            configuration: None,
        });
        assert!(meta.sanity_checks().is_err());

        let mut meta = minimal_meta();
        meta.user = String::new();
        assert!(meta.sanity_checks().is_err());

        let mut meta = minimal_meta();
        meta.smt = 3;
        assert!(meta.sanity_checks().is_err());
    }

    #[test]
    fn test_round_two() {
        assert_eq!(round_two(1.2345), 1.23);
        assert_eq!(round_two(1.235), 1.24);
        assert_eq!(round_two(0.0), 0.0);
    }
}
