//! Catalog query inputs: filters, pagination and ordering.
//!
//! These are the validated shapes the query compiler consumes; both the REST
//! query-string parameters and the GraphQL inputs are converted into them.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};
use crate::models::job::JobState;

/// String match; exactly the supported comparison modes, AND-composed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct StringFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eq: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contains: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub starts_with: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ends_with: Option<String>,
}

impl StringFilter {
    pub fn eq(value: impl Into<String>) -> Self {
        Self {
            eq: Some(value.into()),
            ..Default::default()
        }
    }
}

/// Closed integer range, both bounds inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct IntRange {
    pub from: i64,
    pub to: i64,
}

/// Unix-timestamp range; open ends allowed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct TimeRange {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<i64>,
}

/// One filter object; all present fields AND-compose, and a list of
/// `JobFilter`s AND-composes as well.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct JobFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_cluster: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<StringFilter>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_job_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Vec<JobState>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_nodes: Option<IntRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_accelerators: Option<IntRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<IntRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<TimeRange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Vec<i64>>,
}

/// Pagination: `page >= 1`; `items_per_page == -1` means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PageRequest {
    pub page: i32,
    pub items_per_page: i32,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            items_per_page: 25,
        }
    }
}

impl PageRequest {
    pub fn validate(&self) -> AppResult<()> {
        if self.page < 1 {
            return Err(AppError::InvalidInput("page must be >= 1".to_string()));
        }
        if self.items_per_page < -1 || self.items_per_page == 0 {
            return Err(AppError::InvalidInput(
                "itemsPerPage must be -1 (unlimited) or positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn is_unlimited(&self) -> bool {
        self.items_per_page == -1
    }

    pub fn offset(&self) -> u64 {
        ((self.page - 1) as u64) * (self.items_per_page.max(0) as u64)
    }

    pub fn limit(&self) -> Option<u64> {
        if self.is_unlimited() {
            None
        } else {
            Some(self.items_per_page as u64)
        }
    }
}

/// Whitelisted sortable columns; anything else is a validation error before
/// any SQL is built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum SortField {
    JobId,
    Cluster,
    SubCluster,
    Partition,
    Project,
    User,
    StartTime,
    Duration,
    NumNodes,
    NumHwthreads,
    NumAcc,
    Energy,
}

impl SortField {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "jobId" => Some(Self::JobId),
            "cluster" => Some(Self::Cluster),
            "subCluster" => Some(Self::SubCluster),
            "partition" => Some(Self::Partition),
            "project" => Some(Self::Project),
            "user" => Some(Self::User),
            "startTime" => Some(Self::StartTime),
            "duration" => Some(Self::Duration),
            "numNodes" => Some(Self::NumNodes),
            "numHwthreads" => Some(Self::NumHwthreads),
            "numAcc" => Some(Self::NumAcc),
            "energy" => Some(Self::Energy),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SortDirection {
    Asc,
    Desc,
}

/// Validated order clause.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct OrderBy {
    pub field: SortField,
    pub direction: SortDirection,
}

impl Default for OrderBy {
    fn default() -> Self {
        Self {
            field: SortField::StartTime,
            direction: SortDirection::Desc,
        }
    }
}

impl OrderBy {
    /// Parse a caller-supplied field name against the whitelist.
    pub fn from_parts(field: &str, direction: SortDirection) -> AppResult<Self> {
        let field = SortField::parse(field).ok_or_else(|| {
            AppError::InvalidInput(format!("'{}' is not a sortable field", field))
        })?;
        Ok(Self { field, direction })
    }
}

/// Group key for `jobsStatistics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Aggregate {
    User,
    Project,
    Cluster,
}
