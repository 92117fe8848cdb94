//! GraphQL object and input types, converted from the domain models.
//!
//! These are separate shapes on purpose: the schema evolves with the UI, the
//! domain types with the catalog.

use async_graphql::{ComplexObject, Context, Enum, InputObject, Json, Result, SimpleObject};

use crate::db::DbPool;
use crate::db::jobs::model_to_meta;
use crate::entity::{job, tag};
use crate::error::AppResult;
use crate::models::{
    AuthenticatedUser, IntRange, JobFilter, JobMetric, JobState, OrderBy, PageRequest,
    SortDirection, SortField, StringFilter, TimeRange,
};

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
#[graphql(name = "JobState", rename_items = "snake_case")]
pub enum GqlJobState {
    Running,
    Completed,
    Failed,
    Cancelled,
    Stopped,
    Timeout,
    Preempted,
    OutOfMemory,
}

impl From<GqlJobState> for JobState {
    fn from(state: GqlJobState) -> Self {
        match state {
            GqlJobState::Running => JobState::Running,
            GqlJobState::Completed => JobState::Completed,
            GqlJobState::Failed => JobState::Failed,
            GqlJobState::Cancelled => JobState::Cancelled,
            GqlJobState::Stopped => JobState::Stopped,
            GqlJobState::Timeout => JobState::Timeout,
            GqlJobState::Preempted => JobState::Preempted,
            GqlJobState::OutOfMemory => JobState::OutOfMemory,
        }
    }
}

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
#[graphql(name = "SortDirectionEnum")]
pub enum GqlSortDirection {
    Asc,
    Desc,
}

#[derive(Enum, Copy, Clone, Eq, PartialEq)]
#[graphql(name = "SortField", rename_items = "camelCase")]
pub enum GqlSortField {
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

impl From<GqlSortField> for SortField {
    fn from(field: GqlSortField) -> Self {
        match field {
            GqlSortField::JobId => SortField::JobId,
            GqlSortField::Cluster => SortField::Cluster,
            GqlSortField::SubCluster => SortField::SubCluster,
            GqlSortField::Partition => SortField::Partition,
            GqlSortField::Project => SortField::Project,
            GqlSortField::User => SortField::User,
            GqlSortField::StartTime => SortField::StartTime,
            GqlSortField::Duration => SortField::Duration,
            GqlSortField::NumNodes => SortField::NumNodes,
            GqlSortField::NumHwthreads => SortField::NumHwthreads,
            GqlSortField::NumAcc => SortField::NumAcc,
            GqlSortField::Energy => SortField::Energy,
        }
    }
}

#[derive(InputObject, Default)]
#[graphql(name = "StringInput")]
pub struct GqlStringInput {
    pub eq: Option<String>,
    pub contains: Option<String>,
    pub starts_with: Option<String>,
    pub ends_with: Option<String>,
}

impl From<GqlStringInput> for StringFilter {
    fn from(input: GqlStringInput) -> Self {
        StringFilter {
            eq: input.eq,
            contains: input.contains,
            starts_with: input.starts_with,
            ends_with: input.ends_with,
        }
    }
}

#[derive(InputObject)]
#[graphql(name = "IntRange")]
pub struct GqlIntRange {
    pub from: i64,
    pub to: i64,
}

#[derive(InputObject)]
#[graphql(name = "TimeRange")]
pub struct GqlTimeRange {
    pub from: Option<i64>,
    pub to: Option<i64>,
}

#[derive(InputObject, Default)]
#[graphql(name = "JobFilter")]
pub struct GqlJobFilter {
    pub cluster: Option<GqlStringInput>,
    pub sub_cluster: Option<GqlStringInput>,
    pub partition: Option<GqlStringInput>,
    pub project: Option<GqlStringInput>,
    pub user: Option<GqlStringInput>,
    pub job_id: Option<GqlStringInput>,
    pub job_name: Option<GqlStringInput>,
    pub array_job_id: Option<i64>,
    pub state: Option<Vec<GqlJobState>>,
    pub num_nodes: Option<GqlIntRange>,
    pub num_accelerators: Option<GqlIntRange>,
    pub duration: Option<GqlIntRange>,
    pub start_time: Option<GqlTimeRange>,
    pub tags: Option<Vec<i64>>,
}

impl From<GqlJobFilter> for JobFilter {
    fn from(input: GqlJobFilter) -> Self {
        JobFilter {
            cluster: input.cluster.map(Into::into),
            sub_cluster: input.sub_cluster.map(Into::into),
            partition: input.partition.map(Into::into),
            project: input.project.map(Into::into),
            user: input.user.map(Into::into),
            job_id: input.job_id.map(Into::into),
            job_name: input.job_name.map(Into::into),
            array_job_id: input.array_job_id,
            state: input
                .state
                .map(|states| states.into_iter().map(Into::into).collect()),
            num_nodes: input.num_nodes.map(|r| IntRange { from: r.from, to: r.to }),
            num_accelerators: input
                .num_accelerators
                .map(|r| IntRange { from: r.from, to: r.to }),
            duration: input.duration.map(|r| IntRange { from: r.from, to: r.to }),
            start_time: input.start_time.map(|r| TimeRange {
                from: r.from,
                to: r.to,
            }),
            tags: input.tags,
        }
    }
}

/// Convert the optional filter list of a query into the repository shape.
pub fn convert_filters(filters: Option<Vec<GqlJobFilter>>) -> Vec<JobFilter> {
    filters
        .map(|list| list.into_iter().map(Into::into).collect())
        .unwrap_or_default()
}

#[derive(InputObject)]
#[graphql(name = "PageRequest")]
pub struct GqlPageRequest {
    pub page: i32,
    pub items_per_page: i32,
}

impl From<GqlPageRequest> for PageRequest {
    fn from(input: GqlPageRequest) -> Self {
        PageRequest {
            page: input.page,
            items_per_page: input.items_per_page,
        }
    }
}

#[derive(InputObject)]
#[graphql(name = "OrderByInput")]
pub struct GqlOrderBy {
    pub field: GqlSortField,
    pub direction: GqlSortDirection,
}

impl From<GqlOrderBy> for OrderBy {
    fn from(input: GqlOrderBy) -> Self {
        OrderBy {
            field: input.field.into(),
            direction: match input.direction {
                GqlSortDirection::Asc => SortDirection::Asc,
                GqlSortDirection::Desc => SortDirection::Desc,
            },
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "Tag")]
pub struct GqlTag {
    pub id: i64,
    #[graphql(name = "type")]
    pub tag_type: String,
    pub name: String,
    pub scope: String,
}

impl From<tag::Model> for GqlTag {
    fn from(model: tag::Model) -> Self {
        GqlTag {
            id: model.id,
            tag_type: model.tag_type,
            name: model.tag_name,
            scope: model.tag_scope,
        }
    }
}

#[derive(SimpleObject)]
#[graphql(name = "Resource")]
pub struct GqlResource {
    pub hostname: String,
    pub hwthreads: Option<Vec<i32>>,
    pub accelerators: Option<Vec<String>>,
    pub configuration: Option<String>,
}

#[derive(SimpleObject)]
#[graphql(name = "FootprintValue")]
pub struct GqlFootprintValue {
    pub name: String,
    pub value: f64,
}

/// One job as the UI sees it. Tags resolve lazily through the repository.
#[derive(SimpleObject)]
#[graphql(name = "Job", complex)]
pub struct GqlJob {
    pub id: i64,
    pub job_id: i64,
    pub cluster: String,
    pub sub_cluster: String,
    pub partition: Option<String>,
    pub project: Option<String>,
    pub user: String,
    pub array_job_id: Option<i64>,
    pub num_nodes: i32,
    pub num_hwthreads: i32,
    pub num_acc: i32,
    pub exclusive: i32,
    pub smt: i32,
    pub state: String,
    pub monitoring_status: String,
    pub start_time: i64,
    pub duration: i32,
    pub walltime: i64,
    pub resources: Vec<GqlResource>,
    pub footprint: Vec<GqlFootprintValue>,
    pub energy_footprint: Vec<GqlFootprintValue>,
    pub energy: f64,
}

#[ComplexObject]
impl GqlJob {
    async fn tags(&self, ctx: &Context<'_>) -> Result<Vec<GqlTag>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;
        let tags = pool.job_tags(self.id, principal).await.map_err(to_gql)?;
        Ok(tags.into_iter().map(Into::into).collect())
    }
}

pub fn job_from_model(model: &job::Model) -> AppResult<GqlJob> {
    let meta = model_to_meta(model)?;

    let mut footprint: Vec<GqlFootprintValue> = meta
        .footprint
        .iter()
        .map(|(name, value)| GqlFootprintValue {
            name: name.clone(),
            value: *value,
        })
        .collect();
    footprint.sort_by(|a, b| a.name.cmp(&b.name));

    let mut energy_footprint: Vec<GqlFootprintValue> = meta
        .energy_footprint
        .iter()
        .map(|(name, value)| GqlFootprintValue {
            name: name.clone(),
            value: *value,
        })
        .collect();
    energy_footprint.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(GqlJob {
        id: model.id,
        job_id: meta.job_id,
        cluster: meta.cluster,
        sub_cluster: meta.sub_cluster.unwrap_or_default(),
        partition: meta.partition,
        project: meta.project,
        user: meta.user,
        array_job_id: meta.array_job_id,
        num_nodes: meta.num_nodes,
        num_hwthreads: meta.num_hwthreads,
        num_acc: meta.num_acc,
        exclusive: meta.exclusive as i32,
        smt: meta.smt as i32,
        state: meta.job_state.as_str().to_string(),
        monitoring_status: meta.monitoring_status.as_str().to_string(),
        start_time: meta.start_time,
        duration: meta.duration,
        walltime: meta.walltime,
        resources: meta
            .resources
            .into_iter()
            .map(|r| GqlResource {
                hostname: r.hostname,
                hwthreads: r.hwthreads,
                accelerators: r.accelerators,
                configuration: r.configuration,
            })
            .collect(),
        footprint,
        energy_footprint,
        energy: meta.energy,
    })
}

#[derive(SimpleObject)]
#[graphql(name = "JobResultList")]
pub struct GqlJobResultList {
    pub items: Vec<GqlJob>,
    pub count: i64,
}

#[derive(SimpleObject)]
#[graphql(name = "JobMetricWithName")]
pub struct GqlJobMetricWithName {
    pub name: String,
    pub scope: String,
    pub metric: Json<JobMetric>,
}

#[derive(SimpleObject)]
#[graphql(name = "SubCluster")]
pub struct GqlSubCluster {
    pub name: String,
    pub nodes: String,
    pub processor_type: String,
    pub sockets_per_node: i32,
    pub cores_per_socket: i32,
    pub threads_per_core: i32,
}

#[derive(SimpleObject)]
#[graphql(name = "Cluster")]
pub struct GqlCluster {
    pub name: String,
    pub sub_clusters: Vec<GqlSubCluster>,
    pub metrics: Vec<String>,
}

#[derive(SimpleObject)]
#[graphql(name = "HistoPoint")]
pub struct GqlHistoPoint {
    pub value: i64,
    pub count: i64,
}

#[derive(SimpleObject)]
#[graphql(name = "MetricFootprints")]
pub struct GqlMetricFootprints {
    pub metric: String,
    pub data: Vec<f64>,
}

#[derive(SimpleObject)]
#[graphql(name = "Footprints")]
pub struct GqlFootprints {
    pub time_weights: Vec<f64>,
    pub metrics: Vec<GqlMetricFootprints>,
}

/// Convert repository errors into GraphQL field errors (the client asked, so
/// the message travels).
pub fn to_gql(err: crate::error::AppError) -> async_graphql::Error {
    async_graphql::Error::new(err.to_string())
}
