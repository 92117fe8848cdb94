//! GraphQL query resolvers: stateless functions over the repositories.

use async_graphql::{ComplexObject, Context, Object, Result, SimpleObject};

use crate::archive::ArchiveStore;
use crate::db::DbPool;
use crate::db::jobs::{model_to_meta, security_condition};
use crate::db::stats::HistoPoint;
use crate::error::AppError;
use crate::metricdata::{MetricDataRepos, load_job_data};
use crate::models::{
    Aggregate, AuthenticatedUser, ClusterRegistry, JobFilter, MetricScope, OrderBy, PageRequest,
    StringFilter,
};

use super::types::*;
use std::sync::Arc;

/// Group keys accepted by `jobsStatistics`.
#[derive(async_graphql::Enum, Copy, Clone, Eq, PartialEq)]
#[graphql(name = "Aggregate", rename_items = "UPPERCASE")]
pub enum GqlAggregate {
    User,
    Project,
    Cluster,
}

impl From<GqlAggregate> for Aggregate {
    fn from(agg: GqlAggregate) -> Self {
        match agg {
            GqlAggregate::User => Aggregate::User,
            GqlAggregate::Project => Aggregate::Project,
            GqlAggregate::Cluster => Aggregate::Cluster,
        }
    }
}

/// Aggregate statistics for one group. The histograms are resolved lazily:
/// they only cost a query when the caller selects them.
#[derive(SimpleObject)]
#[graphql(name = "JobsStatistics", complex)]
pub struct GqlJobsStatistics {
    pub id: String,
    pub total_jobs: i64,
    pub total_users: i64,
    pub total_walltime: i64,
    pub total_core_hours: i64,
    pub total_accs: i64,
    pub total_acc_hours: i64,
    pub short_jobs: i64,
    #[graphql(skip)]
    pub filters: Vec<JobFilter>,
}

fn histo(points: Vec<HistoPoint>) -> Vec<GqlHistoPoint> {
    points
        .into_iter()
        .map(|p| GqlHistoPoint {
            value: p.value,
            count: p.count,
        })
        .collect()
}

#[ComplexObject]
impl GqlJobsStatistics {
    /// Walltime histogram in integer hours.
    async fn hist_walltime(&self, ctx: &Context<'_>) -> Result<Vec<GqlHistoPoint>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;
        let points = pool
            .hist_duration(&self.filters, security_condition(principal))
            .await
            .map_err(to_gql)?;
        Ok(histo(points))
    }

    /// Node-count histogram.
    async fn hist_num_nodes(&self, ctx: &Context<'_>) -> Result<Vec<GqlHistoPoint>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;
        let points = pool
            .hist_num_nodes(&self.filters, security_condition(principal))
            .await
            .map_err(to_gql)?;
        Ok(histo(points))
    }

    /// Histogram over the footprint average of one metric.
    async fn hist_metric(
        &self,
        ctx: &Context<'_>,
        metric: String,
        bins: Option<usize>,
    ) -> Result<Vec<GqlHistoPoint>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;
        let points = pool
            .hist_metric_avg(
                &self.filters,
                &metric,
                bins.unwrap_or(10),
                security_condition(principal),
            )
            .await
            .map_err(to_gql)?;
        Ok(histo(points))
    }
}

/// Archived statistics of one metric on one job.
#[derive(SimpleObject)]
#[graphql(name = "JobMetricStatWithName")]
pub struct GqlNamedStats {
    pub name: String,
    pub unit: String,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

#[derive(SimpleObject)]
#[graphql(name = "JobStats")]
pub struct GqlJobStats {
    pub id: i64,
    pub stats: Vec<GqlNamedStats>,
}

pub struct QueryRoot;

#[Object]
impl QueryRoot {
    /// All configured clusters.
    async fn clusters(&self, ctx: &Context<'_>) -> Result<Vec<GqlCluster>> {
        let registry = ctx.data::<Arc<ClusterRegistry>>()?;
        let mut clusters: Vec<GqlCluster> = registry
            .all()
            .map(|c| GqlCluster {
                name: c.name.clone(),
                sub_clusters: c
                    .sub_clusters
                    .iter()
                    .map(|sc| GqlSubCluster {
                        name: sc.name.clone(),
                        nodes: sc.nodes.clone(),
                        processor_type: sc.processor_type.clone(),
                        sockets_per_node: sc.sockets_per_node,
                        cores_per_socket: sc.cores_per_socket,
                        threads_per_core: sc.threads_per_core,
                    })
                    .collect(),
                metrics: c.metric_config.iter().map(|m| m.name.clone()).collect(),
            })
            .collect();
        clusters.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(clusters)
    }

    /// Tags visible to the caller.
    async fn tags(&self, ctx: &Context<'_>) -> Result<Vec<GqlTag>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;
        let tags = pool.list_tags(principal).await.map_err(to_gql)?;
        Ok(tags.into_iter().map(Into::into).collect())
    }

    /// Filtered, ordered, paginated job list with the unpaginated count.
    async fn jobs(
        &self,
        ctx: &Context<'_>,
        filter: Option<Vec<GqlJobFilter>>,
        page: Option<GqlPageRequest>,
        order: Option<GqlOrderBy>,
    ) -> Result<GqlJobResultList> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let filters = convert_filters(filter);
        let page: PageRequest = page.map(Into::into).unwrap_or_default();
        let order: OrderBy = order.map(Into::into).unwrap_or_default();

        let (models, count) = pool
            .query_jobs(&filters, &page, &order, security_condition(principal))
            .await
            .map_err(to_gql)?;

        let mut items = Vec::with_capacity(models.len());
        for model in &models {
            items.push(job_from_model(model).map_err(to_gql)?);
        }

        Ok(GqlJobResultList {
            items,
            count: count as i64,
        })
    }

    /// One job by dbid.
    async fn job(&self, ctx: &Context<'_>, id: i64) -> Result<Option<GqlJob>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let model = match pool.find_job_by_id(id).await {
            Ok(model) => model,
            Err(AppError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(to_gql(e)),
        };

        if !principal.sees_all_jobs()
            && model.username != principal.username
            && !model
                .project
                .as_ref()
                .is_some_and(|p| principal.projects.iter().any(|mine| mine == p))
        {
            return Err(async_graphql::Error::new(
                "you are not allowed to see this job",
            ));
        }

        Ok(Some(job_from_model(&model).map_err(to_gql)?))
    }

    /// Per-metric time series of one job, live or archived.
    async fn job_metrics(
        &self,
        ctx: &Context<'_>,
        id: i64,
        metrics: Option<Vec<String>>,
        scopes: Option<Vec<String>>,
    ) -> Result<Vec<GqlJobMetricWithName>> {
        let pool = ctx.data::<DbPool>()?;
        let repos = ctx.data::<MetricDataRepos>()?;
        let archive = ctx.data::<Arc<dyn ArchiveStore>>()?;

        let model = pool.find_job_by_id(id).await.map_err(to_gql)?;
        let meta = model_to_meta(&model).map_err(to_gql)?;

        let metrics = metrics.unwrap_or_default();
        let mut scope_list = Vec::new();
        for raw in scopes.unwrap_or_default() {
            scope_list.push(MetricScope::parse(&raw).ok_or_else(|| {
                async_graphql::Error::new(format!("unknown scope '{}'", raw))
            })?);
        }

        let data = load_job_data(&meta, &metrics, &scope_list, repos, archive.as_ref())
            .await
            .map_err(to_gql)?;

        let mut result: Vec<GqlJobMetricWithName> = data
            .into_iter()
            .flat_map(|(name, blocks)| {
                blocks.into_iter().map(move |(scope, metric)| GqlJobMetricWithName {
                    name: name.clone(),
                    scope: scope.as_str().to_string(),
                    metric: async_graphql::Json(metric),
                })
            })
            .collect();
        result.sort_by(|a, b| a.name.cmp(&b.name).then(a.scope.cmp(&b.scope)));
        Ok(result)
    }

    /// Archived per-job statistics for selected metrics.
    async fn jobs_metric_stats(
        &self,
        ctx: &Context<'_>,
        filter: Option<Vec<GqlJobFilter>>,
        metrics: Vec<String>,
    ) -> Result<Vec<GqlJobStats>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let filters = convert_filters(filter);
        let rows = pool
            .jobs_metric_stats(&filters, &metrics, security_condition(principal))
            .await
            .map_err(to_gql)?;

        Ok(rows
            .into_iter()
            .map(|(id, stats)| {
                let mut stats: Vec<GqlNamedStats> = stats
                    .into_iter()
                    .map(|(name, s)| GqlNamedStats {
                        name,
                        unit: match &s.unit.prefix {
                            Some(prefix) => format!("{}{}", prefix, s.unit.base),
                            None => s.unit.base.clone(),
                        },
                        avg: s.avg,
                        min: s.min,
                        max: s.max,
                    })
                    .collect();
                stats.sort_by(|a, b| a.name.cmp(&b.name));
                GqlJobStats { id, stats }
            })
            .collect())
    }

    /// Aggregate statistics, optionally grouped.
    async fn jobs_statistics(
        &self,
        ctx: &Context<'_>,
        filter: Option<Vec<GqlJobFilter>>,
        group_by: Option<GqlAggregate>,
    ) -> Result<Vec<GqlJobsStatistics>> {
        let pool = ctx.data::<DbPool>()?;
        let registry = ctx.data::<Arc<ClusterRegistry>>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let filters = convert_filters(filter);
        let groups = pool
            .jobs_statistics(
                &filters,
                group_by.map(Into::into),
                registry,
                security_condition(principal),
            )
            .await
            .map_err(to_gql)?;

        Ok(groups
            .into_iter()
            .map(|g| {
                // Histograms re-run the query, so each group remembers the
                // filter that selects exactly its jobs.
                let mut filters = filters.clone();
                if !g.id.is_empty() {
                    let mut group_filter = JobFilter::default();
                    match group_by {
                        Some(GqlAggregate::User) => {
                            group_filter.user = Some(StringFilter::eq(g.id.clone()));
                        }
                        Some(GqlAggregate::Project) => {
                            group_filter.project = Some(StringFilter::eq(g.id.clone()));
                        }
                        Some(GqlAggregate::Cluster) => {
                            group_filter.cluster = Some(StringFilter::eq(g.id.clone()));
                        }
                        None => {}
                    }
                    filters.push(group_filter);
                }

                GqlJobsStatistics {
                    id: g.id,
                    total_jobs: g.total_jobs,
                    total_users: g.total_users,
                    total_walltime: g.total_walltime,
                    total_core_hours: g.total_core_hours,
                    total_accs: g.total_accs,
                    total_acc_hours: g.total_acc_hours,
                    short_jobs: g.short_jobs,
                    filters,
                }
            })
            .collect())
    }

    /// Footprint values of the matching jobs, weighted by node hours.
    async fn jobs_footprints(
        &self,
        ctx: &Context<'_>,
        filter: Option<Vec<GqlJobFilter>>,
        metrics: Vec<String>,
    ) -> Result<GqlFootprints> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let filters = convert_filters(filter);
        let page = PageRequest {
            page: 1,
            items_per_page: -1,
        };
        let (models, _) = pool
            .query_jobs(
                &filters,
                &page,
                &OrderBy::default(),
                security_condition(principal),
            )
            .await
            .map_err(to_gql)?;

        let mut time_weights = Vec::with_capacity(models.len());
        let mut per_metric: Vec<Vec<f64>> =
            metrics.iter().map(|_| Vec::with_capacity(models.len())).collect();

        for model in &models {
            let meta = model_to_meta(model).map_err(to_gql)?;
            time_weights.push(meta.duration as f64 * meta.num_nodes as f64 / 3600.0);
            for (i, metric) in metrics.iter().enumerate() {
                let value = meta
                    .footprint
                    .get(&format!("{}_avg", metric))
                    .copied()
                    .unwrap_or(0.0);
                per_metric[i].push(value);
            }
        }

        Ok(GqlFootprints {
            time_weights,
            metrics: metrics
                .into_iter()
                .zip(per_metric)
                .map(|(metric, data)| GqlMetricFootprints { metric, data })
                .collect(),
        })
    }

    /// Heat tile grid of arithmetic intensity against flops.
    #[allow(clippy::too_many_arguments)]
    async fn roofline_heatmap(
        &self,
        ctx: &Context<'_>,
        filter: Option<Vec<GqlJobFilter>>,
        rows: usize,
        cols: usize,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
    ) -> Result<Vec<Vec<u32>>> {
        let pool = ctx.data::<DbPool>()?;
        let principal = ctx.data::<AuthenticatedUser>()?;

        let filters = convert_filters(filter);
        pool.roofline_heatmap(
            &filters,
            rows,
            cols,
            min_x,
            min_y,
            max_x,
            max_y,
            security_condition(principal),
        )
        .await
        .map_err(to_gql)
    }
}
