//! Aggregate statistics, histograms and the roofline projection over the
//! catalog.

use std::collections::HashMap;

use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, Condition, EntityTrait, FromQueryResult, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect,
};
use serde::Serialize;
use utoipa::ToSchema;

use crate::entity::job;
use crate::error::{AppError, AppResult};
use crate::models::{Aggregate, ClusterRegistry, JobFilter, JobStatistics, SubCluster};

use super::DbPool;
use super::jobs::compile_filters;

/// Jobs shorter than this count as noise in the statistics.
const SHORT_JOB_SECS: i64 = 120;

/// Matching-job ceiling for the roofline projection.
const ROOFLINE_MAX_JOBS: u64 = 500;

/// One histogram bucket.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct HistoPoint {
    pub value: i64,
    pub count: i64,
}

/// Aggregated statistics for one group (user, project, cluster, or all jobs).
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobsStatistics {
    /// Group key; empty for ungrouped queries.
    pub id: String,
    pub total_jobs: i64,
    pub total_users: i64,
    /// Hours
    pub total_walltime: i64,
    /// Hours, scaled by the subcluster core count
    pub total_core_hours: i64,
    pub total_accs: i64,
    /// Hours, scaled by the accelerator count
    pub total_acc_hours: i64,
    /// Jobs with duration < 120 s
    pub short_jobs: i64,
}

#[derive(Debug, FromQueryResult)]
struct StatsRow {
    group_key: Option<String>,
    total_jobs: i64,
    total_users: i64,
    duration_sum: Option<i64>,
    node_seconds: Option<i64>,
    hwthread_seconds: Option<i64>,
    acc_seconds: Option<i64>,
    total_accs: Option<i64>,
    short_jobs: i64,
}

/// Core hours for one aggregate row: the subcluster topology multiplier when
/// it is profiled, otherwise the jobs' own hardware-thread counts (always
/// populated on the row).
fn core_hours(sub_cluster: &SubCluster, node_seconds: i64, hwthread_seconds: i64) -> i64 {
    let cores_per_node = sub_cluster.cores_per_node() as i64;
    if cores_per_node > 0 {
        node_seconds * cores_per_node / 3600
    } else {
        hwthread_seconds / 3600
    }
}

#[derive(Debug, FromQueryResult)]
struct HistoRow {
    value: i64,
    count: i64,
}

#[derive(Debug, FromQueryResult)]
struct FootprintRow {
    value: Option<f64>,
}

impl DbPool {
    /// Per-group aggregate statistics.
    ///
    /// Core hours depend on the subcluster topology, so the aggregation runs
    /// once per (cluster, subcluster) pair and groups merge across pairs.
    pub async fn jobs_statistics(
        &self,
        filters: &[JobFilter],
        group_by: Option<Aggregate>,
        registry: &ClusterRegistry,
        security: Option<Condition>,
    ) -> AppResult<Vec<JobsStatistics>> {
        let mut merged: HashMap<String, JobsStatistics> = HashMap::new();

        for cluster in registry.all() {
            for sub_cluster in &cluster.sub_clusters {
                let mut condition = compile_filters(filters)
                    .add(job::Column::Cluster.eq(cluster.name.clone()))
                    .add(job::Column::SubCluster.eq(sub_cluster.name.clone()));
                if let Some(security) = &security {
                    condition = condition.add(security.clone());
                }

                let mut select = job::Entity::find()
                    .select_only()
                    .column_as(job::Column::Id.count(), "total_jobs")
                    .column_as(Expr::cust("COUNT(DISTINCT username)"), "total_users")
                    .column_as(
                        Expr::cust("SUM(CAST(duration AS BIGINT))"),
                        "duration_sum",
                    )
                    .column_as(
                        Expr::cust("SUM(CAST(duration AS BIGINT) * num_nodes)"),
                        "node_seconds",
                    )
                    .column_as(
                        Expr::cust("SUM(CAST(duration AS BIGINT) * num_hwthreads)"),
                        "hwthread_seconds",
                    )
                    .column_as(
                        Expr::cust("SUM(CAST(duration AS BIGINT) * num_acc)"),
                        "acc_seconds",
                    )
                    .column_as(Expr::cust("SUM(CAST(num_acc AS BIGINT))"), "total_accs")
                    .column_as(
                        Expr::cust(format!(
                            "COUNT(*) FILTER (WHERE duration < {})",
                            SHORT_JOB_SECS
                        )),
                        "short_jobs",
                    )
                    .filter(condition);

                select = match group_by {
                    Some(Aggregate::User) => select
                        .column_as(job::Column::Username, "group_key")
                        .group_by(job::Column::Username),
                    Some(Aggregate::Project) => select
                        .column_as(job::Column::Project, "group_key")
                        .group_by(job::Column::Project),
                    Some(Aggregate::Cluster) => select
                        .column_as(job::Column::Cluster, "group_key")
                        .group_by(job::Column::Cluster),
                    None => select.column_as(Expr::cust("''"), "group_key"),
                };

                let rows = select
                    .into_model::<StatsRow>()
                    .all(self.connection())
                    .await
                    .map_err(|e| {
                        AppError::Database(format!("Failed to aggregate job statistics: {}", e))
                    })?;

                for row in rows {
                    if row.total_jobs == 0 {
                        continue;
                    }
                    let entry = merged
                        .entry(row.group_key.clone().unwrap_or_default())
                        .or_insert_with(|| JobsStatistics {
                            id: row.group_key.unwrap_or_default(),
                            ..Default::default()
                        });
                    entry.total_jobs += row.total_jobs;
                    entry.total_users += row.total_users;
                    entry.total_walltime += row.duration_sum.unwrap_or(0) / 3600;
                    entry.total_core_hours += core_hours(
                        sub_cluster,
                        row.node_seconds.unwrap_or(0),
                        row.hwthread_seconds.unwrap_or(0),
                    );
                    entry.total_accs += row.total_accs.unwrap_or(0);
                    entry.total_acc_hours += row.acc_seconds.unwrap_or(0) / 3600;
                    entry.short_jobs += row.short_jobs;
                }
            }
        }

        let mut groups: Vec<JobsStatistics> = merged.into_values().collect();
        groups.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(groups)
    }

    /// Walltime histogram: one bucket per distinct raw duration value,
    /// emitted as integer hours.
    pub async fn hist_duration(
        &self,
        filters: &[JobFilter],
        security: Option<Condition>,
    ) -> AppResult<Vec<HistoPoint>> {
        let mut condition = compile_filters(filters);
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let rows = job::Entity::find()
            .select_only()
            .column_as(Expr::cust("CAST(duration AS BIGINT)"), "value")
            .column_as(job::Column::Id.count(), "count")
            .filter(condition)
            .group_by(job::Column::Duration)
            .order_by_asc(job::Column::Duration)
            .into_model::<HistoRow>()
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to build duration histogram: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| HistoPoint {
                value: r.value / 3600,
                count: r.count,
            })
            .collect())
    }

    /// Node-count histogram: one bucket per distinct numNodes value.
    pub async fn hist_num_nodes(
        &self,
        filters: &[JobFilter],
        security: Option<Condition>,
    ) -> AppResult<Vec<HistoPoint>> {
        let mut condition = compile_filters(filters);
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let rows = job::Entity::find()
            .select_only()
            .column_as(Expr::cust("CAST(num_nodes AS BIGINT)"), "value")
            .column_as(job::Column::Id.count(), "count")
            .filter(condition)
            .group_by(job::Column::NumNodes)
            .order_by_asc(job::Column::NumNodes)
            .into_model::<HistoRow>()
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to build node histogram: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|r| HistoPoint {
                value: r.value,
                count: r.count,
            })
            .collect())
    }

    /// Histogram over the archived footprint average of one metric, with a
    /// caller-supplied bin count.
    pub async fn hist_metric_avg(
        &self,
        filters: &[JobFilter],
        metric: &str,
        bins: usize,
        security: Option<Condition>,
    ) -> AppResult<Vec<HistoPoint>> {
        let mut condition = compile_filters(filters).add(job::Column::Footprint.is_not_null());
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let key = format!("{}_avg", metric);
        let rows = job::Entity::find()
            .select_only()
            .column_as(
                Expr::cust_with_values("CAST(footprint->>$1 AS DOUBLE PRECISION)", [key]),
                "value",
            )
            .filter(condition)
            .into_model::<FootprintRow>()
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to build metric histogram: {}", e)))?;

        let values: Vec<f64> = rows
            .into_iter()
            .filter_map(|r| r.value)
            .filter(|v| v.is_finite())
            .collect();

        Ok(equi_width_bins(&values, bins))
    }

    /// Per-job footprint values joined from the archived statistics map.
    pub async fn jobs_metric_stats(
        &self,
        filters: &[JobFilter],
        metrics: &[String],
        security: Option<Condition>,
    ) -> AppResult<Vec<(i64, HashMap<String, JobStatistics>)>> {
        let mut condition = compile_filters(filters).add(job::Column::Statistics.is_not_null());
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let rows = job::Entity::find()
            .filter(condition)
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to load job statistics: {}", e)))?;

        let mut result = Vec::with_capacity(rows.len());
        for row in rows {
            let all: HashMap<String, JobStatistics> = match &row.statistics {
                Some(v) => serde_json::from_value(v.clone())
                    .map_err(|e| AppError::Internal(format!("corrupt statistics column: {}", e)))?,
                None => continue,
            };
            let selected: HashMap<String, JobStatistics> = all
                .into_iter()
                .filter(|(name, _)| metrics.iter().any(|m| m == name))
                .collect();
            result.push((row.id, selected));
        }

        Ok(result)
    }

    /// Roofline heat tiles over the matching jobs' footprints.
    ///
    /// Fails with `PreconditionFailed` when more than 500 jobs match.
    #[allow(clippy::too_many_arguments)]
    pub async fn roofline_heatmap(
        &self,
        filters: &[JobFilter],
        rows: usize,
        cols: usize,
        min_x: f64,
        min_y: f64,
        max_x: f64,
        max_y: f64,
        security: Option<Condition>,
    ) -> AppResult<Vec<Vec<u32>>> {
        let mut condition = compile_filters(filters).add(job::Column::Footprint.is_not_null());
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let select = job::Entity::find().filter(condition);
        let total = select
            .clone()
            .count(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to count roofline jobs: {}", e)))?;
        if total > ROOFLINE_MAX_JOBS {
            return Err(AppError::PreconditionFailed(format!(
                "{} matching jobs exceed the roofline limit of {}",
                total, ROOFLINE_MAX_JOBS
            )));
        }

        let models = select
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to load roofline jobs: {}", e)))?;

        let mut points = Vec::new();
        for model in models {
            let Some(footprint) = &model.footprint else {
                continue;
            };
            let flops = footprint.get("flops_any_avg").and_then(|v| v.as_f64());
            let membw = footprint.get("mem_bw_avg").and_then(|v| v.as_f64());
            if let (Some(flops), Some(membw)) = (flops, membw) {
                if membw > 0.0 && flops.is_finite() && membw.is_finite() {
                    points.push((flops / membw, flops));
                }
            }
        }

        Ok(roofline_tiles(&points, rows, cols, min_x, min_y, max_x, max_y))
    }
}

/// Equi-width binning from min to max of `values` into `bins` buckets; the
/// emitted `value` is the bucket's lower bound, truncated.
pub fn equi_width_bins(values: &[f64], bins: usize) -> Vec<HistoPoint> {
    if values.is_empty() || bins == 0 {
        return Vec::new();
    }

    let min = values.iter().cloned().fold(f64::INFINITY, f64::min);
    let max = values.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
    let width = if max > min { (max - min) / bins as f64 } else { 1.0 };

    let mut counts = vec![0i64; bins];
    for &v in values {
        let mut idx = ((v - min) / width) as usize;
        if idx >= bins {
            idx = bins - 1;
        }
        counts[idx] += 1;
    }

    counts
        .into_iter()
        .enumerate()
        .map(|(i, count)| HistoPoint {
            value: (min + i as f64 * width) as i64,
            count,
        })
        .collect()
}

/// Count points into a rows x cols grid spanning
/// log10(min_x..max_x) x log10(min_y..max_y); NaN and out-of-range points are
/// discarded.
pub fn roofline_tiles(
    points: &[(f64, f64)],
    rows: usize,
    cols: usize,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
) -> Vec<Vec<u32>> {
    let mut tiles = vec![vec![0u32; cols]; rows];
    if rows == 0 || cols == 0 || min_x <= 0.0 || min_y <= 0.0 || max_x <= min_x || max_y <= min_y {
        return tiles;
    }

    let (lx0, lx1) = (min_x.log10(), max_x.log10());
    let (ly0, ly1) = (min_y.log10(), max_y.log10());

    for &(x, y) in points {
        if !x.is_finite() || !y.is_finite() || x <= 0.0 || y <= 0.0 {
            continue;
        }
        let fx = (x.log10() - lx0) / (lx1 - lx0);
        let fy = (y.log10() - ly0) / (ly1 - ly0);
        if !(0.0..=1.0).contains(&fx) || !(0.0..=1.0).contains(&fy) {
            continue;
        }
        let col = ((fx * cols as f64) as usize).min(cols - 1);
        let row = ((fy * rows as f64) as usize).min(rows - 1);
        tiles[row][col] += 1;
    }

    tiles
}
