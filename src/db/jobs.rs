//! Job repository: sole mutator of the catalog and home of the filter
//! compiler.

use std::collections::HashMap;

use sea_orm::sea_query::{Expr, Query};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, Condition, EntityTrait, NotSet, PaginatorTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};

use crate::entity::{job, job_tag};
use crate::error::{AppError, AppResult};
use crate::models::{
    AuthenticatedUser, JobFilter, JobMeta, JobState, JobStatistics, MonitoringStatus, OrderBy,
    PageRequest, Resource, SortDirection, SortField, StringFilter,
};

use super::DbPool;

/// Two starts of the same (job_id, cluster) within this window are the same
/// job re-reported; outside it they are a legitimate re-submission.
pub const DUPLICATE_WINDOW_SECS: i64 = 86_400;

/// Convert a catalog row into the wire representation. Tags are attached by
/// the caller when requested.
pub fn model_to_meta(model: &job::Model) -> AppResult<JobMeta> {
    let job_state = JobState::parse(&model.job_state)
        .ok_or_else(|| AppError::Internal(format!("invalid job_state '{}'", model.job_state)))?;
    let monitoring_status = MonitoringStatus::parse(&model.monitoring_status).ok_or_else(|| {
        AppError::Internal(format!(
            "invalid monitoring_status '{}'",
            model.monitoring_status
        ))
    })?;

    let resources: Vec<Resource> = serde_json::from_value(model.resources.clone())
        .map_err(|e| AppError::Internal(format!("corrupt resources column: {}", e)))?;

    let parse_map = |value: &Option<serde_json::Value>, what: &str| -> AppResult<HashMap<String, f64>> {
        match value {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| AppError::Internal(format!("corrupt {} column: {}", what, e))),
            None => Ok(HashMap::new()),
        }
    };

    let statistics: HashMap<String, JobStatistics> = match &model.statistics {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| AppError::Internal(format!("corrupt statistics column: {}", e)))?,
        None => HashMap::new(),
    };

    let meta_data: Option<HashMap<String, String>> = match &model.meta_data {
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| AppError::Internal(format!("corrupt meta_data column: {}", e)))?,
        None => None,
    };

    Ok(JobMeta {
        id: Some(model.id),
        job_id: model.job_id,
        cluster: model.cluster.clone(),
        sub_cluster: Some(model.sub_cluster.clone()),
        partition: model.partition.clone(),
        project: model.project.clone(),
        user: model.username.clone(),
        array_job_id: model.array_job_id,
        num_nodes: model.num_nodes,
        num_hwthreads: model.num_hwthreads,
        num_acc: model.num_acc,
        exclusive: model.exclusive,
        smt: model.smt,
        walltime: model.walltime,
        job_state,
        monitoring_status,
        start_time: model.start_time,
        duration: model.duration,
        resources,
        meta_data,
        tags: None,
        statistics,
        footprint: parse_map(&model.footprint, "footprint")?,
        energy_footprint: parse_map(&model.energy_footprint, "energy_footprint")?,
        energy: model.energy,
    })
}

impl DbPool {
    /// Insert a new running job after duplicate detection; returns the dbid.
    ///
    /// The caller performs sanity checks and subcluster assignment first, so
    /// `meta.sub_cluster` is always set here.
    pub async fn start_job(&self, meta: &JobMeta) -> AppResult<i64> {
        let existing = job::Entity::find()
            .filter(job::Column::JobId.eq(meta.job_id))
            .filter(job::Column::Cluster.eq(meta.cluster.clone()))
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to check for duplicates: {}", e)))?;

        for row in &existing {
            if (row.start_time - meta.start_time).abs() < DUPLICATE_WINDOW_SECS {
                return Err(AppError::Duplicate(format!(
                    "job {} on cluster {} already started at {} (dbid {})",
                    meta.job_id, meta.cluster, row.start_time, row.id
                )));
            }
        }

        let resources = serde_json::to_value(&meta.resources)
            .map_err(|e| AppError::Internal(format!("Failed to serialize resources: {}", e)))?;
        let meta_data = match &meta.meta_data {
            Some(md) => Some(
                serde_json::to_value(md)
                    .map_err(|e| AppError::Internal(format!("Failed to serialize metadata: {}", e)))?,
            ),
            None => None,
        };

        let model = job::ActiveModel {
            id: NotSet,
            job_id: Set(meta.job_id),
            cluster: Set(meta.cluster.clone()),
            sub_cluster: Set(meta.sub_cluster.clone().unwrap_or_default()),
            partition: Set(meta.partition.clone()),
            project: Set(meta.project.clone()),
            username: Set(meta.user.clone()),
            array_job_id: Set(meta.array_job_id),
            num_nodes: Set(meta.num_nodes),
            num_hwthreads: Set(meta.num_hwthreads),
            num_acc: Set(meta.num_acc),
            exclusive: Set(meta.exclusive),
            smt: Set(meta.smt),
            job_state: Set(JobState::Running.as_str().to_string()),
            monitoring_status: Set(meta.monitoring_status.as_str().to_string()),
            start_time: Set(meta.start_time),
            duration: Set(0),
            walltime: Set(meta.walltime),
            resources: Set(resources),
            meta_data: Set(meta_data),
            footprint: Set(None),
            energy_footprint: Set(None),
            statistics: Set(None),
            energy: Set(0.0),
        };

        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert job: {}", e)))?;

        Ok(result.id)
    }

    /// Look up by natural key; without `start_time` the most recent match wins.
    pub async fn find_job(
        &self,
        job_id: i64,
        cluster: Option<&str>,
        start_time: Option<i64>,
    ) -> AppResult<job::Model> {
        let mut select = job::Entity::find().filter(job::Column::JobId.eq(job_id));

        if let Some(cluster) = cluster {
            select = select.filter(job::Column::Cluster.eq(cluster));
        }
        if let Some(start_time) = start_time {
            select = select.filter(job::Column::StartTime.eq(start_time));
        }

        select
            .order_by_desc(job::Column::StartTime)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to find job: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", job_id)))
    }

    /// Every row matching (job_id, cluster?), newest first. Stop-by-natural-
    /// key uses this to disambiguate re-submitted job ids when the caller
    /// omits the start time.
    pub async fn find_all_jobs(
        &self,
        job_id: i64,
        cluster: Option<&str>,
    ) -> AppResult<Vec<job::Model>> {
        let mut select = job::Entity::find().filter(job::Column::JobId.eq(job_id));
        if let Some(cluster) = cluster {
            select = select.filter(job::Column::Cluster.eq(cluster));
        }

        select
            .order_by_desc(job::Column::StartTime)
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to find jobs: {}", e)))
    }

    /// Look up by dbid.
    pub async fn find_job_by_id(&self, dbid: i64) -> AppResult<job::Model> {
        job::Entity::find_by_id(dbid)
            .one(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to find job: {}", e)))?
            .ok_or_else(|| AppError::NotFound(format!("Job {}", dbid)))
    }

    /// Transition `running -> state` and stamp the duration.
    ///
    /// The transition is guarded by `WHERE job_state = 'running'` so
    /// concurrent stops of the same row cannot both succeed.
    pub async fn stop_job(
        &self,
        dbid: i64,
        duration: i32,
        state: JobState,
        monitoring_status: MonitoringStatus,
    ) -> AppResult<job::Model> {
        if duration < 0 {
            return Err(AppError::InvalidInput(
                "duration must not be negative".to_string(),
            ));
        }
        if !state.is_terminal() {
            return Err(AppError::InvalidInput(format!(
                "'{}' is not a terminal job state",
                state
            )));
        }

        let result = job::Entity::update_many()
            .col_expr(job::Column::JobState, Expr::value(state.as_str()))
            .col_expr(job::Column::Duration, Expr::value(duration))
            .col_expr(
                job::Column::MonitoringStatus,
                Expr::value(monitoring_status.as_str()),
            )
            .filter(job::Column::Id.eq(dbid))
            .filter(job::Column::JobState.eq(JobState::Running.as_str()))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to stop job: {}", e)))?;

        if result.rows_affected == 0 {
            // Either the row is gone or it is no longer running.
            let current = self.find_job_by_id(dbid).await?;
            return Err(AppError::PreconditionFailed(format!(
                "job {} is in state '{}', only running jobs can be stopped",
                dbid, current.job_state
            )));
        }

        self.find_job_by_id(dbid).await
    }

    /// Persist the archive-time aggregates and flip the monitoring status.
    pub async fn archive_job(
        &self,
        dbid: i64,
        monitoring_status: MonitoringStatus,
        statistics: &HashMap<String, JobStatistics>,
        footprint: &HashMap<String, f64>,
        energy_footprint: &HashMap<String, f64>,
        energy: f64,
    ) -> AppResult<()> {
        let model = self.find_job_by_id(dbid).await?;
        if model.job_state == JobState::Running.as_str() {
            return Err(AppError::PreconditionFailed(format!(
                "job {} is still running, aggregates belong to terminal jobs",
                dbid
            )));
        }

        let mut active: job::ActiveModel = model.into();
        active.monitoring_status = Set(monitoring_status.as_str().to_string());
        active.statistics = Set(Some(serde_json::to_value(statistics).map_err(|e| {
            AppError::Internal(format!("Failed to serialize statistics: {}", e))
        })?));
        active.footprint = Set(Some(serde_json::to_value(footprint).map_err(|e| {
            AppError::Internal(format!("Failed to serialize footprint: {}", e))
        })?));
        active.energy_footprint = Set(Some(serde_json::to_value(energy_footprint).map_err(
            |e| AppError::Internal(format!("Failed to serialize energy footprint: {}", e)),
        )?));
        active.energy = Set(energy);

        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to archive job: {}", e)))?;

        Ok(())
    }

    /// Flip only the monitoring status (failure paths).
    pub async fn update_monitoring_status(
        &self,
        dbid: i64,
        monitoring_status: MonitoringStatus,
    ) -> AppResult<()> {
        let result = job::Entity::update_many()
            .col_expr(
                job::Column::MonitoringStatus,
                Expr::value(monitoring_status.as_str()),
            )
            .filter(job::Column::Id.eq(dbid))
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update monitoring status: {}", e)))?;

        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Job {}", dbid)));
        }
        Ok(())
    }

    /// Free-form key/value annotations stored as a JSON blob on the row.
    pub async fn fetch_metadata(&self, model: &job::Model) -> AppResult<HashMap<String, String>> {
        match &model.meta_data {
            Some(v) => serde_json::from_value(v.clone())
                .map_err(|e| AppError::Internal(format!("corrupt meta_data column: {}", e))),
            None => Ok(HashMap::new()),
        }
    }

    /// Upsert one metadata key.
    pub async fn update_metadata(&self, dbid: i64, key: &str, val: &str) -> AppResult<()> {
        let model = self.find_job_by_id(dbid).await?;
        let mut meta = self.fetch_metadata(&model).await?;
        meta.insert(key.to_string(), val.to_string());

        let mut active: job::ActiveModel = model.into();
        active.meta_data = Set(Some(serde_json::to_value(&meta).map_err(|e| {
            AppError::Internal(format!("Failed to serialize metadata: {}", e))
        })?));
        active
            .update(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to update metadata: {}", e)))?;

        Ok(())
    }

    /// Terminal jobs still waiting for archival; re-enqueued on startup.
    pub async fn find_pending_archivals(&self) -> AppResult<Vec<i64>> {
        let rows = job::Entity::find()
            .filter(job::Column::JobState.ne(JobState::Running.as_str()))
            .filter(
                job::Column::MonitoringStatus
                    .eq(MonitoringStatus::RunningOrArchiving.as_str()),
            )
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to list pending archivals: {}", e)))?;

        Ok(rows.into_iter().map(|r| r.id).collect())
    }

    /// Remove a job row; jobtag rows cascade.
    pub async fn delete_job(&self, dbid: i64) -> AppResult<()> {
        let result = job::Entity::delete_by_id(dbid)
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to delete job: {}", e)))?;

        if result.rows_affected == 0 {
            return Err(AppError::NotFound(format!("Job {}", dbid)));
        }
        Ok(())
    }

    /// Delete all rows from job, tag and jobtag (admin/reinit only).
    pub async fn flush(&self) -> AppResult<()> {
        use crate::entity::tag;

        job_tag::Entity::delete_many()
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to flush jobtag: {}", e)))?;
        tag::Entity::delete_many()
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to flush tag: {}", e)))?;
        job::Entity::delete_many()
            .exec(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to flush job: {}", e)))?;

        Ok(())
    }

    /// Query jobs with filtering, ordering and pagination. `count` is
    /// computed with the same WHERE clause, without pagination.
    pub async fn query_jobs(
        &self,
        filters: &[JobFilter],
        page: &PageRequest,
        order: &OrderBy,
        security: Option<Condition>,
    ) -> AppResult<(Vec<job::Model>, u64)> {
        page.validate()?;

        let mut condition = compile_filters(filters);
        if let Some(security) = security {
            condition = condition.add(security);
        }

        let select = job::Entity::find().filter(condition);

        let total = select
            .clone()
            .count(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to count jobs: {}", e)))?;

        let column = sort_column(order.field);
        let mut select = match order.direction {
            SortDirection::Asc => select.order_by_asc(column),
            SortDirection::Desc => select.order_by_desc(column),
        };

        if let Some(limit) = page.limit() {
            select = select.offset(page.offset()).limit(limit);
        }

        let jobs = select
            .all(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to query jobs: {}", e)))?;

        Ok((jobs, total))
    }
}

/// Map a whitelisted sort field to its column.
fn sort_column(field: SortField) -> job::Column {
    match field {
        SortField::JobId => job::Column::JobId,
        SortField::Cluster => job::Column::Cluster,
        SortField::SubCluster => job::Column::SubCluster,
        SortField::Partition => job::Column::Partition,
        SortField::Project => job::Column::Project,
        SortField::User => job::Column::Username,
        SortField::StartTime => job::Column::StartTime,
        SortField::Duration => job::Column::Duration,
        SortField::NumNodes => job::Column::NumNodes,
        SortField::NumHwthreads => job::Column::NumHwthreads,
        SortField::NumAcc => job::Column::NumAcc,
        SortField::Energy => job::Column::Energy,
    }
}

fn string_condition(column: job::Column, filter: &StringFilter) -> Condition {
    let mut cond = Condition::all();
    if let Some(eq) = &filter.eq {
        cond = cond.add(column.eq(eq.clone()));
    }
    if let Some(contains) = &filter.contains {
        cond = cond.add(column.like(format!("%{}%", contains)));
    }
    if let Some(prefix) = &filter.starts_with {
        cond = cond.add(column.like(format!("{}%", prefix)));
    }
    if let Some(suffix) = &filter.ends_with {
        cond = cond.add(column.like(format!("%{}", suffix)));
    }
    cond
}

/// Compile validated filters into a WHERE condition. Multiple filter objects
/// AND-compose, as do the fields inside each one; every user-provided string
/// is a bound value.
pub fn compile_filters(filters: &[JobFilter]) -> Condition {
    let mut all = Condition::all();

    for f in filters {
        if let Some(cluster) = &f.cluster {
            all = all.add(string_condition(job::Column::Cluster, cluster));
        }
        if let Some(sub_cluster) = &f.sub_cluster {
            all = all.add(string_condition(job::Column::SubCluster, sub_cluster));
        }
        if let Some(partition) = &f.partition {
            all = all.add(string_condition(job::Column::Partition, partition));
        }
        if let Some(project) = &f.project {
            all = all.add(string_condition(job::Column::Project, project));
        }
        if let Some(user) = &f.user {
            all = all.add(string_condition(job::Column::Username, user));
        }
        if let Some(job_id) = &f.job_id {
            let mut cond = Condition::all();
            if let Some(eq) = &job_id.eq {
                cond = cond.add(Expr::cust_with_values("CAST(job_id AS TEXT) = $1", [eq.clone()]));
            }
            if let Some(contains) = &job_id.contains {
                cond = cond.add(Expr::cust_with_values(
                    "CAST(job_id AS TEXT) LIKE $1",
                    [format!("%{}%", contains)],
                ));
            }
            all = all.add(cond);
        }
        if let Some(job_name) = &f.job_name {
            if let Some(contains) = &job_name.contains {
                all = all.add(Expr::cust_with_values(
                    "meta_data->>'jobName' ILIKE $1",
                    [format!("%{}%", contains)],
                ));
            }
        }
        if let Some(array_job_id) = f.array_job_id {
            all = all.add(job::Column::ArrayJobId.eq(array_job_id));
        }
        if let Some(states) = &f.state {
            let values: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
            all = all.add(job::Column::JobState.is_in(values));
        }
        if let Some(range) = &f.num_nodes {
            all = all.add(job::Column::NumNodes.between(range.from, range.to));
        }
        if let Some(range) = &f.num_accelerators {
            all = all.add(job::Column::NumAcc.between(range.from, range.to));
        }
        if let Some(range) = &f.duration {
            all = all.add(job::Column::Duration.between(range.from, range.to));
        }
        if let Some(range) = &f.start_time {
            if let Some(from) = range.from {
                all = all.add(job::Column::StartTime.gte(from));
            }
            if let Some(to) = range.to {
                all = all.add(job::Column::StartTime.lte(to));
            }
        }
        if let Some(tags) = &f.tags {
            let sub = Query::select()
                .column(job_tag::Column::JobId)
                .from(job_tag::Entity)
                .and_where(job_tag::Column::TagId.is_in(tags.clone()))
                .to_owned();
            all = all.add(job::Column::Id.in_subquery(sub));
        }
    }

    all
}

/// Visibility restriction derived from the principal: admin and support see
/// everything, managers their projects plus their own jobs, everyone else
/// only their own jobs.
pub fn security_condition(principal: &AuthenticatedUser) -> Option<Condition> {
    use crate::models::Role;

    if principal.sees_all_jobs() {
        return None;
    }

    if principal.has_role(Role::Manager) {
        let mut any = Condition::any().add(job::Column::Username.eq(principal.username.clone()));
        if !principal.projects.is_empty() {
            any = any.add(job::Column::Project.is_in(principal.projects.clone()));
        }
        return Some(any);
    }

    Some(Condition::all().add(job::Column::Username.eq(principal.username.clone())))
}
