//! Job API handlers: scheduler ingest (start/stop/import), catalog reads and
//! tagging.

use actix_web::{HttpResponse, web};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::archive::ArchiveStore;
use crate::db::DbPool;
use crate::db::jobs::{model_to_meta, security_condition};
use crate::error::{AppError, AppResult};
use crate::metricdata::{MetricDataRepos, load_job_data};
use crate::models::{
    ClusterRegistry, JobArchiveStatus, JobFilter, JobMeta, JobState, MetricScope,
    MonitoringStatus, OrderBy, PageRequest, Role, StartJobResponse, StopJobRequest, StringFilter,
    TagSpec, TimeRange,
};
use crate::services::Archiver;
use crate::services::importer::{ImportPayload, import_job as import_one};

/// Query parameters of `GET /jobs/`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ListJobsQuery {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub cluster: Option<String>,
    /// Unix range "from-to"
    #[serde(rename = "start-time", default)]
    pub start_time: Option<String>,
    #[serde(default)]
    pub page: Option<i32>,
    #[serde(rename = "items-per-page", default)]
    pub items_per_page: Option<i32>,
    #[serde(rename = "with-metadata", default)]
    pub with_metadata: Option<bool>,
}

/// Response of `GET /jobs/`.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobListResponse {
    pub jobs: Vec<JobMeta>,
}

/// Wrapper shape of `GET /jobs/metrics/{id}`.
#[derive(Debug, Serialize, ToSchema)]
pub struct JobMetricsResponse {
    pub data: serde_json::Value,
}

fn parse_time_range(raw: &str) -> AppResult<TimeRange> {
    let (from, to) = raw.split_once('-').ok_or_else(|| {
        AppError::InvalidInput("start-time must have the form <from>-<to>".to_string())
    })?;
    let from: i64 = from.parse().map_err(|_| {
        AppError::InvalidInput("start-time bounds must be unix timestamps".to_string())
    })?;
    let to: i64 = to.parse().map_err(|_| {
        AppError::InvalidInput("start-time bounds must be unix timestamps".to_string())
    })?;
    Ok(TimeRange {
        from: Some(from),
        to: Some(to),
    })
}

/// Check that the principal may see this row; managers are restricted to
/// their projects, plain users to their own jobs.
fn check_job_visibility(
    principal: &crate::models::AuthenticatedUser,
    model: &crate::entity::job::Model,
) -> AppResult<()> {
    if principal.sees_all_jobs() || model.username == principal.username {
        return Ok(());
    }
    if principal.has_role(Role::Manager) {
        if let Some(project) = &model.project {
            if principal.projects.iter().any(|p| p == project) {
                return Ok(());
            }
        }
    }
    Err(AppError::Forbidden(
        "you are not allowed to see this job".to_string(),
    ))
}

/// Register a started job.
///
/// The scheduler reports a new job; the catalog row is created in state
/// `running`. A conflicting start within 24 hours is rejected.
#[utoipa::path(
    post,
    path = "/api/jobs/start_job/",
    tag = "Jobs",
    request_body = JobMeta,
    responses(
        (status = 201, description = "Job registered", body = StartJobResponse),
        (status = 400, description = "Validation failed", body = crate::error::ErrorResponse),
        (status = 422, description = "Duplicate within 24 hours", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn start_job(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    registry: web::Data<ClusterRegistry>,
    body: web::Json<JobMeta>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Api)?;

    let mut meta = body.into_inner();
    meta.sanity_checks()?;

    let cluster = registry.require(&meta.cluster)?;
    let hostname = meta.resources.first().map(|r| r.hostname.as_str());
    meta.sub_cluster = Some(cluster.assign_sub_cluster(meta.sub_cluster.as_deref(), hostname)?);

    let tags = meta.tags.take();
    let dbid = pool.start_job(&meta).await?;

    if let Some(tags) = tags {
        for tag in tags {
            pool.add_tag_or_create(dbid, &tag.tag_type, &tag.name, tag.scope.as_deref())
                .await?;
        }
    }

    info!(
        "Job started: dbid={}, job_id={}, cluster={}, user={}",
        dbid, meta.job_id, meta.cluster, meta.user
    );

    Ok(HttpResponse::Created().json(StartJobResponse { id: dbid }))
}

async fn stop_job_common(
    pool: &DbPool,
    archiver: &Archiver,
    model: crate::entity::job::Model,
    req: StopJobRequest,
) -> AppResult<HttpResponse> {
    let current_state = JobState::parse(&model.job_state)
        .ok_or_else(|| AppError::Internal(format!("invalid job_state '{}'", model.job_state)))?;
    if current_state != JobState::Running {
        return Err(AppError::PreconditionFailed(format!(
            "job {} is in state '{}', only running jobs can be stopped",
            model.id, model.job_state
        )));
    }

    if req.stop_time <= model.start_time {
        return Err(AppError::InvalidInput(
            "stopTime must be larger than startTime".to_string(),
        ));
    }

    let state = req.job_state.unwrap_or(JobState::Completed);
    if !current_state.may_transition_to(state) {
        return Err(AppError::InvalidInput(format!(
            "'{}' is not a valid stop state",
            state
        )));
    }

    let monitoring_status = MonitoringStatus::parse(&model.monitoring_status)
        .unwrap_or(MonitoringStatus::RunningOrArchiving);
    let duration = (req.stop_time - model.start_time) as i32;

    let dbid = model.id;
    let updated = pool.stop_job(dbid, duration, state, monitoring_status).await?;

    // Fire and forget: the reply does not wait for blobs to become durable.
    archiver.enqueue(dbid);

    info!(
        "Job stopped: dbid={}, state={}, duration={}",
        dbid, state, duration
    );

    Ok(HttpResponse::Ok().json(model_to_meta(&updated)?))
}

/// Stop a job addressed by its natural key.
#[utoipa::path(
    post,
    path = "/api/jobs/stop_job/",
    tag = "Jobs",
    request_body = StopJobRequest,
    responses(
        (status = 200, description = "Job stopped", body = JobMeta),
        (status = 400, description = "Validation failed", body = crate::error::ErrorResponse),
        (status = 422, description = "Not found or not running", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn stop_job_by_key(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    archiver: web::Data<Archiver>,
    body: web::Json<StopJobRequest>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Api)?;

    let req = body.into_inner();
    let job_id = req
        .job_id
        .ok_or_else(|| AppError::InvalidInput("jobId is required".to_string()))?;

    let model = if req.start_time.is_some() {
        match pool
            .find_job(job_id, req.cluster.as_deref(), req.start_time)
            .await
        {
            Ok(model) => model,
            // The scheduler refers to a job the catalog never saw: 422, not 404.
            Err(AppError::NotFound(msg)) => return Err(AppError::PreconditionFailed(msg)),
            Err(e) => return Err(e),
        }
    } else {
        // Without a start time the job id alone may match several
        // re-submissions; only a single running row is unambiguous.
        let matches = pool.find_all_jobs(job_id, req.cluster.as_deref()).await?;
        let mut running = matches
            .iter()
            .filter(|m| m.job_state == JobState::Running.as_str());
        match (running.next(), running.next()) {
            (Some(model), None) => model.clone(),
            (Some(_), Some(_)) => {
                return Err(AppError::PreconditionFailed(format!(
                    "job {} matches multiple running rows, pass startTime to disambiguate",
                    job_id
                )));
            }
            (None, _) => match matches.into_iter().next() {
                Some(model) => model,
                None => {
                    return Err(AppError::PreconditionFailed(format!(
                        "Job {} not found",
                        job_id
                    )));
                }
            },
        }
    };

    stop_job_common(&pool, &archiver, model, req).await
}

/// Stop a job addressed by dbid.
#[utoipa::path(
    post,
    path = "/api/jobs/stop_job/{id}",
    tag = "Jobs",
    params(("id" = i64, Path, description = "Job dbid")),
    request_body = StopJobRequest,
    responses(
        (status = 200, description = "Job stopped", body = JobMeta),
        (status = 400, description = "Validation failed", body = crate::error::ErrorResponse),
        (status = 422, description = "Not found or not running", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn stop_job_by_id(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    archiver: web::Data<Archiver>,
    path: web::Path<i64>,
    body: web::Json<StopJobRequest>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Api)?;

    let model = match pool.find_job_by_id(path.into_inner()).await {
        Ok(model) => model,
        Err(AppError::NotFound(msg)) => return Err(AppError::PreconditionFailed(msg)),
        Err(e) => return Err(e),
    };

    stop_job_common(&pool, &archiver, model, body.into_inner()).await
}

/// Import a fully terminated job with its metric data.
#[utoipa::path(
    post,
    path = "/api/jobs/import/",
    tag = "Jobs",
    request_body = ImportPayload,
    responses(
        (status = 200, description = "Job imported"),
        (status = 422, description = "Import rejected", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn import_job(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    archive: web::Data<dyn ArchiveStore>,
    registry: web::Data<ClusterRegistry>,
    body: web::Json<ImportPayload>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Api)?;

    let payload = body.into_inner();
    import_one(
        &pool,
        archive.as_ref(),
        &registry,
        payload.meta,
        payload.data,
    )
    .await
    .map_err(|e| match e {
        // The import surface reports every rejection as unprocessable.
        AppError::InvalidInput(msg) | AppError::Duplicate(msg) => AppError::PreconditionFailed(msg),
        other => other,
    })?;

    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "OK"})))
}

/// List jobs with simple query-string filters.
#[utoipa::path(
    get,
    path = "/api/jobs/",
    tag = "Jobs",
    params(
        ("state" = Option<String>, Query, description = "Job state filter"),
        ("cluster" = Option<String>, Query, description = "Cluster filter"),
        ("start-time" = Option<String>, Query, description = "Unix range from-to"),
        ("page" = Option<i32>, Query, description = "Page number (1-based)"),
        ("items-per-page" = Option<i32>, Query, description = "Page size, -1 for unlimited"),
        ("with-metadata" = Option<bool>, Query, description = "Include metadata blobs"),
    ),
    responses(
        (status = 200, description = "Matching jobs", body = JobListResponse),
        (status = 400, description = "Invalid query", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn list_jobs(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    query: web::Query<ListJobsQuery>,
) -> AppResult<HttpResponse> {
    let query = query.into_inner();

    let mut filter = JobFilter::default();
    if let Some(state) = &query.state {
        let state = JobState::parse(state)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown job state '{}'", state)))?;
        filter.state = Some(vec![state]);
    }
    if let Some(cluster) = &query.cluster {
        filter.cluster = Some(StringFilter::eq(cluster.clone()));
    }
    if let Some(raw) = &query.start_time {
        filter.start_time = Some(parse_time_range(raw)?);
    }

    let page = PageRequest {
        page: query.page.unwrap_or(1),
        items_per_page: query.items_per_page.unwrap_or(25),
    };

    let (models, _total) = pool
        .query_jobs(
            &[filter],
            &page,
            &OrderBy::default(),
            security_condition(&auth.user),
        )
        .await?;

    let with_metadata = query.with_metadata.unwrap_or(false);
    let mut jobs = Vec::with_capacity(models.len());
    for model in &models {
        let mut meta = model_to_meta(model)?;
        if !with_metadata {
            meta.meta_data = None;
        }
        jobs.push(meta);
    }

    Ok(HttpResponse::Ok().json(JobListResponse { jobs }))
}

/// Fetch one job with its tags.
#[utoipa::path(
    get,
    path = "/api/jobs/{id}",
    tag = "Jobs",
    params(("id" = i64, Path, description = "Job dbid")),
    responses(
        (status = 200, description = "Job", body = JobMeta),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn get_job(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let model = pool.find_job_by_id(path.into_inner()).await?;
    check_job_visibility(&auth.user, &model)?;

    let mut meta = model_to_meta(&model)?;
    let tags = pool.job_tags(model.id, &auth.user).await?;
    meta.tags = Some(
        tags.into_iter()
            .map(|t| TagSpec {
                tag_type: t.tag_type,
                name: t.tag_name,
                scope: Some(t.tag_scope),
            })
            .collect(),
    );

    Ok(HttpResponse::Ok().json(meta))
}

/// Lightweight archival status, pollable after `stop_job`.
#[utoipa::path(
    get,
    path = "/api/jobs/{id}/status",
    tag = "Jobs",
    params(("id" = i64, Path, description = "Job dbid")),
    responses(
        (status = 200, description = "Archival status", body = JobArchiveStatus),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn get_job_status(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    let model = pool.find_job_by_id(path.into_inner()).await?;
    check_job_visibility(&auth.user, &model)?;

    Ok(HttpResponse::Ok().json(JobArchiveStatus {
        id: model.id,
        state: JobState::parse(&model.job_state)
            .ok_or_else(|| AppError::Internal(format!("invalid job_state '{}'", model.job_state)))?,
        monitoring_status: MonitoringStatus::parse(&model.monitoring_status).ok_or_else(|| {
            AppError::Internal(format!(
                "invalid monitoring_status '{}'",
                model.monitoring_status
            ))
        })?,
    }))
}

/// Attach tags to a job, creating them as needed.
#[utoipa::path(
    post,
    path = "/api/jobs/tag_job/{id}",
    tag = "Jobs",
    params(("id" = i64, Path, description = "Job dbid")),
    request_body = Vec<TagSpec>,
    responses(
        (status = 200, description = "Job with tags", body = JobMeta),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn tag_job(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    path: web::Path<i64>,
    body: web::Json<Vec<TagSpec>>,
) -> AppResult<HttpResponse> {
    let model = pool.find_job_by_id(path.into_inner()).await?;
    check_job_visibility(&auth.user, &model)?;

    for tag in body.into_inner() {
        let scope = tag.scope.as_deref().unwrap_or("global");
        if !auth.user.may_use_tag_scope(scope) {
            return Err(AppError::Forbidden(format!(
                "tag scope '{}' is not available to you",
                scope
            )));
        }
        pool.add_tag_or_create(model.id, &tag.tag_type, &tag.name, Some(scope))
            .await?;
    }

    let mut meta = model_to_meta(&model)?;
    let tags = pool.job_tags(model.id, &auth.user).await?;
    meta.tags = Some(
        tags.into_iter()
            .map(|t| TagSpec {
                tag_type: t.tag_type,
                name: t.tag_name,
                scope: Some(t.tag_scope),
            })
            .collect(),
    );

    Ok(HttpResponse::Ok().json(meta))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct JobMetricsQuery {
    /// Comma-separated metric selection; empty means all.
    #[serde(default)]
    pub metric: Option<String>,
    /// Comma-separated scope selection; empty means all.
    #[serde(default)]
    pub scope: Option<String>,
}

/// Fetch a job's metric data, live or archived.
///
/// Backend failures are reported in-band: 200 with an `error` object, so the
/// caller can distinguish "no data" from "backend down".
#[utoipa::path(
    get,
    path = "/api/jobs/metrics/{id}",
    tag = "Jobs",
    params(
        ("id" = i64, Path, description = "Job dbid"),
        ("metric" = Option<String>, Query, description = "Comma-separated metric selection"),
        ("scope" = Option<String>, Query, description = "Comma-separated scope selection"),
    ),
    responses(
        (status = 200, description = "Metric data or in-band error", body = JobMetricsResponse),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn job_metrics(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    archive: web::Data<dyn ArchiveStore>,
    repos: web::Data<MetricDataRepos>,
    path: web::Path<i64>,
    query: web::Query<JobMetricsQuery>,
) -> AppResult<HttpResponse> {
    let model = pool.find_job_by_id(path.into_inner()).await?;
    check_job_visibility(&auth.user, &model)?;
    let meta = model_to_meta(&model)?;

    let metrics: Vec<String> = query
        .metric
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect();

    let mut scopes = Vec::new();
    for raw in query
        .scope
        .as_deref()
        .unwrap_or("")
        .split(',')
        .filter(|s| !s.is_empty())
    {
        scopes.push(
            MetricScope::parse(raw)
                .ok_or_else(|| AppError::InvalidInput(format!("unknown scope '{}'", raw)))?,
        );
    }

    match load_job_data(&meta, &metrics, &scopes, &repos, archive.as_ref()).await {
        Ok(data) => {
            let job_metrics: Vec<serde_json::Value> = data
                .into_iter()
                .flat_map(|(name, blocks)| {
                    blocks.into_iter().map(move |(scope, metric)| {
                        serde_json::json!({
                            "name": name,
                            "scope": scope,
                            "metric": metric,
                        })
                    })
                })
                .collect();

            Ok(HttpResponse::Ok().json(JobMetricsResponse {
                data: serde_json::json!({ "jobMetrics": job_metrics }),
            }))
        }
        Err(AppError::BackendUnavailable(msg)) | Err(AppError::BackendError(msg)) => {
            Ok(HttpResponse::Ok().json(serde_json::json!({
                "error": { "message": msg }
            })))
        }
        Err(e) => Err(e),
    }
}

/// Delete one job and its archive blobs (admin only).
#[utoipa::path(
    delete,
    path = "/api/jobs/{id}",
    tag = "Jobs",
    params(("id" = i64, Path, description = "Job dbid")),
    responses(
        (status = 200, description = "Job deleted"),
        (status = 403, description = "Admin only", body = crate::error::ErrorResponse),
        (status = 404, description = "Unknown job", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn delete_job(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
    archive: web::Data<dyn ArchiveStore>,
    path: web::Path<i64>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Admin)?;

    let model = pool.find_job_by_id(path.into_inner()).await?;
    let meta = model_to_meta(&model)?;

    // The job owns its blobs: they go with the row.
    let key = crate::archive::ArchiveKey::from_meta(&meta)?;
    archive.delete_job(&key).await?;
    pool.delete_job(model.id).await?;

    info!("Job deleted: dbid={}", model.id);
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "OK"})))
}

/// Wipe the catalog (admin/reinit only).
#[utoipa::path(
    delete,
    path = "/api/jobs/",
    tag = "Jobs",
    responses(
        (status = 200, description = "Catalog flushed"),
        (status = 403, description = "Admin only", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn flush_jobs(
    auth: crate::auth::ApiAuth,
    pool: web::Data<DbPool>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Admin)?;
    pool.flush().await?;
    Ok(HttpResponse::Ok().json(serde_json::json!({"status": "OK"})))
}

/// Configure job routes.
pub fn configure_job_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/jobs/start_job/").route(web::post().to(start_job)),
    )
    .service(web::resource("/jobs/stop_job/").route(web::post().to(stop_job_by_key)))
    .service(web::resource("/jobs/stop_job/{id}").route(web::post().to(stop_job_by_id)))
    .service(web::resource("/jobs/import/").route(web::post().to(import_job)))
    .service(
        web::resource("/jobs/")
            .route(web::get().to(list_jobs))
            .route(web::delete().to(flush_jobs)),
    )
    .service(web::resource("/jobs/tag_job/{id}").route(web::post().to(tag_job)))
    .service(web::resource("/jobs/metrics/{id}").route(web::get().to(job_metrics)))
    .service(web::resource("/jobs/{id}/status").route(web::get().to(get_job_status)))
    .service(
        web::resource("/jobs/{id}")
            .route(web::get().to(get_job))
            .route(web::delete().to(delete_job)),
    );
}
