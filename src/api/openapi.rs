//! OpenAPI documentation configuration.

use utoipa::OpenApi;

use crate::{api, error, models, services};

/// OpenAPI documentation.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Job Archive Server",
        version = "0.4.0",
        description = "Control plane for HPC job monitoring: lifecycle ingest, archival and catalog queries"
    ),
    servers(
        (url = "/", description = "Local server")
    ),
    paths(
        // Health endpoints
        api::health::health,
        api::health::ready,
        // Job endpoints
        api::jobs::start_job,
        api::jobs::stop_job_by_key,
        api::jobs::stop_job_by_id,
        api::jobs::import_job,
        api::jobs::list_jobs,
        api::jobs::get_job,
        api::jobs::get_job_status,
        api::jobs::tag_job,
        api::jobs::job_metrics,
        api::jobs::delete_job,
        api::jobs::flush_jobs,
        // Machine state endpoints
        api::machine_state::put_machine_state,
        api::machine_state::get_machine_state,
    ),
    components(
        schemas(
            // Common
            error::ErrorResponse,
            // Health
            api::health::HealthResponse,
            api::health::ReadyResponse,
            // Jobs
            models::JobMeta,
            models::JobState,
            models::MonitoringStatus,
            models::Resource,
            models::TagSpec,
            models::Unit,
            models::JobStatistics,
            models::StopJobRequest,
            models::StartJobResponse,
            models::JobArchiveStatus,
            api::jobs::ListJobsQuery,
            api::jobs::JobListResponse,
            api::jobs::JobMetricsQuery,
            api::jobs::JobMetricsResponse,
            services::importer::ImportPayload,
        )
    ),
    tags(
        (name = "Jobs", description = "Job lifecycle and catalog"),
        (name = "MachineState", description = "Per-host state snapshots"),
        (name = "Health", description = "Service health"),
    )
)]
pub struct ApiDoc;
