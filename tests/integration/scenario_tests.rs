//! End-to-end scenarios over the HTTP surface, the GraphQL schema and the
//! archiver, backed by a scripted database connection so every path runs
//! in-process without a live PostgreSQL.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{App, test, web};
use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult, Value};

use jobarchive_lib::api;
use jobarchive_lib::archive::fs::FsArchive;
use jobarchive_lib::archive::{ArchiveKey, ArchiveStore};
use jobarchive_lib::auth::hash_token;
use jobarchive_lib::db::DbPool;
use jobarchive_lib::db::stats::HistoPoint;
use jobarchive_lib::entity::{job, user};
use jobarchive_lib::metricdata::MetricDataRepos;
use jobarchive_lib::metricdata::stub::{StubMetricRepo, sample_job_meta, sample_metric_block};
use jobarchive_lib::models::{
    AuthenticatedUser, Cluster, ClusterRegistry, Float, JobState, MetricScope, MonitoringStatus,
    Role,
};
use jobarchive_lib::services::{Archiver, ArchiverContext};

const API_TOKEN: &str = "ja_integration_test_token";

fn api_user() -> user::Model {
    user::Model {
        username: "scheduler".to_string(),
        name: None,
        email: None,
        roles: serde_json::json!(["api", "admin"]),
        projects: serde_json::json!([]),
        token_hash: Some(hash_token(API_TOKEN)),
        ui_config: None,
        created_at: chrono::Utc::now(),
    }
}

fn job_row(dbid: i64, job_id: i64, cluster: &str, start_time: i64, state: &str, duration: i32) -> job::Model {
    job::Model {
        id: dbid,
        job_id,
        cluster: cluster.to_string(),
        sub_cluster: "main".to_string(),
        partition: Some("default".to_string()),
        project: None,
        username: "testuser".to_string(),
        array_job_id: None,
        num_nodes: 1,
        num_hwthreads: 8,
        num_acc: 0,
        exclusive: 1,
        smt: 1,
        job_state: state.to_string(),
        monitoring_status: "running_or_archiving".to_string(),
        start_time,
        duration,
        walltime: 0,
        resources: serde_json::json!([{"hostname": "testhost", "hwthreads": [0,1,2,3,4,5,6,7]}]),
        meta_data: None,
        footprint: None,
        energy_footprint: None,
        statistics: None,
        energy: 0.0,
    }
}

fn test_cluster(metrics: serde_json::Value) -> Cluster {
    serde_json::from_value(serde_json::json!({
        "name": "testcluster",
        "subClusters": [{
            "name": "main",
            "nodes": "testhost",
            "socketsPerNode": 2,
            "coresPerSocket": 4
        }],
        "metricConfig": metrics
    }))
    .unwrap()
}

fn test_registry() -> Arc<ClusterRegistry> {
    Arc::new(ClusterRegistry::new(vec![test_cluster(serde_json::json!([
        {"name": "load_one", "unit": {"base": ""}, "scope": "node", "timestep": 60, "footprint": "avg"}
    ]))]))
}

/// An archiver whose workers have already drained: `stop_job` can enqueue
/// without anything consuming the scripted connection in the background.
async fn idle_archiver(pool: &DbPool, registry: &Arc<ClusterRegistry>) -> Arc<Archiver> {
    let archiver = Archiver::start(
        1,
        ArchiverContext {
            pool: pool.clone(),
            archive: Arc::new(FsArchive::new(std::env::temp_dir().join("jobarchive-idle"))),
            repos: MetricDataRepos::default(),
            registry: registry.clone(),
        },
    );
    archiver.shutdown(Duration::from_secs(1)).await;
    archiver
}

fn spare_exec_results() -> Vec<MockExecResult> {
    (0..4)
        .map(|_| MockExecResult {
            last_insert_id: 0,
            rows_affected: 1,
        })
        .collect()
}

/// S1, API half: start over HTTP, then stop with a matching natural key.
#[actix_web::test]
async fn test_start_then_stop_over_http() {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        // start_job: auth lookup, duplicate check, insert returning
        .append_query_results([vec![api_user()]])
        .append_query_results([Vec::<job::Model>::new()])
        .append_query_results([vec![job_row(42, 123, "testcluster", 123456789, "running", 0)]])
        // stop_job: auth lookup, natural-key find, reload after the update
        .append_query_results([vec![api_user()]])
        .append_query_results([vec![job_row(42, 123, "testcluster", 123456789, "running", 0)]])
        .append_query_results([vec![job_row(42, 123, "testcluster", 123456789, "completed", 1000)]])
        .append_exec_results(spare_exec_results())
        .into_connection();
    let pool = DbPool::from_connection(db);
    let registry = test_registry();
    let archiver = idle_archiver(&pool, &registry).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(archiver.clone()))
            .service(web::scope("/api").configure(api::configure_job_routes)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/jobs/start_job/")
        .insert_header(("X-API-Key", API_TOKEN))
        .set_json(serde_json::json!({
            "jobId": 123, "cluster": "testcluster", "partition": "default",
            "user": "testuser", "numNodes": 1, "numHwthreads": 8,
            "exclusive": 1, "smt": 1,
            "resources": [{"hostname": "testhost", "hwthreads": [0,1,2,3,4,5,6,7]}],
            "startTime": 123456789
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 201);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["id"], 42);

    let req = test::TestRequest::post()
        .uri("/api/jobs/stop_job/")
        .insert_header(("X-API-Key", API_TOKEN))
        .set_json(serde_json::json!({
            "jobId": 123, "cluster": "testcluster",
            "startTime": 123456789, "stopTime": 123457789,
            "jobState": "completed"
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["jobState"], "completed");
    assert_eq!(body["duration"], 1000);
}

/// S1, archiver half: a stopped job is fetched from the stub driver,
/// aggregated, and lands durably in the archive with its energy figures.
#[tokio::test]
async fn test_archiver_drains_stopped_job_into_archive() {
    let dir = tempfile::tempdir().unwrap();
    let archive: Arc<dyn ArchiveStore> = Arc::new(FsArchive::new(dir.path().to_path_buf()));

    let stopped = {
        let mut row = job_row(42, 123, "testcluster", 123456789, "completed", 10_000);
        row.duration = 10_000;
        row
    };
    let archived = {
        let mut row = stopped.clone();
        row.monitoring_status = "archiving_successful".to_string();
        row
    };
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        // pipeline: load job, reload for the aggregate update, update returning
        .append_query_results([vec![stopped.clone()]])
        .append_query_results([vec![stopped]])
        .append_query_results([vec![archived]])
        .append_exec_results(spare_exec_results())
        .into_connection();
    let pool = DbPool::from_connection(db);

    // 360 W over 10000 s on one node is exactly 1.0 kWh.
    let mut stub = StubMetricRepo::with_metrics(&["load_one", "power"]);
    let mut power_block = sample_metric_block("power");
    power_block.series[0].statistics.avg = Float(360.0);
    stub.data.insert("power".to_string(), power_block.clone());

    let mut repos = MetricDataRepos::default();
    repos.insert("testcluster", Arc::new(stub));

    let registry = Arc::new(ClusterRegistry::new(vec![test_cluster(serde_json::json!([
        {"name": "load_one", "unit": {"base": ""}, "scope": "node", "timestep": 60, "footprint": "avg"},
        {"name": "power", "unit": {"base": "W"}, "scope": "node", "timestep": 60, "energy": "power"}
    ]))]));

    let archiver = Archiver::start(
        1,
        ArchiverContext {
            pool,
            archive: archive.clone(),
            repos,
            registry,
        },
    );
    assert!(archiver.enqueue(42));
    archiver.shutdown(Duration::from_secs(5)).await;

    let key = ArchiveKey {
        dbid: 42,
        cluster: "testcluster".to_string(),
        start_time: 123456789,
    };
    assert!(archive.has(&key).await);

    let meta = archive.load_meta(&key).await.unwrap();
    assert_eq!(meta.job_state, JobState::Completed);
    assert_eq!(meta.monitoring_status, MonitoringStatus::ArchivingSuccessful);
    assert_eq!(meta.statistics["load_one"].avg, 1.0);
    assert_eq!(meta.footprint["load_one_avg"], 1.0);
    assert_eq!(meta.energy_footprint["power"], 1.0);
    assert_eq!(meta.energy, 1.0);

    // The archived series equal what the driver returned.
    let data = archive.load_data(&key).await.unwrap();
    assert_eq!(
        data["load_one"][&MetricScope::Node],
        sample_metric_block("load_one")
    );
    assert_eq!(data["power"][&MetricScope::Node], power_block);
}

/// S2: a second start of the same (job_id, cluster) inside the 24 h window
/// is a duplicate; outside it, a legitimate re-submission.
#[tokio::test]
async fn test_duplicate_window_repository() {
    let mut meta = sample_job_meta(0);
    meta.id = None;
    meta.job_id = 7;

    // Within the window: rejected.
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![job_row(1, 7, "testcluster", 1000, "running", 0)]])
        .into_connection();
    meta.start_time = 1001;
    let err = DbPool::from_connection(db).start_job(&meta).await.unwrap_err();
    assert!(err.to_string().contains("Duplicate"), "got: {}", err);

    // Exactly one window later: accepted.
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![job_row(1, 7, "testcluster", 1000, "running", 0)]])
        .append_query_results([vec![job_row(2, 7, "testcluster", 1000 + 86_400, "running", 0)]])
        .append_exec_results(spare_exec_results())
        .into_connection();
    meta.start_time = 1000 + 86_400;
    let dbid = DbPool::from_connection(db).start_job(&meta).await.unwrap();
    assert_eq!(dbid, 2);
}

/// S2 over HTTP: the duplicate surfaces as 422.
#[actix_web::test]
async fn test_duplicate_start_is_422() {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![api_user()]])
        .append_query_results([vec![job_row(1, 7, "c", 1000, "running", 0)]])
        .into_connection();
    let pool = DbPool::from_connection(db);
    let registry = Arc::new(ClusterRegistry::new(vec![{
        let mut cluster = test_cluster(serde_json::json!([]));
        cluster.name = "c".to_string();
        cluster
    }]));
    let archiver = idle_archiver(&pool, &registry).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(archiver.clone()))
            .service(web::scope("/api").configure(api::configure_job_routes)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/jobs/start_job/")
        .insert_header(("X-API-Key", API_TOKEN))
        .set_json(serde_json::json!({
            "jobId": 7, "cluster": "c", "user": "testuser", "numNodes": 1,
            "resources": [{"hostname": "testhost"}], "startTime": 1001
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 422);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "DUPLICATE");
}

/// S3: a stop time at or before the start time is a 400 with the exact
/// message, and the row is never touched.
#[actix_web::test]
async fn test_stop_with_stale_timestamp_is_400() {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![api_user()]])
        .append_query_results([vec![job_row(5, 9, "testcluster", 2000, "running", 0)]])
        .into_connection();
    let pool = DbPool::from_connection(db);
    let registry = test_registry();
    let archiver = idle_archiver(&pool, &registry).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(archiver.clone()))
            .service(web::scope("/api").configure(api::configure_job_routes)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/jobs/stop_job/")
        .insert_header(("X-API-Key", API_TOKEN))
        .set_json(serde_json::json!({
            "jobId": 9, "cluster": "testcluster",
            "startTime": 2000, "stopTime": 1999
        }))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 400);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert!(
        body["message"]
            .as_str()
            .unwrap()
            .contains("stopTime must be larger than startTime"),
        "got: {}",
        body
    );
}

/// Stop without a start time and more than one running match: ambiguous.
#[actix_web::test]
async fn test_stop_without_start_time_is_ambiguous() {
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![api_user()]])
        .append_query_results([vec![
            job_row(11, 9, "testcluster", 90_000, "running", 0),
            job_row(10, 9, "testcluster", 1000, "running", 0),
        ]])
        .into_connection();
    let pool = DbPool::from_connection(db);
    let registry = test_registry();
    let archiver = idle_archiver(&pool, &registry).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(archiver.clone()))
            .service(web::scope("/api").configure(api::configure_job_routes)),
    )
    .await;

    let req = test::TestRequest::post()
        .uri("/api/jobs/stop_job/")
        .insert_header(("X-API-Key", API_TOKEN))
        .set_json(serde_json::json!({"jobId": 9, "stopTime": 100_000}))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 422);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert!(
        body["message"].as_str().unwrap().contains("startTime"),
        "got: {}",
        body
    );
}

fn count_row(count: i64) -> BTreeMap<&'static str, Value> {
    BTreeMap::from([("num_items", Value::BigInt(Some(count)))])
}

/// S4, REST half: page 2 of 25 completed jobs holds 10 items.
#[actix_web::test]
async fn test_query_paging_over_http() {
    let page_rows: Vec<job::Model> = (1..=10)
        .map(|i| job_row(i, 100 + i, "c", 1000 + i, "completed", 3600))
        .collect();
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![api_user()]])
        .append_query_results([vec![count_row(25)]])
        .append_query_results([page_rows])
        .into_connection();
    let pool = DbPool::from_connection(db);
    let registry = test_registry();
    let archiver = idle_archiver(&pool, &registry).await;

    let app = test::init_service(
        App::new()
            .app_data(web::Data::new(pool.clone()))
            .app_data(web::Data::from(registry.clone()))
            .app_data(web::Data::from(archiver.clone()))
            .service(web::scope("/api").configure(api::configure_job_routes)),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/jobs/?cluster=c&items-per-page=10&page=2")
        .insert_header(("X-API-Key", API_TOKEN))
        .to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status().as_u16(), 200);
    let body: serde_json::Value = test::read_body_json(resp).await;
    assert_eq!(body["jobs"].as_array().unwrap().len(), 10);
}

/// S4, GraphQL half: the same WHERE clause yields count=25 next to the page.
#[tokio::test]
async fn test_query_count_over_graphql() {
    let page_rows: Vec<job::Model> = (1..=10)
        .map(|i| job_row(i, 100 + i, "c", 1000 + i, "completed", 3600))
        .collect();
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![count_row(25)]])
        .append_query_results([page_rows])
        .into_connection();
    let pool = DbPool::from_connection(db);

    let dir = tempfile::tempdir().unwrap();
    let archive: Arc<dyn ArchiveStore> = Arc::new(FsArchive::new(dir.path().to_path_buf()));
    let schema = jobarchive_lib::graphql::build_schema(
        pool,
        test_registry(),
        archive,
        MetricDataRepos::default(),
    );

    let principal = AuthenticatedUser::new("admin", [Role::Admin]);
    let resp = schema
        .execute(
            async_graphql::Request::new(
                r#"{ jobs(filter: [{cluster: {eq: "c"}}], page: {page: 2, itemsPerPage: 10}) {
                    count
                    items { id }
                } }"#,
            )
            .data(principal),
        )
        .await;
    assert!(resp.errors.is_empty(), "{:?}", resp.errors);

    let data = serde_json::to_value(&resp.data).unwrap();
    assert_eq!(data["jobs"]["count"], 25);
    assert_eq!(data["jobs"]["items"].as_array().unwrap().len(), 10);
}

/// S5: one failing metric out of two marks the job archiving_failed while
/// the surviving metric still reaches the archive; the row stays completed.
#[tokio::test]
async fn test_backend_failure_marks_archiving_failed() {
    let dir = tempfile::tempdir().unwrap();
    let archive: Arc<dyn ArchiveStore> = Arc::new(FsArchive::new(dir.path().to_path_buf()));

    let completed = job_row(7, 700, "testcluster", 5000, "completed", 1000);
    let failed = {
        let mut row = completed.clone();
        row.monitoring_status = "archiving_failed".to_string();
        row
    };
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([vec![completed.clone()]])
        .append_query_results([vec![completed]])
        .append_query_results([vec![failed]])
        .append_exec_results(spare_exec_results())
        .into_connection();
    let pool = DbPool::from_connection(db);

    let mut stub = StubMetricRepo::with_metrics(&["load_one", "mem_bw"]);
    stub.fail_metrics.insert("mem_bw".to_string());
    let mut repos = MetricDataRepos::default();
    repos.insert("testcluster", Arc::new(stub));

    let registry = Arc::new(ClusterRegistry::new(vec![test_cluster(serde_json::json!([
        {"name": "load_one", "unit": {"base": ""}, "scope": "node", "timestep": 60},
        {"name": "mem_bw", "unit": {"base": "B/s"}, "scope": "node", "timestep": 60}
    ]))]));

    let archiver = Archiver::start(
        1,
        ArchiverContext {
            pool,
            archive: archive.clone(),
            repos,
            registry,
        },
    );
    assert!(archiver.enqueue(7));
    archiver.shutdown(Duration::from_secs(5)).await;

    let key = ArchiveKey {
        dbid: 7,
        cluster: "testcluster".to_string(),
        start_time: 5000,
    };
    let meta = archive.load_meta(&key).await.unwrap();
    assert_eq!(meta.monitoring_status, MonitoringStatus::ArchivingFailed);
    assert_eq!(meta.job_state, JobState::Completed);
    assert!(meta.statistics.contains_key("load_one"));
    assert!(!meta.statistics.contains_key("mem_bw"));

    let data = archive.load_data(&key).await.unwrap();
    assert!(data.contains_key("load_one"));
    assert!(!data.contains_key("mem_bw"));
}

/// S6: durations 60, 600, 3600, 3600 produce one bucket per distinct raw
/// value, emitted as integer hours.
#[tokio::test]
async fn test_walltime_histogram() {
    let rows: Vec<BTreeMap<&str, Value>> = [(60i64, 1i64), (600, 1), (3600, 2)]
        .iter()
        .map(|&(value, count)| {
            BTreeMap::from([
                ("value", Value::BigInt(Some(value))),
                ("count", Value::BigInt(Some(count))),
            ])
        })
        .collect();
    let db = MockDatabase::new(DatabaseBackend::Postgres)
        .append_query_results([rows])
        .into_connection();
    let pool = DbPool::from_connection(db);

    let hist = pool.hist_duration(&[], None).await.unwrap();
    assert_eq!(
        hist,
        vec![
            HistoPoint { value: 0, count: 1 },
            HistoPoint { value: 0, count: 1 },
            HistoPoint { value: 1, count: 2 },
        ]
    );
}
