//! Integration tests for the archive backends through their public trait.

use jobarchive_lib::archive::fs::FsArchive;
use jobarchive_lib::archive::parquet::ParquetArchive;
use jobarchive_lib::archive::{ArchiveKey, ArchiveStore};
use jobarchive_lib::metricdata::stub::{sample_job_data, sample_job_meta};
use jobarchive_lib::models::{JobState, MonitoringStatus};

fn archived_meta(dbid: i64) -> jobarchive_lib::models::JobMeta {
    let mut meta = sample_job_meta(dbid);
    meta.job_state = JobState::Completed;
    meta.monitoring_status = MonitoringStatus::ArchivingSuccessful;
    meta.duration = 1000;
    meta
}

#[tokio::test]
async fn test_fs_archive_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let archive = FsArchive::new(dir.path().to_path_buf());
    archive.init(false).await.unwrap();

    // version.txt is written on first init
    let version = std::fs::read_to_string(dir.path().join("version.txt")).unwrap();
    assert_eq!(version.trim(), "2");

    let meta = archived_meta(17);
    let data = sample_job_data(&["load_one", "mem_bw"]);
    archive.import_job(&meta, &data).await.unwrap();

    let key = ArchiveKey::from_meta(&meta).unwrap();
    assert!(archive.has(&key).await);
    assert_eq!(archive.load_meta(&key).await.unwrap(), meta);
    assert_eq!(archive.load_data(&key).await.unwrap(), data);

    // Unknown dbid is NotFound, not an empty payload.
    let missing = ArchiveKey {
        dbid: 9999,
        cluster: "testcluster".to_string(),
        start_time: 1,
    };
    assert!(!archive.has(&missing).await);
    assert!(archive.load_meta(&missing).await.is_err());

    archive.delete_job(&key).await.unwrap();
    assert!(!archive.has(&key).await);
}

#[tokio::test]
async fn test_parquet_archive_lifecycle() {
    let dir = tempfile::tempdir().unwrap();
    let archive = ParquetArchive::new(dir.path().to_path_buf(), 64 * 1024 * 1024, None).unwrap();
    archive.init(false).await.unwrap();

    let meta = archived_meta(3);
    let data = sample_job_data(&["load_one"]);
    archive.import_job(&meta, &data).await.unwrap();

    // Readable while still buffered
    let key = ArchiveKey::from_meta(&meta).unwrap();
    assert_eq!(archive.load_meta(&key).await.unwrap(), meta);

    // And after sealing, from a fresh handle
    archive.flush().await.unwrap();
    let reopened = ParquetArchive::new(dir.path().to_path_buf(), 64 * 1024 * 1024, None).unwrap();
    assert_eq!(reopened.load_meta(&key).await.unwrap(), meta);
    assert_eq!(reopened.load_data(&key).await.unwrap(), data);
}

#[tokio::test]
async fn test_parquet_rollover_produces_multiple_files() {
    let dir = tempfile::tempdir().unwrap();
    // iter_meta discovers clusters through their cluster.json.
    std::fs::create_dir_all(dir.path().join("testcluster")).unwrap();
    std::fs::write(dir.path().join("testcluster/cluster.json"), "{}").unwrap();
    // Tiny ceiling: every flushed row group rolls the file over.
    let archive = ParquetArchive::new(dir.path().to_path_buf(), 1, None).unwrap();

    for dbid in 0..130 {
        let meta = archived_meta(dbid);
        archive.import_job(&meta, &sample_job_data(&["load_one"])).await.unwrap();
    }
    archive.flush().await.unwrap();

    let files: Vec<_> = std::fs::read_dir(dir.path().join("testcluster"))
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path().extension().and_then(|x| x.to_str()) == Some("parquet")
        })
        .collect();
    assert!(files.len() >= 2, "expected a rollover, got {} files", files.len());

    // Every row stays reachable across the rollover.
    let reopened = ParquetArchive::new(dir.path().to_path_buf(), 1, None).unwrap();
    let metas = reopened.iter_meta().await.unwrap();
    assert_eq!(metas.len(), 130);
}

#[tokio::test]
async fn test_cluster_registry_loading() {
    let dir = tempfile::tempdir().unwrap();
    let cluster_dir = dir.path().join("testcluster");
    std::fs::create_dir_all(&cluster_dir).unwrap();
    std::fs::write(
        cluster_dir.join("cluster.json"),
        serde_json::json!({
            "name": "testcluster",
            "subClusters": [{
                "name": "main",
                "nodes": "testhost",
                "socketsPerNode": 2,
                "coresPerSocket": 4
            }],
            "metricConfig": [{
                "name": "load_one",
                "unit": {"base": ""},
                "scope": "node",
                "timestep": 60
            }]
        })
        .to_string(),
    )
    .unwrap();

    let archive = FsArchive::new(dir.path().to_path_buf());
    assert_eq!(archive.clusters().await.unwrap(), vec!["testcluster"]);

    let registry = jobarchive_lib::archive::load_cluster_registry(&archive)
        .await
        .unwrap();
    let cluster = registry.require("testcluster").unwrap();
    assert_eq!(cluster.sub_clusters.len(), 1);
    assert!(registry.require("elsewhere").is_err());
}
