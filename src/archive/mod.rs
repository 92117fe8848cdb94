//! Durable per-job archive: `meta` (catalog snapshot + statistics) and
//! `data` (time series) blobs, addressed by dbid.

pub mod fs;
pub mod parquet;
pub mod s3;

use async_trait::async_trait;
use std::sync::Arc;

use crate::config::{ArchiveKind, Config};
use crate::error::{AppError, AppResult};
use crate::models::{Cluster, ClusterRegistry, JobData, JobMeta};

/// On-disk format version; bumped on layout changes.
pub const ARCHIVE_VERSION: u32 = 2;

/// Address of one job's blobs inside the archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveKey {
    pub dbid: i64,
    pub cluster: String,
    pub start_time: i64,
}

impl ArchiveKey {
    pub fn from_meta(meta: &JobMeta) -> AppResult<Self> {
        let dbid = meta
            .id
            .ok_or_else(|| AppError::Internal("job meta has no dbid".to_string()))?;
        Ok(Self {
            dbid,
            cluster: meta.cluster.clone(),
            start_time: meta.start_time,
        })
    }
}

/// Pluggable durable store for per-job blobs and per-cluster configuration.
#[async_trait]
pub trait ArchiveStore: Send + Sync {
    /// Check the on-disk version marker, writing it on first use.
    /// `force` accepts a mismatching version.
    async fn init(&self, force: bool) -> AppResult<()>;

    /// Cluster names present in the archive.
    async fn clusters(&self) -> AppResult<Vec<String>>;

    /// Load the per-cluster topology and metric configuration.
    async fn load_cluster_cfg(&self, cluster: &str) -> AppResult<Cluster>;

    /// Whether blobs for this job exist.
    async fn has(&self, key: &ArchiveKey) -> bool;

    async fn load_meta(&self, key: &ArchiveKey) -> AppResult<JobMeta>;

    async fn load_data(&self, key: &ArchiveKey) -> AppResult<JobData>;

    /// Write both blobs; overwrites any previous attempt for the same key.
    async fn import_job(&self, meta: &JobMeta, data: &JobData) -> AppResult<()>;

    /// All job metas in the archive (bulk init pathway).
    async fn iter_meta(&self) -> AppResult<Vec<JobMeta>>;

    /// Remove the blobs of one job.
    async fn delete_job(&self, key: &ArchiveKey) -> AppResult<()>;

    /// Flush buffered state (parquet row groups); no-op for plain files.
    async fn flush(&self) -> AppResult<()>;
}

/// Open the configured archive backend.
pub async fn open_archive(config: &Config) -> AppResult<Arc<dyn ArchiveStore>> {
    let store: Arc<dyn ArchiveStore> = match config.archive_kind {
        ArchiveKind::File => Arc::new(fs::FsArchive::new(config.archive_path.clone())),
        ArchiveKind::Parquet => {
            let object_store = match &config.object_store {
                Some(settings) => Some(s3::ObjectStore::new(settings).await?),
                None => None,
            };
            Arc::new(parquet::ParquetArchive::new(
                config.archive_path.clone(),
                config.parquet_max_file_bytes,
                object_store,
            )?)
        }
    };
    Ok(store)
}

/// Load every cluster configuration from the archive into a registry.
pub async fn load_cluster_registry(store: &dyn ArchiveStore) -> AppResult<ClusterRegistry> {
    let mut clusters = Vec::new();
    for name in store.clusters().await? {
        clusters.push(store.load_cluster_cfg(&name).await?);
    }
    Ok(ClusterRegistry::new(clusters))
}
