//! Filesystem archive backend.
//!
//! Layout:
//! ```text
//! <root>/<cluster>/<dbid/1000>/<dbid%1000>/<start_time>/meta.json
//!                                                       data.json
//! <root>/<cluster>/cluster.json
//! <root>/version.txt
//! ```
//! Legacy trees without the `<start_time>` directory are still readable.

use async_trait::async_trait;
use std::path::{Path, PathBuf};

use crate::error::{AppError, AppResult};
use crate::models::{Cluster, JobData, JobMeta};

use super::{ARCHIVE_VERSION, ArchiveKey, ArchiveStore};

pub struct FsArchive {
    root: PathBuf,
}

impl FsArchive {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn job_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.root
            .join(&key.cluster)
            .join((key.dbid / 1000).to_string())
            .join((key.dbid % 1000).to_string())
            .join(key.start_time.to_string())
    }

    fn legacy_job_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.root
            .join(&key.cluster)
            .join((key.dbid / 1000).to_string())
            .join((key.dbid % 1000).to_string())
    }

    /// Resolve the directory holding this job's blobs, preferring the
    /// current layout over the legacy one.
    fn resolve_job_dir(&self, key: &ArchiveKey) -> Option<PathBuf> {
        let current = self.job_dir(key);
        if current.join("meta.json").is_file() {
            return Some(current);
        }
        let legacy = self.legacy_job_dir(key);
        if legacy.join("meta.json").is_file() {
            return Some(legacy);
        }
        None
    }
}

async fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> AppResult<T> {
    let raw = tokio::fs::read(path).await.map_err(|e| {
        AppError::Archive(format!("Cannot read {}: {}", path.display(), e))
    })?;
    serde_json::from_slice(&raw)
        .map_err(|e| AppError::Archive(format!("Corrupt {}: {}", path.display(), e)))
}

async fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> AppResult<()> {
    let raw = serde_json::to_vec(value)
        .map_err(|e| AppError::Archive(format!("Cannot serialize {}: {}", path.display(), e)))?;
    tokio::fs::write(path, raw)
        .await
        .map_err(|e| AppError::Archive(format!("Cannot write {}: {}", path.display(), e)))
}

#[async_trait]
impl ArchiveStore for FsArchive {
    async fn init(&self, force: bool) -> AppResult<()> {
        tokio::fs::create_dir_all(&self.root).await?;

        let version_file = self.root.join("version.txt");
        match tokio::fs::read_to_string(&version_file).await {
            Ok(raw) => {
                let found: u32 = raw.trim().parse().map_err(|_| {
                    AppError::Archive(format!("Unreadable version marker '{}'", raw.trim()))
                })?;
                if found != ARCHIVE_VERSION && !force {
                    return Err(AppError::Archive(format!(
                        "archive version {} does not match expected {}",
                        found, ARCHIVE_VERSION
                    )));
                }
                Ok(())
            }
            Err(_) => {
                tokio::fs::write(&version_file, format!("{}\n", ARCHIVE_VERSION)).await?;
                Ok(())
            }
        }
    }

    async fn clusters(&self) -> AppResult<Vec<String>> {
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir()
                && entry.path().join("cluster.json").is_file()
            {
                names.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn load_cluster_cfg(&self, cluster: &str) -> AppResult<Cluster> {
        read_json(&self.root.join(cluster).join("cluster.json")).await
    }

    async fn has(&self, key: &ArchiveKey) -> bool {
        self.resolve_job_dir(key).is_some()
    }

    async fn load_meta(&self, key: &ArchiveKey) -> AppResult<JobMeta> {
        let dir = self
            .resolve_job_dir(key)
            .ok_or_else(|| AppError::NotFound(format!("Archived job {}", key.dbid)))?;
        read_json(&dir.join("meta.json")).await
    }

    async fn load_data(&self, key: &ArchiveKey) -> AppResult<JobData> {
        let dir = self
            .resolve_job_dir(key)
            .ok_or_else(|| AppError::NotFound(format!("Archived job {}", key.dbid)))?;
        read_json(&dir.join("data.json")).await
    }

    async fn import_job(&self, meta: &JobMeta, data: &JobData) -> AppResult<()> {
        let key = ArchiveKey::from_meta(meta)?;
        let dir = self.job_dir(&key);
        tokio::fs::create_dir_all(&dir).await?;
        write_json(&dir.join("meta.json"), meta).await?;
        write_json(&dir.join("data.json"), data).await?;
        Ok(())
    }

    async fn iter_meta(&self) -> AppResult<Vec<JobMeta>> {
        // Offline tool pathway; the blocking walk keeps the traversal simple.
        let root = self.root.clone();
        let metas = tokio::task::spawn_blocking(move || walk_metas(&root))
            .await
            .map_err(|e| AppError::Internal(format!("archive walk failed: {}", e)))??;
        Ok(metas)
    }

    async fn delete_job(&self, key: &ArchiveKey) -> AppResult<()> {
        if let Some(dir) = self.resolve_job_dir(key) {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    async fn flush(&self) -> AppResult<()> {
        Ok(())
    }
}

fn walk_metas(root: &Path) -> AppResult<Vec<JobMeta>> {
    let mut metas = Vec::new();

    for cluster in std::fs::read_dir(root)? {
        let cluster = cluster?.path();
        if !cluster.is_dir() {
            continue;
        }
        for lvl1 in std::fs::read_dir(&cluster)? {
            let lvl1 = lvl1?.path();
            if !lvl1.is_dir() {
                continue;
            }
            for lvl2 in std::fs::read_dir(&lvl1)? {
                let lvl2 = lvl2?.path();
                if !lvl2.is_dir() {
                    continue;
                }

                // Legacy layout: meta.json directly below the dbid split.
                let legacy = lvl2.join("meta.json");
                if legacy.is_file() {
                    metas.push(read_meta_file(&legacy)?);
                    continue;
                }

                for start_dir in std::fs::read_dir(&lvl2)? {
                    let start_dir = start_dir?.path();
                    let meta_file = start_dir.join("meta.json");
                    if meta_file.is_file() {
                        metas.push(read_meta_file(&meta_file)?);
                    }
                }
            }
        }
    }

    Ok(metas)
}

fn read_meta_file(path: &Path) -> AppResult<JobMeta> {
    let raw = std::fs::read(path)?;
    serde_json::from_slice(&raw)
        .map_err(|e| AppError::Archive(format!("Corrupt {}: {}", path.display(), e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{JobState, Resource};
    use std::collections::HashMap;

    fn sample_meta(dbid: i64) -> JobMeta {
        JobMeta {
            id: Some(dbid),
            job_id: 123,
            cluster: "testcluster".to_string(),
            sub_cluster: Some("main".to_string()),
            partition: Some("default".to_string()),
            project: None,
            user: "testuser".to_string(),
            array_job_id: None,
            num_nodes: 1,
            num_hwthreads: 8,
            num_acc: 0,
            exclusive: 1,
            smt: 1,
            walltime: 3600,
            job_state: JobState::Completed,
            monitoring_status: crate::models::MonitoringStatus::ArchivingSuccessful,
            start_time: 123456789,
            duration: 1000,
            resources: vec![Resource {
                hostname: "testhost".to_string(),
                hwthreads: Some((0..8).collect()),
                accelerators: None,
                configuration: None,
            }],
            meta_data: None,
            tags: None,
            statistics: HashMap::new(),
            footprint: HashMap::new(),
            energy_footprint: HashMap::new(),
            energy: 0.0,
        }
    }

    #[tokio::test]
    async fn test_import_then_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::new(dir.path().to_path_buf());
        archive.init(false).await.unwrap();

        let meta = sample_meta(1042);
        let data: JobData = HashMap::new();
        archive.import_job(&meta, &data).await.unwrap();

        let key = ArchiveKey::from_meta(&meta).unwrap();
        assert!(archive.has(&key).await);

        let loaded = archive.load_meta(&key).await.unwrap();
        assert_eq!(loaded, meta);
        assert_eq!(archive.load_data(&key).await.unwrap(), data);

        // The dbid split ends up in the path.
        assert!(
            dir.path()
                .join("testcluster/1/42/123456789/meta.json")
                .is_file()
        );
    }

    #[tokio::test]
    async fn test_legacy_layout_still_readable() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::new(dir.path().to_path_buf());

        let meta = sample_meta(7);
        let legacy_dir = dir.path().join("testcluster/0/7");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        std::fs::write(
            legacy_dir.join("meta.json"),
            serde_json::to_vec(&meta).unwrap(),
        )
        .unwrap();

        let key = ArchiveKey::from_meta(&meta).unwrap();
        assert!(archive.has(&key).await);
        assert_eq!(archive.load_meta(&key).await.unwrap(), meta);
    }

    #[tokio::test]
    async fn test_version_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("version.txt"), "1\n").unwrap();

        let archive = FsArchive::new(dir.path().to_path_buf());
        assert!(archive.init(false).await.is_err());
        // --force-db accepts the old tree.
        assert!(archive.init(true).await.is_ok());
    }

    #[tokio::test]
    async fn test_iter_meta_sees_both_layouts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::new(dir.path().to_path_buf());
        archive.init(false).await.unwrap();

        archive
            .import_job(&sample_meta(1), &HashMap::new())
            .await
            .unwrap();

        let legacy = sample_meta(2002);
        let legacy_dir = dir.path().join("testcluster/2/2");
        std::fs::create_dir_all(&legacy_dir).unwrap();
        std::fs::write(
            legacy_dir.join("meta.json"),
            serde_json::to_vec(&legacy).unwrap(),
        )
        .unwrap();

        let metas = archive.iter_meta().await.unwrap();
        assert_eq!(metas.len(), 2);
    }
}
