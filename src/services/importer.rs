//! Import pathway shared by `POST /jobs/import/` and the `--import-job` CLI
//! flag, plus the archived-tag resync behind `--apply-tags`.

use serde::Deserialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::archive::ArchiveStore;
use crate::db::DbPool;
use crate::error::{AppError, AppResult};
use crate::models::{ClusterRegistry, JobData, JobMeta};

/// Body of `POST /jobs/import/`.
#[derive(Debug, Deserialize, ToSchema)]
#[serde(deny_unknown_fields)]
pub struct ImportPayload {
    pub meta: JobMeta,
    pub data: JobData,
}

/// Validate and persist one externally produced job: catalog row first (the
/// dbid addresses the blobs), then the archive write.
pub async fn import_job(
    pool: &DbPool,
    archive: &dyn ArchiveStore,
    registry: &ClusterRegistry,
    mut meta: JobMeta,
    data: JobData,
) -> AppResult<i64> {
    meta.sanity_checks()?;

    let cluster = registry.require(&meta.cluster)?;
    let hostname = meta.resources.first().map(|r| r.hostname.as_str());
    meta.sub_cluster = Some(cluster.assign_sub_cluster(meta.sub_cluster.as_deref(), hostname)?);

    if meta.job_state == crate::models::JobState::Running {
        return Err(AppError::InvalidInput(
            "imported jobs must be in a terminal state".to_string(),
        ));
    }

    if pool
        .find_job(meta.job_id, Some(&meta.cluster), Some(meta.start_time))
        .await
        .is_ok()
    {
        return Err(AppError::Duplicate(format!(
            "job {} on cluster {} at {} already exists",
            meta.job_id, meta.cluster, meta.start_time
        )));
    }

    let dbid = pool.insert_full_job(&meta).await?;
    meta.id = Some(dbid);

    archive.import_job(&meta, &data).await?;

    info!(
        "Imported job {} on {} as dbid {}",
        meta.job_id, meta.cluster, dbid
    );
    Ok(dbid)
}

/// Read `meta.json:data.json` pairs from disk and import them (CLI flag
/// `--import-job meta:data[,...]`).
pub async fn import_job_files(
    pool: &DbPool,
    archive: &dyn ArchiveStore,
    registry: &ClusterRegistry,
    spec: &str,
) -> AppResult<usize> {
    let mut imported = 0;

    for pair in spec.split(',').filter(|p| !p.is_empty()) {
        let (meta_path, data_path) = pair.split_once(':').ok_or_else(|| {
            AppError::InvalidInput(format!(
                "'{}' is not a meta:data file pair",
                pair
            ))
        })?;

        let meta: JobMeta = serde_json::from_slice(&tokio::fs::read(meta_path).await?)?;
        let data: JobData = serde_json::from_slice(&tokio::fs::read(data_path).await?)?;

        import_job(pool, archive, registry, meta, data).await?;
        imported += 1;
    }

    Ok(imported)
}

/// Re-attach the tags recorded in archived metas to their catalog rows
/// (`--apply-tags`).
pub async fn apply_tags(pool: &DbPool, archive: &dyn ArchiveStore) -> AppResult<usize> {
    let mut applied = 0;

    for meta in archive.iter_meta().await? {
        let Some(tags) = &meta.tags else {
            continue;
        };
        if tags.is_empty() {
            continue;
        }

        let row = match pool
            .find_job(meta.job_id, Some(&meta.cluster), Some(meta.start_time))
            .await
        {
            Ok(row) => row,
            Err(AppError::NotFound(_)) => {
                warn!(
                    "No catalog row for archived job {} on {}; skipping tags",
                    meta.job_id, meta.cluster
                );
                continue;
            }
            Err(e) => return Err(e),
        };

        for tag in tags {
            pool.add_tag_or_create(row.id, &tag.tag_type, &tag.name, tag.scope.as_deref())
                .await?;
            applied += 1;
        }
    }

    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_import_payload_rejects_unknown_fields() {
        let result: Result<ImportPayload, _> = serde_json::from_value(serde_json::json!({
            "meta": {
                "jobId": 1,
                "cluster": "c",
                "user": "u",
                "numNodes": 1,
                "startTime": 1,
                "resources": [{"hostname": "h"}]
            },
            "data": {},
            "extra": 1
        }));
        assert!(result.is_err());
    }
}
