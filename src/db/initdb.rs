//! Bulk catalog loading from an existing archive (`--init-db`).

use sea_orm::{ActiveModelTrait, NotSet, Set, TransactionTrait};
use tracing::info;

use crate::archive::ArchiveStore;
use crate::entity::job;
use crate::error::{AppError, AppResult};
use crate::models::{ClusterRegistry, JobMeta};
use crate::services::archiver::compute_footprint;

use super::DbPool;

/// Rows inserted per transaction during bulk load.
const BATCH_SIZE: usize = 100;

/// Build the full row for an already-terminated job, aggregates included.
pub fn meta_to_active_model(meta: &JobMeta) -> AppResult<job::ActiveModel> {
    let resources = serde_json::to_value(&meta.resources)
        .map_err(|e| AppError::Internal(format!("Failed to serialize resources: {}", e)))?;
    let meta_data = match &meta.meta_data {
        Some(md) => Some(
            serde_json::to_value(md)
                .map_err(|e| AppError::Internal(format!("Failed to serialize metadata: {}", e)))?,
        ),
        None => None,
    };
    let statistics = if meta.statistics.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&meta.statistics).map_err(|e| {
            AppError::Internal(format!("Failed to serialize statistics: {}", e))
        })?)
    };
    let footprint = if meta.footprint.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&meta.footprint).map_err(|e| {
            AppError::Internal(format!("Failed to serialize footprint: {}", e))
        })?)
    };
    let energy_footprint = if meta.energy_footprint.is_empty() {
        None
    } else {
        Some(serde_json::to_value(&meta.energy_footprint).map_err(|e| {
            AppError::Internal(format!("Failed to serialize energy footprint: {}", e))
        })?)
    };

    Ok(job::ActiveModel {
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
        job_state: Set(meta.job_state.as_str().to_string()),
        monitoring_status: Set(meta.monitoring_status.as_str().to_string()),
        start_time: Set(meta.start_time),
        duration: Set(meta.duration),
        walltime: Set(meta.walltime),
        resources: Set(resources),
        meta_data: Set(meta_data),
        footprint: Set(footprint),
        energy_footprint: Set(energy_footprint),
        statistics: Set(statistics),
        energy: Set(meta.energy),
    })
}

impl DbPool {
    /// Insert one complete row (importer pathway); returns the dbid.
    pub async fn insert_full_job(&self, meta: &JobMeta) -> AppResult<i64> {
        let model = meta_to_active_model(meta)?;
        let result = model
            .insert(self.connection())
            .await
            .map_err(|e| AppError::Database(format!("Failed to insert job: {}", e)))?;
        Ok(result.id)
    }

    /// Walk the archive and load every job into the catalog, batching 100
    /// inserts per transaction. Footprints missing in the archived meta are
    /// derived from its statistics using the metric configuration.
    pub async fn init_db(
        &self,
        archive: &dyn ArchiveStore,
        registry: &ClusterRegistry,
    ) -> AppResult<usize> {
        let metas = archive.iter_meta().await?;
        info!("Bulk loading {} archived jobs", metas.len());

        let mut inserted = 0usize;
        let mut skipped = 0usize;

        for chunk in metas.chunks(BATCH_SIZE) {
            let txn = self
                .connection()
                .begin()
                .await
                .map_err(|e| AppError::Database(format!("Failed to begin transaction: {}", e)))?;

            for meta in chunk {
                let mut meta = meta.clone();
                if meta.sanity_checks().is_err() {
                    skipped += 1;
                    continue;
                }

                if meta.footprint.is_empty() && !meta.statistics.is_empty() {
                    if let Some(cluster) = registry.cluster(&meta.cluster) {
                        meta.footprint = compute_footprint(&meta.statistics, cluster);
                    }
                }

                // A failed statement would abort the whole transaction, so
                // errors here fail the batch instead of being skipped.
                let model = meta_to_active_model(&meta)?;
                model.insert(&txn).await.map_err(|e| {
                    AppError::Database(format!(
                        "Failed to insert job {} on {}: {}",
                        meta.job_id, meta.cluster, e
                    ))
                })?;
                inserted += 1;
            }

            txn.commit()
                .await
                .map_err(|e| AppError::Database(format!("Failed to commit batch: {}", e)))?;
        }

        info!("Bulk load complete: {} inserted, {} skipped", inserted, skipped);
        Ok(inserted)
    }
}
