//! Abstract interface to external metric backends, plus the per-cluster
//! driver registry and the live-vs-archive dispatcher.

pub mod metricstore;
pub mod stub;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::archive::{ArchiveKey, ArchiveStore};
use crate::config::Config;
use crate::error::AppError;
use crate::models::{JobData, JobMeta, JobState, MetricScope, Series, SeriesStatistics};

/// Failure modes of a metric backend call.
#[derive(Debug, thiserror::Error)]
pub enum MetricDataError {
    #[error("metric backend unavailable: {0}")]
    Unavailable(String),

    #[error("metric backend error: {0}")]
    Backend(String),

    #[error("scope {0} not supported by this backend")]
    ScopeUnsupported(MetricScope),
}

impl From<MetricDataError> for AppError {
    fn from(err: MetricDataError) -> Self {
        match err {
            MetricDataError::Unavailable(msg) => AppError::BackendUnavailable(msg),
            MetricDataError::Backend(msg) => AppError::BackendError(msg),
            MetricDataError::ScopeUnsupported(scope) => {
                AppError::BackendError(format!("scope {} not supported", scope))
            }
        }
    }
}

/// Per-host statistics as returned by `load_stats`.
pub type HostStats = HashMap<String, HashMap<String, SeriesStatistics>>;

/// Per-host node data as returned by `load_node_data`.
pub type NodeData = HashMap<String, HashMap<String, Vec<Series>>>;

/// Contract every metric-store driver implements.
///
/// Drivers must report every requested host: a host without samples gets an
/// entry with empty data and NaN statistics instead of being omitted.
#[async_trait]
pub trait MetricDataRepository: Send + Sync + std::fmt::Debug {
    /// Fetch the time series of `metrics` for one job at the given scopes.
    async fn load_data(
        &self,
        job: &JobMeta,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<JobData, MetricDataError>;

    /// Fetch only per-host min/avg/max for `metrics`.
    async fn load_stats(
        &self,
        job: &JobMeta,
        metrics: &[String],
    ) -> Result<HostStats, MetricDataError>;

    /// Fetch free-standing node data outside any job context.
    #[allow(clippy::too_many_arguments)]
    async fn load_node_data(
        &self,
        cluster: &str,
        partition: Option<&str>,
        metrics: &[String],
        nodes: &[String],
        scopes: &[MetricScope],
        from: i64,
        to: i64,
    ) -> Result<NodeData, MetricDataError>;
}

/// Registry of drivers keyed by cluster name; injected, never global.
#[derive(Clone, Default)]
pub struct MetricDataRepos {
    repos: HashMap<String, Arc<dyn MetricDataRepository>>,
}

impl MetricDataRepos {
    /// Build one HTTP driver per configured cluster.
    pub fn from_config(config: &Config) -> Self {
        let mut repos: HashMap<String, Arc<dyn MetricDataRepository>> = HashMap::new();
        for (cluster, settings) in &config.metric_data_repository {
            repos.insert(
                cluster.clone(),
                Arc::new(metricstore::MetricStoreClient::new(settings.clone())),
            );
        }
        Self { repos }
    }

    pub fn insert(&mut self, cluster: &str, repo: Arc<dyn MetricDataRepository>) {
        self.repos.insert(cluster.to_string(), repo);
    }

    pub fn for_cluster(
        &self,
        cluster: &str,
    ) -> Result<Arc<dyn MetricDataRepository>, MetricDataError> {
        self.repos.get(cluster).cloned().ok_or_else(|| {
            MetricDataError::Unavailable(format!(
                "no metric data repository configured for cluster '{}'",
                cluster
            ))
        })
    }
}

/// Load per-job metric data from the right source: the live backend while
/// the job runs, the archive afterwards.
pub async fn load_job_data(
    meta: &JobMeta,
    metrics: &[String],
    scopes: &[MetricScope],
    repos: &MetricDataRepos,
    archive: &dyn ArchiveStore,
) -> Result<JobData, AppError> {
    if meta.job_state == JobState::Running {
        let repo = repos.for_cluster(&meta.cluster)?;
        return Ok(repo.load_data(meta, metrics, scopes).await?);
    }

    let key = ArchiveKey::from_meta(meta)?;
    let mut data = archive.load_data(&key).await?;

    if !metrics.is_empty() {
        data.retain(|name, _| metrics.iter().any(|m| m == name));
    }
    if !scopes.is_empty() {
        for blocks in data.values_mut() {
            blocks.retain(|scope, _| scopes.contains(scope));
        }
        data.retain(|_, blocks| !blocks.is_empty());
    }

    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::MonitoringStatus;

    #[test]
    fn test_missing_cluster_is_unavailable() {
        let repos = MetricDataRepos::default();
        let err = repos.for_cluster("nowhere").unwrap_err();
        assert!(matches!(err, MetricDataError::Unavailable(_)));
        let app: AppError = err.into();
        assert!(matches!(app, AppError::BackendUnavailable(_)));
    }

    #[tokio::test]
    async fn test_archived_job_reads_from_archive() {
        use crate::archive::fs::FsArchive;
        use std::collections::HashMap;

        let dir = tempfile::tempdir().unwrap();
        let archive = FsArchive::new(dir.path().to_path_buf());

        let mut meta = stub::sample_job_meta(11);
        meta.job_state = JobState::Completed;
        meta.monitoring_status = MonitoringStatus::ArchivingSuccessful;

        let data = stub::sample_job_data(&["load_one", "mem_used"]);
        archive.import_job(&meta, &data).await.unwrap();

        let repos = MetricDataRepos::default();
        let loaded = load_job_data(
            &meta,
            &["load_one".to_string()],
            &[MetricScope::Node],
            &repos,
            &archive,
        )
        .await
        .unwrap();

        assert!(loaded.contains_key("load_one"));
        assert!(!loaded.contains_key("mem_used"));

        let all: HashMap<_, _> = load_job_data(&meta, &[], &[], &repos, &archive)
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
