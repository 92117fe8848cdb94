//! Deterministic in-memory metric driver for tests.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use crate::models::{
    Float, JobData, JobMeta, JobMetric, MetricScope, Series, SeriesStatistics, Unit,
};

use super::{HostStats, MetricDataError, MetricDataRepository, NodeData};

/// Stub driver: serves canned per-metric blocks, with optional per-metric
/// failures and scope rejection.
#[derive(Debug, Default)]
pub struct StubMetricRepo {
    /// Prepared response per metric name.
    pub data: HashMap<String, JobMetric>,
    /// Metrics that fail with `Backend` when requested.
    pub fail_metrics: HashSet<String>,
    /// When set, every call fails with `Unavailable`.
    pub unavailable: bool,
    /// Scopes the stub pretends not to support.
    pub unsupported_scopes: HashSet<MetricScope>,
}

impl StubMetricRepo {
    pub fn with_metrics(metrics: &[&str]) -> Self {
        Self {
            data: metrics
                .iter()
                .map(|m| (m.to_string(), sample_metric_block(m)))
                .collect(),
            ..Default::default()
        }
    }
}

#[async_trait]
impl MetricDataRepository for StubMetricRepo {
    async fn load_data(
        &self,
        _job: &JobMeta,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<JobData, MetricDataError> {
        if self.unavailable {
            return Err(MetricDataError::Unavailable("stub offline".to_string()));
        }
        if let Some(scope) = scopes.iter().find(|s| self.unsupported_scopes.contains(s)) {
            return Err(MetricDataError::ScopeUnsupported(*scope));
        }

        let mut result: JobData = HashMap::new();
        for metric in metrics {
            if self.fail_metrics.contains(metric) {
                return Err(MetricDataError::Backend(format!(
                    "stub failure for metric '{}'",
                    metric
                )));
            }
            if let Some(block) = self.data.get(metric) {
                result
                    .entry(metric.clone())
                    .or_default()
                    .insert(MetricScope::Node, block.clone());
            }
        }
        Ok(result)
    }

    async fn load_stats(
        &self,
        job: &JobMeta,
        metrics: &[String],
    ) -> Result<HostStats, MetricDataError> {
        let data = self.load_data(job, metrics, &[MetricScope::Node]).await?;
        let mut stats: HostStats = HashMap::new();
        for (metric, blocks) in data {
            if let Some(block) = blocks.get(&MetricScope::Node) {
                for series in &block.series {
                    stats
                        .entry(metric.clone())
                        .or_default()
                        .insert(series.hostname.clone(), series.statistics.clone());
                }
            }
        }
        Ok(stats)
    }

    async fn load_node_data(
        &self,
        _cluster: &str,
        _partition: Option<&str>,
        metrics: &[String],
        nodes: &[String],
        _scopes: &[MetricScope],
        _from: i64,
        _to: i64,
    ) -> Result<NodeData, MetricDataError> {
        if self.unavailable {
            return Err(MetricDataError::Unavailable("stub offline".to_string()));
        }
        let mut result: NodeData = HashMap::new();
        for node in nodes {
            let per_metric = result.entry(node.clone()).or_default();
            for metric in metrics {
                let series = self
                    .data
                    .get(metric)
                    .map(|block| block.series.clone())
                    .unwrap_or_else(|| {
                        vec![Series {
                            hostname: node.clone(),
                            id: None,
                            statistics: SeriesStatistics::nan(),
                            data: Vec::new(),
                        }]
                    });
                per_metric.insert(metric.clone(), series);
            }
        }
        Ok(result)
    }
}

/// A small deterministic block: avg 1.0, min 0.5, max 2.0 on "testhost".
pub fn sample_metric_block(metric: &str) -> JobMetric {
    JobMetric {
        unit: Unit {
            base: if metric.contains("power") { "W" } else { "" }.to_string(),
            prefix: None,
        },
        timestep: 60,
        series: vec![Series {
            hostname: "testhost".to_string(),
            id: None,
            statistics: SeriesStatistics {
                avg: Float(1.0),
                min: Float(0.5),
                max: Float(2.0),
            },
            data: vec![Float(0.5), Float(1.0), Float(1.5), Float(2.0)],
        }],
        statistics_series: None,
    }
}

/// JobData with one node-scope block per metric.
pub fn sample_job_data(metrics: &[&str]) -> JobData {
    let mut data: JobData = HashMap::new();
    for metric in metrics {
        data.entry(metric.to_string())
            .or_default()
            .insert(MetricScope::Node, sample_metric_block(metric));
    }
    data
}

/// A one-node completed test job.
pub fn sample_job_meta(dbid: i64) -> JobMeta {
    use crate::models::{JobState, MonitoringStatus, Resource};

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
        walltime: 0,
        job_state: JobState::Running,
        monitoring_status: MonitoringStatus::RunningOrArchiving,
        start_time: 123456789,
        duration: 0,
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

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_serves_prepared_metrics() {
        let stub = StubMetricRepo::with_metrics(&["load_one"]);
        let job = sample_job_meta(1);

        let data = stub
            .load_data(&job, &["load_one".to_string()], &[MetricScope::Node])
            .await
            .unwrap();
        assert_eq!(data["load_one"][&MetricScope::Node].series.len(), 1);
    }

    #[tokio::test]
    async fn test_stub_failure_modes() {
        let mut stub = StubMetricRepo::with_metrics(&["a", "b"]);
        stub.fail_metrics.insert("b".to_string());

        let job = sample_job_meta(1);
        let err = stub
            .load_data(&job, &["b".to_string()], &[MetricScope::Node])
            .await
            .unwrap_err();
        assert!(matches!(err, MetricDataError::Backend(_)));

        stub.unsupported_scopes.insert(MetricScope::Accelerator);
        let err = stub
            .load_data(&job, &["a".to_string()], &[MetricScope::Accelerator])
            .await
            .unwrap_err();
        assert!(matches!(err, MetricDataError::ScopeUnsupported(_)));
    }
}
