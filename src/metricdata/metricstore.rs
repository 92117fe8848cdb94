//! HTTP driver for the native time-series metric store.
//!
//! Speaks the store's bulk query API: one POST per load with a query entry
//! per (metric, host) pair. Units are left to the metric configuration; the
//! driver only transports samples and per-series statistics.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::MetricStoreSettings;
use crate::models::{
    Float, JobData, JobMeta, JobMetric, MetricScope, Series, SeriesStatistics, Unit,
};

use super::{HostStats, MetricDataError, MetricDataRepository, NodeData};

/// Scopes this backend can answer natively.
const SUPPORTED_SCOPES: &[MetricScope] = &[MetricScope::Node, MetricScope::Core];

#[derive(Debug)]
pub struct MetricStoreClient {
    settings: MetricStoreSettings,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ApiQuery<'a> {
    metric: &'a str,
    host: &'a str,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    type_: Option<&'a str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct ApiQueryRequest<'a> {
    cluster: &'a str,
    from: i64,
    to: i64,
    with_stats: bool,
    with_data: bool,
    queries: Vec<ApiQuery<'a>>,
}

#[derive(Debug, Deserialize)]
struct ApiQueryResponse {
    results: Vec<Vec<ApiResult>>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(default)]
    data: Vec<Float>,
    #[serde(default)]
    avg: Option<f64>,
    #[serde(default)]
    min: Option<f64>,
    #[serde(default)]
    max: Option<f64>,
    #[serde(default)]
    resolution: Option<i32>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl MetricStoreClient {
    pub fn new(settings: MetricStoreSettings) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(settings.timeout_secs))
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self { settings, client }
    }

    async fn query(
        &self,
        request: &ApiQueryRequest<'_>,
    ) -> Result<ApiQueryResponse, MetricDataError> {
        let url = format!("{}/api/query", self.settings.url.trim_end_matches('/'));
        let mut builder = self.client.post(&url).json(request);
        if let Some(token) = &self.settings.token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                MetricDataError::Unavailable(e.to_string())
            } else {
                MetricDataError::Backend(e.to_string())
            }
        })?;

        if !response.status().is_success() {
            return Err(MetricDataError::Backend(format!(
                "metric store answered {}",
                response.status()
            )));
        }

        response
            .json::<ApiQueryResponse>()
            .await
            .map_err(|e| MetricDataError::Backend(format!("undecodable response: {}", e)))
    }

    fn check_scopes(scopes: &[MetricScope]) -> Result<Vec<MetricScope>, MetricDataError> {
        let supported: Vec<MetricScope> = scopes
            .iter()
            .copied()
            .filter(|s| SUPPORTED_SCOPES.contains(s))
            .collect();
        if supported.is_empty() {
            match scopes.first() {
                Some(scope) => Err(MetricDataError::ScopeUnsupported(*scope)),
                None => Ok(vec![MetricScope::Node]),
            }
        } else {
            Ok(supported)
        }
    }
}

fn series_from_result(hostname: &str, result: ApiResult) -> Series {
    // A host the store has no samples for still gets an entry, with empty
    // data and NaN statistics.
    let statistics = if result.error.is_some() || result.data.is_empty() {
        SeriesStatistics::nan()
    } else {
        SeriesStatistics {
            avg: Float(result.avg.unwrap_or(f64::NAN)),
            min: Float(result.min.unwrap_or(f64::NAN)),
            max: Float(result.max.unwrap_or(f64::NAN)),
        }
    };
    Series {
        hostname: hostname.to_string(),
        id: result.id,
        statistics,
        data: if result.error.is_some() {
            Vec::new()
        } else {
            result.data
        },
    }
}

#[async_trait]
impl MetricDataRepository for MetricStoreClient {
    async fn load_data(
        &self,
        job: &JobMeta,
        metrics: &[String],
        scopes: &[MetricScope],
    ) -> Result<JobData, MetricDataError> {
        let scopes = Self::check_scopes(scopes)?;
        let from = job.start_time;
        let to = if job.duration > 0 {
            job.start_time + job.duration as i64
        } else {
            chrono::Utc::now().timestamp()
        };

        let mut queries = Vec::new();
        let mut index = Vec::new();
        for metric in metrics {
            for scope in &scopes {
                for resource in &job.resources {
                    queries.push(ApiQuery {
                        metric,
                        host: &resource.hostname,
                        type_: match scope {
                            MetricScope::Core => Some("core"),
                            _ => None,
                        },
                    });
                    index.push((metric.clone(), *scope, resource.hostname.clone()));
                }
            }
        }

        let response = self
            .query(&ApiQueryRequest {
                cluster: &job.cluster,
                from,
                to,
                with_stats: true,
                with_data: true,
                queries,
            })
            .await?;

        let mut data: JobData = HashMap::new();
        let mut resolutions: HashMap<(String, MetricScope), i32> = HashMap::new();

        for ((metric, scope, hostname), results) in index.into_iter().zip(response.results) {
            for result in results {
                if let Some(res) = result.resolution {
                    resolutions.insert((metric.clone(), scope), res);
                }
                let series = series_from_result(&hostname, result);
                data.entry(metric.clone())
                    .or_default()
                    .entry(scope)
                    .or_insert_with(|| JobMetric {
                        unit: Unit::default(),
                        timestep: 0,
                        series: Vec::new(),
                        statistics_series: None,
                    })
                    .series
                    .push(series);
            }
        }

        for (metric, blocks) in data.iter_mut() {
            for (scope, block) in blocks.iter_mut() {
                if let Some(res) = resolutions.get(&(metric.clone(), *scope)) {
                    block.timestep = *res;
                }
            }
        }

        Ok(data)
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
        cluster: &str,
        _partition: Option<&str>,
        metrics: &[String],
        nodes: &[String],
        scopes: &[MetricScope],
        from: i64,
        to: i64,
    ) -> Result<NodeData, MetricDataError> {
        let scopes = Self::check_scopes(scopes)?;

        let mut queries = Vec::new();
        let mut index = Vec::new();
        for node in nodes {
            for metric in metrics {
                for scope in &scopes {
                    queries.push(ApiQuery {
                        metric,
                        host: node,
                        type_: match scope {
                            MetricScope::Core => Some("core"),
                            _ => None,
                        },
                    });
                    index.push((node.clone(), metric.clone()));
                }
            }
        }

        let response = self
            .query(&ApiQueryRequest {
                cluster,
                from,
                to,
                with_stats: true,
                with_data: true,
                queries,
            })
            .await?;

        let mut data: NodeData = HashMap::new();
        for ((node, metric), results) in index.into_iter().zip(response.results) {
            let series_list: Vec<Series> = results
                .into_iter()
                .map(|r| series_from_result(&node, r))
                .collect();
            data.entry(node)
                .or_default()
                .entry(metric)
                .or_default()
                .extend(series_list);
        }

        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_scopes() {
        assert_eq!(
            MetricStoreClient::check_scopes(&[MetricScope::Node, MetricScope::HwThread]).unwrap(),
            vec![MetricScope::Node]
        );
        assert!(matches!(
            MetricStoreClient::check_scopes(&[MetricScope::Accelerator]),
            Err(MetricDataError::ScopeUnsupported(MetricScope::Accelerator))
        ));
        assert_eq!(
            MetricStoreClient::check_scopes(&[]).unwrap(),
            vec![MetricScope::Node]
        );
    }

    #[test]
    fn test_missing_host_gets_nan_series() {
        let series = series_from_result(
            "node1",
            ApiResult {
                data: Vec::new(),
                avg: None,
                min: None,
                max: None,
                resolution: None,
                id: None,
                error: Some("no such metric".to_string()),
            },
        );
        assert_eq!(series.hostname, "node1");
        assert!(series.data.is_empty());
        assert!(series.statistics.avg.is_nan());
    }
}
