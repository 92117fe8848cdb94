//! Cluster topology and metric configuration, loaded from the archive's
//! per-cluster `cluster.json`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::{AppError, AppResult};
use crate::models::job::Unit;
use crate::models::metrics::MetricScope;

/// A scalar hardware rate (peak flops, memory bandwidth) with its unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MetricValue {
    pub unit: Unit,
    pub value: f64,
}

/// Hardware partition inside a cluster: homogeneous nodes sharing a
/// processor type and topology multipliers.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SubCluster {
    pub name: String,
    /// Node expression: a comma-separated list, optionally with a numeric
    /// range suffix ("node[001-100]").
    #[serde(default)]
    pub nodes: String,
    #[serde(default)]
    pub processor_type: String,
    pub sockets_per_node: i32,
    pub cores_per_socket: i32,
    #[serde(default)]
    pub threads_per_core: i32,
    #[serde(default)]
    pub flop_rate_scalar: MetricValue,
    #[serde(default)]
    pub flop_rate_simd: MetricValue,
    #[serde(default)]
    pub memory_bandwidth: MetricValue,
}

impl SubCluster {
    /// Physical cores per node, the multiplier for core-hour accounting.
    pub fn cores_per_node(&self) -> i32 {
        self.sockets_per_node * self.cores_per_socket
    }
}

/// Per-metric configuration: unit, native scope, and the roles the metric
/// plays in footprints and energy accounting.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MetricConfig {
    pub name: String,
    pub unit: Unit,
    pub scope: MetricScope,
    pub timestep: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peak: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normal: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caution: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alert: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<String>,
    /// "power" (Watts, integrated over duration) or "energy" (Joules).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub energy: Option<String>,
    /// Which statistic ("avg"/"min"/"max") enters the job footprint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footprint: Option<String>,
    /// Subclusters this metric is not collected for.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove_from_sub_clusters: Vec<String>,
}

impl MetricConfig {
    pub fn available_on(&self, sub_cluster: &str) -> bool {
        !self
            .remove_from_sub_clusters
            .iter()
            .any(|s| s == sub_cluster)
    }
}

/// One cluster as described by its archive `cluster.json`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub name: String,
    pub sub_clusters: Vec<SubCluster>,
    pub metric_config: Vec<MetricConfig>,
}

impl Cluster {
    pub fn sub_cluster(&self, name: &str) -> Option<&SubCluster> {
        self.sub_clusters.iter().find(|sc| sc.name == name)
    }

    /// Index of a metric in the configuration; `Some` means the metric exists.
    pub fn metric_index(&self, metric: &str) -> Option<usize> {
        self.metric_config.iter().position(|m| m.name == metric)
    }

    pub fn metric(&self, metric: &str) -> Option<&MetricConfig> {
        self.metric_index(metric).map(|i| &self.metric_config[i])
    }

    /// Metrics configured for the given subcluster.
    pub fn metrics_for(&self, sub_cluster: &str) -> Vec<&MetricConfig> {
        self.metric_config
            .iter()
            .filter(|m| m.available_on(sub_cluster))
            .collect()
    }

    /// Assign a subcluster for a job: an explicit name is validated, otherwise
    /// the first subcluster whose node expression matches `hostname` wins,
    /// falling back to the first subcluster.
    pub fn assign_sub_cluster(
        &self,
        explicit: Option<&str>,
        hostname: Option<&str>,
    ) -> AppResult<String> {
        if let Some(name) = explicit {
            return if self.sub_cluster(name).is_some() {
                Ok(name.to_string())
            } else {
                Err(AppError::InvalidInput(format!(
                    "unknown subcluster '{}' in cluster '{}'",
                    name, self.name
                )))
            };
        }

        if let Some(host) = hostname {
            for sc in &self.sub_clusters {
                if node_expr_matches(&sc.nodes, host) {
                    return Ok(sc.name.clone());
                }
            }
        }

        self.sub_clusters
            .first()
            .map(|sc| sc.name.clone())
            .ok_or_else(|| {
                AppError::InvalidInput(format!("cluster '{}' has no subclusters", self.name))
            })
    }
}

/// In-memory registry of all configured clusters, injected into every
/// component at construction.
#[derive(Debug, Clone, Default)]
pub struct ClusterRegistry {
    clusters: HashMap<String, Cluster>,
}

impl ClusterRegistry {
    pub fn new(clusters: Vec<Cluster>) -> Self {
        Self {
            clusters: clusters.into_iter().map(|c| (c.name.clone(), c)).collect(),
        }
    }

    pub fn cluster(&self, name: &str) -> Option<&Cluster> {
        self.clusters.get(name)
    }

    pub fn require(&self, name: &str) -> AppResult<&Cluster> {
        self.cluster(name)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown cluster '{}'", name)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.clusters.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn all(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }
}

/// Match a hostname against a node expression.
///
/// Supported forms, comma-separated: exact names ("n1,n2") and bracketed
/// numeric ranges ("node[001-100]", zero-padding preserved).
pub fn node_expr_matches(expr: &str, hostname: &str) -> bool {
    for part in expr.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        if let Some((prefix, rest)) = part.split_once('[') {
            let Some(range) = rest.strip_suffix(']') else {
                continue;
            };
            let Some((lo, hi)) = range.split_once('-') else {
                continue;
            };
            let Some(suffix) = hostname.strip_prefix(prefix) else {
                continue;
            };
            let width = lo.len();
            if suffix.len() != width && lo.len() == hi.len() {
                continue;
            }
            let (Ok(lo), Ok(hi), Ok(num)) =
                (lo.parse::<u64>(), hi.parse::<u64>(), suffix.parse::<u64>())
            else {
                continue;
            };
            if num >= lo && num <= hi {
                return true;
            }
        } else if part == hostname {
            return true;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cluster() -> Cluster {
        serde_json::from_value(serde_json::json!({
            "name": "testcluster",
            "subClusters": [{
                "name": "main",
                "nodes": "testhost,node[001-010]",
                "processorType": "Test CPU",
                "socketsPerNode": 2,
                "coresPerSocket": 4
            }],
            "metricConfig": [
                {
                    "name": "load_one",
                    "unit": {"base": ""},
                    "scope": "node",
                    "timestep": 60,
                    "footprint": "avg"
                },
                {
                    "name": "power",
                    "unit": {"base": "W"},
                    "scope": "node",
                    "timestep": 60,
                    "energy": "power",
                    "removeFromSubClusters": ["gpu"]
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_node_expr_matches() {
        assert!(node_expr_matches("a,b,c", "b"));
        assert!(!node_expr_matches("a,b,c", "d"));
        assert!(node_expr_matches("node[001-010]", "node005"));
        assert!(node_expr_matches("node[001-010]", "node010"));
        assert!(!node_expr_matches("node[001-010]", "node011"));
        assert!(!node_expr_matches("node[001-010]", "other005"));
        assert!(!node_expr_matches("", "x"));
    }

    #[test]
    fn test_assign_sub_cluster() {
        let cluster = test_cluster();
        assert_eq!(
            cluster.assign_sub_cluster(Some("main"), None).unwrap(),
            "main"
        );
        assert!(cluster.assign_sub_cluster(Some("gpu"), None).is_err());
        assert_eq!(
            cluster
                .assign_sub_cluster(None, Some("node003"))
                .unwrap(),
            "main"
        );
        // Unmatched hostnames fall back to the first subcluster.
        assert_eq!(
            cluster
                .assign_sub_cluster(None, Some("elsewhere"))
                .unwrap(),
            "main"
        );
    }

    #[test]
    fn test_metric_index_means_exists() {
        let cluster = test_cluster();
        assert!(cluster.metric_index("load_one").is_some());
        assert!(cluster.metric_index("nope").is_none());
        assert_eq!(cluster.metric("power").unwrap().energy.as_deref(), Some("power"));
    }

    #[test]
    fn test_metrics_for_subcluster_filter() {
        let cluster = test_cluster();
        let on_main: Vec<&str> = cluster.metrics_for("main").iter().map(|m| m.name.as_str()).collect();
        assert_eq!(on_main, vec!["load_one", "power"]);
        let on_gpu: Vec<&str> = cluster.metrics_for("gpu").iter().map(|m| m.name.as_str()).collect();
        assert_eq!(on_gpu, vec!["load_one"]);
    }

    #[test]
    fn test_cores_per_node() {
        let cluster = test_cluster();
        assert_eq!(cluster.sub_cluster("main").unwrap().cores_per_node(), 8);
    }
}
