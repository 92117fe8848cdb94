//! Integration tests for the archival compute pipeline: stub driver in,
//! aggregates and energy out.

use std::collections::HashMap;

use jobarchive_lib::metricdata::stub::{StubMetricRepo, sample_job_meta};
use jobarchive_lib::metricdata::{MetricDataError, MetricDataRepository};
use jobarchive_lib::models::{Cluster, MetricScope, round_two};
use jobarchive_lib::services::archiver::{
    aggregate_statistics, compute_energy, compute_footprint,
};

fn test_cluster() -> Cluster {
    serde_json::from_value(serde_json::json!({
        "name": "testcluster",
        "subClusters": [{
            "name": "main",
            "nodes": "testhost",
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
                "energy": "power"
            }
        ]
    }))
    .unwrap()
}

/// The full fetch -> aggregate -> footprint -> energy chain over the stub
/// driver, metric by metric as the archiver runs it.
#[tokio::test]
async fn test_fetch_aggregate_energy_chain() {
    let stub = StubMetricRepo::with_metrics(&["load_one", "power"]);
    let cluster = test_cluster();

    let mut meta = sample_job_meta(1);
    meta.num_nodes = 1;
    meta.duration = 3600;

    let mut data = HashMap::new();
    for metric in ["load_one", "power"] {
        let partial = stub
            .load_data(&meta, &[metric.to_string()], &[MetricScope::Node])
            .await
            .unwrap();
        data.extend(partial);
    }

    let statistics = aggregate_statistics(&data, &cluster);
    assert_eq!(statistics["load_one"].avg, 1.0);
    assert_eq!(statistics["power"].unit.base, "W");

    let footprint = compute_footprint(&statistics, &cluster);
    assert_eq!(footprint.len(), 1);
    assert_eq!(footprint["load_one_avg"], 1.0);

    // Stub power avg is 1.0 W over one node-hour: 0.001 kWh rounds to 0.0.
    let (energy_footprint, energy) = compute_energy(&statistics, &cluster, &meta);
    assert_eq!(energy_footprint["power"], 0.0);
    assert_eq!(energy, 0.0);
}

/// Energy property: kWh = round2((P * N * D / 3600) / 1000), summed and
/// rounded again for the job total.
#[test]
fn test_energy_property_across_inputs() {
    let cluster = test_cluster();

    for (power, nodes, duration) in [
        (250.0_f64, 1_i32, 3600_i32),
        (350.0, 2, 7200),
        (123.456, 4, 1000),
        (1000.0, 8, 86400),
    ] {
        let mut statistics = HashMap::new();
        statistics.insert(
            "power".to_string(),
            jobarchive_lib::models::JobStatistics {
                unit: jobarchive_lib::models::Unit {
                    base: "W".to_string(),
                    prefix: None,
                },
                avg: power,
                min: 0.0,
                max: power,
            },
        );

        let mut meta = sample_job_meta(1);
        meta.num_nodes = nodes;
        meta.duration = duration;

        let expected = round_two((power * nodes as f64 * duration as f64 / 3600.0) / 1000.0);
        let (energy_footprint, energy) = compute_energy(&statistics, &cluster, &meta);
        assert_eq!(energy_footprint["power"], expected);
        assert_eq!(energy, round_two(expected));
    }
}

/// One failing metric out of two: the good metric's data survives, the
/// failure is visible to the caller (the archiver marks the job
/// archiving_failed from it).
#[tokio::test]
async fn test_partial_metric_failure() {
    let mut stub = StubMetricRepo::with_metrics(&["load_one", "mem_bw"]);
    stub.fail_metrics.insert("mem_bw".to_string());

    let meta = sample_job_meta(1);
    let mut data = HashMap::new();
    let mut failed = false;

    for metric in ["load_one", "mem_bw"] {
        match stub
            .load_data(&meta, &[metric.to_string()], &[MetricScope::Node])
            .await
        {
            Ok(partial) => data.extend(partial),
            Err(MetricDataError::Backend(_)) => failed = true,
            Err(e) => panic!("unexpected error kind: {}", e),
        }
    }

    assert!(failed);
    assert!(data.contains_key("load_one"));
    assert!(!data.contains_key("mem_bw"));

    // The surviving metric still aggregates normally.
    let statistics = aggregate_statistics(&data, &test_cluster());
    assert_eq!(statistics.len(), 1);
}

/// Unsupported scopes fail the fetch, not the stop: the error kind carries
/// the scope so the archiver can record archiving_failed and move on.
#[tokio::test]
async fn test_unsupported_scope_is_reported() {
    let mut stub = StubMetricRepo::with_metrics(&["load_one"]);
    stub.unsupported_scopes.insert(MetricScope::Accelerator);

    let meta = sample_job_meta(1);
    let err = stub
        .load_data(
            &meta,
            &["load_one".to_string()],
            &[MetricScope::Accelerator],
        )
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        MetricDataError::ScopeUnsupported(MetricScope::Accelerator)
    ));
}
