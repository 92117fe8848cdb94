//! Background archiver: drives stopped jobs through metric fetch, statistics
//! computation and durable archive writes without blocking `stop_job`.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::archive::ArchiveStore;
use crate::db::DbPool;
use crate::db::jobs::model_to_meta;
use crate::error::AppResult;
use crate::metricdata::MetricDataRepos;
use crate::models::{
    Cluster, ClusterRegistry, JobData, JobMeta, JobStatistics, MetricScope, MonitoringStatus,
    round_two,
};

/// Shared dependencies of the worker pool.
#[derive(Clone)]
pub struct ArchiverContext {
    pub pool: DbPool,
    pub archive: Arc<dyn ArchiveStore>,
    pub repos: MetricDataRepos,
    pub registry: Arc<ClusterRegistry>,
}

/// Bounded worker pool consuming a FIFO queue of dbids.
pub struct Archiver {
    tx: Mutex<Option<UnboundedSender<i64>>>,
    inflight: Arc<Mutex<HashSet<i64>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Archiver {
    /// Spawn `worker_count` workers draining the queue.
    pub fn start(worker_count: usize, ctx: ArchiverContext) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel::<i64>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let inflight = Arc::new(Mutex::new(HashSet::new()));

        let mut workers = Vec::with_capacity(worker_count);
        for worker_id in 0..worker_count.max(1) {
            let rx = rx.clone();
            let ctx = ctx.clone();
            let inflight = inflight.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    let dbid = {
                        let mut rx = rx.lock().await;
                        rx.recv().await
                    };
                    let Some(dbid) = dbid else {
                        break;
                    };

                    if let Err(e) = archive_one(&ctx, dbid).await {
                        error!("Archiver worker {}: job {} failed: {}", worker_id, dbid, e);
                        if let Err(e) = ctx
                            .pool
                            .update_monitoring_status(dbid, MonitoringStatus::ArchivingFailed)
                            .await
                        {
                            error!("Cannot mark job {} as archiving_failed: {}", dbid, e);
                        }
                    }

                    inflight.lock().expect("inflight mutex poisoned").remove(&dbid);
                }
            }));
        }

        info!("Archiver started with {} workers", worker_count.max(1));

        Arc::new(Self {
            tx: Mutex::new(Some(tx)),
            inflight,
            workers: Mutex::new(workers),
        })
    }

    /// Enqueue a job for archival. Returns false when the dbid is already
    /// queued or in flight, or the archiver is shutting down.
    pub fn enqueue(&self, dbid: i64) -> bool {
        let mut inflight = self.inflight.lock().expect("inflight mutex poisoned");
        if !inflight.insert(dbid) {
            return false;
        }
        drop(inflight);

        let tx = self.tx.lock().expect("sender mutex poisoned");
        match tx.as_ref() {
            Some(tx) if tx.send(dbid).is_ok() => true,
            _ => {
                self.inflight
                    .lock()
                    .expect("inflight mutex poisoned")
                    .remove(&dbid);
                warn!("Archiver rejected job {}: shutting down", dbid);
                false
            }
        }
    }

    /// Stop accepting jobs, drain the queue, and wait for in-flight work up
    /// to `grace`. Jobs left behind stay `running_or_archiving` in the
    /// catalog and are re-enqueued on the next start.
    pub async fn shutdown(&self, grace: Duration) {
        self.tx.lock().expect("sender mutex poisoned").take();

        let workers: Vec<JoinHandle<()>> =
            std::mem::take(&mut *self.workers.lock().expect("workers mutex poisoned"));

        let drain = futures_util::future::join_all(workers);
        if tokio::time::timeout(grace, drain).await.is_err() {
            let leftover = self.inflight.lock().expect("inflight mutex poisoned").len();
            warn!(
                "Archiver drain exceeded grace period; {} jobs left for restart",
                leftover
            );
        } else {
            info!("Archiver drained");
        }
    }
}

static ENERGY_JOULES_DEFERRED: Once = Once::new();

/// The per-job pipeline: fetch, aggregate, persist.
async fn archive_one(ctx: &ArchiverContext, dbid: i64) -> AppResult<()> {
    let model = ctx.pool.find_job_by_id(dbid).await?;
    let mut meta = model_to_meta(&model)?;

    // Monitoring was never on: nothing to fetch, nothing to archive.
    if meta.monitoring_status == MonitoringStatus::Disabled {
        ctx.pool
            .archive_job(
                dbid,
                MonitoringStatus::ArchivingSuccessful,
                &HashMap::new(),
                &HashMap::new(),
                &HashMap::new(),
                0.0,
            )
            .await?;
        return Ok(());
    }

    meta.meta_data = Some(ctx.pool.fetch_metadata(&model).await?);

    let cluster = ctx.registry.require(&meta.cluster)?;
    let sub_cluster = meta.sub_cluster.clone().unwrap_or_default();
    let metrics: Vec<String> = cluster
        .metrics_for(&sub_cluster)
        .iter()
        .map(|m| m.name.clone())
        .collect();

    let mut scopes = vec![MetricScope::Node];
    if meta.num_nodes == 1 {
        scopes.push(MetricScope::Core);
    }

    let repo = ctx.repos.for_cluster(&meta.cluster)?;

    // Fetch per metric so one broken metric cannot void the rest.
    let mut data: JobData = HashMap::new();
    let mut fetch_failed = false;
    for metric in &metrics {
        match repo
            .load_data(&meta, std::slice::from_ref(metric), &scopes)
            .await
        {
            Ok(partial) => data.extend(partial),
            Err(e) => {
                warn!("Job {}: metric '{}' failed: {}", dbid, metric, e);
                fetch_failed = true;
            }
        }
    }

    let statistics = aggregate_statistics(&data, cluster);
    let footprint = compute_footprint(&statistics, cluster);
    let (energy_footprint, energy) = compute_energy(&statistics, cluster, &meta);

    meta.statistics = statistics.clone();
    meta.footprint = footprint.clone();
    meta.energy_footprint = energy_footprint.clone();
    meta.energy = energy;

    let status = if fetch_failed {
        MonitoringStatus::ArchivingFailed
    } else {
        MonitoringStatus::ArchivingSuccessful
    };
    meta.monitoring_status = status;

    // Blobs are addressed by dbid, so a failed attempt is simply overwritten
    // by the retry.
    ctx.archive.import_job(&meta, &data).await?;

    ctx.pool
        .archive_job(
            dbid,
            status,
            &statistics,
            &footprint,
            &energy_footprint,
            energy,
        )
        .await?;

    if fetch_failed {
        warn!("Job {} archived with failures", dbid);
    } else {
        info!("Job {} archived", dbid);
    }
    Ok(())
}

/// Aggregate per-metric statistics across nodes, node scope only:
/// avg is the mean of the per-node averages, min/max the extremes.
/// Units come from the metric configuration.
pub fn aggregate_statistics(
    data: &JobData,
    cluster: &Cluster,
) -> HashMap<String, JobStatistics> {
    let mut statistics = HashMap::new();

    for (metric, blocks) in data {
        let Some(block) = blocks.get(&MetricScope::Node) else {
            continue;
        };

        let mut sum = 0.0;
        let mut count = 0usize;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for series in &block.series {
            let stats = &series.statistics;
            if stats.avg.is_nan() || stats.min.is_nan() || stats.max.is_nan() {
                continue;
            }
            sum += stats.avg.0;
            count += 1;
            min = min.min(stats.min.0);
            max = max.max(stats.max.0);
        }
        if count == 0 {
            continue;
        }

        let unit = cluster
            .metric(metric)
            .map(|cfg| cfg.unit.clone())
            .unwrap_or_default();

        statistics.insert(
            metric.clone(),
            JobStatistics {
                unit,
                avg: sum / count as f64,
                min,
                max,
            },
        );
    }

    statistics
}

/// Footprint entries `<metric>_<stat>` for every configured footprint metric.
pub fn compute_footprint(
    statistics: &HashMap<String, JobStatistics>,
    cluster: &Cluster,
) -> HashMap<String, f64> {
    let mut footprint = HashMap::new();

    for cfg in &cluster.metric_config {
        let Some(stat) = cfg.footprint.as_deref() else {
            continue;
        };
        let Some(stats) = statistics.get(&cfg.name) else {
            continue;
        };
        let value = match stat {
            "avg" => stats.avg,
            "min" => stats.min,
            "max" => stats.max,
            other => {
                warn!("Metric {}: unknown footprint stat '{}'", cfg.name, other);
                continue;
            }
        };
        footprint.insert(format!("{}_{}", cfg.name, stat), value);
    }

    footprint
}

/// Energy accounting over the power-tagged metrics:
/// `kWh = (avgPower x numNodes x durationSeconds / 3600) / 1000`, per metric
/// rounded to two decimals; Joule-tagged metrics are deferred and record 0.0.
pub fn compute_energy(
    statistics: &HashMap<String, JobStatistics>,
    cluster: &Cluster,
    meta: &JobMeta,
) -> (HashMap<String, f64>, f64) {
    let mut energy_footprint = HashMap::new();

    for cfg in &cluster.metric_config {
        let Some(kind) = cfg.energy.as_deref() else {
            continue;
        };
        let Some(stats) = statistics.get(&cfg.name) else {
            continue;
        };
        let kwh = match kind {
            "power" => round_two(
                (stats.avg * meta.num_nodes as f64 * meta.duration as f64 / 3600.0) / 1000.0,
            ),
            "energy" => {
                ENERGY_JOULES_DEFERRED.call_once(|| {
                    warn!("Joule-based energy metrics are not implemented yet; recording 0.0");
                });
                0.0
            }
            other => {
                warn!("Metric {}: unknown energy kind '{}'", cfg.name, other);
                continue;
            }
        };
        energy_footprint.insert(cfg.name.clone(), kwh);
    }

    let total = round_two(energy_footprint.values().sum());
    (energy_footprint, total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metricdata::stub::{sample_job_data, sample_job_meta};
    use crate::models::{Float, Series, SeriesStatistics, Unit};

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
                    "energy": "power",
                    "footprint": "max"
                },
                {
                    "name": "rapl_energy",
                    "unit": {"base": "J"},
                    "scope": "node",
                    "timestep": 60,
                    "energy": "energy"
                }
            ]
        }))
        .unwrap()
    }

    #[test]
    fn test_aggregate_across_nodes() {
        let cluster = test_cluster();
        let mut data = sample_job_data(&["load_one"]);

        // Second node with different stats: avg over averages, extreme min/max.
        let block = data
            .get_mut("load_one")
            .unwrap()
            .get_mut(&MetricScope::Node)
            .unwrap();
        block.series.push(Series {
            hostname: "otherhost".to_string(),
            id: None,
            statistics: SeriesStatistics {
                avg: Float(3.0),
                min: Float(0.1),
                max: Float(4.0),
            },
            data: vec![Float(3.0)],
        });

        let stats = aggregate_statistics(&data, &cluster);
        let s = &stats["load_one"];
        assert_eq!(s.avg, 2.0);
        assert_eq!(s.min, 0.1);
        assert_eq!(s.max, 4.0);
    }

    #[test]
    fn test_aggregate_skips_nan_series() {
        let cluster = test_cluster();
        let mut data = sample_job_data(&["load_one"]);
        let block = data
            .get_mut("load_one")
            .unwrap()
            .get_mut(&MetricScope::Node)
            .unwrap();
        block.series.push(Series {
            hostname: "deadhost".to_string(),
            id: None,
            statistics: SeriesStatistics::nan(),
            data: Vec::new(),
        });

        let stats = aggregate_statistics(&data, &cluster);
        assert_eq!(stats["load_one"].avg, 1.0);
    }

    #[test]
    fn test_footprint_key_scheme() {
        let cluster = test_cluster();
        let data = sample_job_data(&["load_one", "power"]);
        let stats = aggregate_statistics(&data, &cluster);

        let footprint = compute_footprint(&stats, &cluster);
        assert_eq!(footprint["load_one_avg"], 1.0);
        assert_eq!(footprint["power_max"], 2.0);
        assert!(!footprint.contains_key("load_one"));
    }

    #[test]
    fn test_energy_formula() {
        let cluster = test_cluster();

        // P=350W avg, N=2 nodes, D=7200s:
        // (350 * 2 * 7200 / 3600) / 1000 = 1.4 kWh
        let mut stats = HashMap::new();
        stats.insert(
            "power".to_string(),
            JobStatistics {
                unit: Unit {
                    base: "W".to_string(),
                    prefix: None,
                },
                avg: 350.0,
                min: 100.0,
                max: 400.0,
            },
        );

        let mut meta = sample_job_meta(1);
        meta.num_nodes = 2;
        meta.duration = 7200;

        let (energy_footprint, energy) = compute_energy(&stats, &cluster, &meta);
        assert_eq!(energy_footprint["power"], 1.4);
        assert_eq!(energy, 1.4);
    }

    #[test]
    fn test_energy_joules_deferred() {
        let cluster = test_cluster();
        let mut stats = HashMap::new();
        stats.insert(
            "rapl_energy".to_string(),
            JobStatistics {
                unit: Unit {
                    base: "J".to_string(),
                    prefix: None,
                },
                avg: 1e6,
                min: 0.0,
                max: 2e6,
            },
        );

        let meta = sample_job_meta(1);
        let (energy_footprint, energy) = compute_energy(&stats, &cluster, &meta);
        assert_eq!(energy_footprint["rapl_energy"], 0.0);
        assert_eq!(energy, 0.0);
    }

    #[test]
    fn test_energy_total_is_rounded_sum() {
        let cluster = test_cluster();
        let mut stats = HashMap::new();
        stats.insert(
            "power".to_string(),
            JobStatistics {
                unit: Unit {
                    base: "W".to_string(),
                    prefix: None,
                },
                avg: 123.456,
                min: 0.0,
                max: 200.0,
            },
        );

        let mut meta = sample_job_meta(1);
        meta.num_nodes = 1;
        meta.duration = 1000;

        let (energy_footprint, energy) = compute_energy(&stats, &cluster, &meta);
        // (123.456 * 1 * 1000 / 3600) / 1000 = 0.03429... -> 0.03
        assert_eq!(energy_footprint["power"], 0.03);
        assert_eq!(energy, 0.03);
    }
}
