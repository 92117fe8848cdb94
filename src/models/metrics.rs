//! Wire types for per-job time-series data as produced by metric backends
//! and stored in archive `data` blobs.

use std::collections::HashMap;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use utoipa::ToSchema;

use crate::models::job::Unit;

/// Granularity at which a metric series is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum MetricScope {
    Node,
    Socket,
    Core,
    HwThread,
    Accelerator,
}

impl MetricScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Node => "node",
            Self::Socket => "socket",
            Self::Core => "core",
            Self::HwThread => "hwthread",
            Self::Accelerator => "accelerator",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "node" => Some(Self::Node),
            "socket" => Some(Self::Socket),
            "core" => Some(Self::Core),
            "hwthread" => Some(Self::HwThread),
            "accelerator" => Some(Self::Accelerator),
            _ => None,
        }
    }
}

impl std::fmt::Display for MetricScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Sample value that serializes NaN as JSON null.
///
/// Drivers report missing samples as NaN; JSON has no NaN literal, so the
/// wire format uses null in both directions.
#[derive(Debug, Clone, Copy)]
pub struct Float(pub f64);

impl Float {
    pub const NAN: Float = Float(f64::NAN);

    pub fn is_nan(&self) -> bool {
        self.0.is_nan()
    }
}

impl PartialEq for Float {
    fn eq(&self, other: &Self) -> bool {
        (self.0.is_nan() && other.0.is_nan()) || self.0 == other.0
    }
}

impl From<f64> for Float {
    fn from(value: f64) -> Self {
        Float(value)
    }
}

impl Serialize for Float {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        if self.0.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_f64(self.0)
        }
    }
}

impl<'de> Deserialize<'de> for Float {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value: Option<f64> = Option::deserialize(deserializer)?;
        Ok(Float(value.unwrap_or(f64::NAN)))
    }
}

impl utoipa::PartialSchema for Float {
    fn schema() -> utoipa::openapi::RefOr<utoipa::openapi::schema::Schema> {
        f64::schema()
    }
}

impl utoipa::ToSchema for Float {}

/// Min/avg/max over one series; NaN when the driver produced no samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct SeriesStatistics {
    pub avg: Float,
    pub min: Float,
    pub max: Float,
}

impl SeriesStatistics {
    pub fn nan() -> Self {
        Self {
            avg: Float::NAN,
            min: Float::NAN,
            max: Float::NAN,
        }
    }
}

/// One time series for a single host (and optional sub-resource id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Series {
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub statistics: SeriesStatistics,
    pub data: Vec<Float>,
}

/// Percentile band over all series of a metric, used by the UI for large jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct StatsSeries {
    pub mean: Vec<Float>,
    pub min: Vec<Float>,
    pub max: Vec<Float>,
}

/// All series of one metric at one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobMetric {
    pub unit: Unit,
    pub timestep: i32,
    pub series: Vec<Series>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statistics_series: Option<StatsSeries>,
}

/// `metric name -> scope -> block`; the payload of an archive `data` blob.
pub type JobData = HashMap<String, HashMap<MetricScope, JobMetric>>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_float_nan_roundtrip() {
        let values = vec![Float(1.5), Float::NAN, Float(0.0)];
        let json = serde_json::to_string(&values).unwrap();
        assert_eq!(json, "[1.5,null,0.0]");
        let back: Vec<Float> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, values);
    }

    #[test]
    fn test_scope_parse() {
        assert_eq!(MetricScope::parse("node"), Some(MetricScope::Node));
        assert_eq!(MetricScope::parse("hwthread"), Some(MetricScope::HwThread));
        assert_eq!(MetricScope::parse("rack"), None);
    }

    #[test]
    fn test_job_data_shape() {
        let mut data: JobData = HashMap::new();
        data.entry("load_one".to_string()).or_default().insert(
            MetricScope::Node,
            JobMetric {
                unit: Unit {
                    base: String::new(),
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
                    data: vec![Float(0.5), Float(1.5), Float(2.0)],
                }],
                statistics_series: None,
            },
        );

        let json = serde_json::to_value(&data).unwrap();
        let back: JobData = serde_json::from_value(json).unwrap();
        assert_eq!(back, data);
    }
}
