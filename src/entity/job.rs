//! Job entity for SeaORM.

use sea_orm::entity::prelude::*;
use serde_json::Value as JsonValue;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "job")]
pub struct Model {
    /// Surrogate key (dbid); the natural key is (job_id, cluster, start_time).
    #[sea_orm(primary_key)]
    pub id: i64,
    pub job_id: i64,
    pub cluster: String,
    pub sub_cluster: String,
    pub partition: Option<String>,
    pub project: Option<String>,
    pub username: String,
    pub array_job_id: Option<i64>,
    pub num_nodes: i32,
    pub num_hwthreads: i32,
    pub num_acc: i32,
    pub exclusive: i16,
    pub smt: i16,
    /// Closed set, see models::JobState
    pub job_state: String,
    /// Closed set, see models::MonitoringStatus
    pub monitoring_status: String,
    /// Unix timestamp
    pub start_time: i64,
    /// Seconds; 0 while running
    pub duration: i32,
    pub walltime: i64,
    /// Serialized Vec<Resource>; length equals num_nodes
    #[sea_orm(column_type = "JsonBinary")]
    pub resources: JsonValue,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub meta_data: Option<JsonValue>,
    /// map<metric_stat, f64>, filled at archive time
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub footprint: Option<JsonValue>,
    /// map<metric, kWh>, filled at archive time
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub energy_footprint: Option<JsonValue>,
    /// map<metric, {unit, avg, min, max}>, filled at archive time
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub statistics: Option<JsonValue>,
    /// Total kWh, rounded to two decimals
    pub energy: f64,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::job_tag::Entity")]
    JobTags,
}

impl Related<super::job_tag::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::JobTags.def()
    }
}

impl Related<super::tag::Entity> for Entity {
    fn to() -> RelationDef {
        super::job_tag::Relation::Tag.def()
    }

    fn via() -> Option<RelationDef> {
        Some(super::job_tag::Relation::Job.def().rev())
    }
}

impl ActiveModelBehavior for ActiveModel {}
