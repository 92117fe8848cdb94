//! Migration: Create job table.
//!
//! One row per scheduler-observable job; the natural key is
//! (job_id, cluster, start_time).

use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared(
                r#"
                CREATE TABLE job (
                    id BIGSERIAL PRIMARY KEY, -- dbid
                    job_id BIGINT NOT NULL,
                    cluster VARCHAR(255) NOT NULL,
                    sub_cluster VARCHAR(255) NOT NULL,
                    partition VARCHAR(255),
                    project VARCHAR(255),
                    username VARCHAR(255) NOT NULL,
                    array_job_id BIGINT,

                    num_nodes INT NOT NULL CHECK (num_nodes > 0),
                    num_hwthreads INT NOT NULL DEFAULT 0 CHECK (num_hwthreads >= 0),
                    num_acc INT NOT NULL DEFAULT 0 CHECK (num_acc >= 0),
                    exclusive SMALLINT NOT NULL DEFAULT 1 CHECK (exclusive IN (0, 1)),
                    smt SMALLINT NOT NULL DEFAULT 1 CHECK (smt IN (0, 1, 2)),

                    job_state VARCHAR(16) NOT NULL
                        CHECK (job_state IN ('running', 'completed', 'failed', 'cancelled',
                                             'stopped', 'timeout', 'preempted', 'out_of_memory')),
                    monitoring_status VARCHAR(24) NOT NULL DEFAULT 'running_or_archiving'
                        CHECK (monitoring_status IN ('disabled', 'running_or_archiving',
                                                     'archiving_failed', 'archiving_successful')),

                    start_time BIGINT NOT NULL,
                    duration INT NOT NULL DEFAULT 0 CHECK (duration >= 0),
                    walltime BIGINT NOT NULL DEFAULT 0 CHECK (walltime >= 0),

                    -- Serialized Vec<Resource>; length equals num_nodes
                    resources JSONB NOT NULL,
                    meta_data JSONB,

                    -- Aggregates, filled at archive time
                    footprint JSONB,
                    energy_footprint JSONB,
                    statistics JSONB,
                    energy DOUBLE PRECISION NOT NULL DEFAULT 0
                );

                -- Natural key uniqueness
                CREATE UNIQUE INDEX idx_job_natural_key ON job(job_id, cluster, start_time);

                -- Duplicate-window lookups and natural-key Find
                CREATE INDEX idx_job_jobid_cluster ON job(job_id, cluster);

                CREATE INDEX idx_job_cluster ON job(cluster);
                CREATE INDEX idx_job_state ON job(job_state);
                CREATE INDEX idx_job_start_time ON job(start_time);
                CREATE INDEX idx_job_username ON job(username);
                CREATE INDEX idx_job_project ON job(project);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TABLE IF EXISTS job CASCADE;")
            .await?;

        Ok(())
    }
}
