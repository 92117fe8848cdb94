//! Migration: Create jobtag join table.

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
                CREATE TABLE jobtag (
                    job_id BIGINT NOT NULL REFERENCES job(id) ON DELETE CASCADE,
                    tag_id BIGINT NOT NULL REFERENCES tag(id) ON DELETE CASCADE,
                    PRIMARY KEY (job_id, tag_id)
                );

                CREATE INDEX idx_jobtag_tag_id ON jobtag(tag_id);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TABLE IF EXISTS jobtag CASCADE;")
            .await?;

        Ok(())
    }
}
