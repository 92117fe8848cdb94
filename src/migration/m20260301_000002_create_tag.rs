//! Migration: Create tag table.

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
                CREATE TABLE tag (
                    id BIGSERIAL PRIMARY KEY,
                    tag_type VARCHAR(255) NOT NULL,
                    tag_name VARCHAR(255) NOT NULL,
                    -- 'global', a username, or 'admin'
                    tag_scope VARCHAR(255) NOT NULL DEFAULT 'global'
                );

                -- Tag identity is (type, name, scope)
                CREATE UNIQUE INDEX idx_tag_identity ON tag(tag_type, tag_name, tag_scope);
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TABLE IF EXISTS tag CASCADE;")
            .await?;

        Ok(())
    }
}
