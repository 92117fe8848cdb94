//! Migration: Create users table.

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
                CREATE TABLE users (
                    username VARCHAR(255) PRIMARY KEY,
                    name VARCHAR(255),
                    email VARCHAR(255),
                    -- JSON array of role strings: admin, support, manager, api, user
                    roles JSONB NOT NULL DEFAULT '[]'::jsonb,
                    -- JSON array of project names (manager scope)
                    projects JSONB NOT NULL DEFAULT '[]'::jsonb,
                    -- sha256 hex of the API token
                    token_hash VARCHAR(64),
                    -- Per-user UI configuration
                    ui_config JSONB,
                    created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                );

                CREATE UNIQUE INDEX idx_users_token_hash ON users(token_hash)
                    WHERE token_hash IS NOT NULL;
                "#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP TABLE IF EXISTS users CASCADE;")
            .await?;

        Ok(())
    }
}
