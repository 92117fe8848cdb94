//! SeaORM database migrations.

pub use sea_orm_migration::prelude::*;

mod m20260301_000001_create_job;
mod m20260301_000002_create_tag;
mod m20260301_000003_create_jobtag;
mod m20260301_000004_create_users;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![
            Box::new(m20260301_000001_create_job::Migration),
            Box::new(m20260301_000002_create_tag::Migration),
            Box::new(m20260301_000003_create_jobtag::Migration),
            Box::new(m20260301_000004_create_users::Migration),
        ]
    }
}
