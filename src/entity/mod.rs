//! SeaORM entities for the catalog schema.

pub mod job;
pub mod job_tag;
pub mod tag;
pub mod user;
