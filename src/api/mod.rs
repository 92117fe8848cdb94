//! API endpoint modules.

pub mod health;
pub mod jobs;
pub mod machine_state;
pub mod openapi;

pub use health::configure_health_routes;
pub use jobs::configure_job_routes;
pub use machine_state::configure_machine_state_routes;
pub use openapi::ApiDoc;
