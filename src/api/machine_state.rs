//! Machine-state snapshots: raw JSON documents stored per (cluster, host).

use actix_web::{HttpResponse, web};
use std::path::PathBuf;
use tracing::info;

use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::models::Role;

fn state_file(config: &Config, cluster: &str, host: &str) -> AppResult<PathBuf> {
    // The path components come from the URL; keep them to a single segment.
    if cluster.contains(['/', '\\', '.']) || host.contains(['/', '\\']) {
        return Err(AppError::InvalidInput(
            "cluster and host must be plain names".to_string(),
        ));
    }
    Ok(config
        .machine_state_dir
        .join(cluster)
        .join(format!("{}.json", host)))
}

/// Store a machine-state snapshot.
#[utoipa::path(
    put,
    path = "/api/machine_state/{cluster}/{host}",
    tag = "MachineState",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("host" = String, Path, description = "Host name"),
    ),
    request_body = serde_json::Value,
    responses(
        (status = 201, description = "Snapshot stored"),
        (status = 403, description = "Admin only", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn put_machine_state(
    auth: crate::auth::ApiAuth,
    config: web::Data<Config>,
    path: web::Path<(String, String)>,
    body: web::Bytes,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Admin)?;

    let (cluster, host) = path.into_inner();

    // Bodies must at least parse as JSON before they are persisted.
    serde_json::from_slice::<serde_json::Value>(&body)
        .map_err(|e| AppError::InvalidInput(format!("machine state must be JSON: {}", e)))?;

    let file = state_file(&config, &cluster, &host)?;
    if let Some(parent) = file.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(&file, &body).await?;

    info!("Machine state stored for {}/{}", cluster, host);
    Ok(HttpResponse::Created().finish())
}

/// Fetch a machine-state snapshot.
#[utoipa::path(
    get,
    path = "/api/machine_state/{cluster}/{host}",
    tag = "MachineState",
    params(
        ("cluster" = String, Path, description = "Cluster name"),
        ("host" = String, Path, description = "Host name"),
    ),
    responses(
        (status = 200, description = "Snapshot"),
        (status = 404, description = "No snapshot", body = crate::error::ErrorResponse),
    ),
    security(("api_key" = []))
)]
pub async fn get_machine_state(
    auth: crate::auth::ApiAuth,
    config: web::Data<Config>,
    path: web::Path<(String, String)>,
) -> AppResult<HttpResponse> {
    auth.user.require_role(Role::Admin)?;

    let (cluster, host) = path.into_inner();
    let file = state_file(&config, &cluster, &host)?;

    match tokio::fs::read(&file).await {
        Ok(bytes) => Ok(HttpResponse::Ok()
            .content_type("application/json")
            .body(bytes)),
        Err(_) => Err(AppError::NotFound(format!(
            "Machine state for {}/{}",
            cluster, host
        ))),
    }
}

/// Configure machine-state routes.
pub fn configure_machine_state_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/machine_state/{cluster}/{host}")
            .route(web::put().to(put_machine_state))
            .route(web::post().to(put_machine_state))
            .route(web::get().to(get_machine_state)),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveKind, Environment};
    use std::collections::HashMap;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            environment: Environment::Development,
            host: "127.0.0.1".to_string(),
            port: 8080,
            database_url: String::new(),
            archive_kind: ArchiveKind::File,
            archive_path: dir.join("archive"),
            machine_state_dir: dir.join("machine-state"),
            archive_workers: 1,
            shutdown_grace_secs: 1,
            parquet_max_file_bytes: 1024,
            object_store: None,
            metric_data_repository: HashMap::new(),
            jwt_public_key: None,
            jwt_private_key: None,
        }
    }

    #[test]
    fn test_state_file_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let config = test_config(dir.path());

        assert!(state_file(&config, "c", "host1").is_ok());
        assert!(state_file(&config, "../etc", "host1").is_err());
        assert!(state_file(&config, "c", "../../passwd").is_err());
    }
}
