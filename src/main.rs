//! Job Archive Server - Main entry point.
//!
//! Dispatches the CLI surface and starts the Actix-web server with configured
//! routes, middleware and the background archiver.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{App, HttpServer, http::header, web};
use clap::Parser;
use sea_orm_migration::MigratorTrait;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use jobarchive_lib::archive::{load_cluster_registry, open_archive};
use jobarchive_lib::config::Config;
use jobarchive_lib::db::DbPool;
use jobarchive_lib::metricdata::MetricDataRepos;
use jobarchive_lib::migration::Migrator;
use jobarchive_lib::models::{self, Role};
use jobarchive_lib::services::{Archiver, ArchiverContext};
use jobarchive_lib::{api, auth, db, error, graphql, middleware, services};

/// Control plane for HPC job monitoring.
#[derive(Debug, Parser)]
#[command(name = "jobarchive", version, about)]
struct Cli {
    /// Create the archive skeleton (version marker, directories) and exit
    #[arg(long)]
    init: bool,

    /// Bulk load the catalog from the existing archive and exit
    #[arg(long = "init-db")]
    init_db: bool,

    /// Apply pending database migrations and exit
    #[arg(long = "migrate-db")]
    migrate_db: bool,

    /// Revert the last database migration and exit
    #[arg(long = "revert-db")]
    revert_db: bool,

    /// Accept an archive with a mismatching version marker
    #[arg(long = "force-db")]
    force_db: bool,

    /// Start the HTTP server
    #[arg(long)]
    server: bool,

    /// Development mode (implies --server, permissive CORS, 4 workers)
    #[arg(long)]
    dev: bool,

    /// JSON config file overlaying the environment
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Create a user: name:role1,role2:token (empty token = generate)
    #[arg(long = "add-user", value_name = "name:roles:token")]
    add_user: Option<String>,

    /// Delete a user by name
    #[arg(long = "del-user", value_name = "name")]
    del_user: Option<String>,

    /// Issue a signed JWT for the named user and exit
    #[arg(long, value_name = "name")]
    jwt: Option<String>,

    /// Import finished jobs from meta:data JSON file pairs
    #[arg(long = "import-job", value_name = "meta:data[,...]")]
    import_job: Option<String>,

    /// Re-attach tags recorded in archived metas to catalog rows
    #[arg(long = "apply-tags")]
    apply_tags: bool,

    /// Log filter, e.g. "info" or "jobarchive=debug"
    #[arg(long, value_name = "FILTER")]
    loglevel: Option<String>,

    /// Include full timestamps in log lines
    #[arg(long)]
    logdate: bool,
}

fn init_logging(cli: &Cli) {
    let filter = match &cli.loglevel {
        Some(level) => EnvFilter::new(level.clone()),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if cli.logdate {
        builder.init();
    } else {
        builder.without_time().init();
    }
}

fn load_config(cli: &Cli) -> Config {
    let config = match Config::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            error!("");
            error!("Please check your environment variables:");
            error!("  - RUST_ENV must be set to 'development' or 'production'");
            error!("  - In production, JOBARCHIVE_DATABASE_URL must be set");
            error!("  - In production, values must not match development defaults");
            std::process::exit(1);
        }
    };

    match &cli.config {
        Some(path) => match config.apply_file(path) {
            Ok(cfg) => cfg,
            Err(e) => {
                error!("Failed to apply config file: {}", e);
                std::process::exit(1);
            }
        },
        None => config,
    }
}

/// Handle `--add-user name:roles:token`; prints the token when generated.
async fn add_user(pool: &DbPool, spec: &str) -> error::AppResult<()> {
    let parts: Vec<&str> = spec.splitn(3, ':').collect();
    let [name, roles, token] = parts.as_slice() else {
        return Err(error::AppError::InvalidInput(
            "--add-user expects name:roles:token".to_string(),
        ));
    };

    let roles: Vec<Role> = roles
        .split(',')
        .filter(|r| !r.is_empty())
        .map(|r| {
            Role::parse(r)
                .ok_or_else(|| error::AppError::InvalidInput(format!("unknown role '{}'", r)))
        })
        .collect::<error::AppResult<_>>()?;

    let (token, hash) = if token.is_empty() {
        let (token, hash) = auth::generate_token();
        (Some(token), hash)
    } else {
        (None, auth::hash_token(token))
    };

    pool.add_user(
        &models::UserRecord {
            username: name.to_string(),
            name: None,
            email: None,
            roles,
            projects: Vec::new(),
        },
        Some(hash),
    )
    .await?;

    info!("User '{}' created", name);
    if let Some(token) = token {
        // Shown exactly once; only the hash is stored.
        println!("{}", token);
    }
    Ok(())
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    let cli = Cli::parse();

    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    if cli.dev && std::env::var("RUST_ENV").is_err() {
        // Single-threaded at this point; safe to seed the environment.
        unsafe { std::env::set_var("RUST_ENV", "development") };
    }

    init_logging(&cli);

    let config = load_config(&cli);

    info!("========================================");
    info!("  Job Archive Server");
    info!("  Environment: {}", config.environment);
    info!("========================================");

    if config.is_development() {
        warn!("Running in DEVELOPMENT mode - do not use in production!");
    }

    // Open the archive; --init only prepares it and exits.
    let archive_store = match open_archive(&config).await {
        Ok(store) => store,
        Err(e) => {
            error!("Failed to open archive: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = archive_store.init(cli.force_db).await {
        error!("Archive initialization failed: {}", e);
        std::process::exit(1);
    }
    if cli.init {
        let skeleton = std::path::Path::new("./config.json");
        if !skeleton.exists() {
            let body = serde_json::json!({
                "archive-kind": "file",
                "archive-path": config.archive_path,
                "metric-data-repository": {}
            });
            std::fs::write(skeleton, serde_json::to_vec_pretty(&body).expect("static JSON"))?;
            info!("Wrote skeleton config to {}", skeleton.display());
        }
        info!("Archive initialized at {:?}", config.archive_path);
        return Ok(());
    }

    // Database connection and migrations
    let pool = match DbPool::new(&config).await {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to initialize database: {}", e);
            std::process::exit(1);
        }
    };
    info!("Database connection established");

    if cli.revert_db {
        if let Err(e) = Migrator::down(pool.connection(), Some(1)).await {
            error!("Migration revert failed: {}", e);
            std::process::exit(1);
        }
        info!("Last migration reverted");
        return Ok(());
    }

    if let Err(e) = Migrator::up(pool.connection(), None).await {
        error!("Failed to run migrations: {}", e);
        std::process::exit(1);
    }
    info!("Database migrations complete");
    if cli.migrate_db {
        return Ok(());
    }

    // Cluster registry from the archive's cluster.json files
    let registry = match load_cluster_registry(archive_store.as_ref()).await {
        Ok(registry) => Arc::new(registry),
        Err(e) => {
            error!("Failed to load cluster configurations: {}", e);
            std::process::exit(1);
        }
    };
    info!("Loaded {} cluster configurations", registry.names().len());

    // One-shot CLI pathways
    if let Some(spec) = &cli.add_user {
        if let Err(e) = add_user(&pool, spec).await {
            error!("{}", e);
            std::process::exit(1);
        }
        return Ok(());
    }
    if let Some(name) = &cli.del_user {
        if let Err(e) = pool.del_user(name).await {
            error!("{}", e);
            std::process::exit(1);
        }
        info!("User '{}' deleted", name);
        return Ok(());
    }
    if let Some(name) = &cli.jwt {
        let Some(private_key) = &config.jwt_private_key else {
            error!("JWT_PRIVATE_KEY is not configured");
            std::process::exit(1);
        };
        let roles = match pool.get_user(name).await {
            Ok(Some(row)) => db::users::parse_roles(&row.roles),
            Ok(None) => {
                error!("User '{}' not found", name);
                std::process::exit(1);
            }
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        };
        match auth::sign_jwt(private_key, name, &roles) {
            Ok(token) => println!("{}", token),
            Err(e) => {
                error!("{}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }
    if cli.init_db {
        match pool.init_db(archive_store.as_ref(), &registry).await {
            Ok(count) => info!("Loaded {} jobs from the archive", count),
            Err(e) => {
                error!("Bulk load failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }
    if let Some(spec) = &cli.import_job {
        match services::importer::import_job_files(&pool, archive_store.as_ref(), &registry, spec)
            .await
        {
            Ok(count) => info!("Imported {} jobs", count),
            Err(e) => {
                error!("Import failed: {}", e);
                std::process::exit(1);
            }
        }
        if let Err(e) = archive_store.flush().await {
            error!("Archive flush failed: {}", e);
            std::process::exit(1);
        }
        return Ok(());
    }
    if cli.apply_tags {
        match services::importer::apply_tags(&pool, archive_store.as_ref()).await {
            Ok(count) => info!("Applied {} tags", count),
            Err(e) => {
                error!("Tag sync failed: {}", e);
                std::process::exit(1);
            }
        }
        return Ok(());
    }

    if !cli.server && !cli.dev {
        error!("Nothing to do; pass --server to start (see --help)");
        std::process::exit(1);
    }

    // Metric store drivers and the background archiver
    let repos = MetricDataRepos::from_config(&config);
    let archiver = Archiver::start(
        config.archive_workers,
        ArchiverContext {
            pool: pool.clone(),
            archive: archive_store.clone(),
            repos: repos.clone(),
            registry: registry.clone(),
        },
    );

    // Terminal jobs interrupted before archival resume now.
    match pool.find_pending_archivals().await {
        Ok(pending) => {
            if !pending.is_empty() {
                info!("Re-enqueueing {} pending archivals", pending.len());
                for dbid in pending {
                    archiver.enqueue(dbid);
                }
            }
        }
        Err(e) => warn!("Cannot list pending archivals: {}", e),
    }

    let schema = graphql::build_schema(
        pool.clone(),
        registry.clone(),
        archive_store.clone(),
        repos.clone(),
    );

    let bind_address = config.bind_address();
    let is_development = config.is_development();

    let worker_count = if is_development {
        info!(
            "Starting server at http://{} (4 workers - development mode)",
            bind_address
        );
        4
    } else {
        let cpus = num_cpus::get();
        info!(
            "Starting server at http://{} ({} workers)",
            bind_address, cpus
        );
        cpus
    };

    let app_config = config.clone();
    let app_pool = pool.clone();
    let app_archive = archive_store.clone();
    let app_registry = registry.clone();
    let app_repos = repos.clone();
    let app_archiver = archiver.clone();

    let server = HttpServer::new(move || {
        let cors = if is_development {
            Cors::default()
                .allow_any_origin()
                .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
                .allowed_headers(vec![
                    header::AUTHORIZATION,
                    header::ACCEPT,
                    header::CONTENT_TYPE,
                    "X-API-Key".parse().unwrap(),
                ])
                .max_age(3600)
        } else {
            Cors::default()
                .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "OPTIONS"])
                .allowed_headers(vec![
                    header::AUTHORIZATION,
                    header::ACCEPT,
                    header::CONTENT_TYPE,
                    "X-API-Key".parse().unwrap(),
                ])
                .max_age(3600)
        };

        App::new()
            .wrap(cors)
            .wrap(middleware::HttpLogger)
            .app_data(web::Data::new(app_pool.clone()))
            .app_data(web::Data::new(app_config.clone()))
            .app_data(web::Data::from(app_archive.clone()))
            .app_data(web::Data::from(app_registry.clone()))
            .app_data(web::Data::new(app_repos.clone()))
            .app_data(web::Data::from(app_archiver.clone()))
            .app_data(web::Data::new(schema.clone()))
            .service(
                web::scope("/api")
                    .configure(api::configure_health_routes)
                    .configure(api::configure_job_routes)
                    .configure(api::configure_machine_state_routes),
            )
            .configure(graphql::configure_graphql_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", api::ApiDoc::openapi()),
            )
    });

    server
        .workers(worker_count)
        .bind(&bind_address)?
        .run()
        .await?;

    // Shutdown gate: the HTTP server is down, now drain the archiver and
    // seal buffered archive state.
    info!("Server stopped, draining archiver");
    archiver
        .shutdown(Duration::from_secs(config.shutdown_grace_secs))
        .await;
    if let Err(e) = archive_store.flush().await {
        error!("Archive flush on shutdown failed: {}", e);
    }
    info!("Shutdown complete");

    Ok(())
}
