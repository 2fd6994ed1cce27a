use std::sync::Arc;

use axum::{
    routing::{get, patch, post},
    Router,
};

use crate::{
    config::Settings,
    database::DatabasePool,
    repositories::{
        scan_repo::SqlxScanJobRepository, target_repo::SqlxTargetRepository,
        vulnerability_repo::SqlxVulnerabilityRepository, InMemoryScanJobRepository,
        InMemoryTargetRepository, InMemoryVulnerabilityRepository, ScanJobRepository,
        TargetRepository, VulnerabilityRepository,
    },
    services::{AdapterRegistry, ProgressBroadcaster, ScanManager},
};

pub mod config;
pub mod database;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod repositories;
pub mod services;

/// Shared application state containing all dependencies
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Settings>,
    /// `None` when running on the in-memory repositories.
    pub db_pool: Option<DatabasePool>,
    pub scan_manager: Arc<ScanManager>,
    pub target_repository: Arc<dyn TargetRepository>,
    pub vulnerability_repository: Arc<dyn VulnerabilityRepository>,
}

impl AppState {
    /// Postgres-backed state when `database_url` is set, in-memory otherwise.
    pub async fn new(config: Settings) -> Result<Self, crate::error::ApiError> {
        match config.database_url.clone() {
            Some(url) => {
                let db_pool =
                    crate::database::create_connection_pool(&url, config.max_concurrent_scans)
                        .await?;
                Ok(Self::new_with_pool(config, db_pool))
            }
            None => {
                tracing::warn!("DATABASE_URL not set, using in-memory repositories");
                Ok(Self::new_in_memory(config))
            }
        }
    }

    pub fn new_with_pool(config: Settings, db_pool: DatabasePool) -> Self {
        let config = Arc::new(config);
        let adapters = AdapterRegistry::from_settings(config.clone());
        Self::with_repositories(
            config,
            Some(db_pool.clone()),
            Arc::new(SqlxScanJobRepository::new(db_pool.clone())),
            Arc::new(SqlxTargetRepository::new(db_pool.clone())),
            Arc::new(SqlxVulnerabilityRepository::new(db_pool)),
            adapters,
        )
    }

    pub fn new_in_memory(config: Settings) -> Self {
        let config = Arc::new(config);
        let adapters = AdapterRegistry::from_settings(config.clone());
        Self::with_adapters(config, adapters)
    }

    /// In-memory repositories with caller-supplied adapters.
    pub fn with_adapters(config: Arc<Settings>, adapters: AdapterRegistry) -> Self {
        Self::with_repositories(
            config,
            None,
            Arc::new(InMemoryScanJobRepository::new()),
            Arc::new(InMemoryTargetRepository::new()),
            Arc::new(InMemoryVulnerabilityRepository::new()),
            adapters,
        )
    }

    pub fn with_repositories(
        config: Arc<Settings>,
        db_pool: Option<DatabasePool>,
        scan_repository: Arc<dyn ScanJobRepository>,
        target_repository: Arc<dyn TargetRepository>,
        vulnerability_repository: Arc<dyn VulnerabilityRepository>,
        adapters: AdapterRegistry,
    ) -> Self {
        let broadcaster = Arc::new(ProgressBroadcaster::new(
            config.progress_channel_capacity as usize,
        ));
        let scan_manager = Arc::new(ScanManager::new(
            &config,
            scan_repository,
            target_repository.clone(),
            vulnerability_repository.clone(),
            adapters,
            broadcaster,
        ));

        Self {
            config,
            db_pool,
            scan_manager,
            target_repository,
            vulnerability_repository,
        }
    }
}

/// All API routes with the global middleware stack applied.
pub fn build_router(app_state: AppState) -> Router {
    let cors_layer = middleware::create_cors_layer(app_state.config.cors_allow_origins.clone());

    Router::new()
        .route("/api/health", get(handlers::health_check))
        // Target endpoints
        .route(
            "/api/targets",
            post(handlers::target_handlers::create_target).get(handlers::target_handlers::list_targets),
        )
        .route("/api/targets/:id", get(handlers::target_handlers::get_target))
        // Scan endpoints
        .route(
            "/api/scans",
            post(handlers::scan_handlers::create_scan).get(handlers::scan_handlers::list_scans),
        )
        .route("/api/scans/queue", get(handlers::scan_handlers::queue_state))
        .route(
            "/api/scans/:id",
            get(handlers::scan_handlers::get_scan).delete(handlers::scan_handlers::delete_scan),
        )
        .route("/api/scans/:id/cancel", post(handlers::scan_handlers::cancel_scan))
        .route("/api/scans/:id/reingest", post(handlers::scan_handlers::reingest_scan))
        .route("/api/scans/:id/events", get(handlers::scan_handlers::scan_events_ws))
        // Vulnerability endpoints
        .route(
            "/api/vulnerabilities",
            get(handlers::vulnerability_handlers::list_definitions),
        )
        .route(
            "/api/vulnerabilities/instances",
            get(handlers::vulnerability_handlers::list_instances),
        )
        .route(
            "/api/vulnerabilities/instances/:id",
            patch(handlers::vulnerability_handlers::update_instance_status),
        )
        .with_state(app_state)
        .layer(axum::middleware::from_fn(middleware::request_logging_middleware))
        .layer(middleware::create_logging_layer())
        .layer(cors_layer)
}
