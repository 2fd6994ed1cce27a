use axum::{extract::State, response::Json};
use serde_json::{json, Value};

use crate::{database, error::ApiError, AppState};

/// Liveness plus storage connectivity and the current admission load.
pub async fn health_check(State(app_state): State<AppState>) -> Result<Json<Value>, ApiError> {
    let database = match &app_state.db_pool {
        Some(pool) => match database::health_check(pool).await {
            Ok(()) => json!({ "healthy": true, "backend": "postgres" }),
            Err(e) => {
                tracing::error!("Database health check failed: {}", e);
                return Err(ApiError::internal("Service is unhealthy"));
            }
        },
        None => json!({ "healthy": true, "backend": "memory" }),
    };

    let queue = app_state.scan_manager.get_queue_state().await?;

    Ok(Json(json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
        "service": "recon-backend",
        "checks": {
            "database": database,
            "scans": {
                "max_concurrent": queue.max_concurrent,
                "active": queue.active_count,
                "queued": queue.queue_size,
            }
        }
    })))
}
