use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
};
use uuid::Uuid;

use crate::{
    error::ApiError,
    handlers::ListParams,
    models::{Target, TargetCreate},
    AppState,
};

pub async fn create_target(
    State(app_state): State<AppState>,
    Json(payload): Json<TargetCreate>,
) -> Result<(StatusCode, Json<Target>), ApiError> {
    let name = payload.name.trim();
    let address = payload.address.trim();

    if name.is_empty() {
        return Err(ApiError::validation("target name must not be empty"));
    }
    // The address ends up on a scanner command line
    if address.is_empty() || address.starts_with('-') || address.contains(char::is_whitespace) {
        return Err(ApiError::validation(format!(
            "invalid target address '{}'",
            payload.address
        )));
    }

    let target = app_state
        .target_repository
        .create(&TargetCreate {
            name: name.to_string(),
            address: address.to_string(),
            description: payload.description,
        })
        .await?;

    tracing::info!(target_id = %target.id, address = %target.address, "target created");
    Ok((StatusCode::CREATED, Json(target)))
}

pub async fn list_targets(
    State(app_state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<Target>>, ApiError> {
    let targets = app_state
        .target_repository
        .list(params.limit(), params.offset())
        .await?;
    Ok(Json(targets))
}

pub async fn get_target(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Target>, ApiError> {
    let target = app_state
        .target_repository
        .get_by_id(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Target {} not found", id)))?;
    Ok(Json(target))
}
