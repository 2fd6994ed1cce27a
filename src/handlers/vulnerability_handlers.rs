use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    error::ApiError,
    handlers::ListParams,
    models::{DefinitionSummary, InstanceFilter, InstanceStatus, InstanceSummary},
    AppState,
};

#[derive(Debug, Deserialize)]
pub struct InstanceStatusUpdate {
    pub status: InstanceStatus,
}

pub async fn list_definitions(
    State(app_state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<DefinitionSummary>>, ApiError> {
    let definitions = app_state
        .vulnerability_repository
        .list_definitions(params.limit(), params.offset())
        .await?;
    Ok(Json(definitions.iter().map(|d| d.to_summary()).collect()))
}

pub async fn list_instances(
    State(app_state): State<AppState>,
    Query(filter): Query<InstanceFilter>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<InstanceSummary>>, ApiError> {
    let instances = app_state
        .vulnerability_repository
        .list_instances(&filter, params.limit(), params.offset())
        .await?;
    Ok(Json(instances.iter().map(|i| i.to_summary()).collect()))
}

pub async fn update_instance_status(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(payload): Json<InstanceStatusUpdate>,
) -> Result<Json<InstanceSummary>, ApiError> {
    let instance = app_state
        .vulnerability_repository
        .update_instance_status(&id, payload.status)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Vulnerability instance {} not found", id)))?;

    tracing::info!(instance_id = %id, status = %instance.status, "instance status updated");
    Ok(Json(instance.to_summary()))
}
