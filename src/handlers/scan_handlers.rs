use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{Json, Response},
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    error::ApiError,
    handlers::ListParams,
    models::{QueueState, ScanJob, ScanJobCreate, ScanProgress, ScannerKind},
    services::{IngestionSummary, ProgressBroadcaster, ScanEvent, Subscription},
    AppState,
};

pub async fn create_scan(
    State(app_state): State<AppState>,
    Json(payload): Json<ScanJobCreate>,
) -> Result<(StatusCode, Json<ScanProgress>), ApiError> {
    if payload.scanner == ScannerKind::Plugin
        && payload.args.as_deref().map_or(true, |a| a.trim().is_empty())
    {
        return Err(ApiError::validation(
            "plugin scans need the plugin name as the first argument",
        ));
    }

    let manager = &app_state.scan_manager;
    let scan_id = manager.submit(payload).await?;
    let status = manager.get_status(&scan_id).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

pub async fn list_scans(
    State(app_state): State<AppState>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<ScanJob>>, ApiError> {
    let scans = app_state
        .scan_manager
        .list(params.limit(), params.offset())
        .await?;
    Ok(Json(scans))
}

pub async fn get_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScanProgress>, ApiError> {
    Ok(Json(app_state.scan_manager.get_status(&id).await?))
}

pub async fn delete_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    app_state.scan_manager.delete(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Always 200 for a known scan; `accepted` says whether a running job was signalled.
pub async fn cancel_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Value>, ApiError> {
    let manager = &app_state.scan_manager;
    manager.get_job(&id).await?;
    let accepted = manager.cancel(&id);
    Ok(Json(json!({ "scan_id": id, "accepted": accepted })))
}

pub async fn reingest_scan(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<IngestionSummary>, ApiError> {
    Ok(Json(app_state.scan_manager.reingest(&id).await?))
}

pub async fn queue_state(State(app_state): State<AppState>) -> Result<Json<QueueState>, ApiError> {
    Ok(Json(app_state.scan_manager.get_queue_state().await?))
}

// ============================================================================
// WebSocket progress stream
// ============================================================================

/// Streams a scan's events: the current snapshot first, then live events
/// until the terminal one. Finished scans get the snapshot and a close.
pub async fn scan_events_ws(
    State(app_state): State<AppState>,
    Path(id): Path<Uuid>,
    ws: WebSocketUpgrade,
) -> Result<Response, ApiError> {
    let manager = &app_state.scan_manager;
    let broadcaster = manager.broadcaster().clone();

    // Subscribe before reading the job so a terminal event cannot slip between
    let subscription = broadcaster.subscribe(id);
    let job = match manager.get_job(&id).await {
        Ok(job) => job,
        Err(e) => {
            broadcaster.unsubscribe(&id, subscription.id);
            return Err(e);
        }
    };

    let subscription = if job.status.is_terminal() {
        broadcaster.unsubscribe(&id, subscription.id);
        None
    } else {
        Some(subscription)
    };
    let snapshot = job.progress_view();

    Ok(ws.on_upgrade(move |socket| stream_events(socket, snapshot, subscription, broadcaster)))
}

async fn send_event(socket: &mut WebSocket, event: &ScanEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(e) => {
            tracing::warn!(error = %e, "failed to encode scan event");
            true
        }
    }
}

/// Progress events buffered before the snapshot was read can be behind it.
/// Terminal events always go through.
fn is_behind_snapshot(snapshot: &ScanProgress, event: &ScanEvent) -> bool {
    match event {
        ScanEvent::Progress(progress) => {
            !progress.status.is_terminal() && progress.progress < snapshot.progress
        }
        _ => false,
    }
}

async fn stream_events(
    mut socket: WebSocket,
    snapshot: ScanProgress,
    subscription: Option<Subscription>,
    broadcaster: Arc<ProgressBroadcaster>,
) {
    if !send_event(&mut socket, &ScanEvent::Progress(snapshot.clone())).await {
        if let Some(subscription) = subscription {
            broadcaster.unsubscribe(&subscription.scan_id, subscription.id);
        }
        return;
    }

    let Some(mut subscription) = subscription else {
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        tokio::select! {
            event = subscription.events.recv() => match event {
                Some(event) if is_behind_snapshot(&snapshot, &event) => {}
                Some(event) => {
                    let terminal = event.is_terminal();
                    if !send_event(&mut socket, &event).await || terminal {
                        break;
                    }
                }
                None => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    broadcaster.unsubscribe(&subscription.scan_id, subscription.id);
    let _ = socket.send(Message::Close(None)).await;
}
