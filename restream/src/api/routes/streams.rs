//! Stream definition and session control routes.

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};

use crate::api::caller::Caller;
use crate::api::error::{ApiError, ApiResult};
use crate::api::models::{CreateStreamRequest, StreamResponse, UpdateStreamRequest};
use crate::api::server::AppState;
use crate::domain::StreamDefinition;
use crate::scheduler::{QueueStatus, StartOutcome, StopOutcome};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_streams).post(create_stream))
        .route("/queue", get(queue_status))
        .route(
            "/{id}",
            get(get_stream).put(update_stream).delete(delete_stream),
        )
        .route("/{id}/start", post(start_stream))
        .route("/{id}/stop", post(stop_stream))
}

/// Load a definition and check that `caller` owns it.
async fn load_owned(state: &AppState, id: &str, caller: &Caller) -> ApiResult<StreamDefinition> {
    let definition = state.stream_repository.get_stream(id).await?;
    if !definition.is_owned_by(caller.id()) {
        return Err(ApiError::forbidden("You do not have access to this stream"));
    }
    Ok(definition)
}

async fn list_streams(
    State(state): State<AppState>,
    caller: Caller,
) -> ApiResult<Json<Vec<StreamResponse>>> {
    let definitions = state
        .stream_repository
        .list_streams_by_owner(caller.id())
        .await?;

    let running = state.scheduler.running_ids().await;
    let response = definitions
        .iter()
        .map(|d| StreamResponse::from_definition(d, running.contains(&d.id)))
        .collect();

    Ok(Json(response))
}

async fn create_stream(
    State(state): State<AppState>,
    caller: Caller,
    Json(request): Json<CreateStreamRequest>,
) -> ApiResult<(StatusCode, Json<StreamResponse>)> {
    request.validate().map_err(ApiError::validation)?;

    let definition = request.into_definition(caller.id());
    state.stream_repository.create_stream(&definition).await?;

    tracing::info!(
        stream_id = %definition.id,
        owner_id = %definition.owner_id,
        platform = %definition.platform,
        destination = %definition.destination,
        "Stream created"
    );

    Ok((
        StatusCode::CREATED,
        Json(StreamResponse::from_definition(&definition, false)),
    ))
}

async fn get_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<StreamResponse>> {
    let definition = load_owned(&state, &id, &caller).await?;
    let running = state.scheduler.is_running(&id).await;
    Ok(Json(StreamResponse::from_definition(&definition, running)))
}

/// Partial update; refused with 409 while the stream is running or queued.
async fn update_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
    Json(request): Json<UpdateStreamRequest>,
) -> ApiResult<Json<StreamResponse>> {
    request.validate().map_err(ApiError::validation)?;

    let definition = state
        .scheduler
        .update(&id, caller.id(), request.into_update())
        .await?;
    Ok(Json(StreamResponse::from_definition(&definition, false)))
}

async fn delete_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.scheduler.delete(&id, caller.id()).await?;

    Ok(Json(serde_json::json!({
        "success": true,
        "message": format!("Stream '{}' deleted successfully", id)
    })))
}

/// 200 with `{"status":"started"}` or 202 with `{"status":"queued","position":n}`.
async fn start_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<StartOutcome>)> {
    let outcome = state.scheduler.start(&id, caller.id()).await?;
    let status = match outcome {
        StartOutcome::Started => StatusCode::OK,
        StartOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

async fn stop_stream(
    State(state): State<AppState>,
    caller: Caller,
    Path(id): Path<String>,
) -> ApiResult<Json<StopOutcome>> {
    let outcome = state.scheduler.stop(&id, caller.id()).await?;
    Ok(Json(outcome))
}

async fn queue_status(State(state): State<AppState>) -> Json<QueueStatus> {
    Json(state.scheduler.queue_status().await)
}
