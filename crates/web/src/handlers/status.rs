use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use scanrelay_core::{
    AppError,
    models::{JobContext, JobId, ScannerKind},
};
use serde::Serialize;

use crate::{AppState, callbacks::ReceivedCallback};

#[derive(Serialize)]
pub struct StatusResponse {
    status: &'static str,
    broker: String,
    scanners: Vec<ScannerKind>,
}

pub async fn status(State(state): State<AppState>) -> (StatusCode, Json<StatusResponse>) {
    let scanners = state.config.dispatch.scanners.clone();
    match state.contexts.ping().await {
        Ok(()) => (
            StatusCode::OK,
            Json(StatusResponse { status: "ok", broker: "reachable".to_string(), scanners }),
        ),
        Err(e) => {
            tracing::warn!("Broker ping failed: {}", e);
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(StatusResponse { status: "degraded", broker: e.to_string(), scanners }),
            )
        }
    }
}

#[derive(Serialize)]
pub struct JobResponse {
    id: JobId,
    /// Absent once the context has expired.
    context: Option<JobContext>,
    callbacks: Vec<ReceivedCallback>,
}

pub async fn job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<JobResponse>, AppError> {
    let id =
        id.parse::<JobId>().map_err(|e| AppError::bad_request(format!("Invalid job id: {e}")))?;
    let context = state.contexts.get(&id).await?;
    let callbacks = state.callbacks.get(&id.to_string()).await;
    if context.is_none() && callbacks.is_empty() {
        return Err(AppError::Status(StatusCode::NOT_FOUND));
    }
    Ok(Json(JobResponse { id, context, callbacks }))
}
