use axum::{Json, extract::State, http::StatusCode};
use scanrelay_core::{AppError, models::CallbackPayload};

use crate::callbacks::{CallbackLog, ReceivedCallback};

/// Records a worker's completion notice. Nothing else depends on it.
pub async fn callback(
    State(callbacks): State<CallbackLog>,
    Json(payload): Json<CallbackPayload>,
) -> Result<StatusCode, AppError> {
    if payload.id.trim().is_empty() {
        return Err(AppError::bad_request("id is required"));
    }
    let job_id = payload.id.clone();
    let received = ReceivedCallback::new(payload);
    match &received.message {
        Some(message) => {
            tracing::info!(job_id = %job_id, "Callback from {}: {}", received.app_name, message)
        }
        None => tracing::warn!(job_id = %job_id, "Undecodable callback from {}", received.app_name),
    }
    callbacks.record(&job_id, received).await;
    Ok(StatusCode::OK)
}
