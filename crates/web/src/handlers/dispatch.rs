use axum::{Json, extract::State, http::StatusCode};
use scanrelay_core::{AppError, FullUri, models::TriggerEvent};
use scanrelay_jobs::{DispatchReceipt, validate_event};

use super::callback_url;
use crate::AppState;

/// Manual trigger: submits a job for every configured scanner class.
pub async fn dispatch(
    State(state): State<AppState>,
    uri: FullUri,
    Json(event): Json<TriggerEvent>,
) -> Result<(StatusCode, Json<DispatchReceipt>), AppError> {
    validate_event(&event).map_err(AppError::bad_request)?;
    tracing::info!(
        "Dispatching {}/{} branch={} pr={}",
        event.repo_owner,
        event.repo_name,
        event.branch,
        event.pull_request_id
    );
    let callback_url = callback_url(&state.config, &uri);
    let receipt = state.dispatcher.submit(event, &callback_url).await?;
    let status = if receipt.enqueued.is_empty() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(receipt)))
}
