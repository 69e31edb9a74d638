use axum::{
    Json,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use scanrelay_core::{AppError, FullUri};
use scanrelay_github::webhook::{GitHubEvent, pull_request_trigger};

use super::callback_url;
use crate::AppState;

/// Dispatches a scan for pull request events that change the head commit.
pub async fn webhook(
    State(state): State<AppState>,
    uri: FullUri,
    GitHubEvent { event }: GitHubEvent,
) -> Result<Response, AppError> {
    let source = match &event.repository {
        Some(repository) => repository.full_name.clone().unwrap_or_else(|| repository.name.clone()),
        None => match &event.sender {
            Some(sender) => format!("@{}", sender.login),
            None => "unknown source".to_string(),
        },
    };
    tracing::info!("Received webhook event {:?} from {}", event.kind, source);

    let Some(trigger) = pull_request_trigger(&event) else {
        return Ok((StatusCode::OK, "Ignored").into_response());
    };
    if let Err(reason) = scanrelay_jobs::validate_event(&trigger) {
        tracing::warn!("Ignoring pull request event from {}: {}", source, reason);
        return Ok((StatusCode::OK, "Ignored").into_response());
    }
    let callback_url = callback_url(&state.config, &uri);
    let receipt = state.dispatcher.submit(trigger, &callback_url).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)).into_response())
}
