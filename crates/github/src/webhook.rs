use std::{fmt::Display, sync::Arc};

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{FromRef, FromRequest, Request},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use hmac::{Hmac, Mac};
use octocrab::models::webhook_events::{
    EventInstallation, WebhookEvent, WebhookEventPayload,
    payload::PullRequestWebhookEventAction,
};
use scanrelay_core::{config::Config, models::TriggerEvent};
use sha2::Sha256;

/// Verify and extract GitHub Event Payload.
#[derive(Clone)]
#[must_use]
pub struct GitHubEvent {
    pub event: WebhookEvent,
}

impl<S> FromRequest<S> for GitHubEvent
where
    Arc<Config>: FromRef<S>,
    S: Send + Sync + Clone,
{
    type Rejection = Response;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        fn err(m: impl Display) -> Response {
            tracing::error!("{m}");
            (StatusCode::BAD_REQUEST, m.to_string()).into_response()
        }
        let event = req
            .headers()
            .get("X-GitHub-Event")
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| err("X-GitHub-Event header missing"))?
            .to_string();
        let config = <Arc<Config>>::from_ref(state);
        let body = if let Some(secret) = &config.github.webhook_secret {
            let signature_sha256 = req
                .headers()
                .get("X-Hub-Signature-256")
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| err("X-Hub-Signature-256 missing"))?
                .strip_prefix("sha256=")
                .ok_or_else(|| err("X-Hub-Signature-256 sha256= prefix missing"))?;
            let signature =
                hex::decode(signature_sha256).map_err(|_| err("X-Hub-Signature-256 malformed"))?;
            let body =
                Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?;
            if !verify_signature(secret.as_bytes(), &body, &signature) {
                return Err(err("signature mismatch"));
            }
            body
        } else {
            Bytes::from_request(req, state).await.map_err(|_| err("error reading body"))?
        };
        let value = WebhookEvent::try_from_header_and_body(&event, &body)
            .map_err(|_| err("error parsing body"))?;
        Ok(GitHubEvent { event: value })
    }
}

fn verify_signature(secret: &[u8], body: &[u8], signature: &[u8]) -> bool {
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(signature).is_ok()
}

/// Build a scan trigger from a pull request event. Returns `None` for any other event and for
/// pull request actions that do not change the head commit.
pub fn pull_request_trigger(event: &WebhookEvent) -> Option<TriggerEvent> {
    let WebhookEventPayload::PullRequest(payload) = &event.specific else {
        return None;
    };
    if !matches!(
        payload.action,
        PullRequestWebhookEventAction::Opened
            | PullRequestWebhookEventAction::Synchronize
            | PullRequestWebhookEventAction::Reopened
    ) {
        tracing::debug!("Ignoring pull_request action {:?}", payload.action);
        return None;
    }
    let repository = event.repository.as_ref()?;
    let owner = repository.owner.as_ref()?;
    let installation_id = match &event.installation {
        Some(EventInstallation::Full(installation)) => Some(installation.id.into_inner()),
        Some(EventInstallation::Minimal(installation)) => Some(installation.id.into_inner()),
        None => None,
    };
    let head = &payload.pull_request.head;
    Some(TriggerEvent {
        repo_owner: owner.login.clone(),
        repo_name: repository.name.clone(),
        branch: head.ref_field.clone(),
        pull_request_id: payload.number,
        commit_sha: head.sha.clone(),
        installation_id,
    })
}
