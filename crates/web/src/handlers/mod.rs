use axum::{
    Router,
    routing::{get, post},
};
use scanrelay_core::{FullUri, config::Config, util::UrlExt};

use crate::AppState;

mod callback;
mod dispatch;
mod status;
mod webhook;

pub fn build_router() -> Router<AppState> {
    Router::new()
        .route("/api/github/webhook", post(webhook::webhook))
        .route("/dispatch", post(dispatch::dispatch))
        .route("/callback", post(callback::callback))
        .route("/status", get(status::status))
        .route("/jobs/{id}", get(status::job))
}

/// URL workers post their completion notice to.
fn callback_url(config: &Config, uri: &FullUri) -> String {
    if let Some(public_url) = &config.server.public_url {
        return public_url.with_path("/callback").to_string();
    }
    let FullUri(uri) = uri;
    let scheme = uri.scheme_str().unwrap_or("http");
    match uri.authority() {
        Some(authority) => format!("{scheme}://{authority}/callback"),
        None => {
            tracing::warn!("Cannot determine the public URL from {}", uri);
            "/callback".to_string()
        }
    }
}
