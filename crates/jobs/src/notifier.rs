use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use scanrelay_core::models::{CallbackPayload, JobId};

/// Delivers completion callbacks. Delivery is best-effort and never retried.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()>;
}

pub fn callback_payload(id: &JobId, message: &str, app_name: &str) -> CallbackPayload {
    CallbackPayload {
        id: id.to_string(),
        msg_base64: STANDARD.encode(message),
        app_name: app_name.to_string(),
    }
}

#[derive(Clone)]
pub struct HttpNotifier {
    client: reqwest::Client,
}

impl HttpNotifier {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("scanrelay/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    async fn notify(&self, url: &str, payload: &CallbackPayload) -> Result<()> {
        let response = self
            .client
            .post(url)
            .json(payload)
            .send()
            .await
            .with_context(|| format!("Failed to send callback to {url}"))?;
        tracing::info!(job_id = %payload.id, "Callback sent: {}", response.status());
        response.error_for_status().context("Callback rejected")?;
        Ok(())
    }
}
