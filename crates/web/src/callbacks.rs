use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use base64::{Engine, engine::general_purpose::STANDARD};
use moka::future::Cache;
use scanrelay_core::models::CallbackPayload;
use serde::Serialize;
use time::OffsetDateTime;

/// Callback as received from a worker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceivedCallback {
    pub app_name: String,
    pub msg_base64: String,
    /// Decoded message, when the payload is valid base64 and UTF-8.
    pub message: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub received_at: OffsetDateTime,
}

impl ReceivedCallback {
    pub fn new(payload: CallbackPayload) -> Self {
        let message = STANDARD
            .decode(&payload.msg_base64)
            .ok()
            .and_then(|bytes| String::from_utf8(bytes).ok());
        Self {
            app_name: payload.app_name,
            msg_base64: payload.msg_base64,
            message,
            received_at: OffsetDateTime::now_utc(),
        }
    }
}

/// Received callbacks keyed by job id, evicted after a fixed time to live.
#[derive(Clone)]
pub struct CallbackLog {
    entries: Cache<String, Arc<Mutex<Vec<ReceivedCallback>>>>,
}

impl CallbackLog {
    pub fn new(ttl: Duration) -> Self {
        Self { entries: Cache::builder().time_to_live(ttl).max_capacity(10_000).build() }
    }

    pub async fn record(&self, job_id: &str, callback: ReceivedCallback) {
        let entry =
            self.entries.get_with(job_id.to_string(), async { Arc::new(Mutex::new(vec![])) }).await;
        let mut list = entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        list.push(callback);
    }

    pub async fn get(&self, job_id: &str) -> Vec<ReceivedCallback> {
        match self.entries.get(job_id).await {
            Some(entry) => entry.lock().unwrap_or_else(|poisoned| poisoned.into_inner()).clone(),
            None => vec![],
        }
    }
}
