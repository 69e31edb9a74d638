use std::sync::Arc;

use anyhow::{Context, Result, bail};
use scanrelay_core::{
    config::DispatchConfig,
    models::{JobContext, JobId, QueueMessage, ScannerKind, TriggerEvent},
};
use scanrelay_store::{ContextStore, StreamQueue};
use serde::Serialize;

/// Fans a trigger event out to one stream per configured scanner class.
#[derive(Clone)]
pub struct Dispatcher {
    contexts: Arc<dyn ContextStore>,
    queue: Arc<dyn StreamQueue>,
    config: DispatchConfig,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Enqueued {
    pub scanner: ScannerKind,
    pub stream: String,
    pub entry_id: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnqueueFailure {
    pub scanner: ScannerKind,
    pub stream: String,
    pub error: String,
}

/// Outcome of a submission. Enqueue failures are per class and are not rolled back.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchReceipt {
    pub id: JobId,
    pub enqueued: Vec<Enqueued>,
    pub failed: Vec<EnqueueFailure>,
}

/// Checks the fields a worker needs to locate the repository.
pub fn validate_event(event: &TriggerEvent) -> Result<(), &'static str> {
    if event.repo_owner.trim().is_empty() {
        return Err("repoOwner is required");
    }
    if event.repo_name.trim().is_empty() {
        return Err("repoName is required");
    }
    if event.branch.trim().is_empty() {
        return Err("branch is required");
    }
    Ok(())
}

impl Dispatcher {
    pub fn new(
        contexts: Arc<dyn ContextStore>,
        queue: Arc<dyn StreamQueue>,
        config: DispatchConfig,
    ) -> Self {
        Self { contexts, queue, config }
    }

    pub fn scanners(&self) -> &[ScannerKind] { &self.config.scanners }

    /// Stores the job context, then enqueues one message per scanner class. The context is
    /// always written before any message referencing it is published.
    pub async fn submit(&self, event: TriggerEvent, callback_url: &str) -> Result<DispatchReceipt> {
        if let Err(reason) = validate_event(&event) {
            bail!("Invalid trigger event: {reason}");
        }
        let id = JobId::new();
        let context = JobContext::from_event(id, event, callback_url);
        self.contexts
            .put(&context, self.config.context_ttl())
            .await
            .with_context(|| format!("Failed to store job context {id}"))?;
        tracing::info!(
            job_id = %id,
            "Stored job context for {} branch={} pr={}",
            context.full_name(),
            context.branch,
            context.pull_request_id
        );

        let message = QueueMessage { id, callback_url: callback_url.to_string() };
        let mut receipt = DispatchReceipt { id, enqueued: vec![], failed: vec![] };
        for &scanner in &self.config.scanners {
            let stream = self.config.stream_name(scanner);
            match self.queue.publish(&stream, &message).await {
                Ok(entry_id) => {
                    tracing::info!(job_id = %id, stream = %stream, "Enqueued {}", entry_id);
                    receipt.enqueued.push(Enqueued { scanner, stream, entry_id });
                }
                Err(e) => {
                    tracing::error!(job_id = %id, stream = %stream, "Failed to enqueue: {}", e);
                    receipt.failed.push(EnqueueFailure { scanner, stream, error: e.to_string() });
                }
            }
        }
        Ok(receipt)
    }
}
