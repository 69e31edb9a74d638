use std::fmt;

use scanrelay_core::models::{Conclusion, JobContext, JobId, ScanResult, ScannerKind};
use scanrelay_github::{
    RepoRef,
    report::{
        CheckRunUpdate, NewCheckRun, ReportOptions, annotation_batches, build_annotations,
        build_comment, build_conclusion, callback_message,
    },
};
use scanrelay_store::{StoreError, StoreResult, StreamEntry};

use crate::{WorkerContext, callback_payload};

/// Lifecycle of a single unit of work.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum WorkerState {
    Idle,
    Claimed,
    ContextResolved,
    Scanning,
    Reporting,
    CallbackSent,
    Acked,
    Terminated,
}

impl WorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "IDLE",
            Self::Claimed => "CLAIMED",
            Self::ContextResolved => "CONTEXT_RESOLVED",
            Self::Scanning => "SCANNING",
            Self::Reporting => "REPORTING",
            Self::CallbackSent => "CALLBACK_SENT",
            Self::Acked => "ACKED",
            Self::Terminated => "TERMINATED",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

/// Result of one unit of work.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The claim timed out without a message.
    Idle,
    /// The job was scanned and reported.
    Completed { id: JobId, conclusion: Conclusion },
    /// The message could not be processed and was removed from the stream.
    Discarded { entry_id: String, reason: String },
}

/// Consumes one scanner class's stream, one message per unit of work.
pub struct Worker {
    ctx: WorkerContext,
    kind: ScannerKind,
    stream: String,
    group: String,
    consumer: String,
    options: ReportOptions,
}

impl Worker {
    pub fn new(ctx: WorkerContext) -> Self {
        let kind = ctx.scanner.kind();
        let stream = ctx.config.dispatch.stream_name(kind);
        let group = ctx.config.worker.consumer_group.clone();
        let consumer = ctx.config.worker.consumer_name.clone().unwrap_or_else(|| {
            format!("{}-{}", kind.app_name(), uuid::Uuid::now_v7().simple())
        });
        let options = ReportOptions::new(kind);
        Self { ctx, kind, stream, group, consumer, options }
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumer = consumer.into();
        self
    }

    pub fn kind(&self) -> ScannerKind { self.kind }

    pub fn stream(&self) -> &str { &self.stream }

    pub fn consumer(&self) -> &str { &self.consumer }

    /// Creates the consumer group if needed.
    pub async fn prepare(&self) -> StoreResult<()> {
        self.ctx.queue.ensure_group(&self.stream, &self.group).await
    }

    fn transition(&self, id: Option<&JobId>, state: WorkerState) {
        match id {
            Some(id) => tracing::info!(job_id = %id, scanner = %self.kind, "-> {}", state),
            None => tracing::info!(scanner = %self.kind, "-> {}", state),
        }
    }

    /// Claims at most one message and carries it to termination. Entries abandoned by a crashed
    /// consumer for longer than `reclaim_idle_secs` are taken over before new ones are read.
    /// Broker errors while claiming or resolving the context are returned for the caller to
    /// back off; the message then stays pending until it is reclaimed.
    pub async fn process_one(&self) -> StoreResult<Outcome> {
        tracing::debug!(scanner = %self.kind, "-> {}", WorkerState::Idle);
        let Some(entry) = self.next_entry().await? else {
            tracing::debug!(stream = %self.stream, "No messages");
            return Ok(Outcome::Idle);
        };
        self.transition(None, WorkerState::Claimed);
        tracing::info!(
            stream = %self.stream,
            "Received entry {} (delivery {})",
            entry.id,
            entry.deliveries
        );

        let message = match entry.decode() {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(stream = %self.stream, "Discarding unreadable entry: {}", e);
                return Ok(self.discard(entry, e.to_string()).await);
            }
        };
        let id = message.id;
        let max_deliveries = self.ctx.config.worker.max_deliveries;
        if entry.deliveries > max_deliveries {
            let reason = format!("Scan failed: gave up after {} deliveries", entry.deliveries - 1);
            tracing::error!(job_id = %id, "{}, discarding message", reason);
            self.notify_failure(&id, &message.callback_url, &reason).await;
            return Ok(self.discard(entry, reason).await);
        }
        let context = match self.ctx.contexts.get(&id).await {
            Ok(Some(context)) => context,
            Err(e) if e.is_connection() => return Err(e),
            missing => {
                let reason = match missing {
                    Err(e) => format!("Scan failed: unreadable job context: {e}"),
                    _ => format!("Scan failed: job context {id} not found"),
                };
                tracing::warn!(job_id = %id, "{}, discarding message", reason);
                self.notify_failure(&id, &message.callback_url, &reason).await;
                return Ok(self.discard(entry, reason).await);
            }
        };
        self.transition(Some(&id), WorkerState::ContextResolved);
        tracing::info!(
            job_id = %id,
            "Resolved {} branch={} pr={} sha={}",
            context.full_name(),
            context.branch,
            context.pull_request_id,
            context.commit_sha
        );

        self.transition(Some(&id), WorkerState::Scanning);
        let result = self.scan(&context).await;
        tracing::info!(
            job_id = %id,
            "Scan finished: success={} issues={}",
            result.success,
            result.total_issues
        );

        self.transition(Some(&id), WorkerState::Reporting);
        self.report(&context, &result).await;
        let conclusion = build_conclusion(&result);

        let callback_url = if context.callback_url.is_empty() {
            message.callback_url.as_str()
        } else {
            context.callback_url.as_str()
        };
        if callback_url.is_empty() {
            tracing::warn!(job_id = %id, "No callback URL, skipping callback");
        } else {
            let message = callback_message(&result, self.kind);
            let payload = callback_payload(&id, &message, &self.options.app_name);
            if let Err(e) = self.ctx.notifier.notify(callback_url, &payload).await {
                tracing::error!(job_id = %id, "Callback failed: {:#}", e);
            }
        }
        self.transition(Some(&id), WorkerState::CallbackSent);

        self.finish(&entry, Some(&id)).await;
        Ok(Outcome::Completed { id, conclusion })
    }

    async fn next_entry(&self) -> StoreResult<Option<StreamEntry>> {
        let config = &self.ctx.config.worker;
        let queue = &self.ctx.queue;
        let reclaimed = queue
            .reclaim(&self.stream, &self.group, &self.consumer, config.reclaim_idle(), 1)
            .await?;
        if let Some(entry) = reclaimed.into_iter().next() {
            return Ok(Some(entry));
        }
        let block = config.block_timeout();
        let entries = queue.claim(&self.stream, &self.group, &self.consumer, block, 1).await?;
        Ok(entries.into_iter().next())
    }

    async fn notify_failure(&self, id: &JobId, callback_url: &str, reason: &str) {
        if callback_url.is_empty() {
            return;
        }
        let payload = callback_payload(id, reason, &self.options.app_name);
        if let Err(e) = self.ctx.notifier.notify(callback_url, &payload).await {
            tracing::error!(job_id = %id, "Callback failed: {:#}", e);
        }
    }

    async fn scan(&self, context: &JobContext) -> ScanResult {
        let checkout = match self.ctx.source.fetch(context).await {
            Ok(checkout) => checkout,
            Err(e) => {
                tracing::error!(job_id = %context.id, "Checkout failed: {:#}", e);
                return ScanResult::failed(self.ctx.scanner.scope_unit(), format!("{e:#}"));
            }
        };
        self.ctx.scanner.run(checkout.path(), &context.full_name()).await
    }

    /// Posts the PR comment and the check run. Every call is attempted independently.
    async fn report(&self, context: &JobContext, result: &ScanResult) {
        let reporter = &self.ctx.reporter;
        let repo = RepoRef::new(&context.repo_owner, &context.repo_name);
        if context.pull_request_id == 0 {
            tracing::warn!(job_id = %context.id, "No pull request, skipping comment");
        } else {
            let comment = build_comment(result, &self.options);
            if let Err(e) = reporter.post_comment(&repo, context.pull_request_id, &comment).await {
                tracing::error!(job_id = %context.id, "Failed to post PR comment: {:#}", e);
            }
        }

        if context.commit_sha.is_empty() {
            tracing::warn!(job_id = %context.id, "No commit SHA, skipping check run");
            return;
        }
        let annotations = build_annotations(result, &self.options);
        let mut batches = annotation_batches(&annotations);
        let first = batches.next().map(<[_]>::to_vec).unwrap_or_default();
        let check_run = NewCheckRun::completed(&self.options, &context.commit_sha, result, first);
        let check_run_id = match reporter.create_check_run(&repo, &check_run).await {
            Ok(check_run_id) => check_run_id,
            Err(e) => {
                tracing::error!(job_id = %context.id, "Failed to create check run: {:#}", e);
                return;
            }
        };
        for (i, batch) in batches.enumerate() {
            let update = CheckRunUpdate::annotations(&self.options, batch.to_vec());
            if let Err(e) = reporter.update_check_run(&repo, check_run_id, &update).await {
                tracing::error!(
                    job_id = %context.id,
                    "Failed to add annotation batch {}: {:#}",
                    i + 2,
                    e
                );
            }
        }
    }

    async fn discard(&self, entry: StreamEntry, reason: String) -> Outcome {
        self.finish(&entry, None).await;
        Outcome::Discarded { entry_id: entry.id, reason }
    }

    /// Acknowledges and deletes the entry. Failures are logged; the entry may then be
    /// redelivered, which produces a duplicate report.
    async fn finish(&self, entry: &StreamEntry, id: Option<&JobId>) {
        let queue = &self.ctx.queue;
        match queue.ack(&self.stream, &self.group, &entry.id).await {
            Ok(()) => self.transition(id, WorkerState::Acked),
            Err(e) => log_store_error("acknowledge", &entry.id, &e),
        }
        if let Err(e) = queue.delete(&self.stream, &entry.id).await {
            log_store_error("delete", &entry.id, &e);
        }
        tracing::info!(stream = %self.stream, "Processed and removed: {}", entry.id);
        self.transition(id, WorkerState::Terminated);
    }
}

fn log_store_error(action: &str, entry_id: &str, err: &StoreError) {
    tracing::error!("Failed to {} entry {}: {}", action, entry_id, err);
}
