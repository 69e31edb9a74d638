mod dispatcher;
mod notifier;
mod supervisor;
mod worker;

use std::{sync::Arc, time::Duration};

use scanrelay_core::config::Config;
use scanrelay_github::{Reporter, checkout::SourceFetcher};
use scanrelay_scanners::Scanner;
use scanrelay_store::{ContextStore, StreamQueue};

pub use crate::{
    dispatcher::{DispatchReceipt, Dispatcher, EnqueueFailure, Enqueued, validate_event},
    notifier::{HttpNotifier, Notifier, callback_payload},
    supervisor::{connect_with_backoff, run_supervised},
    worker::{Outcome, Worker, WorkerState},
};

/// Shared services available to the worker runtime.
#[derive(Clone)]
pub struct WorkerContext {
    pub config: Arc<Config>,
    pub contexts: Arc<dyn ContextStore>,
    pub queue: Arc<dyn StreamQueue>,
    pub scanner: Arc<dyn Scanner>,
    pub source: Arc<dyn SourceFetcher>,
    pub reporter: Arc<dyn Reporter>,
    pub notifier: Arc<dyn Notifier>,
}

/// Delay before the `attempt`th retry: doubles from one second, capped at `max`.
pub(crate) fn backoff(attempt: u32, max: Duration) -> Duration {
    Duration::from_secs(1u64 << attempt.min(16)).min(max)
}
