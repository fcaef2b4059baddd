//! Generic watch-driven dispatcher
//!
//! One [`Dispatcher`] per record kind. It feeds watch events into a
//! [`WorkQueue`] and runs a fixed pool of workers that call the
//! [`Handler`]. Failed items are retried according to
//! [`Error::action`](crate::error::Error::action).

use super::queue::{EventKind, WorkItem, WorkQueue};
use crate::domain::ports::{ObjectStore, WatchEvent};
use crate::error::{ErrorAction, Result};
use crate::labels::LabelSelector;
use crate::metrics;
use async_trait::async_trait;
use futures::StreamExt;
use kube::{Resource, ResourceExt};
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

// =============================================================================
// Handler
// =============================================================================

/// Reconciles one record kind
#[async_trait]
pub trait Handler<K>: Send + Sync {
    /// Handle one change. Errors are retried or dropped per their action.
    async fn handle(&self, kind: EventKind, object: &K) -> Result<()>;
}

// =============================================================================
// Configuration
// =============================================================================

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Worker pool size
    pub workers: usize,
    /// First retry delay
    pub initial_backoff: Duration,
    /// Retry delay ceiling
    pub max_backoff: Duration,
    /// Full relist interval; zero disables it
    pub resync_period: Duration,
    /// Pause before re-establishing a broken watch
    pub rewatch_delay: Duration,
    /// How long shutdown waits for in-flight work
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            workers: 40,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(60),
            resync_period: Duration::from_secs(600),
            rewatch_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl DispatcherConfig {
    /// Exponential delay for the given attempt, capped at `max_backoff`
    pub fn retry_delay(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exp)
            .min(self.max_backoff)
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// Watches one record kind and dispatches its changes to a handler
pub struct Dispatcher<K>
where
    K: Clone + Send + Sync + 'static,
{
    name: String,
    store: Arc<dyn ObjectStore<K>>,
    selector: LabelSelector,
    handler: Arc<dyn Handler<K>>,
    config: DispatcherConfig,
    shutdown_token: CancellationToken,
}

impl<K> Dispatcher<K>
where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<dyn ObjectStore<K>>,
        handler: Arc<dyn Handler<K>>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            name: K::kind(&()).to_string(),
            store,
            selector: LabelSelector::everything(),
            handler,
            config,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Only dispatch records matching `selector`
    pub fn with_selector(mut self, selector: LabelSelector) -> Self {
        self.selector = selector;
        self
    }

    /// Token that stops [`run`](Self::run) when cancelled
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown_token.clone()
    }

    fn enqueue(&self, queue: &WorkQueue<K>, event: WatchEvent<K>) {
        let (kind, object) = match event {
            WatchEvent::Added(o) => (EventKind::Add, o),
            WatchEvent::Modified(o) => (EventKind::Update, o),
            WatchEvent::Deleted(o) => (EventKind::Delete, o),
        };
        let key = object.name_any();
        debug!(resource = %self.name, key = %key, %kind, "queueing event");
        queue.add(&key, WorkItem::new(kind, object));
    }

    async fn resync(&self, queue: &WorkQueue<K>) {
        match self.store.list(&self.selector).await {
            Ok(objects) => {
                debug!(resource = %self.name, count = objects.len(), "resync");
                for object in objects {
                    self.enqueue(queue, WatchEvent::Modified(object));
                }
            }
            Err(e) => warn!(resource = %self.name, error = %e, "resync list failed"),
        }
    }

    /// Run until the shutdown token is cancelled, then drain
    pub async fn run(self) -> Result<()> {
        let queue: Arc<WorkQueue<K>> = WorkQueue::new();
        let mut workers = JoinSet::new();
        for id in 0..self.config.workers.max(1) {
            workers.spawn(worker(
                id,
                self.name.clone(),
                Arc::clone(&queue),
                Arc::clone(&self.handler),
                self.config.clone(),
            ));
        }
        info!(resource = %self.name, workers = self.config.workers, "dispatcher started");

        let mut resync = (!self.config.resync_period.is_zero())
            .then(|| tokio::time::interval(self.config.resync_period));
        if let Some(tick) = resync.as_mut() {
            // The watch itself starts with a full listing.
            tick.tick().await;
        }

        'watch: loop {
            let mut events = self.store.watch(&self.selector);
            loop {
                tokio::select! {
                    _ = self.shutdown_token.cancelled() => break 'watch,
                    _ = async {
                        match resync.as_mut() {
                            Some(tick) => { tick.tick().await; }
                            None => std::future::pending::<()>().await,
                        }
                    } => self.resync(&queue).await,
                    next = events.next() => match next {
                        Some(Ok(event)) => self.enqueue(&queue, event),
                        Some(Err(e)) => {
                            warn!(resource = %self.name, error = %e, "watch failed, restarting");
                            break;
                        }
                        None => {
                            debug!(resource = %self.name, "watch ended, restarting");
                            break;
                        }
                    },
                }
            }

            tokio::select! {
                _ = self.shutdown_token.cancelled() => break 'watch,
                _ = tokio::time::sleep(self.config.rewatch_delay) => {}
            }
        }

        info!(resource = %self.name, pending = queue.len(), "dispatcher shutting down");
        queue.shut_down();
        let drain = async { while workers.join_next().await.is_some() {} };
        if tokio::time::timeout(self.config.shutdown_timeout, drain)
            .await
            .is_err()
        {
            warn!(
                resource = %self.name,
                timeout = ?self.config.shutdown_timeout,
                "shutdown deadline elapsed, aborting workers"
            );
            workers.abort_all();
        }
        info!(resource = %self.name, "dispatcher stopped");
        Ok(())
    }
}

async fn worker<K>(
    id: usize,
    resource: String,
    queue: Arc<WorkQueue<K>>,
    handler: Arc<dyn Handler<K>>,
    config: DispatcherConfig,
) where
    K: Resource<DynamicType = ()> + Clone + Debug + Send + Sync + 'static,
{
    while let Some((key, mut item)) = queue.next().await {
        match handler.handle(item.kind, &item.object).await {
            Ok(()) => {
                debug!(worker = id, resource = %resource, key = %key, kind = %item.kind, "handled");
                metrics::record_reconcile(&resource, "success");
            }
            Err(e) => {
                metrics::record_reconcile(&resource, "error");
                item.attempts += 1;
                match e.action() {
                    ErrorAction::RequeueWithBackoff => {
                        let delay = config.retry_delay(item.attempts);
                        warn!(
                            resource = %resource,
                            key = %key,
                            attempts = item.attempts,
                            ?delay,
                            error = %e,
                            "handler failed, retrying"
                        );
                        queue.requeue_after(key.clone(), item, delay);
                    }
                    ErrorAction::RequeueAfter(delay) => {
                        let delay = delay.min(config.max_backoff);
                        warn!(resource = %resource, key = %key, ?delay, error = %e, "handler asked to retry");
                        queue.requeue_after(key.clone(), item, delay);
                    }
                    ErrorAction::NoRequeue => {
                        error!(resource = %resource, key = %key, kind = %item.kind, error = %e, "handler failed, dropping event");
                    }
                }
            }
        }
        queue.done(&key);
    }
    debug!(worker = id, resource = %resource, "worker exiting");
}
