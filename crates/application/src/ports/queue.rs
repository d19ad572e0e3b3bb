use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use taskgate_core::{AppError, AppResult};

/// Channel carrying coding-agent job specifications to workers.
pub const JOBS_CHANNEL: &str = "taskgate:jobs";

/// Channel carrying repository bootstrap requests.
pub const BOOTSTRAP_CHANNEL: &str = "taskgate:bootstrap";

/// Channel carrying control events consumed by workers.
pub const WORKER_EVENTS_CHANNEL: &str = "taskgate:worker-events";

/// One published queue item; the handle returned by a publish call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    /// Caller-supplied or generated item id; the in-process dedup key.
    pub id: String,
    /// Item name, typically the job type.
    pub name: String,
    /// Opaque payload.
    pub payload: Value,
}

/// Options for one publish call.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Dedup id; when absent the transport generates one.
    pub job_id: Option<String>,
}

/// Boxed future returned by queue handlers.
pub type QueueHandlerFuture = Pin<Box<dyn Future<Output = AppResult<()>> + Send>>;

/// Handler invoked for each dispatched queue item.
pub type QueueHandler = Arc<dyn Fn(QueueJob) -> QueueHandlerFuture + Send + Sync>;

/// Best-effort callback invoked after a handler finishes.
pub type QueueCompletionCallback = Arc<dyn Fn(&QueueJob) + Send + Sync>;

/// Best-effort callback invoked after a handler fails.
pub type QueueFailureCallback = Arc<dyn Fn(&QueueJob, &AppError) + Send + Sync>;

/// Options for one subscribe call.
#[derive(Clone)]
pub struct SubscribeOptions {
    /// Maximum number of concurrently running handlers.
    pub concurrency: usize,
    /// Handler invoked per dispatched item.
    pub handler: QueueHandler,
    /// Invoked after each successful handler run.
    pub on_completed: Option<QueueCompletionCallback>,
    /// Invoked with the error after each failed handler run.
    pub on_failed: Option<QueueFailureCallback>,
}

impl SubscribeOptions {
    /// Creates options with the given concurrency and handler.
    #[must_use]
    pub fn new(concurrency: usize, handler: QueueHandler) -> Self {
        Self {
            concurrency,
            handler,
            on_completed: None,
            on_failed: None,
        }
    }
}

/// Handle to one active subscription.
#[async_trait]
pub trait QueueSubscription: Send + Sync {
    /// Stops the subscription: no new publishes are accepted, queued items
    /// are dropped, and the call returns once in-flight handlers finish.
    /// Calling close twice is safe.
    async fn close(&self) -> AppResult<()>;
}

/// Publish/subscribe abstraction decoupling job producers from workers.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Publishes one item onto a channel.
    async fn publish(
        &self,
        channel: &str,
        name: &str,
        payload: Value,
        options: PublishOptions,
    ) -> AppResult<QueueJob>;

    /// Attaches the single subscriber for a channel.
    async fn subscribe(
        &self,
        channel: &str,
        options: SubscribeOptions,
    ) -> AppResult<Box<dyn QueueSubscription>>;
}
