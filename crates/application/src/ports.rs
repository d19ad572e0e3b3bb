//! Ports consumed by the taskgate application services.

mod group_resolver;
mod queue;
mod record_store;
mod workspace;

pub use group_resolver::{GroupMembershipCache, GroupResolver};
pub use queue::{
    BOOTSTRAP_CHANNEL, JOBS_CHANNEL, PublishOptions, QueueCompletionCallback,
    QueueFailureCallback, QueueHandler, QueueHandlerFuture, QueueJob, QueueSubscription,
    QueueTransport, SubscribeOptions, WORKER_EVENTS_CHANNEL,
};
pub use record_store::{APPROVAL_KEY_PREFIX, JOB_KEY_PREFIX, RecordStore, approval_key, job_key};
pub use workspace::WorkspaceCleaner;
