//! Application services and ports for the taskgate control plane.

#![forbid(unsafe_code)]

mod approval_store;
mod job_registry;
mod orchestration_service;
mod ports;

pub use approval_store::{ApprovalStore, ApprovalTransition};
pub use job_registry::{JobRegistry, RetentionPolicy};
pub use orchestration_service::{
    ApprovalInteractionOutcome, Authorization, AuthorizeInput, DeferredExecution,
    DeferredOperationInput, GateOutcome, OrchestrationService, PolicyConfig,
    ResolveApprovalInput, build_approval_message,
};
pub use ports::{
    APPROVAL_KEY_PREFIX, BOOTSTRAP_CHANNEL, GroupMembershipCache, GroupResolver, JOB_KEY_PREFIX,
    JOBS_CHANNEL, PublishOptions, QueueCompletionCallback, QueueFailureCallback, QueueHandler,
    QueueHandlerFuture, QueueJob, QueueSubscription, QueueTransport, RecordStore,
    SubscribeOptions, WORKER_EVENTS_CHANNEL, WorkspaceCleaner, approval_key, job_key,
};
